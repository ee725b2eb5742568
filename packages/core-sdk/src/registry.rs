use crate::error::GatewayError;
use crate::models::{ModelCatalog, ProtocolFamily, ProviderDescriptor};

/** \brief Provider id of the in-process summarizer. */
pub const LOCAL_PROVIDER: &str = "local";

const OPENAI_PREFERRED: &[&str] = &["gpt-4", "gpt-3.5", "gpt-5", "o", "mini", "omni"];

const QWEN_MODELS: &[&str] = &["qwen-plus", "qwen-turbo", "qwen2-7b-instruct"];

const GENESIS_MODELS: &[&str] = &[
    "llama-3.3-70b-instruct",
    "llama-3.1-nemotron-70b-instruct",
    "gemma-3-27b-it",
    "granite-3.3-8b-instruct",
    "auto",
];

static PROVIDERS: &[ProviderDescriptor] = &[
    ProviderDescriptor {
        id: "openai",
        label: "OpenAI",
        aliases: &[],
        credential_key: Some("openai_key"),
        credential_env: &["OPENAI_API_KEY"],
        model_selection_key: Some("openai_model"),
        default_model: "gpt-4o",
        base_url_key: Some("openai_base"),
        default_base_url: "https://api.openai.com/v1",
        extra_headers: &[],
        protocol_family: ProtocolFamily::OpenaiSse,
        model_catalog: ModelCatalog::Remote {
            preferred: OPENAI_PREFERRED,
        },
    },
    ProviderDescriptor {
        id: "openrouter",
        label: "OpenRouter",
        aliases: &[],
        credential_key: Some("openrouter_key"),
        credential_env: &["OPENROUTER_API_KEY"],
        model_selection_key: Some("openrouter_model"),
        default_model: "openrouter/auto",
        base_url_key: Some("openrouter_base"),
        default_base_url: "https://openrouter.ai/api/v1",
        extra_headers: &[("HTTP-Referer", "http://localhost"), ("X-Title", "MONKY Hub")],
        protocol_family: ProtocolFamily::OpenaiSse,
        model_catalog: ModelCatalog::Remote { preferred: &[] },
    },
    ProviderDescriptor {
        id: "qwen",
        label: "Qwen",
        aliases: &["gwen"],
        credential_key: Some("qwen_key"),
        credential_env: &["QWEN_API_KEY", "DASHSCOPE_API_KEY"],
        model_selection_key: Some("qwen_model"),
        default_model: "qwen-plus",
        base_url_key: Some("qwen_base"),
        default_base_url: "https://dashscope-intl.aliyuncs.com/compatible-mode/v1",
        extra_headers: &[],
        protocol_family: ProtocolFamily::OpenaiSse,
        model_catalog: ModelCatalog::Static {
            models: QWEN_MODELS,
            keyless_defaults: true,
        },
    },
    ProviderDescriptor {
        id: "genesis",
        label: "Genesis",
        aliases: &[],
        credential_key: Some("genesis_key"),
        credential_env: &["GENESIS_API_KEY"],
        model_selection_key: Some("genesis_model"),
        default_model: "llama-3.3-70b-instruct",
        base_url_key: Some("genesis_base"),
        default_base_url: "https://api.ai.us.lmco.com/v1",
        extra_headers: &[],
        protocol_family: ProtocolFamily::OpenaiSse,
        model_catalog: ModelCatalog::Static {
            models: GENESIS_MODELS,
            keyless_defaults: false,
        },
    },
    ProviderDescriptor {
        id: "ollama",
        label: "Ollama (local)",
        aliases: &[],
        credential_key: None,
        credential_env: &[],
        model_selection_key: Some("ollama_home_model"),
        default_model: "llama3",
        base_url_key: Some("ollama_host"),
        default_base_url: "http://localhost:11434",
        extra_headers: &[],
        protocol_family: ProtocolFamily::OllamaNdjson,
        model_catalog: ModelCatalog::OllamaTags,
    },
    ProviderDescriptor {
        id: LOCAL_PROVIDER,
        label: "MONKY local summarizer",
        aliases: &["monky"],
        credential_key: None,
        credential_env: &[],
        model_selection_key: None,
        default_model: "monky-local",
        base_url_key: None,
        default_base_url: "",
        extra_headers: &[],
        protocol_family: ProtocolFamily::Local,
        model_catalog: ModelCatalog::LocalOnly,
    },
];

/**
 * \brief Looks up a provider by id or alias, ignoring case and surrounding blanks.
 */
pub fn describe(provider_id: &str) -> Result<&'static ProviderDescriptor, GatewayError> {
    let wanted = provider_id.trim().to_ascii_lowercase();
    PROVIDERS
        .iter()
        .find(|p| p.id == wanted || p.aliases.contains(&wanted.as_str()))
        .ok_or_else(|| GatewayError::UnknownProvider(provider_id.trim().to_string()))
}

/** \brief Every registered provider, in display order. */
pub fn all() -> &'static [ProviderDescriptor] {
    PROVIDERS
}

/** \brief Descriptor of the local summarizer. */
pub fn local() -> &'static ProviderDescriptor {
    PROVIDERS
        .iter()
        .find(|p| p.protocol_family == ProtocolFamily::Local)
        .unwrap_or(&PROVIDERS[PROVIDERS.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_describe_is_case_insensitive_and_alias_aware() {
        assert_eq!(describe(" OpenAI ").expect("openai").id, "openai");
        assert_eq!(describe("gwen").expect("alias").id, "qwen");
    }

    #[test]
    fn test_describe_unknown_provider() {
        let err = describe("claude").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownProvider(ref id) if id == "claude"));
    }

    #[test]
    fn test_ids_and_aliases_are_unique() {
        let mut seen = HashSet::new();
        for p in all() {
            assert!(seen.insert(p.id), "duplicate id {}", p.id);
            for alias in p.aliases {
                assert!(seen.insert(*alias), "duplicate alias {}", alias);
            }
        }
    }

    #[test]
    fn test_local_family_never_needs_credential() {
        for p in all() {
            if p.protocol_family == ProtocolFamily::Local {
                assert!(p.credential_key.is_none(), "{} must not need a key", p.id);
            }
        }
        assert_eq!(local().id, LOCAL_PROVIDER);
    }
}

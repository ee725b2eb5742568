use serde::{Deserialize, Serialize};

/**
 * \brief Wire-protocol family spoken by a provider.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /** \brief OpenAI-compatible `/chat/completions` with `data:` frames. */
    OpenaiSse,
    /** \brief Ollama `/api/generate`, one JSON object per line. */
    OllamaNdjson,
    /** \brief In-process summarizer, no network. */
    Local,
}

/**
 * \brief How a provider answers `list_models`.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalog {
    /** \brief `GET {base}/models`; `preferred` keeps ids containing any of the fragments. */
    Remote { preferred: &'static [&'static str] },
    /** \brief `GET {host}/api/tags`. */
    OllamaTags,
    /**
     * \brief Fixed list shipped with the hub. Without a credential the list is
     * still shown when `keyless_defaults` is set, otherwise it is withheld.
     */
    Static {
        models: &'static [&'static str],
        keyless_defaults: bool,
    },
    /** \brief Only the built-in local model. */
    LocalOnly,
}

/**
 * \brief Static description of a provider.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub aliases: &'static [&'static str],
    /** \brief Config key of the credential; `None` means no credential is needed. */
    pub credential_key: Option<&'static str>,
    /** \brief Environment variables consulted when the config value is blank. */
    pub credential_env: &'static [&'static str],
    pub model_selection_key: Option<&'static str>,
    pub default_model: &'static str,
    pub base_url_key: Option<&'static str>,
    pub default_base_url: &'static str,
    pub extra_headers: &'static [(&'static str, &'static str)],
    pub protocol_family: ProtocolFamily,
    pub model_catalog: ModelCatalog,
}

/**
 * \brief A normalized chat request.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(alias = "provider")]
    pub provider_id: String,
    #[serde(default)]
    pub model: Option<String>,
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<i64>,
}

impl ChatRequest {
    pub fn new(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn in_thread(mut self, thread_id: i64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }
}

/**
 * \brief Conversation thread.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief Message author.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/**
 * \brief Persisted message row.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub thread_id: i64,
    pub role: Role,
    pub content: String,
    /** \brief Provider that produced the message (`user` turns carry the requested one). */
    pub provider: String,
    pub created_at: String,
}

/**
 * \brief Provenance category of a source annotation.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Project,
    Task,
    Note,
    Bill,
    Sensor,
    Kpi,
    Doc,
    Notice,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Project => "project",
            SourceKind::Task => "task",
            SourceKind::Note => "note",
            SourceKind::Bill => "bill",
            SourceKind::Sensor => "sensor",
            SourceKind::Kpi => "kpi",
            SourceKind::Doc => "doc",
            SourceKind::Notice => "notice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "project" => Some(SourceKind::Project),
            "task" => Some(SourceKind::Task),
            "note" => Some(SourceKind::Note),
            "bill" => Some(SourceKind::Bill),
            "sensor" => Some(SourceKind::Sensor),
            "kpi" => Some(SourceKind::Kpi),
            "doc" => Some(SourceKind::Doc),
            "notice" => Some(SourceKind::Notice),
            _ => None,
        }
    }
}

/** \brief Upper bound on `Source::detail`, in characters. */
pub const SOURCE_DETAIL_LIMIT: usize = 160;

/**
 * \brief Source annotation not yet bound to a message.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub title: String,
    pub detail: String,
}

impl Source {
    /** \brief Builds a source, clipping `detail` to [`SOURCE_DETAIL_LIMIT`] characters. */
    pub fn new(kind: SourceKind, title: impl Into<String>, detail: impl AsRef<str>) -> Self {
        Self {
            kind,
            title: title.into(),
            detail: clip(detail.as_ref(), SOURCE_DETAIL_LIMIT),
        }
    }
}

/**
 * \brief Source annotation as stored.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSource {
    pub id: i64,
    pub message_id: i64,
    pub kind: SourceKind,
    pub title: String,
    pub detail: String,
}

/**
 * \brief Result of a completed `send`.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub reply: String,
    pub sources: Vec<Source>,
    pub thread_id: i64,
    pub user_message_id: i64,
    pub message_id: i64,
    pub requested_provider: String,
    pub provider_used: String,
    pub model: String,
    /** \brief Why the requested provider was replaced, if it was. */
    pub fallback: Option<String>,
}

/**
 * \brief Readiness report for one provider.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReport {
    pub provider: String,
    pub ok: bool,
    pub status: u16,
    pub latency_ms: u64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

impl ModelInfo {
    pub fn named(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

/**
 * \brief Model listing; upstream trouble lands in `warning` instead of an error.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelListing {
    pub provider: String,
    pub models: Vec<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/**
 * \brief Truncates on a char boundary, appending an ellipsis when cut.
 */
pub fn clip(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_keeps_short_text() {
        assert_eq!(clip("  pay rent  ", 10), "pay rent");
    }

    #[test]
    fn test_clip_cuts_on_char_boundary() {
        let clipped = clip("ééééééééééé", 5);
        assert_eq!(clipped.chars().count(), 5);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn test_source_detail_is_bounded() {
        let long = "x".repeat(SOURCE_DETAIL_LIMIT * 2);
        let source = Source::new(SourceKind::Note, "n", &long);
        assert_eq!(source.detail.chars().count(), SOURCE_DETAIL_LIMIT);
    }

    #[test]
    fn test_chat_request_accepts_provider_alias() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"provider":"openai","message":"hi"}"#).expect("parse");
        assert_eq!(req.provider_id, "openai");
        assert!(req.model.is_none());
        assert!(req.thread_id.is_none());
    }

    #[test]
    fn test_role_and_kind_round_trip_names() {
        assert_eq!(Role::parse(Role::Assistant.as_str()), Some(Role::Assistant));
        assert_eq!(SourceKind::parse("notice"), Some(SourceKind::Notice));
        assert_eq!(SourceKind::parse("bogus"), None);
    }
}

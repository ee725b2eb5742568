use std::{pin::Pin, sync::Arc, time::Duration};

use async_stream::try_stream;
use futures_util::{stream, Stream, StreamExt};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Client, RequestBuilder, Response,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    config::{GatewaySection, HubConfig},
    error::ProviderFailure,
    models::{clip, ModelCatalog, ModelInfo, ModelListing, ProtocolFamily, ProviderDescriptor, Source},
    summarizer::{self, LocalReply},
    workspace::Workspace,
};

/** \brief Longest upstream error body kept in a failure. */
const ERROR_BODY_LIMIT: usize = 300;

/**
 * \brief Lazy, finite reply text. Dropping it closes the upstream connection.
 */
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderFailure>> + Send>>;

/**
 * \brief What an adapter produced: fragments plus any sources (local only).
 */
pub struct AdapterReply {
    pub fragments: FragmentStream,
    pub sources: Vec<Source>,
}

/**
 * \brief One normalized upstream call.
 */
#[derive(Debug, Clone)]
pub struct AdapterCall<'a> {
    pub model: &'a str,
    pub message: &'a str,
    pub credential: Option<&'a str>,
    pub base_url: &'a str,
    /** \brief Overrides the client-wide total timeout. */
    pub timeout: Option<Duration>,
}

/**
 * \brief Protocol adapters sharing one HTTP connection pool.
 */
#[derive(Clone)]
pub struct Adapters {
    client: Client,
    workspace: Arc<dyn Workspace>,
}

impl Adapters {
    /**
     * \brief Builds the pooled client with bounded connect and total timeouts.
     */
    pub fn new(timeouts: &GatewaySection, workspace: Arc<dyn Workspace>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect_timeout())
            .timeout(timeouts.request_timeout())
            .build()?;
        Ok(Self { client, workspace })
    }

    /**
     * \brief Dispatches `call` to the adapter of the provider's protocol family.
     * \return Pre-stream failures (non-2xx, unreachable, timeout) as `Err`;
     * mid-stream transport failures arrive as an `Err` item in the stream.
     */
    pub async fn invoke(
        &self,
        provider: &ProviderDescriptor,
        call: &AdapterCall<'_>,
    ) -> Result<AdapterReply, ProviderFailure> {
        match provider.protocol_family {
            ProtocolFamily::OpenaiSse => {
                let resp = self.open_openai(provider, call).await?;
                Ok(AdapterReply {
                    fragments: Box::pin(sse_fragments(resp)),
                    sources: Vec::new(),
                })
            }
            ProtocolFamily::OllamaNdjson => {
                let resp = self.open_ollama(call).await?;
                Ok(AdapterReply {
                    fragments: Box::pin(ndjson_fragments(resp)),
                    sources: Vec::new(),
                })
            }
            ProtocolFamily::Local => {
                let reply = self.local_reply(call.message);
                Ok(AdapterReply {
                    fragments: Box::pin(stream::iter(vec![Ok(reply.text)])),
                    sources: reply.sources,
                })
            }
        }
    }

    /**
     * \brief Summarizer answer for `message` as of today (UTC).
     */
    pub fn local_reply(&self, message: &str) -> LocalReply {
        let today = OffsetDateTime::now_utc().date();
        summarizer::summarize(message, self.workspace.as_ref(), today)
    }

    async fn open_openai(
        &self,
        provider: &ProviderDescriptor,
        call: &AdapterCall<'_>,
    ) -> Result<Response, ProviderFailure> {
        let url = format!("{}/chat/completions", call.base_url.trim_end_matches('/'));
        let body = json!({
            "model": call.model,
            "messages": [{"role": "user", "content": call.message}],
            "stream": true
        });
        let mut req = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        req = with_auth(req, provider, call.credential);
        open(req, call.timeout).await
    }

    async fn open_ollama(&self, call: &AdapterCall<'_>) -> Result<Response, ProviderFailure> {
        let url = format!("{}/api/generate", call.base_url.trim_end_matches('/'));
        let body = json!({
            "model": call.model,
            "prompt": call.message,
            "stream": true
        });
        open(self.client.post(url).json(&body), call.timeout).await
    }

    /**
     * \brief Provider-specific model listing; upstream problems become a warning.
     */
    pub async fn list_models(&self, provider: &ProviderDescriptor, config: &HubConfig) -> ModelListing {
        let mut listing = ModelListing {
            provider: provider.id.to_string(),
            ..Default::default()
        };
        let credential = config.credential(provider);
        match provider.model_catalog {
            ModelCatalog::LocalOnly => {
                listing.models = vec![ModelInfo::named(provider.default_model)];
            }
            ModelCatalog::Static {
                models,
                keyless_defaults,
            } => match credential {
                Ok(_) => listing.models = models.iter().map(|id| ModelInfo::named(*id)).collect(),
                Err(key) if keyless_defaults => {
                    listing.models = models.iter().map(|id| ModelInfo::named(*id)).collect();
                    listing.warning = Some(format!("{} missing (defaults shown)", key));
                }
                Err(key) => listing.warning = Some(format!("{} missing", key)),
            },
            ModelCatalog::Remote { preferred } => {
                let secret = match credential {
                    Ok(secret) => secret,
                    Err(key) => {
                        listing.warning = Some(format!("{} missing", key));
                        return listing;
                    }
                };
                let url = format!("{}/models", config.base_url_for(provider));
                let req = with_auth(self.client.get(url), provider, secret.as_deref());
                match fetch_json(req).await {
                    Ok(v) => match parse_model_list(&v) {
                        Some(models) => listing.models = prefer(models, preferred),
                        None => listing.warning = Some(format!("unexpected models payload: {}", clip(&v.to_string(), 120))),
                    },
                    Err(failure) => listing.warning = Some(failure.to_string()),
                }
            }
            ModelCatalog::OllamaTags => {
                let url = format!("{}/api/tags", config.base_url_for(provider));
                match fetch_json(self.client.get(url)).await {
                    Ok(v) => listing.models = parse_ollama_tags(&v),
                    Err(failure) => {
                        listing.warning = Some(format!("{} not reachable: {}", provider.label, failure))
                    }
                }
            }
        }
        listing
    }
}

fn with_auth(req: RequestBuilder, provider: &ProviderDescriptor, credential: Option<&str>) -> RequestBuilder {
    let mut req = req;
    if let Some(secret) = credential {
        req = req.header(AUTHORIZATION, format!("Bearer {}", secret));
    }
    for (name, value) in provider.extra_headers {
        req = req.header(*name, *value);
    }
    req
}

async fn open(req: RequestBuilder, timeout: Option<Duration>) -> Result<Response, ProviderFailure> {
    let req = match timeout {
        Some(t) => req.timeout(t),
        None => req,
    };
    let resp = req.send().await?;
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderFailure::Http {
            status,
            body: clip(&text, ERROR_BODY_LIMIT),
        });
    }
    Ok(resp)
}

async fn fetch_json(req: RequestBuilder) -> Result<Value, ProviderFailure> {
    let resp = open(req, None).await?;
    resp.json::<Value>()
        .await
        .map_err(|e| ProviderFailure::Transport(format!("invalid json: {}", e)))
}

/**
 * \brief Splits a byte stream into `\n`-terminated lines.
 */
#[derive(Debug, Default)]
struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).trim_end_matches('\r').to_string())
        }
    }
}

/**
 * \brief Classification of one SSE body line.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

/**
 * \brief Parses one `data: <json>` line of an OpenAI-style stream.
 */
pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim_start().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        debug!(frame = %clip(data, 80), "skipping malformed SSE frame");
        return SseLine::Skip;
    };
    match extract_openai_content(&v) {
        Some(text) => SseLine::Fragment(text),
        None => SseLine::Skip,
    }
}

fn extract_openai_content(v: &Value) -> Option<String> {
    let choice = v.get("choices")?.get(0)?;
    choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
        })
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/**
 * \brief Decoded Ollama line: optional fragment and the `done` flag.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NdjsonLine {
    pub fragment: Option<String>,
    pub done: bool,
}

pub fn parse_ndjson_line(line: &str) -> NdjsonLine {
    let line = line.trim();
    if line.is_empty() {
        return NdjsonLine::default();
    }
    let Ok(v) = serde_json::from_str::<Value>(line) else {
        debug!(frame = %clip(line, 80), "skipping malformed NDJSON line");
        return NdjsonLine::default();
    };
    NdjsonLine {
        fragment: v
            .get("response")
            .and_then(|r| r.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        done: v.get("done").and_then(|d| d.as_bool()).unwrap_or(false),
    }
}

fn sse_fragments(resp: Response) -> impl Stream<Item = Result<String, ProviderFailure>> + Send {
    try_stream! {
        let mut body = resp.bytes_stream();
        let mut lines = LineSplitter::default();
        let mut finished = false;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(ProviderFailure::from)?;
            for line in lines.push(&chunk) {
                match parse_sse_line(&line) {
                    SseLine::Fragment(text) => yield text,
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }
            if finished {
                break;
            }
        }
        if !finished {
            if let Some(line) = lines.finish() {
                if let SseLine::Fragment(text) = parse_sse_line(&line) {
                    yield text;
                }
            }
        }
    }
}

fn ndjson_fragments(resp: Response) -> impl Stream<Item = Result<String, ProviderFailure>> + Send {
    try_stream! {
        let mut body = resp.bytes_stream();
        let mut lines = LineSplitter::default();
        let mut finished = false;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(ProviderFailure::from)?;
            for line in lines.push(&chunk) {
                let parsed = parse_ndjson_line(&line);
                if let Some(text) = parsed.fragment {
                    yield text;
                }
                if parsed.done {
                    finished = true;
                    break;
                }
            }
            if finished {
                break;
            }
        }
        if !finished {
            if let Some(text) = lines.finish().and_then(|l| parse_ndjson_line(&l).fragment) {
                yield text;
            }
        }
    }
}

fn parse_model_list(v: &Value) -> Option<Vec<ModelInfo>> {
    let items = v.get("data").and_then(|x| x.as_array()).or_else(|| v.as_array())?;
    Some(
        items
            .iter()
            .filter_map(|item| {
                let id = item
                    .get("id")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.as_str())?;
                let name = item.get("name").and_then(|s| s.as_str()).unwrap_or(id);
                Some(ModelInfo {
                    id: id.to_string(),
                    name: name.to_string(),
                })
            })
            .collect(),
    )
}

fn parse_ollama_tags(v: &Value) -> Vec<ModelInfo> {
    v.get("models")
        .and_then(|m| m.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(ModelInfo::named)
                .collect()
        })
        .unwrap_or_else(|| {
            warn!("ollama tags payload without models array");
            Vec::new()
        })
}

/** \brief Keeps ids containing a preferred fragment, unless that leaves nothing. */
fn prefer(models: Vec<ModelInfo>, preferred: &[&str]) -> Vec<ModelInfo> {
    if preferred.is_empty() {
        return models;
    }
    let kept: Vec<ModelInfo> = models
        .iter()
        .filter(|m| preferred.iter().any(|p| m.id.contains(p)))
        .cloned()
        .collect();
    if kept.is_empty() {
        models
    } else {
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::describe;
    use crate::workspace::MemoryWorkspace;

    fn adapters() -> Adapters {
        Adapters::new(&GatewaySection::default(), Arc::new(MemoryWorkspace::default()))
            .expect("client")
    }

    fn call<'a>(base_url: &'a str, credential: Option<&'a str>) -> AdapterCall<'a> {
        AdapterCall {
            model: "m",
            message: "hello",
            credential,
            base_url,
            timeout: None,
        }
    }

    async fn collect(reply: AdapterReply) -> Vec<Result<String, ProviderFailure>> {
        reply.fragments.collect().await
    }

    #[test]
    fn test_parse_sse_line_variants() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Fragment("Hi".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"message":{"content":"Whole"}}]}"#),
            SseLine::Fragment("Whole".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line("event: ping"), SseLine::Skip);
        assert_eq!(parse_sse_line("data: {not json"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[test]
    fn test_parse_ndjson_line_variants() {
        assert_eq!(
            parse_ndjson_line(r#"{"response":"a","done":false}"#),
            NdjsonLine {
                fragment: Some("a".to_string()),
                done: false
            }
        );
        assert!(parse_ndjson_line(r#"{"done":true}"#).done);
        assert_eq!(parse_ndjson_line("garbage"), NdjsonLine::default());
    }

    #[test]
    fn test_line_splitter_handles_split_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"data: {\"a\"").is_empty());
        assert_eq!(splitter.push(b":1}\r\n\ndata: x"), vec!["data: {\"a\":1}", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("data: x"));
    }

    #[test]
    fn test_prefer_falls_back_to_everything() {
        let models = vec![ModelInfo::named("gpt-4o"), ModelInfo::named("whisper-1")];
        assert_eq!(prefer(models.clone(), &["gpt-4"]), vec![ModelInfo::named("gpt-4o")]);
        assert_eq!(prefer(models.clone(), &["claude"]), models);
    }

    #[tokio::test]
    async fn test_sse_adapter_concatenates_deltas_and_stops_at_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            ": comment\n",
            "data: {broken\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"IGNORED\"}}]}\n\n",
        );
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = describe("openai").expect("openai");
        let base = server.url();
        let reply = adapters()
            .invoke(provider, &call(&base, Some("sk-test")))
            .await
            .expect("stream opens");
        let items = collect(reply).await;
        let text: String = items.into_iter().map(|i| i.expect("fragment")).collect();
        assert_eq!(text, "Hello");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sse_adapter_reports_http_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":"invalid api key"}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = describe("openai").expect("openai");
        let base = server.url();
        let failure = match adapters().invoke(provider, &call(&base, Some("bad"))).await {
            Err(f) => f,
            Ok(_) => panic!("expected failure"),
        };
        assert_eq!(
            failure,
            ProviderFailure::Http {
                status: 401,
                body: r#"{"error":"invalid api key"}"#.to_string()
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_openrouter_sends_extra_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("x-title", "MONKY Hub")
            .match_header("http-referer", "http://localhost")
            .with_status(200)
            .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\ndata: [DONE]\n")
            .create_async()
            .await;

        let provider = describe("openrouter").expect("openrouter");
        let base = server.url();
        let reply = adapters()
            .invoke(provider, &call(&base, Some("k")))
            .await
            .expect("stream opens");
        assert_eq!(collect(reply).await, vec![Ok("ok".to_string())]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ndjson_adapter_stops_at_done_flag() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "{\"response\":\"Hi \",\"done\":false}\n",
            "\n",
            "not json\n",
            "{\"response\":\"there\",\"done\":true}\n",
            "{\"response\":\" AFTER\",\"done\":false}\n",
        );
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"model":"m","prompt":"hello","stream":true}"#.to_string(),
            ))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let provider = describe("ollama").expect("ollama");
        let base = server.url();
        let reply = adapters()
            .invoke(provider, &call(&base, None))
            .await
            .expect("stream opens");
        let text: String = collect(reply)
            .await
            .into_iter()
            .map(|i| i.expect("fragment"))
            .collect();
        assert_eq!(text, "Hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ndjson_adapter_unreachable_host_is_transport_failure() {
        let provider = describe("ollama").expect("ollama");
        let result = adapters()
            .invoke(provider, &call("http://127.0.0.1:9", None))
            .await;
        match result {
            Err(ProviderFailure::Transport(_)) | Err(ProviderFailure::Timeout) => {}
            Err(other) => panic!("unexpected failure {other:?}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_local_adapter_yields_one_fragment() {
        let provider = describe("local").expect("local");
        let reply = adapters()
            .invoke(provider, &call("", None))
            .await
            .expect("local never fails");
        assert!(reply.sources.is_empty());
        assert_eq!(
            collect(reply).await,
            vec![Ok(summarizer::STANDING_BY.to_string())]
        );
    }

    #[tokio::test]
    async fn test_list_models_filters_openai_and_reads_ollama_tags() {
        let mut server = mockito::Server::new_async().await;
        let models = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"gpt-4o"},{"id":"dall-e-3"},{"id":"text-embedding-3"}]}"#)
            .create_async()
            .await;
        let tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3"},{"name":"mistral"}]}"#)
            .create_async()
            .await;

        let mut config = HubConfig::default();
        config
            .set("openai_key", "sk")
            .set("openai_base", server.url())
            .set("ollama_host", server.url());
        let ad = adapters();

        let openai = ad.list_models(describe("openai").expect("openai"), &config).await;
        assert_eq!(openai.models, vec![ModelInfo::named("gpt-4o")]);
        assert!(openai.warning.is_none());

        let ollama = ad.list_models(describe("ollama").expect("ollama"), &config).await;
        assert_eq!(ollama.models.len(), 2);

        models.assert_async().await;
        tags.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_models_without_credential_warns() {
        let config = HubConfig::default();
        let ad = adapters();
        let openai = ad.list_models(describe("openai").expect("openai"), &config).await;
        assert!(openai.models.is_empty());
        assert_eq!(openai.warning.as_deref(), Some("openai_key missing"));

        let qwen = ad.list_models(describe("qwen").expect("qwen"), &config).await;
        assert_eq!(qwen.models.len(), 3);
        assert_eq!(qwen.warning.as_deref(), Some("qwen_key missing (defaults shown)"));

        let genesis = ad.list_models(describe("genesis").expect("genesis"), &config).await;
        assert!(genesis.models.is_empty());
        assert_eq!(genesis.warning.as_deref(), Some("genesis_key missing"));

        let local = ad.list_models(describe("local").expect("local"), &config).await;
        assert_eq!(local.models, vec![ModelInfo::named("monky-local")]);
    }

    #[tokio::test]
    async fn test_static_catalog_with_credential_lists_all_models() {
        let mut config = HubConfig::default();
        config.set("genesis_key", "gk");
        let genesis = adapters()
            .list_models(describe("genesis").expect("genesis"), &config)
            .await;
        assert_eq!(genesis.models.len(), 5);
        assert!(genesis.warning.is_none());
    }
}

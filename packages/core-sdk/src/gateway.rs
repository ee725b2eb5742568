//! Chat orchestration: thread resolution, persistence, provider invocation and
//! the single local substitution when a provider cannot answer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use futures_util::{future::join_all, StreamExt};
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    config::HubConfig,
    db::ThreadStore,
    error::{GatewayError, ProviderFailure, Result},
    llm::{AdapterCall, Adapters},
    models::{
        clip, ChatRequest, ModelListing, PingReport, ProviderDescriptor, Role, SendOutcome, Source,
        SourceKind, StoredMessage, Thread,
    },
    registry::{self, LOCAL_PROVIDER},
    workspace::Workspace,
};

/** \brief Message sent by readiness probes. */
pub const PING_PROBE: &str = "ping";

/**
 * \brief Receives a turn's reply while it is produced.
 * \details Returning `false` means the receiver went away; the turn is then
 * abandoned and rolled back.
 */
pub trait FragmentSink: Send + Sync {
    fn fragment(&self, text: &str) -> bool;

    /** \brief Discard everything forwarded so far; a substitute reply follows. */
    fn reset(&self) -> bool;
}

/** \brief Sink for callers that only want the final outcome. */
pub struct NullSink;

impl FragmentSink for NullSink {
    fn fragment(&self, _text: &str) -> bool {
        true
    }

    fn reset(&self) -> bool {
        true
    }
}

/** \brief A message together with the sources attached to it. */
#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: StoredMessage,
    pub sources: Vec<Source>,
}

/** \brief A thread and its messages; `thread` is `None` only for an empty store. */
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Transcript {
    pub thread: Option<Thread>,
    pub messages: Vec<MessageView>,
}

/**
 * \brief Entry point for every conversational operation.
 * \details Cheap to clone; all state is shared. Built once at startup from an
 * explicit config, store and workspace.
 */
#[derive(Clone)]
pub struct Gateway {
    config: Arc<HubConfig>,
    store: Arc<ThreadStore>,
    adapters: Adapters,
    thread_locks: Arc<Mutex<HashMap<i64, Arc<TurnLock<()>>>>>,
}

impl Gateway {
    /**
     * \brief Wires the gateway. Leaves the store untouched.
     */
    pub fn new(
        config: HubConfig,
        store: ThreadStore,
        workspace: Arc<dyn Workspace>,
    ) -> anyhow::Result<Self> {
        let adapters = Adapters::new(&config.gateway, workspace)?;
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            adapters,
            thread_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /**
     * \brief Answers user turns a previous run left hanging.
     * \details Call once from the long-running server before it accepts
     * requests, never while another process may have a turn in flight.
     */
    pub fn recover(&self) -> Result<usize> {
        Ok(self.store.heal_dangling_turns(LOCAL_PROVIDER)?)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    /**
     * \brief Runs one turn to completion without streaming.
     */
    pub async fn send(&self, request: ChatRequest) -> Result<SendOutcome> {
        self.begin(request).await?.run(&NullSink).await
    }

    /**
     * \brief Validates the request and records the user message.
     * \details The returned [`Turn`] holds the thread's turn lock until it is
     * run or dropped; dropping it unrun removes the user message again.
     */
    pub async fn begin(&self, request: ChatRequest) -> Result<Turn> {
        if request.message.trim().is_empty() {
            return Err(GatewayError::EmptyMessage);
        }
        let provider = registry::describe(&request.provider_id)?;
        let thread = self.store.resolve_or_create_thread(request.thread_id)?;
        let guard = self.lock_thread(thread.id).await;
        let user_message_id =
            self.store
                .append_message(thread.id, Role::User, &request.message, provider.id)?;
        debug!(thread_id = thread.id, provider = provider.id, "user turn recorded");
        Ok(Turn {
            gateway: self.clone(),
            provider,
            request,
            thread,
            user_message_id,
            settled: false,
            _guard: guard,
        })
    }

    async fn lock_thread(&self, thread_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .thread_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(thread_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /**
     * \brief Sends a fixed probe through the provider's adapter.
     */
    pub async fn ping_provider(&self, provider_id: &str) -> Result<PingReport> {
        let provider = registry::describe(provider_id)?;
        let started = Instant::now();
        let result = self.probe(provider).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let report = match result {
            Ok(text) => PingReport {
                provider: provider.id.to_string(),
                ok: true,
                status: 200,
                latency_ms,
                detail: clip(&text, 120),
            },
            Err(failure) => PingReport {
                provider: provider.id.to_string(),
                ok: false,
                status: failure.status(),
                latency_ms,
                detail: failure.to_string(),
            },
        };
        info!(
            provider = provider.id,
            ok = report.ok,
            status = report.status,
            latency_ms,
            "provider ping"
        );
        Ok(report)
    }

    async fn probe(&self, provider: &ProviderDescriptor) -> std::result::Result<String, ProviderFailure> {
        let credential = self
            .config
            .credential(provider)
            .map_err(ProviderFailure::MissingCredential)?;
        let model = self.config.model_for(provider, None);
        let base_url = self.config.base_url_for(provider);
        let call = AdapterCall {
            model: &model,
            message: PING_PROBE,
            credential: credential.as_deref(),
            base_url: &base_url,
            timeout: Some(self.config.gateway.ping_timeout()),
        };
        let reply = self.adapters.invoke(provider, &call).await?;
        let mut fragments = reply.fragments;
        let mut text = String::new();
        while let Some(piece) = fragments.next().await {
            text.push_str(&piece?);
        }
        if text.trim().is_empty() {
            return Err(ProviderFailure::EmptyReply);
        }
        Ok(text)
    }

    /** \brief Pings every registered provider concurrently, in registry order. */
    pub async fn ping_all(&self) -> Vec<PingReport> {
        let pings = registry::all().iter().map(|p| self.ping_provider(p.id));
        join_all(pings)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    pub async fn list_models(&self, provider_id: &str) -> Result<ModelListing> {
        let provider = registry::describe(provider_id)?;
        let listing = self.adapters.list_models(provider, &self.config).await;
        if let Some(warning) = &listing.warning {
            warn!(provider = provider.id, %warning, "model listing degraded");
        }
        Ok(listing)
    }

    pub fn list_providers(&self) -> &'static [ProviderDescriptor] {
        registry::all()
    }

    pub fn list_threads(&self) -> Result<Vec<Thread>> {
        Ok(self.store.list_threads()?)
    }

    pub fn create_thread(&self, title: Option<&str>) -> Result<Thread> {
        Ok(self.store.create_thread(title)?)
    }

    pub fn rename_thread(&self, id: i64, title: &str) -> Result<Thread> {
        self.store.rename_thread(id, title)
    }

    pub fn delete_thread(&self, id: i64) -> Result<()> {
        self.store.delete_thread(id)?;
        if let Ok(mut locks) = self.thread_locks.lock() {
            locks.remove(&id);
        }
        Ok(())
    }

    /**
     * \brief Messages of `thread_id`, or of the most recently updated thread.
     * \details Read-only: an empty store yields an empty transcript.
     */
    pub fn list_messages(&self, thread_id: Option<i64>) -> Result<Transcript> {
        let thread = match thread_id {
            Some(id) => self
                .store
                .get_thread(id)?
                .ok_or(GatewayError::ThreadNotFound(id))?,
            None => match self.store.latest_thread()? {
                Some(thread) => thread,
                None => return Ok(Transcript::default()),
            },
        };
        let mut views = Vec::new();
        for message in self.store.list_messages(thread.id)? {
            let sources = self
                .store
                .list_sources(message.id)?
                .into_iter()
                .map(|s| Source {
                    kind: s.kind,
                    title: s.title,
                    detail: s.detail,
                })
                .collect();
            views.push(MessageView { message, sources });
        }
        Ok(Transcript {
            thread: Some(thread),
            messages: views,
        })
    }
}

enum Attempt {
    Answered { text: String, sources: Vec<Source> },
    Failed(ProviderFailure),
}

/**
 * \brief A user turn that has been recorded but not yet answered.
 */
pub struct Turn {
    gateway: Gateway,
    provider: &'static ProviderDescriptor,
    request: ChatRequest,
    thread: Thread,
    user_message_id: i64,
    settled: bool,
    _guard: OwnedMutexGuard<()>,
}

impl Turn {
    pub fn thread_id(&self) -> i64 {
        self.thread.id
    }

    pub fn user_message_id(&self) -> i64 {
        self.user_message_id
    }

    pub fn provider(&self) -> &'static ProviderDescriptor {
        self.provider
    }

    /**
     * \brief Produces, forwards and persists the assistant reply.
     * \return `Cancelled` when the sink refused a fragment; the user message
     * is removed and nothing is persisted in that case.
     */
    pub async fn run(mut self, sink: &dyn FragmentSink) -> Result<SendOutcome> {
        let config = Arc::clone(&self.gateway.config);
        let model = config.model_for(self.provider, self.request.model.as_deref());
        info!(
            thread_id = self.thread.id,
            provider = self.provider.id,
            model = %model,
            "turn started"
        );

        let (reply, sources, provider_used, fallback) = match self.attempt(&model, sink).await? {
            Attempt::Answered { text, sources } => (text, sources, self.provider.id, None),
            Attempt::Failed(failure) => {
                warn!(
                    thread_id = self.thread.id,
                    provider = self.provider.id,
                    error = %failure,
                    "provider unavailable, answering locally"
                );
                let local = self.gateway.adapters.local_reply(&self.request.message);
                let detail = failure.to_string();
                let text = format!("[{} unavailable] {}\n\n{}", self.provider.id, detail, local.text);
                if !sink.fragment(&text) {
                    return Err(GatewayError::Cancelled);
                }
                let mut sources = Vec::with_capacity(local.sources.len() + 1);
                sources.push(Source::new(
                    SourceKind::Notice,
                    format!("{} unavailable", self.provider.id),
                    &detail,
                ));
                sources.extend(local.sources);
                (text, sources, LOCAL_PROVIDER, Some(detail))
            }
        };

        let message_id = self
            .gateway
            .store
            .append_reply(self.thread.id, &reply, provider_used, &sources)?;
        self.settled = true;
        info!(
            thread_id = self.thread.id,
            message_id,
            provider_used,
            "turn completed"
        );

        Ok(SendOutcome {
            reply,
            sources,
            thread_id: self.thread.id,
            user_message_id: self.user_message_id,
            message_id,
            requested_provider: self.provider.id.to_string(),
            provider_used: provider_used.to_string(),
            model: if fallback.is_some() {
                registry::local().default_model.to_string()
            } else {
                model
            },
            fallback,
        })
    }

    async fn attempt(&self, model: &str, sink: &dyn FragmentSink) -> Result<Attempt> {
        let config = &self.gateway.config;
        let credential = match config.credential(self.provider) {
            Ok(credential) => credential,
            Err(key) => return Ok(Attempt::Failed(ProviderFailure::MissingCredential(key))),
        };
        let base_url = config.base_url_for(self.provider);
        let call = AdapterCall {
            model,
            message: &self.request.message,
            credential: credential.as_deref(),
            base_url: &base_url,
            timeout: None,
        };
        let reply = match self.gateway.adapters.invoke(self.provider, &call).await {
            Ok(reply) => reply,
            Err(failure) => return Ok(Attempt::Failed(failure)),
        };

        let mut fragments = reply.fragments;
        let mut text = String::new();
        while let Some(item) = fragments.next().await {
            match item {
                Ok(piece) if piece.is_empty() => continue,
                Ok(piece) => {
                    text.push_str(&piece);
                    if !sink.fragment(&piece) {
                        debug!(thread_id = self.thread.id, "receiver gone, closing upstream");
                        return Err(GatewayError::Cancelled);
                    }
                }
                Err(failure) => {
                    if !text.is_empty() && !sink.reset() {
                        return Err(GatewayError::Cancelled);
                    }
                    return Ok(Attempt::Failed(failure));
                }
            }
        }
        if text.trim().is_empty() {
            if !text.is_empty() && !sink.reset() {
                return Err(GatewayError::Cancelled);
            }
            return Ok(Attempt::Failed(ProviderFailure::EmptyReply));
        }
        Ok(Attempt::Answered {
            text,
            sources: reply.sources,
        })
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.gateway.store.discard_message(self.user_message_id) {
            Ok(()) => info!(
                thread_id = self.thread.id,
                message_id = self.user_message_id,
                "abandoned turn rolled back"
            ),
            Err(err) => warn!(
                thread_id = self.thread.id,
                message_id = self.user_message_id,
                error = %err,
                "could not roll back abandoned turn"
            ),
        }
    }
}

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod registry;
pub mod server;
pub mod summarizer;
pub mod telemetry;
pub mod workspace;

/**
 * \brief Common imports for embedding the gateway.
 */
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::db::ThreadStore;
    pub use crate::error::{GatewayError, ProviderFailure};
    pub use crate::gateway::{FragmentSink, Gateway, NullSink};
    pub use crate::models::{ChatRequest, SendOutcome, Source, SourceKind};
    pub use crate::workspace::{MemoryWorkspace, SqliteWorkspace, Workspace};
}

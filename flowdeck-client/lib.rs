pub mod config;
pub mod error;
pub mod execution;
pub mod state;
pub mod stream;
pub mod views;
pub mod workbench;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, SessionConfig};
pub use error::ClientError;
pub use execution::{ExecutionBackend, ExecutionResponse, HttpExecutionClient};
pub use state::{NodeHandle, NodeState, NodeStateStore, Phase};
pub use stream::{StreamTransport, TaskStreamSession, WsTransport};
pub use views::{NodeView, ViewMode};
pub use workbench::{FlowStep, Workbench};

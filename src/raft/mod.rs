//! openraft adapter: log storage, the command-applying state machine, HTTP
//! transport and the facade the API layer proposes through.

pub mod app;
pub mod http_rpc;
pub mod membership;
pub mod network_http;
pub mod runtime;
pub mod storage;
pub mod types;

pub use types::{CommandResponse, NodeId, NodeMeta, TypeConfig};

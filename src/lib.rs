pub mod command;
pub mod config;
pub mod domain;
pub mod http;
pub mod node_identity;
pub mod raft;
pub mod state;

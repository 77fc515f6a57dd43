//! JSON-file persistence behind openraft's storage v2 traits.
//!
//! `FileLogStore` implements `RaftLogStorage`; `FileStateMachine` implements
//! `RaftStateMachine` by applying command envelopes to the cluster configuration.

pub mod file;

pub use file::{ApplyState, FileLogStore, FileStateMachine, StorePaths};

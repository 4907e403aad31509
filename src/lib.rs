///
/// The consumed wire contract: node operations, watch events, session
/// lifecycle.
///
pub mod client;

///
/// Established session handle and its notification drain.
///
pub mod session;

///
/// Bounded pool of coordination-service sessions.
///
pub mod pool;

///
/// Watch/event subscription registry and ordered delivery.
///
pub mod watcher;

///
/// Distributed exclusive and shared locks over ephemeral-sequential nodes.
///
pub mod lock;

///
/// Leader election built on the same ephemeral-sequential pattern.
///
pub mod election;

///
/// Utility functions to manage various transient errors.
pub mod retry;

///
/// Utilities for inter-task communication.
///
pub mod sync;

///
/// In-process coordination service backend for tests and local runs.
///
pub mod memory;

///
/// Alias for a coordination-service session identifier.
pub type SessionId = i64;

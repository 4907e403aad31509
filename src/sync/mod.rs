///
/// Single-slot bridge carrying one terminal result per cycle from a
/// callback to a suspended waiter.
///
pub mod bridge;

pub use bridge::SyncBridge;

//! Session transport: one logical connection to the simulation backend.
//!
//! - [`backoff`]: retry pacing and attempt cap
//! - [`state`]: connection state machine and lifecycle events
//! - [`socket`]: socket abstraction and the WebSocket connector
//! - [`memory`]: in-process connector for tests and offline runs
//! - [`session`]: the session task and its handle

pub mod backoff;
pub mod memory;
pub mod session;
pub mod socket;
pub mod state;

pub use backoff::{Backoff, BackoffPolicy};
pub use memory::{MemoryConnector, MemoryPeer};
pub use session::{spawn, spawn_with_rng, SessionHandle, SessionOptions, DISCONNECT_MESSAGE};
pub use socket::{Connector, Socket, WebSocketConnector};
pub use state::{ConnectionState, LifecycleEvent, Target};

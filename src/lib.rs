//! OrbitCast Presence - stream presence tracking with ActionCable protocol
//!
//! Tracks which members are present in which streams, delays leaves by a
//! grace period so reconnecting clients do not flap, and broadcasts `join`
//! and `leave` events to every subscriber of a stream.
//!
//! ## Architecture
//!
//! ```text
//! Client (Unix socket) → Server → PresenceRegistry → EventPublisher → PubSub (Hub) → Clients
//!                                       ↓
//!                                ExpiryScheduler
//! ```
//!
//! ## Environment Variables
//!
//! - `ORBITCAST_SOCKET` - Unix socket path
//! - `ORBITCAST_PRESENCE` - Enable presence (default: true)
//! - `ORBITCAST_PRESENCE_GRACE_MS` - Default leave grace period
//! - `ORBITCAST_PRESENCE_STREAM_GRACE` - Per-stream grace periods (`prefix=ms,...`)
//! - `ORBITCAST_PRESENCE_QUEUE` - Event queue capacity
//! - `ORBITCAST_PRESENCE_NOTIFY_TIMEOUT_MS` - Bound on one broadcast call

pub mod actioncable;
pub mod config;
pub mod hub;
pub mod presence;
pub mod pubsub;
pub mod server;
pub mod session;
pub mod streams;

#[cfg(test)]
mod testing;

pub use actioncable::{ClientCommand, ServerMessage};
pub use config::{Config, PresenceConfig};
pub use hub::Hub;
pub use presence::{
    EventPublisher, ExpiryScheduler, JoinOutcome, Member, PresenceError, PresenceEvent,
    PresenceInfo, PresenceRegistry,
};
pub use pubsub::PubSub;
pub use server::Server;
pub use session::{Session, SessionHooks, SessionPresence};

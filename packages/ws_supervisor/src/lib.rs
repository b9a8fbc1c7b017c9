//! # WebSocket Supervisor
//!
//! Owns one long-lived duplex connection on behalf of a client: opens it on
//! request, keeps it alive with a periodic ping, reconnects after it drops,
//! and stays down after an explicit disconnect.
//!
//! Inbound frames are parsed as JSON into any `DeserializeOwned` event type
//! and handed out on a channel. Frames that do not parse are logged and
//! dropped; they never affect connection state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ws_supervisor::{FixedDelay, Supervisor, SupervisorConfig, WsTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SupervisorConfig::new("ws://localhost:8080/ws/chat", "session_1");
//! let (supervisor, mut events) =
//!     Supervisor::spawn::<serde_json::Value, _, _>(config, WsTransport, FixedDelay::default())?;
//!
//! supervisor.connect()?;
//! while let Some(event) = events.recv().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod policy;
pub mod supervisor;
pub mod transport;

pub use error::{SupervisorError, TransportError};
pub use policy::{DEFAULT_RECONNECT_DELAY, ExponentialBackoff, FixedDelay, ReconnectPolicy};
pub use supervisor::{
    ConnectionStatus, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_PAYLOAD, Supervisor,
    SupervisorConfig,
};
pub use transport::{Connection, Frame, FrameSink, FrameStream, Transport, WsTransport};

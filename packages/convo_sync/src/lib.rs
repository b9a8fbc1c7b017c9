//! # Conversation Sync
//!
//! Keeps one live, ordered, duplicate-free view of a chat conversation whose
//! content arrives from three overlapping sources:
//!
//! - provisional user messages inserted locally before the server echoes them
//! - streaming assistant updates carrying cumulative content
//! - history snapshots that can arrive at any point relative to the above
//!
//! The crate knows nothing about transport. Feed it parsed [`InboundEvent`]s
//! and local inserts; read back the list.
//!
//! ## Quick Start
//!
//! ```rust
//! use convo_sync::{InboundEvent, Reconciler};
//!
//! let mut convo = Reconciler::new();
//!
//! // The user hits enter: show the message right away.
//! convo.optimistic_insert("temp_1", "hi", "session_1", "demo_user");
//!
//! // The server echoes it with its own id.
//! let echo = InboundEvent::from_json(
//!     r#"{"type":"message","data":{"message_id":"srv_1","role":"user","content":"hi","timestamp":1}}"#,
//! )
//! .unwrap();
//! convo.apply_event(echo);
//!
//! assert_eq!(convo.len(), 1);
//! assert_eq!(convo.messages()[0].message_id, "srv_1");
//! ```

pub mod event;
pub mod reconciler;
pub mod types;

pub use event::InboundEvent;
pub use reconciler::{ApplyOutcome, EventEffect, InsertOutcome, Reconciler};
pub use types::{EventKey, Message, PROVISIONAL_PREFIX, Role, is_provisional};

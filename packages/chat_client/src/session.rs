//! Per-session chat state.
//!
//! Wraps the reconciler with the bits of UI state that sit beside the message
//! list: which assistant reply is streaming (so it can be cancelled), whether
//! a send is in flight, whether the initial history has arrived, and the last
//! error the server reported. Every mutation publishes a fresh [`SessionView`].

use std::sync::Arc;

use convo_sync::{
    ApplyOutcome, EventEffect, InboundEvent, Message, PROVISIONAL_PREFIX, Reconciler, Role,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::api::{CancelRequest, SendRequest};

/// Immutable snapshot published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: String,
    pub messages: Arc<[Message]>,
    pub version: u64,
    /// Provisional messages still waiting for their echo.
    pub pending: usize,
    pub streaming_id: Option<String>,
    pub is_sending: bool,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

/// A send that has been queued but not shown yet.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub local_id: String,
    pub request: SendRequest,
}

/// What an inbound event means for the state kept beside the list.
enum Signal {
    Loaded,
    Streaming(String),
    Finished,
    Failed(String),
}

pub struct ChatSession {
    session_id: String,
    user_id: String,
    convo: Reconciler,
    streaming_id: Option<String>,
    is_sending: bool,
    is_loading: bool,
    last_error: Option<String>,
    view: watch::Sender<SessionView>,
}

/// `session_<epoch-ms>`, for sessions started without an explicit id.
pub fn new_session_id() -> String {
    format!("session_{}", chrono::Utc::now().timestamp_millis())
}

impl ChatSession {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let convo = Reconciler::new();
        let (view, _) = watch::channel(SessionView {
            session_id: session_id.clone(),
            messages: convo.snapshot(),
            version: convo.version(),
            pending: 0,
            streaming_id: None,
            is_sending: false,
            is_loading: true,
            last_error: None,
        });
        Self {
            session_id,
            user_id: user_id.into(),
            convo,
            streaming_id: None,
            is_sending: false,
            is_loading: true,
            last_error: None,
            view,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending
    }

    /// Queue `text` for sending and return the request that delivers it.
    ///
    /// The local id is reserved before the request goes out, so an echo that
    /// arrives before [`ChatSession::show`] is held and merged there.
    /// Returns `None` for blank input or while a previous reply is still
    /// outstanding.
    pub fn submit(&mut self, text: &str) -> Option<Outgoing> {
        if text.trim().is_empty() {
            return None;
        }
        if self.is_sending {
            debug!("send ignored, reply still outstanding");
            return None;
        }

        let local_id = format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4().simple());
        self.convo.reserve(&local_id);
        self.is_sending = true;
        self.last_error = None;
        self.publish();

        Some(Outgoing {
            local_id,
            request: SendRequest {
                session_id: self.session_id.clone(),
                message: text.to_string(),
                user_id: self.user_id.clone(),
            },
        })
    }

    /// Put a submitted message in the list.
    ///
    /// Returns false if the session was reset since `submit`.
    pub fn show(&mut self, outgoing: &Outgoing) -> bool {
        if outgoing.request.session_id != self.session_id {
            debug!(local_id = %outgoing.local_id, "dropping send from a previous session");
            return false;
        }
        let outcome = self.convo.optimistic_insert(
            &outgoing.local_id,
            &outgoing.request.message,
            &self.session_id,
            &self.user_id,
        );
        debug!(local_id = %outgoing.local_id, ?outcome, "optimistic insert");
        self.publish();
        true
    }

    /// The cancel to issue for the reply currently streaming, if any.
    pub fn cancel_request(&self) -> Option<CancelRequest> {
        self.streaming_id.as_ref().map(|message_id| CancelRequest {
            session_id: self.session_id.clone(),
            message_id: message_id.clone(),
        })
    }

    /// The send request failed; the provisional message stays visible.
    pub fn send_failed(&mut self, error: impl std::fmt::Display) {
        warn!(session_id = %self.session_id, %error, "send failed");
        self.is_sending = false;
        self.last_error = Some(error.to_string());
        self.publish();
    }

    pub fn handle_event(&mut self, event: InboundEvent) -> EventEffect {
        let signal = signal_for(&event);
        if signal.is_none() && !event.affects_messages() {
            trace!(kind = event.kind(), "control event");
            return EventEffect::NoChange;
        }
        let effect = self.convo.apply_event(event);

        match signal {
            Some(Signal::Loaded) => self.is_loading = false,
            // A late chunk for a finished reply does not restart streaming.
            Some(Signal::Streaming(id))
                if effect != EventEffect::Applied(ApplyOutcome::IgnoredStale) =>
            {
                self.streaming_id = Some(id);
            }
            Some(Signal::Streaming(_)) => {}
            Some(Signal::Finished) => {
                self.streaming_id = None;
                self.is_sending = false;
            }
            Some(Signal::Failed(error)) => {
                warn!(session_id = %self.session_id, %error, "server reported an error");
                self.is_loading = false;
                self.streaming_id = None;
                self.is_sending = false;
                self.last_error = Some(error);
            }
            None => {}
        }

        self.publish();
        effect
    }

    /// Start over with a new session id.
    pub fn reset(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
        self.convo.clear();
        self.streaming_id = None;
        self.is_sending = false;
        self.is_loading = true;
        self.last_error = None;
        self.publish();
    }

    fn publish(&self) {
        self.view.send_replace(SessionView {
            session_id: self.session_id.clone(),
            messages: self.convo.snapshot(),
            version: self.convo.version(),
            pending: self.convo.pending_count(),
            streaming_id: self.streaming_id.clone(),
            is_sending: self.is_sending,
            is_loading: self.is_loading,
            last_error: self.last_error.clone(),
        });
    }
}

fn signal_for(event: &InboundEvent) -> Option<Signal> {
    match event {
        InboundEvent::Welcome { .. } | InboundEvent::History { .. } => Some(Signal::Loaded),
        InboundEvent::Message { data } | InboundEvent::Chunk { data }
            if data.role == Role::Assistant =>
        {
            if data.is_complete {
                Some(Signal::Finished)
            } else {
                Some(Signal::Streaming(data.message_id.clone()))
            }
        }
        InboundEvent::Complete { .. } | InboundEvent::Cancelled { .. } => Some(Signal::Finished),
        InboundEvent::Error { error, .. } => Some(Signal::Failed(error.clone())),
        _ => None,
    }
}

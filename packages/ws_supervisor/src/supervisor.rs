//! Connection supervisor.
//!
//! A single background task owns the connection. The [`Supervisor`] handle
//! sends it commands and observes its status through a watch channel; parsed
//! inbound events come out of an unbounded channel returned from
//! [`Supervisor::spawn`].
//!
//! Lifecycle:
//!
//! ```text
//! disconnected --connect--> connected --drop/error--> reconnecting --delay--> connected
//!      ^                        |                           |
//!      +------disconnect--------+-----------disconnect------+
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{SupervisorError, TransportError};
use crate::policy::ReconnectPolicy;
use crate::transport::{Connection, Frame, Transport};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_PAYLOAD: &str = r#"{"type":"ping"}"#;

/// Upper bound on waiting for the close handshake during a manual disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Base WebSocket URL, e.g. `ws://localhost:8080/ws/chat`.
    pub endpoint: String,
    /// Appended to the endpoint as the `session_id` query parameter.
    pub session_id: String,
    pub keepalive_interval: Duration,
    /// Text frame sent on every keepalive tick.
    pub keepalive_payload: String,
}

impl SupervisorConfig {
    pub fn new(endpoint: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_id: session_id.into(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_payload: DEFAULT_KEEPALIVE_PAYLOAD.to_string(),
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// The endpoint with `session_id` set in its query string.
    pub fn connection_url(&self) -> Result<Url, SupervisorError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|source| SupervisorError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        let others: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "session_id")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(others)
            .append_pair("session_id", &self.session_id);
        Ok(url)
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
}

/// Handle to a running connection supervisor.
///
/// Dropping the handle stops the background task and closes any open
/// connection.
pub struct Supervisor {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    url: String,
}

impl Supervisor {
    /// Start the supervisor task in the `disconnected` state.
    ///
    /// Inbound text and binary frames are parsed as JSON into `E` and
    /// delivered on the returned receiver; frames that fail to parse are
    /// logged and dropped. Must be called from within a tokio runtime.
    pub fn spawn<E, T, P>(
        config: SupervisorConfig,
        transport: T,
        policy: P,
    ) -> Result<(Self, mpsc::UnboundedReceiver<E>), SupervisorError>
    where
        E: DeserializeOwned + Send + 'static,
        T: Transport,
        P: ReconnectPolicy,
    {
        let url = config.connection_url()?.to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = Actor {
            url: url.clone(),
            keepalive_interval: config.keepalive_interval,
            keepalive_payload: config.keepalive_payload,
            transport: Arc::new(transport),
            policy,
            commands: command_rx,
            status: status_tx,
            events: event_tx,
            cancel: cancel.clone(),
            phase: Phase::Idle,
            manual_disconnect: false,
            attempt: 0,
        };
        let task = tokio::spawn(actor.run());

        let handle = Self {
            commands: command_tx,
            status: status_rx,
            cancel,
            task: Some(task),
            url,
        };
        Ok((handle, event_rx))
    }

    /// The URL every connection attempt dials.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the connection. Ignored while a connection is open or being
    /// opened; cancels a pending reconnect and connects right away.
    pub fn connect(&self) -> Result<(), SupervisorError> {
        self.send(Command::Connect)
    }

    /// Same as [`connect`](Self::connect); for an explicit retry after an error.
    pub fn reconnect(&self) -> Result<(), SupervisorError> {
        self.send(Command::Connect)
    }

    /// Close the connection and suppress automatic reconnection until the
    /// next [`connect`](Self::connect).
    pub fn disconnect(&self) -> Result<(), SupervisorError> {
        self.send(Command::Disconnect)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop the task and wait for it to release the connection.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .map_err(|_| SupervisorError::Stopped)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send>>;

enum Phase {
    Idle,
    Connecting(ConnectFuture),
    Open {
        conn: Connection,
        keepalive: Interval,
    },
    /// Reconnect scheduled.
    Waiting(Pin<Box<Sleep>>),
}

enum Step {
    Shutdown,
    Command(Command),
    Opened(Result<Connection, TransportError>),
    Frame(Option<Result<Frame, TransportError>>),
    Keepalive,
    RetryDue,
}

struct Actor<E, T, P> {
    url: String,
    keepalive_interval: Duration,
    keepalive_payload: String,
    transport: Arc<T>,
    policy: P,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
    phase: Phase,
    manual_disconnect: bool,
    /// Consecutive reconnect attempts since the last successful open.
    attempt: u32,
}

impl<E, T, P> Actor<E, T, P>
where
    E: DeserializeOwned + Send + 'static,
    T: Transport,
    P: ReconnectPolicy,
{
    async fn run(mut self) {
        debug!(url = %self.url, "supervisor started");
        loop {
            match self.next_step().await {
                Step::Shutdown => break,
                Step::Command(Command::Connect) => self.connect(),
                Step::Command(Command::Disconnect) => self.disconnect().await,
                Step::Opened(Ok(conn)) => self.opened(conn),
                Step::Opened(Err(e)) => {
                    if e.is_unreachable() {
                        warn!(url = %self.url, error = %e, "server unreachable");
                    } else {
                        warn!(url = %self.url, error = %e, "connection attempt failed");
                    }
                    self.set_status(ConnectionStatus::Error);
                    self.closed();
                }
                Step::Frame(Some(Ok(frame))) => self.on_frame(frame),
                Step::Frame(Some(Err(e))) => {
                    warn!(error = %e, "transport error");
                    self.set_status(ConnectionStatus::Error);
                }
                Step::Frame(None) => self.closed(),
                Step::Keepalive => self.send_keepalive().await,
                Step::RetryDue => {
                    info!(attempt = self.attempt, "reconnecting");
                    self.start_connecting();
                }
            }
        }
        self.close_connection().await;
        self.set_status(ConnectionStatus::Disconnected);
        debug!("supervisor stopped");
    }

    async fn next_step(&mut self) -> Step {
        let cancel = &self.cancel;
        let commands = &mut self.commands;

        match &mut self.phase {
            Phase::Idle => tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                cmd = commands.recv() => cmd.map_or(Step::Shutdown, Step::Command),
            },
            Phase::Connecting(pending) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                cmd = commands.recv() => cmd.map_or(Step::Shutdown, Step::Command),
                result = pending => Step::Opened(result),
            },
            Phase::Open { conn, keepalive } => tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                cmd = commands.recv() => cmd.map_or(Step::Shutdown, Step::Command),
                frame = conn.stream.next() => Step::Frame(frame),
                _ = keepalive.tick() => Step::Keepalive,
            },
            Phase::Waiting(delay) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                cmd = commands.recv() => cmd.map_or(Step::Shutdown, Step::Command),
                () = delay.as_mut() => Step::RetryDue,
            },
        }
    }

    fn connect(&mut self) {
        match self.phase {
            Phase::Open { .. } | Phase::Connecting(_) => {
                debug!("connect ignored, already connected or connecting");
            }
            Phase::Idle | Phase::Waiting(_) => {
                self.manual_disconnect = false;
                self.start_connecting();
            }
        }
    }

    fn start_connecting(&mut self) {
        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        debug!(url = %url, "opening connection");
        self.phase = Phase::Connecting(Box::pin(async move { transport.connect(&url).await }));
    }

    fn opened(&mut self, conn: Connection) {
        let period = self.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.attempt = 0;
        self.phase = Phase::Open { conn, keepalive };
        info!(url = %self.url, "connected");
        self.set_status(ConnectionStatus::Connected);
    }

    /// The connection ended or never opened. Schedules a reconnect unless the
    /// user asked to disconnect.
    fn closed(&mut self) {
        self.phase = Phase::Idle;
        if self.manual_disconnect {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay(self.attempt);
        info!(
            attempt = self.attempt,
            ?delay,
            "connection lost, scheduling reconnect"
        );
        self.set_status(ConnectionStatus::Reconnecting);
        self.phase = Phase::Waiting(Box::pin(tokio::time::sleep(delay)));
    }

    async fn disconnect(&mut self) {
        self.manual_disconnect = true;
        self.attempt = 0;
        self.close_connection().await;
        info!("disconnected");
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Drop whatever the current phase holds, closing an open connection
    /// politely first.
    async fn close_connection(&mut self) {
        if let Phase::Open { mut conn, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            match tokio::time::timeout(CLOSE_TIMEOUT, conn.sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "close failed"),
                Err(_) => debug!("close timed out"),
            }
        }
    }

    async fn send_keepalive(&mut self) {
        if let Phase::Open { conn, .. } = &mut self.phase {
            trace!("sending keepalive");
            let frame = Frame::Text(self.keepalive_payload.clone());
            if let Err(e) = conn.sink.send(frame).await {
                warn!(error = %e, "keepalive send failed");
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let parsed = match frame {
            Frame::Text(text) => serde_json::from_str::<E>(&text),
            Frame::Binary(data) => serde_json::from_slice::<E>(&data),
            Frame::Ping(_) | Frame::Pong(_) => {
                trace!("control frame");
                return;
            }
            Frame::Close => {
                debug!("peer sent close");
                self.closed();
                return;
            }
        };

        match parsed {
            Ok(event) => {
                if self.events.send(event).is_err() {
                    trace!("event receiver dropped");
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(%status, "status changed");
        }
    }
}

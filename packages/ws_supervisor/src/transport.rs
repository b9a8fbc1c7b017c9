//! Frame-level transport abstraction.
//!
//! The supervisor only needs "open a connection to this URL" and a
//! sink/stream pair of frames. [`WsTransport`] provides that over
//! tokio-tungstenite; tests plug in an in-memory implementation.

use std::future::Future;
use std::pin::Pin;

use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open connection: the outgoing and incoming halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Open a new connection to `url`.
    fn connect(&self, url: &str)
    -> impl Future<Output = Result<Connection, TransportError>> + Send;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(status = %response.status(), "websocket handshake complete");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(into_ws(frame))));
        let stream = read.filter_map(|item| {
            future::ready(match item {
                Ok(msg) => from_ws(msg).map(Ok),
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Connection::new(sink, stream))
    }
}

fn into_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Binary(data) => WsMessage::Binary(data.into()),
        Frame::Ping(data) => WsMessage::Ping(data.into()),
        Frame::Pong(data) => WsMessage::Pong(data.into()),
        Frame::Close => WsMessage::Close(None),
    }
}

fn from_ws(msg: WsMessage) -> Option<Frame> {
    match msg {
        WsMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        WsMessage::Binary(data) => Some(Frame::Binary(data.to_vec())),
        WsMessage::Ping(data) => Some(Frame::Ping(data.to_vec())),
        WsMessage::Pong(data) => Some(Frame::Pong(data.to_vec())),
        WsMessage::Close(_) => Some(Frame::Close),
        // Raw frames only appear when writing.
        WsMessage::Frame(_) => None,
    }
}

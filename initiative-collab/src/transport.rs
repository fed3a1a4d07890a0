//! Physical connection to the collaboration peer.
//!
//! A [`Connector`] opens one link per connection attempt. The link reports
//! back through [`LinkEvents`] and accepts outbound frames through a
//! [`LinkHandle`]. Every event is tagged with the link id so the session
//! can ignore stragglers from links it already abandoned.
//!
//! ```text
//! SessionDriver ──LinkHandle──► link task ──► WebSocket
//!       ▲                          │
//!       └──────(LinkId, LinkEvent)─┘
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

/// Close code for authentication / policy rejection.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the socket died without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Identifies one connection attempt.
pub type LinkId = u64;

/// Why a link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close code from the peer; `None` if no close frame arrived
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseReason {
    pub fn with_code(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    /// The link died without a close handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    /// Authentication or policy failure; never retried.
    pub fn is_fatal(&self) -> bool {
        self.code == Some(CLOSE_POLICY_VIOLATION)
    }

    pub fn is_abnormal(&self) -> bool {
        matches!(self.code, None | Some(CLOSE_ABNORMAL))
    }
}

/// Notifications from a link to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The socket is open and ready for frames
    Opened,
    /// A binary frame arrived
    Frame(Vec<u8>),
    /// The link is gone; no further events follow
    Closed(CloseReason),
}

/// Sending half handed to a link.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    id: LinkId,
    tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
}

impl LinkEvents {
    pub fn new(id: LinkId, tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Report an event. Returns `false` once the session is gone.
    pub fn send(&self, event: LinkEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }
}

/// Instructions from the session to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Send(Vec<u8>),
    Close,
}

/// The session's grip on a live link.
///
/// Dropping the handle closes the link gracefully as well.
#[derive(Debug)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub fn new(commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { commands }
    }

    /// Fire-and-forget. Returns `false` if the link is already gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.commands.send(LinkCommand::Send(frame)).is_ok()
    }

    /// Ask the link to close gracefully.
    pub fn close(self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

/// Opens links.
pub trait Connector: Send + Sync + 'static {
    /// Start connecting to `url`.
    ///
    /// Must not block. Success and failure are both reported through
    /// `events`; a link that never opens reports only `Closed`.
    fn open(&self, url: Url, events: LinkEvents) -> LinkHandle;
}

/// Default bound on the TCP + upgrade handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector for WsConnector {
    fn open(&self, url: Url, events: LinkEvents) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_ws_link(url, self.connect_timeout, events, rx));
        LinkHandle::new(tx)
    }
}

/// Map a failed handshake to a close reason.
///
/// An HTTP 401/403 on upgrade is the handshake-time equivalent of a
/// policy-violation close.
fn handshake_failure(err: &tungstenite::Error) -> CloseReason {
    if let tungstenite::Error::Http(response) = err {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return CloseReason::with_code(CLOSE_POLICY_VIOLATION, format!("handshake rejected: {status}"));
        }
    }
    CloseReason::abnormal(err.to_string())
}

async fn run_ws_link(
    url: Url,
    connect_timeout: Duration,
    events: LinkEvents,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let link = events.id();
    log::debug!("Link {link}: connecting to {}", url.host_str().unwrap_or("?"));

    let connecting = tokio_tungstenite::connect_async(url.as_str());
    let ws_stream = match tokio::time::timeout(connect_timeout, connecting).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            log::warn!("Link {link}: connect failed: {e}");
            events.send(LinkEvent::Closed(handshake_failure(&e)));
            return;
        }
        Err(_) => {
            log::warn!("Link {link}: connect timed out after {connect_timeout:?}");
            events.send(LinkEvent::Closed(CloseReason::abnormal(format!(
                "connect timed out after {connect_timeout:?}"
            ))));
            return;
        }
    };

    if !events.send(LinkEvent::Opened) {
        return;
    }
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(frame)) => {
                    if let Err(e) = ws_writer.send(Message::Binary(frame.into())).await {
                        break CloseReason::abnormal(e.to_string());
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    let _ = ws_writer.close().await;
                    log::debug!("Link {link}: closed locally");
                    return;
                }
            },
            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if !events.send(LinkEvent::Frame(data.to_vec())) {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseReason::with_code(u16::from(frame.code), frame.reason.to_string()),
                        None => CloseReason::with_code(CLOSE_NO_STATUS, ""),
                    };
                }
                Some(Ok(Message::Text(_))) => {
                    log::debug!("Link {link}: ignoring text message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::abnormal(e.to_string()),
                None => break CloseReason::abnormal("stream ended"),
            },
        }
    };

    log::debug!("Link {link}: closed by peer ({reason:?})");
    events.send(LinkEvent::Closed(reason));
}

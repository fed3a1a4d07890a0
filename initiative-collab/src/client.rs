//! Collaboration session: keeps a document replica in step with the peer.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, destroy, bounded reconnect)
//! - Sync handshake and incremental update exchange
//! - Local presence publishing and the remote collaborator roster
//!
//! All mutable state lives in one driver task. Host calls, link events and
//! the reconnect timer are serialized through it, so nothing here needs a
//! lock.
//!
//! ```text
//!  host ──Command──┐                          ┌──► watch<SessionState>
//!                  ▼                          │
//!  replica ──► SessionDriver ◄──(LinkId, LinkEvent)── link task ◄──► socket
//!                  │                          │
//!                  └──LinkHandle──────────────┘──► broadcast<SessionEvent>
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::presence::LocalPresence;
use crate::protocol::{self, Frame, MessageType};
use crate::reconnect::AbnormalCloseTracker;
use crate::replica::{ChangeSubscription, DocumentReplica, EchoSuppressor, UpdateOrigin};
use crate::roster::{CollaboratorRecord, Roster, RosterEvent};
use crate::transport::{CloseReason, Connector, LinkEvent, LinkEvents, LinkHandle, LinkId, WsConnector};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until the host calls `connect()` again
    Error,
}

/// Traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Undecodable frames and presence payloads that were dropped
    pub malformed_frames: u64,
    /// Remote updates that came back through the replica and were not re-sent
    pub updates_suppressed: u64,
}

/// Everything the host can read synchronously.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub status: ConnectionState,
    /// Initial full-state exchange finished on the current connection
    pub synced: bool,
    pub collaborators: Vec<CollaboratorRecord>,
    pub reconnect_attempt: u32,
    pub reconnect_pending: bool,
    pub stats: SessionStats,
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(ConnectionState),
    /// First full-state response on this connection was applied
    Synced,
    /// The connection ended; `status` is `Error` when no retry will follow
    Disconnected {
        status: ConnectionState,
        close_code: Option<u16>,
    },
    /// Full roster after a change
    RosterChanged(Vec<CollaboratorRecord>),
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Destroy,
    SetPresence(Map<String, Value>),
    ReplicaUpdate { update: Vec<u8>, origin: UpdateOrigin },
}

/// Host-facing handle to a collaboration session.
///
/// Commands are fire-and-forget; outcomes arrive as [`SessionEvent`]s and
/// in [`SessionState`]. Dropping the handle destroys the session.
pub struct CollabSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    destroyed: AtomicBool,
    client_id: Uuid,
}

impl CollabSession {
    /// Create a session that connects over WebSocket.
    ///
    /// Must be called from within a tokio runtime. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn new(config: SessionConfig, replica: Arc<dyn DocumentReplica>) -> Self {
        let connector = WsConnector::new(config.connect_timeout);
        Self::with_connector(config, replica, Arc::new(connector))
    }

    /// Create a session with a custom link implementation.
    pub fn with_connector(
        config: SessionConfig,
        replica: Arc<dyn DocumentReplica>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let listener_tx = commands_tx.clone();
        let subscription = replica.on_local_change(Arc::new(move |update: &[u8], origin| {
            let _ = listener_tx.send(Command::ReplicaUpdate {
                update: update.to_vec(),
                origin,
            });
        }));

        let client_id = config.client_id;
        let driver = SessionDriver {
            config,
            replica,
            connector,
            commands: commands_rx,
            link_tx,
            link_rx,
            link: None,
            next_link_id: 1,
            status: ConnectionState::Disconnected,
            synced: false,
            attempts: 0,
            reconnect_at: None,
            abnormal_closes: AbnormalCloseTracker::new(),
            roster: Roster::new(),
            presence: LocalPresence::new(),
            suppressor: EchoSuppressor::default(),
            stats: SessionStats::default(),
            state_tx,
            events: events_tx.clone(),
            subscription: Some(subscription),
            destroyed: false,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            destroyed: AtomicBool::new(false),
            client_id,
        }
    }

    /// Start connecting. No-op once destroyed or while a link is live.
    pub fn connect(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.send(Command::Connect);
    }

    /// Close the connection and cancel any pending retry.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Tear the session down for good.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.send(Command::Destroy);
        }
    }

    /// Merge fields into this session's presence and publish it.
    pub fn set_local_presence(&self, fields: Map<String, Value>) {
        self.send(Command::SetPresence(fields));
    }

    /// Set a single presence field.
    pub fn set_local_presence_field(&self, key: impl Into<String>, value: Value) {
        let mut fields = Map::new();
        fields.insert(key.into(), value);
        self.set_local_presence(fields);
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.state.borrow().status
    }

    pub fn is_synced(&self) -> bool {
        self.state.borrow().synced
    }

    pub fn collaborators(&self) -> Vec<CollaboratorRecord> {
        self.state.borrow().collaborators.clone()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.state.borrow().reconnect_attempt
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.state.borrow().reconnect_pending
    }

    pub fn stats(&self) -> SessionStats {
        self.state.borrow().stats.clone()
    }

    /// Snapshot of the full session state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch the session state change over time.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn send(&self, command: Command) {
        // The driver is gone only after destroy; late commands are moot.
        let _ = self.commands.send(command);
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Owns every piece of mutable session state.
struct SessionDriver {
    config: SessionConfig,
    replica: Arc<dyn DocumentReplica>,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    link_tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
    link_rx: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
    link: Option<(LinkId, LinkHandle)>,
    next_link_id: LinkId,
    status: ConnectionState,
    synced: bool,
    attempts: u32,
    reconnect_at: Option<Instant>,
    abnormal_closes: AbnormalCloseTracker,
    roster: Roster,
    presence: LocalPresence,
    suppressor: EchoSuppressor,
    stats: SessionStats,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    subscription: Option<ChangeSubscription>,
    destroyed: bool,
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionDriver {
    async fn run(mut self) {
        log::debug!("Session {}: driver started", self.config.client_id);

        loop {
            let reconnect_at = self.reconnect_at;
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.destroy();
                        Flow::Stop
                    }
                },
                Some((id, event)) = self.link_rx.recv() => {
                    self.handle_link_event(id, event);
                    Flow::Continue
                }
                () = wait_for_deadline(reconnect_at) => {
                    self.reconnect_due();
                    Flow::Continue
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        log::debug!("Session {}: driver stopped", self.config.client_id);
    }

    // ─── Host commands ───────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Destroy => {
                self.destroy();
                return Flow::Stop;
            }
            Command::SetPresence(fields) => self.set_presence(fields),
            Command::ReplicaUpdate { update, origin } => self.forward_update(update, origin),
        }
        Flow::Continue
    }

    fn connect(&mut self) {
        if self.destroyed {
            return;
        }
        if self.link.is_some() {
            log::debug!("Session {}: connect ignored, link already live", self.config.client_id);
            return;
        }
        // A host-issued connect starts a fresh retry budget.
        self.attempts = 0;
        self.abnormal_closes.reset();
        self.open_link();
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        let was_live = match self.link.take() {
            Some((id, link)) => {
                log::info!("Session {}: closing link {id}", self.config.client_id);
                link.close();
                true
            }
            None => false,
        };

        self.synced = false;
        self.clear_roster();
        self.set_status(ConnectionState::Disconnected);
        if was_live {
            self.emit(SessionEvent::Disconnected {
                status: ConnectionState::Disconnected,
                close_code: None,
            });
        }
        self.publish();
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.disconnect();
        self.subscription = None;
        self.presence.clear();
        self.publish();
        log::info!("Session {}: destroyed", self.config.client_id);
    }

    fn set_presence(&mut self, fields: Map<String, Value>) {
        if self.destroyed || !self.presence.merge(fields) {
            return;
        }
        if self.status == ConnectionState::Connected {
            self.publish_presence();
            self.publish();
        } else {
            log::debug!("Session {}: presence changed while offline, not sent", self.config.client_id);
        }
    }

    fn forward_update(&mut self, update: Vec<u8>, origin: UpdateOrigin) {
        if !self.suppressor.admit(origin) {
            log::trace!("Session {}: suppressed echo of remote update", self.config.client_id);
            self.publish();
            return;
        }
        if self.status != ConnectionState::Connected {
            // The replica keeps unsent edits; the next handshake carries them.
            log::debug!(
                "Session {}: not connected, dropping local update ({} bytes)",
                self.config.client_id,
                update.len()
            );
            return;
        }
        self.send_frame(Frame::update(update));
        self.publish();
    }

    // ─── Link lifecycle ──────────────────────────────────────────────

    fn open_link(&mut self) {
        self.reconnect_at = None;
        self.set_status(ConnectionState::Connecting);

        let url = match self.config.socket_url() {
            Ok(url) => url,
            Err(e) => {
                log::error!("Session {}: cannot build socket url: {e}", self.config.client_id);
                self.handle_close(CloseReason::abnormal(e.to_string()));
                return;
            }
        };

        let id = self.next_link_id;
        self.next_link_id += 1;
        log::info!(
            "Session {}: connecting to document {} (link {id})",
            self.config.client_id,
            self.config.document_id
        );
        let link = self.connector.open(url, LinkEvents::new(id, self.link_tx.clone()));
        self.link = Some((id, link));
        self.publish();
    }

    fn reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.destroyed || self.link.is_some() {
            return;
        }
        self.open_link();
    }

    fn handle_link_event(&mut self, id: LinkId, event: LinkEvent) {
        if self.link.as_ref().map(|(current, _)| *current) != Some(id) {
            log::debug!("Session {}: ignoring event from stale link {id}", self.config.client_id);
            return;
        }

        match event {
            LinkEvent::Opened => self.on_open(),
            LinkEvent::Frame(bytes) => self.on_frame(&bytes),
            LinkEvent::Closed(reason) => {
                self.link = None;
                self.handle_close(reason);
            }
        }
    }

    fn on_open(&mut self) {
        log::info!("Session {}: connected", self.config.client_id);
        self.attempts = 0;
        self.set_status(ConnectionState::Connected);

        self.send_frame(Frame::sync_request());
        if !self.presence.is_empty() {
            self.publish_presence();
        }
        self.publish();
    }

    fn handle_close(&mut self, reason: CloseReason) {
        self.synced = false;
        self.clear_roster();
        let close_code = reason.code;

        if reason.is_fatal() {
            log::warn!(
                "Session {}: rejected by peer ({:?}: {}), not retrying",
                self.config.client_id,
                close_code,
                reason.reason
            );
            self.fail(close_code);
            return;
        }

        if reason.is_abnormal()
            && self
                .abnormal_closes
                .record(&self.config.escalation, Instant::now())
        {
            log::warn!(
                "Session {}: {} abnormal closes within {:?}, giving up",
                self.config.client_id,
                self.abnormal_closes.recent(),
                self.config.escalation.window
            );
            self.fail(close_code);
            return;
        }

        if !self.config.reconnect.should_retry(self.attempts) {
            log::error!(
                "Session {}: giving up after {} reconnect attempts",
                self.config.client_id,
                self.attempts
            );
            self.fail(close_code);
            return;
        }

        log::info!(
            "Session {}: connection closed ({:?}: {})",
            self.config.client_id,
            close_code,
            reason.reason
        );
        self.set_status(ConnectionState::Disconnected);
        self.emit(SessionEvent::Disconnected {
            status: ConnectionState::Disconnected,
            close_code,
        });
        self.schedule_reconnect();
        self.publish();
    }

    fn fail(&mut self, close_code: Option<u16>) {
        self.reconnect_at = None;
        self.set_status(ConnectionState::Error);
        self.emit(SessionEvent::Disconnected {
            status: ConnectionState::Error,
            close_code,
        });
        self.publish();
    }

    fn schedule_reconnect(&mut self) {
        let policy = &self.config.reconnect;
        self.attempts += 1;
        let delay = policy.delay(self.attempts);
        log::info!(
            "Session {}: reconnecting in {delay:?} (attempt {}/{})",
            self.config.client_id,
            self.attempts,
            policy.max_attempts
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    // ─── Inbound frames ──────────────────────────────────────────────

    fn on_frame(&mut self, bytes: &[u8]) {
        self.stats.frames_received += 1;
        self.stats.bytes_received += bytes.len() as u64;

        let (msg_type, payload) = match protocol::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Session {}: dropping frame: {e}", self.config.client_id);
                self.stats.malformed_frames += 1;
                self.publish();
                return;
            }
        };
        log::trace!(
            "Session {}: received {msg_type:?} ({} bytes)",
            self.config.client_id,
            payload.len()
        );

        match msg_type {
            MessageType::SyncRequest => {
                let state = self.replica.encode_state();
                self.send_frame(Frame::sync_response(state));
            }
            MessageType::SyncResponse => {
                if !payload.is_empty() {
                    self.apply_remote(payload);
                }
                if !self.synced && self.status == ConnectionState::Connected {
                    self.synced = true;
                    log::info!("Session {}: synced", self.config.client_id);
                    self.emit(SessionEvent::Synced);
                }
            }
            MessageType::Update => {
                if !payload.is_empty() {
                    self.apply_remote(payload);
                }
            }
            MessageType::Presence => self.on_presence(payload),
        }
        self.publish();
    }

    fn apply_remote(&mut self, update: &[u8]) {
        if let Err(e) = self.replica.apply_update(update, UpdateOrigin::Remote) {
            log::warn!("Session {}: replica rejected update: {e}", self.config.client_id);
        }
    }

    fn on_presence(&mut self, payload: &[u8]) {
        match RosterEvent::from_json(payload) {
            Ok(RosterEvent::Unknown) => {
                log::debug!("Session {}: ignoring presence message of unknown type", self.config.client_id);
            }
            Ok(event) => {
                if self.roster.apply(event) {
                    self.emit(SessionEvent::RosterChanged(self.roster.snapshot()));
                }
            }
            Err(e) => {
                log::warn!("Session {}: dropping presence payload: {e}", self.config.client_id);
                self.stats.malformed_frames += 1;
            }
        }
    }

    // ─── Outbound ────────────────────────────────────────────────────

    fn publish_presence(&mut self) {
        match self.presence.to_frame() {
            Ok(frame) => self.send_frame(frame),
            Err(e) => log::warn!("Session {}: cannot encode presence: {e}", self.config.client_id),
        }
    }

    /// Send if connected; otherwise the frame is dropped.
    fn send_frame(&mut self, frame: Frame) {
        let Some((_, link)) = &self.link else {
            return;
        };
        if self.status != ConnectionState::Connected {
            log::debug!("Session {}: link not ready, dropping {:?}", self.config.client_id, frame.msg_type);
            return;
        }

        let bytes = frame.encode();
        let len = bytes.len() as u64;
        if link.send(bytes) {
            self.stats.frames_sent += 1;
            self.stats.bytes_sent += len;
        }
    }

    // ─── State publication ───────────────────────────────────────────

    fn clear_roster(&mut self) {
        if self.roster.clear() {
            self.emit(SessionEvent::RosterChanged(Vec::new()));
        }
    }

    fn set_status(&mut self, status: ConnectionState) {
        if self.status == status {
            return;
        }
        log::debug!(
            "Session {}: {:?} -> {status:?}",
            self.config.client_id,
            self.status
        );
        self.status = status;
        self.emit(SessionEvent::StatusChanged(status));
        self.publish();
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let mut stats = self.stats.clone();
        stats.updates_suppressed = self.suppressor.suppressed();
        self.state_tx.send_replace(SessionState {
            status: self.status,
            synced: self.synced,
            collaborators: self.roster.snapshot(),
            reconnect_attempt: self.attempts,
            reconnect_pending: self.reconnect_at.is_some(),
            stats,
        });
    }
}

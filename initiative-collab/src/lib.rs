//! # initiative-collab: Real-time document collaboration client
//!
//! Keeps a local replicated document in step with a collaboration peer over
//! a WebSocket, and tracks who else is editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Command    ┌───────────────┐   binary frames   ┌──────┐
//! │ CollabSession│ ───────────► │ SessionDriver │ ◄───────────────► │ peer │
//! │ (host handle)│ ◄─ watch ─── │ (single task) │    (transport)    └──────┘
//! └──────────────┘  broadcast   └───────┬───────┘
//!                                       │ apply / encode / listen
//!                                       ▼
//!                               ┌───────────────┐
//!                               │DocumentReplica│  (YrsReplica)
//!                               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: One-byte-tagged binary frames
//! - [`replica`]: Document seam, listener registry, echo suppression
//! - [`yrs_replica`]: `DocumentReplica` backed by a yrs document
//! - [`presence`]: Local presence state
//! - [`roster`]: Remote collaborator roster
//! - [`reconnect`]: Backoff and abnormal-close escalation
//! - [`config`]: Session configuration and socket URL
//! - [`transport`]: Link abstraction and the WebSocket connector
//! - [`client`]: Connection manager and host handle
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use initiative_collab::{CollabSession, SessionConfig, YrsReplica};
//!
//! # async fn run() {
//! let replica = Arc::new(YrsReplica::new());
//! let config = SessionConfig::new("https://app.example.com/api/v1", 42, "token", 7);
//! let session = CollabSession::new(config, replica);
//! session.connect();
//! # }
//! ```

pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod replica;
pub mod roster;
pub mod transport;
pub mod yrs_replica;

// Re-exports for convenience
pub use client::{CollabSession, ConnectionState, SessionEvent, SessionState, SessionStats};
pub use config::{ConfigError, SessionConfig};
pub use presence::LocalPresence;
pub use protocol::{Frame, MessageType, ProtocolError};
pub use reconnect::{AbnormalCloseTracker, EscalationPolicy, ReconnectPolicy};
pub use replica::{
    ChangeListener, ChangeSubscription, DocumentReplica, EchoSuppressor, ListenerRegistry,
    ReplicaError, UpdateOrigin,
};
pub use roster::{CollaboratorRecord, CursorRange, Roster, RosterEvent, SessionId};
pub use transport::{CloseReason, Connector, LinkEvent, LinkEvents, LinkHandle, WsConnector};
pub use yrs_replica::YrsReplica;

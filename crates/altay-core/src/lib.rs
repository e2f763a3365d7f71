//! Connection identity tracking and per-client visit logs.
//!
//! Everything here is transport agnostic: the hub feeds decoded text
//! frames into a [`session::ConnectionSession`] and logs the
//! [`session::SessionEvent`]s it hands back.

pub mod protocol;
pub mod registry;
pub mod session;
pub mod sink;
pub mod storage_key;

pub use protocol::ClientMessage;
pub use registry::{ClientSession, ConnectionId, IdentityRegistry, UNKNOWN_LABEL};
pub use session::{ConnectionSession, SessionEvent, SessionState, RELABEL_RETRY_INTERVAL};
pub use sink::{EventSink, FsEventLog, RenameOutcome, SinkError, VISITS_FILE_NAME};
pub use storage_key::StorageKey;

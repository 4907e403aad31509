use {
    crate::SessionId,
    std::fmt,
    thiserror::Error,
    tokio::sync::mpsc,
};

///
/// Creation disposition for a node.
///
/// Ephemeral nodes are removed by the service when their owning session
/// terminates. Sequential nodes get a zero-padded, per-parent monotonically
/// increasing numeric suffix appended to the requested path.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

///
/// Node metadata returned by `exists`/`get_data`/`set_data`.
///
/// `czxid` is assigned once at creation and never changes for the lifetime of
/// the node; it is the token lock holders capture to detect a directory that
/// was deleted and recreated underneath them.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub version: i64,
    /// Session that owns this node, `0` for persistent nodes.
    pub ephemeral_owner: SessionId,
    pub num_children: u32,
    pub data_len: u32,
}

///
/// Kind of change a node watch can report.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Deleted,
    Changed,
    Child,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => f.write_str("created"),
            EventKind::Deleted => f.write_str("deleted"),
            EventKind::Changed => f.write_str("changed"),
            EventKind::Child => f.write_str("child"),
        }
    }
}

///
/// Liveness of a session with the coordination service.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Expired,
    Closed,
}

impl SessionState {
    ///
    /// Whether a blocked caller observing this state must give up:
    /// every state except `Connected` invalidates an in-flight wait.
    ///
    pub fn is_interruption(self) -> bool {
        !matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Expired => f.write_str("expired"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

///
/// A fired node watch, as delivered on the session notification channel.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
    /// Session state at the time the event was delivered.
    pub state: SessionState,
}

///
/// Raw notification drained from the wire client, in service order.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNotification {
    Node(WatchedEvent),
    State(SessionState),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("no node: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("version mismatch on {0}")]
    BadVersion(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("invalid path: {0}")]
    BadPath(String),
    #[error("connection to coordination service lost")]
    ConnectionLoss,
    #[error("session expired")]
    SessionExpired,
    #[error("session not connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
    #[error("operation timed out")]
    OperationTimeout,
    #[error("malformed node payload: {0}")]
    Payload(String),
}

impl CoordError {
    ///
    /// True for errors caused by the session lifecycle rather than by the
    /// request itself. These are never retried by this crate.
    ///
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            CoordError::ConnectionLoss
                | CoordError::SessionExpired
                | CoordError::NotConnected
                | CoordError::Closed
        )
    }

    pub(crate) fn from_interruption(state: SessionState) -> Self {
        match state {
            SessionState::Expired => CoordError::SessionExpired,
            SessionState::Closed => CoordError::Closed,
            _ => CoordError::ConnectionLoss,
        }
    }
}

///
/// The consumed wire contract.
///
/// Implementations must deliver every fired watch and session-state
/// transition on the session's notification channel, in the order the
/// service produced them. Watches set through `exists`/`get_data` fire on
/// created/deleted/changed; watches set through `get_children` fire on
/// child membership changes and on deletion of the watched node. All
/// watches are one-shot.
///
#[async_trait::async_trait]
pub trait RawClient: Send + Sync {
    /// Returns the actual path, which differs from the requested path for
    /// sequential modes.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError>;

    /// `expected_version` of `None` deletes unconditionally.
    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<(), CoordError>;

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>, CoordError>;

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), CoordError>;

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, CoordError>;

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, CoordError>;

    fn session_id(&self) -> SessionId;

    /// Terminates the session. Idempotent.
    async fn close(&self) -> Result<(), CoordError>;
}

///
/// A freshly established session: the operation handle plus the channel the
/// service pushes notifications into.
///
pub struct RawSession {
    pub client: std::sync::Arc<dyn RawClient>,
    pub notifications: mpsc::UnboundedReceiver<RawNotification>,
}

///
/// Session factory used by [`crate::pool::ConnectionPool`] to grow and by
/// [`crate::session::Connection::connect`] for standalone connections.
///
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<RawSession, CoordError>;
}

///
/// Splits a sequential node name into its prefix and numeric suffix,
/// e.g. `"write-0000000042"` into `("write", 42)`.
///
pub fn split_sequence(name: &str) -> Option<(&str, i64)> {
    let (prefix, seq) = name.rsplit_once('-')?;
    seq.parse::<i64>().ok().map(|seq| (prefix, seq))
}

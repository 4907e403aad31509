use {
    crate::{
        client::{
            Connector, CoordError, CreateMode, EventKind, RawClient, RawNotification, RawSession,
            SessionState, Stat, WatchedEvent,
        },
        SessionId,
    },
    rand::Rng,
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::{Arc, Mutex},
    },
    tokio::sync::mpsc,
    tracing::trace,
};

///
/// In-process coordination service backend.
///
/// Implements the full consumed contract against a single mutexed node
/// tree: versioned CRUD, zero-padded per-parent sequence counters, one-shot
/// data and child watches, ephemeral ownership, and session lifecycle.
/// Notifications are sent while the mutation lock is held, so every session
/// observes events in mutation order. Intended for tests and local
/// experimentation; it is a simulator, not a replicated server.
///
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterState>>,
}

struct Node {
    data: Vec<u8>,
    czxid: i64,
    mzxid: i64,
    version: i64,
    ephemeral_owner: SessionId,
    /// Counter stamped into sequential children of this node.
    next_sequence: i64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WatchClass {
    Data,
    Child,
}

struct WatchReg {
    session: SessionId,
    class: WatchClass,
}

struct SessionRec {
    tx: mpsc::UnboundedSender<RawNotification>,
    connected: bool,
    ephemerals: HashSet<String>,
}

struct ClusterState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<WatchReg>>,
    sessions: HashMap<SessionId, SessionRec>,
    /// Terminal state of sessions that have ended, for error mapping.
    ended: HashMap<SessionId, SessionState>,
    zxid: i64,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                czxid: 0,
                mzxid: 0,
                version: 0,
                ephemeral_owner: 0,
                next_sequence: 0,
            },
        );
        Self {
            inner: Arc::new(Mutex::new(ClusterState {
                nodes,
                watches: HashMap::new(),
                sessions: HashMap::new(),
                ended: HashMap::new(),
                zxid: 0,
            })),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
        }
    }

    /// Whether a node currently exists, for test assertions.
    pub fn node_exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    ///
    /// Terminates a session as if its timeout elapsed: its ephemerals are
    /// removed (firing watches), `Expired` is delivered, and the
    /// notification channel closes.
    ///
    pub fn expire_session(&self, session: SessionId) {
        self.kill(session, SessionState::Expired);
    }

    ///
    /// Simulates a connection drop: the session stays alive (ephemerals
    /// kept) but observes `Connecting` and every operation fails with
    /// connection loss until [`reconnect_session`](MemoryCluster::
    /// reconnect_session).
    ///
    pub fn disconnect_session(&self, session: SessionId) {
        let mut state = self.lock();
        if let Some(rec) = state.sessions.get_mut(&session) {
            rec.connected = false;
            let _ = rec.tx.send(RawNotification::State(SessionState::Connecting));
        }
    }

    pub fn reconnect_session(&self, session: SessionId) {
        let mut state = self.lock();
        if let Some(rec) = state.sessions.get_mut(&session) {
            rec.connected = true;
            let _ = rec.tx.send(RawNotification::State(SessionState::Connected));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.inner.lock().expect("cluster mutex poisoned")
    }

    fn start_session(&self) -> (SessionId, mpsc::UnboundedReceiver<RawNotification>) {
        let mut state = self.lock();
        let mut rng = rand::thread_rng();
        let session = loop {
            let candidate: SessionId = rng.gen_range(1..SessionId::MAX);
            if !state.sessions.contains_key(&candidate) && !state.ended.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RawNotification::State(SessionState::Connected));
        state.sessions.insert(
            session,
            SessionRec {
                tx,
                connected: true,
                ephemerals: HashSet::new(),
            },
        );
        trace!("memory cluster started session {session}");
        (session, rx)
    }

    fn kill(&self, session: SessionId, final_state: SessionState) {
        let mut state = self.lock();
        let Some(mut rec) = state.sessions.remove(&session) else {
            return;
        };
        state.ended.insert(session, final_state);
        // A dying session receives no further node events.
        for regs in state.watches.values_mut() {
            regs.retain(|reg| reg.session != session);
        }
        let mut ephemerals: Vec<String> = rec.ephemerals.drain().collect();
        // Deepest first, so parents never report children they lost.
        ephemerals.sort_by(|a, b| b.cmp(a));
        for path in ephemerals {
            remove_node(&mut state, &path);
        }
        let _ = rec.tx.send(RawNotification::State(final_state));
        trace!("memory cluster ended session {session} as {final_state}");
        // Dropping `rec` closes the notification channel.
    }

    fn check_session(state: &ClusterState, session: SessionId) -> Result<(), CoordError> {
        match state.sessions.get(&session) {
            Some(rec) if rec.connected => Ok(()),
            Some(_) => Err(CoordError::ConnectionLoss),
            None => match state.ended.get(&session) {
                Some(SessionState::Expired) => Err(CoordError::SessionExpired),
                Some(_) => Err(CoordError::Closed),
                None => Err(CoordError::NotConnected),
            },
        }
    }

    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        validate_path(path)?;
        let mut state = self.lock();
        Self::check_session(&state, session)?;
        let parent = parent_of(path);
        let actual = {
            let parent_node = state
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(parent.to_owned()))?;
            if parent_node.ephemeral_owner != 0 {
                return Err(CoordError::BadPath(format!(
                    "{parent} is ephemeral and cannot have children"
                )));
            }
            if mode.is_sequential() {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{path}{seq:010}")
            } else {
                path.to_owned()
            }
        };
        if !mode.is_sequential() && state.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }
        state.zxid += 1;
        let zxid = state.zxid;
        let owner = if mode.is_ephemeral() { session } else { 0 };
        state.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                czxid: zxid,
                mzxid: zxid,
                version: 0,
                ephemeral_owner: owner,
                next_sequence: 0,
            },
        );
        if owner != 0 {
            if let Some(rec) = state.sessions.get_mut(&session) {
                rec.ephemerals.insert(actual.clone());
            }
        }
        fire_watches(&mut state, &actual, EventKind::Created);
        fire_child_watches(&mut state, parent);
        Ok(actual)
    }

    fn delete(
        &self,
        session: SessionId,
        path: &str,
        expected_version: Option<i64>,
    ) -> Result<(), CoordError> {
        validate_path(path)?;
        let mut state = self.lock();
        Self::check_session(&state, session)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_owned()))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(CoordError::BadVersion(path.to_owned()));
            }
        }
        if !children_of(&state.nodes, path).is_empty() {
            return Err(CoordError::NotEmpty(path.to_owned()));
        }
        remove_node(&mut state, path);
        Ok(())
    }

    fn exists(
        &self,
        session: SessionId,
        path: &str,
        watch: bool,
    ) -> Result<Option<Stat>, CoordError> {
        validate_path(path)?;
        let mut state = self.lock();
        Self::check_session(&state, session)?;
        if watch {
            register_watch(&mut state, session, path, WatchClass::Data);
        }
        Ok(stat_of(&state.nodes, path))
    }

    fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watch: bool,
    ) -> Result<(Vec<u8>, Stat), CoordError> {
        validate_path(path)?;
        let mut state = self.lock();
        Self::check_session(&state, session)?;
        let stat =
            stat_of(&state.nodes, path).ok_or_else(|| CoordError::NoNode(path.to_owned()))?;
        let data = state.nodes[path].data.clone();
        if watch {
            register_watch(&mut state, session, path, WatchClass::Data);
        }
        Ok((data, stat))
    }

    fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, CoordError> {
        validate_path(path)?;
        let mut state = self.lock();
        Self::check_session(&state, session)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_owned()))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(CoordError::BadVersion(path.to_owned()));
            }
        }
        state.zxid += 1;
        let zxid = state.zxid;
        let node = state
            .nodes
            .get_mut(path)
            .expect("node vanished under the cluster lock");
        node.data = data.to_vec();
        node.version += 1;
        node.mzxid = zxid;
        fire_watches(&mut state, path, EventKind::Changed);
        let stat = stat_of(&state.nodes, path).expect("node vanished under the cluster lock");
        Ok(stat)
    }

    fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watch: bool,
    ) -> Result<Vec<String>, CoordError> {
        validate_path(path)?;
        let mut state = self.lock();
        Self::check_session(&state, session)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_owned()));
        }
        let children: Vec<String> = children_of(&state.nodes, path);
        if watch {
            register_watch(&mut state, session, path, WatchClass::Child);
        }
        Ok(children)
    }
}

fn validate_path(path: &str) -> Result<(), CoordError> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(CoordError::BadPath(path.to_owned()))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Immediate child names of `path`, in sorted order.
fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                None
            } else {
                Some(rest.to_string())
            }
        })
        .collect()
}

fn stat_of(nodes: &BTreeMap<String, Node>, path: &str) -> Option<Stat> {
    let node = nodes.get(path)?;
    let num_children = children_of(nodes, path).len() as u32;
    Some(Stat {
        czxid: node.czxid,
        mzxid: node.mzxid,
        version: node.version,
        ephemeral_owner: node.ephemeral_owner,
        num_children,
        data_len: node.data.len() as u32,
    })
}

fn register_watch(state: &mut ClusterState, session: SessionId, path: &str, class: WatchClass) {
    state
        .watches
        .entry(path.to_owned())
        .or_default()
        .push(WatchReg { session, class });
}

///
/// Fires (and consumes) the one-shot watches on `path` matching `kind`:
/// data watches for created/deleted/changed, child watches for child
/// membership changes and for deletion of the watched node itself.
///
fn fire_watches(state: &mut ClusterState, path: &str, kind: EventKind) {
    let Some(regs) = state.watches.get_mut(path) else {
        return;
    };
    let mut fired = Vec::new();
    regs.retain(|reg| {
        let hit = match reg.class {
            WatchClass::Data => matches!(
                kind,
                EventKind::Created | EventKind::Deleted | EventKind::Changed
            ),
            WatchClass::Child => matches!(kind, EventKind::Child | EventKind::Deleted),
        };
        if hit {
            fired.push(reg.session);
            false
        } else {
            true
        }
    });
    if regs.is_empty() {
        state.watches.remove(path);
    }
    for session in fired {
        if let Some(rec) = state.sessions.get(&session) {
            let watch_state = if rec.connected {
                SessionState::Connected
            } else {
                SessionState::Connecting
            };
            let _ = rec.tx.send(RawNotification::Node(WatchedEvent {
                kind,
                path: path.to_owned(),
                state: watch_state,
            }));
        }
    }
}

fn fire_child_watches(state: &mut ClusterState, parent: &str) {
    fire_watches(state, parent, EventKind::Child);
}

fn remove_node(state: &mut ClusterState, path: &str) {
    let Some(node) = state.nodes.remove(path) else {
        return;
    };
    state.zxid += 1;
    if node.ephemeral_owner != 0 {
        if let Some(rec) = state.sessions.get_mut(&node.ephemeral_owner) {
            rec.ephemerals.remove(path);
        }
    }
    fire_watches(state, path, EventKind::Deleted);
    fire_child_watches(state, parent_of(path));
}

///
/// Operation handle bound to one session of a [`MemoryCluster`].
///
pub struct MemoryClient {
    cluster: MemoryCluster,
    session: SessionId,
}

#[async_trait::async_trait]
impl RawClient for MemoryClient {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        self.cluster.create(self.session, path, data, mode)
    }

    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<(), CoordError> {
        self.cluster.delete(self.session, path, expected_version)
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>, CoordError> {
        self.cluster.exists(self.session, path, watch)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), CoordError> {
        self.cluster.get_data(self.session, path, watch)
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, CoordError> {
        self.cluster.set_data(self.session, path, data, expected_version)
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, CoordError> {
        self.cluster.get_children(self.session, path, watch)
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    async fn close(&self) -> Result<(), CoordError> {
        self.cluster.kill(self.session, SessionState::Closed);
        Ok(())
    }
}

///
/// [`Connector`] implementation over a [`MemoryCluster`].
///
pub struct MemoryConnector {
    cluster: MemoryCluster,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<RawSession, CoordError> {
        let (session, notifications) = self.cluster.start_session();
        Ok(RawSession {
            client: Arc::new(MemoryClient {
                cluster: self.cluster.clone(),
                session,
            }),
            notifications,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_session() -> (MemoryCluster, SessionId) {
        let cluster = MemoryCluster::new();
        let (session, _rx) = cluster.start_session();
        (cluster, session)
    }

    #[test]
    fn sequential_names_are_zero_padded_and_monotonic() {
        let (cluster, session) = cluster_with_session();
        cluster
            .create(session, "/dir", b"", CreateMode::Persistent)
            .expect("create dir");
        let first = cluster
            .create(session, "/dir/n-", b"", CreateMode::EphemeralSequential)
            .expect("create first");
        let second = cluster
            .create(session, "/dir/n-", b"", CreateMode::EphemeralSequential)
            .expect("create second");
        assert_eq!(first, "/dir/n-0000000000");
        assert_eq!(second, "/dir/n-0000000001");
    }

    #[test]
    fn delete_of_nonempty_node_is_refused() {
        let (cluster, session) = cluster_with_session();
        cluster
            .create(session, "/a", b"", CreateMode::Persistent)
            .expect("create /a");
        cluster
            .create(session, "/a/b", b"", CreateMode::Persistent)
            .expect("create /a/b");
        assert_eq!(
            cluster.delete(session, "/a", None),
            Err(CoordError::NotEmpty("/a".to_string()))
        );
    }

    #[test]
    fn version_mismatch_is_refused() {
        let (cluster, session) = cluster_with_session();
        cluster
            .create(session, "/v", b"x", CreateMode::Persistent)
            .expect("create /v");
        cluster
            .set_data(session, "/v", b"y", Some(0))
            .expect("first update");
        assert_eq!(
            cluster.set_data(session, "/v", b"z", Some(0)),
            Err(CoordError::BadVersion("/v".to_string()))
        );
    }

    #[test]
    fn expiring_a_session_removes_its_ephemerals() {
        let cluster = MemoryCluster::new();
        let (owner, _rx1) = cluster.start_session();
        let (other, _rx2) = cluster.start_session();
        cluster
            .create(owner, "/eph", b"", CreateMode::Ephemeral)
            .expect("create ephemeral");
        cluster.expire_session(owner);
        assert!(!cluster.node_exists("/eph"));
        assert_eq!(
            cluster.create(owner, "/x", b"", CreateMode::Persistent),
            Err(CoordError::SessionExpired)
        );
        assert!(cluster
            .create(other, "/x", b"", CreateMode::Persistent)
            .is_ok());
    }

    #[test]
    fn one_shot_watch_fires_once_for_the_right_session() {
        let cluster = MemoryCluster::new();
        let (observer, mut rx) = cluster.start_session();
        let (mutator, _rx2) = cluster.start_session();
        assert_eq!(
            rx.try_recv().expect("initial state"),
            RawNotification::State(SessionState::Connected)
        );
        cluster.exists(observer, "/watched", true).expect("arm watch");
        cluster
            .create(mutator, "/watched", b"", CreateMode::Persistent)
            .expect("create watched node");
        assert_eq!(
            rx.try_recv().expect("watch event"),
            RawNotification::Node(WatchedEvent {
                kind: EventKind::Created,
                path: "/watched".to_string(),
                state: SessionState::Connected,
            })
        );
        // One-shot: a second mutation is silent without re-arming.
        cluster
            .set_data(mutator, "/watched", b"x", None)
            .expect("set data");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_session_refuses_operations_until_reconnect() {
        let (cluster, session) = cluster_with_session();
        cluster.disconnect_session(session);
        assert_eq!(
            cluster.exists(session, "/", false),
            Err(CoordError::ConnectionLoss)
        );
        cluster.reconnect_session(session);
        assert!(cluster.exists(session, "/", false).is_ok());
    }
}

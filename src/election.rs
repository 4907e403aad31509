use {
    crate::{
        client::{split_sequence, CoordError, CreateMode, WatchedEvent},
        session::Connection,
        watcher::{DeliveryMode, InterestFilter, SubscriptionHandle},
    },
    std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
    thiserror::Error,
    tokio::sync::watch,
    tracing::{error, info, trace},
};

pub const DEFAULT_ELECTION_ROOT: &str = "/_elections";

/// Name of the node the sitting leader publishes once it is ready to act.
const ACK_NODE: &str = "leader_ack";

#[derive(Debug, Error)]
pub enum ElectionError {
    /// A candidate handle enters an election at most once.
    #[error("candidate already registered")]
    AlreadyRegistered,
    #[error(transparent)]
    Coord(#[from] CoordError),
}

type WinningHook = Box<dyn Fn() + Send + Sync>;

///
/// A contender in a named leader election.
///
/// Registration creates an ephemeral-sequential `vote-<seq>` node under the
/// election directory. The candidate whose vote has the lowest sequence is
/// the leader; every other candidate watches only its immediate predecessor
/// and re-evaluates when that node goes away, so a leader change wakes
/// exactly one candidate.
///
/// Winning is decoupled from being ready: hooks registered through
/// [`on_winning`](Candidate::on_winning) run first, and only then is the
/// ephemeral `leader_ack` node (carrying this candidate's data) published
/// for observers and [`is_leader`](Candidate::is_leader) flipped.
///
pub struct Candidate {
    conn: Connection,
    dir: String,
    data: Vec<u8>,
    vote: Arc<Mutex<Option<String>>>,
    leader_tx: Arc<watch::Sender<bool>>,
    leader_rx: watch::Receiver<bool>,
    hooks: Arc<Mutex<Vec<WinningHook>>>,
    registered: AtomicBool,
}

impl Candidate {
    pub fn new(conn: Connection, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::with_root(conn, DEFAULT_ELECTION_ROOT, name, data)
    }

    pub fn with_root(
        conn: Connection,
        root: impl Into<String>,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        let root = root.into();
        let name = name.into();
        assert!(
            !name.is_empty() && !name.contains('/'),
            "election name must be a single non-empty path component"
        );
        let (leader_tx, leader_rx) = watch::channel(false);
        Self {
            conn,
            dir: format!("{root}/{name}"),
            data: data.into(),
            vote: Arc::new(Mutex::new(None)),
            leader_tx: Arc::new(leader_tx),
            leader_rx,
            hooks: Arc::new(Mutex::new(Vec::new())),
            registered: AtomicBool::new(false),
        }
    }

    ///
    /// Registers a hook run after this candidate wins and before the
    /// `leader_ack` node announces it. Register hooks before
    /// [`register`](Candidate::register).
    ///
    pub fn on_winning(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .expect("hooks mutex poisoned")
            .push(Box::new(hook));
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Watch channel observing this candidate's own leadership transitions.
    pub fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    pub fn vote_path(&self) -> Option<String> {
        self.vote.lock().expect("vote mutex poisoned").clone()
    }

    ///
    /// Enters the election: casts the vote node and starts the follow task
    /// that tracks this candidate's position until its vote disappears or
    /// the session is interrupted.
    ///
    pub async fn register(&self) -> Result<(), ElectionError> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Err(ElectionError::AlreadyRegistered);
        }
        if let Some((root, _)) = self.dir.rsplit_once('/') {
            if !root.is_empty() {
                self.conn.ensure_node(root).await?;
            }
        }
        self.conn.ensure_node(&self.dir).await?;
        let vote_path = self
            .conn
            .create(
                &format!("{}/vote-", self.dir),
                &self.data,
                CreateMode::EphemeralSequential,
            )
            .await?;
        trace!("cast vote {vote_path}");
        *self.vote.lock().expect("vote mutex poisoned") = Some(vote_path.clone());

        let conn = self.conn.clone();
        let dir = self.dir.clone();
        let data = self.data.clone();
        let leader_tx = Arc::clone(&self.leader_tx);
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            follow(conn, dir, vote_path, data, leader_tx, hooks).await;
        });
        Ok(())
    }

    ///
    /// Withdraws from the election: deletes this candidate's vote node (and
    /// its ack node if it was the sitting leader). The follow task observes
    /// the removal and clears leadership.
    ///
    pub async fn resign(&self) -> Result<(), ElectionError> {
        let Some(vote_path) = self.vote.lock().expect("vote mutex poisoned").take() else {
            return Ok(());
        };
        // The ack goes first; once the vote disappears the successor
        // publishes its own ack, which must not be clobbered.
        if self.is_leader() {
            let _ = self
                .conn
                .delete(&format!("{}/{ACK_NODE}", self.dir), None)
                .await;
        }
        match self.conn.delete(&vote_path, None).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn follow(
    conn: Connection,
    dir: String,
    vote_path: String,
    data: Vec<u8>,
    leader_tx: Arc<watch::Sender<bool>>,
    hooks: Arc<Mutex<Vec<WinningHook>>>,
) {
    let my_seq = match vote_path
        .rsplit('/')
        .next()
        .and_then(split_sequence)
        .map(|(_, seq)| seq)
    {
        Some(seq) => seq,
        None => {
            error!("vote node {vote_path} has no sequence suffix");
            return;
        }
    };

    loop {
        let children = match conn.get_children(&dir, false).await {
            Ok(children) => children,
            Err(e) => {
                trace!("election follow for {vote_path} ending: {e}");
                break;
            }
        };
        // The ack node carries no sequence suffix and is skipped here.
        let predecessor = children
            .iter()
            .filter_map(|name| split_sequence(name).map(|(_, seq)| (seq, name)))
            .filter(|(seq, _)| *seq < my_seq)
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, name)| name.clone());

        match predecessor {
            Some(name) => {
                if let Err(e) = conn.await_removal(&format!("{dir}/{name}")).await {
                    trace!("election follow for {vote_path} interrupted: {e}");
                    break;
                }
            }
            None => {
                // Leadership-assumption setup runs before anything is
                // announced.
                {
                    let hooks = hooks.lock().expect("hooks mutex poisoned");
                    for hook in hooks.iter() {
                        if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                            error!("on_winning hook panicked for {vote_path}");
                        }
                    }
                }
                let ack_path = format!("{dir}/{ACK_NODE}");
                // A previous leader that resigned without its session dying
                // can leave a stale ack behind.
                let _ = conn.delete(&ack_path, None).await;
                if let Err(e) = conn.create(&ack_path, &data, CreateMode::Ephemeral).await {
                    error!("failed to publish {ack_path}: {e}");
                }
                leader_tx.send_replace(true);
                info!("candidate {vote_path} assumed leadership");

                // Leader until its own vote disappears (resignation,
                // session expiry) or the session is interrupted.
                let _ = conn.await_removal(&vote_path).await;
                leader_tx.send_replace(false);
                info!("candidate {vote_path} lost leadership");
                return;
            }
        }
    }
    leader_tx.send_replace(false);
}

/// Path of the ack node for an election under the default root.
pub fn ack_path(name: &str) -> String {
    format!("{DEFAULT_ELECTION_ROOT}/{name}/{ACK_NODE}")
}

///
/// Subscribes to changes of an election's ack node, i.e. to leadership
/// announcements. The subscription only sees events for watches the caller
/// arms; pair it with [`current_leader`], which arms a watch on every read.
///
pub fn subscribe_leader_ack(
    conn: &Connection,
    name: &str,
    mode: DeliveryMode,
    callback: impl Fn(&WatchedEvent) + Send + Sync + 'static,
) -> SubscriptionHandle {
    conn.subscribe(
        ack_path(name),
        InterestFilter::CREATED | InterestFilter::DELETED | InterestFilter::CHANGED,
        mode,
        callback,
    )
}

///
/// Reads the current leader's announcement data, arming a one-shot watch on
/// the ack node so a registered ack subscription fires on the next change.
/// `None` while no leader has acked.
///
pub async fn current_leader(conn: &Connection, name: &str) -> Result<Option<Vec<u8>>, CoordError> {
    let path = ack_path(name);
    loop {
        match conn.get_data(&path, true).await {
            Ok((data, _stat)) => return Ok(Some(data)),
            Err(CoordError::NoNode(_)) => {
                // Arm the watch for the creation instead; if the ack landed
                // in between, read it after all.
                if conn.exists(&path, true).await?.is_none() {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

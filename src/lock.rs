use {
    crate::{
        client::{split_sequence, CoordError, CreateMode},
        session::Connection,
    },
    std::sync::Mutex,
    thiserror::Error,
    tracing::{info, trace},
};

pub const DEFAULT_LOCK_ROOT: &str = "/_locks";

///
/// Mode tag embedded in a lock node's name. Orders contenders: a `Read`
/// request is granted once no lower-sequence `Write` node exists; a `Write`
/// request only once it is the lowest-sequence node overall. Exclusive locks
/// are `Write` requests.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    fn prefix(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Double-acquire through one handle is a programming error.
    #[error("lock already held by this handle")]
    AlreadyHeld,
    #[error(transparent)]
    Coord(#[from] CoordError),
}

///
/// Raised by [`DistributedLock::assert_held`] exclusively; never raised
/// asynchronously.
///
#[derive(Debug, Error)]
pub enum LockAssertError {
    #[error("lock connection is not connected")]
    NotConnected,
    #[error("lock was never acquired")]
    NotAcquired,
    #[error("lock node no longer exists")]
    NodeGone,
    #[error("lock directory was removed or recreated since acquisition")]
    RootReplaced,
    #[error(transparent)]
    Coord(#[from] CoordError),
}

#[derive(Clone)]
struct HeldLock {
    path: String,
    /// Creation token (czxid) of the lock directory observed at acquisition.
    root_token: i64,
}

///
/// A distributed lock backed by an ephemeral-sequential node under
/// `root/<name>/`.
///
/// Contenders create `<prefix>-<seq>` nodes and each waits on the single
/// sibling immediately blocking it, never on the whole directory, so one
/// release wakes exactly one waiter.
///
/// A handle tracks at most one acquisition at a time and is not meant for
/// concurrent `lock` calls; the holder's claim is only valid while its
/// session is alive, its node exists, and the lock directory has not been
/// replaced (see [`assert_held`](DistributedLock::assert_held)).
///
pub struct DistributedLock {
    conn: Connection,
    root: String,
    name: String,
    mode: LockMode,
    held: Mutex<Option<HeldLock>>,
}

impl DistributedLock {
    /// Exclusive lock: a `Write`-mode request under the default root.
    pub fn exclusive(conn: Connection, name: impl Into<String>) -> Self {
        Self::with_root(conn, DEFAULT_LOCK_ROOT, name, LockMode::Write)
    }

    /// Shared (semaphore) read request.
    pub fn shared_read(conn: Connection, name: impl Into<String>) -> Self {
        Self::with_root(conn, DEFAULT_LOCK_ROOT, name, LockMode::Read)
    }

    /// Shared (semaphore) write request. Same ordering as an exclusive lock.
    pub fn shared_write(conn: Connection, name: impl Into<String>) -> Self {
        Self::with_root(conn, DEFAULT_LOCK_ROOT, name, LockMode::Write)
    }

    pub fn with_root(
        conn: Connection,
        root: impl Into<String>,
        name: impl Into<String>,
        mode: LockMode,
    ) -> Self {
        let root = root.into();
        let name = name.into();
        assert!(
            !name.is_empty() && !name.contains('/'),
            "lock name must be a single non-empty path component"
        );
        Self {
            conn,
            root,
            name,
            mode,
            held: Mutex::new(None),
        }
    }

    fn dir(&self) -> String {
        format!("{}/{}", self.root, self.name)
    }

    pub fn is_locked(&self) -> bool {
        self.held.lock().expect("lock mutex poisoned").is_some()
    }

    /// Full path of the node created at acquisition, while held.
    pub fn lock_path(&self) -> Option<String> {
        self.held
            .lock()
            .expect("lock mutex poisoned")
            .as_ref()
            .map(|held| held.path.clone())
    }

    ///
    /// Attempts to acquire the lock. Non-blocking mode deletes the contender
    /// node and reports `Ok(false)` on contention. Blocking mode suspends on
    /// the immediately blocking sibling and re-evaluates each time it goes
    /// away; a session interruption while waiting fails the acquire with
    /// the corresponding session error (the caller decides whether to
    /// retry), deleting the abandoned contender node best-effort.
    ///
    pub async fn lock(&self, blocking: bool) -> Result<bool, LockError> {
        if self.is_locked() {
            return Err(LockError::AlreadyHeld);
        }
        let dir = self.dir();
        self.conn.ensure_node(&self.root).await?;
        self.conn.ensure_node(&dir).await?;
        let dir_stat = self
            .conn
            .exists(&dir, false)
            .await?
            .ok_or_else(|| CoordError::NoNode(dir.clone()))?;
        let root_token = dir_stat.czxid;

        let me = self
            .conn
            .create(
                &format!("{dir}/{}-", self.mode.prefix()),
                &[],
                CreateMode::EphemeralSequential,
            )
            .await?;
        let my_seq = sequence_of(&me)?;
        trace!("created lock contender {me}");

        loop {
            let children = self.conn.get_children(&dir, false).await?;
            match next_blocker(self.mode, &children, my_seq) {
                None => {
                    info!("acquired lock {me}");
                    *self.held.lock().expect("lock mutex poisoned") = Some(HeldLock {
                        path: me,
                        root_token,
                    });
                    return Ok(true);
                }
                Some(blocker) => {
                    if !blocking {
                        let _ = self.conn.delete(&me, None).await;
                        return Ok(false);
                    }
                    let blocker_path = format!("{dir}/{blocker}");
                    trace!("lock contender {me} waiting on {blocker_path}");
                    if let Err(e) = self.conn.await_removal(&blocker_path).await {
                        // The waiter node must not linger as a phantom
                        // contender; on expiry the service already removed
                        // it.
                        let _ = self.conn.delete(&me, None).await;
                        return Err(e.into());
                    }
                }
            }
        }
    }

    ///
    /// Releases the lock by deleting the node created at acquisition.
    /// Returns whether a deletion actually occurred; releasing an
    /// already-released lock reports `Ok(false)`, not an error.
    ///
    pub async fn unlock(&self) -> Result<bool, LockError> {
        let Some(held) = self.held.lock().expect("lock mutex poisoned").take() else {
            return Ok(false);
        };
        match self.conn.delete(&held.path, None).await {
            Ok(()) => {
                info!("released lock {}", held.path);
                Ok(true)
            }
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => {
                // Deletion did not happen; keep the claim so the caller can
                // retry or assert.
                *self.held.lock().expect("lock mutex poisoned") = Some(held);
                Err(e.into())
            }
        }
    }

    ///
    /// Validates that this handle still holds the lock. Fails if the owning
    /// connection is not connected, the lock was never acquired, the lock
    /// node no longer exists, or the lock directory's creation token differs
    /// from the one captured at acquisition (the directory was deleted and
    /// recreated, silently invalidating sequence ordering). A long-running
    /// critical section calls this to detect that it has lost the lock out
    /// from under it and must stop.
    ///
    pub async fn assert_held(&self) -> Result<(), LockAssertError> {
        if !self.conn.is_connected() {
            return Err(LockAssertError::NotConnected);
        }
        let held = self
            .held
            .lock()
            .expect("lock mutex poisoned")
            .clone()
            .ok_or(LockAssertError::NotAcquired)?;
        if self.conn.exists(&held.path, false).await?.is_none() {
            return Err(LockAssertError::NodeGone);
        }
        match self.conn.exists(&self.dir(), false).await? {
            Some(stat) if stat.czxid == held.root_token => Ok(()),
            _ => Err(LockAssertError::RootReplaced),
        }
    }

}

///
/// The closest lower-sequence sibling a request must wait behind, or `None`
/// when the lock is granted. `Write` requests yield to any lower sibling;
/// `Read` requests yield only to lower `write` siblings.
///
fn next_blocker(mode: LockMode, children: &[String], my_seq: i64) -> Option<String> {
    children
        .iter()
        .filter_map(|name| split_sequence(name).map(|(prefix, seq)| (prefix, seq, name)))
        .filter(|(prefix, seq, _)| {
            *seq < my_seq
                && match mode {
                    LockMode::Write => true,
                    LockMode::Read => *prefix == "write",
                }
        })
        .max_by_key(|(_, seq, _)| *seq)
        .map(|(_, _, name)| name.clone())
}

fn sequence_of(path: &str) -> Result<i64, CoordError> {
    let name = path.rsplit('/').next().unwrap_or(path);
    split_sequence(name)
        .map(|(_, seq)| seq)
        .ok_or_else(|| CoordError::BadPath(path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sequence_of_extracts_the_numeric_suffix() {
        assert_eq!(sequence_of("/_locks/a/write-0000000007").ok(), Some(7));
        assert!(sequence_of("/_locks/a/garbage").is_err());
    }

    #[test]
    fn write_request_waits_on_its_immediate_predecessor() {
        let children = names(&["write-0000000001", "write-0000000003", "write-0000000005"]);
        assert_eq!(
            next_blocker(LockMode::Write, &children, 5),
            Some("write-0000000003".to_string())
        );
        assert_eq!(next_blocker(LockMode::Write, &children, 1), None);
    }

    #[test]
    fn read_request_only_waits_on_lower_writes() {
        let children = names(&[
            "read-0000000001",
            "read-0000000002",
            "write-0000000003",
            "read-0000000004",
        ]);
        // Reads ahead of any write proceed together.
        assert_eq!(next_blocker(LockMode::Read, &children, 2), None);
        // A read behind a pending write waits on that write, not on the
        // intervening read.
        assert_eq!(
            next_blocker(LockMode::Read, &children, 4),
            Some("write-0000000003".to_string())
        );
        // The write itself waits on the closest lower sibling of any mode.
        assert_eq!(
            next_blocker(LockMode::Write, &children, 3),
            Some("read-0000000002".to_string())
        );
    }

    #[test]
    fn unparsable_siblings_are_ignored() {
        let children = names(&["write-0000000001", "not_a_lock_node"]);
        assert_eq!(
            next_blocker(LockMode::Write, &children, 2),
            Some("write-0000000001".to_string())
        );
    }
}

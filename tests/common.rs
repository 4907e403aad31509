use std::time::{Duration, Instant};

use rust_coord_utils::{memory::MemoryCluster, session::Connection};

pub fn cluster() -> MemoryCluster {
    MemoryCluster::new()
}

pub async fn connect(cluster: &MemoryCluster) -> Connection {
    Connection::connect(&cluster.connector())
        .await
        .expect("failed to connect to memory cluster")
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Polls `cond` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

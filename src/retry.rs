use {
    crate::client::{CoordError, RawClient, Stat},
    retry::delay::Exponential,
    std::{future::Future, sync::Arc, time::Duration},
    tracing::{error, warn},
};

///
/// Whether an error may be retried.
///
/// Only faults caused by "outside" forces that can heal on their own are
/// transient. Session expiry is final (the service has already dropped the
/// session's ephemerals) and logical errors would fail again identically.
///
pub fn is_transient(err: &CoordError) -> bool {
    matches!(err, CoordError::ConnectionLoss | CoordError::OperationTimeout)
}

pub async fn retry_coord_exists(
    client: Arc<dyn RawClient>,
    path: String,
) -> Result<Option<Stat>, CoordError> {
    retry_coord(client, (path,), move |client, (path,)| async move {
        client.exists(&path, false).await
    })
    .await
}

pub async fn retry_coord_children(
    client: Arc<dyn RawClient>,
    path: String,
) -> Result<Vec<String>, CoordError> {
    retry_coord(client, (path,), move |client, (path,)| async move {
        client.get_children(&path, false).await
    })
    .await
}

///
/// Retry a coordination-service operation by capturing reusable args and a
/// closure that computes the future to try.
///
/// Retries only on transient errors as classified by [`is_transient`]; any
/// other error is returned to the caller on the first occurrence. Callers
/// must only hand in idempotent operations: retrying a sequential create
/// after an ambiguous failure could leave a duplicate node behind.
///
pub async fn retry_coord<A, T, F, Fut>(
    client: Arc<dyn RawClient>,
    reusable_args: A,
    f: F,
) -> Result<T, CoordError>
where
    A: Clone + Send + 'static,
    Fut: Future<Output = Result<T, CoordError>> + Send,
    F: FnMut(Arc<dyn RawClient>, A) -> Fut,
    T: Send + 'static,
{
    let retry_strategy = Exponential::from_millis_with_factor(10, 10.0).take(3);
    retry_coord_with_strategy(client, reusable_args, retry_strategy, f).await
}

pub async fn retry_coord_with_strategy<A, T, F, Fut>(
    client: Arc<dyn RawClient>,
    reusable_args: A,
    retry_strategy: impl IntoIterator<Item = Duration>,
    mut f: F,
) -> Result<T, CoordError>
where
    A: Clone + Send + 'static,
    Fut: Future<Output = Result<T, CoordError>> + Send,
    F: FnMut(Arc<dyn RawClient>, A) -> Fut,
    T: Send + 'static,
{
    let mut retry_strategy = retry_strategy.into_iter();
    loop {
        match f(Arc::clone(&client), reusable_args.clone()).await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if is_transient(&e) {
                    warn!("failed due to transient state {:?}", e);
                    match retry_strategy.next() {
                        Some(duration) => {
                            tokio::time::sleep(duration).await;
                        }
                        None => return Err(e),
                    }
                } else {
                    error!("failed due to non-transient state: {:?}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{client::Connector, memory::MemoryCluster},
        retry::delay::Fixed,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connection_loss_is_retried_until_it_heals() {
        let cluster = MemoryCluster::new();
        let raw = cluster
            .connector()
            .connect()
            .await
            .expect("failed to connect");
        let session = raw.client.session_id();

        cluster.disconnect_session(session);
        let cluster2 = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cluster2.reconnect_session(session);
        });

        let result = retry_coord_with_strategy(
            Arc::clone(&raw.client),
            ("/".to_string(),),
            Fixed::from_millis(25).take(20),
            |client, (path,)| async move { client.exists(&path, false).await },
        )
        .await;
        assert!(result.expect("retry should outlast the outage").is_some());
    }

    #[tokio::test]
    async fn logical_errors_are_returned_on_the_first_attempt() {
        let cluster = MemoryCluster::new();
        let raw = cluster
            .connector()
            .connect()
            .await
            .expect("failed to connect");

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = Arc::clone(&attempts);
        let result = retry_coord(Arc::clone(&raw.client), (), move |client, ()| {
            attempts2.fetch_add(1, Ordering::SeqCst);
            async move { client.get_children("/missing", false).await }
        })
        .await;
        assert_eq!(result, Err(CoordError::NoNode("/missing".to_string())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_expiry_is_final() {
        assert!(!is_transient(&CoordError::SessionExpired));
        assert!(!is_transient(&CoordError::Closed));
        assert!(is_transient(&CoordError::ConnectionLoss));
        assert!(is_transient(&CoordError::OperationTimeout));
    }
}

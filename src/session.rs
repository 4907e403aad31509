use {
    crate::{
        client::{
            Connector, CoordError, CreateMode, RawClient, RawNotification, RawSession,
            SessionState, Stat, WatchedEvent,
        },
        sync::SyncBridge,
        watcher::{DeliveryMode, EventDispatcher, InterestFilter, SubscriptionHandle},
        SessionId,
    },
    serde::{de::DeserializeOwned, Serialize},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    tokio::{sync::watch, task::JoinHandle},
    tokio_stream::wrappers::WatchStream,
    tracing::{trace, warn},
};

struct ConnectionInner {
    client: Arc<dyn RawClient>,
    dispatcher: EventDispatcher,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    closed: AtomicBool,
    drain: Mutex<Option<JoinHandle<()>>>,
}

///
/// An established session to the coordination service.
///
/// Cloning is cheap and shares the underlying session. A connection owns the
/// single drain task that moves raw notifications from the wire channel into
/// its [`EventDispatcher`], preserving the per-session order the service
/// delivered them in. The pool's lease discipline is what keeps two
/// application operations from using one connection concurrently; nothing
/// here enforces it.
///
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub async fn connect(connector: &dyn Connector) -> Result<Self, CoordError> {
        let RawSession {
            client,
            mut notifications,
        } = connector.connect().await?;
        let dispatcher = EventDispatcher::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        let state_tx = Arc::new(state_tx);

        let dispatcher2 = dispatcher.clone();
        let state_tx2 = Arc::clone(&state_tx);
        let session_id = client.session_id();
        let drain = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                if let RawNotification::State(state) = &notification {
                    state_tx2.send_replace(*state);
                }
                dispatcher2.dispatch(&notification);
            }
            trace!("notification channel for session {session_id} closed");
        });

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                client,
                dispatcher,
                state_tx,
                state_rx,
                closed: AtomicBool::new(false),
                drain: Mutex::new(Some(drain)),
            }),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.client.session_id()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Stream of session-state transitions, starting from the current state.
    pub fn state_stream(&self) -> WatchStream<SessionState> {
        WatchStream::new(self.inner.state_rx.clone())
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        self.inner.client.create(path, data, mode).await
    }

    pub async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<(), CoordError> {
        self.inner.client.delete(path, expected_version).await
    }

    pub async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>, CoordError> {
        self.inner.client.exists(path, watch).await
    }

    pub async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), CoordError> {
        self.inner.client.get_data(path, watch).await
    }

    pub async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<Stat, CoordError> {
        self.inner.client.set_data(path, data, expected_version).await
    }

    pub async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, CoordError> {
        self.inner.client.get_children(path, watch).await
    }

    /// Reads a node and deserializes its payload as JSON.
    pub async fn get_json<T>(&self, path: &str) -> Result<T, CoordError>
    where
        T: DeserializeOwned,
    {
        let (data, _stat) = self.get_data(path, false).await?;
        serde_json::from_slice(&data).map_err(|e| CoordError::Payload(e.to_string()))
    }

    /// Serializes `value` as JSON into a node's payload.
    pub async fn set_json<T>(
        &self,
        path: &str,
        value: &T,
        expected_version: Option<i64>,
    ) -> Result<Stat, CoordError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec(value).map_err(|e| CoordError::Payload(e.to_string()))?;
        self.set_data(path, &data, expected_version).await
    }

    ///
    /// Subscribes to node events on `path`. See
    /// [`EventDispatcher::register`].
    ///
    pub fn subscribe(
        &self,
        path: impl Into<String>,
        filter: InterestFilter,
        mode: DeliveryMode,
        callback: impl Fn(&WatchedEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.inner.dispatcher.register(path, filter, mode, callback)
    }

    pub fn subscribe_state(
        &self,
        mode: DeliveryMode,
        callback: impl Fn(SessionState) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.inner.dispatcher.register_state(mode, callback)
    }

    /// See [`EventDispatcher::prepare_for_fork`].
    pub async fn prepare_for_fork(&self) {
        self.inner.dispatcher.prepare_for_fork().await;
    }

    /// See [`EventDispatcher::resume_after_fork`].
    pub fn resume_after_fork(&self) {
        self.inner.dispatcher.resume_after_fork();
    }

    ///
    /// Suspends until `path` no longer exists, using a one-shot watch on
    /// exactly that node. Returns immediately if the node is already absent.
    /// Fails with the corresponding session error if the session leaves the
    /// connected state while waiting; it never silently retries across a
    /// session interruption.
    ///
    pub async fn await_removal(&self, path: &str) -> Result<(), CoordError> {
        let bridge = Arc::new(SyncBridge::<()>::new());

        let wake = Arc::clone(&bridge);
        let node_sub = self.subscribe(path, InterestFilter::ALL, DeliveryMode::Inline, move |_| {
            wake.push(());
        });
        let interrupt = Arc::clone(&bridge);
        let state_sub = self.subscribe_state(DeliveryMode::Inline, move |state| {
            if state.is_interruption() {
                interrupt.fail(CoordError::from_interruption(state));
            }
        });

        let result = async {
            loop {
                let current = self.state();
                if current.is_interruption() {
                    return Err(CoordError::from_interruption(current));
                }
                bridge.clear();
                if self.exists(path, true).await?.is_none() {
                    return Ok(());
                }
                // Wakes on the watch firing for this node, or fails on a
                // session interruption.
                bridge.pop().await?;
            }
        }
        .await;

        node_sub.unsubscribe();
        state_sub.unsubscribe();
        result
    }

    /// Creates a persistent node if absent. Not a recursive mkdir.
    pub(crate) async fn ensure_node(&self, path: &str) -> Result<(), CoordError> {
        match self.create(path, &[], CreateMode::Persistent).await {
            Ok(_) => Ok(()),
            Err(CoordError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    ///
    /// Closes the session. Idempotent; returns once the final notifications
    /// (including the terminal state transition) have been dispatched and
    /// the drain task has exited. Must not be called from inside a
    /// subscription callback running inline on this connection's drain task.
    ///
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.client.close().await {
            warn!("error closing session {}: {e}", self.session_id());
        }
        let drain = self
            .inner
            .drain
            .lock()
            .expect("drain mutex poisoned")
            .take();
        if let Some(handle) = drain {
            let _ = handle.await;
        }
        // The backend normally reports Closed itself; make sure local state
        // agrees even if the channel just dropped.
        self.inner.state_tx.send_replace(SessionState::Closed);
        self.inner.dispatcher.shutdown();
    }
}

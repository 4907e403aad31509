use {
    crate::client::{EventKind, RawNotification, SessionState, WatchedEvent},
    std::{
        collections::HashMap,
        ops::BitOr,
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex, Weak,
        },
    },
    tokio::sync::{mpsc, watch, Notify},
    tracing::{error, trace},
};

///
/// Explicit set of node event kinds a subscription is interested in.
///
/// Compose with `|`: `InterestFilter::CREATED | InterestFilter::DELETED`.
/// Registering with an empty filter is a programming error and panics.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestFilter(u8);

impl InterestFilter {
    /// Identity for `|`-composition. Not a valid filter to register with.
    pub const NONE: InterestFilter = InterestFilter(0);
    pub const CREATED: InterestFilter = InterestFilter(1 << 0);
    pub const DELETED: InterestFilter = InterestFilter(1 << 1);
    pub const CHANGED: InterestFilter = InterestFilter(1 << 2);
    pub const CHILD: InterestFilter = InterestFilter(1 << 3);
    pub const ALL: InterestFilter = InterestFilter(0b1111);

    pub fn contains(self, kind: EventKind) -> bool {
        let bit = match kind {
            EventKind::Created => Self::CREATED,
            EventKind::Deleted => Self::DELETED,
            EventKind::Changed => Self::CHANGED,
            EventKind::Child => Self::CHILD,
        };
        self.0 & bit.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InterestFilter {
    type Output = InterestFilter;

    fn bitor(self, rhs: InterestFilter) -> InterestFilter {
        InterestFilter(self.0 | rhs.0)
    }
}

///
/// How a subscription's callback is invoked.
///
/// `Inline` runs on the session's drain task and therefore serializes all
/// delivery for the session; callbacks must not block for long. `Ordered`
/// gives the subscription a private queue and worker task: per-subscription
/// order is preserved, a callback never runs concurrently with itself, and
/// one slow subscription cannot delay delivery to unrelated ones.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Inline,
    Ordered,
}

enum Notice {
    Node(WatchedEvent),
    State(SessionState),
}

type Callback = Arc<dyn Fn(&Notice) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(u64, &str) + Send + Sync>;

struct OrderedWorker {
    tx: mpsc::UnboundedSender<Notice>,
    cancelled: Arc<AtomicBool>,
}

enum Delivery {
    Inline(Callback),
    Ordered(OrderedWorker),
}

struct SubEntry {
    id: u64,
    filter: InterestFilter,
    delivery: Delivery,
}

#[derive(Default)]
struct Registry {
    by_path: HashMap<String, Vec<SubEntry>>,
    state_subs: Vec<SubEntry>,
}

#[derive(Debug, Clone)]
enum Target {
    Path(String),
    State,
}

struct Shared {
    registry: Mutex<Registry>,
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
    /// Ordered deliveries currently executing a callback.
    in_flight: AtomicUsize,
    quiescent: Notify,
    on_error: Mutex<Option<ErrorHook>>,
    next_id: AtomicU64,
}

///
/// Routes raw session notifications to registered subscriptions.
///
/// Subscriptions on the same path are invoked in registration order with the
/// same event. Registration and dispatch never race: the registry lock is
/// held only while resolving the recipient list, never across a callback, so
/// a callback may freely unsubscribe itself or register new subscriptions.
///
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<Shared>,
}

///
/// Handle returned by registration. `unsubscribe` is idempotent and safe to
/// call from within the subscription's own callback; after it returns, no
/// new delivery to the subscription begins (an ordered delivery already
/// executing may complete). Dropping the handle does not unsubscribe.
///
pub struct SubscriptionHandle {
    shared: Weak<Shared>,
    target: Target,
    id: u64,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let removed = {
            let mut registry = shared.registry.lock().expect("registry mutex poisoned");
            let subs = match &self.target {
                Target::Path(path) => registry.by_path.get_mut(path),
                Target::State => Some(&mut registry.state_subs),
            };
            let removed = subs.and_then(|subs| {
                subs.iter()
                    .position(|entry| entry.id == self.id)
                    .map(|idx| subs.remove(idx))
            });
            if let Target::Path(path) = &self.target {
                if registry
                    .by_path
                    .get(path)
                    .is_some_and(|subs| subs.is_empty())
                {
                    registry.by_path.remove(path);
                }
            }
            removed
        };
        if let Some(entry) = removed {
            if let Delivery::Ordered(worker) = entry.delivery {
                worker.cancelled.store(true, Ordering::Release);
            }
            trace!("unsubscribed subscription {}", self.id);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (paused_tx, paused_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                paused_tx,
                paused_rx,
                in_flight: AtomicUsize::new(0),
                quiescent: Notify::new(),
                on_error: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    ///
    /// Subscribes `callback` to node events on `path` whose kind is named by
    /// `filter`. Panics if the filter is empty.
    ///
    pub fn register(
        &self,
        path: impl Into<String>,
        filter: InterestFilter,
        mode: DeliveryMode,
        callback: impl Fn(&WatchedEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        assert!(
            !filter.is_empty(),
            "interest filter must name at least one event kind"
        );
        let cb: Callback = Arc::new(move |notice| {
            if let Notice::Node(event) = notice {
                callback(event);
            }
        });
        self.insert(Target::Path(path.into()), filter, mode, cb)
    }

    /// Subscribes `callback` to session-state transitions.
    pub fn register_state(
        &self,
        mode: DeliveryMode,
        callback: impl Fn(SessionState) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let cb: Callback = Arc::new(move |notice| {
            if let Notice::State(state) = notice {
                callback(*state);
            }
        });
        self.insert(Target::State, InterestFilter::ALL, mode, cb)
    }

    ///
    /// Installs the handler that receives subscription callback panics
    /// (subscription id plus panic message). Without one, panics are logged
    /// and dropped; they never take down the drain task or another
    /// subscription's worker.
    ///
    pub fn set_error_hook(&self, hook: impl Fn(u64, &str) + Send + Sync + 'static) {
        *self
            .shared
            .on_error
            .lock()
            .expect("error hook mutex poisoned") = Some(Arc::new(hook));
    }

    /// Routes one raw notification to every matching subscription.
    pub fn dispatch(&self, notification: &RawNotification) {
        match notification {
            RawNotification::Node(event) => self.dispatch_node(event),
            RawNotification::State(state) => self.dispatch_state(*state),
        }
    }

    ///
    /// Pauses every ordered worker and waits until no callback is executing.
    /// The host calls this before an OS-level process duplication so no
    /// running worker leaks into the child; pair with
    /// [`resume_after_fork`](EventDispatcher::resume_after_fork) in the
    /// parent.
    ///
    pub async fn prepare_for_fork(&self) {
        self.shared.paused_tx.send_replace(true);
        loop {
            let notified = self.shared.quiescent.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
    }

    pub fn resume_after_fork(&self) {
        self.shared.paused_tx.send_replace(false);
    }

    /// Removes every subscription and stops all ordered workers.
    pub fn shutdown(&self) {
        let mut guard = self
            .shared
            .registry
            .lock()
            .expect("registry mutex poisoned");
        let registry = &mut *guard;
        let drained = registry
            .by_path
            .drain()
            .flat_map(|(_, subs)| subs)
            .chain(registry.state_subs.drain(..));
        for entry in drained {
            if let Delivery::Ordered(worker) = entry.delivery {
                worker.cancelled.store(true, Ordering::Release);
            }
        }
    }

    fn insert(
        &self,
        target: Target,
        filter: InterestFilter,
        mode: DeliveryMode,
        callback: Callback,
    ) -> SubscriptionHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let delivery = match mode {
            DeliveryMode::Inline => Delivery::Inline(callback),
            DeliveryMode::Ordered => Delivery::Ordered(self.spawn_worker(id, callback)),
        };
        let entry = SubEntry {
            id,
            filter,
            delivery,
        };
        {
            let mut registry = self
                .shared
                .registry
                .lock()
                .expect("registry mutex poisoned");
            match &target {
                Target::Path(path) => registry
                    .by_path
                    .entry(path.clone())
                    .or_default()
                    .push(entry),
                Target::State => registry.state_subs.push(entry),
            }
        }
        SubscriptionHandle {
            shared: Arc::downgrade(&self.shared),
            target,
            id,
        }
    }

    fn spawn_worker(&self, id: u64, callback: Callback) -> OrderedWorker {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notice>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled2 = Arc::clone(&cancelled);
        let shared = Arc::clone(&self.shared);
        let mut paused_rx = self.shared.paused_rx.clone();
        tokio::spawn(async move {
            'outer: while let Some(notice) = rx.recv().await {
                // Claim an in-flight slot before consulting the pause flag:
                // prepare_for_fork must either see the claim or this worker
                // must see the pause, never neither.
                loop {
                    if cancelled2.load(Ordering::Acquire) {
                        break 'outer;
                    }
                    shared.in_flight.fetch_add(1, Ordering::AcqRel);
                    if !*paused_rx.borrow() {
                        break;
                    }
                    if shared.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                        shared.quiescent.notify_waiters();
                    }
                    if paused_rx.changed().await.is_err() {
                        break 'outer;
                    }
                }
                let result = catch_unwind(AssertUnwindSafe(|| callback(&notice)));
                if let Err(payload) = result {
                    report_panic(&shared, id, payload);
                }
                if shared.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    shared.quiescent.notify_waiters();
                }
            }
            trace!("ordered subscription worker {id} exiting");
        });
        OrderedWorker { tx, cancelled }
    }

    fn dispatch_node(&self, event: &WatchedEvent) {
        let recipients = {
            let registry = self.shared.registry.lock().expect("registry mutex poisoned");
            match registry.by_path.get(&event.path) {
                Some(subs) => subs
                    .iter()
                    .filter(|entry| entry.filter.contains(event.kind))
                    .map(recipient)
                    .collect::<Vec<_>>(),
                None => return,
            }
        };
        for (id, delivery) in recipients {
            self.deliver(id, delivery, || Notice::Node(event.clone()));
        }
    }

    fn dispatch_state(&self, state: SessionState) {
        let recipients = {
            let registry = self.shared.registry.lock().expect("registry mutex poisoned");
            registry
                .state_subs
                .iter()
                .map(recipient)
                .collect::<Vec<_>>()
        };
        for (id, delivery) in recipients {
            self.deliver(id, delivery, || Notice::State(state));
        }
    }

    fn deliver(&self, id: u64, delivery: Dispatchee, notice: impl FnOnce() -> Notice) {
        match delivery {
            Dispatchee::Inline(cb) => {
                let notice = notice();
                let result = catch_unwind(AssertUnwindSafe(|| cb(&notice)));
                if let Err(payload) = result {
                    report_panic(&self.shared, id, payload);
                }
            }
            Dispatchee::Ordered(tx) => {
                // Worker gone means the subscription was removed; drop the
                // event.
                let _ = tx.send(notice());
            }
        }
    }
}

enum Dispatchee {
    Inline(Callback),
    Ordered(mpsc::UnboundedSender<Notice>),
}

fn recipient(entry: &SubEntry) -> (u64, Dispatchee) {
    let dispatchee = match &entry.delivery {
        Delivery::Inline(cb) => Dispatchee::Inline(Arc::clone(cb)),
        Delivery::Ordered(worker) => Dispatchee::Ordered(worker.tx.clone()),
    };
    (entry.id, dispatchee)
}

fn report_panic(shared: &Arc<Shared>, id: u64, payload: Box<dyn std::any::Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .map(str::to_owned)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "subscription callback panicked".to_owned());
    let hook = shared
        .on_error
        .lock()
        .expect("error hook mutex poisoned")
        .clone();
    match hook {
        Some(hook) => hook(id, &message),
        None => error!("subscription {id} callback panicked: {message}"),
    }
}

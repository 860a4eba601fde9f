//! Single-writer I/O value cache.
//!
//! # Overview
//! The authoritative last-write-wins store for named, typed values shared by
//! every transport bridge. Two independent namespaces (inputs and outputs)
//! map a name to its latest value; "X" as an input and "X" as an output are
//! unrelated entities.
//!
//! All access is funneled through a bounded multi-producer queue drained by
//! exactly one worker thread (`iocache`), which owns the value maps and the
//! listener registry. Handlers therefore never run concurrently with each
//! other, and no locking is needed around the shared state.
//!
//! # Ordering
//! Events are applied in strict arrival order. Events submitted by one
//! producer are applied in that producer's submission order; no stronger
//! ordering is promised across independent producers. In particular, a
//! producer that submits a snapshot request followed by a register request
//! sees them applied in that order, so a new subscriber transitions from
//! replayed state to the live stream with nothing dropped or duplicated.
//!
//! # Backpressure
//! Submission blocks the calling thread while the queue is full. That is
//! deliberate: a stalled consumer slows producers down instead of dropping
//! or reordering their updates. No cache operation reports failure to the
//! caller and none returns a value; snapshot replays and notifications are
//! delivered later, on the worker thread.
//!
//! # Listeners
//! Listener callbacks run on the worker thread and must stay cheap and
//! non-blocking. Bridges hand notifications off to their own outbound queues
//! instead of doing network I/O in the callback; a listener that returns an
//! error is logged and skipped without disturbing the store or the other
//! listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

/// Default number of slots in the event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// The two independent namespaces of named values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Input,
    Output,
}

/// Opaque identity of the causal connection behind a mutation.
///
/// Every mutation carries the origin of the connection that produced it, and
/// every notification hands it back out. A bridge that is both a producer and
/// a listener compares origins to suppress re-emission of its own updates;
/// that comparison is by token identity, never by payload equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin(u64);

impl Origin {
    /// Sentinel attached to snapshot replays: "current known value, not a
    /// live update". Distinct from every token handed out by [`Origin::unique`],
    /// so a bridge never mistakes replayed state for its own echo.
    pub const CACHE: Origin = Origin(0);

    /// Allocates a fresh token, unique for the lifetime of the process.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Origin(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_cache(self) -> bool {
        self == Self::CACHE
    }
}

/// Notification capability implemented by anything interested in cache
/// updates. Payload length travels with the value slice.
///
/// Both methods run on the cache worker thread. Returning an error marks the
/// delivery as failed for this listener only; dispatch continues with the
/// remaining listeners.
pub trait IoCacheListener: Send + Sync {
    fn on_input(&self, name: &str, data_type: &str, value: &[u8], origin: Origin)
    -> eyre::Result<()>;
    fn on_output(
        &self,
        name: &str,
        data_type: &str,
        value: &[u8],
        origin: Origin,
    ) -> eyre::Result<()>;
}

/// Listeners are shared, compared and removed by identity.
pub type ListenerRef = Arc<dyn IoCacheListener>;

/// Latest known value for one name within a namespace. Overwritten in place
/// on every write, reusing the existing buffer capacity where it suffices.
#[derive(Debug, Default)]
struct IoValue {
    data_type: String,
    value: Vec<u8>,
}

impl IoValue {
    fn set(&mut self, data_type: &str, value: &[u8]) {
        self.data_type.clear();
        self.data_type.push_str(data_type);
        self.value.clear();
        self.value.extend_from_slice(value);
    }
}

enum CacheEvent {
    SetInput {
        name: String,
        data_type: String,
        value: Vec<u8>,
        origin: Origin,
    },
    SetOutput {
        name: String,
        data_type: String,
        value: Vec<u8>,
        origin: Origin,
    },
    Register(ListenerRef),
    Deregister(ListenerRef),
    SnapshotInputs(ListenerRef),
    SnapshotOutputs(ListenerRef),
    Shutdown,
    #[cfg(test)]
    ListenerCount(std::sync::mpsc::Sender<usize>),
}

/// Handle to the cache engine. Cheap to share behind an [`Arc`]; all methods
/// take `&self` and enqueue work for the worker thread.
pub struct IoCache {
    tx: Sender<CacheEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IoCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Starts the worker thread with an event queue of `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        let handle = std::thread::Builder::new()
            .name("iocache".to_string())
            .spawn(move || CacheWorker::default().run(rx))
            .expect("failed to spawn iocache worker thread");
        Self {
            tx,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Upserts the input `name` and notifies every registered listener.
    /// Blocks while the event queue is full; never reports failure.
    pub fn set_input(&self, name: &str, data_type: &str, value: &[u8], origin: Origin) {
        self.submit(CacheEvent::SetInput {
            name: name.to_string(),
            data_type: data_type.to_string(),
            value: value.to_vec(),
            origin,
        });
    }

    /// Upserts the output `name` and notifies every registered listener.
    /// Blocks while the event queue is full; never reports failure.
    pub fn set_output(&self, name: &str, data_type: &str, value: &[u8], origin: Origin) {
        self.submit(CacheEvent::SetOutput {
            name: name.to_string(),
            data_type: data_type.to_string(),
            value: value.to_vec(),
            origin,
        });
    }

    /// Adds `listener` to the registry. Idempotent: registering a listener
    /// that is already present has no additional effect.
    pub fn register_listener(&self, listener: ListenerRef) {
        self.submit(CacheEvent::Register(listener));
    }

    /// Removes `listener` from the registry. Idempotent and safe when the
    /// listener was never registered.
    pub fn deregister_listener(&self, listener: ListenerRef) {
        self.submit(CacheEvent::Deregister(listener));
    }

    /// Schedules a replay of every current input to `listener`, delivered on
    /// the worker thread with [`Origin::CACHE`].
    pub fn snapshot_inputs(&self, listener: ListenerRef) {
        self.submit(CacheEvent::SnapshotInputs(listener));
    }

    /// Schedules a replay of every current output to `listener`, delivered on
    /// the worker thread with [`Origin::CACHE`].
    pub fn snapshot_outputs(&self, listener: ListenerRef) {
        self.submit(CacheEvent::SnapshotOutputs(listener));
    }

    fn submit(&self, event: CacheEvent) {
        // send() blocks while the queue is full; it only errors once the
        // worker has stopped, after which events are dropped on the floor
        if self.tx.send(event).is_err() {
            warn!("Cache worker is stopped; event dropped");
        }
    }

    /// Stops the engine: every event submitted before this call is drained in
    /// order, then the worker exits and is joined. Submissions racing with or
    /// following shutdown are logged and dropped.
    pub fn shutdown(&self) {
        if self.tx.send(CacheEvent::Shutdown).is_err() {
            debug!("Cache worker already stopped");
        }
        let handle = self
            .worker
            .lock()
            .expect("cache worker handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Cache worker thread panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        let (tx, rx) = std::sync::mpsc::channel();
        self.submit(CacheEvent::ListenerCount(tx));
        rx.recv().expect("cache worker stopped")
    }
}

impl Default for IoCache {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned exclusively by the worker thread.
#[derive(Default)]
struct CacheWorker {
    inputs: HashMap<String, IoValue>,
    outputs: HashMap<String, IoValue>,
    // insertion-ordered; uniqueness by Arc identity
    listeners: Vec<ListenerRef>,
}

impl CacheWorker {
    fn run(mut self, rx: Receiver<CacheEvent>) {
        info!("Cache worker started");
        while let Ok(event) = rx.recv() {
            match event {
                CacheEvent::SetInput {
                    name,
                    data_type,
                    value,
                    origin,
                } => self.handle_set(Namespace::Input, name, data_type, value, origin),
                CacheEvent::SetOutput {
                    name,
                    data_type,
                    value,
                    origin,
                } => self.handle_set(Namespace::Output, name, data_type, value, origin),
                CacheEvent::Register(listener) => self.handle_register(listener),
                CacheEvent::Deregister(listener) => self.handle_deregister(&listener),
                CacheEvent::SnapshotInputs(listener) => {
                    self.handle_snapshot(Namespace::Input, &listener)
                }
                CacheEvent::SnapshotOutputs(listener) => {
                    self.handle_snapshot(Namespace::Output, &listener)
                }
                CacheEvent::Shutdown => break,
                #[cfg(test)]
                CacheEvent::ListenerCount(tx) => {
                    let _ = tx.send(self.listeners.len());
                }
            }
        }
        info!("Cache worker stopped");
    }

    fn handle_set(
        &mut self,
        namespace: Namespace,
        name: String,
        data_type: String,
        value: Vec<u8>,
        origin: Origin,
    ) {
        let store = match namespace {
            Namespace::Input => &mut self.inputs,
            Namespace::Output => &mut self.outputs,
        };
        match store.get_mut(&name) {
            Some(slot) => slot.set(&data_type, &value),
            None => {
                let mut slot = IoValue::default();
                slot.set(&data_type, &value);
                store.insert(name.clone(), slot);
            }
        }
        debug!(?namespace, %name, %data_type, len = value.len(), "Updated value");
        self.dispatch(namespace, &name, &data_type, &value, origin);
    }

    fn dispatch(
        &self,
        namespace: Namespace,
        name: &str,
        data_type: &str,
        value: &[u8],
        origin: Origin,
    ) {
        for listener in &self.listeners {
            // protect the dispatch loop from a failing listener
            if let Err(e) = deliver(listener, namespace, name, data_type, value, origin) {
                error!(error = %e, ?namespace, name, "Could not dispatch value to listener");
            }
        }
    }

    fn handle_register(&mut self, listener: ListenerRef) {
        if !self.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            self.listeners.push(listener);
        }
    }

    fn handle_deregister(&mut self, listener: &ListenerRef) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn handle_snapshot(&self, namespace: Namespace, listener: &ListenerRef) {
        let store = match namespace {
            Namespace::Input => &self.inputs,
            Namespace::Output => &self.outputs,
        };
        for (name, slot) in store {
            if let Err(e) = deliver(
                listener,
                namespace,
                name,
                &slot.data_type,
                &slot.value,
                Origin::CACHE,
            ) {
                error!(error = %e, ?namespace, %name, "Could not replay snapshot to listener");
            }
        }
    }
}

fn deliver(
    listener: &ListenerRef,
    namespace: Namespace,
    name: &str,
    data_type: &str,
    value: &[u8],
    origin: Origin,
) -> eyre::Result<()> {
    match namespace {
        Namespace::Input => listener.on_input(name, data_type, value, origin),
        Namespace::Output => listener.on_output(name, data_type, value, origin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Condvar;
    use std::sync::mpsc::{self, Receiver as StdReceiver};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Notification {
        namespace: Namespace,
        name: String,
        data_type: String,
        value: Vec<u8>,
        origin: Origin,
    }

    struct RecordingListener {
        events: mpsc::Sender<Notification>,
    }

    impl IoCacheListener for RecordingListener {
        fn on_input(
            &self,
            name: &str,
            data_type: &str,
            value: &[u8],
            origin: Origin,
        ) -> eyre::Result<()> {
            self.record(Namespace::Input, name, data_type, value, origin)
        }

        fn on_output(
            &self,
            name: &str,
            data_type: &str,
            value: &[u8],
            origin: Origin,
        ) -> eyre::Result<()> {
            self.record(Namespace::Output, name, data_type, value, origin)
        }
    }

    impl RecordingListener {
        fn record(
            &self,
            namespace: Namespace,
            name: &str,
            data_type: &str,
            value: &[u8],
            origin: Origin,
        ) -> eyre::Result<()> {
            self.events
                .send(Notification {
                    namespace,
                    name: name.to_string(),
                    data_type: data_type.to_string(),
                    value: value.to_vec(),
                    origin,
                })
                .map_err(|_| eyre::eyre!("test receiver dropped"))
        }
    }

    fn recording_listener() -> (ListenerRef, StdReceiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(RecordingListener { events: tx }), rx)
    }

    fn assert_no_event(rx: &StdReceiver<Notification>) {
        assert!(
            rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "unexpected extra notification"
        );
    }

    #[test]
    fn last_write_wins() {
        let cache = IoCache::new();
        let origin = Origin::unique();
        cache.set_input("Distance", "I16", &[1, 0], origin);
        cache.set_input("Distance", "I32", &[5, 0, 0, 0], origin);

        let (listener, rx) = recording_listener();
        cache.snapshot_inputs(listener);

        let n = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(n.name, "Distance");
        assert_eq!(n.data_type, "I32");
        assert_eq!(n.value, vec![5, 0, 0, 0]);
        assert_eq!(n.origin, Origin::CACHE);
        assert_no_event(&rx);
        cache.shutdown();
    }

    #[test]
    fn namespaces_are_independent() {
        let cache = IoCache::new();
        let origin = Origin::unique();
        cache.set_input("X", "U8", &[1], origin);
        cache.set_output("X", "U8", &[2], origin);

        let (listener, rx) = recording_listener();
        cache.snapshot_inputs(listener.clone());
        cache.snapshot_outputs(listener);

        let input = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((input.namespace, input.value), (Namespace::Input, vec![1]));
        let output = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((output.namespace, output.value), (Namespace::Output, vec![2]));
        cache.shutdown();
    }

    #[test]
    fn snapshot_then_register_is_glitch_free() {
        let cache = IoCache::new();
        let origin = Origin::unique();
        cache.set_input("a", "U8", &[1], origin);
        cache.set_input("b", "U8", &[2], origin);

        let (listener, rx) = recording_listener();
        cache.snapshot_inputs(listener.clone());
        cache.register_listener(listener);
        cache.set_input("a", "U8", &[9], origin);

        // the full snapshot arrives first, exactly once per entity
        let mut snapshot = Vec::new();
        for _ in 0..2 {
            let n = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(n.origin, Origin::CACHE);
            snapshot.push((n.name, n.value));
        }
        snapshot.sort();
        assert_eq!(
            snapshot,
            vec![("a".to_string(), vec![1]), ("b".to_string(), vec![2])]
        );

        // then the live update, with its producer's origin
        let live = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(live.origin, origin);
        assert_eq!((live.name.as_str(), live.value), ("a", vec![9]));
        assert_no_event(&rx);
        cache.shutdown();
    }

    #[test]
    fn register_is_idempotent() {
        let cache = IoCache::new();
        let (listener, rx) = recording_listener();
        cache.register_listener(listener.clone());
        cache.register_listener(listener);
        assert_eq!(cache.listener_count(), 1);

        cache.set_input("k", "U8", &[7], Origin::unique());
        let n = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(n.value, vec![7]);
        assert_no_event(&rx);
        cache.shutdown();
    }

    #[test]
    fn deregister_is_idempotent_and_safe_when_absent() {
        let cache = IoCache::new();
        let (listener, rx) = recording_listener();

        // never registered: a no-op
        cache.deregister_listener(listener.clone());
        assert_eq!(cache.listener_count(), 0);

        cache.register_listener(listener.clone());
        cache.deregister_listener(listener.clone());
        cache.deregister_listener(listener);
        assert_eq!(cache.listener_count(), 0);

        cache.set_input("k", "U8", &[1], Origin::unique());
        assert_no_event(&rx);
        cache.shutdown();
    }

    struct FailingListener;

    impl IoCacheListener for FailingListener {
        fn on_input(&self, _: &str, _: &str, _: &[u8], _: Origin) -> eyre::Result<()> {
            Err(eyre::eyre!("listener failure"))
        }

        fn on_output(&self, _: &str, _: &str, _: &[u8], _: Origin) -> eyre::Result<()> {
            Err(eyre::eyre!("listener failure"))
        }
    }

    #[test]
    fn failing_listener_does_not_disturb_the_rest() {
        let cache = IoCache::new();
        cache.register_listener(Arc::new(FailingListener));
        let (listener, rx) = recording_listener();
        cache.register_listener(listener);

        let origin = Origin::unique();
        cache.set_input("k", "U8", &[1], origin);
        cache.set_input("k", "U8", &[2], origin);

        // the listener registered after the failing one still sees every update
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.value, vec![1]);
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second.value, vec![2]);
        cache.shutdown();
    }

    /// Blocks every delivery until the gate is opened, stalling the worker.
    struct GateListener {
        open: Mutex<bool>,
        cond: Condvar,
    }

    impl GateListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                cond: Condvar::new(),
            })
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }

        fn wait_open(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }
    }

    impl IoCacheListener for GateListener {
        fn on_input(&self, _: &str, _: &str, _: &[u8], _: Origin) -> eyre::Result<()> {
            self.wait_open();
            Ok(())
        }

        fn on_output(&self, _: &str, _: &str, _: &[u8], _: Origin) -> eyre::Result<()> {
            self.wait_open();
            Ok(())
        }
    }

    #[test]
    fn full_queue_blocks_producer_without_loss_or_reorder() {
        let cache = Arc::new(IoCache::with_capacity(4));
        let gate = GateListener::new();
        cache.register_listener(gate.clone());
        let (listener, rx) = recording_listener();
        cache.register_listener(listener);

        let origin = Origin::unique();
        let producer_cache = cache.clone();
        let producer = std::thread::spawn(move || {
            for i in 0..16u8 {
                producer_cache.set_input("counter", "U8", &[i], origin);
            }
        });

        // 4 slots plus the in-flight event cannot hold 16 updates, so the
        // producer must stall while the worker sits in the gated dispatch
        std::thread::sleep(Duration::from_millis(200));
        assert!(
            !producer.is_finished(),
            "producer should be blocked by backpressure"
        );

        gate.open();
        producer.join().unwrap();

        let mut seen = Vec::new();
        for _ in 0..16 {
            let n = rx.recv_timeout(Duration::from_secs(1)).expect("lost an event");
            seen.push(n.value[0]);
        }
        assert_eq!(seen, (0..16).collect::<Vec<u8>>());
        cache.shutdown();
    }

    #[test]
    fn shutdown_drains_pending_events() {
        let cache = IoCache::new();
        let (listener, rx) = recording_listener();
        cache.register_listener(listener);

        let origin = Origin::unique();
        for i in 0..32u8 {
            cache.set_input("k", "U8", &[i], origin);
        }
        cache.shutdown();

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 32);

        // submissions after shutdown are dropped, not a panic
        cache.set_input("late", "U8", &[0], origin);
    }
}

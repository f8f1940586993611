//! Runtime-reconfigurable watch multiplexer. Watches are registered and
//! unregistered per `(parent kind, child kind, namespace)` while the manager
//! runs; one underlying watch is shared by all parents interested in the
//! same child kind and namespace, and every event fans out into the work
//! queue as one reconcile request per interested parent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::meta::WatchEvent;
use crate::metrics::{EVENT_COUNT, REGISTER_COUNT, UNREGISTER_COUNT};
use crate::queue::{ReconcileRequest, WorkQueue};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    QueueAlreadySet,
    ChannelClosed,
    ShutdownTimeout,
    Shutdown(Vec<String>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A registration: this parent kind wants events for that child kind in
/// that namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub parent_kind: String,
    pub child_kind: String,
    pub namespace: String,
}

/// Payload of the register/unregister channels.
#[derive(Debug, Clone)]
pub struct Event {
    pub parent_kind: String,
    pub child_kind: String,
    pub namespace: String,
}

/// An open watch: a stream of projected events plus a sync marker.
pub struct Watch {
    pub events: mpsc::Receiver<WatchEvent>,
    pub synced: watch::Receiver<bool>,
}

/// The API surface the manager needs from the cluster: metadata-only
/// watches per kind and namespace.
#[async_trait]
pub trait WatchClient: Send + Sync {
    async fn watch(&self, kind: &str, namespace: &str) -> Result<Watch, String>;
}

struct SharedWatch {
    parents: Arc<RwLock<HashSet<String>>>,
    stop: watch::Sender<bool>,
    synced: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    keys: HashSet<WatchKey>,
    // one shared watch per (child kind, namespace)
    watches: HashMap<(String, String), SharedWatch>,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub workers: usize,
    pub channel_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> ManagerOptions {
        ManagerOptions {
            workers: 1,
            channel_capacity: 64,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

type EventRx = Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>;

pub struct InformerManager {
    client: Arc<dyn WatchClient>,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
    queue: Arc<RwLock<Option<Arc<dyn WorkQueue>>>>,
    queue_bound: AtomicBool,
    register_tx: Mutex<Option<mpsc::Sender<Event>>>,
    unregister_tx: Mutex<Option<mpsc::Sender<Event>>>,
    register_rx: EventRx,
    unregister_rx: EventRx,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InformerManager {
    pub fn new(client: Arc<dyn WatchClient>, options: ManagerOptions) -> Arc<InformerManager> {
        let (register_tx, register_rx) = mpsc::channel(options.channel_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(options.channel_capacity);
        Arc::new(InformerManager {
            client,
            options,
            state: Mutex::new(ManagerState::default()),
            queue: Arc::new(RwLock::new(None)),
            queue_bound: AtomicBool::new(false),
            register_tx: Mutex::new(Some(register_tx)),
            unregister_tx: Mutex::new(Some(unregister_tx)),
            register_rx: Arc::new(tokio::sync::Mutex::new(register_rx)),
            unregister_rx: Arc::new(tokio::sync::Mutex::new(unregister_rx)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Bind the work queue. Exactly once; rebinding fails even after
    /// shutdown dropped the reference.
    pub fn set_queue(&self, queue: Arc<dyn WorkQueue>) -> Result<(), Error> {
        if self.queue_bound.swap(true, Ordering::SeqCst) {
            return Err(Error::QueueAlreadySet);
        }
        *self.queue.write().unwrap() = Some(queue);
        Ok(())
    }

    /// Spawn the worker loops that consume the register/unregister
    /// channels. The host runtime calls this once when the manager starts.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        for id in 0..std::cmp::max(1, self.options.workers) {
            let manager = self.clone();
            workers.push(tokio::spawn(async move {
                manager.worker(id).await;
            }));
        }
    }

    pub async fn register(
        &self,
        parent_kind: &str,
        child_kind: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        let tx = self
            .register_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ChannelClosed)?;
        tx.send(Event {
            parent_kind: parent_kind.to_string(),
            child_kind: child_kind.to_string(),
            namespace: namespace.to_string(),
        })
        .await
        .map_err(|_| Error::ChannelClosed)
    }

    pub async fn unregister(
        &self,
        parent_kind: &str,
        child_kind: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        let tx = self
            .unregister_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ChannelClosed)?;
        tx.send(Event {
            parent_kind: parent_kind.to_string(),
            child_kind: child_kind.to_string(),
            namespace: namespace.to_string(),
        })
        .await
        .map_err(|_| Error::ChannelClosed)
    }

    /// Stop every watch task, drop the queue reference, close the channels.
    /// Task-stop errors are joined; the whole teardown honors the timeout.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = timeout.unwrap_or(self.options.shutdown_timeout);
        match tokio::time::timeout(timeout, self.shutdown_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ShutdownTimeout),
        }
    }

    async fn shutdown_inner(&self) -> Result<(), Error> {
        // closing the channels first stops new registrations
        self.register_tx.lock().unwrap().take();
        self.unregister_tx.lock().unwrap().take();

        let watches: Vec<SharedWatch> = {
            let mut state = self.state.lock().unwrap();
            state.keys.clear();
            state.watches.drain().map(|(_, w)| w).collect()
        };
        let mut errors = Vec::new();
        for shared in watches {
            let _ = shared.stop.send(true);
            if let Err(e) = shared.task.await
                && !e.is_cancelled()
            {
                errors.push(e.to_string());
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                errors.push(e.to_string());
            }
        }

        *self.queue.write().unwrap() = None;
        info!("informer manager shut down");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errors))
        }
    }

    /// True when no watch task serves this registration anymore.
    pub fn is_stopped(&self, parent_kind: &str, child_kind: &str, namespace: &str) -> bool {
        let state = self.state.lock().unwrap();
        let key = WatchKey {
            parent_kind: parent_kind.to_string(),
            child_kind: child_kind.to_string(),
            namespace: namespace.to_string(),
        };
        if !state.keys.contains(&key) {
            return true;
        }
        state
            .watches
            .get(&(child_kind.to_string(), namespace.to_string()))
            .is_none_or(|w| w.task.is_finished())
    }

    pub fn has_synced(&self, _parent_kind: &str, child_kind: &str, namespace: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .watches
            .get(&(child_kind.to_string(), namespace.to_string()))
            .is_some_and(|w| *w.synced.borrow())
    }

    /// Snapshot of `(child kind, namespace)` pairs a parent watches.
    pub fn active_for_parent(&self, parent_kind: &str) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        let mut active: Vec<_> = state
            .keys
            .iter()
            .filter(|k| k.parent_kind == parent_kind)
            .map(|k| (k.child_kind.clone(), k.namespace.clone()))
            .collect();
        active.sort();
        active
    }

    async fn worker(self: Arc<Self>, id: usize) {
        let mut register_open = true;
        let mut unregister_open = true;
        info!("informer worker {id} running");
        while register_open || unregister_open {
            tokio::select! {
                event = recv_or_pending(&self.register_rx, register_open) => {
                    match event {
                        Some(event) => self.handle_register(event).await,
                        None => register_open = false,
                    }
                }
                event = recv_or_pending(&self.unregister_rx, unregister_open) => {
                    match event {
                        Some(event) => self.handle_unregister(event),
                        None => unregister_open = false,
                    }
                }
            }
        }
        info!("informer worker {id} shutting down");
    }

    async fn handle_register(&self, event: Event) {
        let key = WatchKey {
            parent_kind: event.parent_kind.clone(),
            child_kind: event.child_kind.clone(),
            namespace: event.namespace.clone(),
        };
        let watch_key = (event.child_kind.clone(), event.namespace.clone());
        {
            let state = self.state.lock().unwrap();
            if state.keys.contains(&key) {
                return; // idempotent
            }
        }

        // open the watch outside the lock, it is I/O
        if !self.state.lock().unwrap().watches.contains_key(&watch_key) {
            let opened = self
                .client
                .watch(&event.child_kind, &event.namespace)
                .await;
            let w = match opened {
                Ok(w) => w,
                Err(e) => {
                    error!(
                        "opening watch for {}/{} failed: {}",
                        event.child_kind, event.namespace, e
                    );
                    return;
                }
            };
            let parents = Arc::new(RwLock::new(HashSet::new()));
            let (stop_tx, stop_rx) = watch::channel(false);
            let task = tokio::spawn(pump(
                event.child_kind.clone(),
                w.events,
                stop_rx,
                parents.clone(),
                self.queue.clone(),
            ));
            let shared = SharedWatch {
                parents,
                stop: stop_tx,
                synced: w.synced,
                task,
            };
            let mut state = self.state.lock().unwrap();
            if let Some(raced) = state.watches.insert(watch_key.clone(), shared) {
                // another worker opened the same watch first; ours wins the
                // map, the loser is stopped
                let _ = raced.stop.send(true);
            }
        }

        let mut state = self.state.lock().unwrap();
        if let Some(shared) = state.watches.get(&watch_key) {
            shared
                .parents
                .write()
                .unwrap()
                .insert(event.parent_kind.clone());
        }
        state.keys.insert(key);
        REGISTER_COUNT.inc();
        info!(
            "registered watch {} -> {}/{}",
            event.parent_kind, event.child_kind, event.namespace
        );
    }

    fn handle_unregister(&self, event: Event) {
        let key = WatchKey {
            parent_kind: event.parent_kind.clone(),
            child_kind: event.child_kind.clone(),
            namespace: event.namespace.clone(),
        };
        let watch_key = (event.child_kind.clone(), event.namespace.clone());
        let mut state = self.state.lock().unwrap();
        if !state.keys.remove(&key) {
            return;
        }
        UNREGISTER_COUNT.inc();
        if let Some(shared) = state.watches.get(&watch_key) {
            shared
                .parents
                .write()
                .unwrap()
                .remove(&event.parent_kind);
        }
        // the shared watch only stops when no other parent still watches
        // this (child kind, namespace)
        let still_watched = state
            .keys
            .iter()
            .any(|k| k.child_kind == key.child_kind && k.namespace == key.namespace);
        if !still_watched
            && let Some(shared) = state.watches.remove(&watch_key)
        {
            info!(
                "stopping watch {}/{}, no parent left",
                event.child_kind, event.namespace
            );
            let _ = shared.stop.send(true);
        }
    }
}

async fn recv_or_pending(rx: &EventRx, open: bool) -> Option<Event> {
    if open {
        rx.lock().await.recv().await
    } else {
        std::future::pending().await
    }
}

// the per-watch task: dispatch every event into the queue, one request per
// interested parent, under a read lock of the queue reference
async fn pump(
    child_kind: String,
    mut events: mpsc::Receiver<WatchEvent>,
    mut stop: watch::Receiver<bool>,
    parents: Arc<RwLock<HashSet<String>>>,
    queue: Arc<RwLock<Option<Arc<dyn WorkQueue>>>>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("watch stream for {child_kind} ended");
                    return;
                };
                EVENT_COUNT.inc();
                let meta = event.meta();
                let queue = queue.read().unwrap();
                let Some(queue) = queue.as_ref() else {
                    continue;
                };
                for parent in parents.read().unwrap().iter() {
                    queue.enqueue(ReconcileRequest {
                        parent_kind: parent.clone(),
                        kind: child_kind.clone(),
                        namespace: meta.namespace.clone(),
                        name: meta.name.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::PartialObjectMeta;
    use crate::queue::DedupQueue;
    use std::sync::atomic::AtomicUsize;

    struct TestClient {
        watch_count: AtomicUsize,
        senders: Mutex<HashMap<(String, String), mpsc::Sender<WatchEvent>>>,
        synced_txs: Mutex<Vec<watch::Sender<bool>>>,
    }

    impl TestClient {
        fn new() -> Arc<TestClient> {
            Arc::new(TestClient {
                watch_count: AtomicUsize::new(0),
                senders: Mutex::new(HashMap::new()),
                synced_txs: Mutex::new(Vec::new()),
            })
        }

        async fn push(&self, kind: &str, namespace: &str, event: WatchEvent) {
            let sender = self
                .senders
                .lock()
                .unwrap()
                .get(&(kind.to_string(), namespace.to_string()))
                .cloned()
                .expect("watch not open");
            sender.send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl WatchClient for TestClient {
        async fn watch(&self, kind: &str, namespace: &str) -> Result<Watch, String> {
            self.watch_count.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            self.senders
                .lock()
                .unwrap()
                .insert((kind.to_string(), namespace.to_string()), tx);
            let (synced_tx, synced_rx) = watch::channel(true);
            self.synced_txs.lock().unwrap().push(synced_tx);
            Ok(Watch {
                events: rx,
                synced: synced_rx,
            })
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn object(name: &str, namespace: &str) -> PartialObjectMeta {
        PartialObjectMeta {
            kind: "Secret".to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..PartialObjectMeta::default()
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let client = TestClient::new();
        let manager = InformerManager::new(client.clone(), ManagerOptions::default());
        manager.start();

        manager.register("Component", "Secret", "ns").await.unwrap();
        manager.register("Component", "Secret", "ns").await.unwrap();
        wait_until(|| !manager.active_for_parent("Component").is_empty()).await;
        assert_eq!(client.watch_count.load(Ordering::SeqCst), 1);
        assert!(manager.has_synced("Component", "Secret", "ns"));
        assert!(!manager.is_stopped("Component", "Secret", "ns"));
    }

    #[tokio::test]
    async fn test_shared_watch_survives_first_unregister() {
        let client = TestClient::new();
        let manager = InformerManager::new(client.clone(), ManagerOptions::default());
        manager.start();

        manager.register("ParentA", "Secret", "ns").await.unwrap();
        manager.register("ParentB", "Secret", "ns").await.unwrap();
        wait_until(|| {
            !manager.active_for_parent("ParentA").is_empty()
                && !manager.active_for_parent("ParentB").is_empty()
        })
        .await;
        // two parents, one underlying watch
        assert_eq!(client.watch_count.load(Ordering::SeqCst), 1);

        manager.unregister("ParentA", "Secret", "ns").await.unwrap();
        wait_until(|| manager.active_for_parent("ParentA").is_empty()).await;
        // the shared informer is still alive for ParentB
        assert!(manager.is_stopped("ParentA", "Secret", "ns"));
        assert!(!manager.is_stopped("ParentB", "Secret", "ns"));

        manager.unregister("ParentB", "Secret", "ns").await.unwrap();
        wait_until(|| manager.is_stopped("ParentB", "Secret", "ns")).await;
    }

    #[tokio::test]
    async fn test_events_fan_out_per_parent() {
        let client = TestClient::new();
        let manager = InformerManager::new(client.clone(), ManagerOptions::default());
        let queue = Arc::new(DedupQueue::new(Duration::ZERO));
        manager.set_queue(queue.clone()).unwrap();
        manager.start();

        manager.register("ParentA", "Secret", "ns").await.unwrap();
        manager.register("ParentB", "Secret", "ns").await.unwrap();
        wait_until(|| {
            !manager.active_for_parent("ParentA").is_empty()
                && !manager.active_for_parent("ParentB").is_empty()
        })
        .await;

        client
            .push("Secret", "ns", WatchEvent::Added(object("token", "ns")))
            .await;
        wait_until(|| queue.len() == 2).await;
        let mut parents: Vec<String> = vec![
            queue.pop().unwrap().parent_kind,
            queue.pop().unwrap().parent_kind,
        ];
        parents.sort();
        assert_eq!(parents, vec!["ParentA", "ParentB"]);
    }

    #[tokio::test]
    async fn test_set_queue_rebinding_fails() {
        let client = TestClient::new();
        let manager = InformerManager::new(client, ManagerOptions::default());
        let queue = Arc::new(DedupQueue::new(Duration::ZERO));
        manager.set_queue(queue.clone()).unwrap();
        assert!(matches!(
            manager.set_queue(queue),
            Err(Error::QueueAlreadySet)
        ));
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let client = TestClient::new();
        let manager = InformerManager::new(client.clone(), ManagerOptions::default());
        manager.start();
        manager.register("Component", "Secret", "ns").await.unwrap();
        wait_until(|| !manager.active_for_parent("Component").is_empty()).await;

        manager.graceful_shutdown(None).await.unwrap();
        assert!(manager.is_stopped("Component", "Secret", "ns"));
        // channels are closed, further registration fails
        assert!(matches!(
            manager.register("Component", "Secret", "ns").await,
            Err(Error::ChannelClosed)
        ));
    }
}

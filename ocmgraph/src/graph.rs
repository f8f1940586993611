use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde_json::Value;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    MissingVertex(String),
    AttributeConflict(String),
    CycleRejected { from: String, to: String },
    Cancelled,
    Discover(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Pending,
    Discovering,
    Completed,
    Failed,
}

impl DiscoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryState::Pending => "pending",
            DiscoveryState::Discovering => "discovering",
            DiscoveryState::Completed => "completed",
            DiscoveryState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Vertex payload: discovery state, an optional value, and arbitrary ordered
/// user attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub state: DiscoveryState,
    pub value: Option<Value>,
    pub user: BTreeMap<String, String>,
}

/// Snapshot of one vertex; edges are keys, not references, so snapshots can
/// be iterated without holding the graph lock.
#[derive(Debug, Clone)]
pub struct Vertex<K> {
    pub key: K,
    pub attributes: Attributes,
    pub children: Vec<K>,
}

#[derive(Debug, Default)]
struct VertexData<K> {
    attributes: Attributes,
    children: Vec<K>,
}

type Arena<K> = BTreeMap<K, VertexData<K>>;

/// The graph owns the vertex storage (arena-plus-index); edges are keys.
/// All mutation takes the write lock, renderers hold the read lock for a
/// whole frame. The std RwLock is writer-preferring on Linux, so discovery
/// is not starved by a fast refresh rate.
pub struct Dag<K: Ord + Clone> {
    inner: RwLock<Arena<K>>,
}

impl<K: Ord + Clone + std::fmt::Display> Default for Dag<K> {
    fn default() -> Dag<K> {
        Dag {
            inner: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone + std::fmt::Display> Dag<K> {
    pub fn new() -> Dag<K> {
        Dag::default()
    }

    /// Insert a vertex. Idempotent on the key: re-adding with equal
    /// attributes is a no-op, re-adding with different attributes only
    /// succeeds while the vertex has not completed discovery.
    pub fn add_vertex(&self, key: K, attributes: Attributes) -> Result<(), Error> {
        add_vertex_locked(&mut self.inner.write().unwrap(), key, attributes)
    }

    /// Add a directed edge. Rejects unknown endpoints and anything that
    /// would create a cycle; on rejection nothing is mutated.
    pub fn add_edge(&self, from: &K, to: &K) -> Result<(), Error> {
        add_edge_locked(&mut self.inner.write().unwrap(), from, to)
    }

    pub fn set_state(&self, key: &K, state: DiscoveryState) -> Result<(), Error> {
        set_state_locked(&mut self.inner.write().unwrap(), key, state)
    }

    pub fn set_value(&self, key: &K, value: Value) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let data = inner
            .get_mut(key)
            .ok_or_else(|| Error::MissingVertex(key.to_string()))?;
        data.attributes.value = Some(value);
        Ok(())
    }

    /// pending -> discovering, exactly one caller wins
    pub fn claim(&self, key: &K) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.get_mut(key) {
            Some(data) if data.attributes.state == DiscoveryState::Pending => {
                data.attributes.state = DiscoveryState::Discovering;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vertex(&self, key: &K) -> Option<Vertex<K>> {
        let inner = self.inner.read().unwrap();
        inner.get(key).map(|data| Vertex {
            key: key.clone(),
            attributes: data.attributes.clone(),
            children: data.children.clone(),
        })
    }

    /// Run `f` under the read lock over a stable view of the graph. Frames
    /// of the renderer go through here so one frame sees one snapshot.
    pub fn with_read_lock<R>(&self, f: impl FnOnce(DagView<'_, K>) -> R) -> R {
        let inner = self.inner.read().unwrap();
        f(DagView { inner: &inner })
    }

    /// Run `f` under the write lock; discovery uses this to batch the
    /// insert-neighbors-and-edges step into one critical section.
    pub fn with_write_lock<R>(&self, f: impl FnOnce(DagViewMut<'_, K>) -> R) -> R {
        let mut inner = self.inner.write().unwrap();
        f(DagViewMut { inner: &mut inner })
    }
}

fn add_vertex_locked<K: Ord + Clone + std::fmt::Display>(
    inner: &mut Arena<K>,
    key: K,
    attributes: Attributes,
) -> Result<(), Error> {
    match inner.get_mut(&key) {
        None => {
            inner.insert(
                key,
                VertexData {
                    attributes,
                    children: Vec::new(),
                },
            );
            Ok(())
        }
        Some(existing) => {
            if existing.attributes == attributes {
                Ok(())
            } else if existing.attributes.state == DiscoveryState::Completed {
                Err(Error::AttributeConflict(key.to_string()))
            } else {
                existing.attributes = attributes;
                Ok(())
            }
        }
    }
}

fn add_edge_locked<K: Ord + Clone + std::fmt::Display>(
    inner: &mut Arena<K>,
    from: &K,
    to: &K,
) -> Result<(), Error> {
    if !inner.contains_key(to) {
        return Err(Error::MissingVertex(to.to_string()));
    }
    if !inner.contains_key(from) {
        return Err(Error::MissingVertex(from.to_string()));
    }
    if from == to || reachable(inner, to, from) {
        return Err(Error::CycleRejected {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let children = &mut inner.get_mut(from).unwrap().children;
    if !children.contains(to) {
        children.push(to.clone());
    }
    Ok(())
}

fn set_state_locked<K: Ord + Clone + std::fmt::Display>(
    inner: &mut Arena<K>,
    key: &K,
    state: DiscoveryState,
) -> Result<(), Error> {
    let data = inner
        .get_mut(key)
        .ok_or_else(|| Error::MissingVertex(key.to_string()))?;
    data.attributes.state = state;
    Ok(())
}

fn reachable<K: Ord + Clone>(inner: &Arena<K>, from: &K, target: &K) -> bool {
    let mut stack = vec![from.clone()];
    let mut seen = BTreeSet::new();
    while let Some(k) = stack.pop() {
        if &k == target {
            return true;
        }
        if !seen.insert(k.clone()) {
            continue;
        }
        if let Some(data) = inner.get(&k) {
            stack.extend(data.children.iter().cloned());
        }
    }
    false
}

/// Read-locked view handed to [Dag::with_read_lock] closures.
pub struct DagView<'a, K: Ord + Clone> {
    inner: &'a Arena<K>,
}

impl<K: Ord + Clone> DagView<'_, K> {
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn attributes(&self, key: &K) -> Option<&Attributes> {
        self.inner.get(key).map(|d| &d.attributes)
    }

    pub fn children(&self, key: &K) -> &[K] {
        self.inner
            .get(key)
            .map(|d| d.children.as_slice())
            .unwrap_or(&[])
    }

    /// Keys with no incoming edge, in key order.
    pub fn roots(&self) -> Vec<&K> {
        let mut non_roots = BTreeSet::new();
        for data in self.inner.values() {
            for child in &data.children {
                non_roots.insert(child);
            }
        }
        self.inner
            .keys()
            .filter(|k| !non_roots.contains(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Write-locked view handed to [Dag::with_write_lock] closures.
pub struct DagViewMut<'a, K: Ord + Clone> {
    inner: &'a mut Arena<K>,
}

impl<K: Ord + Clone + std::fmt::Display> DagViewMut<'_, K> {
    pub fn add_vertex(&mut self, key: K, attributes: Attributes) -> Result<(), Error> {
        add_vertex_locked(self.inner, key, attributes)
    }

    pub fn add_edge(&mut self, from: &K, to: &K) -> Result<(), Error> {
        add_edge_locked(self.inner, from, to)
    }

    pub fn set_state(&mut self, key: &K, state: DiscoveryState) -> Result<(), Error> {
        set_state_locked(self.inner, key, state)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag() -> Dag<String> {
        let d = Dag::new();
        for k in ["a", "b", "c"] {
            d.add_vertex(k.to_string(), Attributes::default()).unwrap();
        }
        d
    }

    #[test]
    fn test_add_vertex_idempotent() {
        let d = dag();
        assert_eq!(d.len(), 3);
        // same attributes, fine
        d.add_vertex("a".to_string(), Attributes::default()).unwrap();
        assert_eq!(d.len(), 3);
        // different attributes while not completed, overwrite
        let mut attrs = Attributes::default();
        attrs.user.insert("k".to_string(), "v".to_string());
        d.add_vertex("a".to_string(), attrs.clone()).unwrap();
        // completed vertices are frozen
        d.set_state(&"a".to_string(), DiscoveryState::Completed)
            .unwrap();
        let mut attrs = d.vertex(&"a".to_string()).unwrap().attributes;
        attrs.user.insert("k2".to_string(), "v2".to_string());
        assert!(matches!(
            d.add_vertex("a".to_string(), attrs),
            Err(Error::AttributeConflict(_))
        ));
    }

    #[test]
    fn test_add_edge_rejects_cycles() {
        let d = dag();
        let (a, b, c) = ("a".to_string(), "b".to_string(), "c".to_string());
        d.add_edge(&a, &b).unwrap();
        d.add_edge(&b, &c).unwrap();
        let err = d.add_edge(&c, &a).unwrap_err();
        assert!(matches!(err, Error::CycleRejected { .. }));
        // the rejected edge did not mutate
        assert!(d.vertex(&c).unwrap().children.is_empty());
        assert!(matches!(
            d.add_edge(&a, &a),
            Err(Error::CycleRejected { .. })
        ));
        assert!(matches!(
            d.add_edge(&a, &"zz".to_string()),
            Err(Error::MissingVertex(_))
        ));
    }

    #[test]
    fn test_edge_idempotent() {
        let d = dag();
        let (a, b) = ("a".to_string(), "b".to_string());
        d.add_edge(&a, &b).unwrap();
        d.add_edge(&a, &b).unwrap();
        assert_eq!(d.vertex(&a).unwrap().children.len(), 1);
    }

    #[test]
    fn test_claim_single_winner() {
        let d = dag();
        let a = "a".to_string();
        assert!(d.claim(&a));
        assert!(!d.claim(&a));
        assert_eq!(
            d.vertex(&a).unwrap().attributes.state,
            DiscoveryState::Discovering
        );
    }

    #[test]
    fn test_roots() {
        let d = dag();
        d.add_edge(&"a".to_string(), &"b".to_string()).unwrap();
        d.with_read_lock(|view| {
            let roots: Vec<String> = view.roots().into_iter().cloned().collect();
            assert_eq!(roots, vec!["a".to_string(), "c".to_string()]);
        });
    }
}

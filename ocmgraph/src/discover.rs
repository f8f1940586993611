use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use log::warn;
use tokio::task::JoinSet;

use crate::graph::{Attributes, Dag, DiscoveryState, Error};

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub concurrency: usize,
}

impl Default for DiscoverOptions {
    fn default() -> DiscoverOptions {
        DiscoverOptions { concurrency: 4 }
    }
}

/// Concurrent BFS from `roots`. For every vertex not yet expanded,
/// `discover_fn(key)` returns the neighbor keys; neighbors are inserted as
/// pending vertices, linked, and enqueued. A vertex whose discovery errors
/// is marked failed and its error message recorded; the walk continues.
///
/// Cancellation is cooperative: flip the watch channel and the walk stops
/// between vertices with [Error::Cancelled], leaving in-flight work aborted.
pub async fn discover<K, F, Fut>(
    dag: Arc<Dag<K>>,
    roots: Vec<K>,
    discover_fn: F,
    options: DiscoverOptions,
    mut cancel: Option<tokio::sync::watch::Receiver<bool>>,
) -> Result<(), Error>
where
    K: Ord + Clone + std::fmt::Display + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<K>, String>> + Send + 'static,
{
    let discover_fn = Arc::new(discover_fn);
    let mut queue: VecDeque<K> = VecDeque::new();
    for root in roots {
        dag.add_vertex(root.clone(), Attributes::default())?;
        queue.push_back(root);
    }

    let mut set: JoinSet<(K, Result<Vec<K>, String>)> = JoinSet::new();
    let concurrency = std::cmp::max(1, options.concurrency);

    loop {
        while set.len() < concurrency {
            let Some(key) = queue.pop_front() else {
                break;
            };
            // already discovering/completed through another path
            if !dag.claim(&key) {
                continue;
            }
            let f = discover_fn.clone();
            set.spawn(async move {
                let result = f(key.clone()).await;
                (key, result)
            });
        }
        if set.is_empty() {
            break;
        }

        let mut watch_dead = false;
        let joined = if let Some(c) = cancel.as_mut() {
            tokio::select! {
                res = c.changed() => {
                    if res.is_ok() && *c.borrow() {
                        set.abort_all();
                        return Err(Error::Cancelled);
                    }
                    // a dropped sender means nobody can cancel anymore
                    watch_dead = res.is_err();
                    None
                }
                joined = set.join_next() => Some(joined),
            }
        } else {
            Some(set.join_next().await)
        };
        if watch_dead {
            cancel = None;
        }
        let Some(joined) = joined else {
            continue;
        };

        match joined {
            Some(Ok((key, Ok(neighbors)))) => {
                // one critical section per expanded vertex
                let fresh = dag.with_write_lock(|mut view| {
                    let mut fresh = Vec::new();
                    for neighbor in neighbors {
                        if !view.contains(&neighbor) {
                            view.add_vertex(neighbor.clone(), Attributes::default())?;
                            fresh.push(neighbor.clone());
                        }
                        if let Err(e) = view.add_edge(&key, &neighbor) {
                            // a cycle among component references is the
                            // referenced component's problem, not ours
                            warn!("skipping edge {key} -> {neighbor}: {e}");
                        }
                    }
                    view.set_state(&key, DiscoveryState::Completed)?;
                    Ok::<_, Error>(fresh)
                })?;
                queue.extend(fresh);
            }
            Some(Ok((key, Err(message)))) => {
                warn!("discovery of {key} failed: {message}");
                dag.set_state(&key, DiscoveryState::Failed)?;
            }
            Some(Err(join_error)) => {
                if join_error.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                return Err(Error::Discover(join_error.to_string()));
            }
            None => break,
        }
    }
    Ok(())
}

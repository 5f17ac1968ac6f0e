//! Single-flight execution keyed by string
//!
//! Collapses duplicate in-flight operations with the same key onto one
//! execution: the first caller becomes the leader and runs the work, later
//! callers subscribe to the leader's broadcast and observe the same result.
//! Used to guarantee at most one token refresh per account regardless of
//! how many requests hit a 401 at once.

use std::collections::HashMap;

use tokio::sync::{Mutex, broadcast};
use tracing::debug;

pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, coalescing with any in-flight execution.
    ///
    /// The leader's result is broadcast to every waiter. If a leader dies
    /// without publishing (its channel closes), waiters retry leadership
    /// rather than hang.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut work = Some(work);
        loop {
            let mut rx = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        inflight.insert(key.to_string(), tx);
                        drop(inflight);

                        // Leader path: run the work, publish, clean up.
                        // The closure is consumed only on the leader path,
                        // and the leader path returns, so this is always Some.
                        let result = match work.take() {
                            Some(f) => f().await,
                            None => unreachable!("single-flight leader ran twice"),
                        };
                        let mut inflight = self.inflight.lock().await;
                        if let Some(tx) = inflight.remove(key) {
                            let _ = tx.send(result.clone());
                        }
                        return result;
                    }
                }
            };

            debug!(key, "joining in-flight operation");
            match rx.recv().await {
                Ok(result) => return result,
                // Leader vanished without publishing; take over.
                Err(_) => continue,
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

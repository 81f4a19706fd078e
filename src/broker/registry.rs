use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::net::{wire::StepRequest, Error};

/// Anything that can compute a `Step` for the broker: a remote worker
/// reached over a link, or an in-process worker.
pub trait Stepper: Send + Sync + 'static {
    fn step(&self, req: StepRequest) -> BoxFuture<'static, Result<Vec<u8>, Error>>;

    /// Asks the worker to stop serving.
    fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>>;
}

/// A registered worker as handed out to a turn.
#[derive(Clone)]
pub struct WorkerHandle {
    addr: Arc<str>,
    stepper: Arc<dyn Stepper>,
    seq: u64,
}

impl WorkerHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn stepper(&self) -> &Arc<dyn Stepper> {
        &self.stepper
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerHandle").field(&self.addr).finish()
    }
}

struct Registration {
    handle: WorkerHandle,
    alive: bool,
}

/// Workers known to the broker, keyed by address.
///
/// Registrations are never removed. A worker that fails a call is marked
/// dead and skipped until it registers again.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<Arc<str>, Registration>>,
    next_seq: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker, or replaces and revives an existing registration for
    /// the same address.
    pub async fn insert(&self, addr: &str, stepper: Arc<dyn Stepper>) {
        let addr: Arc<str> = addr.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            handle: WorkerHandle {
                addr: addr.clone(),
                stepper,
                seq,
            },
            alive: true,
        };
        let previous = self.workers.write().await.insert(addr.clone(), registration);
        match previous {
            Some(_) => info!(worker = %addr, "worker re-registered"),
            None => info!(worker = %addr, "worker registered"),
        }
    }

    /// Marks a worker dead. Does nothing if the address has since been
    /// registered again with a different connection.
    pub async fn mark_dead(&self, handle: &WorkerHandle) {
        let mut workers = self.workers.write().await;
        if let Some(registration) = workers.get_mut(&handle.addr) {
            if registration.handle.seq == handle.seq && registration.alive {
                registration.alive = false;
                debug!(worker = %handle.addr, "worker marked dead");
            }
        }
    }

    /// Copies out the live workers in registration order.
    pub async fn live(&self) -> Vec<WorkerHandle> {
        let workers = self.workers.read().await;
        let mut live: Vec<_> = workers.values().filter(|r| r.alive).collect();
        live.sort_by_key(|r| r.handle.seq);
        live.into_iter().map(|r| r.handle.clone()).collect()
    }

    pub async fn live_count(&self) -> usize {
        self.workers.read().await.values().filter(|r| r.alive).count()
    }

    pub async fn is_alive(&self, addr: &str) -> bool {
        self.workers
            .read()
            .await
            .get(addr)
            .map_or(false, |r| r.alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct Idle;

    impl Stepper for Idle {
        fn step(&self, req: StepRequest) -> BoxFuture<'static, Result<Vec<u8>, Error>> {
            async move { Ok(req.rows) }.boxed()
        }

        fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>> {
            async { Ok(()) }.boxed()
        }
    }

    fn addrs(handles: &[WorkerHandle]) -> Vec<&str> {
        handles.iter().map(WorkerHandle::addr).collect()
    }

    #[tokio::test]
    async fn live_workers_keep_registration_order() {
        let registry = WorkerRegistry::new();
        registry.insert("10.0.0.2:9000", Arc::new(Idle)).await;
        registry.insert("10.0.0.1:9000", Arc::new(Idle)).await;
        registry.insert("10.0.0.3:9000", Arc::new(Idle)).await;
        assert_eq!(
            addrs(&registry.live().await),
            vec!["10.0.0.2:9000", "10.0.0.1:9000", "10.0.0.3:9000"]
        );
    }

    #[tokio::test]
    async fn dead_workers_are_skipped_until_they_register_again() {
        let registry = WorkerRegistry::new();
        registry.insert("a", Arc::new(Idle)).await;
        registry.insert("b", Arc::new(Idle)).await;

        let live = registry.live().await;
        registry.mark_dead(&live[0]).await;
        assert_eq!(addrs(&registry.live().await), vec!["b"]);
        assert!(!registry.is_alive("a").await);

        registry.insert("a", Arc::new(Idle)).await;
        assert_eq!(addrs(&registry.live().await), vec!["b", "a"]);
        assert_eq!(registry.live_count().await, 2);
    }

    #[tokio::test]
    async fn stale_handle_does_not_kill_a_fresh_registration() {
        let registry = WorkerRegistry::new();
        registry.insert("a", Arc::new(Idle)).await;
        let stale = registry.live().await.remove(0);
        registry.insert("a", Arc::new(Idle)).await;
        registry.mark_dead(&stale).await;
        assert!(registry.is_alive("a").await);
    }
}

pub mod kernel;

use std::{fmt, future::Future, net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    broker::registry::Stepper,
    client::{BrokerClient, ClientError},
    config::WorkerConfig,
    net::{
        endpoint,
        link::{self, Service},
        wire::{StepRequest, WorkerRequest, WorkerResponse},
        Error,
    },
};

/// Runs the kernel for one request on the blocking pool.
async fn evolve(req: StepRequest) -> Result<Vec<u8>, String> {
    tokio::task::spawn_blocking(move || {
        kernel::step(
            &req.rows,
            &req.halo_above,
            &req.halo_below,
            req.width as usize,
        )
        .map_err(|e| e.to_string())
    })
    .await
    .unwrap_or_else(|e| Err(format!("step task failed: {e}")))
}

/// A worker that computes in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWorker;

impl LocalWorker {
    pub fn new() -> Self {
        Self
    }
}

impl Stepper for LocalWorker {
    fn step(&self, req: StepRequest) -> BoxFuture<'static, Result<Vec<u8>, Error>> {
        async move { evolve(req).await.map_err(Error::Rejected) }.boxed()
    }

    fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>> {
        async { Ok(()) }.boxed()
    }
}

#[derive(Debug)]
pub enum WorkerError {
    Net(Error),
    Registration(ClientError),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Net(e) => write!(f, "{e}"),
            WorkerError::Registration(e) => write!(f, "could not register: {e}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<Error> for WorkerError {
    fn from(e: Error) -> Self {
        Self::Net(e)
    }
}

/// A worker process: serves `Step` for a broker until told to shut down.
pub struct Worker {
    config: WorkerConfig,
    ep: quinn::Endpoint,
    shutdown: watch::Sender<bool>,
}

impl Worker {
    pub fn bind(config: WorkerConfig) -> Result<Arc<Self>, Error> {
        let ep = endpoint::server(config.listen)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            ep,
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ep.local_addr()?)
    }

    /// The address the broker should dial.
    pub fn advertised(&self) -> Result<String, Error> {
        match &self.config.advertise {
            Some(addr) => Ok(addr.clone()),
            None => Ok(self.local_addr()?.to_string()),
        }
    }

    /// Asks `broker` to add this worker to its pool.
    pub async fn register(&self, broker: SocketAddr) -> Result<(), WorkerError> {
        let addr = self.advertised()?;
        let client = BrokerClient::connect(broker).await?;
        client
            .register_worker(&addr)
            .await
            .map_err(WorkerError::Registration)?;
        client.close();
        info!(%broker, advertised = %addr, "registered with broker");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Answers requests until a `Shutdown` arrives or [`Worker::stop`] is
    /// called.
    pub async fn serve(self: Arc<Self>) {
        let ep = self.ep.clone();
        let grace = self.config.shutdown_grace;
        let stopped = {
            let worker = self.clone();
            async move { worker.stopped().await }
        };
        info!(listen = ?ep.local_addr(), "worker serving");
        link::serve(ep, self, stopped, grace).await;
        info!("worker stopped");
    }

    /// Binds, starts serving and registers with the configured broker, then
    /// serves until shut down.
    pub async fn run(config: WorkerConfig) -> Result<(), WorkerError> {
        let broker = config.broker;
        let worker = Self::bind(config)?;
        let serving = tokio::spawn(worker.clone().serve());

        if let Some(broker) = broker {
            if let Err(e) = worker.register(broker).await {
                worker.stop();
                let _ = serving.await;
                return Err(e);
            }
        }

        if serving.await.is_err() {
            warn!("worker task panicked");
        }
        Ok(())
    }
}

impl Service for Worker {
    type Request = WorkerRequest;
    type Response = WorkerResponse;

    fn handle(
        self: Arc<Self>,
        req: WorkerRequest,
        remote: SocketAddr,
    ) -> impl Future<Output = WorkerResponse> + Send {
        async move {
            match req {
                WorkerRequest::Step(step) => {
                    let rows = step.rows.len() / (step.width.max(1) as usize);
                    match evolve(step).await {
                        Ok(next) => {
                            debug!(rows, "stepped");
                            WorkerResponse::Stepped(next)
                        }
                        Err(e) => {
                            warn!(%remote, "refused step: {}", e);
                            WorkerResponse::Error(e)
                        }
                    }
                }
                WorkerRequest::Shutdown => {
                    info!(%remote, "shutdown requested");
                    self.stop();
                    WorkerResponse::ShuttingDown
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{ALIVE, DEAD};

    #[tokio::test]
    async fn local_worker_steps_a_slice() {
        // middle row of a vertical blinker, with its halos
        let req = StepRequest {
            rows: vec![DEAD, ALIVE, DEAD],
            halo_above: vec![DEAD, ALIVE, DEAD],
            halo_below: vec![DEAD, ALIVE, DEAD],
            width: 3,
        };
        let next = LocalWorker::new().step(req).await.unwrap();
        assert_eq!(next, vec![ALIVE, ALIVE, ALIVE]);
    }

    #[tokio::test]
    async fn bad_shapes_are_rejected() {
        let req = StepRequest {
            rows: vec![DEAD; 5],
            halo_above: vec![DEAD; 3],
            halo_below: vec![DEAD; 3],
            width: 3,
        };
        assert!(matches!(
            LocalWorker::new().step(req).await,
            Err(Error::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_worker() {
        let worker = Worker::bind(
            WorkerConfig::builder()
                .listen("127.0.0.1:0".parse().unwrap())
                .build(),
        )
        .unwrap();
        let response = worker
            .clone()
            .handle(WorkerRequest::Shutdown, "127.0.0.1:1".parse().unwrap())
            .await;
        assert_eq!(response, WorkerResponse::ShuttingDown);
        tokio::time::timeout(std::time::Duration::from_secs(1), worker.stopped())
            .await
            .unwrap();
    }
}

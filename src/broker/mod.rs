// The broker owns one run at a time. The turn loop is the only writer of the
// grid and turn counter; key commands only touch the control state, and
// queries only take the read side of the generation lock, so neither ever
// holds up a turn for longer than a pointer swap.
//
// Workers come and go through the registry. A turn copies the live set out
// of the registry before dispatching, so registration never blocks on worker
// I/O and a turn always sees a consistent set of workers.

pub mod control;
pub mod dispatch;
pub mod partition;
pub mod registry;
pub mod service;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    client::WorkerClient,
    config::BrokerConfig,
    grid::{Cell, Grid, GridError},
    net::{
        endpoint,
        wire::{Key, RunStatus, SubmitRun},
        Error,
    },
};
use control::{Control, ControlState};
use dispatch::{Dispatcher, TurnError};
use registry::{Stepper, WorkerRegistry};

#[derive(Debug)]
pub enum BrokerError {
    /// No live workers to run on.
    NoWorkers,
    /// Zero width or height.
    InvalidDimensions { width: u32, height: u32 },
    /// The grid doesn't match its declared dimensions.
    MalformedGrid(GridError),
    RunInProgress,
    NoActiveRun,
    Registration(Error),
    /// Worker registration needs an endpoint to dial from.
    NoEndpoint,
    /// A `kill` has been received.
    ShuttingDown,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::NoWorkers => write!(f, "no workers available"),
            BrokerError::InvalidDimensions { width, height } => {
                write!(f, "invalid dimensions {width}x{height}")
            }
            BrokerError::MalformedGrid(e) => write!(f, "malformed grid: {e}"),
            BrokerError::RunInProgress => write!(f, "a run is already in progress"),
            BrokerError::NoActiveRun => write!(f, "no run has been started"),
            BrokerError::Registration(e) => {
                write!(f, "could not reach worker: {e}")
            }
            BrokerError::NoEndpoint => {
                write!(f, "broker has no endpoint to dial workers from")
            }
            BrokerError::ShuttingDown => write!(f, "broker is shutting down"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// A complete generation: the grid after `turn` turns.
#[derive(Clone)]
pub struct Generation {
    pub grid: Arc<Grid>,
    pub turn: u32,
}

/// The state of one simulation run.
pub struct Run {
    generation: RwLock<Generation>,
    control: Control,
}

impl Run {
    fn new(grid: Grid) -> Self {
        Self {
            generation: RwLock::new(Generation {
                grid: Arc::new(grid),
                turn: 0,
            }),
            control: Control::new(),
        }
    }

    pub async fn generation(&self) -> Generation {
        self.generation.read().await.clone()
    }
}

/// What a run hands back to the client.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub grid: Arc<Grid>,
    pub completed_turns: u32,
    pub alive: Vec<Cell>,
    pub status: RunStatus,
}

/// Answer to a key command.
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    pub turn: u32,
    pub state: ControlState,
    /// The grid at `turn`, for [`Key::Save`].
    pub grid: Option<Arc<Grid>>,
}

pub struct Broker {
    config: BrokerConfig,
    registry: Arc<WorkerRegistry>,
    dispatcher: Dispatcher,
    /// The current run, or the last one once it has finished.
    run: RwLock<Option<Arc<Run>>>,
    /// One permit: held for the duration of a run.
    active: Semaphore,
    /// Set as soon as a `kill` arrives. No run starts after that.
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
    ep: Option<quinn::Endpoint>,
}

impl Broker {
    /// Creates a broker without a network endpoint. Workers have to be
    /// attached in-process with [`Broker::attach`].
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_endpoint(config, None)
    }

    /// Binds a QUIC endpoint on `config.listen`.
    pub fn bind(config: BrokerConfig) -> Result<Arc<Self>, Error> {
        let ep = endpoint::server(config.listen)?;
        info!(listen = ?ep.local_addr(), "broker listening");
        Ok(Arc::new(Self::with_endpoint(config, Some(ep))))
    }

    fn with_endpoint(config: BrokerConfig, ep: Option<quinn::Endpoint>) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), config.dispatch_timeout);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            dispatcher,
            run: RwLock::new(None),
            active: Semaphore::new(1),
            stopping: AtomicBool::new(false),
            shutdown,
            ep,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn endpoint(&self) -> Option<&quinn::Endpoint> {
        self.ep.as_ref()
    }

    /// The current or most recent run.
    pub async fn current_run(&self) -> Option<Arc<Run>> {
        self.run.read().await.clone()
    }

    /// Adds a worker that is already reachable through `stepper`.
    pub async fn attach(&self, addr: &str, stepper: Arc<dyn Stepper>) {
        self.registry.insert(addr, stepper).await;
    }

    /// Dials the worker at `addr` and adds it to the pool. The next turn
    /// picks it up.
    pub async fn register_worker(&self, addr: &str) -> Result<(), BrokerError> {
        let ep = self.ep.as_ref().ok_or(BrokerError::NoEndpoint)?;
        let remote = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| BrokerError::Registration(e.into()))?
            .next()
            .ok_or_else(|| {
                BrokerError::Registration(Error::Rejected(format!(
                    "{addr} did not resolve"
                )))
            })?;
        let link = endpoint::connect(ep, remote)
            .await
            .map_err(BrokerError::Registration)?;
        self.attach(addr, Arc::new(WorkerClient::new(link))).await;
        Ok(())
    }

    /// Runs a simulation to completion, to a quit, or to a turn that fails
    /// even after retrying.
    ///
    /// Requests are validated before anything changes: a bad grid or an
    /// empty worker pool leaves the previous run's state in place.
    pub async fn submit_run(&self, req: SubmitRun) -> Result<RunOutcome, BrokerError> {
        // the shutdown task may already hold the permit
        if self.stopping.load(Ordering::SeqCst) {
            return Err(BrokerError::ShuttingDown);
        }
        let _permit = self
            .active
            .try_acquire()
            .map_err(|_| BrokerError::RunInProgress)?;

        if req.width == 0 || req.height == 0 {
            return Err(BrokerError::InvalidDimensions {
                width: req.width,
                height: req.height,
            });
        }
        let grid = Grid::from_rows(&req.rows, req.width as usize, req.height as usize)
            .map_err(BrokerError::MalformedGrid)?;
        if self.registry.live_count().await == 0 {
            return Err(BrokerError::NoWorkers);
        }

        let run = Arc::new(Run::new(grid));
        *self.run.write().await = Some(run.clone());
        // a kill that raced the check above may have quit the previous run
        // instead of this one
        if self.stopping.load(Ordering::SeqCst) {
            run.control.apply(Key::Quit);
        }

        let span = debug_span!("run", width = req.width, height = req.height, turns = req.turns);
        self.drive(&run, req.turns).instrument(span).await
    }

    async fn drive(&self, run: &Run, turns: u32) -> Result<RunOutcome, BrokerError> {
        info!("run started");
        let mut status = RunStatus::Completed;

        for turn in 1..=turns {
            let grid = run.generation.read().await.grid.clone();
            let next = match self
                .step_with_retries(&grid)
                .instrument(debug_span!("turn", turn))
                .await
            {
                Ok(next) => next,
                Err(e) => {
                    warn!(turn, "giving up on run: {}", e);
                    status = RunStatus::Incomplete(format!("turn {turn} failed: {e}"));
                    break;
                }
            };

            {
                let mut generation = run.generation.write().await;
                generation.grid = Arc::new(next);
                generation.turn = turn;
            }

            if turn < turns && run.control.checkpoint().await == ControlState::Quitting {
                status = RunStatus::Quit;
                break;
            }
        }

        let Generation { grid, turn } = run.generation().await;
        info!(
            completed_turns = turn,
            digest = %grid.digest().to_hex(),
            ?status,
            "run finished"
        );
        Ok(RunOutcome {
            alive: grid.alive_cells(),
            grid,
            completed_turns: turn,
            status,
        })
    }

    async fn step_with_retries(&self, grid: &Grid) -> Result<Grid, TurnError> {
        let mut attempt = 0;
        loop {
            match self.dispatcher.step_grid(grid).await {
                Ok(next) => return Ok(next),
                Err(e) if attempt < self.config.turn_retries => {
                    attempt += 1;
                    warn!(attempt, "turn failed, retrying with the remaining workers: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The turn number and alive-cell count of the latest complete
    /// generation. `(0, 0)` before any run has started.
    pub async fn query_alive(&self) -> (u32, usize) {
        match self.current_run().await {
            Some(run) => {
                let generation = run.generation.read().await;
                (generation.turn, generation.grid.alive_count())
            }
            None => (0, 0),
        }
    }

    /// Applies a key command to the current run.
    pub async fn send_key(self: &Arc<Self>, key: Key) -> Result<KeyOutcome, BrokerError> {
        if key == Key::Kill {
            self.begin_shutdown();
        }
        let Some(run) = self.current_run().await else {
            return match key {
                Key::Kill => Ok(KeyOutcome {
                    turn: 0,
                    state: ControlState::Quitting,
                    grid: None,
                }),
                _ => Err(BrokerError::NoActiveRun),
            };
        };

        let state = run.control.apply(key);
        let Generation { grid, turn } = run.generation().await;
        debug!(?key, ?state, turn, "key applied");
        Ok(KeyOutcome {
            turn,
            state,
            grid: (key == Key::Save).then_some(grid),
        })
    }

    /// Waits for the current run to return, stops every worker and then
    /// tells the server to stop.
    fn begin_shutdown(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let broker = self.clone();
        tokio::spawn(async move {
            // send_key applies quit to the run, so it stops at the next turn
            let _permit = broker.active.acquire().await;
            broker.shutdown_workers().await;
            broker.shutdown.send_replace(true);
            info!("broker shutting down");
        });
    }

    async fn shutdown_workers(&self) {
        let workers = self.registry.live().await;
        let timeout = self.config.worker_shutdown_timeout;
        let calls = workers.iter().map(|worker| async move {
            match tokio::time::timeout(timeout, worker.stepper().shutdown()).await {
                Ok(Ok(())) => debug!(worker = worker.addr(), "worker stopped"),
                Ok(Err(e)) => debug!(worker = worker.addr(), "worker shutdown failed: {}", e),
                Err(_) => debug!(worker = worker.addr(), "worker shutdown timed out"),
            }
        });
        futures::future::join_all(calls).await;
    }

    /// Resolves once a `kill` has shut the broker down.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

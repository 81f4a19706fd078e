use std::{fmt, sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, warn};

use super::{
    partition::{halo_for, partition, Partition, PartitionError},
    registry::{WorkerHandle, WorkerRegistry},
};
use crate::{
    grid::Grid,
    net::{wire::StepRequest, Error},
};

/// Why a partition produced no rows this turn.
#[derive(Debug)]
pub enum PartitionFailure {
    Call(Error),
    TimedOut,
    /// The worker answered with the wrong number of cells.
    WrongLength { expected: usize, actual: usize },
}

impl fmt::Display for PartitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionFailure::Call(e) => write!(f, "{e}"),
            PartitionFailure::TimedOut => write!(f, "timed out"),
            PartitionFailure::WrongLength { expected, actual } => {
                write!(f, "returned {actual} cells, expected {expected}")
            }
        }
    }
}

/// The outcome of one partition in one turn.
#[derive(Debug)]
pub struct PartitionResult {
    pub partition: Partition,
    pub worker: WorkerHandle,
    pub outcome: Result<Vec<u8>, PartitionFailure>,
}

#[derive(Debug)]
pub enum TurnError {
    Partition(PartitionError),
    /// At least one partition failed; nothing from this turn is usable.
    PartitionsFailed { failed: usize, total: usize },
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Partition(e) => write!(f, "{e}"),
            TurnError::PartitionsFailed { failed, total } => {
                write!(f, "{failed} of {total} partitions failed")
            }
        }
    }
}

impl std::error::Error for TurnError {}

impl From<PartitionError> for TurnError {
    fn from(e: PartitionError) -> Self {
        Self::Partition(e)
    }
}

/// Fans a turn out to the workers and joins on the results.
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Sends every partition of `grid` to its worker in parallel and waits
    /// for all of them. Workers that fail or time out are marked dead.
    pub async fn run_turn(
        &self,
        assignments: Vec<(Partition, WorkerHandle)>,
        grid: &Grid,
    ) -> Vec<PartitionResult> {
        let width = grid.width();
        let calls = assignments.into_iter().map(|(partition, worker)| {
            let (above, below) = halo_for(&partition, grid);
            let req = StepRequest {
                rows: grid.rows(partition.start, partition.end).to_vec(),
                halo_above: above.to_vec(),
                halo_below: below.to_vec(),
                width: width as u32,
            };
            let expected = partition.len() * width;
            let call = worker.stepper().step(req);
            let timeout = self.timeout;
            async move {
                let outcome = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(rows)) if rows.len() == expected => Ok(rows),
                    Ok(Ok(rows)) => Err(PartitionFailure::WrongLength {
                        expected,
                        actual: rows.len(),
                    }),
                    Ok(Err(e)) => Err(PartitionFailure::Call(e)),
                    Err(_) => Err(PartitionFailure::TimedOut),
                };
                PartitionResult {
                    partition,
                    worker,
                    outcome,
                }
            }
        });

        let results = join_all(calls).await;
        for result in &results {
            if let Err(failure) = &result.outcome {
                warn!(
                    worker = result.worker.addr(),
                    rows = ?result.partition.rows(),
                    "step failed: {}",
                    failure
                );
                self.registry.mark_dead(&result.worker).await;
            }
        }
        results
    }

    /// Computes the next generation of `grid` with the workers currently
    /// alive. Either every row is evolved or the turn fails as a whole.
    pub async fn step_grid(&self, grid: &Grid) -> Result<Grid, TurnError> {
        let workers = self.registry.live().await;
        let partitions = partition(grid.height(), workers.len())?;
        debug!(
            partitions = partitions.len(),
            workers = workers.len(),
            "dispatching turn"
        );
        let assignments = partitions.into_iter().zip(workers).collect();
        let results = self.run_turn(assignments, grid).await;
        merge(results, grid)
    }
}

/// Stitches partition results back together in row order.
pub fn merge(results: Vec<PartitionResult>, grid: &Grid) -> Result<Grid, TurnError> {
    let total = results.len();
    let failed = results.iter().filter(|r| r.outcome.is_err()).count();
    if failed > 0 {
        return Err(TurnError::PartitionsFailed { failed, total });
    }

    let mut ordered: Vec<_> = results
        .into_iter()
        .filter_map(|r| r.outcome.ok().map(|rows| (r.partition, rows)))
        .collect();
    ordered.sort_by_key(|(partition, _)| partition.start);

    let mut cells = Vec::with_capacity(grid.cells().len());
    for (_, rows) in ordered {
        cells.extend(rows);
    }
    Grid::from_cells(cells, grid.width(), grid.height()).map_err(|_| {
        // partitions always cover the grid, so this only happens if a
        // worker returned cells other than alive or dead
        TurnError::PartitionsFailed {
            failed: total,
            total,
        }
    })
}

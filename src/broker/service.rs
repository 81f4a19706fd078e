use std::{future::Future, net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use super::{Broker, BrokerError, KeyOutcome, RunOutcome};
use crate::net::{
    link::{self, Service},
    wire::{
        AliveReport, BrokerRequest, BrokerResponse, GridFrame, KeyReport, RemoteError,
        RemoteErrorKind, RunReport,
    },
};

impl From<&BrokerError> for RemoteError {
    fn from(e: &BrokerError) -> Self {
        let kind = match e {
            BrokerError::NoWorkers => RemoteErrorKind::NoWorkers,
            BrokerError::InvalidDimensions { .. } | BrokerError::MalformedGrid(_) => {
                RemoteErrorKind::InvalidRequest
            }
            BrokerError::RunInProgress => RemoteErrorKind::RunInProgress,
            BrokerError::NoActiveRun => RemoteErrorKind::NoActiveRun,
            BrokerError::Registration(_) => RemoteErrorKind::Registration,
            BrokerError::ShuttingDown => RemoteErrorKind::ShuttingDown,
            BrokerError::NoEndpoint => RemoteErrorKind::Internal,
        };
        RemoteError {
            kind,
            message: e.to_string(),
        }
    }
}

impl From<RunOutcome> for RunReport {
    fn from(outcome: RunOutcome) -> Self {
        RunReport {
            grid: GridFrame::from(&*outcome.grid),
            completed_turns: outcome.completed_turns,
            alive: outcome.alive,
            status: outcome.status,
        }
    }
}

impl From<KeyOutcome> for KeyReport {
    fn from(outcome: KeyOutcome) -> Self {
        KeyReport {
            turn: outcome.turn,
            grid: outcome.grid.as_deref().map(GridFrame::from),
        }
    }
}

/// A worker that advertises a wildcard address is dialed back on the
/// address its registration came from.
fn dial_address(advertised: &str, remote: SocketAddr) -> String {
    match advertised.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            SocketAddr::new(remote.ip(), addr.port()).to_string()
        }
        _ => advertised.to_string(),
    }
}

impl Service for Broker {
    type Request = BrokerRequest;
    type Response = BrokerResponse;

    fn handle(
        self: Arc<Self>,
        req: BrokerRequest,
        remote: SocketAddr,
    ) -> impl Future<Output = BrokerResponse> + Send {
        async move {
            let result = match req {
                BrokerRequest::SubmitRun(run) => self
                    .submit_run(run)
                    .await
                    .map(|outcome| BrokerResponse::RunFinished(outcome.into())),
                BrokerRequest::QueryAlive => {
                    let (turn, alive) = self.query_alive().await;
                    Ok(BrokerResponse::Alive(AliveReport {
                        turn,
                        alive: alive as u64,
                    }))
                }
                BrokerRequest::SendKey(key) => self
                    .send_key(key)
                    .await
                    .map(|outcome| BrokerResponse::Key(outcome.into())),
                BrokerRequest::RegisterWorker(addr) => {
                    let addr = dial_address(&addr, remote);
                    self.register_worker(&addr)
                        .await
                        .map(|()| BrokerResponse::Registered)
                }
            };
            result.unwrap_or_else(|e| {
                debug!(%remote, "request refused: {}", e);
                BrokerResponse::Error((&e).into())
            })
        }
    }
}

impl Broker {
    /// Answers clients and workers until a `kill` shuts the broker down.
    pub async fn serve(self: Arc<Self>) -> Result<(), BrokerError> {
        let ep = self.endpoint().cloned().ok_or(BrokerError::NoEndpoint)?;
        let grace = self.config().shutdown_grace;
        let closed = {
            let broker = self.clone();
            async move { broker.closed().await }
        };
        info!(listen = ?ep.local_addr(), "serving");
        link::serve(ep.clone(), self, closed, grace).await;
        ep.wait_idle().await;
        warn!("broker stopped");
        Ok(())
    }
}

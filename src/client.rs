use std::{fmt, net::SocketAddr};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    broker::registry::Stepper,
    net::{
        endpoint,
        wire::{
            AliveReport, BrokerRequest, BrokerResponse, Key, KeyReport, RemoteError, RunReport,
            StepRequest, SubmitRun, WorkerRequest, WorkerResponse,
        },
        Error, Link,
    },
};

#[derive(Debug)]
pub enum ClientError {
    Net(Error),
    /// The broker refused the request.
    Remote(RemoteError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Net(e) => write!(f, "{e}"),
            ClientError::Remote(e) => write!(f, "broker: {}", e.message),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<Error> for ClientError {
    fn from(e: Error) -> Self {
        Self::Net(e)
    }
}

/// Typed calls to a broker. Calls may run concurrently: each one opens its
/// own stream on the shared link.
pub struct BrokerClient {
    link: Link,
    // connections need their endpoint alive
    _ep: quinn::Endpoint,
}

impl BrokerClient {
    pub async fn connect(broker: SocketAddr) -> Result<Self, Error> {
        let ep = endpoint::client()?;
        let link = endpoint::connect(&ep, broker).await?;
        Ok(Self { link, _ep: ep })
    }

    async fn call(&self, req: BrokerRequest) -> Result<BrokerResponse, ClientError> {
        match self.link.call(&req).await? {
            BrokerResponse::Error(e) => Err(ClientError::Remote(e)),
            resp => Ok(resp),
        }
    }

    /// Runs a simulation. Returns once the run has finished, was quit, or
    /// gave up.
    pub async fn submit_run(&self, req: SubmitRun) -> Result<RunReport, ClientError> {
        match self.call(BrokerRequest::SubmitRun(req)).await? {
            BrokerResponse::RunFinished(report) => Ok(report),
            _ => Err(Error::UnexpectedResponse.into()),
        }
    }

    pub async fn query_alive(&self) -> Result<AliveReport, ClientError> {
        match self.call(BrokerRequest::QueryAlive).await? {
            BrokerResponse::Alive(report) => Ok(report),
            _ => Err(Error::UnexpectedResponse.into()),
        }
    }

    pub async fn send_key(&self, key: Key) -> Result<KeyReport, ClientError> {
        match self.call(BrokerRequest::SendKey(key)).await? {
            BrokerResponse::Key(report) => Ok(report),
            _ => Err(Error::UnexpectedResponse.into()),
        }
    }

    pub async fn register_worker(&self, addr: &str) -> Result<(), ClientError> {
        match self.call(BrokerRequest::RegisterWorker(addr.to_string())).await? {
            BrokerResponse::Registered => Ok(()),
            _ => Err(Error::UnexpectedResponse.into()),
        }
    }

    pub fn close(&self) {
        self.link.close(b"done");
    }
}

/// The broker's handle on a remote worker.
pub struct WorkerClient {
    link: Link,
}

impl WorkerClient {
    pub fn new(link: Link) -> Self {
        Self { link }
    }
}

impl Stepper for WorkerClient {
    fn step(&self, req: StepRequest) -> BoxFuture<'static, Result<Vec<u8>, Error>> {
        let link = self.link.clone();
        async move {
            match link.call(&WorkerRequest::Step(req)).await? {
                WorkerResponse::Stepped(rows) => Ok(rows),
                WorkerResponse::Error(reason) => Err(Error::Rejected(reason)),
                WorkerResponse::ShuttingDown => Err(Error::UnexpectedResponse),
            }
        }
        .boxed()
    }

    fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>> {
        let link = self.link.clone();
        async move {
            match link.call(&WorkerRequest::Shutdown).await? {
                WorkerResponse::ShuttingDown => {
                    link.close(b"shutdown");
                    Ok(())
                }
                _ => Err(Error::UnexpectedResponse),
            }
        }
        .boxed()
    }
}

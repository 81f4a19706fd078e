use std::{future::Future, net::SocketAddr, sync::Arc};

use arrayref::array_ref;
use chrono::Utc;
use quinn::{Connecting, ConnectionError, RecvStream, SendStream};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    error::Error,
    wire::{parse_header, Frame, Message, HEADER_LEN},
};

/// Links are QUIC connections between the broker, its workers and clients.
/// Every call runs on its own bidirectional stream, so a long running call
/// never holds up the others.
///
/// Can be cloned to obtain another handle to the same link.
#[derive(Clone)]
pub struct Link {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Link {
    /// Completes an outgoing connection.
    pub async fn new(in_progress: Connecting) -> Result<Self, Error> {
        let remote_addr = in_progress.remote_address();
        let conn = in_progress
            .instrument(debug_span!("link", remote = %remote_addr))
            .await?;
        debug!(remote = %remote_addr, "link established");
        Ok(Self { conn, remote_addr })
    }

    /// Sends one request and waits for its response.
    pub async fn call<Req: Message, Resp: Message>(
        &self,
        req: &Req,
    ) -> Result<Resp, Error> {
        let (raw_tx, raw_rx) = self.conn.open_bi().await?;
        let mut tx = FrameSendStream::new(raw_tx);
        let mut rx = FrameRecvStream::new(raw_rx);
        tx.send(req).await?;
        tx.finish().await?;
        let (sent_at, resp) = rx.receive().await?;
        trace!(
            remote = %self.remote_addr,
            latency_us = Utc::now().timestamp_micros() - sent_at,
            "received response"
        );
        Ok(resp)
    }

    pub fn close(&self, reason: &'static [u8]) {
        self.conn.close(0u32.into(), reason);
    }
}

pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), Error> {
        let frame = Frame::encode(msg).await?;
        self.0.write_all(&frame.0).await?;
        Ok(())
    }

    /// Finishes the stream. Completes once the peer has acknowledged
    /// everything written.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.0.finish().await?;
        Ok(())
    }
}

pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    pub async fn receive<M: Message>(&mut self) -> Result<(i64, M), Error> {
        let mut buf = vec![0u8; HEADER_LEN];
        self.0.read_exact(&mut buf).await?;
        let (_, len) = parse_header(array_ref![buf, 0, HEADER_LEN])?;
        buf.resize(HEADER_LEN + len as usize, 0);
        self.0.read_exact(&mut buf[HEADER_LEN..]).await?;
        Frame(buf).decode().await
    }
}

/// Something that answers requests arriving on a [`Link`].
pub trait Service: Send + Sync + 'static {
    type Request: Message + Send + 'static;
    type Response: Message + Send + Sync + 'static;

    fn handle(
        self: Arc<Self>,
        req: Self::Request,
        remote: SocketAddr,
    ) -> impl Future<Output = Self::Response> + Send;
}

/// Accepts incoming links and answers their calls with `service` until
/// `shutdown` resolves. In-flight calls get up to `grace` to finish before
/// the endpoint is closed.
pub async fn serve<S, F>(
    ep: quinn::Endpoint,
    service: Arc<S>,
    shutdown: F,
    grace: std::time::Duration,
) where
    S: Service,
    F: Future<Output = ()>,
{
    // every in-flight call holds a sender; once they are all dropped the
    // receiver yields None. Links only hold weak senders, so an idle link
    // doesn't count as in flight.
    let (inflight_tx, mut inflight_rx) = mpsc::channel::<()>(1);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            incoming = ep.accept() => {
                let Some(in_progress) = incoming else { break };
                tokio::spawn(accept_link(in_progress, service.clone(), inflight_tx.downgrade()));
            }
        }
    }

    drop(inflight_tx);
    if tokio::time::timeout(grace, inflight_rx.recv()).await.is_err() {
        warn!("calls still in flight after {:?}, closing anyway", grace);
    }
    ep.close(0u32.into(), b"shutdown");
    debug!("endpoint closed");
}

async fn accept_link<S: Service>(
    in_progress: Connecting,
    service: Arc<S>,
    inflight: mpsc::WeakSender<()>,
) {
    let remote = in_progress.remote_address();
    let span = debug_span!("link", remote = %remote);
    async move {
        let conn = match in_progress.await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("incoming connection failed: {}", e);
                return;
            }
        };
        debug!("accepted link");
        loop {
            match conn.accept_bi().await {
                Ok((raw_tx, raw_rx)) => {
                    let Some(guard) = inflight.upgrade() else {
                        debug!("shutting down, refusing call");
                        break;
                    };
                    tokio::spawn(
                        answer(
                            FrameSendStream::new(raw_tx),
                            FrameRecvStream::new(raw_rx),
                            service.clone(),
                            remote,
                            guard,
                        )
                        .in_current_span(),
                    );
                }
                Err(ConnectionError::ApplicationClosed(_))
                | Err(ConnectionError::LocallyClosed) => {
                    debug!("link closed");
                    break;
                }
                Err(e) => {
                    debug!("link lost: {}", e);
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn answer<S: Service>(
    mut tx: FrameSendStream,
    mut rx: FrameRecvStream,
    service: Arc<S>,
    remote: SocketAddr,
    _inflight: mpsc::Sender<()>,
) {
    let req = match rx.receive::<S::Request>().await {
        Ok((_, req)) => req,
        Err(e) => {
            warn!("could not read request: {}", e);
            return;
        }
    };
    let resp = service.handle(req, remote).await;
    if let Err(e) = tx.send(&resp).await {
        warn!("could not send response: {}", e);
        return;
    }
    if let Err(e) = tx.finish().await {
        debug!("peer went away before acknowledging the response: {}", e);
    }
}

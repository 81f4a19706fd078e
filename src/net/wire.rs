use std::io;

use arrayref::array_ref;
use async_compression::tokio::{bufread::ZstdDecoder, write::ZstdEncoder};
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::error::Error;
use crate::grid::{Cell, Grid, GridError};

/// Frame header: `sent_at` (µs since the epoch, i64 LE) then the compressed
/// payload length (u32 LE).
pub const HEADER_LEN: usize = 8 + 4;

/// Largest compressed payload we accept from a peer.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Largest payload we are willing to inflate a frame into.
pub const MAX_DECODED_LEN: u64 = 1024 * 1024 * 1024;

/// Messages that can travel inside a frame.
pub trait Message: Sized {
    fn to_wire(&self) -> Result<AlignedVec, Error>;
    fn from_wire(bytes: &[u8]) -> Result<Self, Error>;
}

macro_rules! wire_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Message for $ty {
                fn to_wire(&self) -> Result<AlignedVec, Error> {
                    rkyv::to_bytes::<_, 1024>(self)
                        .map_err(|_| Error::CouldNotEncodeMessage)
                }

                fn from_wire(bytes: &[u8]) -> Result<Self, Error> {
                    // archives must be read from an aligned buffer
                    let mut aligned = AlignedVec::with_capacity(bytes.len());
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<$ty>(&aligned)
                        .map_err(|_| Error::CouldNotDecodeMessage)
                }
            }
        )*
    };
}

wire_message!(BrokerRequest, BrokerResponse, WorkerRequest, WorkerResponse);

/// An encoded frame: `sent_at | len | zstd(rkyv(msg))`.
#[derive(Clone)]
pub struct Frame(pub Vec<u8>);

impl Frame {
    pub async fn encode<M: Message>(msg: &M) -> Result<Self, Error> {
        let archived = msg.to_wire()?;
        let payload = compress(&archived).await?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(Error::FrameTooLarge(u32::MAX))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&Utc::now().timestamp_micros().to_le_bytes()); // 8 bytes
        buf.extend_from_slice(&len.to_le_bytes()); // 4 bytes
        buf.extend_from_slice(&payload); // len bytes
        Ok(Self(buf))
    }

    /// Splits a received frame into its send time and decoded message.
    pub async fn decode<M: Message>(&self) -> Result<(i64, M), Error> {
        if self.0.len() < HEADER_LEN {
            return Err(Error::CouldNotDecodeMessage);
        }
        let (sent_at, len) = parse_header(array_ref![self.0, 0, HEADER_LEN])?;
        let payload = &self.0[HEADER_LEN..];
        if payload.len() != len as usize {
            return Err(Error::CouldNotDecodeMessage);
        }
        let archived = decompress(payload).await?;
        Ok((sent_at, M::from_wire(&archived)?))
    }
}

/// Reads `sent_at` and the payload length out of a frame header.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(i64, u32), Error> {
    let sent_at = LittleEndian::read_i64(&header[..8]);
    let len = LittleEndian::read_u32(&header[8..]);
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    Ok((sent_at, len))
}

async fn compress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZstdEncoder::new(Vec::new());
    encoder.write_all(bytes).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

async fn decompress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZstdDecoder::new(bytes)
        .take(MAX_DECODED_LEN)
        .read_to_end(&mut out)
        .await?;
    Ok(out)
}

/// Key commands a client can send to a running simulation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Key {
    Pause,
    Resume,
    Save,
    Quit,
    /// Quits the run and shuts down the broker and its workers.
    Kill,
}

/// A grid as it travels on the wire.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct GridFrame {
    pub width: u32,
    pub height: u32,
    pub cells: Vec<u8>,
}

impl From<&Grid> for GridFrame {
    fn from(grid: &Grid) -> Self {
        Self {
            width: grid.width() as u32,
            height: grid.height() as u32,
            cells: grid.cells().to_vec(),
        }
    }
}

impl TryFrom<GridFrame> for Grid {
    type Error = GridError;

    fn try_from(frame: GridFrame) -> Result<Self, Self::Error> {
        Grid::from_cells(frame.cells, frame.width as usize, frame.height as usize)
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct SubmitRun {
    pub rows: Vec<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub turns: u32,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum RunStatus {
    /// Every requested turn was computed.
    Completed,
    /// A `quit` or `kill` key stopped the run early.
    Quit,
    /// A turn failed even after retrying; the grid is the last good one.
    Incomplete(String),
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct RunReport {
    pub grid: GridFrame,
    pub completed_turns: u32,
    pub alive: Vec<Cell>,
    pub status: RunStatus,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct AliveReport {
    pub turn: u32,
    pub alive: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct KeyReport {
    pub turn: u32,
    /// Only set for [`Key::Save`].
    pub grid: Option<GridFrame>,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum RemoteErrorKind {
    NoWorkers,
    InvalidRequest,
    RunInProgress,
    NoActiveRun,
    Registration,
    ShuttingDown,
    Internal,
}

/// An error reported by the remote side of a call.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum BrokerRequest {
    SubmitRun(SubmitRun),
    QueryAlive,
    SendKey(Key),
    /// Asks the broker to dial a worker listening on this address.
    RegisterWorker(String),
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum BrokerResponse {
    RunFinished(RunReport),
    Alive(AliveReport),
    Key(KeyReport),
    Registered,
    Error(RemoteError),
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct StepRequest {
    pub rows: Vec<u8>,
    pub halo_above: Vec<u8>,
    pub halo_below: Vec<u8>,
    pub width: u32,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum WorkerRequest {
    Step(StepRequest),
    Shutdown,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum WorkerResponse {
    Stepped(Vec<u8>),
    ShuttingDown,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_carries_a_compressed_request() {
        let rows = vec![vec![0u8; 512]; 512];
        let msg = BrokerRequest::SubmitRun(SubmitRun {
            rows,
            width: 512,
            height: 512,
            turns: 100,
        });
        let frame = Frame::encode(&msg).await.unwrap();
        // an all-dead 512x512 grid compresses to almost nothing
        assert!(frame.0.len() < 4096);

        let (sent_at, decoded): (i64, BrokerRequest) = frame.decode().await.unwrap();
        assert!(sent_at > 0);
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn corrupt_payload_is_rejected() {
        let frame = Frame::encode(&WorkerRequest::Shutdown).await.unwrap();
        let mut bytes = frame.0.clone();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        bytes.truncate(last);
        assert!(matches!(
            Frame(bytes).decode::<WorkerRequest>().await,
            Err(Error::CouldNotDecodeMessage)
        ));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[8..].copy_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        assert!(matches!(
            parse_header(&header),
            Err(Error::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));
    }
}

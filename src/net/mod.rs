//! QUIC transport shared by the broker, its workers and clients.

pub mod endpoint;
pub mod error;
pub mod link;
pub mod wire;

pub use error::Error;
pub use link::{Link, Service};

/// Default port the broker listens on.
pub const BROKER_PORT: u16 = 8030;

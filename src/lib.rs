//! Conway's Game of Life on a toroidal grid, computed by a pool of workers
//! that a broker coordinates over QUIC.
//!
//! A [`broker::Broker`] owns a run. Each turn it splits the grid into row
//! partitions, sends every partition with its two halo rows to a worker,
//! and merges the answers into the next generation. Clients drive runs
//! through [`client::BrokerClient`], usually via the
//! [`controller::Controller`].

pub mod broker;
pub mod client;
pub mod config;
pub mod controller;
pub mod grid;
pub mod net;
pub mod worker;

//! netbench - transport-layer load generation and measurement
//!
//! This library drives user-configured load against a server speaking
//! either a connection-oriented encrypted datagram protocol or plain TCP:
//! N connections, each carrying M concurrent streams, each stream
//! exchanging upload and/or download payloads. It measures throughput,
//! handshake rate and per-request latency.
//!
//! # Architecture
//!
//! A pool of worker threads, each pinned (optionally) to a processor, owns
//! its share of the connections. All transport activity is callback-driven:
//! stacks implementing the [`transport`] contract deliver events into the
//! owning worker's queue, and the per-connection and per-stream state
//! machines advance without locks. Repeat modes recycle stream or
//! connection slots until the run timer elapses.
//!
//! # Example
//!
//! ```no_run
//! use netbench::{Config, PerfClient, Stack};
//! use netbench::drivers::udp::UdpDatagramDriver;
//!
//! fn main() -> netbench::Result<()> {
//!     let config = Config::new("server.example")
//!         .with_connections(4)
//!         .with_streams(2)
//!         .with_upload(1_048_576);
//!     let mut client = PerfClient::new(config, Stack::Datagram(Box::new(UdpDatagramDriver)))?;
//!     client.start()?;
//!     client.wait()?;
//!     println!("{} streams completed", client.streams_completed());
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub(crate) mod connection;
pub mod drivers;
pub mod error;
pub mod latency;
pub(crate) mod pool;
pub(crate) mod stream;
pub mod transport;
pub(crate) mod worker;

pub use client::{PerfClient, Stack};
pub use config::{AddressFamily, Config, TransportKind};
pub use error::{Error, Result};
pub use latency::{decode_extra_data, LatencyCollector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

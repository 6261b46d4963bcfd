//! The top of the engine.
//!
//! Parses nothing and prints little: the run plan arrives as a validated
//! [`Config`], the transport arrives as a [`Stack`]. The client resolves
//! the target once up front (keeping DNS out of the handshake measurement),
//! launches the workers, deals connections out round-robin, and sleeps on
//! the completion event until the run finishes or the run-time ceiling
//! elapses.

use crossbeam_channel::unbounded;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::RequestBuffer;
use crate::config::Config;
use crate::latency::LatencyCollector;
use crate::transport::datagram::DatagramApi;
use crate::transport::tcp::TcpEngine;
use crate::worker::{Worker, WorkerShared};
use crate::{Error, Result};

/// The transport stack driving a run: exactly one of the two contracts.
pub enum Stack {
    Datagram(Box<dyn DatagramApi>),
    Tcp(Box<dyn TcpEngine>),
}

/// Run-wide state shared between the top and every worker.
pub(crate) struct ClientShared {
    pub config: Config,
    pub stack: Stack,
    pub buffer: RequestBuffer,
    pub latency: LatencyCollector,
    running: AtomicBool,
    connections_finished: AtomicU64,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl ClientShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// One connection of the plan finished (completed or failed setup).
    /// The run completes when every planned connection has.
    pub fn on_connection_finished(&self) {
        let finished = self.connections_finished.fetch_add(1, Ordering::Relaxed) + 1;
        if finished >= self.config.connection_count as u64 {
            self.signal_done();
        }
    }

    pub fn signal_done(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    fn wait_done(&self, timeout: Option<Duration>) {
        let mut done = self.done.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*done {
                    if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*done {
                    self.done_cv.wait(&mut done);
                }
            }
        }
    }
}

/// The load-generation client.
pub struct PerfClient {
    shared: Arc<ClientShared>,
    workers: Vec<Worker>,
    remote: SocketAddr,
}

impl PerfClient {
    /// Validates the plan and resolves the target. No I/O beyond
    /// resolution happens until [`start`].
    ///
    /// [`start`]: PerfClient::start
    pub fn new(config: Config, stack: Stack) -> Result<Self> {
        let config = config.validated()?;
        let remote = resolve_target(&config)?;
        debug!("resolved {} to {}", config.target, remote);

        let response_hint = if config.timed { u64::MAX } else { config.download };
        let buffer = RequestBuffer::new(config.io_size, response_hint);
        let latency = LatencyCollector::for_config(&config);

        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                stack,
                buffer,
                latency,
                running: AtomicBool::new(true),
                connections_finished: AtomicU64::new(0),
                done: Mutex::new(false),
                done_cv: Condvar::new(),
            }),
            workers: Vec::new(),
            remote,
        })
    }

    /// Launches the workers and distributes the connection plan.
    pub fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            return Err(Error::Config("client already started".to_string()));
        }
        let config = &self.shared.config;
        let cores = core_affinity::get_core_ids().unwrap_or_default();

        for index in 0..config.worker_count {
            let core = (!cores.is_empty()).then(|| cores[index as usize % cores.len()]);
            let processor = core.map_or(index as usize, |c| c.id);

            let mut target = config.target.clone();
            if config.increment_target {
                // Two uppercase hex digits of the processor id, so each
                // worker can address its own server instance.
                target.push_str(&format!("{:02X}", processor as u8));
            }
            let local_addr = if config.bind_addresses.is_empty() {
                None
            } else {
                config.bind_addresses[index as usize % config.bind_addresses.len()]
            };

            let (tx, rx) = unbounded();
            let shared = Arc::new(WorkerShared::new(
                processor,
                self.remote,
                target,
                local_addr,
                tx,
            ));
            let worker = Worker::spawn(
                index,
                core,
                config.affinitize,
                shared,
                self.shared.clone(),
                rx,
            )?;
            self.workers.push(worker);
        }

        info!(
            "started {} workers against {}",
            self.workers.len(),
            self.remote
        );

        if config.connection_count == 0 {
            self.shared.signal_done();
        } else {
            for i in 0..config.connection_count {
                self.workers[i as usize % self.workers.len()]
                    .shared
                    .queue_new_connection();
            }
        }
        Ok(())
    }

    /// Blocks until the run completes or the run-time ceiling elapses,
    /// then winds the workers down and prints the completion line.
    pub fn wait(&mut self) -> Result<()> {
        let run_time = self.shared.config.run_time;
        let timeout = (run_time > 0).then(|| Duration::from_millis(run_time as u64));
        self.shared.wait_done(timeout);
        self.shutdown_workers();

        println!(
            "Completed {} connections and {} streams!",
            self.connections_completed(),
            self.streams_completed()
        );
        Ok(())
    }

    fn shutdown_workers(&mut self) {
        self.shared.stop();
        for worker in &self.workers {
            worker.shared.wake();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn connections_connected(&self) -> u64 {
        self.sum_workers(|w| &w.connections_connected)
    }

    pub fn connections_completed(&self) -> u64 {
        self.sum_workers(|w| &w.connections_completed)
    }

    pub fn streams_started(&self) -> u64 {
        self.sum_workers(|w| &w.streams_started)
    }

    pub fn streams_completed(&self) -> u64 {
        self.sum_workers(|w| &w.streams_completed)
    }

    /// The latency samples collected so far.
    pub fn latency(&self) -> &LatencyCollector {
        &self.shared.latency
    }

    /// The extra-data export blob, when latency tracking is enabled.
    pub fn extra_data(&self) -> Option<Vec<u8>> {
        (self.shared.latency.capacity() > 0)
            .then(|| self.shared.latency.extra_data(self.shared.config.run_time))
    }

    fn sum_workers(&self, field: impl Fn(&WorkerShared) -> &AtomicU64) -> u64 {
        self.workers
            .iter()
            .map(|w| field(&w.shared).load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for PerfClient {
    fn drop(&mut self) {
        self.shutdown_workers();
    }
}

/// Resolves the target once, honoring the address-family hint.
fn resolve_target(config: &Config) -> Result<SocketAddr> {
    let addrs = (config.target.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("failed to resolve '{}': {e}", config.target)))?;
    addrs
        .into_iter()
        .find(|addr| config.address_family.matches(addr))
        .ok_or_else(|| {
            Error::Resolve(format!(
                "no address of the requested family for '{}'",
                config.target
            ))
        })
}

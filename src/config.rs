use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::{Error, Result};

/// Default server port.
pub const DEFAULT_PORT: u16 = 4433;

/// Default I/O chunk size in bytes.
pub const DEFAULT_IO_SIZE: u32 = 64 * 1024;

/// Smallest permitted I/O chunk size.
pub const MIN_IO_SIZE: u32 = 256;

/// Longest permitted CIBIR identifier, excluding the offset byte.
pub const MAX_CIBIR_LENGTH: usize = 6;

/// Transport stack selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// The connection-oriented encrypted datagram protocol.
    Datagram,
    /// Plain TCP.
    Tcp,
}

/// Address-family hint for target resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    Unspecified,
    V4,
    V6,
}

impl AddressFamily {
    /// Maps the CLI `0/4/6` hint.
    pub fn from_hint(hint: u8) -> Result<Self> {
        match hint {
            0 => Ok(Self::Unspecified),
            4 => Ok(Self::V4),
            6 => Ok(Self::V6),
            other => Err(Error::Config(format!("invalid ip hint '{other}', expected 0, 4 or 6"))),
        }
    }

    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Unspecified => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// The immutable run plan.
///
/// Built once at startup, then shared read-only by every worker. Upload and
/// download counts are bytes, or milliseconds when `timed` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server hostname or literal IP.
    pub target: String,

    /// Server port.
    pub port: u16,

    /// Address-family hint for resolution.
    pub address_family: AddressFamily,

    /// Opaque CIBIR identifier bytes (at most [`MAX_CIBIR_LENGTH`]); the
    /// wire form is prefixed with a zero offset byte.
    pub cibir: Option<Vec<u8>>,

    /// Append a 2-hex-digit processor id to the hostname per worker.
    pub increment_target: bool,

    /// Worker thread count.
    pub worker_count: u32,

    /// Pin each worker to its processor.
    pub affinitize: bool,

    /// Per-worker local bind addresses; cycled when shorter than the worker
    /// count. `None` entries bind with an unspecified address.
    pub bind_addresses: Vec<Option<SocketAddr>>,

    /// Permit multiple connections to share a local binding.
    pub share_binding: bool,

    /// Transport selector.
    pub transport: TransportKind,

    /// Transport encryption toggle.
    pub encryption: bool,

    /// Send pacing toggle.
    pub pacing: bool,

    /// Kernel/transport send buffering toggle.
    pub send_buffering: bool,

    /// Print per-stream throughput lines.
    pub print_throughput: bool,

    /// Print per-connection statistics.
    pub print_connections: bool,

    /// Print per-stream statistics.
    pub print_streams: bool,

    /// Track (and export) per-request latencies.
    pub print_latency: bool,

    /// Number of connections to open.
    pub connection_count: u32,

    /// Streams per connection. Implicitly 1 when upload or download is set.
    pub stream_count: u32,

    /// Bytes to send per stream, or milliseconds when `timed`.
    pub upload: u64,

    /// Bytes to receive per stream, or milliseconds when `timed`.
    pub download: u64,

    /// Reinterpret upload/download as durations.
    pub timed: bool,

    /// I/O chunk size in bytes.
    pub io_size: u32,

    /// Repeat the scenario at connection level.
    pub repeat_connections: bool,

    /// Repeat the scenario at stream level.
    pub repeat_streams: bool,

    /// Overall run time ceiling in milliseconds (0 = unbounded).
    pub run_time: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: String::new(),
            port: DEFAULT_PORT,
            address_family: AddressFamily::Unspecified,
            cibir: None,
            increment_target: false,
            worker_count: num_cpus::get() as u32,
            affinitize: false,
            bind_addresses: Vec::new(),
            share_binding: false,
            transport: TransportKind::Datagram,
            encryption: true,
            pacing: true,
            send_buffering: false,
            print_throughput: false,
            print_connections: false,
            print_streams: false,
            print_latency: false,
            connection_count: 1,
            stream_count: 0,
            upload: 0,
            download: 0,
            timed: false,
            io_size: DEFAULT_IO_SIZE,
            repeat_connections: false,
            repeat_streams: false,
            run_time: 0,
        }
    }
}

impl Config {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_connections(mut self, count: u32) -> Self {
        self.connection_count = count;
        self
    }

    pub fn with_streams(mut self, count: u32) -> Self {
        self.stream_count = count;
        self
    }

    pub fn with_upload(mut self, upload: u64) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_download(mut self, download: u64) -> Self {
        self.download = download;
        self
    }

    pub fn with_timed(mut self, timed: bool) -> Self {
        self.timed = timed;
        self
    }

    pub fn with_io_size(mut self, io_size: u32) -> Self {
        self.io_size = io_size;
        self
    }

    pub fn with_workers(mut self, count: u32) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_run_time(mut self, millis: u32) -> Self {
        self.run_time = millis;
        self
    }

    pub fn with_repeat_streams(mut self, repeat: bool) -> Self {
        self.repeat_streams = repeat;
        self
    }

    pub fn with_repeat_connections(mut self, repeat: bool) -> Self {
        self.repeat_connections = repeat;
        self
    }

    pub fn with_latency_tracking(mut self, enabled: bool) -> Self {
        self.print_latency = enabled;
        self
    }

    /// True when any specific local binding behavior was requested, which
    /// switches connections to shared-binding setup.
    pub fn specific_local_addresses(&self) -> bool {
        self.share_binding || !self.bind_addresses.is_empty()
    }

    /// CIBIR identifier in wire form: offset byte followed by the id bytes.
    pub fn cibir_wire(&self) -> Option<Vec<u8>> {
        self.cibir.as_ref().map(|id| {
            let mut wire = Vec::with_capacity(id.len() + 1);
            wire.push(0u8);
            wire.extend_from_slice(id);
            wire
        })
    }

    /// Checks the plan for the rejected combinations and normalizes the
    /// implicit ones (upload/download imply one stream).
    pub fn validated(mut self) -> Result<Self> {
        if self.target.is_empty() {
            return Err(Error::Config("must specify a target".to_string()));
        }
        if self.io_size < MIN_IO_SIZE {
            return Err(Error::Config(format!(
                "'iosize' too small, minimum is {MIN_IO_SIZE}"
            )));
        }
        if (self.repeat_connections || self.repeat_streams) && self.run_time == 0 {
            return Err(Error::Config(
                "must specify a 'runtime' if using a repeat parameter".to_string(),
            ));
        }
        if self.transport == TransportKind::Tcp && !self.encryption {
            return Err(Error::Config(
                "TCP mode doesn't support disabling encryption".to_string(),
            ));
        }
        if let Some(id) = &self.cibir {
            if id.is_empty() || id.len() > MAX_CIBIR_LENGTH {
                return Err(Error::Config(format!(
                    "CIBIR ID must be a hex string of 1 to {MAX_CIBIR_LENGTH} bytes"
                )));
            }
        }
        if self.worker_count == 0 {
            self.worker_count = 1;
        }
        if (self.upload > 0 || self.download > 0) && self.stream_count == 0 {
            self.stream_count = 1;
        }
        Ok(self)
    }
}

/// Decodes a CIBIR hex string into raw identifier bytes.
pub fn parse_cibir(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if hex.is_empty() || hex.len() % 2 != 0 || hex.len() / 2 > MAX_CIBIR_LENGTH {
        return Err(Error::Config(format!(
            "CIBIR ID must be a hex string of 1 to {MAX_CIBIR_LENGTH} bytes"
        )));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| Error::Config(format!("invalid CIBIR hex string '{hex}'")))?;
        bytes.push(byte);
    }
    Ok(bytes)
}

/// Parses a comma-separated bind-address list. Each entry is `*`, an IP
/// address, or an `ip:port` pair; `*` leaves the binding unspecified.
pub fn parse_bind_list(list: &str) -> Result<Vec<Option<SocketAddr>>> {
    let mut out = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry == "*" {
            out.push(None);
        } else if let Ok(addr) = entry.parse::<SocketAddr>() {
            out.push(Some(addr));
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            out.push(Some(SocketAddr::new(ip, 0)));
        } else {
            return Err(Error::Config(format!(
                "failed to decode bind address '{entry}': must be *, an IPv4 or an IPv6 address"
            )));
        }
    }
    Ok(out)
}

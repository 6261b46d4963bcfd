//! Per-stream state machine.
//!
//! A stream sends its configured upload (or an 8-byte probe), receives its
//! configured download, and records one latency sample when both halves
//! finish successfully. The send loop keeps `bytes_outstanding` below the
//! ideal send buffer and is re-entered from send completions, which is the
//! sole mechanism that keeps the pipeline full after the initial burst.

use log::debug;
use std::time::{Duration, Instant};

use crate::buffer::{RequestBuffer, RESPONSE_HINT_SIZE};
use crate::config::Config;
use crate::latency::LatencyCollector;
use crate::pool::SendDataPool;
use crate::transport::datagram::{DatagramStream, SendFlags, StreamShutdown};
use crate::transport::tcp::TcpConnection;

/// Outstanding-byte ceiling until the transport provides a hint.
pub const DEFAULT_IDEAL_SEND_BUFFER: u64 = 128 * 1024;

/// Where sends are dispatched: a datagram stream carries its own handle,
/// TCP sends go through the owning connection.
pub(crate) enum SendTarget<'a> {
    Datagram,
    Tcp(&'a mut dyn TcpConnection),
}

/// Shared context threaded into the send loop.
pub(crate) struct SendContext<'a> {
    pub config: &'a Config,
    pub buffer: &'a RequestBuffer,
    pub sends: &'a mut SendDataPool,
}

pub(crate) struct Stream {
    /// Datagram-protocol stream handle; `None` in TCP mode.
    pub handle: Option<Box<dyn DatagramStream>>,
    /// TCP stream table id; unused in datagram mode.
    pub tcp_id: u32,

    pub start_time: Instant,
    pub send_end_time: Option<Instant>,
    pub recv_start_time: Option<Instant>,
    pub recv_end_time: Option<Instant>,

    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub bytes_outstanding: u64,
    pub bytes_received: u64,

    pub ideal_send_buffer: u64,
    pub send_complete: bool,
}

impl Stream {
    pub fn new() -> Self {
        Self {
            handle: None,
            tcp_id: 0,
            start_time: Instant::now(),
            send_end_time: None,
            recv_start_time: None,
            recv_end_time: None,
            bytes_sent: 0,
            bytes_acked: 0,
            bytes_outstanding: 0,
            bytes_received: 0,
            ideal_send_buffer: DEFAULT_IDEAL_SEND_BUFFER,
            send_complete: false,
        }
    }

    /// The flow-control-aware send loop. Issues sends until the FIN has
    /// been attached or the outstanding window fills.
    pub fn send(&mut self, target: SendTarget<'_>, cx: &mut SendContext<'_>) {
        let mut tcp = match target {
            SendTarget::Datagram => None,
            SendTarget::Tcp(conn) => Some(conn),
        };

        while !self.send_complete && self.bytes_outstanding < self.ideal_send_buffer {
            let bytes_left = if cx.config.timed {
                u64::MAX // timed sends run until the clock says stop
            } else if cx.config.upload > 0 {
                cx.config.upload - self.bytes_sent
            } else {
                RESPONSE_HINT_SIZE as u64
            };

            let mut data_length = cx.config.io_size as u64;
            let mut fin = false;
            let payload;

            if data_length >= bytes_left {
                data_length = bytes_left;
                payload = cx.buffer.last(data_length);
                fin = true;
                self.send_complete = true;
            } else {
                payload = cx.buffer.full();
                if cx.config.timed
                    && self.start_time.elapsed() >= Duration::from_millis(cx.config.upload)
                {
                    fin = true;
                    self.send_complete = true;
                }
            }

            self.bytes_sent += data_length;
            self.bytes_outstanding += data_length;

            match tcp.as_deref_mut() {
                None => {
                    let flags = SendFlags { start: true, fin };
                    if let Some(handle) = self.handle.as_mut() {
                        if let Err(e) = handle.send(payload, flags) {
                            debug!("stream send failed: {e}");
                        }
                    }
                }
                Some(conn) => {
                    let mut record = cx.sends.alloc();
                    record.stream_id = self.tcp_id;
                    record.open = self.bytes_sent == data_length;
                    record.fin = fin;
                    record.abort = false;
                    record.length = data_length as u32;
                    record.buffer = payload;
                    conn.send(record);
                }
            }
        }
    }

    /// A send completed. Canceled sends never count as acknowledged; the
    /// caller re-enters the send loop for acknowledged ones.
    pub fn on_send_complete(&mut self, length: u64, canceled: bool) {
        self.bytes_outstanding -= length;
        if !canceled {
            self.bytes_acked += length;
        }
    }

    /// Bytes arrived. Returns true when the receive half must be
    /// force-ended now (timed download elapsed).
    pub fn on_receive(&mut self, length: u64, finished: bool, config: &Config) -> bool {
        self.bytes_received += length;

        let now = Instant::now();
        let recv_start = *self.recv_start_time.get_or_insert(now);

        if finished {
            self.recv_end_time = Some(now);
        }
        if config.timed
            && now.duration_since(recv_start) >= Duration::from_millis(config.download)
        {
            self.recv_end_time = Some(now);
            return true;
        }
        false
    }

    /// Transport updated its ideal-send-buffer hint. Returns true when the
    /// send loop should be re-entered.
    pub fn on_ideal_send_buffer(&mut self, byte_count: u64, config: &Config) -> bool {
        if config.upload > 0 && !config.send_buffering && self.ideal_send_buffer != byte_count {
            self.ideal_send_buffer = byte_count;
            return true;
        }
        false
    }

    /// Peer aborted its sending side: the download is over, abort the whole
    /// stream.
    pub fn on_peer_send_aborted(&mut self) {
        if self.recv_end_time.is_none() {
            self.recv_end_time = Some(Instant::now());
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.shutdown(StreamShutdown::Abort);
        }
    }

    /// Peer aborted its receiving side: stop uploading.
    pub fn on_peer_receive_aborted(&mut self) {
        if self.send_end_time.is_none() {
            self.send_end_time = Some(Instant::now());
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.shutdown(StreamShutdown::AbortSend);
        }
        self.send_complete = true;
    }

    /// The send direction finished shutting down.
    pub fn on_send_shutdown_complete(&mut self, config: &Config) {
        self.send_end_time = Some(Instant::now());
        if config.print_streams {
            println!(
                "Stream: {} bytes sent ({} acked), {} bytes received.",
                self.bytes_sent, self.bytes_acked, self.bytes_received
            );
        }
    }

    /// Force-ends the receive half on the datagram protocol.
    pub fn abort_receive(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.shutdown(StreamShutdown::AbortReceive);
        }
    }

    /// Both halves have terminated. Evaluates the success predicates,
    /// prints per-half throughput, and submits the latency sample.
    /// Returns true when the stream counts as completed.
    pub fn finish(self, config: &Config, latency: &LatencyCollector) -> bool {
        let mut send_success = self.send_end_time.is_some();
        if config.upload > 0 {
            let total = self.bytes_acked;
            if total < RESPONSE_HINT_SIZE as u64 || (!config.timed && total < config.upload) {
                send_success = false;
            }
            if config.print_throughput && send_success {
                if let Some(send_end) = self.send_end_time {
                    print_rate("  Upload", total, send_end.duration_since(self.start_time));
                }
            }
        }

        let mut recv_success = self.recv_start_time.is_some() && self.recv_end_time.is_some();
        if config.download > 0 {
            let total = self.bytes_received;
            if total == 0 || (!config.timed && total < config.download) {
                recv_success = false;
            }
            if config.print_throughput && recv_success {
                if let (Some(start), Some(end)) = (self.recv_start_time, self.recv_end_time) {
                    print_rate("Download", total, end.duration_since(start));
                }
            }
        }

        let success = send_success && recv_success;
        if success {
            if let Some(recv_end) = self.recv_end_time {
                let sample = recv_end.duration_since(self.start_time).as_micros();
                latency.record(sample.min(u64::MAX as u128) as u64);
            }
        }
        success
    }
}

fn print_rate(label: &str, bytes: u64, elapsed: Duration) {
    let micros = (elapsed.as_micros() as u64).max(1);
    let kbps = bytes.saturating_mul(8_000) / micros;
    println!(
        "{label}: {bytes} bytes @ {kbps} kbps ({}.{:03} ms).",
        micros / 1000,
        micros % 1000
    );
}

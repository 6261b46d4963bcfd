//! In-memory mock transports for engine tests.
//!
//! Both mocks play the server's role: they acknowledge sends, read the
//! response-length hint from the head of the request payload, and deliver
//! that many bytes back (or a paced unbounded feed for timed transfers).

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netbench::transport::datagram::{
    DatagramApi, DatagramConnection, DatagramStream, SendFlags, StreamEvent, StreamShutdown,
};
use netbench::transport::tcp::{TcpConnection, TcpEngine, TcpReceive, TcpSendData};
use netbench::transport::{ConnectParams, ConnectionSettings, EventSink, StreamId};

const RESPONSE_HINT_SIZE: usize = 8;
const FEED_LIMIT: usize = 5_000;

/// Counters the mocks expose for assertions.
#[derive(Default)]
pub struct MockCounters {
    pub connects: AtomicU64,
    pub streams_opened: AtomicU64,
    pub bytes_to_server: AtomicU64,
    pub max_concurrent_streams: AtomicU64,
}

fn read_hint(payload: &[u8]) -> Option<u64> {
    let head: [u8; RESPONSE_HINT_SIZE] = payload.get(..RESPONSE_HINT_SIZE)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}

// --- Datagram mock ---

pub struct MockDatagram {
    pub counters: Arc<MockCounters>,
    /// Fail the synchronous `start` call.
    pub fail_start: bool,
    /// Response delivery granularity.
    pub response_chunk: usize,
    /// Cadence of the unbounded feed used for timed downloads.
    pub feed_interval: Duration,
}

impl Default for MockDatagram {
    fn default() -> Self {
        Self {
            counters: Arc::new(MockCounters::default()),
            fail_start: false,
            response_chunk: 4096,
            feed_interval: Duration::from_millis(1),
        }
    }
}

impl DatagramApi for MockDatagram {
    fn open(
        &self,
        _settings: &ConnectionSettings,
        events: EventSink,
    ) -> io::Result<Box<dyn DatagramConnection>> {
        Ok(Box::new(MockConn {
            sink: events,
            counters: self.counters.clone(),
            fail_start: self.fail_start,
            chunk: self.response_chunk,
            feed_interval: self.feed_interval,
            active_streams: Arc::new(AtomicU64::new(0)),
        }))
    }
}

struct MockConn {
    sink: EventSink,
    counters: Arc<MockCounters>,
    fail_start: bool,
    chunk: usize,
    feed_interval: Duration,
    active_streams: Arc<AtomicU64>,
}

impl DatagramConnection for MockConn {
    fn set_disable_encryption(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_cibir_id(&mut self, _id: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn set_share_binding(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_local_address(&mut self, _addr: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn local_address(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:54321".parse().unwrap())
    }

    fn start(&mut self, _params: &ConnectParams) -> io::Result<()> {
        if self.fail_start {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock start failure",
            ));
        }
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        self.sink.connected();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.sink.connection_shutdown_complete();
    }

    fn open_stream(&mut self, id: StreamId) -> io::Result<Box<dyn DatagramStream>> {
        self.counters.streams_opened.fetch_add(1, Ordering::Relaxed);
        let active = self.active_streams.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters
            .max_concurrent_streams
            .fetch_max(active, Ordering::Relaxed);
        Ok(Box::new(MockStream {
            id,
            sink: self.sink.clone(),
            counters: self.counters.clone(),
            active: self.active_streams.clone(),
            chunk: self.chunk,
            feed_interval: self.feed_interval,
            hint: None,
            responded: false,
            send_done: false,
            recv_done: false,
            shutdown_emitted: false,
            stop_feed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MockStream {
    id: StreamId,
    sink: EventSink,
    counters: Arc<MockCounters>,
    active: Arc<AtomicU64>,
    chunk: usize,
    feed_interval: Duration,
    hint: Option<u64>,
    responded: bool,
    send_done: bool,
    recv_done: bool,
    shutdown_emitted: bool,
    stop_feed: Arc<AtomicBool>,
}

impl MockStream {
    fn maybe_shutdown(&mut self) {
        if self.send_done && self.recv_done && !self.shutdown_emitted {
            self.shutdown_emitted = true;
            self.sink.stream(self.id, StreamEvent::ShutdownComplete);
        }
    }

    fn respond(&mut self) {
        if self.responded {
            return;
        }
        self.responded = true;
        match self.hint.unwrap_or(0) {
            // Timed transfer: pace receives until the client aborts.
            u64::MAX => {
                let sink = self.sink.clone();
                let id = self.id;
                let chunk = self.chunk as u64;
                let interval = self.feed_interval;
                let stop = self.stop_feed.clone();
                std::thread::spawn(move || {
                    for _ in 0..FEED_LIMIT {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        sink.stream(
                            id,
                            StreamEvent::Receive {
                                length: chunk,
                                fin: false,
                            },
                        );
                        std::thread::sleep(interval);
                    }
                });
            }
            // Zero-length request: echo the probe.
            0 => {
                self.sink.stream(
                    self.id,
                    StreamEvent::Receive {
                        length: RESPONSE_HINT_SIZE as u64,
                        fin: true,
                    },
                );
                self.recv_done = true;
            }
            // Fixed download of `hint` bytes.
            hint => {
                let mut remaining = hint;
                while remaining > 0 {
                    let take = remaining.min(self.chunk as u64);
                    remaining -= take;
                    self.sink.stream(
                        self.id,
                        StreamEvent::Receive {
                            length: take,
                            fin: remaining == 0,
                        },
                    );
                }
                self.recv_done = true;
            }
        }
    }
}

impl DatagramStream for MockStream {
    fn send(&mut self, data: Bytes, flags: SendFlags) -> io::Result<()> {
        if self.hint.is_none() {
            self.hint = read_hint(&data);
        }
        self.counters
            .bytes_to_server
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.sink.stream(
            self.id,
            StreamEvent::SendComplete {
                length: data.len() as u64,
                canceled: false,
            },
        );
        if flags.fin {
            self.send_done = true;
            self.sink.stream(self.id, StreamEvent::SendShutdownComplete);
            self.respond();
            self.maybe_shutdown();
        }
        Ok(())
    }

    fn shutdown(&mut self, mode: StreamShutdown) {
        match mode {
            StreamShutdown::Abort => {
                self.stop_feed.store(true, Ordering::Relaxed);
                self.send_done = true;
                self.recv_done = true;
            }
            StreamShutdown::AbortSend => {
                self.send_done = true;
            }
            StreamShutdown::AbortReceive => {
                self.stop_feed.store(true, Ordering::Relaxed);
                self.recv_done = true;
            }
        }
        self.maybe_shutdown();
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.stop_feed.store(true, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// --- TCP mock ---

pub struct MockTcp {
    pub counters: Arc<MockCounters>,
    /// Report the connect attempt as failed (asynchronously).
    pub connect_fails: bool,
    /// Deliver events for a stream id the engine never opened.
    pub emit_bogus_ids: bool,
    pub response_chunk: usize,
    pub feed_interval: Duration,
}

impl Default for MockTcp {
    fn default() -> Self {
        Self {
            counters: Arc::new(MockCounters::default()),
            connect_fails: false,
            emit_bogus_ids: false,
            response_chunk: 4096,
            feed_interval: Duration::from_millis(1),
        }
    }
}

impl TcpEngine for MockTcp {
    fn connect(
        &self,
        _params: &ConnectParams,
        events: EventSink,
    ) -> io::Result<Box<dyn TcpConnection>> {
        if self.connect_fails {
            events.tcp_connect(false);
        } else {
            self.counters.connects.fetch_add(1, Ordering::Relaxed);
            events.tcp_connect(true);
            if self.emit_bogus_ids {
                events.tcp_send_complete(vec![TcpSendData {
                    stream_id: 0xdead,
                    length: 64,
                    ..TcpSendData::default()
                }]);
                events.tcp_receive(TcpReceive {
                    stream_id: 0xdead,
                    open: false,
                    fin: true,
                    abort: false,
                    length: 64,
                });
            }
        }
        Ok(Box::new(MockTcpConn {
            sink: events,
            counters: self.counters.clone(),
            chunk: self.response_chunk,
            feed_interval: self.feed_interval,
            streams: Mutex::new(HashMap::new()),
            closed: false,
        }))
    }
}

#[derive(Default)]
struct TcpStreamState {
    hint: Option<u64>,
    responded: bool,
    stop_feed: Arc<AtomicBool>,
}

struct MockTcpConn {
    sink: EventSink,
    counters: Arc<MockCounters>,
    chunk: usize,
    feed_interval: Duration,
    streams: Mutex<HashMap<u32, TcpStreamState>>,
    closed: bool,
}

impl MockTcpConn {
    fn respond(&self, stream_id: u32) {
        let (hint, stop) = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream_id).or_default();
            if state.responded {
                return;
            }
            state.responded = true;
            (state.hint.unwrap_or(0), state.stop_feed.clone())
        };

        match hint {
            u64::MAX => {
                let sink = self.sink.clone();
                let chunk = self.chunk as u64;
                let interval = self.feed_interval;
                std::thread::spawn(move || {
                    let mut first = true;
                    for _ in 0..FEED_LIMIT {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        sink.tcp_receive(TcpReceive {
                            stream_id,
                            open: first,
                            fin: false,
                            abort: false,
                            length: chunk,
                        });
                        first = false;
                        std::thread::sleep(interval);
                    }
                });
            }
            0 => self.sink.tcp_receive(TcpReceive {
                stream_id,
                open: true,
                fin: true,
                abort: false,
                length: RESPONSE_HINT_SIZE as u64,
            }),
            hint => {
                let mut remaining = hint;
                let mut first = true;
                while remaining > 0 {
                    let take = remaining.min(self.chunk as u64);
                    remaining -= take;
                    self.sink.tcp_receive(TcpReceive {
                        stream_id,
                        open: first,
                        fin: remaining == 0,
                        abort: false,
                        length: take,
                    });
                    first = false;
                }
            }
        }
    }
}

impl TcpConnection for MockTcpConn {
    fn send(&mut self, data: TcpSendData) {
        let stream_id = data.stream_id;

        if data.abort {
            // The client is force-ending its receive half; stop feeding.
            if let Some(state) = self.streams.lock().get(&stream_id) {
                state.stop_feed.store(true, Ordering::Relaxed);
            }
            self.sink.tcp_send_complete(vec![data]);
            return;
        }

        {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream_id).or_default();
            if state.hint.is_none() {
                state.hint = read_hint(&data.buffer);
            }
        }
        self.counters
            .bytes_to_server
            .fetch_add(data.length as u64, Ordering::Relaxed);

        let fin = data.fin;
        self.sink.tcp_send_complete(vec![data]);
        if fin {
            self.respond(stream_id);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            for state in self.streams.lock().values() {
                state.stop_feed.store(true, Ordering::Relaxed);
            }
            self.sink.tcp_connect(false);
        }
    }
}

impl Drop for MockTcpConn {
    fn drop(&mut self) {
        for state in self.streams.lock().values() {
            state.stop_feed.store(true, Ordering::Relaxed);
        }
    }
}

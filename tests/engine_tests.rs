//! End-to-end engine tests against the in-memory mock transports.
//!
//! These mirror the boundary scenarios of the tool's measurement modes with
//! timings scaled down to keep the suite fast.

mod common;

use common::{MockCounters, MockDatagram, MockTcp};
use netbench::{decode_extra_data, Config, PerfClient, Stack};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn datagram_stack(mock: MockDatagram) -> Stack {
    Stack::Datagram(Box::new(mock))
}

fn tcp_stack(mock: MockTcp) -> Stack {
    Stack::Tcp(Box::new(mock))
}

fn run(config: Config, stack: Stack) -> PerfClient {
    let mut client = PerfClient::new(config, stack).unwrap();
    client.start().unwrap();
    client.wait().unwrap();
    client
}

#[test]
fn test_handshake_only_rate() {
    // Pure HPS run: every connection connects, opens no streams, and shuts
    // straight down. Terminates without a runtime ceiling.
    let counters = Arc::new(MockCounters::default());
    let mock = MockDatagram {
        counters: counters.clone(),
        ..MockDatagram::default()
    };
    let config = Config::new("127.0.0.1")
        .with_connections(200)
        .with_streams(0)
        .with_workers(4);

    let client = run(config, datagram_stack(mock));

    assert_eq!(client.connections_connected(), 200);
    assert_eq!(client.connections_completed(), 200);
    assert_eq!(client.streams_started(), 0);
    assert_eq!(client.streams_completed(), 0);
    assert_eq!(counters.streams_opened.load(Ordering::Relaxed), 0);
}

#[test]
fn test_single_request_rtt() {
    // An 8-byte probe with FIN, an echo back, one latency sample.
    let counters = Arc::new(MockCounters::default());
    let mock = MockDatagram {
        counters: counters.clone(),
        ..MockDatagram::default()
    };
    let config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_streams(1)
        .with_workers(1)
        .with_latency_tracking(true);

    let client = run(config, datagram_stack(mock));

    assert_eq!(client.connections_completed(), 1);
    assert_eq!(client.streams_completed(), 1);
    assert_eq!(client.latency().len(), 1);
    assert_eq!(counters.bytes_to_server.load(Ordering::Relaxed), 8);
}

#[test]
fn test_fixed_upload() {
    // 1 MiB upload in 4 KiB chunks; the server sees exactly the upload.
    let counters = Arc::new(MockCounters::default());
    let mock = MockDatagram {
        counters: counters.clone(),
        ..MockDatagram::default()
    };
    let config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_workers(1)
        .with_upload(1_048_576)
        .with_io_size(4096);

    let client = run(config, datagram_stack(mock));

    assert_eq!(client.streams_completed(), 1);
    assert_eq!(counters.bytes_to_server.load(Ordering::Relaxed), 1_048_576);
}

#[test]
fn test_timed_download() {
    // The stream receives for ~40 ms, aborts its receive half, and still
    // counts as a success with a latency sample.
    let mock = MockDatagram::default();
    let config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_workers(1)
        .with_download(40)
        .with_timed(true)
        .with_run_time(2000)
        .with_latency_tracking(true);

    let client = run(config, datagram_stack(mock));

    assert_eq!(client.streams_completed(), 1);
    assert_eq!(client.latency().len(), 1);
    // ~40 ms of receiving at 1 ms cadence.
    assert!(client.latency().snapshot()[0] >= 30_000);
}

#[test]
fn test_repeat_stream_sustained() {
    // Repeat-stream mode holds the configured fan-out until the run timer
    // elapses, never exceeding it.
    let counters = Arc::new(MockCounters::default());
    let mock = MockDatagram {
        counters: counters.clone(),
        ..MockDatagram::default()
    };
    let config = Config::new("127.0.0.1")
        .with_connections(2)
        .with_streams(4)
        .with_workers(2)
        .with_upload(4096)
        .with_repeat_streams(true)
        .with_run_time(400);

    let client = run(config, datagram_stack(mock));

    assert!(client.streams_completed() >= 8, "run produced too few streams");
    assert!(counters.max_concurrent_streams.load(Ordering::Relaxed) <= 4);
    // Streams kept recycling; connections never wound down on their own.
    assert_eq!(client.connections_completed(), 0);
}

#[test]
fn test_repeat_connection_sustained() {
    let config = Config::new("127.0.0.1")
        .with_connections(2)
        .with_streams(1)
        .with_workers(2)
        .with_repeat_connections(true)
        .with_run_time(300);

    let client = run(config, datagram_stack(MockDatagram::default()));

    // Far more connections completed than the configured standing count.
    assert!(client.connections_completed() > 2);
    assert!(client.streams_completed() >= client.connections_completed());
}

#[test]
fn test_connection_setup_failure_still_terminates() {
    let mock = MockDatagram {
        fail_start: true,
        ..MockDatagram::default()
    };
    let config = Config::new("127.0.0.1")
        .with_connections(8)
        .with_streams(1)
        .with_workers(2);

    let client = run(config, datagram_stack(mock));

    // Setup failures are not completions, but the run still ends.
    assert_eq!(client.connections_completed(), 0);
    assert_eq!(client.connections_connected(), 0);
    assert_eq!(client.streams_completed(), 0);
}

#[test]
fn test_extra_data_round_trip() {
    let config = Config::new("127.0.0.1")
        .with_connections(2)
        .with_streams(2)
        .with_workers(2)
        .with_latency_tracking(true);

    let client = run(config, datagram_stack(MockDatagram::default()));

    assert_eq!(client.streams_completed(), 4);
    let blob = client.extra_data().expect("latency tracking was enabled");
    let (run_time, samples) = decode_extra_data(&blob).unwrap();
    assert_eq!(run_time, 0);
    assert_eq!(samples, client.latency().snapshot());
    assert_eq!(samples.len(), 4);
}

#[test]
fn test_extra_data_absent_without_latency_tracking() {
    let config = Config::new("127.0.0.1").with_connections(1).with_streams(1);
    let client = run(config, datagram_stack(MockDatagram::default()));
    assert!(client.extra_data().is_none());
    assert_eq!(client.streams_completed(), 1);
}

#[test]
fn test_tcp_handshake_and_close() {
    let counters = Arc::new(MockCounters::default());
    let mock = MockTcp {
        counters: counters.clone(),
        ..MockTcp::default()
    };
    let mut config = Config::new("127.0.0.1")
        .with_connections(50)
        .with_streams(0)
        .with_workers(2);
    config.transport = netbench::TransportKind::Tcp;

    let client = run(config, tcp_stack(mock));

    assert_eq!(client.connections_connected(), 50);
    assert_eq!(client.connections_completed(), 50);
    assert_eq!(counters.connects.load(Ordering::Relaxed), 50);
}

#[test]
fn test_tcp_upload_download() {
    let counters = Arc::new(MockCounters::default());
    let mock = MockTcp {
        counters: counters.clone(),
        ..MockTcp::default()
    };
    let mut config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_streams(2)
        .with_workers(1)
        .with_upload(8192)
        .with_download(4096)
        .with_io_size(4096)
        .with_latency_tracking(true);
    config.transport = netbench::TransportKind::Tcp;

    let client = run(config, tcp_stack(mock));

    assert_eq!(client.streams_completed(), 2);
    assert_eq!(client.latency().len(), 2);
    assert_eq!(counters.bytes_to_server.load(Ordering::Relaxed), 2 * 8192);
}

#[test]
fn test_tcp_timed_download_aborts_receive() {
    let mock = MockTcp::default();
    let mut config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_streams(1)
        .with_workers(1)
        .with_download(40)
        .with_timed(true)
        .with_run_time(2000)
        .with_latency_tracking(true);
    config.transport = netbench::TransportKind::Tcp;

    let client = run(config, tcp_stack(mock));

    assert_eq!(client.streams_completed(), 1);
    assert_eq!(client.latency().len(), 1);
}

#[test]
fn test_tcp_connect_failure_completes_run() {
    let mock = MockTcp {
        connect_fails: true,
        ..MockTcp::default()
    };
    let mut config = Config::new("127.0.0.1")
        .with_connections(4)
        .with_streams(1)
        .with_workers(2);
    config.transport = netbench::TransportKind::Tcp;

    let client = run(config, tcp_stack(mock));

    // Failed connects flow through the shutdown path and count as
    // completed connections, with no streams ever started.
    assert_eq!(client.connections_connected(), 0);
    assert_eq!(client.connections_completed(), 4);
    assert_eq!(client.streams_completed(), 0);
}

#[test]
fn test_tcp_stale_stream_ids_are_dropped() {
    // Events for ids the engine never opened must be ignored, not crash.
    let mock = MockTcp {
        emit_bogus_ids: true,
        ..MockTcp::default()
    };
    let mut config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_streams(1)
        .with_workers(1)
        .with_upload(4096);
    config.transport = netbench::TransportKind::Tcp;

    let client = run(config, tcp_stack(mock));

    assert_eq!(client.streams_completed(), 1);
}

#[test]
fn test_run_time_ceiling_bounds_wait() {
    // A repeat run with a short ceiling returns promptly even though work
    // never drains on its own.
    let start = std::time::Instant::now();
    let config = Config::new("127.0.0.1")
        .with_connections(1)
        .with_streams(1)
        .with_workers(1)
        .with_upload(4096)
        .with_repeat_streams(true)
        .with_run_time(200);

    let client = run(config, datagram_stack(MockDatagram::default()));

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(client.streams_completed() > 0);
}

#[test]
fn test_connection_distribution_across_workers() {
    // More workers than connections: the spare workers stay idle and the
    // run still completes.
    let config = Config::new("127.0.0.1")
        .with_connections(3)
        .with_streams(1)
        .with_workers(8);

    let client = run(config, datagram_stack(MockDatagram::default()));

    assert_eq!(client.connections_completed(), 3);
    assert_eq!(client.streams_completed(), 3);
}

use clap::{ArgAction, CommandFactory, Parser};
use log::info;

use netbench::drivers::tcp::NativeTcpEngine;
use netbench::drivers::udp::UdpDatagramDriver;
use netbench::{config, AddressFamily, Config, Error, PerfClient, Stack, TransportKind};

/// Accepts the `0/1` switch values alongside `true/false`.
fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        _ => Err(format!("expected 0 or 1, got '{value}'")),
    }
}

#[derive(Parser)]
#[command(name = "netbench")]
#[command(about = "Network performance client: drives connections and streams against a \
                   server over the datagram protocol or TCP and measures throughput, \
                   handshake rate and request latency")]
#[command(version)]
struct Cli {
    /// Hostname or literal IP of the server
    #[arg(long, visible_alias = "server")]
    target: String,

    /// Address-family hint for resolving the hostname: 0 = any, 4, or 6
    #[arg(long, default_value_t = 0)]
    ip: u8,

    /// The UDP/TCP port of the server
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// CIBIR well-known identifier (up to 6 hex bytes)
    #[arg(long)]
    cibir: Option<String>,

    /// Append a 2-hex-digit processor id to the hostname per worker
    #[arg(long = "incrementtarget", action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    increment_target: bool,

    /// Number of worker threads (defaults to the active processor count)
    #[arg(long, visible_alias = "workers")]
    threads: Option<u32>,

    /// Pin each worker thread to its processor
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    affinitize: bool,

    /// Comma-separated local bind addresses, cycled across workers
    #[arg(long)]
    bind: Option<String>,

    /// Share the same local binding between connections
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    share: bool,

    /// Use TCP instead of the datagram protocol
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    tcp: bool,

    /// Enable transport encryption
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "1")]
    encrypt: bool,

    /// Enable send pacing
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "1")]
    pacing: bool,

    /// Enable kernel/transport send buffering
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    sendbuf: bool,

    /// Print throughput information
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    ptput: bool,

    /// Print connection statistics
    #[arg(long, visible_alias = "pconnection", action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    pconn: bool,

    /// Print stream statistics
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    pstream: bool,

    /// Track request latencies and export them at the end of the run
    #[arg(long, visible_alias = "plat", action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    platency: bool,

    /// Number of connections to use
    #[arg(long, default_value_t = 1)]
    conns: u32,

    /// Number of streams to send on at a time
    #[arg(long, visible_alias = "requests", default_value_t = 0)]
    streams: u32,

    /// Bytes to send on each stream (milliseconds when --timed 1)
    #[arg(long, visible_aliases = ["up", "request"], default_value_t = 0)]
    upload: u64,

    /// Bytes to receive on each stream (milliseconds when --timed 1)
    #[arg(long, visible_aliases = ["down", "response"], default_value_t = 0)]
    download: u64,

    /// Interpret the upload/download arguments as times in milliseconds
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    timed: bool,

    /// I/O chunk size in bytes (minimum 256)
    #[arg(long, default_value_t = config::DEFAULT_IO_SIZE)]
    iosize: u32,

    /// Repeat the scenario at the connection level
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    rconn: bool,

    /// Repeat the scenario at the stream level
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, default_value = "0")]
    rstream: bool,

    /// Total run time in milliseconds; required for repeat scenarios
    #[arg(long, visible_aliases = ["time", "run"], default_value_t = 0)]
    runtime: u32,
}

fn build_config(cli: &Cli) -> netbench::Result<Config> {
    let mut config = Config::new(cli.target.clone());
    config.port = cli.port;
    config.address_family = AddressFamily::from_hint(cli.ip)?;
    if let Some(hex) = &cli.cibir {
        config.cibir = Some(config::parse_cibir(hex)?);
    }
    config.increment_target = cli.increment_target;
    if let Some(threads) = cli.threads {
        config.worker_count = threads;
    }
    config.affinitize = cli.affinitize;
    if let Some(bind) = &cli.bind {
        config.bind_addresses = config::parse_bind_list(bind)?;
    }
    config.share_binding = cli.share;
    config.transport = if cli.tcp {
        TransportKind::Tcp
    } else {
        TransportKind::Datagram
    };
    config.encryption = cli.encrypt;
    config.pacing = cli.pacing;
    config.send_buffering = cli.sendbuf;
    config.print_throughput = cli.ptput;
    config.print_connections = cli.pconn;
    config.print_streams = cli.pstream;
    config.print_latency = cli.platency;
    config.connection_count = cli.conns;
    config.stream_count = cli.streams;
    config.upload = cli.upload;
    config.download = cli.download;
    config.timed = cli.timed;
    config.io_size = cli.iosize;
    config.repeat_connections = cli.rconn;
    config.repeat_streams = cli.rstream;
    config.run_time = cli.runtime;
    config.validated()
}

fn run(cli: &Cli) -> netbench::Result<()> {
    let config = build_config(cli)?;
    let stack = match config.transport {
        TransportKind::Tcp => Stack::Tcp(Box::new(NativeTcpEngine)),
        TransportKind::Datagram => Stack::Datagram(Box::new(UdpDatagramDriver)),
    };

    let mut client = PerfClient::new(config, stack)?;
    client.start()?;
    client.wait()?;

    if let Some(blob) = client.extra_data() {
        info!(
            "captured {} latency samples ({} bytes of extra data)",
            client.latency().len(),
            blob.len()
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => Ok(()),
        Err(Error::Config(message)) => {
            eprintln!("{message}\n");
            let _ = Cli::command().print_help();
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

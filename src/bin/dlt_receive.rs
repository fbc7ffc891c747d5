//! `dlt-receive`: the thin command-line receiver of spec §6 — connect
//! to a live DLT source (host or file), optionally filter it, and
//! append the raw frames it sees to an output file. Grounded in the
//! original's `py_dlt_receive.py` and the teacher's `clap`-derived
//! `Args`/`anyhow::Context` idiom in `main.rs`.

use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use dlt_broker::broker::{Broker, Config as BrokerConfig};
use dlt_broker::config::Settings;
use dlt_broker::filter::FilterSet;
use dlt_broker::source::file::{FileSource, StopToken};
use dlt_broker::source::socket::{is_multicast_address, Endpoint, SocketSource, DEFAULT_PORT};

/// Connects to a DLT source and writes every received frame to a file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Host or multicast group to connect to (mutually exclusive with `--file`).
    #[clap(long)]
    host: Option<String>,

    /// Port to connect to when `--host` is given.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local interface to join a multicast group on.
    #[clap(long, default_value = "0.0.0.0")]
    interface: String,

    /// File to tail instead of connecting over the network (mutually
    /// exclusive with `--host`).
    #[clap(long)]
    file: Option<PathBuf>,

    /// Restrict reception to this (apid, ctid) pair; may be repeated.
    #[clap(long = "filter", value_name = "APID:CTID")]
    filters: Vec<String>,

    /// Output file frames are appended to.
    output: PathBuf,

    /// App-level config file (defaults to the platform config dir).
    #[clap(long)]
    config: Option<PathBuf>,
}

fn parse_filter_pair(spec: &str) -> Result<(dlt_broker::codec::FourCc, dlt_broker::codec::FourCc)> {
    let (apid, ctid) = spec
        .split_once(':')
        .with_context(|| format!("filter '{spec}' must be APID:CTID"))?;
    Ok((
        dlt_broker::codec::FourCc::new(apid),
        dlt_broker::codec::FourCc::new(ctid),
    ))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load(path).unwrap_or_default(),
        None => Settings::load_default(),
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.default_log_level),
    )
    .init();

    if args.host.is_some() == args.file.is_some() {
        bail!("exactly one of --host or --file must be given");
    }

    let broker_config = BrokerConfig {
        ack_timeout: settings.ack_timeout(),
        ignore_ack_timeout: settings.ignore_ack_timeout,
        sink_file: Some(args.output.clone()),
        connect_timeout: settings.connect_timeout(),
        ..BrokerConfig::default()
    };

    let stop_token = StopToken::new();
    let ctrlc_stop = stop_token.clone();
    ctrlc::set_handler(move || {
        log::info!("received interrupt, shutting down");
        ctrlc_stop.stop();
    })
    .context("failed to install signal handler")?;

    let mut filter = FilterSet::new();
    for spec in &args.filters {
        let (apid, ctid) = parse_filter_pair(spec)?;
        filter
            .add(apid, ctid)
            .with_context(|| format!("invalid filter '{spec}'"))?;
    }

    if let Some(host) = args.host {
        let endpoint = if is_multicast_address(&host) {
            Endpoint::UdpMulticast {
                group: host.parse().context("invalid multicast address")?,
                port: args.port,
                interface: args.interface.parse().context("invalid interface address")?,
            }
        } else {
            Endpoint::Tcp { host: host.clone(), port: args.port }
        };
        let source = SocketSource::connect_to_with_timeout(endpoint, broker_config.connect_timeout)
            .with_context(|| format!("failed to connect to {host}:{}", args.port))?;
        run(source, broker_config, filter)
    } else {
        let path = args.file.expect("checked above");
        let source = FileSource::tail(&path, stop_token)
            .with_context(|| format!("failed to open {}", path.display()))?;
        run(source, broker_config, filter)
    }
}

/// Keeps the process alive for as long as the dispatcher is running;
/// the dispatcher itself appends every received frame to
/// `broker_config.sink_file`, so this loop just drains the filtered
/// subscriber channel to keep its bounded queue from filling up.
fn run<S>(source: S, broker_config: BrokerConfig, filter: FilterSet) -> Result<()>
where
    S: dlt_broker::source::Source + Send + 'static,
{
    let broker = Broker::start(source, broker_config);
    let (_id, rx) = broker.add_context(filter).context("registering receiver context")?;

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(_message) => {}
            Err(RecvTimeoutError::Timeout) => {
                if !broker.is_alive() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    broker.stop();
    Ok(())
}

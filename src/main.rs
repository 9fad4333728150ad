use anyhow::Context;
use clap::Parser;
use std::io::{self, ErrorKind, IsTerminal, Write, stderr, stdout};
use std::process::ExitCode;
use std::time::Duration;
use swarmhealth::{AggregatedResult, Config, QueryOrchestrator, Tracker};
use tracing::Level;
use tracing_subscriber::{filter::Targets, fmt::time::OffsetTime, prelude::*};
use url::Url;

/// Report seeder & leecher counts for BitTorrent swarms
#[derive(Clone, Debug, Eq, Parser, PartialEq)]
#[command(version)]
struct Arguments {
    /// Give up waiting for trackers after this many seconds
    #[arg(short, long, default_value_t = 30, value_name = "SECS")]
    timeout: u64,

    /// Give up on an individual tracker after this many seconds
    #[arg(long, default_value_t = 20, value_name = "SECS")]
    probe_timeout: u64,

    /// Maximum number of packets to send to a UDP tracker
    #[arg(long, default_value_t = 8, value_name = "N")]
    udp_attempts: u32,

    /// Maximum number of trackers to query at once
    #[arg(long, default_value_t = 16, value_name = "N")]
    max_concurrent: usize,

    /// Additional tracker to query for every input.  May be given multiple
    /// times.
    #[arg(short = 'T', long = "tracker", value_name = "URL")]
    trackers: Vec<Tracker>,

    /// Send HTTP tracker requests through this proxy (http, https, socks5,
    /// or socks5h URL)
    #[arg(long, value_name = "URL")]
    proxy: Option<Url>,

    /// Emit log messages to stderr
    #[arg(long)]
    trace: bool,

    /// Magnet links or info hashes (hex or base32)
    #[arg(num_args = 1.., required = true, value_name = "INPUT")]
    inputs: Vec<String>,
}

impl Arguments {
    fn config(&self) -> Config {
        Config {
            overall_timeout: Duration::from_secs(self.timeout),
            probe_timeout: Duration::from_secs(self.probe_timeout),
            udp_attempts: self.udp_attempts,
            max_concurrent_probes: self.max_concurrent,
            extra_trackers: self.trackers.clone(),
            proxy: self.proxy.clone(),
            ..Config::default()
        }
    }
}

fn main() -> ExitCode {
    let args = Arguments::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(ioerr) = e.downcast_ref::<io::Error>()
                && ioerr.kind() == ErrorKind::BrokenPipe
            {
                ExitCode::SUCCESS
            } else {
                let _ = writeln!(stderr().lock(), "swarmhealth: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(args: Arguments) -> anyhow::Result<()> {
    if args.trace {
        let timer =
            OffsetTime::local_rfc_3339().context("failed to determine local timezone offset")?;
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(timer)
                    .with_ansi(stderr().is_terminal())
                    .with_writer(stderr),
            )
            .with(
                Targets::new()
                    .with_target(env!("CARGO_CRATE_NAME"), Level::TRACE)
                    .with_target("reqwest", Level::TRACE)
                    .with_default(Level::INFO),
            )
            .init();
    }
    let orchestrator = QueryOrchestrator::new(args.config()).context("invalid settings")?;
    let results = futures_util::future::join_all(
        args.inputs
            .iter()
            .map(|input| orchestrator.resolve_str(input)),
    )
    .await;
    let mut failures = 0usize;
    let mut first = true;
    let mut out = stdout().lock();
    for (input, r) in args.inputs.iter().zip(results) {
        match r {
            Ok(health) => {
                if !std::mem::replace(&mut first, false) {
                    writeln!(&mut out)?;
                }
                show(&mut out, &health)?;
            }
            Err(e) => {
                failures += 1;
                let e = anyhow::Error::new(e).context(format!("could not resolve {input:?}"));
                let _ = writeln!(stderr().lock(), "swarmhealth: {e:#}");
            }
        }
    }
    out.flush()?;
    if failures > 0 {
        anyhow::bail!("{failures} of {} inputs could not be resolved", args.inputs.len());
    }
    Ok(())
}

fn show<W: Write>(out: &mut W, health: &AggregatedResult) -> io::Result<()> {
    writeln!(out, "{}:", health.info_hash)?;
    writeln!(out, "  Seeders: {}", health.seeders)?;
    writeln!(out, "  Leechers: {}", health.leechers)?;
    match health.completed {
        Some(n) => writeln!(out, "  Completed: {n}")?,
        None => writeln!(out, "  Completed: unknown")?,
    }
    write!(out, "  Trackers: {}/{}", health.responded, health.total)?;
    if health.partial {
        write!(out, " (partial)")?;
    }
    writeln!(out)
}

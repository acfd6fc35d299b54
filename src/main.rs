//! nk_r demo driver
//!
//! Runs small message-passing workloads on a host and reports what the
//! scheduler did.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

use nk_r::{msg_recv, msg_send, thread_create, Host, HostConfig, PortType, ThreadAttrs};

#[derive(Parser)]
#[command(name = "nk_r")]
#[command(about = "Cooperative scheduling kernel demos", long_about = None)]
struct Cli {
    /// Worker OS threads
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// Thread stack size in KiB
    #[arg(long, default_value_t = 64)]
    stack_kib: usize,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Two threads bounce a counter back and forth
    Ping {
        /// Round trips
        #[arg(short, long, default_value_t = 10_000)]
        rounds: u64,
    },
    /// A token travels around a ring of threads
    Ring {
        /// Threads in the ring
        #[arg(short, long, default_value_t = 100)]
        threads: usize,

        /// Laps around the ring
        #[arg(short, long, default_value_t = 100)]
        laps: u64,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_micros()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let attrs = ThreadAttrs::default().with_stack_size(cli.stack_kib * 1024);
    attrs.validate().context("bad --stack-kib")?;

    let host = Host::with_config(HostConfig::default().with_thread_pool(256))?;
    let started = Instant::now();
    let (what, result) = match cli.command {
        Command::Ping { rounds } => ("ping", ping(&host, cli.workers, attrs, rounds)?),
        Command::Ring { threads, laps } => {
            ensure!(threads > 0, "a ring needs at least one thread");
            ("ring", ring(&host, cli.workers, attrs, threads, laps)?)
        }
    };
    let elapsed = started.elapsed();

    println!("{what}: result {result} in {elapsed:?}");
    println!("stats: {}", host.stats());
    host.destroy().context("destroying host")?;
    Ok(())
}

/// Bounce a counter between two threads, each side adding one
fn ping(host: &Host, workers: usize, attrs: ThreadAttrs, rounds: u64) -> Result<u64> {
    let a = host.port_create(PortType::Thread);
    let b = host.port_create(PortType::Thread);
    let result = Arc::new(AtomicU64::new(0));

    let out = result.clone();
    let (a2, b2) = (a.clone(), b.clone());
    host.run(workers, move || {
        let (a_rx, b_tx) = (a2.clone(), b2.clone());
        thread_create(
            move || {
                for _ in 0..rounds {
                    let msg = msg_recv(&a_rx).expect("ping recv");
                    let n = msg.data1_as::<u64>().copied().unwrap_or_default();
                    msg_send(&b_tx, Some(&a_rx), Some(Arc::new(n + 1)), None).expect("ping send");
                }
            },
            attrs,
        )
        .expect("create pinger");

        let (b_rx, a_tx) = (b2, a2);
        thread_create(
            move || {
                let mut n = 0u64;
                msg_send(&a_tx, Some(&b_rx), Some(Arc::new(n)), None).expect("pong send");
                for i in 0..rounds {
                    let msg = msg_recv(&b_rx).expect("pong recv");
                    n = msg.data1_as::<u64>().copied().unwrap_or_default() + 1;
                    if i + 1 < rounds {
                        msg_send(&a_tx, Some(&b_rx), Some(Arc::new(n)), None).expect("pong send");
                    }
                }
                out.store(n, Ordering::SeqCst);
            },
            attrs,
        )
        .expect("create ponger");
    })?;

    info!("ping: {} message(s) left on ports", a.pending() + b.pending());
    a.destroy()?;
    b.destroy()?;
    Ok(result.load(Ordering::SeqCst))
}

/// Pass a token around a ring of threads, each hop adding one
fn ring(host: &Host, workers: usize, attrs: ThreadAttrs, threads: usize, laps: u64) -> Result<u64> {
    let ports: Vec<_> = (0..threads)
        .map(|_| host.port_create(PortType::Thread))
        .collect();
    let result = Arc::new(AtomicU64::new(0));

    let out = result.clone();
    let ring_ports = ports.clone();
    host.run(workers, move || {
        for i in 0..threads {
            let rx = ring_ports[i].clone();
            let tx = ring_ports[(i + 1) % threads].clone();
            let out = out.clone();
            thread_create(
                move || {
                    for lap in 0..laps {
                        let msg = msg_recv(&rx).expect("ring recv");
                        let hops = msg.data1_as::<u64>().copied().unwrap_or_default() + 1;
                        // The last hop of the last lap stops the token
                        if i == threads - 1 && lap + 1 == laps {
                            out.store(hops, Ordering::SeqCst);
                        } else {
                            msg_send(&tx, Some(&rx), Some(Arc::new(hops)), None)
                                .expect("ring send");
                        }
                    }
                },
                attrs,
            )
            .expect("create ring thread");
        }
        if laps > 0 {
            msg_send(&ring_ports[0], None, Some(Arc::new(0u64)), None).expect("inject token");
        }
    })?;

    for port in &ports {
        port.destroy()?;
    }
    Ok(result.load(Ordering::SeqCst))
}

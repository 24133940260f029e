// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runs `patternsrc -> passthrough -> checksink` over tunnels and prints the sink
//! statistics as JSON.
//!
//! ```bash
//! cargo run -p mxl-elements --example tunnel_pipeline -- --exchange ring --frames 250
//! ```

mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use mxl_component::{
    Command, Component, Domain, Error, Event, EventRecorder, ExchangeKind, ExecutionMode, State,
    tunnel,
};
use mxl_elements::{
    checksink, passthrough,
    patternsrc::{self, Rational},
};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Exchange {
    /// Shared buffer pool with wait-pipe backpressure.
    Std,
    /// Zero-copy frame ring.
    Ring,
}

impl From<Exchange> for ExchangeKind {
    fn from(exchange: Exchange) -> Self {
        match exchange {
            Exchange::Std => ExchangeKind::StdTunnel,
            Exchange::Ring => ExchangeKind::RingQueue,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Tunnel strategy between the components.
    #[arg(long, value_enum, default_value_t = Exchange::Std)]
    exchange: Exchange,

    /// Number of frames before end of stream.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Frame size in bytes.
    #[arg(long, default_value_t = 4096)]
    frame_size: usize,

    /// Buffers per port.
    #[arg(long, default_value_t = 4)]
    buffers: u32,

    /// Frames the pass-through keeps as references.
    #[arg(long, default_value_t = 0)]
    retain: usize,

    /// Frame rate as `numerator/denominator`.
    #[arg(long, default_value = "25/1")]
    rate: String,

    /// Drive the components from this thread instead of worker threads.
    #[arg(long)]
    passive: bool,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_rate(rate: &str) -> Result<Rational, Error> {
    let invalid = || Error::BadParameter(format!("Invalid frame rate {rate:?}."));
    let (numerator, denominator) = rate.split_once('/').unwrap_or((rate, "1"));
    let numerator: i64 = numerator.trim().parse().map_err(|_| invalid())?;
    let denominator: i64 = denominator.trim().parse().map_err(|_| invalid())?;
    if numerator <= 0 || denominator <= 0 {
        return Err(invalid());
    }
    Ok(Rational::new(numerator, denominator))
}

/// Moves every component to `target`, in the given order, and waits for completion.
fn set_state(
    components: &[&Component],
    target: State,
    events: &EventRecorder,
    timeout: Duration,
) -> Result<(), Error> {
    let completion = Event::CmdComplete(Command::StateSet(target));
    for component in components {
        let id = component.id();
        let before = events.count(|source, event| *source == id && *event == completion);
        component.send_command(Command::StateSet(target))?;
        if component.mode() == ExecutionMode::Passive {
            component.process_pending()?;
        }
        if !events.wait_for_count(timeout, before + 1, |source, event| {
            *source == id && *event == completion
        }) {
            warn!("{} did not reach {:?}", component.name(), target);
            return Err(Error::Timeout);
        }
    }
    info!("Pipeline is {:?}", target);
    Ok(())
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    common::setup_logging(args.verbose);

    let exchange = ExchangeKind::from(args.exchange);
    let mode = if args.passive {
        ExecutionMode::Passive
    } else {
        ExecutionMode::Active
    };
    let timeout = Duration::from_secs(args.timeout);

    let domain = Domain::new();
    let events = Arc::new(EventRecorder::new());
    let source = patternsrc::create(
        &domain,
        &patternsrc::Settings {
            mode,
            frame_size: args.frame_size,
            buffer_count: args.buffers,
            frame_rate: parse_rate(&args.rate)?,
            frames: Some(args.frames),
            exchange,
            ..Default::default()
        },
        events.clone(),
    )?;
    let filter = passthrough::create(
        &domain,
        &passthrough::Settings {
            mode,
            buffer_count: args.buffers,
            buffer_size: args.frame_size,
            retain_depth: args.retain,
            exchange,
            ..Default::default()
        },
        events.clone(),
    )?;
    let (sink, stats) = checksink::create(
        &domain,
        &checksink::Settings {
            mode,
            buffer_count: args.buffers,
            buffer_size: args.frame_size,
            exchange,
            ..Default::default()
        },
        events.clone(),
    )?;
    tunnel(&source, patternsrc::OUTPUT_PORT, &filter, passthrough::INPUT_PORT)?;
    tunnel(&filter, passthrough::OUTPUT_PORT, &sink, checksink::INPUT_PORT)?;

    let upstream_first = [&source, &filter, &sink];
    let downstream_first = [&sink, &filter, &source];
    let started = Instant::now();
    set_state(&upstream_first, State::Idle, &events, timeout)?;
    set_state(&upstream_first, State::Executing, &events, timeout)?;

    while !stats.snapshot().eos {
        if started.elapsed() > timeout {
            warn!("Timed out after {} frames", stats.snapshot().frames);
            break;
        }
        if let Some(Event::Error(e)) =
            events.wait_for(Duration::ZERO, |_, event| matches!(event, Event::Error(_)))
        {
            warn!("Pipeline reported an error: {}", e);
            break;
        }
        match mode {
            ExecutionMode::Passive => {
                for component in upstream_first {
                    component.process_data()?;
                }
            }
            ExecutionMode::Active => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    let elapsed = started.elapsed();

    set_state(&downstream_first, State::Idle, &events, timeout)?;
    set_state(&upstream_first, State::Loaded, &events, timeout)?;

    let stats = stats.snapshot();
    info!(
        "{} frames in {:.3}s over {:?}",
        stats.frames,
        elapsed.as_secs_f64(),
        exchange
    );
    let json = serde_json::to_string_pretty(&stats)
        .map_err(|e| Error::Other(format!("Failed to serialize statistics: {e}")))?;
    println!("{json}");
    Ok(())
}

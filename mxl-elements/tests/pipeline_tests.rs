// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests.
//!
//! Every test builds `patternsrc -> passthrough -> checksink`, runs a finite stream
//! through it and compares the sink statistics with the checksum of the frames the
//! source is known to generate.
//!
//! # Test Coverage
//!
//! - Shared-pool and ring-queue tunnels, passive and active components
//! - Pass-through retain mode
//! - Attribute forwarding through a filter

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use mxl_component::{
    Attribute, Command, Component, Domain, Event, EventRecorder, ExchangeKind, ExecutionMode,
    State, tunnel,
};
use mxl_elements::{
    checksink::{self, FNV_OFFSET, Stats, StatsHandle, fnv1a},
    passthrough,
    patternsrc::{self, Pattern},
};
use tracing::info;
use tracing_test::traced_test;

const FRAME_SIZE: usize = 256;
const WAIT: Duration = Duration::from_secs(10);

/// Nanoseconds between two frames at the default 25 fps.
const FRAME_DURATION: i64 = 40_000_000;

struct Chain {
    events: Arc<EventRecorder>,
    source: Component,
    filter: Component,
    sink: Component,
    stats: StatsHandle,
}

impl Chain {
    fn new(exchange: ExchangeKind, mode: ExecutionMode, frames: u64, retain_depth: usize) -> Self {
        let domain = Domain::new();
        let events = Arc::new(EventRecorder::new());
        let source = patternsrc::create(
            &domain,
            &patternsrc::Settings {
                mode,
                pattern: Pattern::Ramp,
                frame_size: FRAME_SIZE,
                frames: Some(frames),
                exchange,
                ..Default::default()
            },
            events.clone(),
        )
        .unwrap();
        let filter = passthrough::create(
            &domain,
            &passthrough::Settings {
                mode,
                buffer_size: FRAME_SIZE,
                retain_depth,
                exchange,
                ..Default::default()
            },
            events.clone(),
        )
        .unwrap();
        let (sink, stats) = checksink::create(
            &domain,
            &checksink::Settings {
                mode,
                buffer_size: FRAME_SIZE,
                exchange,
                ..Default::default()
            },
            events.clone(),
        )
        .unwrap();
        tunnel(&source, patternsrc::OUTPUT_PORT, &filter, passthrough::INPUT_PORT).unwrap();
        tunnel(&filter, passthrough::OUTPUT_PORT, &sink, checksink::INPUT_PORT).unwrap();
        Self {
            events,
            source,
            filter,
            sink,
            stats,
        }
    }

    fn upstream_first(&self) -> [&Component; 3] {
        [&self.source, &self.filter, &self.sink]
    }

    fn set_state(&self, order: [&Component; 3], target: State) {
        for component in order {
            let id = component.id();
            let done = Event::CmdComplete(Command::StateSet(target));
            let before = self.events.count(|source, event| *source == id && *event == done);
            component.send_command(Command::StateSet(target)).unwrap();
            if component.mode() == ExecutionMode::Passive {
                component.process_pending().unwrap();
            }
            assert!(
                self.events
                    .wait_for_count(WAIT, before + 1, |source, event| *source == id
                        && *event == done),
                "{} did not reach {:?}",
                component.name(),
                target
            );
        }
    }

    fn start(&self) {
        self.set_state(self.upstream_first(), State::Idle);
        self.set_state(self.upstream_first(), State::Executing);
    }

    /// Runs the stream to its end and returns the sink statistics.
    fn run(&self) -> Stats {
        let started = Instant::now();
        while !self.stats.snapshot().eos {
            assert!(started.elapsed() < WAIT, "stream stalled: {:?}", self.stats.snapshot());
            if self.source.mode() == ExecutionMode::Passive {
                for component in self.upstream_first() {
                    component.process_data().unwrap();
                }
            } else {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.stats.snapshot()
    }

    fn stop(&self) {
        self.set_state([&self.sink, &self.filter, &self.source], State::Idle);
        self.set_state(self.upstream_first(), State::Loaded);
        let errors = self
            .events
            .count(|_, event| matches!(event, Event::Error(_)));
        assert_eq!(errors, 0, "{:?}", self.events.events());
    }
}

/// Checksum of the first `frames` ramp frames.
fn expected_checksum(frames: u64) -> u64 {
    (0..frames).fold(FNV_OFFSET, |hash, index| {
        let mut frame = vec![0u8; FRAME_SIZE];
        Pattern::Ramp.fill(index, &mut frame);
        fnv1a(hash, &frame)
    })
}

fn assert_complete(stats: &Stats, frames: u64) {
    assert_eq!(stats.frames, frames);
    assert_eq!(stats.bytes, frames * FRAME_SIZE as u64);
    assert_eq!(stats.checksum, expected_checksum(frames));
    assert_eq!(stats.first_timestamp, Some(0));
    assert_eq!(stats.last_timestamp, Some((frames as i64 - 1) * FRAME_DURATION));
    assert_eq!(stats.out_of_order, 0);
    assert!(stats.eos);
}

#[traced_test]
#[test]
fn std_tunnel_chain() {
    let chain = Chain::new(ExchangeKind::StdTunnel, ExecutionMode::Passive, 40, 0);
    chain.start();
    let stats = chain.run();
    assert_complete(&stats, 40);
    assert!(chain.sink.is_eos(checksink::INPUT_PORT).unwrap());
    assert!(logs_contain("reached end of stream"));
    chain.stop();
}

#[traced_test]
#[test]
fn ring_queue_chain() {
    let chain = Chain::new(ExchangeKind::RingQueue, ExecutionMode::Passive, 40, 0);
    chain.start();
    let stats = chain.run();
    assert_complete(&stats, 40);
    chain.stop();
}

#[traced_test]
#[test]
fn retaining_filter_keeps_stream_intact() {
    for exchange in [ExchangeKind::StdTunnel, ExchangeKind::RingQueue] {
        let chain = Chain::new(exchange, ExecutionMode::Passive, 25, 2);
        chain.start();
        let stats = chain.run();
        assert_complete(&stats, 25);
        chain.stop();
        info!("{:?} with retained references passed", exchange);
    }
}

#[traced_test]
#[test]
fn attributes_cross_the_filter() {
    let chain = Chain::new(ExchangeKind::StdTunnel, ExecutionMode::Passive, 10, 0);
    chain.start();
    chain
        .filter
        .queue_attribute(
            passthrough::INPUT_PORT,
            Attribute {
                id: 1,
                data: b"colorimetry=bt709".to_vec(),
            },
        )
        .unwrap();
    let stats = chain.run();
    assert_complete(&stats, 10);
    assert_eq!(stats.attributes, 1);
    chain.stop();
}

#[traced_test]
#[test]
fn active_chain() {
    for exchange in [ExchangeKind::StdTunnel, ExchangeKind::RingQueue] {
        let chain = Chain::new(exchange, ExecutionMode::Active, 60, 0);
        chain.start();
        let stats = chain.run();
        assert_complete(&stats, 60);
        chain.stop();
    }
}

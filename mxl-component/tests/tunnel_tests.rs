// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Tunnel integration tests.
//!
//! A numbered-frame source is tunneled to a recording sink, both passive, and the
//! test thread pumps them. Passive pipelines are brought up supplier first and
//! stopped consumer first.
//!
//! # Test Coverage
//!
//! - Shared-pool and ring-queue pipelines, end of stream and marks
//! - Pool sizing from the larger buffer count
//! - Wait-pipe backpressure towards a late consumer
//! - Allocation failure on `Loaded -> Idle` and retry
//! - Retained outputs
//! - Marks held back while outputs are reused
//! - Send failure on one of several outputs

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use mxl_component::{
    Allocator, BufferFlags, BufferHeader, Command, Component, ComponentConfig, Direction, Domain,
    Error, Event, EventRecorder, ExchangeKind, ExecutionMode, Heap, HeapAllocator, Mark, Memory,
    OutputAction, PortConfig, ProcessArgs, ProcessStatus, ProcessingEngine, State, Timeouts,
    tunnel,
};
use tracing::info;

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// Initializes logging, honouring `RUST_LOG`.
fn setup_test() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    });
}

fn fast_timeouts() -> Timeouts {
    Timeouts {
        populate_ms: 500,
        send_retry_ms: 200,
        retry_interval_ms: 1,
        flush_ms: 500,
    }
}

/// Emits `frames` numbered payloads, flagging the last one end-of-stream.
struct Counter {
    next: u8,
    frames: u8,
    /// Frame sent with [`OutputAction::SendAndRetain`].
    retain: Option<u8>,
    /// Leading cycles that hand the output buffer back unused.
    idle_cycles: u8,
    release: Arc<AtomicBool>,
}

impl Counter {
    fn new(frames: u8) -> Self {
        Self {
            next: 0,
            frames,
            retain: None,
            idle_cycles: 0,
            release: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ProcessingEngine for Counter {
    fn process(
        &mut self,
        _inputs: &mut [BufferHeader],
        outputs: &mut [BufferHeader],
        args: &mut ProcessArgs,
    ) -> ProcessStatus {
        args.release_retained = self.release.swap(false, Ordering::AcqRel);
        if self.idle_cycles > 0 {
            self.idle_cycles -= 1;
            args.outputs[0] = OutputAction::Reuse;
            return ProcessStatus::Ok;
        }
        if self.next >= self.frames {
            args.outputs[0] = OutputAction::Reuse;
            return ProcessStatus::Ok;
        }
        let output = &mut outputs[0];
        if let Err(e) = output.write_payload(&[self.next; 8]) {
            return ProcessStatus::Fatal(e.to_string());
        }
        output.timestamp = i64::from(self.next) * 40;
        if self.next + 1 == self.frames {
            output.flags |= BufferFlags::EOS;
        }
        if self.retain == Some(self.next) {
            args.outputs[0] = OutputAction::SendAndRetain;
        }
        self.next += 1;
        ProcessStatus::Ok
    }
}

type Frames = Arc<Mutex<Vec<(Vec<u8>, i64)>>>;

/// Records payload, timestamp and mark of every input.
#[derive(Default)]
struct Collector {
    frames: Frames,
    marks: Arc<Mutex<Vec<Option<Mark>>>>,
}

impl ProcessingEngine for Collector {
    fn process(
        &mut self,
        inputs: &mut [BufferHeader],
        _outputs: &mut [BufferHeader],
        _args: &mut ProcessArgs,
    ) -> ProcessStatus {
        let input = &inputs[0];
        self.marks.lock().unwrap().push(input.mark);
        self.frames
            .lock()
            .unwrap()
            .push((input.payload(), input.timestamp));
        ProcessStatus::Ok
    }
}

/// Allocator that fails its first `failures` allocations.
struct FlakyAllocator {
    inner: HeapAllocator,
    failures: AtomicUsize,
}

impl Allocator for FlakyAllocator {
    fn alloc(&self, size: usize, alignment: usize, heap: Heap) -> Option<Memory> {
        let failing = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return None;
        }
        self.inner.alloc(size, alignment, heap)
    }

    fn free(&self, memory: Memory) {
        self.inner.free(memory);
    }
}

/// A source tunneled to a sink, both passive.
struct Pipeline {
    recorder: Arc<EventRecorder>,
    source: Component,
    sink: Component,
    frames: Frames,
    marks: Arc<Mutex<Vec<Option<Mark>>>>,
}

impl Pipeline {
    fn new(domain: &Domain, kind: ExchangeKind, counts: (u32, u32), engine: Counter) -> Self {
        let recorder = Arc::new(EventRecorder::new());
        let mut output = PortConfig::new(1, Direction::Output, counts.0, 64);
        output.tunnel_exchange = kind;
        let mut input = PortConfig::new(0, Direction::Input, counts.1, 64);
        input.tunnel_exchange = kind;

        let mut source_config = ComponentConfig::new("source", ExecutionMode::Passive).with_port(output);
        source_config.timeouts = fast_timeouts();
        let mut sink_config = ComponentConfig::new("sink", ExecutionMode::Passive).with_port(input);
        sink_config.timeouts = fast_timeouts();

        let collector = Collector::default();
        let frames = collector.frames.clone();
        let marks = collector.marks.clone();
        let source = domain
            .create_component(source_config, Box::new(engine), recorder.clone())
            .unwrap();
        let sink = domain
            .create_component(sink_config, Box::new(collector), recorder.clone())
            .unwrap();
        tunnel(&source, 1, &sink, 0).unwrap();
        Self {
            recorder,
            source,
            sink,
            frames,
            marks,
        }
    }

    fn set_state(&self, component: &Component, target: State) {
        component.send_command(Command::StateSet(target)).unwrap();
        component.process_pending().unwrap();
        assert_eq!(component.state(), target, "{}", component.name());
    }

    fn start(&self) {
        self.set_state(&self.source, State::Idle);
        self.set_state(&self.sink, State::Idle);
        self.set_state(&self.source, State::Executing);
        self.set_state(&self.sink, State::Executing);
    }

    /// Pumps both components until the sink saw `count` frames.
    fn pump(&self, count: usize) {
        for _ in 0..1000 {
            self.source.process_data().unwrap();
            self.sink.process_data().unwrap();
            if self.frames.lock().unwrap().len() >= count {
                return;
            }
        }
        panic!(
            "sink only received {} of {} frames",
            self.frames.lock().unwrap().len(),
            count
        );
    }

    fn stop(&self) {
        self.set_state(&self.sink, State::Idle);
        self.set_state(&self.source, State::Idle);
        self.set_state(&self.source, State::Loaded);
        self.set_state(&self.sink, State::Loaded);
        assert_eq!(self.errors(), 0, "{:?}", self.recorder.events());
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|(payload, _)| payload.clone())
            .collect()
    }

    fn errors(&self) -> usize {
        self.recorder
            .count(|_, event| matches!(event, Event::Error(_)))
    }
}

fn numbered(frames: u8) -> Vec<Vec<u8>> {
    (0..frames).map(|i| vec![i; 8]).collect()
}

/// Frames cross a shared-pool tunnel in order, followed by end of stream.
#[test]
fn std_tunnel_pipeline_delivers_in_order() {
    setup_test();
    let domain = Domain::new();
    let pipeline = Pipeline::new(&domain, ExchangeKind::StdTunnel, (2, 2), Counter::new(10));
    pipeline.start();
    pipeline.pump(10);

    assert_eq!(pipeline.payloads(), numbered(10));
    let timestamps: Vec<i64> = pipeline.frames.lock().unwrap().iter().map(|f| f.1).collect();
    assert_eq!(timestamps, (0..10).map(|i| i * 40).collect::<Vec<i64>>());
    assert!(pipeline.sink.is_eos(0).unwrap());
    assert!(pipeline.source.is_eos(1).unwrap());
    let sink_flags = pipeline
        .recorder
        .events_of(pipeline.sink.id())
        .into_iter()
        .filter(|e| matches!(e, Event::BufferFlag { port: 0, flags } if flags.contains(BufferFlags::EOS)))
        .count();
    assert_eq!(sink_flags, 1);
    info!("Received {} frames", pipeline.payloads().len());

    pipeline.stop();
    assert!(!pipeline.sink.is_eos(0).unwrap());
}

/// The supplier allocates the larger of both buffer counts.
#[test]
fn supplier_pool_uses_larger_count() {
    setup_test();
    let domain = Domain::new();
    let pipeline = Pipeline::new(&domain, ExchangeKind::StdTunnel, (4, 2), Counter::new(0));
    assert_eq!(pipeline.sink.port_definition(0).unwrap().buffer_count, 4);
    pipeline.set_state(&pipeline.source, State::Idle);
    pipeline.set_state(&pipeline.sink, State::Idle);

    let exchange = pipeline.source.port_exchange(1).unwrap();
    assert_eq!(exchange.kind(), ExchangeKind::StdTunnel);
    assert_eq!(exchange.get_count(), 4);
    let taken: Vec<BufferHeader> = (0..4)
        .map(|_| exchange.dequeue(Duration::ZERO).unwrap().unwrap())
        .collect();
    assert!(exchange.dequeue(Duration::from_millis(5)).unwrap().is_none());
    for header in taken.into_iter().rev() {
        exchange.cancel(header).unwrap();
    }
    assert_eq!(exchange.get_count(), 4);
    assert_eq!(pipeline.sink.port_exchange(0).unwrap().get_count(), 0);

    pipeline.set_state(&pipeline.source, State::Loaded);
    pipeline.set_state(&pipeline.sink, State::Loaded);
    assert_eq!(pipeline.errors(), 0);
}

/// Frames sent before the consumer executes are parked and delivered later, in order.
#[test]
fn wait_pipe_holds_frames_for_late_consumer() {
    setup_test();
    let domain = Domain::new();
    let pipeline = Pipeline::new(&domain, ExchangeKind::StdTunnel, (4, 4), Counter::new(3));
    pipeline.set_state(&pipeline.source, State::Idle);
    pipeline.set_state(&pipeline.sink, State::Idle);
    pipeline.set_state(&pipeline.source, State::Executing);

    assert_eq!(pipeline.source.process_data().unwrap(), 3);
    assert_eq!(pipeline.sink.process_data().unwrap(), 0);
    assert_eq!(pipeline.source.port_exchange(1).unwrap().get_count(), 1);
    assert!(pipeline.frames.lock().unwrap().is_empty());

    pipeline.set_state(&pipeline.sink, State::Executing);
    pipeline.pump(3);
    assert_eq!(pipeline.payloads(), numbered(3));
    assert_eq!(pipeline.source.state(), State::Executing);

    pipeline.stop();
}

/// A failed pool allocation leaves the component `Loaded` and ready for a retry.
#[test]
fn allocation_failure_keeps_component_loaded() {
    setup_test();
    let allocator = Arc::new(FlakyAllocator {
        inner: HeapAllocator::new(),
        failures: AtomicUsize::new(1),
    });
    let domain = Domain::with_allocator(allocator);
    let pipeline = Pipeline::new(&domain, ExchangeKind::StdTunnel, (2, 2), Counter::new(2));

    pipeline
        .source
        .send_command(Command::StateSet(State::Idle))
        .unwrap();
    pipeline.source.process_pending().unwrap();
    assert_eq!(pipeline.source.state(), State::Loaded);
    assert_eq!(pipeline.source.pending_state(), None);
    let events = pipeline.recorder.events_of(pipeline.source.id());
    assert_eq!(events, vec![Event::Error(Error::InsufficientResources)]);

    pipeline.recorder.clear();
    pipeline.start();
    pipeline.pump(2);
    assert_eq!(pipeline.payloads(), numbered(2));
    pipeline.stop();
}

/// A mark placed on the source output is reported by the sink it targets.
#[test]
fn mark_travels_through_tunnel() {
    setup_test();
    let domain = Domain::new();
    let pipeline = Pipeline::new(&domain, ExchangeKind::StdTunnel, (2, 2), Counter::new(3));
    pipeline.start();

    let mark = Mark {
        target: pipeline.sink.id(),
        data: 99,
    };
    pipeline
        .source
        .send_command(Command::MarkBuffer(1, mark))
        .unwrap();
    pipeline.source.process_pending().unwrap();
    pipeline.pump(3);

    let sink_events = pipeline.recorder.events_of(pipeline.sink.id());
    let reached: Vec<&Event> = sink_events
        .iter()
        .filter(|e| matches!(e, Event::MarkReached { .. }))
        .collect();
    assert_eq!(reached, vec![&Event::MarkReached { port: 0, mark }]);
    assert!(
        pipeline
            .recorder
            .events_of(pipeline.source.id())
            .contains(&Event::CmdComplete(Command::MarkBuffer(1, mark)))
    );
    pipeline.stop();
}

/// A mark issued while the engine skips its output waits for the next buffer sent.
#[test]
fn mark_waits_for_a_sent_buffer() {
    setup_test();
    for kind in [ExchangeKind::StdTunnel, ExchangeKind::RingQueue] {
        let domain = Domain::new();
        let mut counter = Counter::new(2);
        counter.idle_cycles = 1;
        let pipeline = Pipeline::new(&domain, kind, (2, 2), counter);
        pipeline.start();

        let mark = Mark {
            target: pipeline.sink.id(),
            data: 5,
        };
        pipeline
            .source
            .send_command(Command::MarkBuffer(1, mark))
            .unwrap();
        pipeline.source.process_pending().unwrap();
        assert_eq!(pipeline.source.process_data().unwrap(), 0);
        pipeline.pump(2);

        assert_eq!(pipeline.payloads(), numbered(2));
        assert_eq!(*pipeline.marks.lock().unwrap(), vec![Some(mark), None]);
        let reached: Vec<Event> = pipeline
            .recorder
            .events_of(pipeline.sink.id())
            .into_iter()
            .filter(|e| matches!(e, Event::MarkReached { .. }))
            .collect();
        assert_eq!(reached, vec![Event::MarkReached { port: 0, mark }], "{:?}", kind);
        pipeline.stop();
    }
}

/// Writes the same payload into every output.
struct Fanout;

impl ProcessingEngine for Fanout {
    fn process(
        &mut self,
        _inputs: &mut [BufferHeader],
        outputs: &mut [BufferHeader],
        _args: &mut ProcessArgs,
    ) -> ProcessStatus {
        for output in outputs.iter_mut() {
            if let Err(e) = output.write_payload(b"fanout") {
                return ProcessStatus::Fatal(e.to_string());
            }
        }
        ProcessStatus::Ok
    }
}

/// When one output cannot be sent, the buffers of the other outputs go back to their ports.
#[test]
fn failed_send_returns_remaining_outputs() {
    setup_test();
    let domain = Domain::new();
    let recorder = Arc::new(EventRecorder::new());
    let mut tunneled = PortConfig::new(1, Direction::Output, 2, 64);
    tunneled.tunnel_exchange = ExchangeKind::StdTunnel;
    let mut source_config = ComponentConfig::new("fanout", ExecutionMode::Passive)
        .with_port(tunneled)
        .with_port(PortConfig::new(2, Direction::Output, 2, 64));
    source_config.timeouts = fast_timeouts();
    let mut sink_config = ComponentConfig::new("sink", ExecutionMode::Passive)
        .with_port(PortConfig::new(0, Direction::Input, 2, 64));
    sink_config.timeouts = fast_timeouts();
    let source = domain
        .create_component(source_config, Box::new(Fanout), recorder.clone())
        .unwrap();
    let sink = domain
        .create_component(sink_config, Box::new(Collector::default()), recorder.clone())
        .unwrap();
    tunnel(&source, 1, &sink, 0).unwrap();

    source.send_command(Command::StateSet(State::Idle)).unwrap();
    let client: Vec<BufferHeader> = (0..2).map(|_| source.allocate_buffer(2, 64).unwrap()).collect();
    source.process_pending().unwrap();
    assert_eq!(source.state(), State::Idle);
    sink.send_command(Command::StateSet(State::Idle)).unwrap();
    sink.process_pending().unwrap();
    source.send_command(Command::StateSet(State::Executing)).unwrap();
    source.process_pending().unwrap();
    assert_eq!(source.state(), State::Executing);

    // The sink stays Idle: the first frame is parked, the second stalls the wait pipe.
    for buffer in client {
        source.fill_this_buffer(2, buffer).unwrap();
    }
    assert_eq!(source.process_data().unwrap(), 1);
    assert_eq!(source.state(), State::Invalid);
    assert!(
        recorder
            .events_of(source.id())
            .contains(&Event::Error(Error::PeerUnresponsive))
    );
    assert_eq!(recorder.take_returned().len(), 1);
    assert_eq!(source.port_exchange(2).unwrap().get_count(), 1);

    source.send_command(Command::StateSet(State::Loaded)).unwrap();
    source.process_pending().unwrap();
    assert_eq!(source.state(), State::Loaded);
}

/// A retained output only returns to the pool once the engine releases it.
#[test]
fn retained_output_returns_after_release() {
    setup_test();
    let domain = Domain::new();
    let mut counter = Counter::new(1);
    counter.retain = Some(0);
    let release = counter.release.clone();
    let pipeline = Pipeline::new(&domain, ExchangeKind::StdTunnel, (3, 3), counter);
    pipeline.start();
    pipeline.pump(1);

    // The sink returned its copy; the duplicate still holds the slot.
    let exchange = pipeline.source.port_exchange(1).unwrap();
    assert_eq!(pipeline.source.process_data().unwrap(), 0);
    assert_eq!(exchange.get_count(), 2);

    release.store(true, Ordering::Release);
    pipeline.source.process_data().unwrap();
    assert_eq!(exchange.get_count(), 3);
    assert_eq!(pipeline.payloads(), numbered(1));
    pipeline.stop();
}

/// Frames cross a ring-queue tunnel with their metadata, and the ring goes away on unload.
#[test]
fn ring_queue_pipeline_delivers_in_order() {
    setup_test();
    let domain = Domain::new();
    let pipeline = Pipeline::new(&domain, ExchangeKind::RingQueue, (2, 3), Counter::new(12));
    pipeline.start();
    assert_eq!(domain.segments().segment_names().len(), 2);
    pipeline.pump(12);

    assert_eq!(pipeline.payloads(), numbered(12));
    let timestamps: Vec<i64> = pipeline.frames.lock().unwrap().iter().map(|f| f.1).collect();
    assert_eq!(timestamps, (0..12).map(|i| i * 40).collect::<Vec<i64>>());
    assert!(pipeline.sink.is_eos(0).unwrap());

    pipeline.stop();
    assert!(domain.segments().segment_names().is_empty());
}

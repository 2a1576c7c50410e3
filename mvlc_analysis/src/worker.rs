// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # STREAM WORKER
//!
//! The single thread owning the whole analysis-side data path: it dequeues
//! raw buffers from the snoop queue, parses them, expands multi-event
//! packed data, evaluates the analysis graph once per physics event, and
//! drives the module and buffer consumers. Because everything runs on this
//! one thread, graph evaluation is race-free without locks.
//!
//! ---------------------------------------------------------------------------
//!
//! The worker exposes three states. *Running* processes freely. *Paused*
//! blocks on a condition variable without draining the snoop queue.
//! *Single-stepping* processes exactly one physics event, publishes a
//! [Step Record] describing what happened, and drops back to *Paused*: the
//! raw material of an event-by-event debug display.
//!
//! The condition variable only implements pause and resume; stopping goes
//! through the same desired-state cell and is checked once per buffer or
//! record, so the worker always returns promptly.
//!
//! [Step Record]: StepRecord

use crate::consumers::{BufferConsumer, ModuleConsumer};
use crate::graph::AnalysisRuntime;
use crate::splitter::MultiEventSplitter;
use atomic::Atomic;
use bytemuck::NoUninit;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use mvlc_daq::buffer::PooledBuffer;
use mvlc_daq::parser::{ModuleData, ParserCallbacks, ReadoutParser};
use mvlc_stack::frame::SystemEventSubtype;
use std::collections::VecDeque;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// ## STREAM FORMAT
///
/// Which transport framing the snooped buffers carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamFormat {
  /// ### USB
  Usb,

  /// ### ETHERNET
  Eth,
}

/// ## RUN DESCRIPTOR
///
/// What consumers get told about the run they are joining.
#[derive(Clone, Debug, Default)]
pub struct RunDescriptor {
  /// ### RUN ID
  pub run_id: String,

  /// ### KEEP SINK STATE
  ///
  /// Accumulate into existing sink state instead of zeroing it, for
  /// chained replays.
  pub keep_sink_state: bool,
}

/// ## ANALYSIS WORKER STATE
#[derive(Clone, Copy, Debug, Default, Eq, NoUninit, PartialEq)]
#[repr(u8)]
pub enum AnalysisWorkerState {
  /// ### IDLE
  #[default]
  Idle = 0,

  /// ### RUNNING
  Running = 1,

  /// ### PAUSED
  Paused = 2,

  /// ### SINGLE STEPPING
  SingleStepping = 3,
}

/// What the controlling side wants; protected by the pause mutex.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum DesiredStreamState {
  #[default]
  Run,
  Pause,
  SingleStep,
  Stop,
}

/// ## STEP RECORD
///
/// What one single-step processed, for debug display.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRecord {
  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### MODULE WORD COUNTS
  ///
  /// Words per module of the processed physics event; [None] for modules
  /// without data.
  pub module_word_counts: Vec<Option<usize>>,
}

/// ## WORKER COUNTERS
#[derive(Clone, Debug, Default)]
pub struct StreamWorkerCounters {
  /// ### BUFFERS PROCESSED
  pub buffers_processed: u64,

  /// ### PHYSICS EVENTS
  pub physics_events: u64,

  /// ### SYSTEM EVENTS
  pub system_events: u64,
}

/// One unit of analysis work, produced by parsing and consumed by the
/// evaluation side of the worker loop.
enum EventRecord {
  Physics {
    event_index: usize,
    modules: Vec<Option<Vec<u32>>>,
  },
  System {
    subtype: SystemEventSubtype,
    words: Vec<u32>,
  },
}

/// Collects parser callbacks into owned [EventRecord]s, expanding
/// multi-event packed modules into one record per physics event.
struct Collector<'a> {
  splitter: &'a mut MultiEventSplitter,
  records: &'a mut VecDeque<EventRecord>,
  current_event: Option<(usize, Vec<Option<Vec<u32>>>)>,
}

impl Collector<'_> {
  fn store_module(&mut self, module_index: usize, words: Vec<u32>) {
    if let Some((_, modules)) = &mut self.current_event {
      if modules.len() <= module_index {
        modules.resize(module_index + 1, None);
      }
      modules[module_index] = Some(words);
    }
  }
}

impl ParserCallbacks for Collector<'_> {
  fn begin_event(&mut self, _crate_id: u8, event_index: usize) {
    self.current_event = Some((event_index, vec![]));
  }

  fn module_data(&mut self, _crate_id: u8, _event_index: usize, module_index: usize, data: &ModuleData) {
    let mut words: Vec<u32> = Vec::with_capacity(data.total_words());
    words.extend_from_slice(data.prefix);
    words.extend_from_slice(data.dynamic);
    words.extend_from_slice(data.suffix);
    self.store_module(module_index, words);
  }

  fn end_event(&mut self, _crate_id: u8, event_index: usize) {
    let Some((_, modules)) = self.current_event.take() else {
      return;
    };
    if !self.splitter.enabled_for_event(event_index) {
      self.records.push_back(EventRecord::Physics { event_index, modules });
      return;
    }

    // Split each module's range, then align the k-th slices of all
    // modules into the k-th physics event.
    let mut per_module_slices: Vec<Vec<Vec<u32>>> = Vec::with_capacity(modules.len());
    for (module_index, module) in modules.iter().enumerate() {
      let mut slices: Vec<Vec<u32>> = vec![];
      if let Some(words) = module {
        self.splitter.split(event_index, module_index, words, |slice| slices.push(slice.to_vec()));
      }
      per_module_slices.push(slices);
    }
    let subevent_count: usize = per_module_slices.iter().map(Vec::len).max().unwrap_or(0);
    for k in 0..subevent_count {
      let modules: Vec<Option<Vec<u32>>> = per_module_slices
        .iter_mut()
        .map(|slices| if k < slices.len() { Some(std::mem::take(&mut slices[k])) } else { None })
        .collect();
      self.records.push_back(EventRecord::Physics { event_index, modules });
    }
  }

  fn system_event(&mut self, _crate_id: u8, subtype: SystemEventSubtype, words: &[u32]) {
    self.records.push_back(EventRecord::System { subtype, words: words.to_vec() });
  }
}

/// ## STREAM OUTCOME
///
/// Everything the worker owned, returned on stop so callers can inspect
/// final state.
pub struct StreamOutcome {
  /// ### RUNTIME
  pub runtime: AnalysisRuntime,

  /// ### PARSER
  pub parser: ReadoutParser,

  /// ### SPLITTER
  pub splitter: MultiEventSplitter,
}

/// ## STREAM WORKER HANDLE
pub struct StreamWorkerHandle {
  state: Arc<Atomic<AnalysisWorkerState>>,
  control: Arc<(Mutex<DesiredStreamState>, Condvar)>,
  counters: Arc<Mutex<StreamWorkerCounters>>,
  step_records: Arc<Mutex<Vec<StepRecord>>>,
  join: JoinHandle<StreamOutcome>,
}

impl StreamWorkerHandle {
  /// ### STATE
  pub fn state(&self) -> AnalysisWorkerState {
    self.state.load(Relaxed)
  }

  /// ### COUNTERS
  pub fn counters(&self) -> StreamWorkerCounters {
    self.counters.lock().expect("counters mutex").clone()
  }

  /// ### STEP RECORDS
  ///
  /// Drains the records published by single-steps so far.
  pub fn take_step_records(&self) -> Vec<StepRecord> {
    std::mem::take(&mut self.step_records.lock().expect("step mutex"))
  }

  /// ### PAUSE
  pub fn pause(&self) {
    self.set_desired(DesiredStreamState::Pause);
  }

  /// ### RESUME
  pub fn resume(&self) {
    self.set_desired(DesiredStreamState::Run);
  }

  /// ### SINGLE STEP
  ///
  /// Only meaningful while paused; the worker processes one physics event
  /// and pauses again.
  pub fn single_step(&self) {
    self.set_desired(DesiredStreamState::SingleStep);
  }

  /// ### STOP
  pub fn stop(self) -> StreamOutcome {
    self.set_desired(DesiredStreamState::Stop);
    self.join.join().expect("stream worker panicked")
  }

  fn set_desired(&self, desired: DesiredStreamState) {
    let (lock, condvar) = &*self.control;
    *lock.lock().expect("control mutex") = desired;
    condvar.notify_all();
  }
}

/// ## STREAM WORKER
pub struct StreamWorker;

impl StreamWorker {
  /// ### START
  ///
  /// Spawns the stream worker thread. It calls `begin_run` on the runtime
  /// and every consumer, processes until stopped, then `end_run`s and
  /// returns the owned state through the handle's [stop].
  ///
  /// [stop]: StreamWorkerHandle::stop
  #[allow(clippy::too_many_arguments)]
  pub fn start(
    snoop: Receiver<Arc<PooledBuffer>>,
    format: StreamFormat,
    run: RunDescriptor,
    mut runtime: AnalysisRuntime,
    parser: ReadoutParser,
    splitter: MultiEventSplitter,
    module_consumers: Vec<Box<dyn ModuleConsumer>>,
    buffer_consumers: Vec<Box<dyn BufferConsumer>>,
  ) -> StreamWorkerHandle {
    let state: Arc<Atomic<AnalysisWorkerState>> = Arc::new(Atomic::new(AnalysisWorkerState::Running));
    let control: Arc<(Mutex<DesiredStreamState>, Condvar)> = Arc::new((Mutex::new(DesiredStreamState::Run), Condvar::new()));
    let counters: Arc<Mutex<StreamWorkerCounters>> = Arc::new(Mutex::new(StreamWorkerCounters::default()));
    let step_records: Arc<Mutex<Vec<StepRecord>>> = Arc::new(Mutex::new(vec![]));

    let thread_state = state.clone();
    let thread_control = control.clone();
    let thread_counters = counters.clone();
    let thread_steps = step_records.clone();
    let join: JoinHandle<StreamOutcome> = thread::Builder::new()
      .name("mvlc_stream".to_string())
      .spawn(move || {
        runtime.begin_run(run.keep_sink_state);
        let mut loop_state: WorkerLoop = WorkerLoop {
          snoop,
          format,
          runtime,
          parser,
          splitter,
          module_consumers,
          buffer_consumers,
          state: thread_state,
          control: thread_control,
          counters: thread_counters,
          step_records: thread_steps,
          pending: VecDeque::new(),
        };
        for consumer in &mut loop_state.module_consumers {
          consumer.begin_run(&run);
        }
        for consumer in &mut loop_state.buffer_consumers {
          consumer.begin_run(&run);
        }

        loop_state.run();

        loop_state.runtime.end_run();
        for consumer in &mut loop_state.module_consumers {
          consumer.end_run();
        }
        for consumer in &mut loop_state.buffer_consumers {
          consumer.end_run();
        }
        loop_state.state.store(AnalysisWorkerState::Idle, Relaxed);
        StreamOutcome {
          runtime: loop_state.runtime,
          parser: loop_state.parser,
          splitter: loop_state.splitter,
        }
      })
      .expect("spawning the stream worker thread");

    StreamWorkerHandle { state, control, counters, step_records, join }
  }
}

struct WorkerLoop {
  snoop: Receiver<Arc<PooledBuffer>>,
  format: StreamFormat,
  runtime: AnalysisRuntime,
  parser: ReadoutParser,
  splitter: MultiEventSplitter,
  module_consumers: Vec<Box<dyn ModuleConsumer>>,
  buffer_consumers: Vec<Box<dyn BufferConsumer>>,
  state: Arc<Atomic<AnalysisWorkerState>>,
  control: Arc<(Mutex<DesiredStreamState>, Condvar)>,
  counters: Arc<Mutex<StreamWorkerCounters>>,
  step_records: Arc<Mutex<Vec<StepRecord>>>,
  pending: VecDeque<EventRecord>,
}

impl WorkerLoop {
  fn run(&mut self) {
    loop {
      match self.desired() {
        DesiredStreamState::Stop => return,
        DesiredStreamState::Pause => {
          self.state.store(AnalysisWorkerState::Paused, Relaxed);
          self.wait_while_paused();
        }
        DesiredStreamState::SingleStep => {
          self.state.store(AnalysisWorkerState::SingleStepping, Relaxed);
          // Keep going until one physics event has been processed, then
          // drop back to paused.
          if self.process_one() == Some(ProcessedKind::Physics) {
            let (lock, _) = &*self.control;
            let mut desired = lock.lock().expect("control mutex");
            if *desired == DesiredStreamState::SingleStep {
              *desired = DesiredStreamState::Pause;
            }
          }
        }
        DesiredStreamState::Run => {
          self.state.store(AnalysisWorkerState::Running, Relaxed);
          self.process_one();
        }
      }
    }
  }

  fn desired(&self) -> DesiredStreamState {
    *self.control.0.lock().expect("control mutex")
  }

  /// Blocks on the condition variable while paused. The mutex is held
  /// only across the wait itself.
  fn wait_while_paused(&self) {
    let (lock, condvar) = &*self.control;
    let mut desired = lock.lock().expect("control mutex");
    while *desired == DesiredStreamState::Pause {
      desired = condvar.wait(desired).expect("control mutex");
    }
  }

  /// Processes one pending record, pulling and parsing a buffer first when
  /// none are pending. Returns what was processed, if anything.
  fn process_one(&mut self) -> Option<ProcessedKind> {
    if self.pending.is_empty() && !self.fill_pending() {
      return None;
    }
    let record: EventRecord = self.pending.pop_front()?;
    match record {
      EventRecord::Physics { event_index, modules } => {
        self.process_physics_event(event_index, &modules);
        if self.state.load(Relaxed) == AnalysisWorkerState::SingleStepping {
          self.step_records.lock().expect("step mutex").push(StepRecord {
            event_index,
            module_word_counts: modules.iter().map(|m| m.as_ref().map(Vec::len)).collect(),
          });
        }
        Some(ProcessedKind::Physics)
      }
      EventRecord::System { subtype, words } => {
        self.process_system_event(subtype, &words);
        Some(ProcessedKind::System)
      }
    }
  }

  /// Receives and parses one buffer. Returns false when the snoop queue
  /// stayed empty for the timeout.
  fn fill_pending(&mut self) -> bool {
    let buffer: Arc<PooledBuffer> = match self.snoop.recv_timeout(Duration::from_millis(100)) {
      Ok(buffer) => buffer,
      Err(RecvTimeoutError::Timeout) => return false,
      Err(RecvTimeoutError::Disconnected) => {
        // The producer is gone; request a stop so the loop unwinds.
        let (lock, _) = &*self.control;
        *lock.lock().expect("control mutex") = DesiredStreamState::Stop;
        return false;
      }
    };

    for consumer in &mut self.buffer_consumers {
      consumer.buffer(buffer.buffer_number, buffer.words());
    }

    let mut collector: Collector = Collector {
      splitter: &mut self.splitter,
      records: &mut self.pending,
      current_event: None,
    };
    match self.format {
      StreamFormat::Usb => self.parser.parse_usb_buffer(buffer.words(), &mut collector),
      StreamFormat::Eth => self.parser.parse_eth_buffer(buffer.words(), &mut collector),
    }
    self.counters.lock().expect("counters mutex").buffers_processed += 1;
    true
  }

  fn process_physics_event(&mut self, event_index: usize, modules: &[Option<Vec<u32>>]) {
    self.runtime.begin_event(event_index);
    for consumer in &mut self.module_consumers {
      consumer.begin_event(event_index);
    }
    for (module_index, module) in modules.iter().enumerate() {
      if let Some(words) = module {
        self.runtime.process_module_data(event_index, module_index, words);
        for consumer in &mut self.module_consumers {
          consumer.module_data(event_index, module_index, words);
        }
      }
    }
    self.runtime.end_event(event_index);
    for consumer in &mut self.module_consumers {
      consumer.end_event(event_index);
    }
    self.counters.lock().expect("counters mutex").physics_events += 1;
  }

  fn process_system_event(&mut self, subtype: SystemEventSubtype, words: &[u32]) {
    if subtype == SystemEventSubtype::TimeTick {
      self.runtime.sample_rates();
    }
    for consumer in &mut self.module_consumers {
      consumer.system_event(subtype, words);
    }
    self.counters.lock().expect("counters mutex").system_events += 1;
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ProcessedKind {
  Physics,
  System,
}

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

//! # READOUT & REPLAY WORKERS
//!
//! The readout worker owns one controller for the duration of a run: it
//! compiles and uploads the stacks, programs the triggers, arms the crate,
//! and then spins a dedicated thread moving raw buffers from the data
//! channel into the listfile archive and, best-effort, into the snoop
//! queue feeding live analysis.
//!
//! ---------------------------------------------------------------------------
//!
//! The archive is the authoritative consumer: when it cannot keep up the
//! whole loop blocks on its write, and nothing is ever dropped from the
//! archive path. The snoop queue is bounded and lossy; a full queue drops
//! the buffer from the snoop path only and counts the loss.
//!
//! Cancellation is cooperative. The worker re-checks an atomic desired
//! state every loop iteration and returns within one read timeout of a stop
//! request: immediately on abort, after draining the transport on a
//! graceful stop.
//!
//! For replays the [Replay Worker] feeds the same snoop queue from a
//! listfile archive instead of a controller, so everything downstream is
//! oblivious to the difference.
//!
//! [Replay Worker]: ReplayWorker

use crate::buffer::{BufferPool, PooledBuffer};
use crate::config::CrateConfig;
use crate::listfile::{ListfileError, ListfileReader, ListfileWriterConfig, SplitListfileWriter};
use crate::transport::{Transport, TransportError};
use crate::{BUFFER_POOL_DEPTH, DATA_BUFFER_WORDS, SNOOP_QUEUE_DEPTH};
use atomic::Atomic;
use bytemuck::NoUninit;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mvlc_stack::frame::SystemEventSubtype;
use mvlc_stack::script;
use mvlc_stack::superc::build_upload_program;
use mvlc_stack::trigger::{compute_trigger_value, stack_offset_register, trigger_register, DAQ_START_REGISTER};
use mvlc_stack::{CompileError, OutputPipe, ScriptCommand};
use oneshot::Sender as SendOnce;
use std::path::PathBuf;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// ## DAQ STATE
///
/// The externally visible state of a worker.
#[derive(Clone, Copy, Debug, Default, Eq, NoUninit, PartialEq)]
#[repr(u8)]
pub enum DaqState {
  /// ### IDLE
  #[default]
  Idle = 0,

  /// ### STARTING
  Starting = 1,

  /// ### RUNNING
  Running = 2,

  /// ### PAUSED
  Paused = 3,

  /// ### STOPPING
  Stopping = 4,
}

/// ## DESIRED STATE
///
/// What the controlling side wants the worker to do next; checked at every
/// loop iteration.
#[derive(Clone, Copy, Debug, Default, Eq, NoUninit, PartialEq)]
#[repr(u8)]
enum DesiredState {
  #[default]
  Run = 0,
  Pause = 1,
  StopGraceful = 2,
  StopAbort = 3,
}

/// ## READOUT ERROR
#[derive(Debug, thiserror::Error)]
pub enum ReadoutError {
  /// ### TRANSPORT
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// ### LISTFILE
  #[error(transparent)]
  Listfile(#[from] ListfileError),

  /// ### COMPILE
  #[error(transparent)]
  Compile(#[from] CompileError),

  /// ### WORKER GONE
  #[error("the worker thread is no longer reachable")]
  WorkerGone,
}

/// ## DAQ STATS
///
/// Counters of one run, snapshot-readable from any thread.
#[derive(Clone, Debug, Default)]
pub struct DaqStats {
  /// ### BUFFERS READ
  pub buffers_read: u64,

  /// ### BYTES READ
  pub bytes_read: u64,

  /// ### SNOOP DROPPED BUFFERS
  ///
  /// Buffers that never reached live analysis because the snoop queue was
  /// full. The archive received them regardless.
  pub snoop_dropped_buffers: u64,

  /// ### TIMETICKS WRITTEN
  pub timeticks_written: u64,

  /// ### RUN SECONDS
  pub run_seconds: u64,

  /// ### LAST ERROR
  pub last_error: Option<String>,
}

/// ## READOUT OPTIONS
#[derive(Clone, Debug)]
pub struct ReadoutOptions {
  /// ### LISTFILE
  ///
  /// Where to archive the run; [None] runs without persistence (snoop
  /// only), which is useful on test benches.
  pub listfile: Option<ListfileWriterConfig>,

  /// ### READ TIMEOUT
  pub read_timeout: Duration,

  /// ### TIMETICK INTERVAL
  pub timetick_interval: Duration,
}

impl Default for ReadoutOptions {
  fn default() -> Self {
    ReadoutOptions {
      listfile: None,
      read_timeout: Duration::from_millis(100),
      timetick_interval: Duration::from_secs(1),
    }
  }
}

/// Control requests carry a oneshot acknowledgement so callers can block
/// until the worker has acted.
enum Control {
  Pause(SendOnce<()>),
  Resume(SendOnce<()>),
  Stop(SendOnce<()>),
}

/// ## WORKER HANDLE
///
/// The controlling side of a running worker: state, stats, the snoop
/// queue, and the control channel. Shared by readout and replay.
pub struct WorkerHandle {
  state: Arc<Atomic<DaqState>>,
  desired: Arc<Atomic<DesiredState>>,
  stats: Arc<Mutex<DaqStats>>,
  snoop_rx: Receiver<Arc<PooledBuffer>>,
  control_tx: Sender<Control>,
  join: JoinHandle<Result<(), ReadoutError>>,
}

impl WorkerHandle {
  /// ### STATE
  pub fn state(&self) -> DaqState {
    self.state.load(Relaxed)
  }

  /// ### STATS
  pub fn stats(&self) -> DaqStats {
    self.stats.lock().expect("stats mutex").clone()
  }

  /// ### SNOOP QUEUE
  ///
  /// The receiving end of the snoop queue. Clone freely; all clones drain
  /// the same queue.
  pub fn snoop(&self) -> Receiver<Arc<PooledBuffer>> {
    self.snoop_rx.clone()
  }

  /// ### PAUSE
  pub fn pause(&self) -> Result<(), ReadoutError> {
    self.desired.store(DesiredState::Pause, Relaxed);
    self.ack(Control::Pause)
  }

  /// ### RESUME
  pub fn resume(&self) -> Result<(), ReadoutError> {
    self.desired.store(DesiredState::Run, Relaxed);
    self.ack(Control::Resume)
  }

  /// ### STOP
  ///
  /// Requests a stop and joins the worker. `graceful` drains pending
  /// transport data before stopping; otherwise the loop exits at the next
  /// iteration.
  pub fn stop(self, graceful: bool) -> Result<(), ReadoutError> {
    let desired: DesiredState = if graceful { DesiredState::StopGraceful } else { DesiredState::StopAbort };
    self.desired.store(desired, Relaxed);
    let (ack_tx, _ack_rx) = oneshot::channel::<()>();
    let _ = self.control_tx.send(Control::Stop(ack_tx));
    self.join.join().map_err(|_| ReadoutError::WorkerGone)?
  }

  fn ack(&self, make: impl FnOnce(SendOnce<()>) -> Control) -> Result<(), ReadoutError> {
    let (ack_tx, ack_rx) = oneshot::channel::<()>();
    self.control_tx.send(make(ack_tx)).map_err(|_| ReadoutError::WorkerGone)?;
    ack_rx.recv().map_err(|_| ReadoutError::WorkerGone)
  }
}

/// ## READOUT WORKER
///
/// See the module documentation for the run protocol.
pub struct ReadoutWorker;

impl ReadoutWorker {
  /// ### START
  ///
  /// Spawns the readout thread. The handle is returned immediately; the
  /// thread performs the prepare sequence (stack upload, trigger
  /// programming, start scripts, archive preamble) and then acquires until
  /// told to stop.
  pub fn start(
    transport: Arc<dyn Transport>,
    config: CrateConfig,
    options: ReadoutOptions,
  ) -> WorkerHandle {
    let state: Arc<Atomic<DaqState>> = Arc::new(Atomic::new(DaqState::Starting));
    let desired: Arc<Atomic<DesiredState>> = Arc::new(Atomic::new(DesiredState::Run));
    let stats: Arc<Mutex<DaqStats>> = Arc::new(Mutex::new(DaqStats::default()));
    let (snoop_tx, snoop_rx) = bounded::<Arc<PooledBuffer>>(SNOOP_QUEUE_DEPTH);
    let (control_tx, control_rx) = crossbeam_channel::unbounded::<Control>();

    let thread_state = state.clone();
    let thread_desired = desired.clone();
    let thread_stats = stats.clone();
    let join: JoinHandle<Result<(), ReadoutError>> = thread::Builder::new()
      .name("mvlc_readout".to_string())
      .spawn(move || {
        let mut run: ReadoutRun = ReadoutRun {
          transport,
          config,
          options,
          state: thread_state,
          desired: thread_desired,
          stats: thread_stats,
          snoop_tx,
          control_rx,
          // The snoop queue can pin up to its depth in buffers; the read
          // and archive path keeps its own headroom on top.
          pool: BufferPool::new(BUFFER_POOL_DEPTH + SNOOP_QUEUE_DEPTH, DATA_BUFFER_WORDS),
          writer: None,
          next_buffer_number: 1,
        };
        let result: Result<(), ReadoutError> = run.run();
        run.state.store(DaqState::Idle, Relaxed);
        if let Err(error) = &result {
          tracing::error!(%error, "readout run ended with error");
          run.stats.lock().expect("stats mutex").last_error = Some(error.to_string());
        }
        result
      })
      .expect("spawning the readout thread");

    WorkerHandle { state, desired, stats, snoop_rx, control_tx, join }
  }
}

struct ReadoutRun {
  transport: Arc<dyn Transport>,
  config: CrateConfig,
  options: ReadoutOptions,
  state: Arc<Atomic<DaqState>>,
  desired: Arc<Atomic<DesiredState>>,
  stats: Arc<Mutex<DaqStats>>,
  snoop_tx: Sender<Arc<PooledBuffer>>,
  control_rx: Receiver<Control>,
  pool: BufferPool,
  writer: Option<SplitListfileWriter>,
  next_buffer_number: u32,
}

impl ReadoutRun {
  fn run(&mut self) -> Result<(), ReadoutError> {
    let started: Instant = Instant::now();
    self.prepare()?;
    self.state.store(DaqState::Running, Relaxed);
    tracing::info!("readout running");

    let acquire_result: Result<(), ReadoutError> = self.acquire_loop(started);
    self.state.store(DaqState::Stopping, Relaxed);

    // Stop scripts and the archive epilogue run even when the loop ended
    // with an error, as long as the controller is still reachable.
    let stop_result: Result<(), ReadoutError> = self.shutdown();
    self.stats.lock().expect("stats mutex").run_seconds = started.elapsed().as_secs();
    acquire_result.and(stop_result)
  }

  /// The prepare sequence: stacks, triggers, start scripts, archive.
  fn prepare(&mut self) -> Result<(), ReadoutError> {
    // Module reset scripts first, each executed host-side.
    for event in self.config.events.iter().filter(|event| event.enabled) {
      for module in &event.modules {
        run_host_script(self.transport.as_ref(), &module.reset)?;
      }
    }

    // Compile, upload, and bind every enabled event's stack. Stacks pack
    // back to back above the immediate slot.
    let mut offset: u16 = mvlc_stack::IMMEDIATE_STACK_RESERVED_WORDS as u16;
    for (event_index, event) in self.config.events.iter().enumerate() {
      let stack_id: u8 = event_index as u8 + 1;
      if !event.enabled {
        self.transport.write_register(trigger_register(stack_id), 0)?;
        continue;
      }
      let builder = self.config.compile_event_stack(event_index)?;
      let words: Vec<u32> = builder.encode()?;
      for buffer in build_upload_program(&words, offset, stack_id as u16)? {
        self.transport.execute_super_buffer(&decode_buffer_commands(&buffer))?;
      }
      self.transport.write_register(stack_offset_register(stack_id), offset as u32)?;
      self.transport.write_register(
        trigger_register(stack_id),
        compute_trigger_value(event.trigger) as u32,
      )?;
      tracing::debug!(event = %event.name, stack_id, offset, words = words.len(), "uploaded readout stack");
      offset += words.len() as u16;
    }

    run_host_script(self.transport.as_ref(), &self.config.global_start)?;
    run_host_script(self.transport.as_ref(), &self.config.multicast_start)?;

    if let Some(listfile_config) = self.options.listfile.clone() {
      let mut writer: SplitListfileWriter =
        SplitListfileWriter::create(listfile_config, &self.config, None)?;
      writer.log_message("readout started");
      self.writer = Some(writer);
    }

    self.transport.write_register(DAQ_START_REGISTER, 1)?;
    Ok(())
  }

  fn acquire_loop(&mut self, started: Instant) -> Result<(), ReadoutError> {
    let mut last_tick: Instant = Instant::now();
    loop {
      match self.desired.load(Relaxed) {
        DesiredState::StopAbort => return Ok(()),
        DesiredState::StopGraceful => {
          // Drain until the transport goes quiet once.
          while self.read_one_buffer()? > 0 {}
          return Ok(());
        }
        DesiredState::Pause => {
          if self.state.load(Relaxed) == DaqState::Running {
            self.transport.write_register(DAQ_START_REGISTER, 0)?;
            self.state.store(DaqState::Paused, Relaxed);
            tracing::info!("readout paused");
          }
          self.process_controls(true);
          continue;
        }
        DesiredState::Run => {
          if self.state.load(Relaxed) == DaqState::Paused {
            self.transport.write_register(DAQ_START_REGISTER, 1)?;
            self.state.store(DaqState::Running, Relaxed);
            tracing::info!("readout resumed");
          }
        }
      }
      self.process_controls(false);

      self.read_one_buffer()?;

      if last_tick.elapsed() >= self.options.timetick_interval {
        last_tick = Instant::now();
        self.emit_timetick()?;
        self.stats.lock().expect("stats mutex").run_seconds = started.elapsed().as_secs();
      }
    }
  }

  /// Reads one buffer from the transport; archives it, then offers it to
  /// the snoop queue. Returns the word count read.
  fn read_one_buffer(&mut self) -> Result<usize, ReadoutError> {
    let Some(mut buffer) = self.pool.acquire(self.options.read_timeout) else {
      // Every buffer is in flight; downstream holds them. Trying again
      // keeps the loop responsive to stop requests.
      return Ok(0);
    };
    let max_words: usize = self.pool.buffer_words();
    let words_read: usize = self
      .transport
      .read_data(buffer.storage_mut(), max_words, self.options.read_timeout)?;
    if words_read == 0 {
      return Ok(0);
    }

    buffer.buffer_number = self.next_buffer_number;
    self.next_buffer_number = self.next_buffer_number.wrapping_add(1);

    if let Some(writer) = self.writer.as_mut() {
      writer.write_words(buffer.words())?;
    }
    {
      let mut stats = self.stats.lock().expect("stats mutex");
      stats.buffers_read += 1;
      stats.bytes_read += words_read as u64 * 4;
    }
    self.offer_to_snoop(buffer);
    Ok(words_read)
  }

  fn offer_to_snoop(&mut self, buffer: PooledBuffer) {
    match self.snoop_tx.try_send(Arc::new(buffer)) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
        self.stats.lock().expect("stats mutex").snoop_dropped_buffers += 1;
      }
    }
  }

  fn emit_timetick(&mut self) -> Result<(), ReadoutError> {
    if let Some(writer) = self.writer.as_mut() {
      writer.write_timetick()?;
    }
    self.emit_system_event(SystemEventSubtype::TimeTick)?;
    self.stats.lock().expect("stats mutex").timeticks_written += 1;
    Ok(())
  }

  /// Sends a synthetic system event buffer down the snoop path.
  fn emit_system_event(&mut self, subtype: SystemEventSubtype) -> Result<(), ReadoutError> {
    let now: u64 = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let words: Vec<u32> = crate::listfile::system_event_frames(subtype, &[now as u32]);
    if let Some(mut buffer) = self.pool.acquire(Duration::ZERO) {
      buffer.storage_mut().extend_from_slice(&words);
      buffer.buffer_number = self.next_buffer_number;
      self.next_buffer_number = self.next_buffer_number.wrapping_add(1);
      self.offer_to_snoop(buffer);
    }
    Ok(())
  }

  fn shutdown(&mut self) -> Result<(), ReadoutError> {
    let mut first_error: Option<ReadoutError> = None;
    let mut note = |result: Result<(), ReadoutError>| {
      if let Err(error) = result {
        tracing::warn!(%error, "error during readout shutdown");
        if first_error.is_none() {
          first_error = Some(error);
        }
      }
    };

    note(self.transport.write_register(DAQ_START_REGISTER, 0).map_err(Into::into));
    note(run_host_script(self.transport.as_ref(), &self.config.multicast_stop.clone()));
    note(run_host_script(self.transport.as_ref(), &self.config.global_stop.clone()));

    if let Some(mut writer) = self.writer.take() {
      let end_run = writer.write_system_event(SystemEventSubtype::EndRun, &[]);
      note(end_run.map_err(Into::into));
      writer.log_message("readout stopped");
      match writer.close() {
        Ok(parts) => tracing::info!(parts = parts.len(), "listfile closed"),
        Err(error) => note(Err(error.into())),
      }
    }
    note(self.emit_system_event(SystemEventSubtype::EndRun));
    note(self.emit_system_event(SystemEventSubtype::EndOfFile));

    match first_error {
      None => Ok(()),
      Some(error) => Err(error),
    }
  }

  /// Acknowledges pending control requests; blocks briefly when idle so a
  /// paused worker does not spin.
  fn process_controls(&mut self, blocking: bool) {
    let deadline: Duration = if blocking { self.options.read_timeout } else { Duration::ZERO };
    while let Ok(control) = self.control_rx.recv_timeout(deadline) {
      match control {
        Control::Pause(ack) | Control::Resume(ack) | Control::Stop(ack) => {
          let _ = ack.send(());
        }
      }
      if deadline.is_zero() {
        break;
      }
    }
  }
}

/// ## RUN HOST SCRIPT
///
/// Executes a script host-side: contiguous runs of stack-compatible
/// commands execute as immediate stacks, software delays sleep on the
/// host.
pub fn run_host_script(transport: &dyn Transport, commands: &[ScriptCommand]) -> Result<(), ReadoutError> {
  let mut segment: Vec<ScriptCommand> = vec![];
  let flush = |transport: &dyn Transport, segment: &mut Vec<ScriptCommand>| -> Result<(), ReadoutError> {
    if segment.is_empty() {
      return Ok(());
    }
    let builder = script::compile("host_script", OutputPipe::Command, segment)?;
    let words: Vec<u32> = builder.encode()?;
    transport.execute_immediate_stack(&words)?;
    segment.clear();
    Ok(())
  };

  for command in commands {
    match command {
      ScriptCommand::SoftwareDelay { ms } => {
        flush(transport, &mut segment)?;
        thread::sleep(Duration::from_millis(*ms as u64));
      }
      other => segment.push(other.clone()),
    }
  }
  flush(transport, &mut segment)
}

/// Decodes the super command words of an upload buffer back into commands
/// for [execute super buffer]. Keeps the transport interface at the
/// command level while the upload builder works in words.
///
/// [execute super buffer]: Transport::execute_super_buffer
fn decode_buffer_commands(buffer: &[u32]) -> Vec<mvlc_stack::superc::SuperCommand> {
  use mvlc_stack::superc::{SuperCommand, SuperCommandType};
  let mut commands: Vec<SuperCommand> = vec![];
  let mut i: usize = 0;
  while i < buffer.len() {
    match SuperCommandType::try_from((buffer[i] >> 16) as u16) {
      Ok(SuperCommandType::WriteLocal) if i + 2 < buffer.len() => {
        commands.push(SuperCommand::WriteLocal { address: buffer[i + 1] as u16, value: buffer[i + 2] });
        i += 3;
      }
      Ok(SuperCommandType::ReadLocal) if i + 1 < buffer.len() => {
        commands.push(SuperCommand::ReadLocal { address: buffer[i + 1] as u16 });
        i += 2;
      }
      _ => i += 1,
    }
  }
  commands
}

/// ## REPLAY WORKER
///
/// Feeds the snoop queue from a listfile archive, part by part, blocking
/// rather than dropping: replays deliver every buffer.
pub struct ReplayWorker;

impl ReplayWorker {
  /// ### START
  pub fn start(parts: Vec<PathBuf>) -> WorkerHandle {
    let state: Arc<Atomic<DaqState>> = Arc::new(Atomic::new(DaqState::Starting));
    let desired: Arc<Atomic<DesiredState>> = Arc::new(Atomic::new(DesiredState::Run));
    let stats: Arc<Mutex<DaqStats>> = Arc::new(Mutex::new(DaqStats::default()));
    let (snoop_tx, snoop_rx) = bounded::<Arc<PooledBuffer>>(SNOOP_QUEUE_DEPTH);
    let (control_tx, control_rx) = crossbeam_channel::unbounded::<Control>();

    let thread_state = state.clone();
    let thread_desired = desired.clone();
    let thread_stats = stats.clone();
    let join: JoinHandle<Result<(), ReadoutError>> = thread::Builder::new()
      .name("mvlc_replay".to_string())
      .spawn(move || {
        let pool: BufferPool = BufferPool::new(BUFFER_POOL_DEPTH + SNOOP_QUEUE_DEPTH, DATA_BUFFER_WORDS);
        let mut buffer_number: u32 = 1;
        thread_state.store(DaqState::Running, Relaxed);

        'parts: for part in &parts {
          let mut reader: ListfileReader = ListfileReader::open(part)?;
          tracing::info!(part = %part.display(), "replaying listfile part");
          loop {
            // Control and cancellation checks once per buffer.
            while let Ok(Control::Pause(ack) | Control::Resume(ack) | Control::Stop(ack)) = control_rx.try_recv() {
              let _ = ack.send(());
            }
            match thread_desired.load(Relaxed) {
              DesiredState::StopAbort | DesiredState::StopGraceful => break 'parts,
              DesiredState::Pause => {
                thread_state.store(DaqState::Paused, Relaxed);
                thread::sleep(Duration::from_millis(10));
                continue;
              }
              DesiredState::Run => {
                thread_state.store(DaqState::Running, Relaxed);
              }
            }

            let Some(mut buffer) = pool.acquire(Duration::from_millis(100)) else {
              continue;
            };
            let words: usize = reader.next_buffer(buffer.storage_mut(), DATA_BUFFER_WORDS)?;
            if words == 0 {
              break;
            }
            buffer.buffer_number = buffer_number;
            buffer_number = buffer_number.wrapping_add(1);
            {
              let mut stats = thread_stats.lock().expect("stats mutex");
              stats.buffers_read += 1;
              stats.bytes_read += words as u64 * 4;
            }
            // Replays block instead of dropping.
            if snoop_tx.send(Arc::new(buffer)).is_err() {
              break 'parts;
            }
          }
        }
        thread_state.store(DaqState::Idle, Relaxed);
        Ok(())
      })
      .expect("spawning the replay thread");

    WorkerHandle { state, desired, stats, snoop_rx, control_tx, join }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{EventConfig, ModuleConfig};
  use crate::listfile::{ListfileFormat, SplitMode};
  use crate::transport::mirror_response_of;
  use mvlc_stack::frame::{make_frame_header, make_stack_frame_header, FrameFlags, FrameType};
  use mvlc_stack::superc::SuperCommand;
  use mvlc_stack::trigger::TriggerCondition;

  /// A controller stand-in: registers are a map, immediate stacks succeed,
  /// and the data channel replays scripted buffers.
  struct FakeController {
    registers: Mutex<std::collections::HashMap<u16, u32>>,
    data: Mutex<Vec<Vec<u32>>>,
  }

  impl FakeController {
    fn new(data: Vec<Vec<u32>>) -> Self {
      FakeController { registers: Mutex::new(Default::default()), data: Mutex::new(data) }
    }

    fn register(&self, address: u16) -> Option<u32> {
      self.registers.lock().unwrap().get(&address).copied()
    }
  }

  impl Transport for FakeController {
    fn execute_super_buffer(&self, commands: &[SuperCommand]) -> Result<Vec<u32>, TransportError> {
      let mut registers = self.registers.lock().unwrap();
      for command in commands {
        if let SuperCommand::WriteLocal { address, value } = command {
          registers.insert(*address, *value);
        }
      }
      let request: Vec<u32> = mvlc_stack::superc::make_command_buffer(0, commands);
      Ok(mirror_response_of(&request, |address| registers.get(&address).copied().unwrap_or(0)))
    }

    fn execute_immediate_stack(&self, _stack_words: &[u32]) -> Result<Vec<u32>, TransportError> {
      Ok(vec![])
    }

    fn read_data(&self, dest: &mut Vec<u32>, _max_words: usize, timeout: Duration) -> Result<usize, TransportError> {
      let mut data = self.data.lock().unwrap();
      if let Some(buffer) = data.pop() {
        dest.extend_from_slice(&buffer);
        Ok(buffer.len())
      } else {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(0)
      }
    }
  }

  fn test_config() -> CrateConfig {
    CrateConfig {
      crate_id: 0,
      events: vec![EventConfig {
        name: "event0".to_string(),
        trigger: TriggerCondition::Irq { level: 3, iack: true },
        enabled: true,
        modules: vec![ModuleConfig {
          name: "madc32".to_string(),
          readout: vec![mvlc_stack::ScriptCommand::MbltFifo { address: 0x0100_0000, transfers: 2 }],
          reset: vec![],
        }],
      }],
      ..Default::default()
    }
  }

  fn one_event_buffer() -> Vec<u32> {
    vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 3, FrameFlags::empty()),
      make_frame_header(FrameType::BlockRead, 2, FrameFlags::empty()),
      0xAB, 0xCD,
    ]
  }

  #[test]
  fn readout_arms_triggers_and_archives_buffers() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let controller: Arc<FakeController> = Arc::new(FakeController::new(vec![one_event_buffer()]));
    let options: ReadoutOptions = ReadoutOptions {
      listfile: Some(ListfileWriterConfig {
        output_dir: dir.path().to_path_buf(),
        base_name: "run".to_string(),
        format: ListfileFormat::Usb,
        split: SplitMode::None,
        compress: false,
      }),
      read_timeout: Duration::from_millis(10),
      timetick_interval: Duration::from_secs(3600),
    };

    let handle: WorkerHandle = ReadoutWorker::start(controller.clone(), test_config(), options);
    let snoop = handle.snoop();

    // The snooped buffer proves the loop ran end to end.
    let buffer: Arc<PooledBuffer> = snoop.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(buffer.words(), one_event_buffer().as_slice());

    handle.stop(false).unwrap();

    // Trigger register for stack 1 got the IRQ3-with-IACK value, and the
    // DAQ was disarmed on stop.
    assert_eq!(controller.register(trigger_register(1)), Some((1 << 3 | 3) as u32));
    assert_eq!(controller.register(DAQ_START_REGISTER), Some(0));

    // The archive replays the same buffer.
    let zip_path: PathBuf = dir.path().join("run.zip");
    let mut reader: ListfileReader = ListfileReader::open(&zip_path).unwrap();
    let mut words: Vec<u32> = vec![];
    while reader.next_buffer(&mut words, 1 << 20).unwrap() > 0 {}
    assert!(words.windows(4).any(|window| window == one_event_buffer().as_slice()));
  }

  #[test]
  fn full_snoop_queue_drops_but_archive_stays_complete() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let buffer_count: usize = crate::SNOOP_QUEUE_DEPTH + 5;
    let controller: Arc<FakeController> =
      Arc::new(FakeController::new(vec![one_event_buffer(); buffer_count]));
    let options: ReadoutOptions = ReadoutOptions {
      listfile: Some(ListfileWriterConfig {
        output_dir: dir.path().to_path_buf(),
        base_name: "droppy".to_string(),
        format: ListfileFormat::Usb,
        split: SplitMode::None,
        compress: false,
      }),
      read_timeout: Duration::from_millis(10),
      timetick_interval: Duration::from_secs(3600),
    };

    // Nobody drains the snoop queue, so it fills and overflows.
    let handle: WorkerHandle = ReadoutWorker::start(controller, test_config(), options);
    let deadline: std::time::Instant = std::time::Instant::now() + Duration::from_secs(5);
    while handle.stats().buffers_read < buffer_count as u64 && std::time::Instant::now() < deadline {
      std::thread::sleep(Duration::from_millis(5));
    }
    let stats: DaqStats = handle.stats();
    handle.stop(false).unwrap();

    assert_eq!(stats.buffers_read, buffer_count as u64);
    assert!(stats.snoop_dropped_buffers > 0, "expected snoop-side drops");

    // Every buffer reached the archive regardless.
    let mut reader: ListfileReader = ListfileReader::open(&dir.path().join("droppy.zip")).unwrap();
    let mut words: Vec<u32> = vec![];
    while reader.next_buffer(&mut words, 1 << 20).unwrap() > 0 {}
    let event: Vec<u32> = one_event_buffer();
    let archived: usize = words.windows(4).filter(|window| *window == event.as_slice()).count();
    assert_eq!(archived, buffer_count);
  }

  #[test]
  fn replay_feeds_snoop_from_archive() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let config: ListfileWriterConfig = ListfileWriterConfig {
      output_dir: dir.path().to_path_buf(),
      base_name: "replayme".to_string(),
      format: ListfileFormat::Usb,
      split: SplitMode::None,
      compress: false,
    };
    let mut writer: SplitListfileWriter = SplitListfileWriter::create(config, &test_config(), None).unwrap();
    writer.write_words(&one_event_buffer()).unwrap();
    let parts: Vec<PathBuf> = writer.close().unwrap();

    let handle: WorkerHandle = ReplayWorker::start(parts);
    let snoop = handle.snoop();
    let mut seen_event: bool = false;
    while let Ok(buffer) = snoop.recv_timeout(Duration::from_secs(5)) {
      if buffer.words().windows(4).any(|window| window == one_event_buffer().as_slice()) {
        seen_event = true;
        break;
      }
    }
    assert!(seen_event, "replay delivered the archived event");
    handle.stop(false).unwrap();
  }
}

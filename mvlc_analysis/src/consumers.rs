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

//! # CONSUMER FAN-OUT
//!
//! Auxiliary consumers of the stream worker's output. Module consumers
//! receive the same per-event callbacks the analysis does; buffer
//! consumers receive the unparsed raw buffers. Both are called
//! synchronously from the stream worker thread, so a slow consumer slows the
//! whole pipeline, so consumers needing isolation wrap themselves in
//! [Threaded Module Consumer], which enqueues onto a bounded queue and
//! applies its own overflow policy.
//!
//! [Threaded Module Consumer]: ThreadedModuleConsumer

use crate::worker::RunDescriptor;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mvlc_stack::frame::SystemEventSubtype;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// ## MODULE CONSUMER
///
/// Receives the structured event stream. All methods default to no-ops.
pub trait ModuleConsumer: Send {
  /// ### BEGIN RUN
  fn begin_run(&mut self, run: &RunDescriptor) {
    let _ = run;
  }

  /// ### BEGIN EVENT
  fn begin_event(&mut self, event_index: usize) {
    let _ = event_index;
  }

  /// ### MODULE DATA
  fn module_data(&mut self, event_index: usize, module_index: usize, words: &[u32]) {
    let _ = (event_index, module_index, words);
  }

  /// ### END EVENT
  fn end_event(&mut self, event_index: usize) {
    let _ = event_index;
  }

  /// ### SYSTEM EVENT
  fn system_event(&mut self, subtype: SystemEventSubtype, words: &[u32]) {
    let _ = (subtype, words);
  }

  /// ### END RUN
  fn end_run(&mut self) {}
}

/// ## BUFFER CONSUMER
///
/// Receives raw buffers with their sequence numbers.
pub trait BufferConsumer: Send {
  /// ### BEGIN RUN
  fn begin_run(&mut self, run: &RunDescriptor) {
    let _ = run;
  }

  /// ### BUFFER
  fn buffer(&mut self, buffer_number: u32, words: &[u32]);

  /// ### END RUN
  fn end_run(&mut self) {}
}

/// ## OVERFLOW POLICY
///
/// What a threaded consumer does when its queue is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
  /// ### DROP
  ///
  /// Drop the message and count it; the pipeline never blocks.
  #[default]
  Drop,

  /// ### BLOCK
  ///
  /// Apply backpressure to the stream worker.
  Block,
}

enum ConsumerMessage {
  BeginRun(RunDescriptor),
  BeginEvent(usize),
  ModuleData { event_index: usize, module_index: usize, words: Vec<u32> },
  EndEvent(usize),
  SystemEvent { subtype: SystemEventSubtype, words: Vec<u32> },
  EndRun,
  Shutdown,
}

/// ## THREADED MODULE CONSUMER
///
/// Runs a wrapped consumer on its own thread behind a bounded queue. The
/// stream worker sees cheap enqueue operations; the wrapped consumer may
/// block as long as it likes.
pub struct ThreadedModuleConsumer {
  tx: Sender<ConsumerMessage>,
  policy: OverflowPolicy,
  dropped: Arc<AtomicU64>,
  join: Option<JoinHandle<()>>,
}

impl ThreadedModuleConsumer {
  /// ### SPAWN
  pub fn spawn(name: &str, mut inner: Box<dyn ModuleConsumer>, queue_depth: usize, policy: OverflowPolicy) -> Self {
    let (tx, rx): (Sender<ConsumerMessage>, Receiver<ConsumerMessage>) = bounded(queue_depth);
    let join: JoinHandle<()> = thread::Builder::new()
      .name(format!("consumer_{name}"))
      .spawn(move || {
        for message in rx {
          match message {
            ConsumerMessage::BeginRun(run) => inner.begin_run(&run),
            ConsumerMessage::BeginEvent(event_index) => inner.begin_event(event_index),
            ConsumerMessage::ModuleData { event_index, module_index, words } => {
              inner.module_data(event_index, module_index, &words);
            }
            ConsumerMessage::EndEvent(event_index) => inner.end_event(event_index),
            ConsumerMessage::SystemEvent { subtype, words } => inner.system_event(subtype, &words),
            ConsumerMessage::EndRun => inner.end_run(),
            ConsumerMessage::Shutdown => break,
          }
        }
      })
      .expect("spawning a consumer thread");

    ThreadedModuleConsumer {
      tx,
      policy,
      dropped: Arc::new(AtomicU64::new(0)),
      join: Some(join),
    }
  }

  /// ### DROPPED MESSAGES
  pub fn dropped_messages(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// ### SHUTDOWN
  ///
  /// Drains the queue and joins the thread.
  pub fn shutdown(mut self) {
    let _ = self.tx.send(ConsumerMessage::Shutdown);
    if let Some(join) = self.join.take() {
      let _ = join.join();
    }
  }

  fn enqueue(&mut self, message: ConsumerMessage) {
    match self.policy {
      OverflowPolicy::Block => {
        let _ = self.tx.send(message);
      }
      OverflowPolicy::Drop => {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(message) {
          self.dropped.fetch_add(1, Ordering::Relaxed);
        }
      }
    }
  }
}

impl ModuleConsumer for ThreadedModuleConsumer {
  fn begin_run(&mut self, run: &RunDescriptor) {
    // Run boundaries must not be dropped; they always block.
    let _ = self.tx.send(ConsumerMessage::BeginRun(run.clone()));
  }

  fn begin_event(&mut self, event_index: usize) {
    self.enqueue(ConsumerMessage::BeginEvent(event_index));
  }

  fn module_data(&mut self, event_index: usize, module_index: usize, words: &[u32]) {
    self.enqueue(ConsumerMessage::ModuleData { event_index, module_index, words: words.to_vec() });
  }

  fn end_event(&mut self, event_index: usize) {
    self.enqueue(ConsumerMessage::EndEvent(event_index));
  }

  fn system_event(&mut self, subtype: SystemEventSubtype, words: &[u32]) {
    self.enqueue(ConsumerMessage::SystemEvent { subtype, words: words.to_vec() });
  }

  fn end_run(&mut self) {
    let _ = self.tx.send(ConsumerMessage::EndRun);
  }
}

impl Drop for ThreadedModuleConsumer {
  fn drop(&mut self) {
    let _ = self.tx.send(ConsumerMessage::Shutdown);
    if let Some(join) = self.join.take() {
      let _ = join.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[derive(Default)]
  struct CountingConsumer {
    events: Arc<Mutex<Vec<usize>>>,
  }

  impl ModuleConsumer for CountingConsumer {
    fn begin_event(&mut self, event_index: usize) {
      self.events.lock().unwrap().push(event_index);
    }
  }

  #[test]
  fn threaded_consumer_forwards_in_order() {
    let events: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![]));
    let inner: CountingConsumer = CountingConsumer { events: events.clone() };
    let mut threaded: ThreadedModuleConsumer =
      ThreadedModuleConsumer::spawn("test", Box::new(inner), 64, OverflowPolicy::Block);

    for event_index in 0..10 {
      threaded.begin_event(event_index);
    }
    threaded.shutdown();
    assert_eq!(*events.lock().unwrap(), (0..10).collect::<Vec<usize>>());
  }

  /// A consumer that blocks until allowed to proceed, to force overflow.
  struct StallingConsumer {
    release: Receiver<()>,
  }

  impl ModuleConsumer for StallingConsumer {
    fn begin_event(&mut self, _event_index: usize) {
      let _ = self.release.recv();
    }
  }

  #[test]
  fn drop_policy_counts_overflow() {
    let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
    let inner: StallingConsumer = StallingConsumer { release: release_rx };
    let mut threaded: ThreadedModuleConsumer =
      ThreadedModuleConsumer::spawn("stall", Box::new(inner), 2, OverflowPolicy::Drop);

    for event_index in 0..50 {
      threaded.begin_event(event_index);
    }
    assert!(threaded.dropped_messages() > 0);

    for _ in 0..50 {
      let _ = release_tx.send(());
    }
    threaded.shutdown();
  }
}

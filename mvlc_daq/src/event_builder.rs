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

//! # EVENT BUILDER
//!
//! When several crates trigger on the same physics, each produces its own
//! readout events and the correlation between them exists only in module
//! timestamps. The event builder buffers per-module event data in bounded
//! FIFOs keyed by an extracted timestamp and re-emits combined events whose
//! members all fall within a configurable match window.
//!
//! ---------------------------------------------------------------------------
//!
//! Matching works around the newest FIFO heads: take the highest head
//! timestamp T, emit an event from every head within `match_window` of T,
//! leave newer data buffered, and discard heads older than
//! `T - discard_window` (counting them). Emitted events are in
//! non-decreasing timestamp order and memory is bounded by
//! `modules × fifo_depth × slice size`.

use std::collections::VecDeque;

/// ## TIMESTAMP EXTRACTOR
///
/// Where a module's event timestamp lives inside its data words: a word
/// selected from the front or the back, masked and shifted.
#[derive(Clone, Copy, Debug)]
pub struct TimestampExtractor {
  /// ### FROM END
  ///
  /// Select `word_index` counting backwards from the last word; most
  /// modules put the timestamp into their end-of-event word.
  pub from_end: bool,

  /// ### WORD INDEX
  pub word_index: usize,

  /// ### MASK
  pub mask: u32,

  /// ### SHIFT
  pub shift: u8,
}

impl Default for TimestampExtractor {
  fn default() -> Self {
    // The conventional end-of-event word: timestamp in the low 30 bits of
    // the last word.
    TimestampExtractor { from_end: true, word_index: 0, mask: 0x3FFF_FFFF, shift: 0 }
  }
}

impl TimestampExtractor {
  /// ### EXTRACT
  pub fn extract(&self, words: &[u32]) -> Option<u64> {
    let index: usize = if self.from_end {
      words.len().checked_sub(1 + self.word_index)?
    } else if self.word_index < words.len() {
      self.word_index
    } else {
      return None;
    };
    Some(((words[index] & self.mask) >> self.shift) as u64)
  }
}

/// ## EVENT BUILDER CONFIG
#[derive(Clone, Debug)]
pub struct EventBuilderConfig {
  /// ### MATCH WINDOW
  ///
  /// Heads within this distance of the reference timestamp join the
  /// emitted event.
  pub match_window: u64,

  /// ### DISCARD WINDOW
  ///
  /// Heads older than the reference minus this are unmatchable and are
  /// dropped. Must be at least the match window.
  pub discard_window: u64,

  /// ### FIFO DEPTH
  ///
  /// Matching is forced once any module buffers this many events, bounding
  /// memory when a module goes quiet.
  pub fifo_depth: usize,

  /// ### EXTRACTORS
  ///
  /// One per input module, in module order.
  pub extractors: Vec<TimestampExtractor>,
}

/// ## EVENT BUILDER COUNTERS
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventBuilderCounters {
  /// ### EMITTED EVENTS
  pub emitted_events: u64,

  /// ### DISCARDED EVENTS
  ///
  /// Module events dropped as unmatchable.
  pub discarded_events: u64,

  /// ### EMPTY MODULE DATA
  ///
  /// Emitted event slots for which a module had nothing in the window.
  pub empty_module_data: u64,

  /// ### NO TIMESTAMP
  ///
  /// Module events whose timestamp could not be extracted.
  pub no_timestamp: u64,
}

#[derive(Clone, Debug)]
struct BufferedEvent {
  timestamp: u64,
  words: Vec<u32>,
}

/// ## COMBINED EVENT
///
/// One output event: the reference timestamp and one optional data slice
/// per module.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedEvent {
  /// ### TIMESTAMP
  pub timestamp: u64,

  /// ### MODULES
  ///
  /// Indexed like the input modules; [None] marks a module with no data in
  /// the match window.
  pub modules: Vec<Option<Vec<u32>>>,
}

/// ## EVENT BUILDER
pub struct EventBuilder {
  config: EventBuilderConfig,
  fifos: Vec<VecDeque<BufferedEvent>>,
  counters: EventBuilderCounters,
  last_emitted_timestamp: u64,
}

impl EventBuilder {
  /// ### NEW BUILDER
  pub fn new(config: EventBuilderConfig) -> Self {
    let fifos: Vec<VecDeque<BufferedEvent>> = (0..config.extractors.len()).map(|_| VecDeque::new()).collect();
    EventBuilder {
      config,
      fifos,
      counters: EventBuilderCounters::default(),
      last_emitted_timestamp: 0,
    }
  }

  /// ### COUNTERS
  pub fn counters(&self) -> EventBuilderCounters {
    self.counters.clone()
  }

  /// ### PUSH MODULE EVENT
  ///
  /// Buffers one module's data for matching; call once per module per
  /// input event. Then call [flush ready] to collect whatever became
  /// matchable.
  ///
  /// [flush ready]: EventBuilder::flush_ready
  pub fn push_module_event(&mut self, module_index: usize, words: &[u32]) {
    let Some(timestamp) = self.config.extractors[module_index].extract(words) else {
      self.counters.no_timestamp += 1;
      return;
    };
    self.fifos[module_index].push_back(BufferedEvent { timestamp, words: words.to_vec() });
  }

  /// ### FLUSH READY
  ///
  /// Emits every combined event that can be formed under the matching
  /// rule. Invoke after each input; also invoke with `force` once the
  /// input stream ends to drain the remainder.
  pub fn flush_ready(&mut self, force: bool, mut emit: impl FnMut(CombinedEvent)) {
    loop {
      let ready: bool = force
        || self.fifos.iter().all(|fifo| !fifo.is_empty())
        || self.fifos.iter().any(|fifo| fifo.len() >= self.config.fifo_depth);
      if !ready {
        return;
      }

      // Reference: the highest head timestamp currently buffered.
      let Some(reference) = self
        .fifos
        .iter()
        .filter_map(|fifo| fifo.front().map(|event| event.timestamp))
        .max()
      else {
        return;
      };

      // Unmatchable heads leave first so they cannot hold the window
      // hostage.
      self.discard_older_than(reference.saturating_sub(self.config.discard_window));

      let mut modules: Vec<Option<Vec<u32>>> = Vec::with_capacity(self.fifos.len());
      let mut emitted_timestamp: u64 = reference;
      let mut any: bool = false;
      for fifo in &mut self.fifos {
        let head_matches: bool = fifo
          .front()
          .is_some_and(|event| reference.saturating_sub(event.timestamp) <= self.config.match_window);
        if head_matches {
          let event: BufferedEvent = fifo.pop_front().expect("head present");
          emitted_timestamp = emitted_timestamp.min(event.timestamp);
          modules.push(Some(event.words));
          any = true;
        } else {
          self.counters.empty_module_data += 1;
          modules.push(None);
        }
      }

      if !any {
        return;
      }
      self.counters.emitted_events += 1;
      debug_assert!(emitted_timestamp >= self.last_emitted_timestamp || self.counters.emitted_events == 1);
      self.last_emitted_timestamp = emitted_timestamp;
      emit(CombinedEvent { timestamp: emitted_timestamp, modules });

      if force && self.fifos.iter().all(|fifo| fifo.is_empty()) {
        return;
      }
      if !force {
        // One emission per call unless forced draining; the caller pushes
        // more input in between.
        return;
      }
    }
  }

  fn discard_older_than(&mut self, cutoff: u64) {
    for fifo in &mut self.fifos {
      while fifo.front().is_some_and(|event| event.timestamp < cutoff) {
        fifo.pop_front();
        self.counters.discarded_events += 1;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn builder(modules: usize, match_window: u64, discard_window: u64) -> EventBuilder {
    EventBuilder::new(EventBuilderConfig {
      match_window,
      discard_window,
      fifo_depth: 16,
      extractors: vec![TimestampExtractor::default(); modules],
    })
  }

  /// Module data whose last word carries the timestamp.
  fn event_words(timestamp: u32, payload: u32) -> Vec<u32> {
    vec![payload, timestamp & 0x3FFF_FFFF]
  }

  #[test]
  fn matching_heads_combine() {
    let mut eb: EventBuilder = builder(2, 10, 100);
    eb.push_module_event(0, &event_words(1000, 0xA));
    eb.push_module_event(1, &event_words(1004, 0xB));

    let mut out: Vec<CombinedEvent> = vec![];
    eb.flush_ready(false, |event| out.push(event));

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp, 1000);
    assert_eq!(out[0].modules[0].as_deref(), Some(event_words(1000, 0xA).as_slice()));
    assert_eq!(out[0].modules[1].as_deref(), Some(event_words(1004, 0xB).as_slice()));
    assert_eq!(eb.counters().emitted_events, 1);
  }

  #[test]
  fn module_outside_window_yields_empty_slot() {
    let mut eb: EventBuilder = builder(2, 10, 1000);
    eb.push_module_event(0, &event_words(1000, 0xA));
    eb.push_module_event(1, &event_words(1500, 0xB));

    let mut out: Vec<CombinedEvent> = vec![];
    eb.flush_ready(false, |event| out.push(event));

    // Module 0's head is 500 ticks older than the reference: outside the
    // match window, inside the discard window, so it stays buffered and
    // the emitted event has an empty slot for it.
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].modules[0], None);
    assert!(out[0].modules[1].is_some());
    assert_eq!(eb.counters().empty_module_data, 1);
  }

  #[test]
  fn stale_heads_are_discarded() {
    let mut eb: EventBuilder = builder(2, 10, 50);
    eb.push_module_event(0, &event_words(100, 0xA));
    eb.push_module_event(1, &event_words(1000, 0xB));

    let mut out: Vec<CombinedEvent> = vec![];
    eb.flush_ready(false, |event| out.push(event));

    assert_eq!(eb.counters().discarded_events, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].modules[0], None);
  }

  #[test]
  fn emitted_timestamps_are_non_decreasing() {
    let mut eb: EventBuilder = builder(2, 10, 100);
    let mut out: Vec<CombinedEvent> = vec![];
    for ts in [100u32, 200, 300, 400, 500] {
      eb.push_module_event(0, &event_words(ts, 0xA));
      eb.push_module_event(1, &event_words(ts + 3, 0xB));
      eb.flush_ready(false, |event| out.push(event));
    }
    eb.flush_ready(true, |event| out.push(event));

    assert_eq!(out.len(), 5);
    let timestamps: Vec<u64> = out.iter().map(|event| event.timestamp).collect();
    let mut sorted: Vec<u64> = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);
  }

  #[test]
  fn fifo_depth_forces_matching() {
    let mut eb: EventBuilder = EventBuilder::new(EventBuilderConfig {
      match_window: 10,
      discard_window: 100,
      fifo_depth: 3,
      extractors: vec![TimestampExtractor::default(); 2],
    });
    let mut out: Vec<CombinedEvent> = vec![];

    // Module 1 stays silent; module 0 keeps producing.
    for ts in [100u32, 200, 300] {
      eb.push_module_event(0, &event_words(ts, 0xA));
      eb.flush_ready(false, |event| out.push(event));
    }
    assert!(!out.is_empty(), "a silent module does not stall the builder");
    assert!(out.iter().all(|event| event.modules[1].is_none()));
  }

  #[test]
  fn missing_timestamp_is_counted() {
    let mut eb: EventBuilder = builder(1, 10, 100);
    eb.push_module_event(0, &[]);
    assert_eq!(eb.counters().no_timestamp, 1);
  }
}

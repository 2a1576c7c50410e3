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

//! # MULTI-EVENT SPLITTER
//!
//! In multi-event firmware modes a module answers one trigger with several
//! physics events packed back to back, each introduced by a module header
//! carrying the event's length. The splitter cuts a module's combined data
//! range back into per-physics-event slices using a per-module header
//! [filter] whose size field yields the length.
//!
//! A slice is the header word plus `length` data words. Words that belong
//! to no emitted slice (a gap before the next header, or a tail cut off
//! by a length running past the range) are counted as size-exceeded and
//! discarded. When splitting is disabled for an event the splitter passes
//! module data through untouched.
//!
//! [filter]: crate::filter::DataFilter

use crate::filter::DataFilter;

/// ## OVERSIZED MODULE POLICY
///
/// What to do when a header's length field runs past the end of the data
/// range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OversizedModulePolicy {
  /// ### SKIP TO NEXT HEADER
  ///
  /// Discard the oversized slice and resume scanning for the next header
  /// behind it.
  #[default]
  SkipToNextHeader,

  /// ### ABORT EVENT
  ///
  /// Discard the rest of the module's range.
  AbortEvent,
}

/// ## SPLITTER CONFIG
///
/// One header filter per (event, module); [None] disables splitting for
/// that module.
#[derive(Clone, Debug, Default)]
pub struct SplitterConfig {
  /// ### HEADER FILTERS
  pub filters: Vec<Vec<Option<DataFilter>>>,

  /// ### OVERSIZED POLICY
  pub oversized_policy: OversizedModulePolicy,
}

impl SplitterConfig {
  /// ### ENABLED FOR EVENT
  pub fn enabled_for_event(&self, event_index: usize) -> bool {
    self
      .filters
      .get(event_index)
      .is_some_and(|modules| modules.iter().any(Option::is_some))
  }
}

/// ## SPLITTER COUNTERS
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitterCounters {
  /// ### SLICES EMITTED
  pub slices_emitted: u64,

  /// ### SIZE EXCEEDED WORDS
  ///
  /// Words discarded because they belonged to no complete slice.
  pub size_exceeded_words: u64,

  /// ### EVENTS ABORTED
  pub events_aborted: u64,
}

/// ## MULTI-EVENT SPLITTER
#[derive(Clone, Debug, Default)]
pub struct MultiEventSplitter {
  config: SplitterConfig,
  counters: SplitterCounters,
}

impl MultiEventSplitter {
  /// ### NEW SPLITTER
  pub fn new(config: SplitterConfig) -> Self {
    MultiEventSplitter { config, counters: SplitterCounters::default() }
  }

  /// ### COUNTERS
  pub fn counters(&self) -> SplitterCounters {
    self.counters.clone()
  }

  /// ### ENABLED FOR EVENT
  pub fn enabled_for_event(&self, event_index: usize) -> bool {
    self.config.enabled_for_event(event_index)
  }

  /// ### SPLIT
  ///
  /// Cuts one module's data range into slices, invoking `emit` once per
  /// physics event slice. Without a configured filter the whole range is
  /// emitted as a single slice.
  pub fn split<'a>(
    &mut self,
    event_index: usize,
    module_index: usize,
    words: &'a [u32],
    mut emit: impl FnMut(&'a [u32]),
  ) {
    let filter: Option<&DataFilter> = self
      .config
      .filters
      .get(event_index)
      .and_then(|modules| modules.get(module_index))
      .and_then(Option::as_ref);

    let Some(filter) = filter else {
      emit(words);
      return;
    };

    let mut position: usize = 0;
    while position < words.len() {
      if !filter.matches(words[position]) {
        // A gap before the next header.
        self.counters.size_exceeded_words += 1;
        position += 1;
        continue;
      }
      let length: usize = filter.extract_size(words[position]) as usize;
      let end: usize = position + 1 + length;
      if end > words.len() {
        match self.config.oversized_policy {
          OversizedModulePolicy::SkipToNextHeader => {
            self.counters.size_exceeded_words += 1;
            position += 1;
          }
          OversizedModulePolicy::AbortEvent => {
            self.counters.size_exceeded_words += (words.len() - position) as u64;
            self.counters.events_aborted += 1;
            return;
          }
        }
        continue;
      }
      emit(&words[position..end]);
      self.counters.slices_emitted += 1;
      position = end;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// 0xFF in the top byte marks a header; the length sits in bits 16..=23.
  fn header_filter() -> DataFilter {
    DataFilter::compile("1111 1111 SSSS SSSS XXXX XXXX XXXX XXXX").unwrap()
  }

  fn splitter_for(filter: Option<DataFilter>) -> MultiEventSplitter {
    MultiEventSplitter::new(SplitterConfig {
      filters: vec![vec![filter]],
      oversized_policy: OversizedModulePolicy::default(),
    })
  }

  fn header(length: u32) -> u32 {
    0xFF00_0000 | (length << 16)
  }

  #[test]
  fn packed_events_split_into_slices() {
    // [hdr len=3, d, d, d, hdr len=2, d, d]
    let words: Vec<u32> = vec![header(3), 1, 2, 3, header(2), 4, 5];
    let mut splitter: MultiEventSplitter = splitter_for(Some(header_filter()));

    let mut slices: Vec<Vec<u32>> = vec![];
    splitter.split(0, 0, &words, |slice| slices.push(slice.to_vec()));

    assert_eq!(slices.len(), 2);
    assert_eq!(slices[0].len(), 4);
    assert_eq!(slices[1].len(), 3);
    assert_eq!(slices[0], vec![header(3), 1, 2, 3]);
    assert_eq!(slices[1], vec![header(2), 4, 5]);
    assert_eq!(splitter.counters().size_exceeded_words, 0);
  }

  #[test]
  fn slice_words_plus_exceeded_equals_input() {
    // A trailing header whose length runs past the range.
    let words: Vec<u32> = vec![header(2), 1, 2, header(9), 3, 4];
    let mut splitter: MultiEventSplitter = splitter_for(Some(header_filter()));

    let mut slice_words: u64 = 0;
    splitter.split(0, 0, &words, |slice| slice_words += slice.len() as u64);

    let counters: SplitterCounters = splitter.counters();
    assert_eq!(slice_words + counters.size_exceeded_words, words.len() as u64);
    assert_eq!(counters.slices_emitted, 1);
  }

  #[test]
  fn abort_policy_discards_the_tail() {
    let words: Vec<u32> = vec![header(9), 1, 2];
    let mut splitter: MultiEventSplitter = MultiEventSplitter::new(SplitterConfig {
      filters: vec![vec![Some(header_filter())]],
      oversized_policy: OversizedModulePolicy::AbortEvent,
    });

    let mut emitted: usize = 0;
    splitter.split(0, 0, &words, |_| emitted += 1);
    assert_eq!(emitted, 0);
    assert_eq!(splitter.counters().size_exceeded_words, 3);
    assert_eq!(splitter.counters().events_aborted, 1);
  }

  #[test]
  fn disabled_module_passes_through() {
    let words: Vec<u32> = vec![1, 2, 3];
    let mut splitter: MultiEventSplitter = splitter_for(None);

    let mut slices: Vec<Vec<u32>> = vec![];
    splitter.split(0, 0, &words, |slice| slices.push(slice.to_vec()));
    assert_eq!(slices, vec![vec![1, 2, 3]]);
    assert!(!splitter.enabled_for_event(0));
  }
}

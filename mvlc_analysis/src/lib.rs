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

//! # MVLC ONLINE ANALYSIS
//!
//! Copyright © 2024 Nathaniel Hardesty, Licensed under the MIT License
//!
//! This software is created by a third-party and not endorsed or supported by
//! mesytec GmbH & Co. KG.
//!
//! ---------------------------------------------------------------------------
//!
//! Turns parsed readout events into physics: [Data Source]s extract named
//! parameter arrays from raw module words with bit-match [Filter]s, a
//! dataflow [Graph] of operators transforms them once per physics event,
//! and [Sink]s accumulate the results into histograms, rate monitors, and
//! export files.
//!
//! The [Stream Worker] owns the whole per-event path on a single thread
//! (snoop queue, readout parser, [Multi-Event Splitter], graph, and
//! [Consumer] fan-out), so graph evaluation needs no locks; sinks publish
//! brief-lock snapshots for readers on other threads. The [Event Server]
//! exposes extracted data to external TCP clients.
//!
//! [Filter]:               filter::DataFilter
//! [Data Source]:          graph::DataSource
//! [Graph]:                graph::AnalysisGraph
//! [Sink]:                 sinks::SinkState
//! [Multi-Event Splitter]: splitter::MultiEventSplitter
//! [Stream Worker]:        worker::StreamWorker
//! [Consumer]:             consumers::ModuleConsumer
//! [Event Server]:         server::EventServer

pub mod config;
pub mod consumers;
pub mod filter;
pub mod graph;
pub mod server;
pub mod sinks;
pub mod splitter;
pub mod util;
pub mod worker;

/// ## PIPE
///
/// The value array flowing between analysis nodes: a fixed-size array of
/// parameters, each with static lower/upper limits, plus a validity bitmap
/// kept separate from the values so no bit pattern of the data itself is
/// reserved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipe {
  /// ### VALUES
  pub values: Vec<f64>,

  /// ### VALIDITY
  pub valid: Vec<bool>,

  /// ### LOWER LIMITS
  pub lower_limits: Vec<f64>,

  /// ### UPPER LIMITS
  pub upper_limits: Vec<f64>,
}

impl Pipe {
  /// ### NEW PIPE
  ///
  /// All elements share the given limits and start invalid.
  pub fn new(size: usize, lower: f64, upper: f64) -> Self {
    Pipe {
      values: vec![0.0; size],
      valid: vec![false; size],
      lower_limits: vec![lower; size],
      upper_limits: vec![upper; size],
    }
  }

  /// ### LENGTH
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// ### IS EMPTY
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// ### INVALIDATE ALL
  ///
  /// Run at the start of every event; parameters only become valid again
  /// by extraction or computation.
  pub fn invalidate_all(&mut self) {
    self.valid.fill(false);
  }

  /// ### SET
  pub fn set(&mut self, index: usize, value: f64) {
    self.values[index] = value;
    self.valid[index] = true;
  }

  /// ### GET
  ///
  /// The value if the element is valid.
  pub fn get(&self, index: usize) -> Option<f64> {
    if *self.valid.get(index)? {
      Some(self.values[index])
    } else {
      None
    }
  }
}

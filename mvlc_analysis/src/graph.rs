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

//! # ANALYSIS GRAPH
//!
//! A directed acyclic dataflow graph evaluated once per physics event:
//! [Data Source]s extract parameter arrays from raw module words,
//! [Operator]s transform pipes, [Sink]s accumulate. Nodes are owned by the
//! graph; edges are (node, element) tuples stored on the consuming side,
//! and the condition-gating relation is a map owned by the graph rather
//! than back-pointers on operators.
//!
//! ---------------------------------------------------------------------------
//!
//! Building the graph assigns every operator a topological rank and
//! rejects cycles, mismatched slot sizes (single-element selections
//! excepted), and gates whose condition does not strictly precede the
//! gated operator. Evaluation then walks the per-event schedules in rank
//! order with no further lookups.
//!
//! Validity is propagated, never signaled through sentinel values:
//! arithmetic on an invalid input yields an invalid output, histograms
//! ignore invalid inputs, rate monitors treat them as no-event.
//!
//! [Data Source]: DataSource
//! [Operator]:    OperatorKind
//! [Sink]:        SinkKind

use crate::filter::DataFilter;
use crate::sinks::{ExportFormat, ExportSink, Histo1D, Histo2D, RateMonitor};
use crate::Pipe;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// ## NODE REFERENCE
///
/// The producing side of an edge.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeRef {
  /// ### SOURCE
  Source(usize),

  /// ### OPERATOR
  Operator(usize),
}

/// ## SLOT
///
/// The consuming side of an edge: which output it reads and, optionally, a
/// single selected element.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Slot {
  /// ### UPSTREAM NODE
  pub from: NodeRef,

  /// ### ELEMENT SELECTION
  ///
  /// [Some] narrows the connection to one element, making the slot size 1
  /// regardless of the upstream array size.
  pub element: Option<usize>,
}

impl Slot {
  /// ### WHOLE ARRAY
  pub fn array(from: NodeRef) -> Self {
    Slot { from, element: None }
  }

  /// ### SINGLE ELEMENT
  pub fn element(from: NodeRef, element: usize) -> Self {
    Slot { from, element: Some(element) }
  }
}

/// ## DATA SOURCE
///
/// Extracts one parameter array from one module's raw words: every word
/// matching the filter assigns its data field value (plus a uniform random
/// fractional offset for de-aliasing during histogramming) at its address
/// field index.
#[derive(Clone, Debug)]
pub struct DataSource {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### MODULE INDEX
  pub module_index: usize,

  /// ### FILTER
  pub filter: DataFilter,
}

/// ## ARITHMETIC OP
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArithmeticOp {
  /// ### ADD
  Add,

  /// ### SUBTRACT
  Subtract,

  /// ### MULTIPLY
  Multiply,

  /// ### DIVIDE
  Divide,
}

/// ## OPERATOR KIND
///
/// The pure function an operator applies to its input pipes.
#[derive(Clone, Debug)]
pub enum OperatorKind {
  /// ### CALIBRATION
  ///
  /// `out = in * factor + offset`, with the output limits set to
  /// `[unit_min, unit_max)`.
  Calibration { factor: f64, offset: f64, unit_min: f64, unit_max: f64 },

  /// ### INDEX REMAP
  ///
  /// `out[i] = in[mapping[i]]`; unmapped outputs stay invalid. Used to
  /// reorder detector channels into histogram order.
  IndexRemap { mapping: Vec<Option<usize>> },

  /// ### DIFFERENCE
  ///
  /// `out = inputs[0] - inputs[1]`, elementwise.
  Difference,

  /// ### SUM
  ///
  /// Scalar sum of the valid elements; invalid when none are.
  Sum,

  /// ### ARITHMETIC
  ///
  /// Elementwise binary expression over two inputs.
  Arithmetic { op: ArithmeticOp },

  /// ### RANGE SELECTOR
  ///
  /// The sub-array `in[begin..end]`.
  RangeSelector { begin: usize, end: usize },

  /// ### WINDOW FILTER
  ///
  /// Passes elements inside `[min, max)`, invalidates the rest.
  WindowFilter { min: f64, max: f64 },

  /// ### CONDITION
  ///
  /// Produces one bit per event: true when any valid input element lies
  /// inside `[min, max)`. The bit is latched for the event and gates other
  /// operators through the graph's condition map.
  Condition { min: f64, max: f64 },
}

impl OperatorKind {
  /// ### ARITY
  pub fn arity(&self) -> usize {
    match self {
      OperatorKind::Difference | OperatorKind::Arithmetic { .. } => 2,
      _ => 1,
    }
  }
}

/// ## OPERATOR DEF
#[derive(Clone, Debug)]
pub struct OperatorDef {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### KIND
  pub kind: OperatorKind,

  /// ### INPUTS
  ///
  /// Fewer entries than the kind's arity leaves the operator unbound; an
  /// unbound operator is skipped, not an error.
  pub inputs: Vec<Slot>,
}

/// ## SINK KIND
#[derive(Clone, Debug)]
pub enum SinkKind {
  /// ### HISTO 1D
  ///
  /// One histogram per input element, binned over the input's limits.
  Histo1D { bins: usize },

  /// ### HISTO 2D
  ///
  /// `inputs[0]` is x, `inputs[1]` is y; both are single values per event.
  Histo2D { x_bins: usize, y_bins: usize },

  /// ### RATE MONITOR
  RateMonitor { capacity: usize },

  /// ### EXPORT
  Export { path: PathBuf, format: ExportFormat },
}

/// ## SINK DEF
#[derive(Clone, Debug)]
pub struct SinkDef {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### INPUTS
  pub inputs: Vec<Slot>,

  /// ### KIND
  pub kind: SinkKind,
}

/// ## ANALYSIS GRAPH
///
/// The declarative graph; [Analysis Runtime] compiles it into an
/// executable form.
///
/// [Analysis Runtime]: AnalysisRuntime
#[derive(Clone, Debug, Default)]
pub struct AnalysisGraph {
  /// ### SOURCES
  pub sources: Vec<DataSource>,

  /// ### OPERATORS
  pub operators: Vec<OperatorDef>,

  /// ### SINKS
  pub sinks: Vec<SinkDef>,

  /// ### CONDITION LINKS
  ///
  /// Gated operator index → condition operator index.
  pub condition_links: BTreeMap<usize, usize>,
}

/// ## GRAPH ERROR
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GraphError {
  /// ### CYCLE
  #[error("the analysis graph contains a cycle through operator '{0}'")]
  Cycle(String),

  /// ### SLOT SIZE MISMATCH
  #[error("operator '{operator}' input sizes differ: {a} vs {b}")]
  SlotSizeMismatch { operator: String, a: usize, b: usize },

  /// ### BAD SELECTION
  #[error("'{node}' selects element {element} of a {size}-element pipe")]
  BadSelection { node: String, element: usize, size: usize },

  /// ### BAD RANGE
  #[error("operator '{operator}' selects range {begin}..{end} of a {size}-element pipe")]
  BadRange { operator: String, begin: usize, end: usize, size: usize },

  /// ### NOT A CONDITION
  #[error("operator '{0}' is gated by a non-condition operator")]
  NotACondition(String),

  /// ### CONDITION RANK
  ///
  /// A condition must evaluate strictly before the operator it gates.
  #[error("condition of operator '{0}' does not precede it")]
  ConditionRank(String),

  /// ### DANGLING REFERENCE
  #[error("'{node}' references a node that does not exist")]
  DanglingReference { node: String },
}

/// ## SINK STATE
///
/// The accumulated contents of one sink, behind the lock readers share.
#[derive(Debug)]
pub enum SinkState {
  /// ### HISTO 1D
  Histo1D(Vec<Histo1D>),

  /// ### HISTO 2D
  Histo2D(Histo2D),

  /// ### RATE MONITOR
  RateMonitor(RateMonitor),

  /// ### EXPORT
  Export(ExportSink),
}

/// ## ANALYSIS RUNTIME
///
/// The executable graph: ranked schedules, allocated pipes, and sink
/// state. Owned and driven by a single thread; sink state is shared.
pub struct AnalysisRuntime {
  graph: AnalysisGraph,
  source_pipes: Vec<Pipe>,
  operator_pipes: Vec<Pipe>,
  operator_enabled: Vec<bool>,
  condition_bits: Vec<bool>,
  sources_by_module: HashMap<(usize, usize), Vec<usize>>,
  operators_by_event: Vec<Vec<usize>>,
  sinks_by_event: Vec<Vec<usize>>,
  sink_states: Vec<Arc<Mutex<SinkState>>>,
  rng: StdRng,
}

impl AnalysisRuntime {
  /// ### BUILD
  ///
  /// Ranks and validates the graph and allocates all per-run state. The
  /// random seed drives the de-aliasing offsets; fixing it makes replays
  /// reproduce live results bit for bit.
  pub fn build(graph: AnalysisGraph, seed: u64) -> Result<Self, GraphError> {
    let ranks: Vec<usize> = rank_operators(&graph)?;

    // Source pipes: size and limits derive from the filter.
    let source_pipes: Vec<Pipe> = graph
      .sources
      .iter()
      .map(|source| {
        let upper: f64 = (1u64 << source.filter.data_bits().min(63)) as f64;
        Pipe::new(source.filter.address_count(), 0.0, upper)
      })
      .collect();

    // Operator pipes in dependency order, so each operator can read the
    // sizes of already-allocated upstreams.
    let mut order: Vec<usize> = (0..graph.operators.len()).collect();
    order.sort_by_key(|&op| ranks[op]);

    let mut operator_pipes: Vec<Pipe> = vec![Pipe::default(); graph.operators.len()];
    let mut operator_enabled: Vec<bool> = vec![false; graph.operators.len()];
    for &op_index in &order {
      let operator: &OperatorDef = &graph.operators[op_index];
      if operator.inputs.len() < operator.kind.arity() {
        // Unbound inputs: the operator is skipped.
        continue;
      }
      let sizes: Vec<usize> = operator
        .inputs
        .iter()
        .map(|slot| slot_size(&graph, &source_pipes, &operator_pipes, slot, &operator.name))
        .collect::<Result<_, _>>()?;
      let input_limits = |slot: &Slot| -> (f64, f64) {
        upstream_limits(&source_pipes, &operator_pipes, slot)
      };

      let pipe: Pipe = match &operator.kind {
        OperatorKind::Calibration { unit_min, unit_max, .. } => Pipe::new(sizes[0], *unit_min, *unit_max),
        OperatorKind::IndexRemap { mapping } => {
          let (lower, upper) = input_limits(&operator.inputs[0]);
          Pipe::new(mapping.len(), lower, upper)
        }
        OperatorKind::Difference | OperatorKind::Arithmetic { .. } => {
          if sizes[0] != sizes[1] {
            return Err(GraphError::SlotSizeMismatch {
              operator: operator.name.clone(),
              a: sizes[0],
              b: sizes[1],
            });
          }
          let (lower, upper) = input_limits(&operator.inputs[0]);
          Pipe::new(sizes[0], -upper, upper.max(lower.abs()) * 2.0)
        }
        OperatorKind::Sum => {
          let (_, upper) = input_limits(&operator.inputs[0]);
          Pipe::new(1, 0.0, upper * sizes[0] as f64)
        }
        OperatorKind::RangeSelector { begin, end } => {
          if *end > sizes[0] || begin > end {
            return Err(GraphError::BadRange {
              operator: operator.name.clone(),
              begin: *begin,
              end: *end,
              size: sizes[0],
            });
          }
          let (lower, upper) = input_limits(&operator.inputs[0]);
          Pipe::new(end - begin, lower, upper)
        }
        OperatorKind::WindowFilter { .. } => {
          let (lower, upper) = input_limits(&operator.inputs[0]);
          Pipe::new(sizes[0], lower, upper)
        }
        OperatorKind::Condition { .. } => Pipe::new(1, 0.0, 1.0),
      };
      operator_pipes[op_index] = pipe;
      operator_enabled[op_index] = true;
    }

    // Condition links: target must be a condition and strictly precede
    // the gated operator.
    for (&gated, &condition) in &graph.condition_links {
      let gated_name: String = graph.operators[gated].name.clone();
      match graph.operators.get(condition).map(|op| &op.kind) {
        Some(OperatorKind::Condition { .. }) => {}
        Some(_) => return Err(GraphError::NotACondition(gated_name)),
        None => return Err(GraphError::DanglingReference { node: gated_name }),
      }
      if ranks[condition] >= ranks[gated] {
        return Err(GraphError::ConditionRank(gated_name));
      }
    }

    // Per-event schedules.
    let event_count: usize = graph
      .sources
      .iter()
      .map(|s| s.event_index + 1)
      .chain(graph.operators.iter().map(|o| o.event_index + 1))
      .chain(graph.sinks.iter().map(|s| s.event_index + 1))
      .max()
      .unwrap_or(0);

    let mut sources_by_module: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for (index, source) in graph.sources.iter().enumerate() {
      sources_by_module
        .entry((source.event_index, source.module_index))
        .or_default()
        .push(index);
    }

    let mut operators_by_event: Vec<Vec<usize>> = vec![vec![]; event_count];
    for &op_index in &order {
      operators_by_event[graph.operators[op_index].event_index].push(op_index);
    }
    let mut sinks_by_event: Vec<Vec<usize>> = vec![vec![]; event_count];
    for (index, sink) in graph.sinks.iter().enumerate() {
      sinks_by_event[sink.event_index].push(index);
    }

    let sink_states: Vec<Arc<Mutex<SinkState>>> = graph
      .sinks
      .iter()
      .map(|sink| {
        let state: SinkState = match &sink.kind {
          SinkKind::Histo1D { bins } => {
            let size: usize = sink
              .inputs
              .first()
              .map(|slot| slot_size(&graph, &source_pipes, &operator_pipes, slot, &sink.name).unwrap_or(0))
              .unwrap_or(0);
            let (lower, upper) = sink
              .inputs
              .first()
              .map(|slot| upstream_limits(&source_pipes, &operator_pipes, slot))
              .unwrap_or((0.0, 1.0));
            SinkState::Histo1D((0..size).map(|_| Histo1D::new(*bins, lower, upper)).collect())
          }
          SinkKind::Histo2D { x_bins, y_bins } => {
            let limits = |slot: Option<&Slot>| {
              slot
                .map(|slot| upstream_limits(&source_pipes, &operator_pipes, slot))
                .unwrap_or((0.0, 1.0))
            };
            let (x_min, x_max) = limits(sink.inputs.first());
            let (y_min, y_max) = limits(sink.inputs.get(1));
            SinkState::Histo2D(Histo2D::new(*x_bins, x_min, x_max, *y_bins, y_min, y_max))
          }
          SinkKind::RateMonitor { capacity } => SinkState::RateMonitor(RateMonitor::new(*capacity)),
          SinkKind::Export { path, format } => SinkState::Export(ExportSink::new(path.clone(), *format)),
        };
        Arc::new(Mutex::new(state))
      })
      .collect();

    let condition_count: usize = graph.operators.len();
    Ok(AnalysisRuntime {
      graph,
      source_pipes,
      operator_pipes,
      operator_enabled,
      condition_bits: vec![false; condition_count],
      sources_by_module,
      operators_by_event,
      sinks_by_event,
      sink_states,
      rng: StdRng::seed_from_u64(seed),
    })
  }

  /// ### EVENT COUNT
  pub fn event_count(&self) -> usize {
    self.operators_by_event.len()
  }

  /// ### GRAPH
  pub fn graph(&self) -> &AnalysisGraph {
    &self.graph
  }

  /// ### SINK STATE
  pub fn sink_state(&self, index: usize) -> Arc<Mutex<SinkState>> {
    self.sink_states[index].clone()
  }

  /// ### BEGIN RUN
  ///
  /// Zeroes per-run sink state and opens export files. `keep_state` skips
  /// the zeroing, for accumulating across replays.
  pub fn begin_run(&mut self, keep_state: bool) {
    for state in &self.sink_states {
      let mut state = state.lock().expect("sink mutex");
      match &mut *state {
        SinkState::Histo1D(histos) if !keep_state => histos.iter_mut().for_each(Histo1D::clear),
        SinkState::Histo2D(histo) if !keep_state => histo.clear(),
        SinkState::RateMonitor(monitor) if !keep_state => monitor.clear(),
        SinkState::Export(export) => {
          if let Err(error) = export.open() {
            tracing::warn!(%error, path = %export.path.display(), "cannot open export sink");
          }
        }
        _ => {}
      }
    }
  }

  /// ### END RUN
  pub fn end_run(&mut self) {
    for state in &self.sink_states {
      if let SinkState::Export(export) = &mut *state.lock().expect("sink mutex") {
        if let Err(error) = export.close() {
          tracing::warn!(%error, "closing export sink");
        }
      }
    }
  }

  /// ### BEGIN EVENT
  pub fn begin_event(&mut self, event_index: usize) {
    for (key, source_indices) in &self.sources_by_module {
      if key.0 == event_index {
        for &index in source_indices {
          self.source_pipes[index].invalidate_all();
        }
      }
    }
    for op_indices in self.operators_by_event.get(event_index) {
      for &op_index in op_indices.iter() {
        self.operator_pipes[op_index].invalidate_all();
      }
    }
  }

  /// ### PROCESS MODULE DATA
  ///
  /// Runs the bit-match extractors of every source bound to this module.
  pub fn process_module_data(&mut self, event_index: usize, module_index: usize, words: &[u32]) {
    let Some(source_indices) = self.sources_by_module.get(&(event_index, module_index)) else {
      return;
    };
    for &source_index in source_indices {
      let filter: DataFilter = self.graph.sources[source_index].filter;
      let pipe: &mut Pipe = &mut self.source_pipes[source_index];
      for &word in words {
        if filter.matches(word) {
          let address: usize = filter.extract_address(word) as usize;
          let value: f64 = filter.extract_data(word) as f64 + self.rng.gen::<f64>();
          if address < pipe.len() {
            pipe.set(address, value);
          }
        }
      }
    }
  }

  /// ### END EVENT
  ///
  /// Evaluates the event's operators in rank order, then its sinks.
  pub fn end_event(&mut self, event_index: usize) {
    let Some(op_indices) = self.operators_by_event.get(event_index).cloned() else {
      return;
    };
    for op_index in op_indices {
      self.eval_operator(op_index);
    }
    let Some(sink_indices) = self.sinks_by_event.get(event_index).cloned() else {
      return;
    };
    for sink_index in sink_indices {
      self.eval_sink(sink_index);
    }
  }

  fn eval_operator(&mut self, op_index: usize) {
    if !self.operator_enabled[op_index] {
      return;
    }
    // A gated operator reads its condition's latched bit and skips when
    // false; its outputs stay invalid for the event.
    if let Some(&condition) = self.graph.condition_links.get(&op_index) {
      if !self.condition_bits[condition] {
        return;
      }
    }

    let mut out: Pipe = std::mem::take(&mut self.operator_pipes[op_index]);
    out.invalidate_all();
    let mut latched_bit: Option<bool> = None;
    let operator: &OperatorDef = &self.graph.operators[op_index];

    match &operator.kind {
      OperatorKind::Calibration { factor, offset, .. } => {
        for i in 0..out.len() {
          if let Some(value) = self.read_slot(&operator.inputs[0], i) {
            out.set(i, value * factor + offset);
          }
        }
      }
      OperatorKind::IndexRemap { mapping } => {
        for (i, mapped) in mapping.iter().enumerate() {
          if let Some(source_index) = mapped {
            if let Some(value) = self.read_slot(&operator.inputs[0], *source_index) {
              out.set(i, value);
            }
          }
        }
      }
      OperatorKind::Difference => {
        for i in 0..out.len() {
          if let (Some(a), Some(b)) = (self.read_slot(&operator.inputs[0], i), self.read_slot(&operator.inputs[1], i)) {
            out.set(i, a - b);
          }
        }
      }
      OperatorKind::Sum => {
        let size: usize = self.slot_len(&operator.inputs[0]);
        let mut sum: f64 = 0.0;
        let mut any: bool = false;
        for i in 0..size {
          if let Some(value) = self.read_slot(&operator.inputs[0], i) {
            sum += value;
            any = true;
          }
        }
        if any {
          out.set(0, sum);
        }
      }
      OperatorKind::Arithmetic { op } => {
        for i in 0..out.len() {
          if let (Some(a), Some(b)) = (self.read_slot(&operator.inputs[0], i), self.read_slot(&operator.inputs[1], i)) {
            let value: f64 = match op {
              ArithmeticOp::Add => a + b,
              ArithmeticOp::Subtract => a - b,
              ArithmeticOp::Multiply => a * b,
              ArithmeticOp::Divide => a / b,
            };
            if value.is_finite() {
              out.set(i, value);
            }
          }
        }
      }
      OperatorKind::RangeSelector { begin, .. } => {
        for i in 0..out.len() {
          if let Some(value) = self.read_slot(&operator.inputs[0], begin + i) {
            out.set(i, value);
          }
        }
      }
      OperatorKind::WindowFilter { min, max } => {
        for i in 0..out.len() {
          if let Some(value) = self.read_slot(&operator.inputs[0], i) {
            if *min <= value && value < *max {
              out.set(i, value);
            }
          }
        }
      }
      OperatorKind::Condition { min, max } => {
        let size: usize = self.slot_len(&operator.inputs[0]);
        let mut bit: bool = false;
        for i in 0..size {
          if let Some(value) = self.read_slot(&operator.inputs[0], i) {
            if *min <= value && value < *max {
              bit = true;
              break;
            }
          }
        }
        latched_bit = Some(bit);
        out.set(0, bit as usize as f64);
      }
    }

    self.operator_pipes[op_index] = out;
    if let Some(bit) = latched_bit {
      self.condition_bits[op_index] = bit;
    }
  }

  fn eval_sink(&mut self, sink_index: usize) {
    let sink: &SinkDef = &self.graph.sinks[sink_index];
    let state: Arc<Mutex<SinkState>> = self.sink_states[sink_index].clone();
    let mut state = state.lock().expect("sink mutex");

    match (&mut *state, &sink.kind) {
      (SinkState::Histo1D(histos), SinkKind::Histo1D { .. }) => {
        let Some(slot) = sink.inputs.first() else { return };
        for (i, histo) in histos.iter_mut().enumerate() {
          if let Some(value) = self.read_slot(slot, i) {
            histo.fill(value);
          }
        }
      }
      (SinkState::Histo2D(histo), SinkKind::Histo2D { .. }) => {
        let (Some(x_slot), Some(y_slot)) = (sink.inputs.first(), sink.inputs.get(1)) else {
          return;
        };
        if let (Some(x), Some(y)) = (self.read_slot(x_slot, 0), self.read_slot(y_slot, 0)) {
          histo.fill(x, y);
        }
      }
      (SinkState::RateMonitor(monitor), SinkKind::RateMonitor { .. }) => {
        let Some(slot) = sink.inputs.first() else { return };
        let size: usize = self.slot_len(slot);
        if (0..size).any(|i| self.read_slot(slot, i).is_some()) {
          monitor.count();
        }
      }
      (SinkState::Export(export), SinkKind::Export { .. }) => {
        let Some(slot) = sink.inputs.first() else { return };
        let pipe: &Pipe = self.upstream_pipe(slot);
        if let Err(error) = export.write_record(&pipe.values, &pipe.valid) {
          tracing::warn!(%error, "export sink write failed");
        }
      }
      _ => {}
    }
  }

  /// ### SAMPLE RATES
  ///
  /// Converts accumulated rate-monitor counts into samples; call on a
  /// timer (conventionally once per timetick).
  pub fn sample_rates(&mut self) {
    for state in &self.sink_states {
      if let SinkState::RateMonitor(monitor) = &mut *state.lock().expect("sink mutex") {
        monitor.sample();
      }
    }
  }

  fn upstream_pipe(&self, slot: &Slot) -> &Pipe {
    match slot.from {
      NodeRef::Source(index) => &self.source_pipes[index],
      NodeRef::Operator(index) => &self.operator_pipes[index],
    }
  }

  /// The effective size of a slot (1 under element selection).
  fn slot_len(&self, slot: &Slot) -> usize {
    match slot.element {
      Some(_) => 1,
      None => self.upstream_pipe(slot).len(),
    }
  }

  /// Reads element `i` of a slot; element selection redirects every read
  /// to the selected element.
  fn read_slot(&self, slot: &Slot, i: usize) -> Option<f64> {
    let pipe: &Pipe = self.upstream_pipe(slot);
    match slot.element {
      Some(element) => pipe.get(element),
      None => pipe.get(i),
    }
  }
}

/// Kahn toposort over operator-to-operator edges. Sources have no
/// dependencies and need no ranking.
fn rank_operators(graph: &AnalysisGraph) -> Result<Vec<usize>, GraphError> {
  let count: usize = graph.operators.len();
  let mut dependents: Vec<Vec<usize>> = vec![vec![]; count];
  let mut in_degree: Vec<usize> = vec![0; count];

  let mut add_edge = |from: usize, to: usize, in_degree: &mut Vec<usize>, dependents: &mut Vec<Vec<usize>>| {
    dependents[from].push(to);
    in_degree[to] += 1;
  };

  for (op_index, operator) in graph.operators.iter().enumerate() {
    for slot in &operator.inputs {
      match slot.from {
        NodeRef::Operator(upstream) if upstream < count => {
          add_edge(upstream, op_index, &mut in_degree, &mut dependents);
        }
        NodeRef::Operator(_) => {
          return Err(GraphError::DanglingReference { node: operator.name.clone() });
        }
        NodeRef::Source(source) if source >= graph.sources.len() => {
          return Err(GraphError::DanglingReference { node: operator.name.clone() });
        }
        NodeRef::Source(_) => {}
      }
    }
  }
  for (&gated, &condition) in &graph.condition_links {
    if gated >= count || condition >= count {
      return Err(GraphError::DanglingReference { node: format!("condition link {condition} -> {gated}") });
    }
    add_edge(condition, gated, &mut in_degree, &mut dependents);
  }

  let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
  let mut ranks: Vec<usize> = vec![0; count];
  let mut visited: usize = 0;
  while let Some(op_index) = queue.pop_front() {
    visited += 1;
    for &dependent in &dependents[op_index] {
      ranks[dependent] = ranks[dependent].max(ranks[op_index] + 1);
      in_degree[dependent] -= 1;
      if in_degree[dependent] == 0 {
        queue.push_back(dependent);
      }
    }
  }
  if visited != count {
    let stuck: &OperatorDef = graph
      .operators
      .iter()
      .enumerate()
      .find(|(i, _)| in_degree[*i] > 0)
      .map(|(_, op)| op)
      .expect("a cycle leaves positive in-degrees");
    return Err(GraphError::Cycle(stuck.name.clone()));
  }
  Ok(ranks)
}

fn slot_size(
  graph: &AnalysisGraph,
  source_pipes: &[Pipe],
  operator_pipes: &[Pipe],
  slot: &Slot,
  consumer: &str,
) -> Result<usize, GraphError> {
  let upstream_len: usize = match slot.from {
    NodeRef::Source(index) => source_pipes
      .get(index)
      .map(Pipe::len)
      .ok_or(GraphError::DanglingReference { node: consumer.to_string() })?,
    NodeRef::Operator(index) => {
      if index >= graph.operators.len() {
        return Err(GraphError::DanglingReference { node: consumer.to_string() });
      }
      operator_pipes[index].len()
    }
  };
  match slot.element {
    Some(element) if element >= upstream_len => Err(GraphError::BadSelection {
      node: consumer.to_string(),
      element,
      size: upstream_len,
    }),
    Some(_) => Ok(1),
    None => Ok(upstream_len),
  }
}

fn upstream_limits(source_pipes: &[Pipe], operator_pipes: &[Pipe], slot: &Slot) -> (f64, f64) {
  let pipe: &Pipe = match slot.from {
    NodeRef::Source(index) => &source_pipes[index],
    NodeRef::Operator(index) => &operator_pipes[index],
  };
  let lower: f64 = pipe.lower_limits.first().copied().unwrap_or(0.0);
  let upper: f64 = pipe.upper_limits.first().copied().unwrap_or(1.0);
  (lower, upper)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn amplitude_filter() -> DataFilter {
    // 16 channels, 13 data bits.
    DataFilter::compile("0001 XXXX XXXX AAAA XXXD DDDD DDDD DDDD").unwrap()
  }

  fn one_source_graph() -> AnalysisGraph {
    AnalysisGraph {
      sources: vec![DataSource {
        name: "madc32.amplitude".to_string(),
        event_index: 0,
        module_index: 0,
        filter: amplitude_filter(),
      }],
      ..Default::default()
    }
  }

  fn data_word(channel: u32, value: u32) -> u32 {
    0x1000_0000 | (channel << 16) | (value & 0x1FFF)
  }

  #[test]
  fn source_extracts_and_histograms() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.sinks.push(SinkDef {
      name: "raw histos".to_string(),
      event_index: 0,
      inputs: vec![Slot::array(NodeRef::Source(0))],
      kind: SinkKind::Histo1D { bins: 16 },
    });

    let mut runtime: AnalysisRuntime = AnalysisRuntime::build(graph, 1).unwrap();
    runtime.begin_run(false);
    runtime.begin_event(0);
    runtime.process_module_data(0, 0, &[data_word(3, 1000), data_word(7, 8000), 0xFFFF_FFFF]);
    runtime.end_event(0);

    let state = runtime.sink_state(0);
    let state = state.lock().unwrap();
    let SinkState::Histo1D(histos) = &*state else { panic!("wrong sink state") };
    assert_eq!(histos.len(), 16);
    assert_eq!(histos[3].entry_count, 1);
    assert_eq!(histos[7].entry_count, 1);
    assert_eq!(histos[0].entry_count, 0);
  }

  #[test]
  fn identical_input_and_seed_reproduce_sink_state() {
    let run = |seed: u64| -> Vec<f64> {
      let mut graph: AnalysisGraph = one_source_graph();
      graph.sinks.push(SinkDef {
        name: "h".to_string(),
        event_index: 0,
        inputs: vec![Slot::array(NodeRef::Source(0))],
        kind: SinkKind::Histo1D { bins: 128 },
      });
      let mut runtime: AnalysisRuntime = AnalysisRuntime::build(graph, seed).unwrap();
      runtime.begin_run(false);
      for event in 0..50u32 {
        runtime.begin_event(0);
        runtime.process_module_data(0, 0, &[data_word(3, 100 + event), data_word(5, 200)]);
        runtime.end_event(0);
      }
      let state = runtime.sink_state(0);
      let state = state.lock().unwrap();
      let SinkState::Histo1D(histos) = &*state else { panic!() };
      histos.iter().flat_map(|h| h.bins.clone()).collect()
    };

    assert_eq!(run(7), run(7));
  }

  #[test]
  fn calibration_feeds_downstream() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.operators.push(OperatorDef {
      name: "cal".to_string(),
      event_index: 0,
      kind: OperatorKind::Calibration { factor: 2.0, offset: 10.0, unit_min: 0.0, unit_max: 20000.0 },
      inputs: vec![Slot::array(NodeRef::Source(0))],
    });
    graph.sinks.push(SinkDef {
      name: "cal histos".to_string(),
      event_index: 0,
      inputs: vec![Slot::array(NodeRef::Operator(0))],
      kind: SinkKind::Histo1D { bins: 10 },
    });

    let mut runtime: AnalysisRuntime = AnalysisRuntime::build(graph, 0).unwrap();
    runtime.begin_run(false);
    runtime.begin_event(0);
    runtime.process_module_data(0, 0, &[data_word(0, 1000)]);
    runtime.end_event(0);

    let state = runtime.sink_state(0);
    let state = state.lock().unwrap();
    let SinkState::Histo1D(histos) = &*state else { panic!() };
    // 1000 * 2 + 10 lands in bin 1 of [0, 20000) over 10 bins.
    assert_eq!(histos[0].entry_count, 1);
    assert_eq!(histos[0].bins[1], 1.0);
  }

  #[test]
  fn condition_gates_downstream_operator() {
    let mut graph: AnalysisGraph = one_source_graph();
    // Condition on channel 0: value in [0, 500).
    graph.operators.push(OperatorDef {
      name: "low_amplitude".to_string(),
      event_index: 0,
      kind: OperatorKind::Condition { min: 0.0, max: 500.0 },
      inputs: vec![Slot::element(NodeRef::Source(0), 0)],
    });
    graph.operators.push(OperatorDef {
      name: "gated_cal".to_string(),
      event_index: 0,
      kind: OperatorKind::Calibration { factor: 1.0, offset: 0.0, unit_min: 0.0, unit_max: 10000.0 },
      inputs: vec![Slot::array(NodeRef::Source(0))],
    });
    graph.condition_links.insert(1, 0);
    graph.sinks.push(SinkDef {
      name: "gated histos".to_string(),
      event_index: 0,
      inputs: vec![Slot::array(NodeRef::Operator(1))],
      kind: SinkKind::Histo1D { bins: 10 },
    });

    let mut runtime: AnalysisRuntime = AnalysisRuntime::build(graph, 0).unwrap();
    runtime.begin_run(false);

    // Passing event: channel 0 value below 500.
    runtime.begin_event(0);
    runtime.process_module_data(0, 0, &[data_word(0, 100)]);
    runtime.end_event(0);
    // Failing event: channel 0 value above 500; the gated operator is
    // skipped and nothing fills.
    runtime.begin_event(0);
    runtime.process_module_data(0, 0, &[data_word(0, 5000)]);
    runtime.end_event(0);

    let state = runtime.sink_state(0);
    let state = state.lock().unwrap();
    let SinkState::Histo1D(histos) = &*state else { panic!() };
    assert_eq!(histos[0].entry_count, 1);
  }

  #[test]
  fn invalidity_propagates_through_difference() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.operators.push(OperatorDef {
      name: "diff".to_string(),
      event_index: 0,
      kind: OperatorKind::Difference,
      inputs: vec![Slot::array(NodeRef::Source(0)), Slot::array(NodeRef::Source(0))],
    });
    graph.sinks.push(SinkDef {
      name: "diff histos".to_string(),
      event_index: 0,
      inputs: vec![Slot::array(NodeRef::Operator(0))],
      kind: SinkKind::Histo1D { bins: 10 },
    });

    let mut runtime: AnalysisRuntime = AnalysisRuntime::build(graph, 0).unwrap();
    runtime.begin_run(false);
    runtime.begin_event(0);
    // Only channel 2 is hit; all other difference elements stay invalid
    // and the histograms ignore them.
    runtime.process_module_data(0, 0, &[data_word(2, 50)]);
    runtime.end_event(0);

    let state = runtime.sink_state(0);
    let state = state.lock().unwrap();
    let SinkState::Histo1D(histos) = &*state else { panic!() };
    let total: u64 = histos.iter().map(|h| h.entry_count).sum();
    assert_eq!(total, 1);
  }

  #[test]
  fn cycles_are_rejected() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.operators.push(OperatorDef {
      name: "a".to_string(),
      event_index: 0,
      kind: OperatorKind::Calibration { factor: 1.0, offset: 0.0, unit_min: 0.0, unit_max: 1.0 },
      inputs: vec![Slot::array(NodeRef::Operator(1))],
    });
    graph.operators.push(OperatorDef {
      name: "b".to_string(),
      event_index: 0,
      kind: OperatorKind::Calibration { factor: 1.0, offset: 0.0, unit_min: 0.0, unit_max: 1.0 },
      inputs: vec![Slot::array(NodeRef::Operator(0))],
    });
    assert!(matches!(AnalysisRuntime::build(graph, 0), Err(GraphError::Cycle(_))));
  }

  #[test]
  fn mismatched_slot_sizes_are_rejected() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.operators.push(OperatorDef {
      name: "narrow".to_string(),
      event_index: 0,
      kind: OperatorKind::RangeSelector { begin: 0, end: 4 },
      inputs: vec![Slot::array(NodeRef::Source(0))],
    });
    graph.operators.push(OperatorDef {
      name: "bad diff".to_string(),
      event_index: 0,
      kind: OperatorKind::Difference,
      inputs: vec![Slot::array(NodeRef::Source(0)), Slot::array(NodeRef::Operator(0))],
    });
    assert!(matches!(
      AnalysisRuntime::build(graph, 0),
      Err(GraphError::SlotSizeMismatch { .. }),
    ));
  }

  #[test]
  fn element_selection_bypasses_size_checks() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.operators.push(OperatorDef {
      name: "scalar diff".to_string(),
      event_index: 0,
      kind: OperatorKind::Difference,
      inputs: vec![Slot::element(NodeRef::Source(0), 0), Slot::element(NodeRef::Source(0), 5)],
    });
    assert!(AnalysisRuntime::build(graph, 0).is_ok());
  }

  #[test]
  fn condition_must_precede_gated_operator() {
    let mut graph: AnalysisGraph = one_source_graph();
    graph.operators.push(OperatorDef {
      name: "cal".to_string(),
      event_index: 0,
      kind: OperatorKind::Calibration { factor: 1.0, offset: 0.0, unit_min: 0.0, unit_max: 1.0 },
      inputs: vec![Slot::array(NodeRef::Source(0))],
    });
    graph.operators.push(OperatorDef {
      name: "cond".to_string(),
      event_index: 0,
      kind: OperatorKind::Condition { min: 0.0, max: 1.0 },
      inputs: vec![Slot::array(NodeRef::Operator(0))],
    });
    // Gating the condition's own upstream is a rank violation.
    graph.condition_links.insert(0, 1);
    assert!(matches!(
      AnalysisRuntime::build(graph, 0),
      Err(GraphError::Cycle(_)) | Err(GraphError::ConditionRank(_)),
    ));
  }
}

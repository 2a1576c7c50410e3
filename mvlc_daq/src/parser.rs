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

//! # READOUT PARSER
//!
//! Converts the controller's framed output stream back into structured
//! per-event, per-module callbacks, maintaining its position across buffer
//! and packet boundaries.
//!
//! ---------------------------------------------------------------------------
//!
//! One parser instance serves one data stream. Within a stack frame the
//! parser walks the event's module list in the order fixed by the
//! [readout structure]: each module's fixed prefix, then the block read
//! frames of its dynamic part, then its fixed suffix. Whenever the input
//! buffer ends mid-walk the parser saves its position and resumes from it
//! with the next buffer, so downstream consumers never observe buffer
//! boundaries.
//!
//! Callbacks for an event fire only once the event has been assembled
//! completely. Packet loss or structural errors therefore never produce
//! partial events: the assembly is dropped, the exception is counted, and
//! the parser resynchronizes at the next recognizable frame header; for
//! Ethernet input, at the next-header offset carried by the packet headers.
//!
//! [readout structure]: crate::config::EventReadoutStructure

use crate::config::{EventReadoutStructure, ModuleReadoutStructure};
use crate::eth::{
  next_header_offset,
  packet_channel,
  packet_loss_between,
  packet_number,
  packet_word_count,
  NEXT_HEADER_NONE,
  PACKET_CHANNEL_COUNT,
  PACKET_HEADER_WORDS,
};
use mvlc_stack::frame::{
  extract_frame_info,
  extract_system_event_subtype,
  FrameFlags,
  FrameInfo,
  FrameType,
  SystemEventSubtype,
};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// ## MODULE DATA
///
/// The data of one module within one completed readout event, split into
/// the three parts of its readout structure. The dynamic part of a block
/// read spanning several block frames arrives here already concatenated.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleData<'a> {
  /// ### PREFIX
  pub prefix: &'a [u32],

  /// ### DYNAMIC
  pub dynamic: &'a [u32],

  /// ### SUFFIX
  pub suffix: &'a [u32],
}

impl ModuleData<'_> {
  /// ### HAS DATA
  pub fn has_data(&self) -> bool {
    !self.prefix.is_empty() || !self.dynamic.is_empty() || !self.suffix.is_empty()
  }

  /// ### TOTAL WORDS
  pub fn total_words(&self) -> usize {
    self.prefix.len() + self.dynamic.len() + self.suffix.len()
  }
}

/// ## PARSER CALLBACKS
///
/// The structured event stream produced by the parser. All methods have
/// empty defaults so consumers implement only what they need.
pub trait ParserCallbacks {
  /// ### BEGIN EVENT
  fn begin_event(&mut self, crate_id: u8, event_index: usize) {
    let _ = (crate_id, event_index);
  }

  /// ### MODULE DATA
  ///
  /// Called once per module that produced any data, in module order,
  /// between [begin event] and [end event].
  ///
  /// [begin event]: ParserCallbacks::begin_event
  /// [end event]:   ParserCallbacks::end_event
  fn module_data(&mut self, crate_id: u8, event_index: usize, module_index: usize, data: &ModuleData) {
    let _ = (crate_id, event_index, module_index, data);
  }

  /// ### END EVENT
  fn end_event(&mut self, crate_id: u8, event_index: usize) {
    let _ = (crate_id, event_index);
  }

  /// ### SYSTEM EVENT
  fn system_event(&mut self, crate_id: u8, subtype: SystemEventSubtype, words: &[u32]) {
    let _ = (crate_id, subtype, words);
  }
}

/// ## PARSE RESULT
///
/// The classified outcome of parser steps, counted per variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum ParseResult {
  /// ### OK
  ///
  /// A readout event was assembled and delivered.
  Ok = 0,

  /// ### NO HEADER PRESENT
  ///
  /// A word outside any frame did not parse as a frame header.
  NoHeaderPresent = 1,

  /// ### NOT A STACK FRAME
  ///
  /// A continuation frame appeared without an open stack frame.
  NotAStackFrame = 2,

  /// ### UNEXPECTED OPEN BLOCK FRAME
  ///
  /// A block read frame appeared at the top level.
  UnexpectedOpenBlockFrame = 3,

  /// ### MISSING CONTINUATION
  ///
  /// An open stack frame promised a continuation that never arrived.
  MissingContinuation = 4,

  /// ### UNEXPECTED FRAME TYPE
  ///
  /// A structurally valid but misplaced frame, skipped whole.
  UnexpectedFrameType = 5,

  /// ### STACK INDEX OUT OF RANGE
  ///
  /// A stack frame referenced a stack id with no configured event.
  StackIndexOutOfRange = 6,

  /// ### EVENT STRUCTURE MISMATCH
  ///
  /// The frame contents contradicted the event's readout structure.
  EventStructureMismatch = 7,
}

/// Number of [ParseResult] variants, sizing the counter array.
pub const PARSE_RESULT_COUNT: usize = 8;

/// ## PARSER COUNTERS
///
/// Every counter the parser maintains. A snapshot is published after each
/// buffer and is safe to read from any thread through [counters].
///
/// [counters]: ReadoutParser::counters
#[derive(Clone, Debug, Default)]
pub struct ParserCounters {
  /// ### BUFFERS PROCESSED
  pub buffers_processed: u64,

  /// ### BYTES PROCESSED
  pub bytes_processed: u64,

  /// ### UNUSED BYTES
  ///
  /// Bytes skipped while resynchronizing or discarded as frame slack.
  pub unused_bytes: u64,

  /// ### PACKET LOSS
  ///
  /// Lost Ethernet packets per channel, from packet number gaps.
  pub packet_loss: [u64; PACKET_CHANNEL_COUNT],

  /// ### EXCEPTIONS
  ///
  /// Unrecoverable structural errors that forced a resynchronization.
  pub exceptions: u64,

  /// ### EVENTS COMPLETED
  pub events_completed: u64,

  /// ### EVENT HITS
  ///
  /// Completed events per event index.
  pub event_hits: Vec<u64>,

  /// ### MODULE HITS
  ///
  /// Modules with data per (event index, module index).
  pub module_hits: Vec<Vec<u64>>,

  /// ### STACK FRAMES SEEN
  pub stack_frames_seen: u64,

  /// ### STACK CONTINUATIONS SEEN
  pub stack_continuations_seen: u64,

  /// ### BLOCK FRAMES SEEN
  pub block_frames_seen: u64,

  /// ### STACK ERRORS SEEN
  pub stack_errors_seen: u64,

  /// ### SYSTEM EVENTS SEEN
  ///
  /// Per subtype raw value.
  pub system_events_seen: BTreeMap<u8, u64>,

  /// ### FRAMES WITH ERROR FLAGS
  pub frames_with_error_flags: u64,

  /// ### RESULT COUNTS
  ///
  /// Indexed by [ParseResult] discriminant.
  pub result_counts: [u64; PARSE_RESULT_COUNT],
}

impl ParserCounters {
  fn count_result(&mut self, result: ParseResult) {
    self.result_counts[result as usize] += 1;
  }

  /// ### RESULT COUNT
  pub fn result_count(&self, result: ParseResult) -> u64 {
    self.result_counts[result as usize]
  }
}

/// Sub-position within the current module's readout structure.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ModulePhase {
  Prefix { left: u16 },
  /// Expecting a block read frame header of the dynamic part.
  Dynamic,
  /// Inside a block read frame.
  Block { left: u16, continues: bool },
  Suffix { left: u16 },
  Done,
}

/// The in-progress assembly of one readout event.
#[derive(Clone, Debug, Default)]
struct EventAssembly {
  event_index: usize,
  stack_id: u8,
  words: Vec<u32>,
  spans: Vec<ModuleSpans>,
  module_index: usize,
  flags: FrameFlags,
}

#[derive(Clone, Debug, Default)]
struct ModuleSpans {
  prefix: Range<usize>,
  dynamic: Range<usize>,
  suffix: Range<usize>,
}

#[derive(Clone, Debug, PartialEq)]
enum State {
  /// Between frames, expecting a header.
  Idle,
  /// Inside an open stack frame (or its continuations).
  InStackFrame {
    frame_words_left: u16,
    continue_expected: bool,
    awaiting_continuation: bool,
    phase: ModulePhase,
  },
  /// Collecting a system event payload.
  InSystemEvent {
    subtype: SystemEventSubtype,
    remaining: u16,
    collected: Vec<u32>,
  },
  /// Skipping the payload of a frame that is valid but unwanted.
  SkipFrame { remaining: u16 },
  /// Lost; scanning for the next recognizable header.
  Error,
}

enum Step {
  Continue,
  NeedInput,
}

/// ## READOUT PARSER
///
/// The per-stream parsing state machine. Construct one per data channel
/// from the crate's [readout structure], then feed it buffers with
/// [parse usb buffer] or [parse eth buffer].
///
/// [readout structure]: crate::config::CrateConfig::readout_structure
/// [parse usb buffer]:  ReadoutParser::parse_usb_buffer
/// [parse eth buffer]:  ReadoutParser::parse_eth_buffer
pub struct ReadoutParser {
  crate_id: u8,
  structures: Vec<EventReadoutStructure>,
  state: State,
  assembly: EventAssembly,
  last_packet_number: [Option<u16>; PACKET_CHANNEL_COUNT],
  counters: ParserCounters,
  shared_counters: Arc<Mutex<ParserCounters>>,
}

impl ReadoutParser {
  /// ### NEW PARSER
  pub fn new(crate_id: u8, structures: Vec<EventReadoutStructure>) -> Self {
    let counters: ParserCounters = ParserCounters {
      event_hits: vec![0; structures.len()],
      module_hits: structures.iter().map(|event| vec![0; event.modules.len()]).collect(),
      ..Default::default()
    };
    ReadoutParser {
      crate_id,
      structures,
      state: State::Idle,
      assembly: EventAssembly::default(),
      last_packet_number: [None; PACKET_CHANNEL_COUNT],
      counters: counters.clone(),
      shared_counters: Arc::new(Mutex::new(counters)),
    }
  }

  /// ### COUNTERS
  ///
  /// A snapshot of all counters, consistent as of the last published
  /// buffer. Cheap enough to call from a UI timer.
  pub fn counters(&self) -> ParserCounters {
    self.shared_counters.lock().expect("counters mutex").clone()
  }

  /// ### COUNTERS HANDLE
  ///
  /// The shared snapshot cell itself, for readers outliving a borrow of
  /// the parser.
  pub fn counters_handle(&self) -> Arc<Mutex<ParserCounters>> {
    self.shared_counters.clone()
  }

  fn publish_counters(&self) {
    *self.shared_counters.lock().expect("counters mutex") = self.counters.clone();
  }

  /// ### PARSE USB BUFFER
  ///
  /// Feeds one buffer of the USB byte-stream framing. Frames may start and
  /// end anywhere relative to buffer boundaries.
  pub fn parse_usb_buffer(&mut self, words: &[u32], callbacks: &mut impl ParserCallbacks) {
    self.counters.buffers_processed += 1;
    self.counters.bytes_processed += words.len() as u64 * 4;
    self.parse_words(words, callbacks);
    self.publish_counters();
  }

  /// ### PARSE ETH BUFFER
  ///
  /// Feeds one buffer of Ethernet framing: packets stored back to back,
  /// each beginning with its two header words.
  pub fn parse_eth_buffer(&mut self, words: &[u32], callbacks: &mut impl ParserCallbacks) {
    self.counters.buffers_processed += 1;
    self.counters.bytes_processed += words.len() as u64 * 4;

    let mut pos: usize = 0;
    while pos + PACKET_HEADER_WORDS <= words.len() {
      let header0: u32 = words[pos];
      let header1: u32 = words[pos + 1];
      let count: usize = packet_word_count(header0) as usize;
      let end: usize = (pos + PACKET_HEADER_WORDS + count).min(words.len());
      let payload: &[u32] = &words[pos + PACKET_HEADER_WORDS..end];
      self.parse_eth_packet(header0, header1, payload, callbacks);
      pos = end;
    }
    if pos < words.len() {
      // A trailing fragment shorter than a packet header.
      self.counters.unused_bytes += (words.len() - pos) as u64 * 4;
    }
    self.publish_counters();
  }

  fn parse_eth_packet(&mut self, header0: u32, header1: u32, payload: &[u32], callbacks: &mut impl ParserCallbacks) {
    let channel: usize = packet_channel(header0) as usize % PACKET_CHANNEL_COUNT;
    let number: u16 = packet_number(header0);

    if let Some(last) = self.last_packet_number[channel] {
      let lost: u16 = packet_loss_between(last, number);
      if lost > 0 {
        self.counters.packet_loss[channel] += lost as u64;
        tracing::warn!(channel, lost, "packet loss on data channel");
        self.enter_error();
      }
    }
    self.last_packet_number[channel] = Some(number);

    if self.state == State::Error {
      // Re-enter the frame structure at the packet's first header.
      let offset: u16 = next_header_offset(header1);
      if offset == NEXT_HEADER_NONE || offset as usize >= payload.len() {
        self.counters.unused_bytes += payload.len() as u64 * 4;
        return;
      }
      self.counters.unused_bytes += offset as u64 * 4;
      self.state = State::Idle;
      self.parse_words(&payload[offset as usize..], callbacks);
    } else {
      self.parse_words(payload, callbacks);
    }
  }

  fn parse_words(&mut self, words: &[u32], callbacks: &mut impl ParserCallbacks) {
    let mut pos: usize = 0;
    loop {
      match self.step(words, &mut pos, callbacks) {
        Step::Continue => {}
        Step::NeedInput => break,
      }
    }
  }

  /// One bounded action of the state machine. Returns [Step::NeedInput]
  /// only when further progress requires words beyond the buffer end.
  fn step(&mut self, words: &[u32], pos: &mut usize, callbacks: &mut impl ParserCallbacks) -> Step {
    match std::mem::replace(&mut self.state, State::Idle) {
      State::Idle => {
        if *pos >= words.len() {
          return Step::NeedInput;
        }
        let header: u32 = words[*pos];
        *pos += 1;
        self.on_top_level_header(header)
      }

      State::SkipFrame { remaining } => {
        let take: usize = (remaining as usize).min(words.len() - *pos);
        *pos += take;
        self.counters.unused_bytes += take as u64 * 4;
        let remaining: u16 = remaining - take as u16;
        if remaining == 0 {
          self.state = State::Idle;
          return Step::Continue;
        }
        self.state = State::SkipFrame { remaining };
        Step::NeedInput
      }

      State::Error => {
        self.state = State::Error;
        // Scan for a plausible resynchronization point.
        loop {
          if *pos >= words.len() {
            return Step::NeedInput;
          }
          let header: u32 = words[*pos];
          if let Some(info) = extract_frame_info(header) {
            if matches!(info.frame_type, FrameType::StackFrame | FrameType::SystemEvent) {
              self.state = State::Idle;
              return Step::Continue;
            }
          }
          *pos += 1;
          self.counters.unused_bytes += 4;
        }
      }

      State::InSystemEvent { subtype, remaining, mut collected } => {
        let take: usize = (remaining as usize).min(words.len() - *pos);
        collected.extend_from_slice(&words[*pos..*pos + take]);
        *pos += take;
        let remaining: u16 = remaining - take as u16;
        if remaining == 0 {
          callbacks.system_event(self.crate_id, subtype, &collected);
          self.state = State::Idle;
          return Step::Continue;
        }
        self.state = State::InSystemEvent { subtype, remaining, collected };
        Step::NeedInput
      }

      State::InStackFrame { mut frame_words_left, continue_expected, awaiting_continuation, mut phase } => {
        if awaiting_continuation {
          if *pos >= words.len() {
            self.state = State::InStackFrame { frame_words_left, continue_expected, awaiting_continuation, phase };
            return Step::NeedInput;
          }
          let header: u32 = words[*pos];
          *pos += 1;
          return match extract_frame_info(header) {
            Some(info)
              if info.frame_type == FrameType::StackContinuation && info.stack_id == self.assembly.stack_id =>
            {
              self.counters.stack_continuations_seen += 1;
              self.note_frame_flags(info.flags);
              self.assembly.flags |= info.flags & !FrameFlags::CONTINUE;
              self.state = State::InStackFrame {
                frame_words_left: info.len,
                continue_expected: info.continues(),
                awaiting_continuation: false,
                phase,
              };
              Step::Continue
            }
            _ => {
              // Let the scanner reconsider this word as a resync point.
              *pos -= 1;
              self.counters.count_result(ParseResult::MissingContinuation);
              self.structural_error()
            }
          };
        }

        // Phase transitions that consume nothing run first; they must not
        // be mistaken for frame exhaustion.
        match phase {
          ModulePhase::Prefix { left: 0 } => {
            let phase: ModulePhase = self.after_prefix();
            self.state = State::InStackFrame { frame_words_left, continue_expected, awaiting_continuation: false, phase };
            return Step::Continue;
          }
          ModulePhase::Block { left: 0, continues } => {
            let phase: ModulePhase = if continues {
              // Another block frame of the same transfer follows.
              ModulePhase::Dynamic
            } else {
              self.enter_suffix()
            };
            self.state = State::InStackFrame { frame_words_left, continue_expected, awaiting_continuation: false, phase };
            return Step::Continue;
          }
          ModulePhase::Suffix { left: 0 } => {
            let phase: ModulePhase = self.next_module();
            self.state = State::InStackFrame { frame_words_left, continue_expected, awaiting_continuation: false, phase };
            return Step::Continue;
          }
          _ => {}
        }

        // The outer frame payload is exhausted: chain into the
        // continuation or finish the event.
        if frame_words_left == 0 {
          return if continue_expected {
            self.state = State::InStackFrame {
              frame_words_left: 0,
              continue_expected: false,
              awaiting_continuation: true,
              phase,
            };
            Step::Continue
          } else if phase == ModulePhase::Done {
            self.complete_event(callbacks)
          } else {
            self.counters.count_result(ParseResult::MissingContinuation);
            self.structural_error()
          };
        }

        let result: Step = match phase {
          ModulePhase::Prefix { left } if left > 0 => {
            match self.copy_words(words, pos, left, frame_words_left) {
              Some(taken) => {
                frame_words_left -= taken;
                self.extend_prefix_span();
                let left: u16 = left - taken;
                phase = if left > 0 { ModulePhase::Prefix { left } } else { self.after_prefix() };
                Step::Continue
              }
              None => Step::NeedInput,
            }
          }
          ModulePhase::Prefix { .. } => {
            phase = self.after_prefix();
            Step::Continue
          }
          ModulePhase::Dynamic => {
            // A block read frame header, taken from the outer payload.
            if *pos >= words.len() {
              Step::NeedInput
            } else {
              let header: u32 = words[*pos];
              *pos += 1;
              frame_words_left -= 1;
              match extract_frame_info(header) {
                Some(info) if info.frame_type == FrameType::BlockRead => {
                  self.counters.block_frames_seen += 1;
                  self.note_frame_flags(info.flags);
                  self.assembly.flags |= info.flags & !FrameFlags::CONTINUE;
                  phase = ModulePhase::Block { left: info.len, continues: info.continues() };
                  Step::Continue
                }
                _ => {
                  self.counters.count_result(ParseResult::EventStructureMismatch);
                  return self.structural_error();
                }
              }
            }
          }
          ModulePhase::Block { left, continues } if left > 0 => {
            match self.copy_words(words, pos, left, frame_words_left) {
              Some(taken) => {
                frame_words_left -= taken;
                self.extend_dynamic_span();
                phase = ModulePhase::Block { left: left - taken, continues };
                Step::Continue
              }
              None => Step::NeedInput,
            }
          }
          ModulePhase::Block { continues, .. } => {
            phase = if continues {
              // Another block frame of the same transfer follows.
              ModulePhase::Dynamic
            } else {
              self.enter_suffix()
            };
            Step::Continue
          }
          ModulePhase::Suffix { left } if left > 0 => {
            match self.copy_words(words, pos, left, frame_words_left) {
              Some(taken) => {
                frame_words_left -= taken;
                self.extend_suffix_span();
                phase = ModulePhase::Suffix { left: left - taken };
                Step::Continue
              }
              None => Step::NeedInput,
            }
          }
          ModulePhase::Suffix { .. } => {
            phase = self.next_module();
            Step::Continue
          }
          ModulePhase::Done => {
            // Slack words after the last module; legal but unused.
            let take: usize = (frame_words_left as usize).min(words.len() - *pos);
            if take == 0 {
              Step::NeedInput
            } else {
              *pos += take;
              frame_words_left -= take as u16;
              self.counters.unused_bytes += take as u64 * 4;
              Step::Continue
            }
          }
        };

        self.state = State::InStackFrame {
          frame_words_left,
          continue_expected,
          awaiting_continuation: false,
          phase,
        };
        result
      }
    }
  }

  /// Dispatches one header word encountered at the top level.
  fn on_top_level_header(&mut self, header: u32) -> Step {
    let Some(info) = extract_frame_info(header) else {
      self.counters.count_result(ParseResult::NoHeaderPresent);
      self.counters.unused_bytes += 4;
      return Step::Continue;
    };

    match info.frame_type {
      FrameType::StackFrame => {
        self.counters.stack_frames_seen += 1;
        self.note_frame_flags(info.flags);
        self.begin_assembly(info)
      }
      FrameType::SystemEvent => {
        let Some(subtype) = extract_system_event_subtype(header) else {
          self.counters.count_result(ParseResult::UnexpectedFrameType);
          self.state = State::SkipFrame { remaining: info.len };
          return Step::Continue;
        };
        *self.counters.system_events_seen.entry(u8::from(subtype)).or_default() += 1;
        self.state = State::InSystemEvent { subtype, remaining: info.len, collected: vec![] };
        Step::Continue
      }
      FrameType::StackError => {
        self.counters.stack_errors_seen += 1;
        self.note_frame_flags(info.flags);
        self.state = State::SkipFrame { remaining: info.len };
        Step::Continue
      }
      FrameType::BlockRead => {
        self.counters.count_result(ParseResult::UnexpectedOpenBlockFrame);
        self.structural_error()
      }
      FrameType::StackContinuation => {
        self.counters.count_result(ParseResult::NotAStackFrame);
        self.structural_error()
      }
      FrameType::SuperFrame => {
        self.counters.count_result(ParseResult::UnexpectedFrameType);
        self.state = State::SkipFrame { remaining: info.len };
        Step::Continue
      }
    }
  }

  fn begin_assembly(&mut self, info: FrameInfo) -> Step {
    let event_index: usize = match (info.stack_id as usize).checked_sub(1) {
      Some(index) if index < self.structures.len() => index,
      _ => {
        self.counters.count_result(ParseResult::StackIndexOutOfRange);
        self.state = State::SkipFrame { remaining: info.len };
        return Step::Continue;
      }
    };

    let module_count: usize = self.structures[event_index].modules.len();
    self.assembly = EventAssembly {
      event_index,
      stack_id: info.stack_id,
      words: vec![],
      spans: vec![ModuleSpans::default(); module_count],
      module_index: 0,
      flags: info.flags & !FrameFlags::CONTINUE,
    };
    let phase: ModulePhase = self.enter_module(0);
    self.state = State::InStackFrame {
      frame_words_left: info.len,
      continue_expected: info.continues(),
      awaiting_continuation: false,
      phase,
    };
    Step::Continue
  }

  fn current_module(&self) -> ModuleReadoutStructure {
    self.structures[self.assembly.event_index].modules[self.assembly.module_index]
  }

  /// The phase a module starts in, given its structure. The prefix span
  /// opens at the current assembly position.
  fn enter_module(&mut self, module_index: usize) -> ModulePhase {
    let modules: &[ModuleReadoutStructure] = &self.structures[self.assembly.event_index].modules;
    if module_index >= modules.len() {
      return ModulePhase::Done;
    }
    self.assembly.module_index = module_index;
    let here: usize = self.assembly.words.len();
    self.assembly.spans[module_index] = ModuleSpans {
      prefix: here..here,
      dynamic: here..here,
      suffix: here..here,
    };
    ModulePhase::Prefix { left: modules[module_index].prefix_len }
  }

  fn after_prefix(&mut self) -> ModulePhase {
    let here: usize = self.assembly.words.len();
    if self.current_module().has_dynamic {
      self.assembly.spans[self.assembly.module_index].dynamic = here..here;
      ModulePhase::Dynamic
    } else {
      self.enter_suffix()
    }
  }

  fn enter_suffix(&mut self) -> ModulePhase {
    let here: usize = self.assembly.words.len();
    self.assembly.spans[self.assembly.module_index].suffix = here..here;
    ModulePhase::Suffix { left: self.current_module().suffix_len }
  }

  fn next_module(&mut self) -> ModulePhase {
    self.enter_module(self.assembly.module_index + 1)
  }

  /// Copies up to `wanted` words into the assembly, bounded by the buffer
  /// and the open frame. Returns the count taken, or [None] if the buffer
  /// is exhausted.
  fn copy_words(&mut self, words: &[u32], pos: &mut usize, wanted: u16, frame_words_left: u16) -> Option<u16> {
    let available: usize = words.len() - *pos;
    if available == 0 {
      return None;
    }
    let take: usize = (wanted as usize).min(frame_words_left as usize).min(available);
    self.assembly.words.extend_from_slice(&words[*pos..*pos + take]);
    *pos += take;
    Some(take as u16)
  }

  fn extend_prefix_span(&mut self) {
    let end: usize = self.assembly.words.len();
    self.assembly.spans[self.assembly.module_index].prefix.end = end;
  }

  fn extend_dynamic_span(&mut self) {
    let end: usize = self.assembly.words.len();
    self.assembly.spans[self.assembly.module_index].dynamic.end = end;
  }

  fn extend_suffix_span(&mut self) {
    let end: usize = self.assembly.words.len();
    self.assembly.spans[self.assembly.module_index].suffix.end = end;
  }

  fn complete_event(&mut self, callbacks: &mut impl ParserCallbacks) -> Step {
    let assembly: EventAssembly = std::mem::take(&mut self.assembly);
    if assembly.flags.intersects(FrameFlags::TIMEOUT | FrameFlags::BUS_ERROR | FrameFlags::SYNTAX_ERROR) {
      tracing::debug!(
        event_index = assembly.event_index,
        flags = ?assembly.flags,
        "completed event carries error flags",
      );
    }

    callbacks.begin_event(self.crate_id, assembly.event_index);
    for (module_index, spans) in assembly.spans.iter().enumerate() {
      let data: ModuleData = ModuleData {
        prefix: &assembly.words[spans.prefix.clone()],
        dynamic: &assembly.words[spans.dynamic.clone()],
        suffix: &assembly.words[spans.suffix.clone()],
      };
      if data.has_data() {
        self.counters.module_hits[assembly.event_index][module_index] += 1;
        callbacks.module_data(self.crate_id, assembly.event_index, module_index, &data);
      }
    }
    callbacks.end_event(self.crate_id, assembly.event_index);

    self.counters.events_completed += 1;
    self.counters.event_hits[assembly.event_index] += 1;
    self.counters.count_result(ParseResult::Ok);
    self.state = State::Idle;
    Step::Continue
  }

  fn structural_error(&mut self) -> Step {
    self.enter_error();
    Step::Continue
  }

  fn enter_error(&mut self) {
    self.counters.exceptions += 1;
    self.assembly = EventAssembly::default();
    self.state = State::Error;
  }

  fn note_frame_flags(&mut self, flags: FrameFlags) {
    if flags.intersects(FrameFlags::TIMEOUT | FrameFlags::BUS_ERROR | FrameFlags::SYNTAX_ERROR) {
      self.counters.frames_with_error_flags += 1;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{EventReadoutStructure, ModuleReadoutStructure};
  use crate::eth::{make_packet_header0, make_packet_header1};
  use mvlc_stack::frame::{make_stack_frame_header, make_system_event_header};

  /// Records every callback with owned data for later assertions.
  #[derive(Default)]
  struct Recorder {
    begins: Vec<usize>,
    ends: Vec<usize>,
    modules: Vec<(usize, usize, Vec<u32>, Vec<u32>, Vec<u32>)>,
    system_events: Vec<(SystemEventSubtype, Vec<u32>)>,
  }

  impl ParserCallbacks for Recorder {
    fn begin_event(&mut self, _crate_id: u8, event_index: usize) {
      self.begins.push(event_index);
    }

    fn module_data(&mut self, _crate_id: u8, event_index: usize, module_index: usize, data: &ModuleData) {
      self.modules.push((
        event_index,
        module_index,
        data.prefix.to_vec(),
        data.dynamic.to_vec(),
        data.suffix.to_vec(),
      ));
    }

    fn end_event(&mut self, _crate_id: u8, event_index: usize) {
      self.ends.push(event_index);
    }

    fn system_event(&mut self, _crate_id: u8, subtype: SystemEventSubtype, words: &[u32]) {
      self.system_events.push((subtype, words.to_vec()));
    }
  }

  fn one_dynamic_module() -> Vec<EventReadoutStructure> {
    vec![EventReadoutStructure {
      modules: vec![ModuleReadoutStructure { prefix_len: 0, has_dynamic: true, suffix_len: 0 }],
    }]
  }

  /// One stack frame holding one 100-word block read, as stack id 1.
  fn single_event_words() -> Vec<u32> {
    let payload: Vec<u32> = (0..100).collect();
    let mut words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 101, FrameFlags::empty()),
      mvlc_stack::frame::make_frame_header(FrameType::BlockRead, 100, FrameFlags::empty()),
    ];
    words.extend_from_slice(&payload);
    words
  }

  #[test]
  fn single_module_event_in_one_buffer() {
    let mut parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&single_event_words(), &mut recorder);

    assert_eq!(recorder.begins, vec![0]);
    assert_eq!(recorder.ends, vec![0]);
    assert_eq!(recorder.modules.len(), 1);
    let (event, module, prefix, dynamic, suffix) = &recorder.modules[0];
    assert_eq!((*event, *module), (0, 0));
    assert!(prefix.is_empty() && suffix.is_empty());
    assert_eq!(dynamic.len(), 100);
    assert_eq!(dynamic[0], 0);
    assert_eq!(dynamic[99], 99);

    let counters: ParserCounters = parser.counters();
    assert_eq!(counters.events_completed, 1);
    assert_eq!(counters.event_hits, vec![1]);
    assert_eq!(counters.module_hits, vec![vec![1]]);
    assert_eq!(counters.result_count(ParseResult::Ok), 1);
    assert_eq!(counters.unused_bytes, 0);
    assert_eq!(counters.bytes_processed, single_event_words().len() as u64 * 4);
  }

  #[test]
  fn event_split_across_three_buffers() {
    let words: Vec<u32> = single_event_words();
    let mut whole_parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut whole: Recorder = Recorder::default();
    whole_parser.parse_usb_buffer(&words, &mut whole);

    let mut split_parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut split: Recorder = Recorder::default();
    split_parser.parse_usb_buffer(&words[..40], &mut split);
    assert!(split.begins.is_empty(), "no callbacks before the event completes");
    split_parser.parse_usb_buffer(&words[40..70], &mut split);
    split_parser.parse_usb_buffer(&words[70..], &mut split);

    assert_eq!(split.begins, whole.begins);
    assert_eq!(split.ends, whole.ends);
    assert_eq!(split.modules, whole.modules);
    assert_eq!(split_parser.counters().events_completed, 1);
  }

  #[test]
  fn continuation_chain_concatenates_block_data() {
    // The 100-word block split over a stack frame and a continuation,
    // with the block itself split into two block frames.
    let mut words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 41, FrameFlags::CONTINUE),
      mvlc_stack::frame::make_frame_header(FrameType::BlockRead, 40, FrameFlags::CONTINUE),
    ];
    words.extend(0..40);
    words.push(make_stack_frame_header(FrameType::StackContinuation, 1, 61, FrameFlags::empty()));
    words.push(mvlc_stack::frame::make_frame_header(FrameType::BlockRead, 60, FrameFlags::empty()));
    words.extend(40..100);

    let mut parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&words, &mut recorder);

    assert_eq!(recorder.begins, vec![0]);
    let (_, _, _, dynamic, _) = &recorder.modules[0];
    assert_eq!(dynamic.as_slice(), (0u32..100).collect::<Vec<u32>>().as_slice());
    assert_eq!(parser.counters().stack_continuations_seen, 1);
    assert_eq!(parser.counters().block_frames_seen, 2);
  }

  #[test]
  fn prefix_and_suffix_walk() {
    let structures: Vec<EventReadoutStructure> = vec![EventReadoutStructure {
      modules: vec![
        ModuleReadoutStructure { prefix_len: 2, has_dynamic: true, suffix_len: 1 },
        ModuleReadoutStructure { prefix_len: 1, has_dynamic: false, suffix_len: 0 },
      ],
    }];
    let words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 7, FrameFlags::empty()),
      0xAAA0, 0xAAA1, // module 0 prefix
      mvlc_stack::frame::make_frame_header(FrameType::BlockRead, 2, FrameFlags::empty()),
      0xBBB0, 0xBBB1, // module 0 dynamic
      0xCCC0, // module 0 suffix
      0xDDD0, // module 1 prefix
    ];

    let mut parser: ReadoutParser = ReadoutParser::new(0, structures);
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&words, &mut recorder);

    assert_eq!(recorder.modules.len(), 2);
    assert_eq!(recorder.modules[0].2, vec![0xAAA0, 0xAAA1]);
    assert_eq!(recorder.modules[0].3, vec![0xBBB0, 0xBBB1]);
    assert_eq!(recorder.modules[0].4, vec![0xCCC0]);
    assert_eq!(recorder.modules[1].2, vec![0xDDD0]);
  }

  #[test]
  fn zero_length_event_completes() {
    let structures: Vec<EventReadoutStructure> = vec![EventReadoutStructure {
      modules: vec![ModuleReadoutStructure::default()],
    }];
    let words: Vec<u32> = vec![make_stack_frame_header(FrameType::StackFrame, 1, 0, FrameFlags::empty())];
    let mut parser: ReadoutParser = ReadoutParser::new(0, structures);
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&words, &mut recorder);

    assert_eq!(recorder.begins, vec![0]);
    assert_eq!(recorder.ends, vec![0]);
    assert!(recorder.modules.is_empty(), "modules without data produce no callback");
  }

  #[test]
  fn system_event_payload_is_delivered() {
    let mut words: Vec<u32> = vec![make_system_event_header(SystemEventSubtype::TimeTick, 2, false)];
    words.extend_from_slice(&[0x1111, 0x2222]);
    let mut parser: ReadoutParser = ReadoutParser::new(0, vec![]);
    let mut recorder: Recorder = Recorder::default();
    // Split inside the payload to cover cross-buffer system events.
    parser.parse_usb_buffer(&words[..2], &mut recorder);
    parser.parse_usb_buffer(&words[2..], &mut recorder);

    assert_eq!(recorder.system_events.len(), 1);
    assert_eq!(recorder.system_events[0].0, SystemEventSubtype::TimeTick);
    assert_eq!(recorder.system_events[0].1, vec![0x1111, 0x2222]);
  }

  fn eth_packet(channel: u8, number: u16, payload: &[u32], next_header: u16) -> Vec<u32> {
    let mut words: Vec<u32> = vec![
      make_packet_header0(channel, number, payload.len() as u16),
      make_packet_header1(0, next_header),
    ];
    words.extend_from_slice(payload);
    words
  }

  #[test]
  fn packet_loss_is_counted_and_resynchronized() {
    let event: Vec<u32> = single_event_words();

    // Packet 0 carries a whole event; packet 1 starts another event whose
    // tail would have been in the lost packet 2; packet 3 carries a whole
    // event again, preceded by mid-frame words the parser must skip.
    let packet0: Vec<u32> = eth_packet(0, 0, &event, 0);
    let partial: Vec<u32> = event[..30].to_vec();
    let packet1: Vec<u32> = eth_packet(0, 1, &partial, 0);
    let mut tail_then_event: Vec<u32> = vec![0xDEAD, 0xBEEF, 0xDEAD];
    tail_then_event.extend_from_slice(&event);
    let packet3: Vec<u32> = eth_packet(0, 3, &tail_then_event, 3);

    let mut buffer: Vec<u32> = vec![];
    buffer.extend(&packet0);
    buffer.extend(&packet1);
    buffer.extend(&packet3);

    let mut parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut recorder: Recorder = Recorder::default();
    parser.parse_eth_buffer(&buffer, &mut recorder);

    let counters: ParserCounters = parser.counters();
    assert_eq!(counters.packet_loss[0], 1);
    assert_eq!(counters.packet_loss[1], 0);
    // The partial event vanished without callbacks; the two whole events
    // arrived intact.
    assert_eq!(recorder.begins, vec![0, 0]);
    assert_eq!(recorder.modules.len(), 2);
    assert_eq!(counters.unused_bytes, 3 * 4);
  }

  #[test]
  fn consumed_plus_unused_accounts_for_all_bytes() {
    let mut words: Vec<u32> = vec![0xDEAD_0001, 0xDEAD_0002]; // garbage before the first header
    words.extend(single_event_words());
    let mut parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&words, &mut recorder);

    let counters: ParserCounters = parser.counters();
    assert_eq!(counters.bytes_processed, words.len() as u64 * 4);
    assert_eq!(counters.unused_bytes, 2 * 4);
    assert_eq!(counters.events_completed, 1);
    assert_eq!(counters.result_count(ParseResult::NoHeaderPresent), 2);
  }

  #[test]
  fn missing_continuation_resynchronizes() {
    // An open stack frame promises a continuation but another stack frame
    // header arrives instead; the partial event is dropped and the new
    // event parses normally.
    let mut words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 1, FrameFlags::CONTINUE),
      mvlc_stack::frame::make_frame_header(FrameType::BlockRead, 0, FrameFlags::CONTINUE),
    ];
    words.extend(single_event_words());

    let mut parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&words, &mut recorder);

    assert_eq!(parser.counters().result_count(ParseResult::MissingContinuation), 1);
    assert_eq!(parser.counters().exceptions, 1);
    assert_eq!(recorder.begins, vec![0]);
    assert_eq!(recorder.modules.len(), 1);
  }

  #[test]
  fn stack_id_without_event_skips_the_frame() {
    let mut words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 9, 2, FrameFlags::empty()),
      0x1234, 0x5678,
    ];
    words.extend(single_event_words());

    let mut parser: ReadoutParser = ReadoutParser::new(0, one_dynamic_module());
    let mut recorder: Recorder = Recorder::default();
    parser.parse_usb_buffer(&words, &mut recorder);

    assert_eq!(parser.counters().result_count(ParseResult::StackIndexOutOfRange), 1);
    assert_eq!(parser.counters().unused_bytes, 2 * 4);
    assert_eq!(recorder.begins, vec![0]);
  }
}

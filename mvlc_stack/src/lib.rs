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

//! # MVLC COMMAND STACKS & WIRE FORMAT
//!
//! Copyright © 2024 Nathaniel Hardesty, Licensed under the MIT License
//!
//! This software is created by a third-party and not endorsed or supported by
//! mesytec GmbH & Co. KG.
//!
//! ---------------------------------------------------------------------------
//!
//! The MVLC is a programmable VME master: rather than issuing individual bus
//! cycles from the host, the host uploads [Command Stack]s, short programs
//! over a fixed opcode set, into controller memory and binds each stack to a
//! trigger. The controller then executes the bound stack autonomously on
//! every trigger and streams the produced data back out, framed, over USB or
//! Ethernet.
//!
//! This crate covers the three pure-data layers of that scheme:
//!
//! - The [Stack Command] set and its binary encoding, together with the
//!   [Stack Command Builder] used to compile parsed [Script Command]s into
//!   encoded stacks and to decode stacks back into commands.
//! - The [Super Command] set: the host-side command language used on the
//!   register channel, including the [Upload Program] which writes an encoded
//!   stack into controller stack memory.
//! - The [Frame] wire format: the self-delimiting header words with which the
//!   controller frames everything it emits on the data channel, including
//!   [System Event]s.
//!
//! Trigger register values are computed from [Trigger Condition]s by the
//! [trigger] module.
//!
//! ---------------------------------------------------------------------------
//!
//! ## Referenced Standards
//!
//! - ANSI/VITA 1-1994  - VME64
//! - ANSI/VITA 1.5-2003 - 2eSST
//!
//! [Command Stack]:         StackCommandBuilder
//! [Stack Command]:         command::StackCommand
//! [Script Command]:        script::ScriptCommand
//! [Stack Command Builder]: StackCommandBuilder
//! [Super Command]:         superc::SuperCommand
//! [Upload Program]:        superc::build_upload_program
//! [Frame]:                 frame
//! [System Event]:          frame::SystemEventSubtype
//! [Trigger Condition]:     trigger::TriggerCondition
//! [trigger]:               trigger

pub mod command;
pub mod frame;
pub mod script;
pub mod superc;
pub mod trigger;

pub use command::StackCommand;
pub use script::ScriptCommand;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ## ADDRESS MODIFIER
/// **Based on ANSI/VITA 1-1994 Table 2-3**
///
/// The VME address modifier code emitted alongside the address in every bus
/// cycle, selecting the address space and transfer discipline of the cycle.
///
/// Single-cycle commands require one of the single-cycle codes, block
/// transfer commands one of the block codes; mixing the two is rejected by
/// the compiler with [Invalid Address Modifier].
///
/// [Invalid Address Modifier]: CompileError::InvalidAddressModifier
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, PartialEq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum AddressModifier {
  /// ### A16 USER
  ///
  /// Short non-privileged access, 16 address bits.
  A16 = 0x29,

  /// ### A24 USER DATA
  ///
  /// Standard non-privileged data access, 24 address bits.
  A24 = 0x39,

  /// ### A32 USER DATA
  ///
  /// Extended non-privileged data access, 32 address bits.
  A32 = 0x09,

  /// ### A32 USER BLT
  ///
  /// Extended non-privileged 32-bit block transfer.
  Blt32 = 0x0B,

  /// ### A32 USER MBLT
  ///
  /// Extended non-privileged 64-bit multiplexed block transfer.
  Mblt64 = 0x08,

  /// ### A32 2eSST
  /// **Based on ANSI/VITA 1.5-2003**
  ///
  /// Two-edge source-synchronous block transfer.
  Blk2eSst64 = 0x60,
}
impl AddressModifier {
  /// ### IS BLOCK MODIFIER
  ///
  /// Whether this modifier selects a block transfer discipline.
  pub fn is_block(&self) -> bool {
    matches!(self, AddressModifier::Blt32 | AddressModifier::Mblt64 | AddressModifier::Blk2eSst64)
  }
}

/// ## DATA WIDTH
///
/// The width of a single-cycle VME data access.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, PartialEq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum DataWidth {
  /// ### 16 BIT
  D16 = 0x1,

  /// ### 32 BIT
  D32 = 0x2,
}

/// ## 2eSST TRANSFER RATE
/// **Based on ANSI/VITA 1.5-2003**
///
/// The source-synchronous transfer rate of a [2eSST] block read.
///
/// [2eSST]: AddressModifier::Blk2eSst64
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, IntoPrimitive, PartialEq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum Blk2eSstRate {
  /// ### 160 MB/s
  #[default]
  Rate160MB = 0,

  /// ### 276 MB/s
  Rate276MB = 1,

  /// ### 320 MB/s
  Rate320MB = 2,
}

/// ## ACCUMULATOR COMPARATOR
///
/// The comparison applied by the [Compare Loop Accu] stack command between
/// the controller accumulator and the compare value.
///
/// [Compare Loop Accu]: command::StackCommand::CompareLoopAccu
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, PartialEq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum AccuComparator {
  /// ### EQUAL
  Eq = 0,

  /// ### LESS THAN
  Lt = 1,

  /// ### GREATER THAN
  Gt = 2,
}

/// ## OUTPUT PIPE
///
/// The controller output pipe a stack writes its results to: the command
/// pipe carries register-channel responses, the data pipe carries readout
/// data.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, IntoPrimitive, PartialEq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum OutputPipe {
  /// ### COMMAND PIPE
  Command = 0,

  /// ### DATA PIPE
  #[default]
  Data = 1,
}

/// ## STACK MEMORY BEGIN
///
/// First word address of the controller's stack memory area. Stack 0, the
/// immediate-execution stack used by the register channel, lives at the
/// bottom; readout stacks are uploaded above it.
pub const STACK_MEMORY_BEGIN: u16 = 0x2000;

/// ## STACK MEMORY WORDS
///
/// Total size of the controller's stack memory area in 32-bit words. An
/// encoded stack whose words do not fit below this bound fails to compile
/// with [Stack Too Long].
///
/// [Stack Too Long]: CompileError::StackTooLong
pub const STACK_MEMORY_WORDS: usize = 2048;

/// ## IMMEDIATE STACK RESERVED WORDS
///
/// Words at the bottom of stack memory reserved for the immediate stack;
/// uploaded readout stacks start above this offset.
pub const IMMEDIATE_STACK_RESERVED_WORDS: usize = 128;

/// ## READOUT STACK COUNT
///
/// Number of trigger-bound readout stacks the controller supports. One
/// readout event binds to one stack, so this also bounds the events per
/// crate.
pub const READOUT_STACK_COUNT: usize = 16;

/// ## STACK COMPILE ERROR
///
/// Represents a failure to translate [Script Command]s into an encoded
/// command stack.
///
/// [Script Command]: script::ScriptCommand
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CompileError {
  /// ### UNSUPPORTED IN STACK
  ///
  /// The script command only makes sense when executed directly by the host
  /// and has no stack opcode. Software delays are the common case: the
  /// controller has no millisecond timebase, only [Wait Clocks].
  ///
  /// [Wait Clocks]: command::StackCommand::WaitClocks
  #[error("script command '{0}' is not supported inside a command stack")]
  UnsupportedInStack(&'static str),

  /// ### STACK TOO LONG
  ///
  /// The encoded stack does not fit into controller stack memory.
  #[error("encoded stack is {len} words, exceeding the {max} word stack memory limit")]
  StackTooLong { len: usize, max: usize },

  /// ### INVALID ADDRESS MODIFIER
  ///
  /// A single-cycle command carried a block modifier or a block command
  /// carried a single-cycle modifier.
  #[error("address modifier {amod:?} is invalid for command '{command}'")]
  InvalidAddressModifier { amod: AddressModifier, command: &'static str },

  /// ### TRANSFER COUNT OVERFLOW
  ///
  /// A block transfer count exceeds the 16 bits available in the encoded
  /// command word.
  #[error("transfer count {given} exceeds the maximum of {max}")]
  TransferCountOverflow { given: u32, max: u32 },
}

/// ## STACK DECODE ERROR
///
/// Represents a failure to decode binary stack words back into commands.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DecodeError {
  /// ### UNKNOWN OPCODE
  #[error("unknown stack opcode 0x{0:02X}")]
  UnknownOpcode(u8),

  /// ### TRUNCATED COMMAND
  ///
  /// The word stream ended inside the argument words of a command.
  #[error("stack data ends inside the arguments of opcode 0x{0:02X}")]
  TruncatedCommand(u8),

  /// ### MISSING STACK START
  #[error("stack data does not begin with a StackStart word")]
  MissingStackStart,

  /// ### MISSING STACK END
  #[error("stack data is not terminated by a StackEnd word")]
  MissingStackEnd,

  /// ### INVALID FIELD
  ///
  /// An argument field held a value outside its domain, such as an unknown
  /// address modifier or comparator.
  #[error("invalid value 0x{value:02X} in field '{field}'")]
  InvalidField { field: &'static str, value: u8 },
}

/// ## STACK COMMAND BUILDER
///
/// An ordered, named sequence of [Stack Command]s destined for one
/// [Output Pipe], together with its binary encoding.
///
/// Re-exported from [command]; see the module documentation there for the
/// encoding scheme.
///
/// [Stack Command]: command::StackCommand
/// [Output Pipe]:   OutputPipe
/// [command]:       command
pub use command::StackCommandBuilder;

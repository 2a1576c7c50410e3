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

//! # STACK COMMANDS
//!
//! Defines the opcode set the controller executes from stack memory and the
//! binary encoding of each command, together with the [Stack Command Builder]
//! which assembles, encodes, and decodes whole stacks.
//!
//! ---------------------------------------------------------------------------
//!
//! Every command encodes to one or more 32-bit words. The first word carries
//! the opcode in bits 24–31; the remaining fields of the first word and the
//! count of argument words are opcode-specific:
//!
//! | Opcode | Command | First word fields | Argument words |
//! |---|---|---|---|
//! | 0xF3 | [Stack Start] | output pipe (16–23) | - |
//! | 0xF4 | [Stack End] | - | - |
//! | 0x12 | [VME Read] | amod (16–23), width (8–15), slow (0) | address |
//! | 0x14 | [Read To Accu] | amod (16–23), width (8–15), slow (0) | address |
//! | 0x23 | [VME Write] | amod (16–23), width (8–15) | address, value |
//! | 0x32 | [VME Block Read] | amod (16–23), rate (4–5), swap (1), fifo (0) | transfers, address |
//! | 0xC1 | [Write Special] | value (0–23) | - |
//! | 0xC2 | [Write Marker] | - | marker value |
//! | 0xC4 | [Wait Clocks] | clocks (0–23) | - |
//! | 0xC5 | [Mask Shift Accu] | rotate (0–5) | mask |
//! | 0xC6 | [Signal Accu] | - | - |
//! | 0xC7 | [Compare Loop Accu] | comparator (0–7) | value, limit |
//! | 0xC8 | [Set Accu] | - | value |
//! | 0xCC | [Custom] | word count (0–15) | N raw words |
//!
//! The [Stack Start] opcode deliberately shares its value with the
//! [Stack Frame] type: when a stack executes, the controller rewrites its
//! StackStart word into the frame header of the output it produces.
//!
//! [Stack Command Builder]: StackCommandBuilder
//! [Stack Start]:           StackCommandType::StackStart
//! [Stack End]:             StackCommandType::StackEnd
//! [VME Read]:              StackCommand::VmeRead
//! [Read To Accu]:          StackCommand::ReadToAccu
//! [VME Write]:             StackCommand::VmeWrite
//! [VME Block Read]:        StackCommand::VmeBlockRead
//! [Write Special]:         StackCommand::WriteSpecial
//! [Write Marker]:          StackCommand::WriteMarker
//! [Wait Clocks]:           StackCommand::WaitClocks
//! [Mask Shift Accu]:       StackCommand::MaskShiftAccu
//! [Signal Accu]:           StackCommand::SignalAccu
//! [Compare Loop Accu]:     StackCommand::CompareLoopAccu
//! [Set Accu]:              StackCommand::SetAccu
//! [Custom]:                StackCommand::Custom
//! [Stack Frame]:           crate::frame::FrameType::StackFrame

use crate::{
  AccuComparator,
  AddressModifier,
  Blk2eSstRate,
  CompileError,
  DataWidth,
  DecodeError,
  OutputPipe,
  IMMEDIATE_STACK_RESERVED_WORDS,
  STACK_MEMORY_WORDS,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ## STACK COMMAND TYPE
///
/// The opcode byte found in bits 24–31 of the first word of every encoded
/// stack command.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum StackCommandType {
  /// ### STACK START
  StackStart = 0xF3,

  /// ### STACK END
  StackEnd = 0xF4,

  /// ### VME READ
  VmeRead = 0x12,

  /// ### READ TO ACCU
  ReadToAccu = 0x14,

  /// ### VME WRITE
  VmeWrite = 0x23,

  /// ### VME BLOCK READ
  VmeBlockRead = 0x32,

  /// ### WRITE SPECIAL
  WriteSpecial = 0xC1,

  /// ### WRITE MARKER
  WriteMarker = 0xC2,

  /// ### WAIT CLOCKS
  WaitClocks = 0xC4,

  /// ### MASK SHIFT ACCU
  MaskShiftAccu = 0xC5,

  /// ### SIGNAL ACCU
  SignalAccu = 0xC6,

  /// ### COMPARE LOOP ACCU
  CompareLoopAccu = 0xC7,

  /// ### SET ACCU
  SetAccu = 0xC8,

  /// ### CUSTOM
  Custom = 0xCC,
}

/// ## STACK COMMAND
///
/// One command of the controller's stack opcode set.
///
/// A stack is an ordered sequence of these, executed by the controller from
/// stack memory each time the bound trigger fires. Commands that read the
/// VME bus contribute words to the output frame the stack produces; the
/// accumulator commands manipulate a single controller-internal register
/// used for handshake polling.
#[derive(Clone, Debug, PartialEq)]
pub enum StackCommand {
  /// ### VME READ
  ///
  /// A single VME read cycle. The produced word enters the output frame.
  /// The `slow` flag selects the low-latency-relaxed bus timing some
  /// modules require for internal registers.
  VmeRead {
    address: u32,
    amod: AddressModifier,
    width: DataWidth,
    slow: bool,
  },

  /// ### VME WRITE
  ///
  /// A single VME write cycle. Produces no output words.
  VmeWrite {
    address: u32,
    value: u32,
    amod: AddressModifier,
    width: DataWidth,
  },

  /// ### VME BLOCK READ
  ///
  /// A block transfer of up to 65535 transfers. The produced words are
  /// emitted as one or more [Block Read] frames inside the stack's output.
  ///
  /// - `fifo`: do not increment the VME address between transfers; used
  ///   for modules exposing their event memory at a single FIFO address.
  /// - `swapped`: swap the two 32-bit halves of each 64-bit transfer;
  ///   used for big-endian block devices.
  /// - `rate`: the source-synchronous rate, meaningful only with the
  ///   [2eSST] modifier.
  ///
  /// [Block Read]: crate::frame::FrameType::BlockRead
  /// [2eSST]:      AddressModifier::Blk2eSst64
  VmeBlockRead {
    address: u32,
    amod: AddressModifier,
    transfers: u16,
    fifo: bool,
    swapped: bool,
    rate: Blk2eSstRate,
  },

  /// ### WRITE MARKER
  ///
  /// Inserts a sentinel word verbatim into the output frame. Used to tag
  /// module boundaries and to make readout output self-checking.
  WriteMarker { value: u32 },

  /// ### WRITE SPECIAL
  ///
  /// Inserts a controller-generated special value (timestamp, accumulator)
  /// selected by a 24-bit code into the output frame.
  WriteSpecial { value: u32 },

  /// ### WAIT CLOCKS
  ///
  /// Stalls stack execution for a 24-bit count of controller clock cycles.
  WaitClocks { clocks: u32 },

  /// ### SET ACCU
  ///
  /// Loads the accumulator with an immediate value.
  SetAccu { value: u32 },

  /// ### MASK SHIFT ACCU
  ///
  /// Applies `accu = rotate_left(accu & mask, rotate)`. The rotate distance
  /// is 6 bits.
  MaskShiftAccu { mask: u32, rotate: u8 },

  /// ### READ TO ACCU
  ///
  /// A single VME read cycle whose result loads the accumulator instead of
  /// entering the output frame.
  ReadToAccu {
    address: u32,
    amod: AddressModifier,
    width: DataWidth,
    slow: bool,
  },

  /// ### COMPARE LOOP ACCU
  ///
  /// Compares the accumulator against `value`; while the comparison fails,
  /// the controller re-executes the previous command (normally a
  /// [Read To Accu]) and compares again, up to `limit` iterations. A limit
  /// of 0 selects the controller's configured default. On limit exhaustion
  /// the stack aborts and the output frame carries the SyntaxError flag.
  ///
  /// [Read To Accu]: StackCommand::ReadToAccu
  CompareLoopAccu {
    comparator: AccuComparator,
    value: u32,
    limit: u32,
  },

  /// ### SIGNAL ACCU
  ///
  /// Pulses the accumulator value onto the controller's internal signal
  /// lines, for cross-stack and trigger-unit handshakes.
  SignalAccu,

  /// ### CUSTOM
  ///
  /// Raw words injected verbatim into the encoded stack. The word count is
  /// limited to 16 bits. Escape hatch for firmware features without a
  /// builder method.
  Custom { words: Vec<u32> },
}

impl StackCommand {
  /// ### COMMAND TYPE
  pub fn command_type(&self) -> StackCommandType {
    match self {
      StackCommand::VmeRead { .. } => StackCommandType::VmeRead,
      StackCommand::VmeWrite { .. } => StackCommandType::VmeWrite,
      StackCommand::VmeBlockRead { .. } => StackCommandType::VmeBlockRead,
      StackCommand::WriteMarker { .. } => StackCommandType::WriteMarker,
      StackCommand::WriteSpecial { .. } => StackCommandType::WriteSpecial,
      StackCommand::WaitClocks { .. } => StackCommandType::WaitClocks,
      StackCommand::SetAccu { .. } => StackCommandType::SetAccu,
      StackCommand::MaskShiftAccu { .. } => StackCommandType::MaskShiftAccu,
      StackCommand::ReadToAccu { .. } => StackCommandType::ReadToAccu,
      StackCommand::CompareLoopAccu { .. } => StackCommandType::CompareLoopAccu,
      StackCommand::SignalAccu => StackCommandType::SignalAccu,
      StackCommand::Custom { .. } => StackCommandType::Custom,
    }
  }

  /// ### ENCODED WORD COUNT
  ///
  /// The number of 32-bit words this command encodes to, including the
  /// opcode word.
  pub fn encoded_len(&self) -> usize {
    match self {
      StackCommand::VmeRead { .. } | StackCommand::ReadToAccu { .. } => 2,
      StackCommand::VmeWrite { .. } => 3,
      StackCommand::VmeBlockRead { .. } => 3,
      StackCommand::WriteMarker { .. } => 2,
      StackCommand::WriteSpecial { .. } => 1,
      StackCommand::WaitClocks { .. } => 1,
      StackCommand::SetAccu { .. } => 2,
      StackCommand::MaskShiftAccu { .. } => 2,
      StackCommand::CompareLoopAccu { .. } => 3,
      StackCommand::SignalAccu => 1,
      StackCommand::Custom { words } => 1 + words.len(),
    }
  }

  /// ### ENCODE COMMAND
  ///
  /// Appends this command's encoded words to `out`.
  pub fn encode(&self, out: &mut Vec<u32>) {
    let op: u32 = (u8::from(self.command_type()) as u32) << 24;
    match *self {
      StackCommand::VmeRead { address, amod, width, slow }
      | StackCommand::ReadToAccu { address, amod, width, slow } => {
        out.push(op | (u8::from(amod) as u32) << 16 | (u8::from(width) as u32) << 8 | slow as u32);
        out.push(address);
      }
      StackCommand::VmeWrite { address, value, amod, width } => {
        out.push(op | (u8::from(amod) as u32) << 16 | (u8::from(width) as u32) << 8);
        out.push(address);
        out.push(value);
      }
      StackCommand::VmeBlockRead { address, amod, transfers, fifo, swapped, rate } => {
        out.push(
          op
          | (u8::from(amod) as u32) << 16
          | (u8::from(rate) as u32) << 4
          | (swapped as u32) << 1
          | fifo as u32,
        );
        out.push(transfers as u32);
        out.push(address);
      }
      StackCommand::WriteMarker { value } => {
        out.push(op);
        out.push(value);
      }
      StackCommand::WriteSpecial { value } => {
        out.push(op | (value & 0x00FF_FFFF));
      }
      StackCommand::WaitClocks { clocks } => {
        out.push(op | (clocks & 0x00FF_FFFF));
      }
      StackCommand::SetAccu { value } => {
        out.push(op);
        out.push(value);
      }
      StackCommand::MaskShiftAccu { mask, rotate } => {
        out.push(op | (rotate & 0x3F) as u32);
        out.push(mask);
      }
      StackCommand::CompareLoopAccu { comparator, value, limit } => {
        out.push(op | u8::from(comparator) as u32);
        out.push(value);
        out.push(limit);
      }
      StackCommand::SignalAccu => {
        out.push(op);
      }
      StackCommand::Custom { ref words } => {
        out.push(op | words.len() as u32 & 0xFFFF);
        out.extend_from_slice(words);
      }
    }
  }

  /// ### DECODE COMMAND
  ///
  /// Decodes one command from the front of `words`, returning the command
  /// and the number of words consumed.
  pub fn decode(words: &[u32]) -> Result<(StackCommand, usize), DecodeError> {
    let first: u32 = *words.first().ok_or(DecodeError::TruncatedCommand(0))?;
    let opcode: u8 = (first >> 24) as u8;
    let ty: StackCommandType = StackCommandType::try_from(opcode)
      .map_err(|_| DecodeError::UnknownOpcode(opcode))?;

    let arg = |index: usize| -> Result<u32, DecodeError> {
      words.get(index).copied().ok_or(DecodeError::TruncatedCommand(opcode))
    };
    let amod_of = |word: u32| -> Result<AddressModifier, DecodeError> {
      AddressModifier::try_from((word >> 16) as u8)
        .map_err(|_| DecodeError::InvalidField { field: "address modifier", value: (word >> 16) as u8 })
    };
    let width_of = |word: u32| -> Result<DataWidth, DecodeError> {
      DataWidth::try_from((word >> 8) as u8)
        .map_err(|_| DecodeError::InvalidField { field: "data width", value: (word >> 8) as u8 })
    };

    match ty {
      StackCommandType::StackStart | StackCommandType::StackEnd => {
        // Delimiters are handled by the stack decoder, not here.
        Err(DecodeError::UnknownOpcode(opcode))
      }
      StackCommandType::VmeRead | StackCommandType::ReadToAccu => {
        let command = if ty == StackCommandType::VmeRead {
          StackCommand::VmeRead { address: arg(1)?, amod: amod_of(first)?, width: width_of(first)?, slow: first & 1 != 0 }
        } else {
          StackCommand::ReadToAccu { address: arg(1)?, amod: amod_of(first)?, width: width_of(first)?, slow: first & 1 != 0 }
        };
        Ok((command, 2))
      }
      StackCommandType::VmeWrite => Ok((
        StackCommand::VmeWrite { address: arg(1)?, value: arg(2)?, amod: amod_of(first)?, width: width_of(first)? },
        3,
      )),
      StackCommandType::VmeBlockRead => Ok((
        StackCommand::VmeBlockRead {
          address: arg(2)?,
          amod: amod_of(first)?,
          transfers: arg(1)? as u16,
          fifo: first & 1 != 0,
          swapped: first & 2 != 0,
          rate: Blk2eSstRate::try_from((first >> 4) as u8 & 0x3)
            .map_err(|_| DecodeError::InvalidField { field: "2eSST rate", value: (first >> 4) as u8 & 0x3 })?,
        },
        3,
      )),
      StackCommandType::WriteMarker => Ok((StackCommand::WriteMarker { value: arg(1)? }, 2)),
      StackCommandType::WriteSpecial => Ok((StackCommand::WriteSpecial { value: first & 0x00FF_FFFF }, 1)),
      StackCommandType::WaitClocks => Ok((StackCommand::WaitClocks { clocks: first & 0x00FF_FFFF }, 1)),
      StackCommandType::SetAccu => Ok((StackCommand::SetAccu { value: arg(1)? }, 2)),
      StackCommandType::MaskShiftAccu => Ok((
        StackCommand::MaskShiftAccu { mask: arg(1)?, rotate: (first & 0x3F) as u8 },
        2,
      )),
      StackCommandType::CompareLoopAccu => Ok((
        StackCommand::CompareLoopAccu {
          comparator: AccuComparator::try_from(first as u8)
            .map_err(|_| DecodeError::InvalidField { field: "comparator", value: first as u8 })?,
          value: arg(1)?,
          limit: arg(2)?,
        },
        3,
      )),
      StackCommandType::SignalAccu => Ok((StackCommand::SignalAccu, 1)),
      StackCommandType::Custom => {
        let count: usize = (first & 0xFFFF) as usize;
        if words.len() < 1 + count {
          return Err(DecodeError::TruncatedCommand(opcode));
        }
        Ok((StackCommand::Custom { words: words[1..1 + count].to_vec() }, 1 + count))
      }
    }
  }

  /// ### OUTPUT WORD ESTIMATE
  ///
  /// The number of data words this command contributes to the stack's
  /// output frame when it executes without error. Block reads count their
  /// full transfer payload in 32-bit words.
  pub fn output_words(&self) -> usize {
    match *self {
      StackCommand::VmeRead { .. } => 1,
      StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => 1,
      StackCommand::VmeBlockRead { amod, transfers, .. } => match amod {
        AddressModifier::Blt32 => transfers as usize,
        // 64-bit transfers yield two output words each.
        _ => transfers as usize * 2,
      },
      _ => 0,
    }
  }
}

/// ## STACK COMMAND BUILDER
///
/// An ordered, named sequence of [Stack Command]s destined for one
/// [Output Pipe].
///
/// The builder validates commands as they are added, encodes the finished
/// stack with [Encode Stack], and decodes binary stacks back into commands
/// with [Decode Stack]. Encoding and decoding are exact inverses for every
/// stack the builder accepts.
///
/// [Stack Command]: StackCommand
/// [Output Pipe]:   OutputPipe
/// [Encode Stack]:  StackCommandBuilder::encode
/// [Decode Stack]:  StackCommandBuilder::decode
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackCommandBuilder {
  name: String,
  output_pipe: OutputPipe,
  commands: Vec<StackCommand>,
}

impl StackCommandBuilder {
  /// ### NEW BUILDER
  pub fn new(name: &str) -> Self {
    StackCommandBuilder {
      name: name.to_string(),
      output_pipe: OutputPipe::Data,
      commands: vec![],
    }
  }

  /// ### NAME
  pub fn name(&self) -> &str {
    &self.name
  }

  /// ### OUTPUT PIPE
  pub fn output_pipe(&self) -> OutputPipe {
    self.output_pipe
  }

  /// ### SET OUTPUT PIPE
  pub fn set_output_pipe(&mut self, pipe: OutputPipe) -> &mut Self {
    self.output_pipe = pipe;
    self
  }

  /// ### COMMANDS
  pub fn commands(&self) -> &[StackCommand] {
    &self.commands
  }

  /// ### ADD COMMAND
  ///
  /// Appends an already-constructed command without additional validation.
  pub fn add_command(&mut self, command: StackCommand) -> &mut Self {
    self.commands.push(command);
    self
  }

  /// ### ADD VME READ
  pub fn add_vme_read(
    &mut self,
    address: u32,
    amod: AddressModifier,
    width: DataWidth,
    slow: bool,
  ) -> Result<&mut Self, CompileError> {
    if amod.is_block() {
      return Err(CompileError::InvalidAddressModifier { amod, command: "read" });
    }
    self.commands.push(StackCommand::VmeRead { address, amod, width, slow });
    Ok(self)
  }

  /// ### ADD VME WRITE
  pub fn add_vme_write(
    &mut self,
    address: u32,
    value: u32,
    amod: AddressModifier,
    width: DataWidth,
  ) -> Result<&mut Self, CompileError> {
    if amod.is_block() {
      return Err(CompileError::InvalidAddressModifier { amod, command: "write" });
    }
    self.commands.push(StackCommand::VmeWrite { address, value, amod, width });
    Ok(self)
  }

  /// ### ADD VME BLOCK READ
  pub fn add_vme_block_read(
    &mut self,
    address: u32,
    amod: AddressModifier,
    transfers: u32,
    fifo: bool,
  ) -> Result<&mut Self, CompileError> {
    self.add_block(address, amod, transfers, fifo, false, Blk2eSstRate::default())
  }

  /// ### ADD VME BLOCK READ SWAPPED
  ///
  /// A 64-bit block read with the two 32-bit halves of each transfer
  /// swapped. Only the 64-bit modifiers transfer in pairs, so only
  /// [MBLT64] and [2eSST] are accepted.
  ///
  /// [MBLT64]: AddressModifier::Mblt64
  /// [2eSST]:  AddressModifier::Blk2eSst64
  pub fn add_vme_block_read_swapped(
    &mut self,
    address: u32,
    amod: AddressModifier,
    transfers: u32,
    fifo: bool,
    rate: Blk2eSstRate,
  ) -> Result<&mut Self, CompileError> {
    if !matches!(amod, AddressModifier::Mblt64 | AddressModifier::Blk2eSst64) {
      return Err(CompileError::InvalidAddressModifier { amod, command: "block read swapped" });
    }
    self.add_block(address, amod, transfers, fifo, true, rate)
  }

  /// ### ADD 2eSST BLOCK READ
  pub fn add_vme_block_read_2esst(
    &mut self,
    address: u32,
    rate: Blk2eSstRate,
    transfers: u32,
    fifo: bool,
  ) -> Result<&mut Self, CompileError> {
    self.add_block(address, AddressModifier::Blk2eSst64, transfers, fifo, false, rate)
  }

  fn add_block(
    &mut self,
    address: u32,
    amod: AddressModifier,
    transfers: u32,
    fifo: bool,
    swapped: bool,
    rate: Blk2eSstRate,
  ) -> Result<&mut Self, CompileError> {
    if !amod.is_block() {
      return Err(CompileError::InvalidAddressModifier { amod, command: "block read" });
    }
    if transfers > u16::MAX as u32 {
      return Err(CompileError::TransferCountOverflow { given: transfers, max: u16::MAX as u32 });
    }
    self.commands.push(StackCommand::VmeBlockRead {
      address,
      amod,
      transfers: transfers as u16,
      fifo,
      swapped,
      rate,
    });
    Ok(self)
  }

  /// ### ADD WRITE MARKER
  pub fn add_write_marker(&mut self, value: u32) -> &mut Self {
    self.commands.push(StackCommand::WriteMarker { value });
    self
  }

  /// ### ADD WRITE SPECIAL
  pub fn add_write_special(&mut self, value: u32) -> &mut Self {
    self.commands.push(StackCommand::WriteSpecial { value: value & 0x00FF_FFFF });
    self
  }

  /// ### ADD WAIT CLOCKS
  pub fn add_wait_clocks(&mut self, clocks: u32) -> &mut Self {
    self.commands.push(StackCommand::WaitClocks { clocks: clocks & 0x00FF_FFFF });
    self
  }

  /// ### ADD SET ACCU
  pub fn add_set_accu(&mut self, value: u32) -> &mut Self {
    self.commands.push(StackCommand::SetAccu { value });
    self
  }

  /// ### ADD MASK SHIFT ACCU
  pub fn add_mask_shift_accu(&mut self, mask: u32, rotate: u8) -> &mut Self {
    self.commands.push(StackCommand::MaskShiftAccu { mask, rotate: rotate & 0x3F });
    self
  }

  /// ### ADD READ TO ACCU
  pub fn add_read_to_accu(
    &mut self,
    address: u32,
    amod: AddressModifier,
    width: DataWidth,
    slow: bool,
  ) -> Result<&mut Self, CompileError> {
    if amod.is_block() {
      return Err(CompileError::InvalidAddressModifier { amod, command: "read to accu" });
    }
    self.commands.push(StackCommand::ReadToAccu { address, amod, width, slow });
    Ok(self)
  }

  /// ### ADD COMPARE LOOP ACCU
  pub fn add_compare_loop_accu(&mut self, comparator: AccuComparator, value: u32, limit: u32) -> &mut Self {
    self.commands.push(StackCommand::CompareLoopAccu { comparator, value, limit });
    self
  }

  /// ### ADD SIGNAL ACCU
  pub fn add_signal_accu(&mut self) -> &mut Self {
    self.commands.push(StackCommand::SignalAccu);
    self
  }

  /// ### ADD CUSTOM
  pub fn add_custom(&mut self, words: Vec<u32>) -> Result<&mut Self, CompileError> {
    if words.len() > u16::MAX as usize {
      return Err(CompileError::TransferCountOverflow {
        given: words.len() as u32,
        max: u16::MAX as u32,
      });
    }
    self.commands.push(StackCommand::Custom { words });
    Ok(self)
  }

  /// ### ENCODED WORD COUNT
  ///
  /// The size of the encoded stack in 32-bit words, including the
  /// StackStart and StackEnd delimiters.
  pub fn encoded_len(&self) -> usize {
    2 + self.commands.iter().map(StackCommand::encoded_len).sum::<usize>()
  }

  /// ### ENCODE STACK
  ///
  /// Produces the binary stack: a StackStart word carrying the output pipe,
  /// the encoded commands, and a StackEnd word. Byte-identical output is
  /// guaranteed for identical input.
  pub fn encode(&self) -> Result<Vec<u32>, CompileError> {
    let len: usize = self.encoded_len();
    let max: usize = STACK_MEMORY_WORDS - IMMEDIATE_STACK_RESERVED_WORDS;
    if len > max {
      return Err(CompileError::StackTooLong { len, max });
    }
    let mut out: Vec<u32> = Vec::with_capacity(len);
    out.push((u8::from(StackCommandType::StackStart) as u32) << 24 | (u8::from(self.output_pipe) as u32) << 16);
    for command in &self.commands {
      command.encode(&mut out);
    }
    out.push((u8::from(StackCommandType::StackEnd) as u32) << 24);
    Ok(out)
  }

  /// ### DECODE STACK
  ///
  /// Reverses [Encode Stack]. The input must be bracketed by StackStart and
  /// StackEnd words.
  ///
  /// [Encode Stack]: StackCommandBuilder::encode
  pub fn decode(name: &str, words: &[u32]) -> Result<Self, DecodeError> {
    let first: u32 = *words.first().ok_or(DecodeError::MissingStackStart)?;
    if (first >> 24) as u8 != u8::from(StackCommandType::StackStart) {
      return Err(DecodeError::MissingStackStart);
    }
    let last: u32 = *words.last().ok_or(DecodeError::MissingStackEnd)?;
    if (last >> 24) as u8 != u8::from(StackCommandType::StackEnd) {
      return Err(DecodeError::MissingStackEnd);
    }
    let output_pipe: OutputPipe = OutputPipe::try_from((first >> 16) as u8)
      .map_err(|_| DecodeError::InvalidField { field: "output pipe", value: (first >> 16) as u8 })?;

    let mut builder: StackCommandBuilder = StackCommandBuilder::new(name);
    builder.set_output_pipe(output_pipe);

    let mut rest: &[u32] = &words[1..words.len() - 1];
    while !rest.is_empty() {
      let (command, consumed) = StackCommand::decode(rest)?;
      builder.add_command(command);
      rest = &rest[consumed..];
    }
    Ok(builder)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn all_commands() -> Vec<StackCommand> {
    vec![
      StackCommand::VmeRead { address: 0x6008, amod: AddressModifier::A32, width: DataWidth::D16, slow: false },
      StackCommand::VmeRead { address: 0x6008, amod: AddressModifier::A16, width: DataWidth::D32, slow: true },
      StackCommand::VmeWrite { address: 0x603A, value: 1, amod: AddressModifier::A32, width: DataWidth::D16 },
      StackCommand::VmeBlockRead {
        address: 0x0100_0000,
        amod: AddressModifier::Mblt64,
        transfers: 100,
        fifo: true,
        swapped: false,
        rate: Blk2eSstRate::Rate160MB,
      },
      StackCommand::VmeBlockRead {
        address: 0x0200_0000,
        amod: AddressModifier::Blk2eSst64,
        transfers: 0xFFFF,
        fifo: false,
        swapped: true,
        rate: Blk2eSstRate::Rate320MB,
      },
      StackCommand::WriteMarker { value: 0x87654321 },
      StackCommand::WriteSpecial { value: 2 },
      StackCommand::WaitClocks { clocks: 24 },
      StackCommand::SetAccu { value: 0xDEADBEEF },
      StackCommand::MaskShiftAccu { mask: 0x0000_FFFF, rotate: 16 },
      StackCommand::ReadToAccu { address: 0x1000, amod: AddressModifier::A32, width: DataWidth::D32, slow: false },
      StackCommand::CompareLoopAccu { comparator: AccuComparator::Eq, value: 1, limit: 0 },
      StackCommand::SignalAccu,
      StackCommand::Custom { words: vec![0x11111111, 0x22222222] },
    ]
  }

  #[test]
  fn command_encode_decode_roundtrip() {
    for command in all_commands() {
      let mut words: Vec<u32> = vec![];
      command.encode(&mut words);
      assert_eq!(words.len(), command.encoded_len(), "{command:?}");
      let (decoded, consumed) = StackCommand::decode(&words).unwrap();
      assert_eq!(consumed, words.len(), "{command:?}");
      assert_eq!(decoded, command);
    }
  }

  #[test]
  fn stack_encode_decode_roundtrip() {
    let mut builder: StackCommandBuilder = StackCommandBuilder::new("readout");
    for command in all_commands() {
      builder.add_command(command);
    }
    let words: Vec<u32> = builder.encode().unwrap();
    assert_eq!(words.len(), builder.encoded_len());
    let decoded: StackCommandBuilder = StackCommandBuilder::decode("readout", &words).unwrap();
    assert_eq!(decoded, builder);
  }

  #[test]
  fn encode_is_deterministic() {
    let mut builder: StackCommandBuilder = StackCommandBuilder::new("x");
    builder
      .add_vme_block_read(0x01000000, AddressModifier::Mblt64, 100, true)
      .unwrap()
      .add_vme_write(0x6034, 1, AddressModifier::A32, DataWidth::D16)
      .unwrap();
    assert_eq!(builder.encode().unwrap(), builder.encode().unwrap());
  }

  #[test]
  fn block_read_rejects_single_cycle_modifier() {
    let mut builder: StackCommandBuilder = StackCommandBuilder::new("x");
    let err = builder.add_vme_block_read(0, AddressModifier::A32, 1, true).unwrap_err();
    assert!(matches!(err, CompileError::InvalidAddressModifier { .. }));
  }

  #[test]
  fn read_rejects_block_modifier() {
    let mut builder: StackCommandBuilder = StackCommandBuilder::new("x");
    let err = builder.add_vme_read(0, AddressModifier::Blt32, DataWidth::D32, false).unwrap_err();
    assert!(matches!(err, CompileError::InvalidAddressModifier { .. }));
  }

  #[test]
  fn transfer_count_overflow() {
    let mut builder: StackCommandBuilder = StackCommandBuilder::new("x");
    let err = builder.add_vme_block_read(0, AddressModifier::Blt32, 0x10000, true).unwrap_err();
    assert_eq!(err, CompileError::TransferCountOverflow { given: 0x10000, max: 0xFFFF });
  }

  #[test]
  fn oversized_stack_fails_to_encode() {
    let mut builder: StackCommandBuilder = StackCommandBuilder::new("x");
    for _ in 0..STACK_MEMORY_WORDS {
      builder.add_write_marker(0);
    }
    assert!(matches!(builder.encode().unwrap_err(), CompileError::StackTooLong { .. }));
  }

  #[test]
  fn decode_rejects_garbage() {
    assert_eq!(
      StackCommandBuilder::decode("x", &[0xAB00_0000]).unwrap_err(),
      DecodeError::MissingStackStart,
    );
    let start: u32 = 0xF301_0000;
    assert_eq!(
      StackCommandBuilder::decode("x", &[start, 0x1209_0200]).unwrap_err(),
      DecodeError::MissingStackEnd,
    );
    // Truncated read inside the bracket.
    assert_eq!(
      StackCommandBuilder::decode("x", &[start, 0x1209_0200, 0xF400_0000]).unwrap_err(),
      DecodeError::TruncatedCommand(0x12),
    );
  }

  #[test]
  fn block_read_output_word_counts() {
    let blt = StackCommand::VmeBlockRead {
      address: 0,
      amod: AddressModifier::Blt32,
      transfers: 10,
      fifo: true,
      swapped: false,
      rate: Blk2eSstRate::Rate160MB,
    };
    assert_eq!(blt.output_words(), 10);
    let mblt = StackCommand::VmeBlockRead {
      address: 0,
      amod: AddressModifier::Mblt64,
      transfers: 10,
      fifo: true,
      swapped: false,
      rate: Blk2eSstRate::Rate160MB,
    };
    assert_eq!(mblt.output_words(), 20);
  }
}

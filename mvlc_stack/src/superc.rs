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

//! # SUPER COMMANDS
//!
//! The host-side command language of the register channel. Unlike stack
//! commands, super commands never touch the VME bus: they read and write the
//! controller's own registers, which is also how encoded stacks are written
//! into stack memory.
//!
//! ---------------------------------------------------------------------------
//!
//! A request is a *command buffer*: a [Buffer Start] word, a [Reference Word]
//! echoed back verbatim in the response, the command words, and a
//! [Buffer End] word. The controller answers every buffer with one
//! [Super Frame] mirroring the request words and carrying read results after
//! each [Read Local] word.
//!
//! Super command words carry a 16-bit opcode in bits 16–31 and an immediate
//! in bits 0–15:
//!
//! | Opcode | Command | Argument words |
//! |---|---|---|
//! | 0xF100 | [Buffer Start] | - |
//! | 0xF200 | [Buffer End] | - |
//! | 0x0101 | [Reference Word] | - (reference in bits 0–15) |
//! | 0x0102 | [Read Local] | address |
//! | 0x0204 | [Write Local] | address, value |
//!
//! [Super Frame]:    crate::frame::FrameType::SuperFrame
//! [Buffer Start]:   SuperCommandType::CmdBufferStart
//! [Buffer End]:     SuperCommandType::CmdBufferEnd
//! [Reference Word]: SuperCommandType::ReferenceWord
//! [Read Local]:     SuperCommandType::ReadLocal
//! [Write Local]:    SuperCommandType::WriteLocal

use crate::{CompileError, IMMEDIATE_STACK_RESERVED_WORDS, STACK_MEMORY_BEGIN, STACK_MEMORY_WORDS};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ## SUPER COMMAND TYPE
///
/// The opcode in bits 16–31 of a super command word.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum SuperCommandType {
  /// ### COMMAND BUFFER START
  CmdBufferStart = 0xF100,

  /// ### COMMAND BUFFER END
  CmdBufferEnd = 0xF200,

  /// ### REFERENCE WORD
  ReferenceWord = 0x0101,

  /// ### READ LOCAL
  ReadLocal = 0x0102,

  /// ### WRITE LOCAL
  WriteLocal = 0x0204,
}

/// ## SUPER COMMAND
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SuperCommand {
  /// ### REFERENCE WORD
  ///
  /// An arbitrary 16-bit tag mirrored back in the response, used to match
  /// responses to requests.
  ReferenceWord { reference: u16 },

  /// ### READ LOCAL
  ///
  /// Reads one controller register; the response carries the value after
  /// the mirrored command word.
  ReadLocal { address: u16 },

  /// ### WRITE LOCAL
  ///
  /// Writes one controller register.
  WriteLocal { address: u16, value: u32 },
}

impl SuperCommand {
  /// ### ENCODE COMMAND
  pub fn encode(&self, out: &mut Vec<u32>) {
    match *self {
      SuperCommand::ReferenceWord { reference } => {
        out.push((u16::from(SuperCommandType::ReferenceWord) as u32) << 16 | reference as u32);
      }
      SuperCommand::ReadLocal { address } => {
        out.push((u16::from(SuperCommandType::ReadLocal) as u32) << 16);
        out.push(address as u32);
      }
      SuperCommand::WriteLocal { address, value } => {
        out.push((u16::from(SuperCommandType::WriteLocal) as u32) << 16);
        out.push(address as u32);
        out.push(value);
      }
    }
  }
}

/// ## MAKE COMMAND BUFFER
///
/// Wraps super commands into the framed request buffer the controller
/// parses: BufferStart, ReferenceWord, the commands, BufferEnd.
pub fn make_command_buffer(reference: u16, commands: &[SuperCommand]) -> Vec<u32> {
  let mut out: Vec<u32> = vec![(u16::from(SuperCommandType::CmdBufferStart) as u32) << 16];
  SuperCommand::ReferenceWord { reference }.encode(&mut out);
  for command in commands {
    command.encode(&mut out);
  }
  out.push((u16::from(SuperCommandType::CmdBufferEnd) as u32) << 16);
  out
}

/// ## UPLOAD CHUNK WORDS
///
/// Maximum number of words in one upload command buffer. Stacks whose
/// upload program exceeds this bound take the long-stack path: the program
/// is split into multiple consecutive buffers, each addressing its own
/// region of stack memory.
pub const UPLOAD_CHUNK_WORDS: usize = 768;

/// ## STACK MEMORY OFFSET OF
///
/// The stack-memory word offset at which the stack for the given readout
/// stack id is uploaded. Readout stacks are packed above the reserved
/// immediate-stack area in fixed-size slots.
pub fn stack_memory_offset(stack_id: u8) -> u16 {
  let slot_words: usize = (STACK_MEMORY_WORDS - IMMEDIATE_STACK_RESERVED_WORDS) / crate::READOUT_STACK_COUNT;
  (IMMEDIATE_STACK_RESERVED_WORDS + stack_id as usize * slot_words) as u16
}

/// ## BUILD UPLOAD PROGRAM
///
/// Produces the command buffers which write an encoded stack into stack
/// memory word-by-word starting at `start_offset`. The result is one buffer
/// for short stacks and several for long ones; execute them in order on the
/// register channel.
pub fn build_upload_program(
  stack_words: &[u32],
  start_offset: u16,
  reference: u16,
) -> Result<Vec<Vec<u32>>, CompileError> {
  if start_offset as usize + stack_words.len() > STACK_MEMORY_WORDS {
    return Err(CompileError::StackTooLong {
      len: stack_words.len(),
      max: STACK_MEMORY_WORDS - start_offset as usize,
    });
  }

  // Each WriteLocal costs three words; leave headroom for the bracket and
  // reference words when chunking.
  let writes_per_chunk: usize = (UPLOAD_CHUNK_WORDS - 3) / 3;
  let mut buffers: Vec<Vec<u32>> = vec![];

  for (chunk_index, chunk) in stack_words.chunks(writes_per_chunk).enumerate() {
    let base: usize = start_offset as usize + chunk_index * writes_per_chunk;
    let commands: Vec<SuperCommand> = chunk.iter().enumerate().map(|(i, &word)| {
      SuperCommand::WriteLocal {
        address: STACK_MEMORY_BEGIN + (base + i) as u16,
        value: word,
      }
    }).collect();
    buffers.push(make_command_buffer(reference.wrapping_add(chunk_index as u16), &commands));
  }

  if buffers.is_empty() {
    buffers.push(make_command_buffer(reference, &[]));
  }
  Ok(buffers)
}

/// ## BUILD STACK UPLOAD
///
/// Convenience wrapper: encodes a [Stack Command Builder] and builds its
/// upload program at the slot of `stack_id`.
///
/// [Stack Command Builder]: crate::StackCommandBuilder
pub fn build_stack_upload(
  builder: &crate::StackCommandBuilder,
  stack_id: u8,
  reference: u16,
) -> Result<Vec<Vec<u32>>, CompileError> {
  let words: Vec<u32> = builder.encode()?;
  build_upload_program(&words, stack_memory_offset(stack_id), reference)
}

/// ## DECODE UPLOAD PROGRAM
///
/// Reverses [build_upload_program]: extracts (address, value) pairs from the
/// WriteLocal commands of the given buffers and reassembles the contiguous
/// stack words. Used to verify uploads in tests and diagnostics.
pub fn decode_upload_program(buffers: &[Vec<u32>]) -> Vec<(u16, u32)> {
  let mut writes: Vec<(u16, u32)> = vec![];
  for buffer in buffers {
    let mut i: usize = 0;
    while i < buffer.len() {
      let word: u32 = buffer[i];
      match SuperCommandType::try_from((word >> 16) as u16) {
        Ok(SuperCommandType::WriteLocal) if i + 2 < buffer.len() => {
          writes.push((buffer[i + 1] as u16, buffer[i + 2]));
          i += 3;
        }
        Ok(SuperCommandType::ReadLocal) => i += 2,
        _ => i += 1,
      }
    }
  }
  writes
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::OutputPipe;

  #[test]
  fn command_buffer_is_bracketed() {
    let buffer: Vec<u32> = make_command_buffer(0xABCD, &[SuperCommand::ReadLocal { address: 0x1100 }]);
    assert_eq!(buffer[0] >> 16, 0xF100);
    assert_eq!(buffer[1], 0x0101_ABCD);
    assert_eq!(buffer[2] >> 16, 0x0102);
    assert_eq!(buffer[3], 0x1100);
    assert_eq!(*buffer.last().unwrap() >> 16, 0xF200);
  }

  #[test]
  fn upload_program_roundtrip() {
    let mut builder = crate::StackCommandBuilder::new("event0");
    builder.set_output_pipe(OutputPipe::Data);
    builder.add_vme_block_read(0x0100_0000, crate::AddressModifier::Mblt64, 100, true).unwrap();
    let stack_words: Vec<u32> = builder.encode().unwrap();

    let buffers: Vec<Vec<u32>> = build_stack_upload(&builder, 1, 1).unwrap();
    assert_eq!(buffers.len(), 1);

    let writes: Vec<(u16, u32)> = decode_upload_program(&buffers);
    let offset: u16 = stack_memory_offset(1);
    for (i, (address, value)) in writes.iter().enumerate() {
      assert_eq!(*address, STACK_MEMORY_BEGIN + offset + i as u16);
      assert_eq!(*value, stack_words[i]);
    }
    assert_eq!(writes.len(), stack_words.len());
  }

  #[test]
  fn long_stack_uploads_in_chunks() {
    let mut builder = crate::StackCommandBuilder::new("long");
    for i in 0..400 {
      builder.add_write_marker(i);
    }
    let stack_words: Vec<u32> = builder.encode().unwrap();
    // 802 words of stack exceed one chunk of WriteLocal commands.
    let buffers: Vec<Vec<u32>> = build_stack_upload(&builder, 0, 7).unwrap();
    assert!(buffers.len() > 1, "expected a chunked long-stack upload");
    for buffer in &buffers {
      assert!(buffer.len() <= UPLOAD_CHUNK_WORDS);
    }
    let words: Vec<u32> = decode_upload_program(&buffers).into_iter().map(|(_, value)| value).collect();
    assert_eq!(words, stack_words);
  }

  #[test]
  fn upload_past_stack_memory_fails() {
    let words: Vec<u32> = vec![0; 64];
    let offset: u16 = (STACK_MEMORY_WORDS - 10) as u16;
    assert!(matches!(
      build_upload_program(&words, offset, 0).unwrap_err(),
      CompileError::StackTooLong { .. },
    ));
  }
}

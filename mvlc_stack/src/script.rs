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

//! # SCRIPT COMMANDS
//!
//! The parsed form of a VME readout script: addresses and values already
//! resolved, one entry per script line. Script text parsing itself lives
//! with the configuration layer; this module only defines the parsed
//! representation and its compilation into a [Stack Command Builder].
//!
//! ---------------------------------------------------------------------------
//!
//! Compilation keeps the script order, flattens [Inline Stack]s, and rejects
//! host-only commands ([Software Delay]) with [Unsupported In Stack].
//! Compiling is pure: identical scripts compile to byte-identical stacks,
//! and [decompile] inverts [compile] for every supported command.
//!
//! [Stack Command Builder]: crate::StackCommandBuilder
//! [Inline Stack]:          ScriptCommand::InlineStack
//! [Software Delay]:        ScriptCommand::SoftwareDelay
//! [Unsupported In Stack]:  crate::CompileError::UnsupportedInStack
//! [compile]:               compile
//! [decompile]:             decompile

use crate::{
  AccuComparator,
  AddressModifier,
  Blk2eSstRate,
  CompileError,
  DataWidth,
  OutputPipe,
  StackCommand,
  StackCommandBuilder,
};
use serde::{Deserialize, Serialize};

/// ## SCRIPT COMMAND
///
/// One resolved command of a VME script. The block transfer variants mirror
/// the script mnemonics (`blt`, `bltfifo`, `mblt`, `mbltfifo`, ...), each
/// pinning its address modifier; the generic [Stack Command] form carries
/// the modifier explicitly instead.
///
/// [Stack Command]: crate::StackCommand
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptCommand {
  /// ### WRITE
  Write { address: u32, value: u32, amod: AddressModifier, width: DataWidth },

  /// ### READ
  Read { address: u32, amod: AddressModifier, width: DataWidth, slow: bool },

  /// ### BLT
  ///
  /// 32-bit block read with address increment.
  Blt { address: u32, transfers: u32 },

  /// ### BLT FIFO
  BltFifo { address: u32, transfers: u32 },

  /// ### MBLT
  ///
  /// 64-bit block read with address increment.
  Mblt { address: u32, transfers: u32 },

  /// ### MBLT FIFO
  MbltFifo { address: u32, transfers: u32 },

  /// ### MBLT SWAPPED
  MbltSwapped { address: u32, transfers: u32 },

  /// ### MBLT SWAPPED FIFO
  MbltSwappedFifo { address: u32, transfers: u32 },

  /// ### 2eSST
  Blk2eSst { address: u32, rate: Blk2eSstRate, transfers: u32 },

  /// ### 2eSST FIFO
  Blk2eSstFifo { address: u32, rate: Blk2eSstRate, transfers: u32 },

  /// ### 2eSST SWAPPED
  Blk2eSstSwapped { address: u32, rate: Blk2eSstRate, transfers: u32 },

  /// ### 2eSST SWAPPED FIFO
  Blk2eSstSwappedFifo { address: u32, rate: Blk2eSstRate, transfers: u32 },

  /// ### MARKER
  Marker { value: u32 },

  /// ### SOFTWARE DELAY
  ///
  /// A host-side delay in milliseconds. Only valid in scripts the host
  /// executes directly; compilation into a stack fails.
  SoftwareDelay { ms: u32 },

  /// ### WAIT CLOCKS
  WaitClocks { clocks: u32 },

  /// ### SET ACCU
  SetAccu { value: u32 },

  /// ### MASK SHIFT ACCU
  MaskShiftAccu { mask: u32, rotate: u8 },

  /// ### READ TO ACCU
  ReadToAccu { address: u32, amod: AddressModifier, width: DataWidth, slow: bool },

  /// ### COMPARE LOOP ACCU
  CompareLoopAccu { comparator: AccuComparator, value: u32, limit: u32 },

  /// ### SIGNAL ACCU
  SignalAccu,

  /// ### WRITE SPECIAL
  WriteSpecial { value: u32 },

  /// ### CUSTOM
  Custom { words: Vec<u32> },

  /// ### INLINE STACK
  ///
  /// A nested command sequence, flattened in place by the compiler.
  InlineStack { commands: Vec<ScriptCommand> },
}

/// ## COMPILE SCRIPT
///
/// Translates a parsed script into a named [Stack Command Builder] writing
/// to the given [Output Pipe].
///
/// [Stack Command Builder]: crate::StackCommandBuilder
/// [Output Pipe]:           crate::OutputPipe
pub fn compile(name: &str, pipe: OutputPipe, script: &[ScriptCommand]) -> Result<StackCommandBuilder, CompileError> {
  let mut builder: StackCommandBuilder = StackCommandBuilder::new(name);
  builder.set_output_pipe(pipe);
  compile_into(&mut builder, script)?;
  Ok(builder)
}

fn compile_into(builder: &mut StackCommandBuilder, script: &[ScriptCommand]) -> Result<(), CompileError> {
  use AddressModifier::{Blt32, Blk2eSst64, Mblt64};

  for command in script {
    match *command {
      ScriptCommand::Write { address, value, amod, width } => {
        builder.add_vme_write(address, value, amod, width)?;
      }
      ScriptCommand::Read { address, amod, width, slow } => {
        builder.add_vme_read(address, amod, width, slow)?;
      }
      ScriptCommand::Blt { address, transfers } => {
        builder.add_vme_block_read(address, Blt32, transfers, false)?;
      }
      ScriptCommand::BltFifo { address, transfers } => {
        builder.add_vme_block_read(address, Blt32, transfers, true)?;
      }
      ScriptCommand::Mblt { address, transfers } => {
        builder.add_vme_block_read(address, Mblt64, transfers, false)?;
      }
      ScriptCommand::MbltFifo { address, transfers } => {
        builder.add_vme_block_read(address, Mblt64, transfers, true)?;
      }
      ScriptCommand::MbltSwapped { address, transfers } => {
        builder.add_vme_block_read_swapped(address, Mblt64, transfers, false, Blk2eSstRate::default())?;
      }
      ScriptCommand::MbltSwappedFifo { address, transfers } => {
        builder.add_vme_block_read_swapped(address, Mblt64, transfers, true, Blk2eSstRate::default())?;
      }
      ScriptCommand::Blk2eSst { address, rate, transfers } => {
        builder.add_vme_block_read_2esst(address, rate, transfers, false)?;
      }
      ScriptCommand::Blk2eSstFifo { address, rate, transfers } => {
        builder.add_vme_block_read_2esst(address, rate, transfers, true)?;
      }
      ScriptCommand::Blk2eSstSwapped { address, rate, transfers } => {
        builder.add_vme_block_read_swapped(address, Blk2eSst64, transfers, false, rate)?;
      }
      ScriptCommand::Blk2eSstSwappedFifo { address, rate, transfers } => {
        builder.add_vme_block_read_swapped(address, Blk2eSst64, transfers, true, rate)?;
      }
      ScriptCommand::Marker { value } => {
        builder.add_write_marker(value);
      }
      ScriptCommand::SoftwareDelay { .. } => {
        return Err(CompileError::UnsupportedInStack("software_delay"));
      }
      ScriptCommand::WaitClocks { clocks } => {
        builder.add_wait_clocks(clocks);
      }
      ScriptCommand::SetAccu { value } => {
        builder.add_set_accu(value);
      }
      ScriptCommand::MaskShiftAccu { mask, rotate } => {
        builder.add_mask_shift_accu(mask, rotate);
      }
      ScriptCommand::ReadToAccu { address, amod, width, slow } => {
        builder.add_read_to_accu(address, amod, width, slow)?;
      }
      ScriptCommand::CompareLoopAccu { comparator, value, limit } => {
        builder.add_compare_loop_accu(comparator, value, limit);
      }
      ScriptCommand::SignalAccu => {
        builder.add_signal_accu();
      }
      ScriptCommand::WriteSpecial { value } => {
        builder.add_write_special(value);
      }
      ScriptCommand::Custom { ref words } => {
        builder.add_custom(words.clone())?;
      }
      ScriptCommand::InlineStack { ref commands } => {
        compile_into(builder, commands)?;
      }
    }
  }
  Ok(())
}

/// ## DECOMPILE STACK
///
/// Maps the commands of a [Stack Command Builder] back into script form.
/// Block reads map onto the mnemonic variants their modifier and flags pin,
/// so `decompile(compile(s))` reproduces `s` with inline stacks flattened.
///
/// [Stack Command Builder]: crate::StackCommandBuilder
pub fn decompile(builder: &StackCommandBuilder) -> Vec<ScriptCommand> {
  builder.commands().iter().map(|command| match *command {
    StackCommand::VmeWrite { address, value, amod, width } => {
      ScriptCommand::Write { address, value, amod, width }
    }
    StackCommand::VmeRead { address, amod, width, slow } => {
      ScriptCommand::Read { address, amod, width, slow }
    }
    StackCommand::VmeBlockRead { address, amod, transfers, fifo, swapped, rate } => {
      let transfers: u32 = transfers as u32;
      match (amod, swapped, fifo) {
        (AddressModifier::Blt32, _, false) => ScriptCommand::Blt { address, transfers },
        (AddressModifier::Blt32, _, true) => ScriptCommand::BltFifo { address, transfers },
        (AddressModifier::Mblt64, false, false) => ScriptCommand::Mblt { address, transfers },
        (AddressModifier::Mblt64, false, true) => ScriptCommand::MbltFifo { address, transfers },
        (AddressModifier::Mblt64, true, false) => ScriptCommand::MbltSwapped { address, transfers },
        (AddressModifier::Mblt64, true, true) => ScriptCommand::MbltSwappedFifo { address, transfers },
        (_, false, false) => ScriptCommand::Blk2eSst { address, rate, transfers },
        (_, false, true) => ScriptCommand::Blk2eSstFifo { address, rate, transfers },
        (_, true, false) => ScriptCommand::Blk2eSstSwapped { address, rate, transfers },
        (_, true, true) => ScriptCommand::Blk2eSstSwappedFifo { address, rate, transfers },
      }
    }
    StackCommand::WriteMarker { value } => ScriptCommand::Marker { value },
    StackCommand::WriteSpecial { value } => ScriptCommand::WriteSpecial { value },
    StackCommand::WaitClocks { clocks } => ScriptCommand::WaitClocks { clocks },
    StackCommand::SetAccu { value } => ScriptCommand::SetAccu { value },
    StackCommand::MaskShiftAccu { mask, rotate } => ScriptCommand::MaskShiftAccu { mask, rotate },
    StackCommand::ReadToAccu { address, amod, width, slow } => {
      ScriptCommand::ReadToAccu { address, amod, width, slow }
    }
    StackCommand::CompareLoopAccu { comparator, value, limit } => {
      ScriptCommand::CompareLoopAccu { comparator, value, limit }
    }
    StackCommand::SignalAccu => ScriptCommand::SignalAccu,
    StackCommand::Custom { ref words } => ScriptCommand::Custom { words: words.clone() },
  }).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn single_module_readout_compiles() {
    // mbltfifo a32 0x01000000 100; write a32 d16 0x6034 1
    let script: Vec<ScriptCommand> = vec![
      ScriptCommand::MbltFifo { address: 0x0100_0000, transfers: 100 },
      ScriptCommand::Write { address: 0x6034, value: 1, amod: AddressModifier::A32, width: DataWidth::D16 },
    ];
    let builder: StackCommandBuilder = compile("event0", OutputPipe::Data, &script).unwrap();
    assert_eq!(builder.commands(), &[
      StackCommand::VmeBlockRead {
        address: 0x0100_0000,
        amod: AddressModifier::Mblt64,
        transfers: 100,
        fifo: true,
        swapped: false,
        rate: Blk2eSstRate::Rate160MB,
      },
      StackCommand::VmeWrite { address: 0x6034, value: 1, amod: AddressModifier::A32, width: DataWidth::D16 },
    ]);
  }

  #[test]
  fn accu_compare_loop_compiles() {
    // mvlc_read_to_accu a32 d32 0x1000; mvlc_compare_loop_accu eq 1
    let script: Vec<ScriptCommand> = vec![
      ScriptCommand::ReadToAccu { address: 0x1000, amod: AddressModifier::A32, width: DataWidth::D32, slow: false },
      ScriptCommand::CompareLoopAccu { comparator: AccuComparator::Eq, value: 1, limit: 0 },
    ];
    let builder: StackCommandBuilder = compile("poll", OutputPipe::Data, &script).unwrap();
    assert_eq!(builder.commands(), &[
      StackCommand::ReadToAccu { address: 0x1000, amod: AddressModifier::A32, width: DataWidth::D32, slow: false },
      StackCommand::CompareLoopAccu { comparator: AccuComparator::Eq, value: 1, limit: 0 },
    ]);
  }

  #[test]
  fn software_delay_is_rejected() {
    let script: Vec<ScriptCommand> = vec![ScriptCommand::SoftwareDelay { ms: 100 }];
    assert_eq!(
      compile("x", OutputPipe::Data, &script).unwrap_err(),
      CompileError::UnsupportedInStack("software_delay"),
    );
  }

  #[test]
  fn inline_stacks_flatten() {
    let script: Vec<ScriptCommand> = vec![
      ScriptCommand::Marker { value: 1 },
      ScriptCommand::InlineStack {
        commands: vec![
          ScriptCommand::Marker { value: 2 },
          ScriptCommand::InlineStack { commands: vec![ScriptCommand::Marker { value: 3 }] },
        ],
      },
      ScriptCommand::Marker { value: 4 },
    ];
    let builder: StackCommandBuilder = compile("x", OutputPipe::Data, &script).unwrap();
    let markers: Vec<u32> = builder.commands().iter().map(|command| match command {
      StackCommand::WriteMarker { value } => *value,
      other => panic!("unexpected {other:?}"),
    }).collect();
    assert_eq!(markers, vec![1, 2, 3, 4]);
  }

  fn arb_script_command() -> impl Strategy<Value = ScriptCommand> {
    let amod = prop_oneof![
      Just(AddressModifier::A16),
      Just(AddressModifier::A24),
      Just(AddressModifier::A32),
    ];
    let width = prop_oneof![Just(DataWidth::D16), Just(DataWidth::D32)];
    let rate = prop_oneof![
      Just(Blk2eSstRate::Rate160MB),
      Just(Blk2eSstRate::Rate276MB),
      Just(Blk2eSstRate::Rate320MB),
    ];
    let vme_commands = prop_oneof![
      (any::<u32>(), any::<u32>(), amod.clone(), width.clone())
        .prop_map(|(address, value, amod, width)| ScriptCommand::Write { address, value, amod, width }),
      (any::<u32>(), amod.clone(), width.clone(), any::<bool>())
        .prop_map(|(address, amod, width, slow)| ScriptCommand::Read { address, amod, width, slow }),
      (any::<u32>(), 0u32..=0xFFFF).prop_map(|(address, transfers)| ScriptCommand::Blt { address, transfers }),
      (any::<u32>(), 0u32..=0xFFFF).prop_map(|(address, transfers)| ScriptCommand::MbltFifo { address, transfers }),
      (any::<u32>(), 0u32..=0xFFFF).prop_map(|(address, transfers)| ScriptCommand::MbltSwapped { address, transfers }),
      (any::<u32>(), rate, 0u32..=0xFFFF)
        .prop_map(|(address, rate, transfers)| ScriptCommand::Blk2eSstFifo { address, rate, transfers }),
    ];
    let control_commands = prop_oneof![
      any::<u32>().prop_map(|value| ScriptCommand::Marker { value }),
      (0u32..0x0100_0000).prop_map(|clocks| ScriptCommand::WaitClocks { clocks }),
      any::<u32>().prop_map(|value| ScriptCommand::SetAccu { value }),
      (any::<u32>(), 0u8..64).prop_map(|(mask, rotate)| ScriptCommand::MaskShiftAccu { mask, rotate }),
      (any::<u32>(), amod, width, any::<bool>())
        .prop_map(|(address, amod, width, slow)| ScriptCommand::ReadToAccu { address, amod, width, slow }),
      (any::<u32>(), any::<u32>())
        .prop_map(|(value, limit)| ScriptCommand::CompareLoopAccu { comparator: AccuComparator::Eq, value, limit }),
      Just(ScriptCommand::SignalAccu),
      (0u32..0x0100_0000).prop_map(|value| ScriptCommand::WriteSpecial { value }),
      proptest::collection::vec(any::<u32>(), 0..8).prop_map(|words| ScriptCommand::Custom { words }),
    ];
    prop_oneof![vme_commands, control_commands]
  }

  proptest! {
    // decompile(compile(s)) == s, and the binary encoding round-trips, for
    // arbitrary supported scripts.
    #[test]
    fn compile_decompile_roundtrip(script in proptest::collection::vec(arb_script_command(), 0..40)) {
      let builder = compile("prop", OutputPipe::Data, &script).unwrap();
      prop_assert_eq!(&decompile(&builder), &script);

      let words = builder.encode().unwrap();
      let decoded = StackCommandBuilder::decode("prop", &words).unwrap();
      prop_assert_eq!(decoded, builder);
    }
  }
}

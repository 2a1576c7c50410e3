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

//! # CRATE CONFIGURATION
//!
//! The resolved description of one crate: which readout events exist, what
//! triggers them, which modules they read out and with which scripts. The
//! same structure is serialized as JSON into every listfile, making archives
//! self-describing.
//!
//! The per-module *readout structure*, meaning how many fixed words precede
//! and follow the dynamic block part, is not configured by hand; it is derived
//! from the module's readout script, so the parser always agrees with the
//! compiled stack.

use mvlc_stack::{script, trigger::TriggerCondition, CompileError, OutputPipe, ScriptCommand, StackCommand, StackCommandBuilder};
use serde::{Deserialize, Serialize};

/// ## MODULE CONFIG
///
/// One VME module inside a readout event.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ModuleConfig {
  /// ### MODULE NAME
  pub name: String,

  /// ### READOUT SCRIPT
  ///
  /// Executed as part of the event's stack on every trigger.
  pub readout: Vec<ScriptCommand>,

  /// ### RESET SCRIPT
  ///
  /// Executed by the host at run start, before triggers are armed.
  #[serde(default)]
  pub reset: Vec<ScriptCommand>,
}

/// ## EVENT CONFIG
///
/// One readout event: a trigger binding plus an ordered module list.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventConfig {
  /// ### EVENT NAME
  pub name: String,

  /// ### TRIGGER CONDITION
  pub trigger: TriggerCondition,

  /// ### ENABLED
  #[serde(default = "default_true")]
  pub enabled: bool,

  /// ### MODULES
  pub modules: Vec<ModuleConfig>,
}

fn default_true() -> bool {
  true
}

/// ## CRATE CONFIG
///
/// The complete resolved configuration of one crate.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CrateConfig {
  /// ### CRATE ID
  ///
  /// Distinguishes crates in multi-crate setups; echoed in every parser
  /// callback.
  pub crate_id: u8,

  /// ### EVENTS
  ///
  /// Up to [READOUT STACK COUNT] events; the event index is the position
  /// in this list and the bound stack id is `index + 1` (stack 0 is the
  /// immediate stack).
  ///
  /// [READOUT STACK COUNT]: mvlc_stack::READOUT_STACK_COUNT
  pub events: Vec<EventConfig>,

  /// ### GLOBAL START SCRIPT
  ///
  /// Executed by the host before any event start scripts.
  #[serde(default)]
  pub global_start: Vec<ScriptCommand>,

  /// ### MULTICAST START SCRIPT
  ///
  /// Executed by the host after the global start script, addressed at the
  /// modules' multicast address.
  #[serde(default)]
  pub multicast_start: Vec<ScriptCommand>,

  /// ### MULTICAST STOP SCRIPT
  #[serde(default)]
  pub multicast_stop: Vec<ScriptCommand>,

  /// ### GLOBAL STOP SCRIPT
  #[serde(default)]
  pub global_stop: Vec<ScriptCommand>,
}

impl CrateConfig {
  /// ### FROM JSON
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  /// ### TO JSON
  pub fn to_json(&self) -> String {
    serde_json::to_string_pretty(self).expect("config model serializes")
  }

  /// ### COMPILE EVENT STACK
  ///
  /// Compiles the readout scripts of the event's modules, in module order,
  /// into one stack writing to the data pipe.
  pub fn compile_event_stack(&self, event_index: usize) -> Result<StackCommandBuilder, CompileError> {
    let event: &EventConfig = &self.events[event_index];
    let mut builder: StackCommandBuilder = StackCommandBuilder::new(&event.name);
    builder.set_output_pipe(OutputPipe::Data);
    for module in &event.modules {
      let compiled: StackCommandBuilder = script::compile(&module.name, OutputPipe::Data, &module.readout)?;
      for command in compiled.commands() {
        builder.add_command(command.clone());
      }
    }
    Ok(builder)
  }

  /// ### READOUT STRUCTURE
  ///
  /// Derives the per-module parser structure of every event from the
  /// readout scripts.
  pub fn readout_structure(&self) -> Result<Vec<EventReadoutStructure>, CompileError> {
    self.events.iter().map(event_readout_structure).collect()
  }
}

/// ## MODULE READOUT STRUCTURE
///
/// The shape a module's data takes inside a readout event: a fixed-length
/// prefix, an optional dynamic block part, and a fixed-length suffix.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ModuleReadoutStructure {
  /// ### PREFIX WORDS
  pub prefix_len: u16,

  /// ### HAS DYNAMIC PART
  pub has_dynamic: bool,

  /// ### SUFFIX WORDS
  pub suffix_len: u16,
}

impl ModuleReadoutStructure {
  /// ### IS EMPTY
  ///
  /// A module that never produces output words.
  pub fn is_empty(&self) -> bool {
    self.prefix_len == 0 && !self.has_dynamic && self.suffix_len == 0
  }
}

/// ## EVENT READOUT STRUCTURE
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventReadoutStructure {
  /// ### MODULES
  pub modules: Vec<ModuleReadoutStructure>,
}

/// ## EVENT READOUT STRUCTURE OF
///
/// Derives the parser structure of one event. Output-producing commands
/// before a module's first block read count toward its prefix, block reads
/// form the dynamic part, and output-producing commands after the first
/// block read count toward its suffix.
pub fn event_readout_structure(event: &EventConfig) -> Result<EventReadoutStructure, CompileError> {
  let mut modules: Vec<ModuleReadoutStructure> = Vec::with_capacity(event.modules.len());
  for module in &event.modules {
    let compiled: StackCommandBuilder = script::compile(&module.name, OutputPipe::Data, &module.readout)?;
    let mut structure: ModuleReadoutStructure = ModuleReadoutStructure::default();
    for command in compiled.commands() {
      match command {
        StackCommand::VmeBlockRead { .. } => structure.has_dynamic = true,
        other => {
          let words: u16 = other.output_words() as u16;
          if structure.has_dynamic {
            structure.suffix_len += words;
          } else {
            structure.prefix_len += words;
          }
        }
      }
    }
    modules.push(structure);
  }
  Ok(EventReadoutStructure { modules })
}

#[cfg(test)]
mod tests {
  use super::*;
  use mvlc_stack::{AddressModifier, DataWidth};

  fn single_module_event() -> EventConfig {
    EventConfig {
      name: "event0".to_string(),
      trigger: TriggerCondition::Irq { level: 3, iack: true },
      enabled: true,
      modules: vec![ModuleConfig {
        name: "madc32".to_string(),
        readout: vec![
          ScriptCommand::Read { address: 0x6030, amod: AddressModifier::A32, width: DataWidth::D16, slow: false },
          ScriptCommand::MbltFifo { address: 0x0100_0000, transfers: 100 },
          ScriptCommand::Marker { value: 0x8765_4321 },
          ScriptCommand::Write { address: 0x6034, value: 1, amod: AddressModifier::A32, width: DataWidth::D16 },
        ],
        reset: vec![],
      }],
    }
  }

  #[test]
  fn readout_structure_derivation() {
    let structure: EventReadoutStructure = event_readout_structure(&single_module_event()).unwrap();
    assert_eq!(structure.modules, vec![ModuleReadoutStructure {
      prefix_len: 1,
      has_dynamic: true,
      suffix_len: 1,
    }]);
  }

  #[test]
  fn config_json_roundtrip() {
    let config: CrateConfig = CrateConfig {
      crate_id: 2,
      events: vec![single_module_event()],
      ..Default::default()
    };
    let json: String = config.to_json();
    let back: CrateConfig = CrateConfig::from_json(&json).unwrap();
    assert_eq!(back, config);
  }

  #[test]
  fn event_stack_concatenates_modules() {
    let mut config: CrateConfig = CrateConfig::default();
    let mut event: EventConfig = single_module_event();
    event.modules.push(ModuleConfig {
      name: "mdpp16".to_string(),
      readout: vec![ScriptCommand::BltFifo { address: 0x0200_0000, transfers: 32 }],
      reset: vec![],
    });
    config.events.push(event);

    let builder: StackCommandBuilder = config.compile_event_stack(0).unwrap();
    assert_eq!(builder.commands().len(), 5);
    assert!(matches!(builder.commands()[4], StackCommand::VmeBlockRead { address: 0x0200_0000, .. }));
  }
}

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

//! # TRIGGER ENCODING
//!
//! Each readout stack binds to one trigger source through an 8-bit trigger
//! register. This module computes the register values from the higher-level
//! [Trigger Condition] of an event configuration.
//!
//! ---------------------------------------------------------------------------
//!
//! Register value layout: trigger type in bits 3–4, IRQ level in bits 0–2.
//! Periodic, trigger-I/O, and slave triggers all resolve to the
//! stack-external type; what differs between them is how the trigger I/O
//! unit is programmed to pulse the stack's external input, which happens
//! outside the trigger register.
//!
//! [Trigger Condition]: TriggerCondition

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// ## TRIGGER TYPE
///
/// The trigger source selector in bits 3–4 of a trigger register value.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum TriggerType {
  /// ### NO TRIGGER
  ///
  /// The stack is not armed.
  NoTrigger = 0,

  /// ### IRQ WITH IACK
  ///
  /// VME interrupt with an interrupt-acknowledge cycle.
  IrqWithIack = 1,

  /// ### IRQ WITHOUT IACK
  IrqNoIack = 2,

  /// ### EXTERNAL
  ///
  /// The stack's external input, pulsed by the trigger I/O unit.
  External = 3,
}

/// ## TRIGGER CONDITION
///
/// The configured trigger source of one readout event.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerCondition {
  /// ### NONE
  ///
  /// The event is defined but never triggered by the controller; used for
  /// events driven purely by host-side scripts.
  None,

  /// ### IRQ
  ///
  /// VME interrupt level 1–7, with or without the acknowledge cycle.
  Irq { level: u8, iack: bool },

  /// ### PERIODIC
  ///
  /// Fired by a stack timer every `period_ms` milliseconds.
  Periodic { period_ms: u32 },

  /// ### TRIGGER IO
  ///
  /// Fired by the trigger I/O unit's routing network.
  TriggerIo,

  /// ### SLAVE TRIGGER
  ///
  /// Fired by one of the controller's slave trigger inputs.
  SlaveTrigger { index: u8 },
}

/// ## TRIGGER REGISTER
///
/// The trigger register address of the given readout stack.
pub fn trigger_register(stack_id: u8) -> u16 {
  0x1100 + stack_id as u16 * 4
}

/// ## STACK OFFSET REGISTER
///
/// The register holding the stack-memory word offset of the given readout
/// stack.
pub fn stack_offset_register(stack_id: u8) -> u16 {
  0x1200 + stack_id as u16 * 4
}

/// ## DAQ START REGISTER
///
/// Writing 1 arms the configured triggers, writing 0 disarms them.
pub const DAQ_START_REGISTER: u16 = 0x1300;

/// ## IMMEDIATE EXEC REGISTER
///
/// Writing 1 executes the stack currently uploaded at the immediate slot
/// (stack-memory offset 0), producing its output on the command pipe.
pub const IMMEDIATE_EXEC_REGISTER: u16 = 0x1308;

/// ## COMPUTE TRIGGER VALUE
///
/// Encodes a [Trigger Condition] into its 8-bit trigger register value.
///
/// Periodic, trigger-I/O, and slave conditions intentionally produce the
/// identical stack-external encoding.
///
/// [Trigger Condition]: TriggerCondition
pub fn compute_trigger_value(condition: TriggerCondition) -> u8 {
  match condition {
    TriggerCondition::None => u8::from(TriggerType::NoTrigger) << 3,
    TriggerCondition::Irq { level, iack } => {
      let trigger_type: TriggerType = if iack { TriggerType::IrqWithIack } else { TriggerType::IrqNoIack };
      u8::from(trigger_type) << 3 | (level & 0x7)
    }
    TriggerCondition::Periodic { .. }
    | TriggerCondition::TriggerIo
    | TriggerCondition::SlaveTrigger { .. } => u8::from(TriggerType::External) << 3,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn irq_levels() {
    assert_eq!(compute_trigger_value(TriggerCondition::Irq { level: 3, iack: true }), 1 << 3 | 3);
    assert_eq!(compute_trigger_value(TriggerCondition::Irq { level: 7, iack: false }), 2 << 3 | 7);
  }

  #[test]
  fn stack_external_identity() {
    // Periodic, trigger-I/O, and slave triggers are all stack-external.
    let periodic: u8 = compute_trigger_value(TriggerCondition::Periodic { period_ms: 1000 });
    let trigger_io: u8 = compute_trigger_value(TriggerCondition::TriggerIo);
    let slave: u8 = compute_trigger_value(TriggerCondition::SlaveTrigger { index: 2 });
    assert_eq!(periodic, trigger_io);
    assert_eq!(trigger_io, slave);
    assert_eq!(periodic, 3 << 3);
  }

  #[test]
  fn register_addresses_do_not_collide() {
    for stack_id in 0..crate::READOUT_STACK_COUNT as u8 {
      assert!(trigger_register(stack_id) < stack_offset_register(0));
      assert_ne!(trigger_register(stack_id), DAQ_START_REGISTER);
      assert_ne!(stack_offset_register(stack_id), DAQ_START_REGISTER);
    }
  }
}

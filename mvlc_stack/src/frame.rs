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

//! # FRAME WIRE FORMAT
//!
//! Everything the controller emits on its output pipes is framed: a single
//! 32-bit header word announces the type, flags, and word length of the
//! record that follows, making the stream self-delimiting and seekable from
//! any header.
//!
//! ---------------------------------------------------------------------------
//!
//! Header word layout (little-endian on the wire):
//!
//! | Bits | Field |
//! |---|---|
//! | 24–31 | [Frame Type] |
//! | 16–23 | [Frame Flags] (stack frames also carry the stack id in bits 19–22) |
//! | 0–15  | length of the frame payload in words, excluding the header |
//!
//! [System Event] headers repurpose flag bits 16–22 as the
//! [System Event Subtype], keeping bit 23 as the Continue flag so oversized
//! system events can span multiple frames like any other record.
//!
//! [Frame Type]:           FrameType
//! [Frame Flags]:          FrameFlags
//! [System Event]:         FrameType::SystemEvent
//! [System Event Subtype]: SystemEventSubtype

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ## FRAME TYPE
///
/// The discriminating byte in bits 24–31 of a frame header.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
  /// ### SUPER FRAME
  ///
  /// Response to a register-channel command buffer; contains the mirrored
  /// request and any read results.
  SuperFrame = 0xF1,

  /// ### STACK FRAME
  ///
  /// The start of the output of one readout stack execution, i.e. one
  /// readout event.
  StackFrame = 0xF3,

  /// ### BLOCK READ FRAME
  ///
  /// Payload of one VME block transfer, nested inside a stack frame.
  BlockRead = 0xF5,

  /// ### STACK ERROR FRAME
  ///
  /// Out-of-band notification of a stack execution error.
  StackError = 0xF7,

  /// ### STACK CONTINUATION FRAME
  ///
  /// Continuation of a [Stack Frame] that exceeded the transport's frame
  /// size limit.
  ///
  /// [Stack Frame]: FrameType::StackFrame
  StackContinuation = 0xF9,

  /// ### SYSTEM EVENT FRAME
  ///
  /// Out-of-band record produced by the host side, not the controller:
  /// timeticks, run boundaries, embedded configuration.
  SystemEvent = 0xFA,
}

bitflags! {
  /// ## FRAME FLAGS
  ///
  /// The flag bits of a frame header. Stack frames use bits 19–22 for the
  /// stack id, so the flag bits proper are the three error bits and
  /// Continue.
  #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
  pub struct FrameFlags: u8 {
    /// ### TIMEOUT
    ///
    /// A VME cycle inside the frame timed out. For block reads this is the
    /// normal end-of-transfer indication from the module.
    const TIMEOUT = 0x01;

    /// ### BUS ERROR
    const BUS_ERROR = 0x02;

    /// ### SYNTAX ERROR
    ///
    /// The controller rejected part of the executing stack, or a
    /// compare-loop exhausted its iteration limit.
    const SYNTAX_ERROR = 0x04;

    /// ### CONTINUE
    ///
    /// More data for this logical record follows in the next frame.
    const CONTINUE = 0x80;
  }
}

/// ## SYSTEM EVENT SUBTYPE
///
/// The subtype field (header bits 16–22) of a [System Event] frame.
///
/// [System Event]: FrameType::SystemEvent
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SystemEventSubtype {
  /// ### TIME TICK
  ///
  /// Synthetic once-per-second record inserted by the readout side, giving
  /// replays a wall-clock timebase.
  TimeTick = 0x01,

  /// ### BEGIN RUN
  BeginRun = 0x02,

  /// ### END RUN
  EndRun = 0x03,

  /// ### CRATE CONFIG
  ///
  /// The serialized controller configuration, embedded at the start of a
  /// listfile.
  CrateConfig = 0x04,

  /// ### VME CONFIG
  ///
  /// The serialized experiment configuration as padded JSON.
  VmeConfig = 0x05,

  /// ### UNIX TIMESTAMP
  UnixTimestamp = 0x06,

  /// ### END OF FILE
  ///
  /// Terminates a listfile; nothing follows.
  EndOfFile = 0x77,
}

/// ## STACK ID MASK
///
/// Mask and shift of the stack id within the flags byte of stack frames.
const STACK_ID_SHIFT: u32 = 19;
const STACK_ID_MASK: u32 = 0xF;

/// ## SYSTEM SUBTYPE MASK
///
/// Mask of the subtype within the flags byte of system event frames.
const SYSTEM_SUBTYPE_MASK: u8 = 0x7F;

/// ## FRAME INFO
///
/// The decoded fields of one frame header word.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInfo {
  /// ### FRAME TYPE
  pub frame_type: FrameType,

  /// ### PAYLOAD LENGTH
  ///
  /// Length of the payload in words, excluding the header itself.
  pub len: u16,

  /// ### FLAGS
  pub flags: FrameFlags,

  /// ### STACK ID
  ///
  /// Meaningful for [Stack Frame], [Stack Continuation], and [Stack Error]
  /// headers; zero otherwise.
  ///
  /// [Stack Frame]:        FrameType::StackFrame
  /// [Stack Continuation]: FrameType::StackContinuation
  /// [Stack Error]:        FrameType::StackError
  pub stack_id: u8,
}

impl FrameInfo {
  /// ### CONTINUES
  ///
  /// Whether the Continue flag is set.
  pub fn continues(&self) -> bool {
    self.flags.contains(FrameFlags::CONTINUE)
  }

  /// ### HAS ERROR FLAGS
  pub fn has_error_flags(&self) -> bool {
    self.flags.intersects(FrameFlags::TIMEOUT | FrameFlags::BUS_ERROR | FrameFlags::SYNTAX_ERROR)
  }
}

/// ## MAKE FRAME HEADER
pub fn make_frame_header(frame_type: FrameType, len: u16, flags: FrameFlags) -> u32 {
  (u8::from(frame_type) as u32) << 24 | (flags.bits() as u32) << 16 | len as u32
}

/// ## MAKE STACK FRAME HEADER
pub fn make_stack_frame_header(frame_type: FrameType, stack_id: u8, len: u16, flags: FrameFlags) -> u32 {
  make_frame_header(frame_type, len, flags) | ((stack_id as u32 & STACK_ID_MASK) << STACK_ID_SHIFT)
}

/// ## MAKE SYSTEM EVENT HEADER
pub fn make_system_event_header(subtype: SystemEventSubtype, len: u16, continues: bool) -> u32 {
  let mut flags: u8 = u8::from(subtype) & SYSTEM_SUBTYPE_MASK;
  if continues {
    flags |= FrameFlags::CONTINUE.bits();
  }
  (u8::from(FrameType::SystemEvent) as u32) << 24 | (flags as u32) << 16 | len as u32
}

/// ## EXTRACT FRAME INFO
///
/// Decodes a header word. Returns [None] when the type byte is not a known
/// frame type, which is how parsers recognize resynchronization points.
pub fn extract_frame_info(header: u32) -> Option<FrameInfo> {
  let frame_type: FrameType = FrameType::try_from((header >> 24) as u8).ok()?;
  let raw_flags: u8 = (header >> 16) as u8;
  let (flags, stack_id) = match frame_type {
    FrameType::StackFrame | FrameType::StackContinuation | FrameType::StackError => (
      FrameFlags::from_bits_truncate(raw_flags & !((STACK_ID_MASK as u8) << (STACK_ID_SHIFT - 16))),
      ((header >> STACK_ID_SHIFT) & STACK_ID_MASK) as u8,
    ),
    FrameType::SystemEvent => (
      FrameFlags::from_bits_truncate(raw_flags & FrameFlags::CONTINUE.bits()),
      0,
    ),
    _ => (FrameFlags::from_bits_truncate(raw_flags), 0),
  };
  Some(FrameInfo {
    frame_type,
    len: header as u16,
    flags,
    stack_id,
  })
}

/// ## EXTRACT SYSTEM EVENT SUBTYPE
///
/// Decodes the subtype of a [System Event] header, or [None] if the header
/// is not a system event or carries an unknown subtype.
///
/// [System Event]: FrameType::SystemEvent
pub fn extract_system_event_subtype(header: u32) -> Option<SystemEventSubtype> {
  if (header >> 24) as u8 != u8::from(FrameType::SystemEvent) {
    return None;
  }
  SystemEventSubtype::try_from((header >> 16) as u8 & SYSTEM_SUBTYPE_MASK).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_roundtrip() {
    let header: u32 = make_stack_frame_header(FrameType::StackFrame, 3, 100, FrameFlags::CONTINUE);
    let info: FrameInfo = extract_frame_info(header).unwrap();
    assert_eq!(info.frame_type, FrameType::StackFrame);
    assert_eq!(info.len, 100);
    assert_eq!(info.stack_id, 3);
    assert!(info.continues());
    assert!(!info.has_error_flags());
  }

  #[test]
  fn error_flags_do_not_bleed_into_stack_id() {
    let header: u32 = make_stack_frame_header(
      FrameType::StackFrame,
      0xF,
      0,
      FrameFlags::TIMEOUT | FrameFlags::BUS_ERROR | FrameFlags::SYNTAX_ERROR,
    );
    let info: FrameInfo = extract_frame_info(header).unwrap();
    assert_eq!(info.stack_id, 0xF);
    assert!(info.has_error_flags());
    assert!(!info.continues());
  }

  #[test]
  fn system_event_subtype_roundtrip() {
    for subtype in [
      SystemEventSubtype::TimeTick,
      SystemEventSubtype::BeginRun,
      SystemEventSubtype::EndRun,
      SystemEventSubtype::CrateConfig,
      SystemEventSubtype::VmeConfig,
      SystemEventSubtype::UnixTimestamp,
      SystemEventSubtype::EndOfFile,
    ] {
      let header: u32 = make_system_event_header(subtype, 7, false);
      assert_eq!(extract_system_event_subtype(header), Some(subtype));
      let info: FrameInfo = extract_frame_info(header).unwrap();
      assert_eq!(info.frame_type, FrameType::SystemEvent);
      assert_eq!(info.len, 7);
      assert!(!info.continues());
    }
  }

  #[test]
  fn continued_system_event() {
    let header: u32 = make_system_event_header(SystemEventSubtype::VmeConfig, 0xFFFF, true);
    assert!(extract_frame_info(header).unwrap().continues());
    assert_eq!(extract_system_event_subtype(header), Some(SystemEventSubtype::VmeConfig));
  }

  #[test]
  fn unknown_type_is_not_a_frame() {
    assert_eq!(extract_frame_info(0x1234_5678), None);
    assert_eq!(extract_frame_info(0x0000_0000), None);
  }
}

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

//! # USB TRANSPORT
//!
//! The controller's USB interface presents two bulk endpoints: a command
//! pipe for register transactions and a data pipe carrying the readout
//! stream. Both are plain byte streams: a single data read may deliver a
//! partial frame or several frames back to back, and frames routinely span
//! reads; cross-read reassembly belongs to the [Readout Parser].
//!
//! The transport is generic over the endpoint streams so the same code
//! drives a kernel USB character device, a vendor bridge exposed as a
//! socket, or an in-memory loopback in tests. Read timeouts are a property
//! of the streams themselves and must be configured before constructing the
//! transport; 100 ms is the conventional data-pipe timeout.
//!
//! [Readout Parser]: crate::parser::ReadoutParser

use crate::transport::{
  bytes_to_words,
  check_mirror,
  words_to_bytes,
  Transport,
  TransportError,
};
use mvlc_stack::frame::{extract_frame_info, FrameFlags, FrameInfo, FrameType};
use mvlc_stack::superc::{build_upload_program, make_command_buffer, SuperCommand};
use mvlc_stack::trigger::IMMEDIATE_EXEC_REGISTER;
use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

/// ## USB TRANSPORT
///
/// A connected controller reached over its USB bulk endpoints.
pub struct UsbTransport<C, D> {
  command_pipe: Mutex<CommandPipe<C>>,
  data_pipe: Mutex<DataPipe<D>>,
}

struct CommandPipe<C> {
  stream: C,
  next_reference: u16,
}

struct DataPipe<D> {
  stream: D,
  /// Bytes of a trailing partial word from the previous read.
  carry: Vec<u8>,
}

impl<C: Read + Write + Send, D: Read + Send> UsbTransport<C, D> {
  /// ### NEW TRANSPORT
  ///
  /// Takes ownership of the two endpoint streams, read timeouts already
  /// configured by the caller.
  pub fn new(command_stream: C, data_stream: D) -> Self {
    UsbTransport {
      command_pipe: Mutex::new(CommandPipe { stream: command_stream, next_reference: 1 }),
      data_pipe: Mutex::new(DataPipe { stream: data_stream, carry: vec![] }),
    }
  }
}

impl<C: Read + Write + Send> CommandPipe<C> {
  fn transact(&mut self, commands: &[SuperCommand]) -> Result<Vec<u32>, TransportError> {
    let reference: u16 = self.next_reference;
    self.next_reference = self.next_reference.wrapping_add(1).max(1);

    let request: Vec<u32> = make_command_buffer(reference, commands);
    self.stream.write_all(&words_to_bytes(&request)).map_err(map_command_io)?;

    let (info, payload) = self.read_frame()?;
    if info.frame_type != FrameType::SuperFrame {
      return Err(TransportError::SyntaxError);
    }
    if info.flags.contains(FrameFlags::SYNTAX_ERROR) {
      return Err(TransportError::SyntaxError);
    }
    check_mirror(&request, &payload)?;
    Ok(payload)
  }

  fn read_frame(&mut self) -> Result<(FrameInfo, Vec<u32>), TransportError> {
    let mut header_bytes: [u8; 4] = [0; 4];
    self.stream.read_exact(&mut header_bytes).map_err(map_command_io)?;
    let header: u32 = u32::from_le_bytes(header_bytes);
    let info: FrameInfo = extract_frame_info(header)
      .ok_or_else(|| TransportError::ConnectionLost(format!("unframed word 0x{header:08X} on the command pipe")))?;
    let mut payload_bytes: Vec<u8> = vec![0; info.len as usize * 4];
    self.stream.read_exact(&mut payload_bytes).map_err(map_command_io)?;
    Ok((info, bytes_to_words(&payload_bytes)))
  }
}

fn map_command_io(error: std::io::Error) -> TransportError {
  match error.kind() {
    ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
    ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
      TransportError::ConnectionLost(error.to_string())
    }
    _ => TransportError::Io(error),
  }
}

impl<C: Read + Write + Send, D: Read + Send> Transport for UsbTransport<C, D> {
  fn execute_super_buffer(&self, commands: &[SuperCommand]) -> Result<Vec<u32>, TransportError> {
    let mut pipe = self.command_pipe.lock().expect("command pipe mutex");
    pipe.transact(commands)
  }

  fn execute_immediate_stack(&self, stack_words: &[u32]) -> Result<Vec<u32>, TransportError> {
    let mut pipe = self.command_pipe.lock().expect("command pipe mutex");

    // Upload at the immediate slot, then trigger execution. Holding the
    // lock across both steps keeps the stack response adjacent to its
    // trigger on the pipe.
    for buffer in build_upload_program(stack_words, 0, pipe.next_reference)
      .map_err(|e| TransportError::Io(std::io::Error::new(ErrorKind::InvalidInput, e.to_string())))?
    {
      pipe.stream.write_all(&words_to_bytes(&buffer)).map_err(map_command_io)?;
      let (info, payload) = pipe.read_frame()?;
      if info.frame_type != FrameType::SuperFrame || info.flags.contains(FrameFlags::SYNTAX_ERROR) {
        return Err(TransportError::SyntaxError);
      }
      check_mirror(&buffer, &payload)?;
    }
    pipe.transact(&[SuperCommand::WriteLocal { address: IMMEDIATE_EXEC_REGISTER, value: 1 }])?;

    // The stack's own output follows as a frame on the command pipe.
    let (info, payload) = pipe.read_frame()?;
    if info.flags.contains(FrameFlags::SYNTAX_ERROR) {
      return Err(TransportError::SyntaxError);
    }
    if info.flags.contains(FrameFlags::BUS_ERROR) {
      return Err(TransportError::BusError);
    }
    Ok(payload)
  }

  fn read_data(&self, dest: &mut Vec<u32>, max_words: usize, _timeout: Duration) -> Result<usize, TransportError> {
    let mut pipe = self.data_pipe.lock().expect("data pipe mutex");

    let mut bytes: Vec<u8> = std::mem::take(&mut pipe.carry);
    let want: usize = max_words * 4;
    let start: usize = bytes.len();
    bytes.resize(want, 0);

    let read: usize = match pipe.stream.read(&mut bytes[start..]) {
      Ok(0) => return Err(TransportError::ConnectionLost("data pipe closed".to_string())),
      Ok(n) => n,
      Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => 0,
      Err(e) => return Err(TransportError::Io(e)),
    };
    bytes.truncate(start + read);

    let whole: usize = bytes.len() / 4 * 4;
    pipe.carry = bytes.split_off(whole);
    dest.extend_from_slice(&bytes_to_words(&bytes));
    Ok(whole / 4)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::mirror_response_of;
  use std::collections::VecDeque;

  /// A scripted command endpoint: answers every written request buffer
  /// with its computed mirror response.
  struct LoopbackEndpoint {
    pending: VecDeque<u8>,
    registers: std::collections::HashMap<u16, u32>,
  }

  impl LoopbackEndpoint {
    fn new() -> Self {
      LoopbackEndpoint { pending: VecDeque::new(), registers: Default::default() }
    }
  }

  impl Write for LoopbackEndpoint {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      let request: Vec<u32> = bytes_to_words(buf);
      let mut payload: Vec<u32> = mirror_response_of(&request, |address| {
        self.registers.get(&address).copied().unwrap_or(0)
      });
      // Apply the writes after mirroring.
      let mut i: usize = 0;
      while i < request.len() {
        if request[i] >> 16 == 0x0204 && i + 2 < request.len() {
          self.registers.insert(request[i + 1] as u16, request[i + 2]);
          i += 3;
        } else {
          i += 1;
        }
      }
      let header: u32 = mvlc_stack::frame::make_frame_header(
        FrameType::SuperFrame,
        payload.len() as u16,
        FrameFlags::empty(),
      );
      let mut frame: Vec<u32> = vec![header];
      frame.append(&mut payload);
      self.pending.extend(words_to_bytes(&frame));
      Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  impl Read for LoopbackEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
      let n: usize = buf.len().min(self.pending.len());
      for slot in buf.iter_mut().take(n) {
        *slot = self.pending.pop_front().unwrap();
      }
      Ok(n)
    }
  }

  #[test]
  fn register_write_then_read() {
    let transport = UsbTransport::new(LoopbackEndpoint::new(), std::io::empty());
    transport.write_register(0x1100, 0x0B).unwrap();
    assert_eq!(transport.read_register(0x1100).unwrap(), 0x0B);
  }

  #[test]
  fn data_reads_handle_partial_words() {
    // Deliver 10 bytes: two whole words and a two-byte carry.
    let stream: std::io::Cursor<Vec<u8>> = std::io::Cursor::new(
      vec![0x11, 0x11, 0x11, 0x11, 0x22, 0x22, 0x22, 0x22, 0x33, 0x33],
    );
    let transport = UsbTransport::new(LoopbackEndpoint::new(), stream);
    let mut words: Vec<u32> = vec![];
    let n: usize = transport.read_data(&mut words, 1024, Duration::from_millis(10)).unwrap();
    assert_eq!(n, 2);
    assert_eq!(words, vec![0x11111111, 0x22222222]);
    // The stream is exhausted; end of stream surfaces as connection loss.
    let result = transport.read_data(&mut words, 1024, Duration::from_millis(10));
    assert!(result.is_err());
  }
}

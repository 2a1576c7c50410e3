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

//! # CONTROLLER TRANSPORT
//!
//! The duplex connection to one controller: a register channel carrying
//! request/response command buffers and a data channel delivering the framed
//! readout stream. USB and Ethernet implement the same [Transport] interface
//! and differ only in framing, which the [Readout Parser] accounts for.
//!
//! ---------------------------------------------------------------------------
//!
//! The register channel speaks the *mirror protocol*: every request buffer
//! is answered by one [Super Frame] whose payload mirrors the request words,
//! with read results inserted after each ReadLocal. [check mirror] verifies
//! the echo before any result is extracted; a mismatch means request and
//! response desynchronized and the connection can no longer be trusted.
//!
//! Register transactions are short and strictly ordered; implementations
//! guard the register channel with a per-connection mutex. The data channel
//! has a single reader by design and is not locked against concurrent use.
//!
//! [Transport]:      Transport
//! [Super Frame]:    mvlc_stack::frame::FrameType::SuperFrame
//! [check mirror]:   check_mirror
//! [Readout Parser]: crate::parser::ReadoutParser

use mvlc_stack::superc::{SuperCommand, SuperCommandType};
use std::time::Duration;
use thiserror::Error;

/// ## TRANSPORT ERROR
#[derive(Debug, Error)]
pub enum TransportError {
  /// ### CONNECTION LOST
  #[error("connection to the controller was lost: {0}")]
  ConnectionLost(String),

  /// ### TIMEOUT
  ///
  /// A register transaction did not complete in time. Timeouts on the data
  /// channel are not errors; [read data] reports them as a zero-length
  /// read.
  ///
  /// [read data]: Transport::read_data
  #[error("register transaction timed out")]
  Timeout,

  /// ### BUS ERROR
  ///
  /// The response frame carried the BusError flag.
  #[error("VME bus error reported by the controller")]
  BusError,

  /// ### SYNTAX ERROR
  ///
  /// The controller rejected the request buffer.
  #[error("the controller rejected the request with a syntax error")]
  SyntaxError,

  /// ### MIRROR MISMATCH
  ///
  /// The response did not echo the request; request/response streams have
  /// desynchronized.
  #[error("mirror mismatch at word {index}: sent 0x{sent:08X}, received 0x{received:08X}")]
  MirrorMismatch { index: usize, sent: u32, received: u32 },

  /// ### SHORT RESPONSE
  #[error("response ended after {got} words, expected {expected}")]
  ShortResponse { got: usize, expected: usize },

  /// ### IO
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl TransportError {
  /// ### IS FATAL
  ///
  /// Whether the run must be terminated. Timeouts during idle polls are
  /// transient; everything else on the register channel is fatal.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, TransportError::Timeout)
  }
}

/// ## TRANSPORT
///
/// A connected controller. All methods are callable from any thread; the
/// register channel serializes internally, the data channel expects a
/// single reader.
pub trait Transport: Send + Sync {
  /// ### EXECUTE SUPER BUFFER
  ///
  /// Sends one command buffer on the register channel and returns the
  /// mirrored response payload after verification.
  fn execute_super_buffer(&self, commands: &[SuperCommand]) -> Result<Vec<u32>, TransportError>;

  /// ### EXECUTE IMMEDIATE STACK
  ///
  /// Uploads an encoded stack to the immediate slot, executes it, and
  /// returns the produced frame payload from the command pipe. Host-side
  /// script execution (init, start, stop scripts) runs through this.
  fn execute_immediate_stack(&self, stack_words: &[u32]) -> Result<Vec<u32>, TransportError>;

  /// ### READ DATA
  ///
  /// Fills `dest` with words from the data channel, waiting up to
  /// `timeout`. Returns the number of words delivered; 0 means the timeout
  /// elapsed without data, which is not an error.
  fn read_data(&self, dest: &mut Vec<u32>, max_words: usize, timeout: Duration) -> Result<usize, TransportError>;

  /// ### WRITE REGISTER
  fn write_register(&self, address: u16, value: u32) -> Result<(), TransportError> {
    self.execute_super_buffer(&[SuperCommand::WriteLocal { address, value }])?;
    Ok(())
  }

  /// ### READ REGISTER
  fn read_register(&self, address: u16) -> Result<u32, TransportError> {
    let response: Vec<u32> = self.execute_super_buffer(&[SuperCommand::ReadLocal { address }])?;
    extract_read_value(&response, address)
  }
}

/// ## MIRROR RESPONSE OF
///
/// Computes the response payload a well-behaved controller produces for a
/// request buffer: the request words mirrored, with the value word of each
/// ReadLocal inserted after its address word. Shared by [check mirror] and
/// by loopback test transports.
///
/// [check mirror]: check_mirror
pub fn mirror_response_of(request: &[u32], read_value: impl Fn(u16) -> u32) -> Vec<u32> {
  let mut response: Vec<u32> = Vec::with_capacity(request.len() + 4);
  let mut i: usize = 0;
  while i < request.len() {
    let word: u32 = request[i];
    response.push(word);
    match SuperCommandType::try_from((word >> 16) as u16) {
      Ok(SuperCommandType::ReadLocal) if i + 1 < request.len() => {
        let address: u16 = request[i + 1] as u16;
        response.push(request[i + 1]);
        response.push(read_value(address));
        i += 2;
      }
      Ok(SuperCommandType::WriteLocal) if i + 2 < request.len() => {
        response.push(request[i + 1]);
        response.push(request[i + 2]);
        i += 3;
      }
      _ => i += 1,
    }
  }
  response
}

/// ## CHECK MIRROR
///
/// Verifies that `response` echoes `request`, skipping over the read-value
/// words the controller inserts. Returns the indices of the inserted read
/// values on success.
pub fn check_mirror(request: &[u32], response: &[u32]) -> Result<Vec<usize>, TransportError> {
  let mut value_indices: Vec<usize> = vec![];
  let mut req: usize = 0;
  let mut resp: usize = 0;
  while req < request.len() {
    let sent: u32 = request[req];
    let received: u32 = *response.get(resp).ok_or(TransportError::ShortResponse {
      got: response.len(),
      expected: resp + 1,
    })?;
    if sent != received {
      return Err(TransportError::MirrorMismatch { index: resp, sent, received });
    }
    if let Ok(SuperCommandType::ReadLocal) = SuperCommandType::try_from((sent >> 16) as u16) {
      // Mirror the address word, then skip the inserted value word.
      let address_resp: usize = resp + 1;
      let sent_addr: u32 = *request.get(req + 1).ok_or(TransportError::ShortResponse {
        got: request.len(),
        expected: req + 2,
      })?;
      let received_addr: u32 = *response.get(address_resp).ok_or(TransportError::ShortResponse {
        got: response.len(),
        expected: address_resp + 1,
      })?;
      if sent_addr != received_addr {
        return Err(TransportError::MirrorMismatch { index: address_resp, sent: sent_addr, received: received_addr });
      }
      let value_index: usize = address_resp + 1;
      if value_index >= response.len() {
        return Err(TransportError::ShortResponse { got: response.len(), expected: value_index + 1 });
      }
      value_indices.push(value_index);
      req += 2;
      resp = value_index + 1;
    } else {
      req += 1;
      resp += 1;
    }
  }
  Ok(value_indices)
}

/// ## WORDS TO BYTES
///
/// Serializes words in wire order (little-endian).
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
  use byteorder::{LittleEndian, WriteBytesExt};
  let mut bytes: Vec<u8> = Vec::with_capacity(words.len() * 4);
  for &word in words {
    bytes.write_u32::<LittleEndian>(word).expect("writing to a Vec cannot fail");
  }
  bytes
}

/// ## BYTES TO WORDS
///
/// Deserializes wire-order bytes; the length must be word-aligned.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
  use byteorder::{ByteOrder, LittleEndian};
  let mut words: Vec<u32> = vec![0; bytes.len() / 4];
  LittleEndian::read_u32_into(&bytes[..words.len() * 4], &mut words);
  words
}

/// ## EXTRACT READ VALUE
///
/// Pulls a read result out of an already-verified response payload: the
/// word following the mirrored ReadLocal of the given address.
pub fn extract_read_value(response: &[u32], address: u16) -> Result<u32, TransportError> {
  let mut i: usize = 0;
  while i < response.len() {
    if SuperCommandType::try_from((response[i] >> 16) as u16) == Ok(SuperCommandType::ReadLocal)
      && response.get(i + 1) == Some(&(address as u32))
    {
      return response
        .get(i + 2)
        .copied()
        .ok_or(TransportError::ShortResponse { got: response.len(), expected: i + 3 });
    }
    i += 1;
  }
  Err(TransportError::ShortResponse { got: response.len(), expected: response.len() + 1 })
}

#[cfg(test)]
mod tests {
  use super::*;
  use mvlc_stack::superc::make_command_buffer;

  #[test]
  fn mirror_roundtrip_with_reads_and_writes() {
    let request: Vec<u32> = make_command_buffer(0x1234, &[
      SuperCommand::WriteLocal { address: 0x1100, value: 0x0B },
      SuperCommand::ReadLocal { address: 0x1100 },
    ]);
    let response: Vec<u32> = mirror_response_of(&request, |_| 0x0B);
    let value_indices: Vec<usize> = check_mirror(&request, &response).unwrap();
    assert_eq!(value_indices.len(), 1);
    assert_eq!(response[value_indices[0]], 0x0B);
  }

  #[test]
  fn mirror_mismatch_is_detected() {
    let request: Vec<u32> = make_command_buffer(1, &[SuperCommand::WriteLocal { address: 0x1100, value: 1 }]);
    let mut response: Vec<u32> = mirror_response_of(&request, |_| 0);
    response[2] ^= 0xFF;
    assert!(matches!(
      check_mirror(&request, &response).unwrap_err(),
      TransportError::MirrorMismatch { .. },
    ));
  }

  #[test]
  fn short_response_is_detected() {
    let request: Vec<u32> = make_command_buffer(1, &[SuperCommand::ReadLocal { address: 0x1100 }]);
    let mut response: Vec<u32> = mirror_response_of(&request, |_| 7);
    response.truncate(response.len() - 2);
    assert!(matches!(
      check_mirror(&request, &response).unwrap_err(),
      TransportError::ShortResponse { .. },
    ));
  }

  #[test]
  fn extract_read_value_finds_the_inserted_word() {
    let address: u16 = 0x1204;
    let request: Vec<u32> = make_command_buffer(0x0042, &[SuperCommand::ReadLocal { address }]);
    let response: Vec<u32> = mirror_response_of(&request, |a| if a == address { 0xCAFE } else { 0 });
    assert_eq!(extract_read_value(&response, address).unwrap(), 0xCAFE);
  }
}

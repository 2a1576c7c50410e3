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

//! # ETHERNET TRANSPORT
//!
//! The controller's Ethernet interface speaks UDP on two ports: command
//! transactions on one, readout data on the other. Unlike USB there is no
//! stream to reassemble at the transport level, since every receive delivers
//! exactly one packet. Packets can be lost, though, so each one begins with two
//! header words that let the parser detect gaps and re-enter the frame
//! structure afterwards.
//!
//! ---------------------------------------------------------------------------
//!
//! Packet header layout:
//!
//! | Word | Bits | Field |
//! |---|---|---|
//! | 0 | 30–31 | packet channel |
//! | 0 | 16–27 | packet number, monotone modulo 4096 per channel |
//! | 0 | 0–12  | payload length in words, excluding the two header words |
//! | 1 | 12–31 | controller timestamp at send time |
//! | 1 | 0–11  | word offset of the next frame header within the payload, [NEXT HEADER NONE] if the payload holds no header |
//!
//! A gap in the packet numbers of a channel means loss; the next-header
//! offset of the following packet is where parsing can resume, skipping the
//! tail of whatever frame the lost packet carried.
//!
//! [NEXT HEADER NONE]: NEXT_HEADER_NONE

use crate::transport::{
  bytes_to_words,
  check_mirror,
  words_to_bytes,
  Transport,
  TransportError,
};
use mvlc_stack::frame::{extract_frame_info, FrameFlags, FrameType};
use mvlc_stack::superc::{build_upload_program, make_command_buffer, SuperCommand};
use mvlc_stack::trigger::IMMEDIATE_EXEC_REGISTER;
use std::io::ErrorKind;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

/// ## COMMAND PORT
pub const ETH_COMMAND_PORT: u16 = 0x8000;

/// ## DATA PORT
pub const ETH_DATA_PORT: u16 = 0x8001;

/// ## PACKET HEADER WORDS
pub const PACKET_HEADER_WORDS: usize = 2;

/// ## PACKET CHANNEL COUNT
pub const PACKET_CHANNEL_COUNT: usize = 2;

/// ## PACKET NUMBER MODULUS
pub const PACKET_NUMBER_MODULUS: u16 = 1 << 12;

/// ## NEXT HEADER NONE
///
/// Sentinel next-header offset: the payload contains no frame header.
pub const NEXT_HEADER_NONE: u16 = 0xFFF;

/// ## MAKE PACKET HEADER 0
pub fn make_packet_header0(channel: u8, packet_number: u16, word_count: u16) -> u32 {
  (channel as u32 & 0x3) << 30
    | (packet_number as u32 % PACKET_NUMBER_MODULUS as u32) << 16
    | word_count as u32 & 0x1FFF
}

/// ## MAKE PACKET HEADER 1
pub fn make_packet_header1(timestamp: u32, next_header_offset: u16) -> u32 {
  (timestamp & 0xF_FFFF) << 12 | (next_header_offset as u32 & 0xFFF)
}

/// ## PACKET CHANNEL
pub fn packet_channel(header0: u32) -> u8 {
  (header0 >> 30) as u8
}

/// ## PACKET NUMBER
pub fn packet_number(header0: u32) -> u16 {
  (header0 >> 16) as u16 & (PACKET_NUMBER_MODULUS - 1)
}

/// ## PACKET WORD COUNT
pub fn packet_word_count(header0: u32) -> u16 {
  header0 as u16 & 0x1FFF
}

/// ## PACKET TIMESTAMP
pub fn packet_timestamp(header1: u32) -> u32 {
  header1 >> 12
}

/// ## NEXT HEADER OFFSET
pub fn next_header_offset(header1: u32) -> u16 {
  header1 as u16 & 0xFFF
}

/// ## PACKET LOSS BETWEEN
///
/// The number of packets lost between two consecutively received packet
/// numbers of one channel, accounting for wraparound.
pub fn packet_loss_between(last: u16, current: u16) -> u16 {
  current.wrapping_sub(last).wrapping_sub(1) % PACKET_NUMBER_MODULUS
}

/// ## ETHERNET TRANSPORT
///
/// A connected controller reached over its two UDP ports.
pub struct EthTransport {
  command: Mutex<CommandChannel>,
  data_socket: UdpSocket,
}

struct CommandChannel {
  socket: UdpSocket,
  next_reference: u16,
}

impl EthTransport {
  /// ### CONNECT
  ///
  /// Resolves `host`, binds two local UDP sockets, and connects them to the
  /// controller's command and data ports. The command socket gets a 500 ms
  /// response timeout; data timeouts are per-read.
  pub fn connect(host: &str) -> Result<Self, TransportError> {
    let resolve = |port: u16| -> Result<std::net::SocketAddr, TransportError> {
      (host, port)
        .to_socket_addrs()
        .map_err(TransportError::Io)?
        .next()
        .ok_or_else(|| TransportError::ConnectionLost(format!("cannot resolve {host}")))
    };

    let command_socket: UdpSocket = UdpSocket::bind("0.0.0.0:0")?;
    command_socket.connect(resolve(ETH_COMMAND_PORT)?)?;
    command_socket.set_read_timeout(Some(Duration::from_millis(500)))?;

    let data_socket: UdpSocket = UdpSocket::bind("0.0.0.0:0")?;
    data_socket.connect(resolve(ETH_DATA_PORT)?)?;

    tracing::info!(host, "connected to controller over Ethernet");
    Ok(EthTransport {
      command: Mutex::new(CommandChannel { socket: command_socket, next_reference: 1 }),
      data_socket,
    })
  }
}

impl CommandChannel {
  fn transact(&mut self, commands: &[SuperCommand]) -> Result<Vec<u32>, TransportError> {
    let reference: u16 = self.next_reference;
    self.next_reference = self.next_reference.wrapping_add(1).max(1);

    let request: Vec<u32> = make_command_buffer(reference, commands);
    self.socket.send(&words_to_bytes(&request)).map_err(map_command_io)?;

    let mut response_bytes: [u8; 1500] = [0; 1500];
    let received: usize = self.socket.recv(&mut response_bytes).map_err(map_command_io)?;
    let words: Vec<u32> = bytes_to_words(&response_bytes[..received]);
    if words.len() < PACKET_HEADER_WORDS + 1 {
      return Err(TransportError::ShortResponse { got: words.len(), expected: PACKET_HEADER_WORDS + 1 });
    }

    // Strip the packet header, then the super frame header.
    let frame_words: &[u32] = &words[PACKET_HEADER_WORDS..];
    let info = extract_frame_info(frame_words[0])
      .ok_or_else(|| TransportError::ConnectionLost(format!("unframed response word 0x{:08X}", frame_words[0])))?;
    if info.frame_type != FrameType::SuperFrame || info.flags.contains(FrameFlags::SYNTAX_ERROR) {
      return Err(TransportError::SyntaxError);
    }
    let payload: Vec<u32> = frame_words[1..].to_vec();
    check_mirror(&request, &payload)?;
    Ok(payload)
  }
}

fn map_command_io(error: std::io::Error) -> TransportError {
  match error.kind() {
    ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
    ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
      TransportError::ConnectionLost(error.to_string())
    }
    _ => TransportError::Io(error),
  }
}

impl Transport for EthTransport {
  fn execute_super_buffer(&self, commands: &[SuperCommand]) -> Result<Vec<u32>, TransportError> {
    let mut channel = self.command.lock().expect("command channel mutex");
    channel.transact(commands)
  }

  fn execute_immediate_stack(&self, stack_words: &[u32]) -> Result<Vec<u32>, TransportError> {
    let mut channel = self.command.lock().expect("command channel mutex");
    let reference: u16 = channel.next_reference;
    for buffer in build_upload_program(stack_words, 0, reference)
      .map_err(|e| TransportError::Io(std::io::Error::new(ErrorKind::InvalidInput, e.to_string())))?
    {
      channel.socket.send(&words_to_bytes(&buffer)).map_err(map_command_io)?;
      let mut response_bytes: [u8; 1500] = [0; 1500];
      let received: usize = channel.socket.recv(&mut response_bytes).map_err(map_command_io)?;
      let words: Vec<u32> = bytes_to_words(&response_bytes[..received]);
      if words.len() < PACKET_HEADER_WORDS + 1 {
        return Err(TransportError::ShortResponse { got: words.len(), expected: PACKET_HEADER_WORDS + 1 });
      }
      check_mirror(&buffer, &words[PACKET_HEADER_WORDS + 1..])?;
    }
    channel.transact(&[SuperCommand::WriteLocal { address: IMMEDIATE_EXEC_REGISTER, value: 1 }])?;

    // The stack output arrives as a separate command-port packet.
    let mut response_bytes: [u8; 1500] = [0; 1500];
    let received: usize = channel.socket.recv(&mut response_bytes).map_err(map_command_io)?;
    let words: Vec<u32> = bytes_to_words(&response_bytes[..received]);
    if words.len() < PACKET_HEADER_WORDS + 1 {
      return Err(TransportError::ShortResponse { got: words.len(), expected: PACKET_HEADER_WORDS + 1 });
    }
    let info = extract_frame_info(words[PACKET_HEADER_WORDS])
      .ok_or_else(|| TransportError::ConnectionLost("unframed stack response".to_string()))?;
    if info.flags.contains(FrameFlags::SYNTAX_ERROR) {
      return Err(TransportError::SyntaxError);
    }
    if info.flags.contains(FrameFlags::BUS_ERROR) {
      return Err(TransportError::BusError);
    }
    Ok(words[PACKET_HEADER_WORDS + 1..].to_vec())
  }

  fn read_data(&self, dest: &mut Vec<u32>, max_words: usize, timeout: Duration) -> Result<usize, TransportError> {
    self.data_socket.set_read_timeout(Some(timeout))?;
    let mut packet_bytes: [u8; 1500] = [0; 1500];
    let received: usize = match self.data_socket.recv(&mut packet_bytes) {
      Ok(n) => n,
      Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => return Ok(0),
      Err(e) => return Err(TransportError::Io(e)),
    };
    let words: Vec<u32> = bytes_to_words(&packet_bytes[..received]);
    let take: usize = words.len().min(max_words);
    dest.extend_from_slice(&words[..take]);
    Ok(take)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn packet_header_roundtrip() {
    let header0: u32 = make_packet_header0(1, 4095, 363);
    assert_eq!(packet_channel(header0), 1);
    assert_eq!(packet_number(header0), 4095);
    assert_eq!(packet_word_count(header0), 363);

    let header1: u32 = make_packet_header1(0xABCDE, 7);
    assert_eq!(packet_timestamp(header1), 0xABCDE);
    assert_eq!(next_header_offset(header1), 7);
  }

  #[test]
  fn packet_loss_accounts_for_wraparound() {
    assert_eq!(packet_loss_between(0, 1), 0);
    assert_eq!(packet_loss_between(1, 3), 1);
    assert_eq!(packet_loss_between(4095, 0), 0);
    assert_eq!(packet_loss_between(4095, 2), 2);
    assert_eq!(packet_loss_between(4090, 4095), 4);
  }
}

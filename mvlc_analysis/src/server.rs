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

//! # EVENT & BUFFER SERVERS
//!
//! Network fan-out to external consumers over plain TCP.
//!
//! ---------------------------------------------------------------------------
//!
//! The **event server** publishes extracted parameters as typed messages,
//! each framed as a type byte plus a little-endian u32 content length:
//!
//! | Sequence | Content |
//! |---|---|
//! | ServerInfo | JSON: protocol version, server name |
//! | BeginRun | JSON: run id plus every published source with its array size and index/value storage widths |
//! | EventData* | packed binary, see [write event data] |
//! | EndRun | JSON: event totals |
//!
//! Valid transitions mirror the table a client must enforce:
//! ServerInfo → BeginRun → EventData* → EndRun → BeginRun.
//!
//! The **buffer server** publishes raw buffers with no framing beyond
//! `u32 buffer_number, u32 word_count, words`. Neither server
//! acknowledges anything; a client that cannot keep up is disconnected.
//!
//! [write event data]: EventServer::module_data

use crate::consumers::{BufferConsumer, ModuleConsumer};
use crate::filter::DataFilter;
use crate::worker::RunDescriptor;
use mvlc_daq::transport::words_to_bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// ## PROTOCOL VERSION
pub const PROTOCOL_VERSION: u32 = 1;

/// ## DEFAULT LISTEN PORT
pub const DEFAULT_LISTEN_PORT: u16 = 13801;

/// ## MESSAGE TYPE
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
  /// ### INVALID
  Invalid = 0,

  /// ### SERVER INFO
  ServerInfo = 1,

  /// ### BEGIN RUN
  BeginRun = 2,

  /// ### EVENT DATA
  EventData = 3,

  /// ### END RUN
  EndRun = 4,
}

/// ## IS VALID TRANSITION
pub fn is_valid_transition(previous: MessageType, current: MessageType) -> bool {
  use MessageType::*;
  matches!(
    (previous, current),
    (Invalid, ServerInfo)
      | (ServerInfo, BeginRun)
      | (BeginRun, EventData)
      | (BeginRun, EndRun)
      | (EventData, EventData)
      | (EventData, EndRun)
      | (EndRun, BeginRun),
  )
}

/// ## WRITE MESSAGE
///
/// Frames and writes one message: type byte, u32 content length, content.
pub fn write_message(writer: &mut impl Write, message_type: MessageType, contents: &[u8]) -> std::io::Result<()> {
  writer.write_all(&[u8::from(message_type)])?;
  writer.write_all(&(contents.len() as u32).to_le_bytes())?;
  writer.write_all(contents)?;
  Ok(())
}

/// ## READ MESSAGE
pub fn read_message(reader: &mut impl Read) -> std::io::Result<(MessageType, Vec<u8>)> {
  let mut type_byte: [u8; 1] = [0];
  reader.read_exact(&mut type_byte)?;
  let message_type: MessageType = MessageType::try_from(type_byte[0])
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown message type"))?;
  let mut length_bytes: [u8; 4] = [0; 4];
  reader.read_exact(&mut length_bytes)?;
  let mut contents: Vec<u8> = vec![0; u32::from_le_bytes(length_bytes) as usize];
  reader.read_exact(&mut contents)?;
  Ok((message_type, contents))
}

/// ## SOURCE DESCRIPTION
///
/// One published data source: the filter runs over the module's words and
/// every match contributes an (address, value) pair to the event's data.
#[derive(Clone, Debug)]
pub struct SourceDescription {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### MODULE INDEX
  pub module_index: usize,

  /// ### FILTER
  pub filter: DataFilter,
}

/// BeginRun JSON payload.
#[derive(Debug, Deserialize, Serialize)]
struct BeginRunInfo {
  run_id: String,
  sources: Vec<SourceInfo>,
}

#[derive(Debug, Deserialize, Serialize)]
struct SourceInfo {
  name: String,
  event_index: usize,
  module_index: usize,
  size: usize,
  index_type: String,
  value_type: String,
  lower_limit: f64,
  upper_limit: f64,
}

struct ClientSlot {
  stream: TcpStream,
  last_type: MessageType,
}

/// ## EVENT SERVER
///
/// Registers as a module consumer and publishes every physics event's
/// extracted pairs to all connected clients.
pub struct EventServer {
  sources: Vec<SourceDescription>,
  clients: Arc<Mutex<Vec<ClientSlot>>>,
  local_addr: SocketAddr,
  shutdown: Arc<AtomicBool>,
  accept_join: Option<JoinHandle<()>>,
  /// Per source: pairs collected for the current event.
  event_pairs: Vec<Vec<(u16, u32)>>,
  events_published: u64,
}

impl EventServer {
  /// ### START
  ///
  /// Binds the listener (use port 0 for an ephemeral port) and starts the
  /// accept thread. Every new client immediately receives ServerInfo.
  pub fn start(listen: &str, sources: Vec<SourceDescription>) -> std::io::Result<Self> {
    let listener: TcpListener = TcpListener::bind(listen)?;
    let local_addr: SocketAddr = listener.local_addr()?;
    let clients: Arc<Mutex<Vec<ClientSlot>>> = Arc::new(Mutex::new(vec![]));
    let shutdown: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let accept_clients = clients.clone();
    let accept_shutdown = shutdown.clone();
    listener.set_nonblocking(true)?;
    let accept_join: JoinHandle<()> = thread::Builder::new()
      .name("event_server_accept".to_string())
      .spawn(move || loop {
        if accept_shutdown.load(Ordering::Relaxed) {
          return;
        }
        match listener.accept() {
          Ok((stream, peer)) => {
            tracing::info!(%peer, "event server client connected");
            let _ = stream.set_nodelay(true);
            let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
            let mut slot: ClientSlot = ClientSlot { stream, last_type: MessageType::Invalid };
            let info: String = serde_json::json!({
              "protocol_version": PROTOCOL_VERSION,
              "server": "mvlc_analysis event server",
            })
            .to_string();
            if write_message(&mut slot.stream, MessageType::ServerInfo, info.as_bytes()).is_ok() {
              slot.last_type = MessageType::ServerInfo;
              accept_clients.lock().expect("clients mutex").push(slot);
            }
          }
          Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
            thread::sleep(Duration::from_millis(20));
          }
          Err(error) => {
            tracing::warn!(%error, "event server accept failed");
            return;
          }
        }
      })
      .expect("spawning the event server accept thread");

    let source_count: usize = sources.len();
    Ok(EventServer {
      sources,
      clients,
      local_addr,
      shutdown,
      accept_join: Some(accept_join),
      event_pairs: vec![vec![]; source_count],
      events_published: 0,
    })
  }

  /// ### LOCAL ADDRESS
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// ### CLIENT COUNT
  pub fn client_count(&self) -> usize {
    self.clients.lock().expect("clients mutex").len()
  }

  /// Sends one message to every client whose protocol state admits it;
  /// clients that fail to take the write are disconnected.
  fn broadcast(&self, message_type: MessageType, contents: &[u8]) {
    let mut clients = self.clients.lock().expect("clients mutex");
    clients.retain_mut(|slot| {
      if !is_valid_transition(slot.last_type, message_type) {
        // Keep the client; it joins at the next run boundary.
        return true;
      }
      match write_message(&mut slot.stream, message_type, contents) {
        Ok(()) => {
          slot.last_type = message_type;
          true
        }
        Err(error) => {
          tracing::info!(%error, "disconnecting slow event server client");
          false
        }
      }
    });
  }
}

impl Drop for EventServer {
  fn drop(&mut self) {
    self.shutdown.store(true, Ordering::Relaxed);
    if let Some(join) = self.accept_join.take() {
      let _ = join.join();
    }
  }
}

impl ModuleConsumer for EventServer {
  fn begin_run(&mut self, run: &RunDescriptor) {
    let info: BeginRunInfo = BeginRunInfo {
      run_id: run.run_id.clone(),
      sources: self
        .sources
        .iter()
        .map(|source| SourceInfo {
          name: source.name.clone(),
          event_index: source.event_index,
          module_index: source.module_index,
          size: source.filter.address_count(),
          index_type: "u16".to_string(),
          value_type: "u32".to_string(),
          lower_limit: 0.0,
          upper_limit: (1u64 << source.filter.data_bits().min(63)) as f64,
        })
        .collect(),
    };
    let json: String = serde_json::to_string(&info).expect("begin run info serializes");
    self.broadcast(MessageType::BeginRun, json.as_bytes());
    self.events_published = 0;
  }

  fn begin_event(&mut self, _event_index: usize) {
    for pairs in &mut self.event_pairs {
      pairs.clear();
    }
  }

  fn module_data(&mut self, event_index: usize, module_index: usize, words: &[u32]) {
    for (source_index, source) in self.sources.iter().enumerate() {
      if source.event_index != event_index || source.module_index != module_index {
        continue;
      }
      for &word in words {
        if source.filter.matches(word) {
          self.event_pairs[source_index].push((
            source.filter.extract_address(word) as u16,
            source.filter.extract_data(word),
          ));
        }
      }
    }
  }

  fn end_event(&mut self, event_index: usize) {
    if self.event_pairs.iter().all(Vec::is_empty) {
      return;
    }
    // Packed layout: u8 event index, u8 source count, then per source:
    // u8 source index, u16 pair count, pairs of (u16 index, u32 value)
    // in the storage widths announced in BeginRun.
    let mut contents: Vec<u8> = vec![event_index as u8, self.sources.len() as u8];
    for (source_index, pairs) in self.event_pairs.iter().enumerate() {
      contents.push(source_index as u8);
      contents.extend_from_slice(&(pairs.len() as u16).to_le_bytes());
      for (index, value) in pairs {
        contents.extend_from_slice(&index.to_le_bytes());
        contents.extend_from_slice(&value.to_le_bytes());
      }
    }
    self.broadcast(MessageType::EventData, &contents);
    self.events_published += 1;
  }

  fn end_run(&mut self) {
    let json: String = serde_json::json!({ "events_published": self.events_published }).to_string();
    self.broadcast(MessageType::EndRun, json.as_bytes());
  }
}

/// ## BUFFER SERVER
///
/// Raw buffer fan-out: `u32 buffer_number, u32 word_count, words` per
/// buffer, no handshake.
pub struct BufferServer {
  clients: Arc<Mutex<Vec<TcpStream>>>,
  local_addr: SocketAddr,
  shutdown: Arc<AtomicBool>,
  accept_join: Option<JoinHandle<()>>,
}

impl BufferServer {
  /// ### START
  pub fn start(listen: &str) -> std::io::Result<Self> {
    let listener: TcpListener = TcpListener::bind(listen)?;
    let local_addr: SocketAddr = listener.local_addr()?;
    let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(vec![]));
    let shutdown: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    listener.set_nonblocking(true)?;
    let accept_clients = clients.clone();
    let accept_shutdown = shutdown.clone();
    let accept_join: JoinHandle<()> = thread::Builder::new()
      .name("buffer_server_accept".to_string())
      .spawn(move || loop {
        if accept_shutdown.load(Ordering::Relaxed) {
          return;
        }
        match listener.accept() {
          Ok((stream, peer)) => {
            tracing::info!(%peer, "buffer server client connected");
            let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
            accept_clients.lock().expect("clients mutex").push(stream);
          }
          Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
            thread::sleep(Duration::from_millis(20));
          }
          Err(_) => return,
        }
      })
      .expect("spawning the buffer server accept thread");

    Ok(BufferServer { clients, local_addr, shutdown, accept_join: Some(accept_join) })
  }

  /// ### LOCAL ADDRESS
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// ### CLIENT COUNT
  pub fn client_count(&self) -> usize {
    self.clients.lock().expect("clients mutex").len()
  }
}

impl Drop for BufferServer {
  fn drop(&mut self) {
    self.shutdown.store(true, Ordering::Relaxed);
    if let Some(join) = self.accept_join.take() {
      let _ = join.join();
    }
  }
}

impl BufferConsumer for BufferServer {
  fn buffer(&mut self, buffer_number: u32, words: &[u32]) {
    let mut clients = self.clients.lock().expect("clients mutex");
    clients.retain_mut(|stream| {
      let write = |stream: &mut TcpStream| -> std::io::Result<()> {
        stream.write_all(&buffer_number.to_le_bytes())?;
        stream.write_all(&(words.len() as u32).to_le_bytes())?;
        stream.write_all(&words_to_bytes(words))?;
        Ok(())
      };
      match write(stream) {
        Ok(()) => true,
        Err(error) => {
          tracing::info!(%error, "disconnecting slow buffer server client");
          false
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_framing_roundtrip() {
    let mut bytes: Vec<u8> = vec![];
    write_message(&mut bytes, MessageType::BeginRun, b"{\"run\":1}").unwrap();
    let (message_type, contents) = read_message(&mut bytes.as_slice()).unwrap();
    assert_eq!(message_type, MessageType::BeginRun);
    assert_eq!(contents, b"{\"run\":1}");
  }

  #[test]
  fn transition_table() {
    use MessageType::*;
    assert!(is_valid_transition(Invalid, ServerInfo));
    assert!(is_valid_transition(ServerInfo, BeginRun));
    assert!(is_valid_transition(BeginRun, EventData));
    assert!(is_valid_transition(EventData, EventData));
    assert!(is_valid_transition(EventData, EndRun));
    assert!(is_valid_transition(EndRun, BeginRun));
    assert!(!is_valid_transition(ServerInfo, EventData));
    assert!(!is_valid_transition(Invalid, EventData));
    assert!(!is_valid_transition(EndRun, EventData));
  }

  #[test]
  fn event_server_publishes_to_a_client() {
    let filter: DataFilter = DataFilter::compile("0001 XXXX XXXX AAAA XXXD DDDD DDDD DDDD").unwrap();
    let mut server: EventServer = EventServer::start(
      "127.0.0.1:0",
      vec![SourceDescription {
        name: "amplitude".to_string(),
        event_index: 0,
        module_index: 0,
        filter,
      }],
    )
    .unwrap();

    let mut client: TcpStream = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // ServerInfo arrives on connect.
    let (message_type, contents) = read_message(&mut client).unwrap();
    assert_eq!(message_type, MessageType::ServerInfo);
    let info: serde_json::Value = serde_json::from_slice(&contents).unwrap();
    assert_eq!(info["protocol_version"], PROTOCOL_VERSION);

    // Wait for the accept thread to register the client, then run a tiny
    // event through the consumer interface.
    let deadline: std::time::Instant = std::time::Instant::now() + Duration::from_secs(5);
    while server.client_count() == 0 && std::time::Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    server.begin_run(&RunDescriptor { run_id: "run001".to_string(), keep_sink_state: false });
    server.begin_event(0);
    server.module_data(0, 0, &[0x1000_0000 | (3 << 16) | 0x123]);
    server.end_event(0);
    server.end_run();

    let (message_type, contents) = read_message(&mut client).unwrap();
    assert_eq!(message_type, MessageType::BeginRun);
    let begin_run: BeginRunInfo = serde_json::from_slice(&contents).unwrap();
    assert_eq!(begin_run.run_id, "run001");
    assert_eq!(begin_run.sources.len(), 1);
    assert_eq!(begin_run.sources[0].size, 16);
    assert_eq!(begin_run.sources[0].index_type, "u16");

    let (message_type, contents) = read_message(&mut client).unwrap();
    assert_eq!(message_type, MessageType::EventData);
    assert_eq!(contents[0], 0, "event index");
    assert_eq!(contents[1], 1, "source count");
    assert_eq!(contents[2], 0, "source index");
    assert_eq!(u16::from_le_bytes([contents[3], contents[4]]), 1, "pair count");
    assert_eq!(u16::from_le_bytes([contents[5], contents[6]]), 3, "address");
    assert_eq!(u32::from_le_bytes([contents[7], contents[8], contents[9], contents[10]]), 0x123);

    let (message_type, _) = read_message(&mut client).unwrap();
    assert_eq!(message_type, MessageType::EndRun);
  }

  #[test]
  fn buffer_server_streams_raw_buffers() {
    let mut server: BufferServer = BufferServer::start("127.0.0.1:0").unwrap();
    let mut client: TcpStream = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let deadline: std::time::Instant = std::time::Instant::now() + Duration::from_secs(5);
    while server.client_count() == 0 && std::time::Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    server.buffer(42, &[0xAAAA_BBBB, 0xCCCC_DDDD]);

    let mut header: [u8; 8] = [0; 8];
    client.read_exact(&mut header).unwrap();
    assert_eq!(u32::from_le_bytes(header[0..4].try_into().unwrap()), 42);
    assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), 2);
    let mut payload: [u8; 8] = [0; 8];
    client.read_exact(&mut payload).unwrap();
    assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 0xAAAA_BBBB);
  }
}

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

//! # MVLC CONTROLLER I/O & READOUT
//!
//! Copyright © 2024 Nathaniel Hardesty, Licensed under the MIT License
//!
//! This software is created by a third-party and not endorsed or supported by
//! mesytec GmbH & Co. KG.
//!
//! ---------------------------------------------------------------------------
//!
//! The runtime half of driving an MVLC: connecting to the controller over
//! USB or Ethernet, executing register transactions, uploading compiled
//! stacks, running the acquisition loop, persisting the raw stream into
//! split listfile archives, parsing the stream back into structured event
//! callbacks, and matching events across crates by timestamp.
//!
//! To run an acquisition:
//!
//! - Describe the crate with a [Crate Config].
//! - Connect a [Transport] ([USB] or [Ethernet]).
//! - Start a [Readout Worker]; it uploads stacks, arms triggers, writes the
//!   [Listfile], and publishes buffers to a bounded snoop queue.
//! - Feed snooped buffers to a [Readout Parser] to receive per-event,
//!   per-module callbacks.
//!
//! To replay an archive, a [Replay Worker] feeds the same snoop queue from a
//! [Listfile Reader] instead.
//!
//! [Crate Config]:    config::CrateConfig
//! [Transport]:       transport::Transport
//! [USB]:             usb::UsbTransport
//! [Ethernet]:        eth::EthTransport
//! [Readout Worker]:  readout::ReadoutWorker
//! [Replay Worker]:   readout::ReplayWorker
//! [Listfile]:        listfile::SplitListfileWriter
//! [Listfile Reader]: listfile::ListfileReader
//! [Readout Parser]:  parser::ReadoutParser

pub mod buffer;
pub mod config;
pub mod eth;
pub mod event_builder;
pub mod listfile;
pub mod parser;
pub mod readout;
pub mod transport;
pub mod usb;

pub use buffer::{BufferPool, PooledBuffer};
pub use config::{CrateConfig, EventConfig, ModuleConfig};
pub use parser::{ModuleData, ParserCallbacks, ReadoutParser};
pub use transport::{Transport, TransportError};

/// ## DATA BUFFER WORDS
///
/// Default capacity of one raw readout buffer in 32-bit words (1 MiB).
pub const DATA_BUFFER_WORDS: usize = 256 * 1024;

/// ## BUFFER POOL DEPTH
///
/// Default number of buffers in the free-list. Ten in-flight megabyte
/// buffers absorb readout bursts without unbounded memory growth.
pub const BUFFER_POOL_DEPTH: usize = 10;

/// ## SNOOP QUEUE DEPTH
///
/// Default bound of the snoop queue between the readout worker and the
/// stream worker. The archive path never drops; the snoop path drops when
/// this queue is full.
pub const SNOOP_QUEUE_DEPTH: usize = 10;

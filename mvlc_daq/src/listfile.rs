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

//! # LISTFILE ARCHIVES
//!
//! Raw readout runs persist into ZIP containers. Each container holds the
//! binary listfile plus the run's metadata as ordinary entries, so a single
//! file carries everything needed to replay and re-analyze the run:
//!
//! - `<base>.mvlclst`: the raw frame stream
//! - `<base>.vmeconfig`: the crate configuration as JSON
//! - `analysis.analysis`: the analysis configuration, when provided
//! - `messages.log`: the run's text log
//!
//! ---------------------------------------------------------------------------
//!
//! Listfile layout: the 8-byte ASCII magic (`MVLC_USB` or `MVLC_ETH`), a
//! 4-byte endian marker (0x12345678 in writer byte order), a CrateConfig
//! system event, a VmeConfig system event carrying space-padded JSON, the
//! raw frame stream, and a terminating EndOfFile system event.
//!
//! When a size or duration threshold is crossed the container rotates:
//! `<base>.zip`, `<base>_part002.zip`, and so on, each part carrying the full
//! preamble so every part replays standalone.

use crate::config::CrateConfig;
use crate::transport::{bytes_to_words, words_to_bytes};
use mvlc_stack::frame::{
  extract_frame_info,
  extract_system_event_subtype,
  make_system_event_header,
  FrameInfo,
  SystemEventSubtype,
};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// ## FILE MAGIC (USB)
pub const FILE_MAGIC_USB: &[u8; 8] = b"MVLC_USB";

/// ## FILE MAGIC (ETHERNET)
pub const FILE_MAGIC_ETH: &[u8; 8] = b"MVLC_ETH";

/// ## ENDIAN MARKER
///
/// Written in host order right after the magic; a reader seeing the bytes
/// reversed knows every following word needs a byte swap.
pub const ENDIAN_MARKER: u32 = 0x1234_5678;

/// ## LISTFILE EXTENSION
pub const LISTFILE_EXTENSION: &str = "mvlclst";

/// ## LISTFILE FORMAT
///
/// Which transport framing the listfile body uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListfileFormat {
  /// ### USB
  Usb,

  /// ### ETHERNET
  Eth,
}

impl ListfileFormat {
  /// ### MAGIC
  pub fn magic(&self) -> &'static [u8; 8] {
    match self {
      ListfileFormat::Usb => FILE_MAGIC_USB,
      ListfileFormat::Eth => FILE_MAGIC_ETH,
    }
  }
}

/// ## SPLIT MODE
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum SplitMode {
  /// ### NO SPLITTING
  #[default]
  None,

  /// ### SPLIT BY SIZE
  ///
  /// Rotate once the listfile body of the current part exceeds this many
  /// bytes. Rotation happens at buffer boundaries, never inside a frame.
  Size(u64),

  /// ### SPLIT BY DURATION
  Duration(Duration),
}

/// ## LISTFILE ERROR
#[derive(Debug, Error)]
pub enum ListfileError {
  /// ### IO
  #[error(transparent)]
  Io(#[from] std::io::Error),

  /// ### ZIP
  #[error(transparent)]
  Zip(#[from] zip::result::ZipError),

  /// ### BAD MAGIC
  #[error("not a listfile: bad magic bytes")]
  BadMagic,

  /// ### TRUNCATED
  #[error("listfile ends inside a frame")]
  Truncated,

  /// ### BAD CONFIG
  #[error("embedded configuration does not parse: {0}")]
  BadConfig(#[from] serde_json::Error),

  /// ### NO LISTFILE ENTRY
  #[error("archive contains no .{LISTFILE_EXTENSION} entry")]
  NoListfileEntry,
}

/// ## WRITER CONFIG
#[derive(Clone, Debug)]
pub struct ListfileWriterConfig {
  /// ### OUTPUT DIRECTORY
  pub output_dir: PathBuf,

  /// ### BASE NAME
  ///
  /// Container and entry names derive from this stem.
  pub base_name: String,

  /// ### FORMAT
  pub format: ListfileFormat,

  /// ### SPLIT MODE
  pub split: SplitMode,

  /// ### COMPRESS
  ///
  /// Deflate the listfile entry. Metadata entries are always stored
  /// uncompressed so external tools can grab them quickly.
  pub compress: bool,
}

/// ## SPLIT LISTFILE WRITER
///
/// Writes the raw readout stream into rotating ZIP containers, replicating
/// the preamble into every part.
pub struct SplitListfileWriter {
  config: ListfileWriterConfig,
  preamble: Vec<u8>,
  crate_config_json: String,
  analysis_json: Option<String>,
  zip: Option<ZipWriter<File>>,
  part_index: u32,
  part_paths: Vec<PathBuf>,
  listfile_bytes: u64,
  part_started: Instant,
  messages: String,
}

impl SplitListfileWriter {
  /// ### CREATE WRITER
  ///
  /// Opens the first container part and writes the preamble. The crate
  /// config is embedded both as a ZIP entry and as the CrateConfig system
  /// event; `analysis_json`, when given, becomes the `analysis.analysis`
  /// entry.
  pub fn create(
    config: ListfileWriterConfig,
    crate_config: &CrateConfig,
    analysis_json: Option<String>,
  ) -> Result<Self, ListfileError> {
    let crate_config_json: String = crate_config.to_json();

    // The preamble bytes are fixed at creation and replayed into every
    // part the writer opens.
    let mut preamble: Vec<u8> = vec![];
    preamble.extend_from_slice(config.format.magic());
    preamble.extend_from_slice(&ENDIAN_MARKER.to_ne_bytes());
    preamble.extend_from_slice(&words_to_bytes(&system_event_frames(
      SystemEventSubtype::CrateConfig,
      &padded_json_words(&crate_config_json),
    )));
    preamble.extend_from_slice(&words_to_bytes(&system_event_frames(
      SystemEventSubtype::VmeConfig,
      &padded_json_words(&crate_config_json),
    )));

    let mut writer: SplitListfileWriter = SplitListfileWriter {
      config,
      preamble,
      crate_config_json,
      analysis_json,
      zip: None,
      part_index: 0,
      part_paths: vec![],
      listfile_bytes: 0,
      part_started: Instant::now(),
      messages: String::new(),
    };
    writer.open_part()?;
    Ok(writer)
  }

  fn part_stem(&self) -> String {
    if self.part_index <= 1 {
      self.config.base_name.clone()
    } else {
      format!("{}_part{:03}", self.config.base_name, self.part_index)
    }
  }

  fn open_part(&mut self) -> Result<(), ListfileError> {
    self.part_index += 1;
    let stem: String = self.part_stem();
    let path: PathBuf = self.config.output_dir.join(format!("{stem}.zip"));
    tracing::info!(path = %path.display(), "opening listfile part");

    let mut zip: ZipWriter<File> = ZipWriter::new(File::create(&path)?);
    let stored: SimpleFileOptions = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file(format!("{}.vmeconfig", self.config.base_name), stored)?;
    zip.write_all(self.crate_config_json.as_bytes())?;

    if let Some(analysis) = &self.analysis_json {
      zip.start_file("analysis.analysis", stored)?;
      zip.write_all(analysis.as_bytes())?;
    }

    let listfile_options: SimpleFileOptions = SimpleFileOptions::default()
      .compression_method(if self.config.compress { CompressionMethod::Deflated } else { CompressionMethod::Stored })
      .large_file(true);
    zip.start_file(format!("{stem}.{LISTFILE_EXTENSION}"), listfile_options)?;
    zip.write_all(&self.preamble)?;

    self.zip = Some(zip);
    self.part_paths.push(path);
    self.listfile_bytes = self.preamble.len() as u64;
    self.part_started = Instant::now();
    Ok(())
  }

  fn close_part(&mut self) -> Result<(), ListfileError> {
    let Some(mut zip) = self.zip.take() else {
      return Ok(());
    };
    // Each part is terminated so it replays standalone.
    let end: Vec<u32> = vec![make_system_event_header(SystemEventSubtype::EndOfFile, 0, false)];
    zip.write_all(&words_to_bytes(&end))?;
    let stored: SimpleFileOptions = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("messages.log", stored)?;
    zip.write_all(self.messages.as_bytes())?;
    zip.finish()?;
    Ok(())
  }

  fn rotation_due(&self, incoming_bytes: u64) -> bool {
    match self.config.split {
      SplitMode::None => false,
      SplitMode::Size(limit) => self.listfile_bytes + incoming_bytes > limit && self.listfile_bytes > self.preamble.len() as u64,
      SplitMode::Duration(limit) => self.part_started.elapsed() >= limit,
    }
  }

  /// ### WRITE WORDS
  ///
  /// Appends one raw buffer verbatim. Buffers are frame-aligned, so the
  /// rotation check runs only between them.
  pub fn write_words(&mut self, words: &[u32]) -> Result<(), ListfileError> {
    let bytes: Vec<u8> = words_to_bytes(words);
    if self.rotation_due(bytes.len() as u64) {
      self.close_part()?;
      self.open_part()?;
    }
    self
      .zip
      .as_mut()
      .expect("writer is open")
      .write_all(&bytes)?;
    self.listfile_bytes += bytes.len() as u64;
    Ok(())
  }

  /// ### WRITE SYSTEM EVENT
  ///
  /// Frames and appends a system event, splitting oversized payloads into
  /// a Continue chain.
  pub fn write_system_event(&mut self, subtype: SystemEventSubtype, payload: &[u32]) -> Result<(), ListfileError> {
    self.write_words(&system_event_frames(subtype, payload))
  }

  /// ### WRITE TIMETICK
  ///
  /// A TimeTick system event carrying the current unix time.
  pub fn write_timetick(&mut self) -> Result<(), ListfileError> {
    let now: u64 = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    self.write_system_event(SystemEventSubtype::TimeTick, &[now as u32])
  }

  /// ### LOG MESSAGE
  ///
  /// Appends a line to the part's `messages.log`.
  pub fn log_message(&mut self, message: &str) {
    self.messages.push_str(message);
    self.messages.push('\n');
  }

  /// ### CLOSE
  ///
  /// Terminates the listfile with EndOfFile and finishes the container.
  /// Returns the paths of all parts written.
  pub fn close(mut self) -> Result<Vec<PathBuf>, ListfileError> {
    self.close_part()?;
    Ok(std::mem::take(&mut self.part_paths))
  }
}

/// ## SYSTEM EVENT FRAMES
///
/// Frames a payload as one or more system event frames, Continue-chained
/// when the payload exceeds a single frame's length field.
pub fn system_event_frames(subtype: SystemEventSubtype, payload: &[u32]) -> Vec<u32> {
  let mut words: Vec<u32> = Vec::with_capacity(payload.len() + 2);
  let mut chunks = payload.chunks(u16::MAX as usize).peekable();
  if payload.is_empty() {
    words.push(make_system_event_header(subtype, 0, false));
    return words;
  }
  while let Some(chunk) = chunks.next() {
    let continues: bool = chunks.peek().is_some();
    words.push(make_system_event_header(subtype, chunk.len() as u16, continues));
    words.extend_from_slice(chunk);
  }
  words
}

/// ## PADDED JSON WORDS
///
/// JSON bytes space-padded to a word multiple; JSON parsers skip the
/// padding when reading it back.
pub fn padded_json_words(json: &str) -> Vec<u32> {
  let mut bytes: Vec<u8> = json.as_bytes().to_vec();
  while bytes.len() % 4 != 0 {
    bytes.push(b' ');
  }
  bytes_to_words(&bytes)
}

/// ## LISTFILE READER
///
/// Opens one container part, validates the preamble, and yields the frame
/// stream as frame-aligned buffers for replay.
pub struct ListfileReader {
  format: ListfileFormat,
  byte_swapped: bool,
  crate_config: CrateConfig,
  words: Vec<u32>,
  cursor: usize,
  finished: bool,
}

impl ListfileReader {
  /// ### OPEN
  pub fn open(path: &Path) -> Result<Self, ListfileError> {
    let mut archive: ZipArchive<File> = ZipArchive::new(File::open(path)?)?;

    let entry_name: String = archive
      .file_names()
      .find(|name| name.ends_with(&format!(".{LISTFILE_EXTENSION}")))
      .map(str::to_string)
      .ok_or(ListfileError::NoListfileEntry)?;

    let mut bytes: Vec<u8> = vec![];
    archive.by_name(&entry_name)?.read_to_end(&mut bytes)?;

    if bytes.len() < 12 {
      return Err(ListfileError::Truncated);
    }
    let format: ListfileFormat = match &bytes[0..8] {
      magic if magic == FILE_MAGIC_USB => ListfileFormat::Usb,
      magic if magic == FILE_MAGIC_ETH => ListfileFormat::Eth,
      _ => return Err(ListfileError::BadMagic),
    };
    let marker: [u8; 4] = [bytes[8], bytes[9], bytes[10], bytes[11]];
    let byte_swapped: bool = match u32::from_ne_bytes(marker) {
      ENDIAN_MARKER => false,
      marker if marker.swap_bytes() == ENDIAN_MARKER => true,
      _ => return Err(ListfileError::BadMagic),
    };

    let mut words: Vec<u32> = bytes_to_words(&bytes[12..]);
    if byte_swapped {
      for word in &mut words {
        *word = word.swap_bytes();
      }
    }

    let crate_config: CrateConfig = extract_crate_config(&words)?;
    Ok(ListfileReader {
      format,
      byte_swapped,
      crate_config,
      words,
      cursor: 0,
      finished: false,
    })
  }

  /// ### FORMAT
  pub fn format(&self) -> ListfileFormat {
    self.format
  }

  /// ### BYTE SWAPPED
  pub fn byte_swapped(&self) -> bool {
    self.byte_swapped
  }

  /// ### CRATE CONFIG
  pub fn crate_config(&self) -> &CrateConfig {
    &self.crate_config
  }

  /// ### NEXT BUFFER
  ///
  /// Copies whole frames into `dest` until it would exceed `max_words`.
  /// Returns the number of words delivered; 0 means the stream ended.
  pub fn next_buffer(&mut self, dest: &mut Vec<u32>, max_words: usize) -> Result<usize, ListfileError> {
    if self.finished {
      return Ok(0);
    }
    let start: usize = dest.len();
    while self.cursor < self.words.len() {
      let header: u32 = self.words[self.cursor];
      let Some(info) = extract_frame_info(header) else {
        return Err(ListfileError::Truncated);
      };
      let frame_len: usize = 1 + info.len as usize;
      if self.cursor + frame_len > self.words.len() {
        return Err(ListfileError::Truncated);
      }
      if dest.len() - start + frame_len > max_words && dest.len() > start {
        break;
      }
      dest.extend_from_slice(&self.words[self.cursor..self.cursor + frame_len]);
      self.cursor += frame_len;
      if extract_system_event_subtype(header) == Some(SystemEventSubtype::EndOfFile) {
        self.finished = true;
        break;
      }
    }
    if self.cursor >= self.words.len() {
      self.finished = true;
    }
    Ok(dest.len() - start)
  }

  /// ### PART PATHS
  ///
  /// The sibling parts of a split run, in order, starting from any part's
  /// path.
  pub fn part_paths(first: &Path) -> Vec<PathBuf> {
    let Some(stem) = first.file_stem().and_then(|stem| stem.to_str()) else {
      return vec![first.to_path_buf()];
    };
    let base: &str = stem.split("_part").next().unwrap_or(stem);
    let dir: &Path = first.parent().unwrap_or(Path::new("."));

    let mut paths: Vec<PathBuf> = vec![dir.join(format!("{base}.zip"))];
    for part in 2.. {
      let candidate: PathBuf = dir.join(format!("{base}_part{part:03}.zip"));
      if candidate.exists() {
        paths.push(candidate);
      } else {
        break;
      }
    }
    paths.retain(|path| path.exists());
    if paths.is_empty() {
      paths.push(first.to_path_buf());
    }
    paths
  }
}

/// Locates the CrateConfig system event in the preamble and parses its
/// JSON payload, concatenating a Continue chain if present.
fn extract_crate_config(words: &[u32]) -> Result<CrateConfig, ListfileError> {
  let mut cursor: usize = 0;
  let mut payload: Vec<u32> = vec![];
  let mut collecting: bool = false;
  while cursor < words.len() {
    let header: u32 = words[cursor];
    let info: FrameInfo = extract_frame_info(header).ok_or(ListfileError::Truncated)?;
    let frame_len: usize = 1 + info.len as usize;
    if cursor + frame_len > words.len() {
      return Err(ListfileError::Truncated);
    }
    if extract_system_event_subtype(header) == Some(SystemEventSubtype::CrateConfig) {
      collecting = true;
      payload.extend_from_slice(&words[cursor + 1..cursor + frame_len]);
      if !info.continues() {
        break;
      }
    } else if collecting {
      break;
    }
    cursor += frame_len;
  }
  if payload.is_empty() {
    return Err(ListfileError::NoListfileEntry);
  }
  let bytes: Vec<u8> = words_to_bytes(&payload);
  let json: String = String::from_utf8_lossy(&bytes).into_owned();
  Ok(CrateConfig::from_json(json.trim_end())?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{EventConfig, ModuleConfig};
  use mvlc_stack::frame::{make_stack_frame_header, FrameFlags, FrameType};
  use mvlc_stack::trigger::TriggerCondition;
  use mvlc_stack::ScriptCommand;

  fn test_config() -> CrateConfig {
    CrateConfig {
      crate_id: 0,
      events: vec![EventConfig {
        name: "event0".to_string(),
        trigger: TriggerCondition::Irq { level: 1, iack: false },
        enabled: true,
        modules: vec![ModuleConfig {
          name: "madc32".to_string(),
          readout: vec![ScriptCommand::MbltFifo { address: 0x0100_0000, transfers: 4 }],
          reset: vec![],
        }],
      }],
      ..Default::default()
    }
  }

  fn event_frame() -> Vec<u32> {
    let mut words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 5, FrameFlags::empty()),
      mvlc_stack::frame::make_frame_header(FrameType::BlockRead, 4, FrameFlags::empty()),
    ];
    words.extend_from_slice(&[10, 20, 30, 40]);
    words
  }

  #[test]
  fn write_then_read_roundtrip() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let config: ListfileWriterConfig = ListfileWriterConfig {
      output_dir: dir.path().to_path_buf(),
      base_name: "run001".to_string(),
      format: ListfileFormat::Usb,
      split: SplitMode::None,
      compress: false,
    };

    let mut writer: SplitListfileWriter = SplitListfileWriter::create(config, &test_config(), None).unwrap();
    writer.write_words(&event_frame()).unwrap();
    writer.write_timetick().unwrap();
    writer.log_message("run started");
    let parts: Vec<PathBuf> = writer.close().unwrap();
    assert_eq!(parts.len(), 1);

    let mut reader: ListfileReader = ListfileReader::open(&parts[0]).unwrap();
    assert_eq!(reader.format(), ListfileFormat::Usb);
    assert!(!reader.byte_swapped());
    assert_eq!(reader.crate_config(), &test_config());

    // The whole stream arrives frame-aligned: config events, the data
    // frame, the timetick, EndOfFile.
    let mut all: Vec<u32> = vec![];
    while reader.next_buffer(&mut all, 64).unwrap() > 0 {}
    let last: FrameInfo = extract_frame_info(*all.last().unwrap()).unwrap();
    assert_eq!(last.frame_type, FrameType::SystemEvent);
    assert!(all.windows(event_frame().len()).any(|window| window == event_frame().as_slice()));
  }

  #[test]
  fn size_split_produces_parts_with_preambles() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let config: ListfileWriterConfig = ListfileWriterConfig {
      output_dir: dir.path().to_path_buf(),
      base_name: "run002".to_string(),
      format: ListfileFormat::Usb,
      split: SplitMode::Size(4096),
      compress: false,
    };

    let mut writer: SplitListfileWriter = SplitListfileWriter::create(config, &test_config(), None).unwrap();
    let frame: Vec<u32> = event_frame();
    for _ in 0..1000 {
      writer.write_words(&frame).unwrap();
    }
    let parts: Vec<PathBuf> = writer.close().unwrap();
    assert!(parts.len() > 1, "expected the container to rotate");

    // Every part replays standalone.
    for part in &parts {
      let mut reader: ListfileReader = ListfileReader::open(part).unwrap();
      assert_eq!(reader.crate_config(), &test_config());
      let mut words: Vec<u32> = vec![];
      reader.next_buffer(&mut words, 1 << 20).unwrap();
      assert!(!words.is_empty());
    }

    let listed: Vec<PathBuf> = ListfileReader::part_paths(&parts[0]);
    assert_eq!(listed, parts);
  }

  #[test]
  fn oversized_system_events_chain() {
    let payload: Vec<u32> = vec![7; u16::MAX as usize + 10];
    let framed: Vec<u32> = system_event_frames(SystemEventSubtype::VmeConfig, &payload);
    let first: FrameInfo = extract_frame_info(framed[0]).unwrap();
    assert!(first.continues());
    assert_eq!(first.len, u16::MAX);
    let second: FrameInfo = extract_frame_info(framed[1 + u16::MAX as usize]).unwrap();
    assert!(!second.continues());
    assert_eq!(second.len, 10);
  }
}

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

//! # SINKS
//!
//! Terminal accumulation state of the analysis graph. Sink state is
//! written only by the stream worker thread; readers on other threads take
//! the state's lock just long enough to copy what they render.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

/// ## HISTO 1D
///
/// Fixed-binning one-dimensional histogram.
#[derive(Clone, Debug, PartialEq)]
pub struct Histo1D {
  /// ### BINS
  pub bins: Vec<f64>,

  /// ### AXIS MINIMUM
  pub x_min: f64,

  /// ### AXIS MAXIMUM
  pub x_max: f64,

  /// ### UNDERFLOW
  pub underflow: f64,

  /// ### OVERFLOW
  pub overflow: f64,

  /// ### ENTRY COUNT
  pub entry_count: u64,
}

impl Histo1D {
  /// ### NEW HISTOGRAM
  pub fn new(bin_count: usize, x_min: f64, x_max: f64) -> Self {
    Histo1D {
      bins: vec![0.0; bin_count],
      x_min,
      x_max,
      underflow: 0.0,
      overflow: 0.0,
      entry_count: 0,
    }
  }

  /// ### FILL
  pub fn fill(&mut self, value: f64) {
    if value.is_nan() {
      return;
    }
    self.entry_count += 1;
    if value < self.x_min {
      self.underflow += 1.0;
    } else if value >= self.x_max {
      self.overflow += 1.0;
    } else {
      let fraction: f64 = (value - self.x_min) / (self.x_max - self.x_min);
      let bin: usize = (fraction * self.bins.len() as f64) as usize;
      let idx: usize = bin.min(self.bins.len() - 1);
      self.bins[idx] += 1.0;
    }
  }

  /// ### CLEAR
  pub fn clear(&mut self) {
    self.bins.fill(0.0);
    self.underflow = 0.0;
    self.overflow = 0.0;
    self.entry_count = 0;
  }

  /// ### MAX BIN
  pub fn max_bin(&self) -> (usize, f64) {
    self
      .bins
      .iter()
      .copied()
      .enumerate()
      .fold((0, 0.0), |best, (i, count)| if count > best.1 { (i, count) } else { best })
  }
}

/// ## HISTO 2D
#[derive(Clone, Debug, PartialEq)]
pub struct Histo2D {
  /// ### BINS
  ///
  /// Row-major, `y_bins` rows of `x_bins` columns.
  pub bins: Vec<f64>,

  /// ### X BIN COUNT
  pub x_bins: usize,

  /// ### Y BIN COUNT
  pub y_bins: usize,

  /// ### X RANGE
  pub x_min: f64,
  pub x_max: f64,

  /// ### Y RANGE
  pub y_min: f64,
  pub y_max: f64,

  /// ### ENTRY COUNT
  pub entry_count: u64,

  /// ### OUT OF RANGE
  pub out_of_range: u64,
}

impl Histo2D {
  /// ### NEW HISTOGRAM
  pub fn new(x_bins: usize, x_min: f64, x_max: f64, y_bins: usize, y_min: f64, y_max: f64) -> Self {
    Histo2D {
      bins: vec![0.0; x_bins * y_bins],
      x_bins,
      y_bins,
      x_min,
      x_max,
      y_min,
      y_max,
      entry_count: 0,
      out_of_range: 0,
    }
  }

  /// ### FILL
  pub fn fill(&mut self, x: f64, y: f64) {
    if x.is_nan() || y.is_nan() {
      return;
    }
    self.entry_count += 1;
    if x < self.x_min || x >= self.x_max || y < self.y_min || y >= self.y_max {
      self.out_of_range += 1;
      return;
    }
    let x_bin: usize = ((x - self.x_min) / (self.x_max - self.x_min) * self.x_bins as f64) as usize;
    let y_bin: usize = ((y - self.y_min) / (self.y_max - self.y_min) * self.y_bins as f64) as usize;
    let index: usize = y_bin.min(self.y_bins - 1) * self.x_bins + x_bin.min(self.x_bins - 1);
    self.bins[index] += 1.0;
  }

  /// ### CLEAR
  pub fn clear(&mut self) {
    self.bins.fill(0.0);
    self.entry_count = 0;
    self.out_of_range = 0;
  }
}

/// ## RATE MONITOR
///
/// Tracks the rate of valid inputs over time, keeping a bounded history of
/// sampled rates.
#[derive(Clone, Debug)]
pub struct RateMonitor {
  /// ### SAMPLES
  ///
  /// Most recent rate samples in Hz, oldest first, capped at capacity.
  pub samples: Vec<f64>,

  /// ### CAPACITY
  pub capacity: usize,

  /// ### TOTAL COUNT
  pub total_count: u64,

  count_since_sample: u64,
  last_sample: Instant,
}

impl RateMonitor {
  /// ### NEW MONITOR
  pub fn new(capacity: usize) -> Self {
    RateMonitor {
      samples: vec![],
      capacity,
      total_count: 0,
      count_since_sample: 0,
      last_sample: Instant::now(),
    }
  }

  /// ### COUNT EVENT
  ///
  /// Invalid inputs are treated as no-event and must not be counted.
  pub fn count(&mut self) {
    self.total_count += 1;
    self.count_since_sample += 1;
  }

  /// ### SAMPLE
  ///
  /// Converts the count accumulated since the previous sample into a rate.
  pub fn sample(&mut self) {
    let elapsed: f64 = self.last_sample.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
      return;
    }
    let rate: f64 = self.count_since_sample as f64 / elapsed;
    if self.samples.len() == self.capacity {
      self.samples.remove(0);
    }
    self.samples.push(rate);
    self.count_since_sample = 0;
    self.last_sample = Instant::now();
  }

  /// ### CLEAR
  pub fn clear(&mut self) {
    self.samples.clear();
    self.total_count = 0;
    self.count_since_sample = 0;
    self.last_sample = Instant::now();
  }
}

/// ## EXPORT FORMAT
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExportFormat {
  /// ### PLAIN
  #[default]
  Plain,

  /// ### GZIP
  Gzip,
}

/// ## EXPORT SINK
///
/// Writes each event's input array to a file as a length-framed record:
/// `u32 count`, then `count` pairs of `u16 index, f64 value` for the valid
/// elements.
pub struct ExportSink {
  /// ### PATH
  pub path: PathBuf,

  /// ### FORMAT
  pub format: ExportFormat,

  /// ### RECORDS WRITTEN
  pub records_written: u64,

  writer: Option<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ExportSink {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExportSink")
      .field("path", &self.path)
      .field("format", &self.format)
      .field("records_written", &self.records_written)
      .field("open", &self.writer.is_some())
      .finish()
  }
}

impl ExportSink {
  /// ### NEW SINK
  pub fn new(path: PathBuf, format: ExportFormat) -> Self {
    ExportSink { path, format, records_written: 0, writer: None }
  }

  /// ### OPEN
  pub fn open(&mut self) -> std::io::Result<()> {
    let file: BufWriter<File> = BufWriter::new(File::create(&self.path)?);
    self.writer = Some(match self.format {
      ExportFormat::Plain => Box::new(file),
      ExportFormat::Gzip => Box::new(GzEncoder::new(file, Compression::default())),
    });
    self.records_written = 0;
    Ok(())
  }

  /// ### WRITE RECORD
  pub fn write_record(&mut self, values: &[f64], valid: &[bool]) -> std::io::Result<()> {
    let Some(writer) = self.writer.as_mut() else {
      return Ok(());
    };
    let count: u32 = valid.iter().filter(|v| **v).count() as u32;
    writer.write_all(&count.to_le_bytes())?;
    for (index, value) in values.iter().enumerate() {
      if valid[index] {
        writer.write_all(&(index as u16).to_le_bytes())?;
        writer.write_all(&value.to_le_bytes())?;
      }
    }
    self.records_written += 1;
    Ok(())
  }

  /// ### CLOSE
  pub fn close(&mut self) -> std::io::Result<()> {
    if let Some(mut writer) = self.writer.take() {
      writer.flush()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn histo1d_fills_and_clips() {
    let mut histo: Histo1D = Histo1D::new(10, 0.0, 100.0);
    histo.fill(-1.0);
    histo.fill(0.0);
    histo.fill(55.0);
    histo.fill(100.0);
    histo.fill(1e9);

    assert_eq!(histo.entry_count, 5);
    assert_eq!(histo.underflow, 1.0);
    assert_eq!(histo.overflow, 2.0);
    assert_eq!(histo.bins[0], 1.0);
    assert_eq!(histo.bins[5], 1.0);
    assert_eq!(histo.max_bin().1, 1.0);

    histo.clear();
    assert_eq!(histo.entry_count, 0);
    assert!(histo.bins.iter().all(|bin| *bin == 0.0));
  }

  #[test]
  fn histo2d_bins_row_major() {
    let mut histo: Histo2D = Histo2D::new(4, 0.0, 4.0, 4, 0.0, 4.0);
    histo.fill(1.5, 2.5);
    assert_eq!(histo.bins[2 * 4 + 1], 1.0);
    histo.fill(-1.0, 0.0);
    assert_eq!(histo.out_of_range, 1);
  }

  #[test]
  fn rate_monitor_samples_are_bounded() {
    let mut monitor: RateMonitor = RateMonitor::new(3);
    for _ in 0..10 {
      monitor.count();
      std::thread::sleep(std::time::Duration::from_millis(1));
      monitor.sample();
    }
    assert!(monitor.samples.len() <= 3);
    assert_eq!(monitor.total_count, 10);
  }

  #[test]
  fn export_sink_writes_length_framed_records() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("export.bin");
    let mut sink: ExportSink = ExportSink::new(path.clone(), ExportFormat::Plain);
    sink.open().unwrap();
    sink.write_record(&[1.0, 2.0, 3.0], &[true, false, true]).unwrap();
    sink.close().unwrap();

    let bytes: Vec<u8> = std::fs::read(&path).unwrap();
    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
    assert_eq!(u16::from_le_bytes(bytes[4..6].try_into().unwrap()), 0);
    assert_eq!(f64::from_le_bytes(bytes[6..14].try_into().unwrap()), 1.0);
    assert_eq!(u16::from_le_bytes(bytes[14..16].try_into().unwrap()), 2);
    assert_eq!(bytes.len(), 4 + 2 * 10);
  }
}

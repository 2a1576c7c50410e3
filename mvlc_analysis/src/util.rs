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

//! # UTILITIES

use std::time::{Duration, Instant};

/// ## LEAKY BUCKET METER
///
/// Rate limiting for log messages: lets `capacity` events through per
/// `interval` and tells the caller how many were suppressed since the last
/// one that passed.
#[derive(Clone, Debug)]
pub struct LeakyBucketMeter {
  capacity: u64,
  interval: Duration,
  count: u64,
  overflow: u64,
  last_time: Instant,
}

impl LeakyBucketMeter {
  /// ### NEW METER
  pub fn new(capacity: u64, interval: Duration) -> Self {
    LeakyBucketMeter {
      capacity,
      interval,
      count: 0,
      overflow: 0,
      last_time: Instant::now(),
    }
  }

  /// ### EVENT OVERFLOWS
  ///
  /// Returns true when the bucket is full and the event should be
  /// suppressed. A capacity of 0 disables metering.
  pub fn event_overflows(&mut self) -> bool {
    if self.capacity == 0 {
      return false;
    }
    self.age();
    if self.count >= self.capacity {
      self.overflow += 1;
      return true;
    }
    self.count += 1;
    self.overflow = 0;
    false
  }

  /// ### OVERFLOW
  ///
  /// Events suppressed since the last one that passed.
  pub fn overflow(&self) -> u64 {
    self.overflow
  }

  /// ### RESET
  pub fn reset(&mut self) {
    self.count = 0;
    self.overflow = 0;
    self.last_time = Instant::now();
  }

  fn age(&mut self) {
    let elapsed: Duration = self.last_time.elapsed();
    if elapsed > self.interval {
      let to_remove: u64 = (elapsed.as_secs_f64() / self.interval.as_secs_f64()) as u64 * self.capacity;
      self.count = self.count.saturating_sub(to_remove);
      self.last_time = Instant::now();
    }
  }
}

/// ## THROTTLED LOGGER
///
/// A [Leaky Bucket Meter] in front of the log: consumers running per event
/// call [log] freely and the output stays bounded, with a suppression
/// count attached whenever messages were dropped.
///
/// [Leaky Bucket Meter]: LeakyBucketMeter
/// [log]:                ThrottledLogger::log
#[derive(Clone, Debug)]
pub struct ThrottledLogger {
  meter: LeakyBucketMeter,
  suppressed_total: u64,
}

impl ThrottledLogger {
  /// ### NEW LOGGER
  pub fn new(messages_per_second: u64) -> Self {
    ThrottledLogger {
      meter: LeakyBucketMeter::new(messages_per_second, Duration::from_secs(1)),
      suppressed_total: 0,
    }
  }

  /// ### LOG
  ///
  /// Returns whether the message was emitted.
  pub fn log(&mut self, message: &str) -> bool {
    if self.meter.event_overflows() {
      self.suppressed_total += 1;
      return false;
    }
    let suppressed: u64 = self.meter.overflow();
    if suppressed > 0 {
      tracing::warn!(suppressed, "{message}");
    } else {
      tracing::warn!("{message}");
    }
    true
  }

  /// ### SUPPRESSED TOTAL
  pub fn suppressed_total(&self) -> u64 {
    self.suppressed_total
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn capacity_events_pass_then_overflow() {
    let mut meter: LeakyBucketMeter = LeakyBucketMeter::new(3, Duration::from_secs(3600));
    assert!(!meter.event_overflows());
    assert!(!meter.event_overflows());
    assert!(!meter.event_overflows());
    assert!(meter.event_overflows());
    assert!(meter.event_overflows());
    assert_eq!(meter.overflow(), 2);

    meter.reset();
    assert!(!meter.event_overflows());
  }

  #[test]
  fn zero_capacity_never_overflows() {
    let mut meter: LeakyBucketMeter = LeakyBucketMeter::new(0, Duration::from_millis(1));
    for _ in 0..100 {
      assert!(!meter.event_overflows());
    }
  }

  #[test]
  fn bucket_drains_with_time() {
    let mut meter: LeakyBucketMeter = LeakyBucketMeter::new(2, Duration::from_millis(5));
    assert!(!meter.event_overflows());
    assert!(!meter.event_overflows());
    assert!(meter.event_overflows());
    std::thread::sleep(Duration::from_millis(10));
    assert!(!meter.event_overflows());
  }

  #[test]
  fn throttled_logger_counts_suppressions() {
    let mut logger: ThrottledLogger = ThrottledLogger::new(2);
    let emitted: usize = (0..10).filter(|_| logger.log("noisy consumer")).count();
    assert_eq!(emitted, 2);
    assert_eq!(logger.suppressed_total(), 8);
  }
}

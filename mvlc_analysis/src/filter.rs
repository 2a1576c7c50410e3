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

//! # BIT-MATCH FILTERS
//!
//! Module data words are recognized and decomposed with 32-character filter
//! strings, written MSB first:
//!
//! - `0` and `1` match exact bits.
//! - `X` matches any bit.
//! - `A` bits form the *address* field (parameter index).
//! - `D` bits form the *data* field (parameter value).
//! - `S` bits form the *size* field (multi-event header length).
//!
//! Spaces group nibbles for readability and are ignored. A filter compiles
//! once into a mask/value pair plus one mask per field; matching and field
//! extraction afterwards are a handful of bit operations with no
//! allocation.

use thiserror::Error;

/// ## FILTER ERROR
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FilterError {
  /// ### WRONG LENGTH
  #[error("filter has {0} significant characters, expected 32")]
  WrongLength(usize),

  /// ### BAD CHARACTER
  #[error("filter contains unsupported character '{0}'")]
  BadCharacter(char),
}

/// ## DATA FILTER
///
/// One compiled filter string.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DataFilter {
  /// ### MATCH MASK
  pub match_mask: u32,

  /// ### MATCH VALUE
  pub match_value: u32,

  /// ### ADDRESS MASK
  pub address_mask: u32,

  /// ### DATA MASK
  pub data_mask: u32,

  /// ### SIZE MASK
  pub size_mask: u32,
}

impl DataFilter {
  /// ### COMPILE
  ///
  /// Compiles a filter string; see the module documentation for the
  /// character set.
  pub fn compile(pattern: &str) -> Result<Self, FilterError> {
    let significant: Vec<char> = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    if significant.len() != 32 {
      return Err(FilterError::WrongLength(significant.len()));
    }

    let mut filter: DataFilter = DataFilter::default();
    for (position, character) in significant.iter().enumerate() {
      let bit: u32 = 1 << (31 - position);
      match character {
        '0' => filter.match_mask |= bit,
        '1' => {
          filter.match_mask |= bit;
          filter.match_value |= bit;
        }
        'X' | 'x' => {}
        'A' | 'a' => filter.address_mask |= bit,
        'D' | 'd' => filter.data_mask |= bit,
        'S' | 's' => filter.size_mask |= bit,
        other => return Err(FilterError::BadCharacter(*other)),
      }
    }
    Ok(filter)
  }

  /// ### MATCHES
  pub fn matches(&self, word: u32) -> bool {
    word & self.match_mask == self.match_value
  }

  /// ### EXTRACT ADDRESS
  pub fn extract_address(&self, word: u32) -> u32 {
    gather_bits(word, self.address_mask)
  }

  /// ### EXTRACT DATA
  pub fn extract_data(&self, word: u32) -> u32 {
    gather_bits(word, self.data_mask)
  }

  /// ### EXTRACT SIZE
  pub fn extract_size(&self, word: u32) -> u32 {
    gather_bits(word, self.size_mask)
  }

  /// ### ADDRESS COUNT
  ///
  /// The number of distinct address values, i.e. the parameter array size
  /// a source built from this filter produces.
  pub fn address_count(&self) -> usize {
    1usize << self.address_mask.count_ones()
  }

  /// ### DATA BITS
  pub fn data_bits(&self) -> u32 {
    self.data_mask.count_ones()
  }
}

/// ## GATHER BITS
///
/// Collects the bits of `word` selected by `mask` into a compact value,
/// preserving their order.
pub fn gather_bits(word: u32, mask: u32) -> u32 {
  let mut result: u32 = 0;
  let mut out_bit: u32 = 0;
  for bit in 0..32 {
    if mask & (1 << bit) != 0 {
      result |= ((word >> bit) & 1) << out_bit;
      out_bit += 1;
    }
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn compile_and_match() {
    let filter: DataFilter = DataFilter::compile("0001 XXXX XXAA AAAX DDDD DDDD DDDD DDDD").unwrap();
    assert!(filter.matches(0x1000_0000));
    assert!(filter.matches(0x1F00_1234));
    assert!(!filter.matches(0x2000_0000));

    // Address bits 17..=21, data bits 0..=15.
    let word: u32 = 0x1000_0000 | (5 << 17) | 0xBEEF;
    assert_eq!(filter.extract_address(word), 5);
    assert_eq!(filter.extract_data(word), 0xBEEF);
    assert_eq!(filter.address_count(), 32);
    assert_eq!(filter.data_bits(), 16);
  }

  #[test]
  fn scattered_fields_gather_in_order(){
    // Address bits split around fixed bits.
    let filter: DataFilter = DataFilter::compile("AAXX XXXX XXXX XXXX XXXX XXXX XXXX XXAA").unwrap();
    assert_eq!(filter.extract_address(0b11 << 30 | 0b01), 0b1101);
    assert_eq!(filter.address_count(), 16);
  }

  #[test]
  fn whitespace_is_ignored() {
    let compact: DataFilter = DataFilter::compile("00000000000000000000000000000000").unwrap();
    let spaced: DataFilter = DataFilter::compile("0000 0000 0000 0000 0000 0000 0000 0000").unwrap();
    assert_eq!(compact, spaced);
  }

  #[test]
  fn bad_patterns_are_rejected() {
    assert_eq!(DataFilter::compile("0000").unwrap_err(), FilterError::WrongLength(4));
    assert_eq!(
      DataFilter::compile("Q000 0000 0000 0000 0000 0000 0000 0000").unwrap_err(),
      FilterError::BadCharacter('Q'),
    );
  }

  #[test]
  fn multievent_header_size_field() {
    // A module header: 0xFF in the top byte, length in bits 16..=23.
    let filter: DataFilter = DataFilter::compile("1111 1111 SSSS SSSS XXXX XXXX XXXX XXXX").unwrap();
    assert!(filter.matches(0xFF03_0000));
    assert_eq!(filter.extract_size(0xFF03_0000), 3);
    assert!(!filter.matches(0x0103_0000));
  }
}

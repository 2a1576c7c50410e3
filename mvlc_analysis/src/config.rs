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

//! # ANALYSIS CONFIGURATION
//!
//! The JSON description of an analysis graph, as stored in the
//! `analysis.analysis` archive entry. Loading compiles filter strings and
//! resolves node references into an [Analysis Graph]; old config versions
//! migrate forward on load, and a migrated config reserializes stably at
//! the current version.
//!
//! [Analysis Graph]: crate::graph::AnalysisGraph

use crate::filter::{DataFilter, FilterError};
use crate::graph::{
  AnalysisGraph,
  ArithmeticOp,
  DataSource,
  NodeRef,
  OperatorDef,
  OperatorKind,
  SinkDef,
  SinkKind,
  Slot,
};
use crate::sinks::ExportFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// ## CURRENT ANALYSIS VERSION
pub const CURRENT_ANALYSIS_VERSION: u32 = 4;

/// ## CONFIG ERROR
#[derive(Debug, Error)]
pub enum ConfigError {
  /// ### JSON
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// ### FILTER
  #[error("in '{name}': {error}")]
  Filter { name: String, error: FilterError },

  /// ### UNSUPPORTED VERSION
  #[error("analysis version {0} is newer than this build supports")]
  UnsupportedVersion(u32),
}

/// ## DIRECTORY CONFIG
///
/// A named grouping of objects for display purposes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DirectoryConfig {
  /// ### NAME
  pub name: String,

  /// ### MEMBERS
  ///
  /// Object names contained in the directory.
  pub members: Vec<String>,
}

/// ## SOURCE CONFIG
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SourceConfig {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### MODULE INDEX
  pub module_index: usize,

  /// ### MODULE NAME
  pub module_name: String,

  /// ### FILTER STRING
  pub filter: String,
}

/// ## NODE CONFIG
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum NodeConfig {
  /// ### SOURCE
  Source(usize),

  /// ### OPERATOR
  Operator(usize),
}

/// ## SLOT CONFIG
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SlotConfig {
  /// ### UPSTREAM NODE
  pub from: NodeConfig,

  /// ### ELEMENT SELECTION
  #[serde(default)]
  pub element: Option<usize>,
}

/// ## OPERATOR KIND CONFIG
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OperatorKindConfig {
  /// ### CALIBRATION
  Calibration { factor: f64, offset: f64, unit_min: f64, unit_max: f64 },

  /// ### INDEX REMAP
  IndexRemap { mapping: Vec<Option<usize>> },

  /// ### DIFFERENCE
  Difference,

  /// ### SUM
  Sum,

  /// ### ARITHMETIC
  Arithmetic { op: String },

  /// ### RANGE SELECTOR
  RangeSelector { begin: usize, end: usize },

  /// ### WINDOW FILTER
  WindowFilter { min: f64, max: f64 },

  /// ### CONDITION
  Condition { min: f64, max: f64 },
}

/// ## OPERATOR CONFIG
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OperatorConfig {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### KIND
  pub kind: OperatorKindConfig,

  /// ### INPUTS
  pub inputs: Vec<SlotConfig>,
}

/// ## SINK KIND CONFIG
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SinkKindConfig {
  /// ### HISTO 1D
  Histo1d { bins: usize },

  /// ### HISTO 2D
  Histo2d { x_bins: usize, y_bins: usize },

  /// ### RATE MONITOR
  RateMonitor { capacity: usize },

  /// ### EXPORT
  Export { path: String, gzip: bool },
}

/// ## SINK CONFIG
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SinkConfig {
  /// ### NAME
  pub name: String,

  /// ### EVENT INDEX
  pub event_index: usize,

  /// ### INPUTS
  pub inputs: Vec<SlotConfig>,

  /// ### KIND
  pub kind: SinkKindConfig,
}

/// ## ANALYSIS CONFIG
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AnalysisConfig {
  /// ### VERSION
  pub version: u32,

  /// ### DIRECTORIES
  #[serde(default)]
  pub directories: Vec<DirectoryConfig>,

  /// ### SOURCES
  #[serde(default)]
  pub sources: Vec<SourceConfig>,

  /// ### OPERATORS
  #[serde(default)]
  pub operators: Vec<OperatorConfig>,

  /// ### SINKS
  #[serde(default)]
  pub sinks: Vec<SinkConfig>,

  /// ### CONDITION LINKS
  ///
  /// Gated operator index → condition operator index.
  #[serde(default)]
  pub condition_links: BTreeMap<usize, usize>,
}

impl AnalysisConfig {
  /// ### FROM JSON
  ///
  /// Parses and migrates to the current version in one step.
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let config: AnalysisConfig = serde_json::from_str(json)?;
    if config.version > CURRENT_ANALYSIS_VERSION {
      return Err(ConfigError::UnsupportedVersion(config.version));
    }
    Ok(migrate_to_current(config))
  }

  /// ### TO JSON
  pub fn to_json(&self) -> String {
    serde_json::to_string_pretty(self).expect("config model serializes")
  }

  /// ### DIRECTORY EXISTS
  pub fn directory_exists(&self, name: &str) -> bool {
    self.directories.iter().any(|directory| directory.name == name)
  }

  /// ### BUILD GRAPH
  ///
  /// Compiles filter strings and resolves references into the runtime
  /// graph model.
  pub fn build_graph(&self) -> Result<AnalysisGraph, ConfigError> {
    let sources: Vec<DataSource> = self
      .sources
      .iter()
      .map(|source| {
        Ok(DataSource {
          name: source.name.clone(),
          event_index: source.event_index,
          module_index: source.module_index,
          filter: DataFilter::compile(&source.filter)
            .map_err(|error| ConfigError::Filter { name: source.name.clone(), error })?,
        })
      })
      .collect::<Result<_, ConfigError>>()?;

    let operators: Vec<OperatorDef> = self
      .operators
      .iter()
      .map(|operator| OperatorDef {
        name: operator.name.clone(),
        event_index: operator.event_index,
        kind: operator_kind(&operator.kind),
        inputs: operator.inputs.iter().map(slot).collect(),
      })
      .collect();

    let sinks: Vec<SinkDef> = self
      .sinks
      .iter()
      .map(|sink| SinkDef {
        name: sink.name.clone(),
        event_index: sink.event_index,
        inputs: sink.inputs.iter().map(slot).collect(),
        kind: match &sink.kind {
          SinkKindConfig::Histo1d { bins } => SinkKind::Histo1D { bins: *bins },
          SinkKindConfig::Histo2d { x_bins, y_bins } => SinkKind::Histo2D { x_bins: *x_bins, y_bins: *y_bins },
          SinkKindConfig::RateMonitor { capacity } => SinkKind::RateMonitor { capacity: *capacity },
          SinkKindConfig::Export { path, gzip } => SinkKind::Export {
            path: PathBuf::from(path),
            format: if *gzip { ExportFormat::Gzip } else { ExportFormat::Plain },
          },
        },
      })
      .collect();

    Ok(AnalysisGraph {
      sources,
      operators,
      sinks,
      condition_links: self.condition_links.clone(),
    })
  }
}

fn slot(config: &SlotConfig) -> Slot {
  Slot {
    from: match config.from {
      NodeConfig::Source(index) => NodeRef::Source(index),
      NodeConfig::Operator(index) => NodeRef::Operator(index),
    },
    element: config.element,
  }
}

fn operator_kind(config: &OperatorKindConfig) -> OperatorKind {
  match config {
    OperatorKindConfig::Calibration { factor, offset, unit_min, unit_max } => OperatorKind::Calibration {
      factor: *factor,
      offset: *offset,
      unit_min: *unit_min,
      unit_max: *unit_max,
    },
    OperatorKindConfig::IndexRemap { mapping } => OperatorKind::IndexRemap { mapping: mapping.clone() },
    OperatorKindConfig::Difference => OperatorKind::Difference,
    OperatorKindConfig::Sum => OperatorKind::Sum,
    OperatorKindConfig::Arithmetic { op } => OperatorKind::Arithmetic {
      op: match op.as_str() {
        "+" => ArithmeticOp::Add,
        "-" => ArithmeticOp::Subtract,
        "*" => ArithmeticOp::Multiply,
        _ => ArithmeticOp::Divide,
      },
    },
    OperatorKindConfig::RangeSelector { begin, end } => OperatorKind::RangeSelector { begin: *begin, end: *end },
    OperatorKindConfig::WindowFilter { min, max } => OperatorKind::WindowFilter { min: *min, max: *max },
    OperatorKindConfig::Condition { min, max } => OperatorKind::Condition { min: *min, max: *max },
  }
}

/// ## MIGRATE TO CURRENT
///
/// Applies version migrations in order. Version 3 configs carried
/// machine-generated directory names for the per-module raw histogram
/// groups (`raw.histos.<module>`); version 4 renames them to the display
/// form "Raw Histos <module>" and guarantees one such directory per module
/// that has raw histogram sinks.
pub fn migrate_to_current(mut config: AnalysisConfig) -> AnalysisConfig {
  if config.version < 4 {
    // Rename legacy directories in place.
    for directory in &mut config.directories {
      if let Some(module) = directory.name.strip_prefix("raw.histos.") {
        directory.name = format!("Raw Histos {module}");
      }
    }

    // Every module with a raw histogram sink gets its directory; sinks
    // feeding directly from a source count as raw.
    for source_index in 0..config.sources.len() {
      let source: SourceConfig = config.sources[source_index].clone();
      let raw_sinks: Vec<String> = config
        .sinks
        .iter()
        .filter(|sink| {
          matches!(sink.kind, SinkKindConfig::Histo1d { .. })
            && sink.inputs.iter().any(|slot| slot.from == NodeConfig::Source(source_index))
        })
        .map(|sink| sink.name.clone())
        .collect();
      if raw_sinks.is_empty() {
        continue;
      }
      let directory_name: String = format!("Raw Histos {}", source.module_name);
      match config.directories.iter_mut().find(|directory| directory.name == directory_name) {
        Some(directory) => {
          for sink_name in raw_sinks {
            if !directory.members.contains(&sink_name) {
              directory.members.push(sink_name);
            }
          }
        }
        None => {
          config.directories.push(DirectoryConfig { name: directory_name, members: raw_sinks });
        }
      }
    }
    config.version = 4;
  }
  config
}

#[cfg(test)]
mod tests {
  use super::*;

  fn v3_config() -> AnalysisConfig {
    let modules: [&str; 4] = ["madc32", "mdpp16_csi", "mdpp32_padc", "mqdc32"];
    let mut config: AnalysisConfig = AnalysisConfig { version: 3, ..Default::default() };
    for (index, module) in modules.iter().enumerate() {
      config.sources.push(SourceConfig {
        name: format!("{module}.amplitude"),
        event_index: 0,
        module_index: index,
        module_name: module.to_string(),
        filter: "0001 XXXX XXXX AAAA XXXD DDDD DDDD DDDD".to_string(),
      });
      config.sinks.push(SinkConfig {
        name: format!("{module}.raw"),
        event_index: 0,
        inputs: vec![SlotConfig { from: NodeConfig::Source(index), element: None }],
        kind: SinkKindConfig::Histo1d { bins: 1 << 13 },
      });
    }
    // One legacy-named directory to exercise the rename path.
    config.directories.push(DirectoryConfig {
      name: "raw.histos.madc32".to_string(),
      members: vec!["madc32.raw".to_string()],
    });
    config
  }

  #[test]
  fn v3_migrates_to_v4_directories() {
    let migrated: AnalysisConfig = migrate_to_current(v3_config());
    assert_eq!(migrated.version, CURRENT_ANALYSIS_VERSION);
    assert!(migrated.directory_exists("Raw Histos madc32"));
    assert!(migrated.directory_exists("Raw Histos mdpp16_csi"));
    assert!(migrated.directory_exists("Raw Histos mdpp32_padc"));
    assert!(migrated.directory_exists("Raw Histos mqdc32"));
    assert!(!migrated.directory_exists("raw.histos.madc32"));
  }

  #[test]
  fn migration_is_stable_under_reserialization() {
    let migrated: AnalysisConfig = migrate_to_current(v3_config());
    let json: String = migrated.to_json();
    let reloaded: AnalysisConfig = AnalysisConfig::from_json(&json).unwrap();
    assert_eq!(reloaded, migrated);

    // Loading the v3 form directly gives the same result.
    let from_v3: AnalysisConfig = AnalysisConfig::from_json(&v3_config().to_json()).unwrap();
    assert_eq!(from_v3, migrated);
  }

  #[test]
  fn migrated_config_builds_a_runtime_graph() {
    let migrated: AnalysisConfig = migrate_to_current(v3_config());
    let graph: AnalysisGraph = migrated.build_graph().unwrap();
    assert_eq!(graph.sources.len(), 4);
    assert_eq!(graph.sinks.len(), 4);
    assert!(crate::graph::AnalysisRuntime::build(graph, 0).is_ok());
  }

  #[test]
  fn future_versions_are_rejected() {
    let json: String = AnalysisConfig { version: 99, ..Default::default() }.to_json();
    assert!(matches!(
      AnalysisConfig::from_json(&json).unwrap_err(),
      ConfigError::UnsupportedVersion(99),
    ));
  }

  #[test]
  fn operator_and_sink_kinds_roundtrip() {
    let config: AnalysisConfig = AnalysisConfig {
      version: CURRENT_ANALYSIS_VERSION,
      operators: vec![OperatorConfig {
        name: "cal".to_string(),
        event_index: 0,
        kind: OperatorKindConfig::Calibration { factor: 2.0, offset: 0.5, unit_min: 0.0, unit_max: 100.0 },
        inputs: vec![SlotConfig { from: NodeConfig::Source(0), element: Some(3) }],
      }],
      sinks: vec![SinkConfig {
        name: "export".to_string(),
        event_index: 0,
        inputs: vec![SlotConfig { from: NodeConfig::Operator(0), element: None }],
        kind: SinkKindConfig::Export { path: "out.bin.gz".to_string(), gzip: true },
      }],
      ..Default::default()
    };
    let reloaded: AnalysisConfig = AnalysisConfig::from_json(&config.to_json()).unwrap();
    assert_eq!(reloaded, config);
  }
}

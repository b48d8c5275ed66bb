//! Run configuration, read from a JSON file.
//!
//! Offsets of unexported routines are build specific: they belong in the
//! configuration of a given library build, never in code.

use cache_side_channel::time_series::OverflowPolicy;
use flush_reload::{Cadence, SchedulerConfig};
use itertools::Itertools;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no target configured")]
    NoTargets,
    #[error("target {0:?} configured more than once")]
    DuplicateTarget(String),
    #[error("target {0:?} has neither a symbol nor an offset")]
    MissingStrategy(String),
    #[error("target {0:?} covers zero cache lines")]
    ZeroLines(String),
    #[error("fixed slot cadence needs a non zero slot_cycles")]
    ZeroSlot,
    #[error("capacity must be at least one round")]
    ZeroCapacity,
    #[error("decoder lookahead must be at least one round")]
    ZeroLookahead,
    #[error("decoder refers to unknown target {0:?}")]
    UnknownDecoderTarget(String),
}

/// How to find one monitored routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    pub name: String,
    /// Exported symbol, looked up in the dynamic symbol table.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Byte offset from the library load base. Used on its own, or when the
    /// symbol is not exported.
    #[serde(default, deserialize_with = "deserialize_offset")]
    pub offset: Option<usize>,
    #[serde(default = "default_lines")]
    pub lines: usize,
}

impl TargetSpec {
    pub fn symbol(name: &str, symbol: &str) -> Self {
        TargetSpec {
            name: name.to_owned(),
            symbol: Some(symbol.to_owned()),
            offset: None,
            lines: 1,
        }
    }

    pub fn offset(name: &str, offset: usize) -> Self {
        TargetSpec {
            name: name.to_owned(),
            symbol: None,
            offset: Some(offset),
            lines: 1,
        }
    }
}

/// Names of the square, multiply and reduce targets and the multiply lookahead.
/// The lookahead is tied to the victim's per operation latency and the slot
/// length; tune both together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    #[serde(default = "default_square")]
    pub square: String,
    #[serde(default = "default_multiply")]
    pub multiply: String,
    #[serde(default = "default_reduce")]
    pub reduce: String,
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            square: default_square(),
            multiply: default_multiply(),
            reduce: default_reduce(),
            lookahead: default_lookahead(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    /// Passed as is to the dynamic loader.
    pub library: PathBuf,
    /// Substring of the mapped file name, defaults to the file name of
    /// `library`.
    #[serde(default)]
    pub map_name: Option<String>,
    pub targets: Vec<TargetSpec>,
    /// Hit threshold in counter ticks. Calibrated at startup when absent.
    #[serde(default)]
    pub threshold: Option<u64>,
    #[serde(default = "default_calibration_iterations")]
    pub calibration_iterations: u32,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u64,
    /// Samples held per probe point, defaults to `max_rounds`.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_true")]
    pub evict_before_probe: bool,
    #[serde(default)]
    pub pin_core: Option<usize>,
    #[serde(default = "default_progress")]
    pub progress_interval: u64,
    #[serde(default = "default_progress_window")]
    pub progress_window: usize,
    #[serde(default)]
    pub decoder: Option<DecoderConfig>,
}

fn default_lines() -> usize {
    1
}

fn default_square() -> String {
    "square".to_owned()
}

fn default_multiply() -> String {
    "multiply".to_owned()
}

fn default_reduce() -> String {
    "reduce".to_owned()
}

fn default_lookahead() -> usize {
    4
}

fn default_calibration_iterations() -> u32 {
    100_000
}

fn default_max_rounds() -> u64 {
    50_000
}

fn default_true() -> bool {
    true
}

fn default_progress() -> u64 {
    1000
}

fn default_progress_window() -> usize {
    1000
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOffset {
    Int(u64),
    Text(String),
}

/// Parses `0x51470`, `0X51470` or `333936`.
pub fn parse_offset(text: &str) -> Result<usize, std::num::ParseIntError> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    }
}

fn deserialize_offset<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawOffset>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawOffset::Int(v)) => usize::try_from(v).map(Some).map_err(de::Error::custom),
        Some(RawOffset::Text(s)) => parse_offset(&s)
            .map(Some)
            .map_err(|e| de::Error::custom(format!("offset {:?}: {}", s, e))),
    }
}

impl TraceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: TraceConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if let Some(name) = self.targets.iter().map(|t| &t.name).duplicates().next() {
            return Err(ConfigError::DuplicateTarget(name.clone()));
        }
        for t in &self.targets {
            if t.symbol.is_none() && t.offset.is_none() {
                return Err(ConfigError::MissingStrategy(t.name.clone()));
            }
            if t.lines == 0 {
                return Err(ConfigError::ZeroLines(t.name.clone()));
            }
        }
        if let Cadence::FixedSlot { slot_cycles: 0 } = self.cadence {
            return Err(ConfigError::ZeroSlot);
        }
        if self.capacity() == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if let Some(decoder) = &self.decoder {
            if decoder.lookahead == 0 {
                return Err(ConfigError::ZeroLookahead);
            }
            for name in [&decoder.square, &decoder.multiply, &decoder.reduce] {
                if !self.targets.iter().any(|t| &t.name == name) {
                    return Err(ConfigError::UnknownDecoderTarget(name.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn map_name(&self) -> String {
        match &self.map_name {
            Some(name) => name.clone(),
            None => self
                .library
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.library.to_string_lossy().into_owned()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
            .unwrap_or_else(|| usize::try_from(self.max_rounds).unwrap_or(usize::MAX))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            cadence: self.cadence,
            max_rounds: self.max_rounds,
            capacity: self.capacity(),
            overflow: self.overflow,
            evict_before_probe: self.evict_before_probe,
            progress_interval: self.progress_interval,
            progress_window: self.progress_window,
        }
    }
}

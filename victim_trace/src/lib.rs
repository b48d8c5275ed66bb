#![deny(unsafe_op_in_unsafe_fn)]

// Tracing of a victim process through its shared library code.
//
// Flow: load the configuration, resolve every target once, calibrate (or take
// the configured threshold), sample rounds until stopped, then aggregate and
// decode. Everything that can fail fatally fails before sampling starts.

use cache_side_channel::SideChannelError;
use std::path::PathBuf;
use thiserror::Error;

pub mod capture;
pub mod config;
pub mod decoder;
pub mod report;
pub mod resolver;

pub use capture::{Capture, CaptureFile};
pub use config::{ConfigError, DecoderConfig, TargetSpec, TraceConfig};
pub use decoder::{bits_to_string, BitSymbol, IncrementalDecoder, PatternDecoder};
pub use report::{PointSummary, RunSummary};
pub use resolver::{Library, MemoryMaps, ResolveError, TargetResolver};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    SideChannel(#[from] SideChannelError),
    #[error("capture has no target named {0:?}")]
    MissingTarget(String),
    #[error("calibration produced no usable histogram")]
    Calibration,
    #[error("calibration buffer: {0}")]
    Mmap(#[from] nix::Error),
    #[error("cannot install stop handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding capture: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decoding capture: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("encoding summary: {0}")]
    Json(#[from] serde_json::Error),
}

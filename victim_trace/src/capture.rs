use crate::TraceError;
use cache_side_channel::time_series::TraceStore;
use chrono::{DateTime, Utc};
use flush_reload::{RunOutcome, StopReason};
use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A raw capture, complete or partial, kept for offline decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub captured_at: DateTime<Utc>,
    pub stop_reason: Option<StopReason>,
    pub elapsed_cycles: u64,
    pub store: TraceStore,
}

impl Capture {
    pub const EXTENSION: &'static str = "trace.msgpack";

    pub fn new(store: TraceStore, outcome: &RunOutcome) -> Self {
        Capture {
            captured_at: Utc::now(),
            stop_reason: Some(outcome.stop_reason),
            elapsed_cycles: outcome.elapsed_cycles,
            store,
        }
    }

    pub fn read_msgpack(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let buf = std::fs::read(path).map_err(|source| TraceError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut deserializer = Deserializer::new(&buf[..]);
        Ok(Capture::deserialize(&mut deserializer)?)
    }

    pub fn write_msgpack(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        CaptureFile::create(path)?.write(self)
    }
}

/// Destination of a capture, created up front so that a bad path shows up
/// before any sampling.
#[derive(Debug)]
pub struct CaptureFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CaptureFile {
    /// Creates or truncates `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref().to_owned();
        match File::create(&path) {
            Ok(file) => Ok(CaptureFile {
                path,
                writer: BufWriter::new(file),
            }),
            Err(source) => Err(TraceError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(mut self, capture: &Capture) -> Result<(), TraceError> {
        {
            let mut s = Serializer::new(&mut self.writer);
            capture.serialize(&mut s)?;
        }
        self.writer.flush().map_err(|source| TraceError::Io {
            path: self.path,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::time_series::OverflowPolicy;
    use cache_side_channel::{CacheStatus, Measurement, MonitoredTarget, Threshold};

    #[test]
    fn partial_capture_reloads() {
        let targets = vec![
            MonitoredTarget::new(0, "square", 0x7f00_1000, 1),
            MonitoredTarget::new(1, "window", 0x7f00_2000, 3),
        ];
        let mut store = TraceStore::new(targets, Threshold::new(165), 8, OverflowPolicy::Overwrite);
        for r in 0..12u64 {
            let m = |hit: bool| Measurement {
                latency: if hit { 70 } else { 310 },
                status: if hit { CacheStatus::Hit } else { CacheStatus::Miss },
            };
            store
                .record_round(&[m(r % 3 == 0), m(false), m(true), m(r == 11)])
                .unwrap();
        }
        let outcome = RunOutcome {
            rounds: 12,
            stop_reason: StopReason::StopSignal,
            slot_starts: Vec::new(),
            elapsed_cycles: 123_456,
        };
        let capture = Capture::new(store, &outcome);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("run.{}", Capture::EXTENSION));
        capture.write_msgpack(&path).unwrap();
        let back = Capture::read_msgpack(&path).unwrap();

        assert_eq!(back.stop_reason, Some(StopReason::StopSignal));
        assert_eq!(back.elapsed_cycles, 123_456);
        assert_eq!(back.captured_at, capture.captured_at);
        assert_eq!(back.store.rounds(), 12);
        assert_eq!(back.store.first_round(), 4);
        assert_eq!(back.store.threshold(), Threshold::new(165));
        assert_eq!(back.store.targets(), capture.store.targets());
        assert_eq!(
            back.store.hit_sequence("square"),
            capture.store.hit_sequence("square")
        );
        let last = back.store.series_for(1, 2).unwrap();
        assert_eq!(last.iter().last().map(|s| (s.round, s.latency)), Some((11, 70)));
    }

    #[test]
    fn file_is_created_before_the_capture_exists() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CaptureFile::create(dir.path().join("missing/dir/run.trace.msgpack")),
            Err(TraceError::Io { path, .. }) if path.ends_with("missing/dir/run.trace.msgpack")
        ));

        let path = dir.path().join("early.trace.msgpack");
        let file = CaptureFile::create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(file.path(), path.as_path());

        let targets = vec![MonitoredTarget::new(0, "square", 0x7f00_1000, 1)];
        let mut store = TraceStore::new(targets, Threshold::new(165), 4, OverflowPolicy::Stop);
        store
            .record_round(&[Measurement {
                latency: 70,
                status: CacheStatus::Hit,
            }])
            .unwrap();
        let outcome = RunOutcome {
            rounds: 1,
            stop_reason: StopReason::RoundCap,
            slot_starts: Vec::new(),
            elapsed_cycles: 1,
        };
        file.write(&Capture::new(store, &outcome)).unwrap();
        let back = Capture::read_msgpack(&path).unwrap();
        assert_eq!(back.store.hit_sequence("square"), Some(vec![true]));
        assert_eq!(back.stop_reason, Some(StopReason::RoundCap));
    }

    #[test]
    fn missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.trace.msgpack");
        assert!(matches!(
            Capture::read_msgpack(&missing),
            Err(TraceError::Io { .. })
        ));
        let corrupt = dir.path().join("corrupt.trace.msgpack");
        std::fs::write(&corrupt, b"\xc1not msgpack").unwrap();
        assert!(matches!(
            Capture::read_msgpack(&corrupt),
            Err(TraceError::Decode(_))
        ));
    }
}

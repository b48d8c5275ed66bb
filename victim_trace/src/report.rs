use crate::decoder::{bits_to_string, BitSymbol};
use cache_side_channel::hit_rate::{
    check_calibration, cumulative_window, windowed_rate, DegenerateCalibration,
    HitRateAggregator, ACTIVE_RATE,
};
use cache_side_channel::time_series::TraceStore;
use chrono::{DateTime, Utc};
use flush_reload::StopReason;
use itertools::Itertools;
use serde::Serialize;
use std::fmt;

const BITS_PER_LINE: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    /// Target name, with the byte offset for lines past the first.
    pub name: String,
    pub line: usize,
    pub address: usize,
    /// Over every round of the run when running totals were kept, over the
    /// held samples otherwise.
    pub hits: u64,
    pub rounds: u64,
    pub rate: f64,
    pub windowed_rate: f64,
    pub active: bool,
}

/// What a run (or a reloaded capture) amounts to.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub total_rounds: u64,
    /// Rounds still held, lower than `total_rounds` after overwrites.
    pub held_rounds: u64,
    pub threshold: u64,
    pub stop_reason: Option<StopReason>,
    pub window: usize,
    pub points: Vec<PointSummary>,
    pub degenerate: Option<DegenerateCalibration>,
    pub bits: Option<String>,
    pub decoded: Vec<BitSymbol>,
}

impl RunSummary {
    /// `totals` are the running counters of the scheduler that filled
    /// `store`, they still count the rounds an overwriting store dropped.
    pub fn new(
        store: &TraceStore,
        totals: Option<&HitRateAggregator>,
        window: usize,
        stop_reason: Option<StopReason>,
        decoded: Option<Vec<BitSymbol>>,
    ) -> Self {
        // series are laid out target by target, line by line
        let names = store
            .targets()
            .iter()
            .flat_map(|t| (0..t.lines).map(move |line| t.line_name(line)));
        let points: Vec<_> = store
            .series()
            .iter()
            .zip(names)
            .enumerate()
            .map(|(i, (series, name))| {
                let point = series.point();
                let (hits, rounds, rate) = match totals {
                    Some(totals) => (totals.hits(i), totals.rounds(i), totals.cumulative_rate(i)),
                    None => {
                        let held = cumulative_window(series);
                        (held.hits, held.rounds, held.rate())
                    }
                };
                PointSummary {
                    name,
                    line: point.line,
                    address: point.address,
                    hits,
                    rounds,
                    rate,
                    windowed_rate: windowed_rate(series, window),
                    active: rate > ACTIVE_RATE,
                }
            })
            .collect();
        let rates: Vec<_> = points.iter().map(|p| p.rate).collect();
        let degenerate = if store.rounds() == 0 {
            None
        } else {
            check_calibration(&rates, store.threshold())
        };
        RunSummary {
            generated_at: Utc::now(),
            total_rounds: store.rounds(),
            held_rounds: store.rounds() - store.first_round(),
            threshold: store.threshold().value,
            stop_reason,
            window,
            points,
            degenerate,
            bits: decoded.as_deref().map(bits_to_string),
            decoded: decoded.unwrap_or_default(),
        }
    }

    pub fn active_points(&self) -> impl Iterator<Item = &PointSummary> + '_ {
        self.points.iter().filter(|p| p.active)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== RESULTS ({}) ===", self.generated_at.to_rfc3339())?;
        write!(f, "Total rounds: {}", self.total_rounds)?;
        if self.held_rounds != self.total_rounds {
            write!(f, " ({} held)", self.held_rounds)?;
        }
        if let Some(reason) = self.stop_reason {
            write!(f, ", stopped on {:?}", reason)?;
        }
        writeln!(f)?;
        writeln!(f, "Threshold: {}", self.threshold)?;
        for p in &self.points {
            writeln!(
                f,
                "  {:<24} {:#014x} {:8} hits ({:6.2}%, last {}: {:6.2}%){}",
                p.name,
                p.address,
                p.hits,
                p.rate * 100.0,
                self.window,
                p.windowed_rate * 100.0,
                if p.active { " ACTIVE" } else { "" }
            )?;
        }
        if let Some(d) = &self.degenerate {
            writeln!(
                f,
                "Threshold {} looks miscalibrated: {:?} (mean hit rate {:.4})",
                d.threshold.value, d.kind, d.mean_rate
            )?;
        }
        if let Some(bits) = &self.bits {
            writeln!(f, "Decoded {} bits:", bits.len())?;
            for line in &bits.chars().chunks(BITS_PER_LINE) {
                writeln!(f, "  {}", line.collect::<String>())?;
            }
        }
        Ok(())
    }
}

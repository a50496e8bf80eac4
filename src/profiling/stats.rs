//! Aggregate timing statistics
//!
//! Two tables keyed by display key: submitter-side wall time of API calls and
//! backend-side device execution time. Records are created on first
//! observation and kept for the whole session.

use std::collections::HashMap;
use std::io::Write;

use serde::Serialize;

use crate::error::ShimResult;

/// Which clock a delta was measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatSide {
    /// Host wall time around the API call
    Submitter,
    /// Device execution time from profiling timestamps
    Backend,
}

/// Running count/min/max/total (ns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatRecord {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub total: u64,
}

impl StatRecord {
    fn first(delta: u64) -> Self {
        StatRecord {
            count: 1,
            min: delta,
            max: delta,
            total: delta,
        }
    }

    fn observe(&mut self, delta: u64) {
        self.count += 1;
        self.min = self.min.min(delta);
        self.max = self.max.max(delta);
        self.total = self.total.saturating_add(delta);
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

/// One report row
#[derive(Debug, Clone, Serialize)]
pub struct StatRow {
    pub key: String,
    #[serde(flatten)]
    pub record: StatRecord,
    /// Share of the side's total time, in percent
    pub share_percent: f64,
}

#[derive(Debug, Default)]
pub struct AggregateStatsStore {
    submitter: HashMap<String, StatRecord>,
    backend: HashMap<String, StatRecord>,
}

impl AggregateStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, side: StatSide) -> &HashMap<String, StatRecord> {
        match side {
            StatSide::Submitter => &self.submitter,
            StatSide::Backend => &self.backend,
        }
    }

    pub fn record(&mut self, key: &str, side: StatSide, delta: u64) {
        let table = match side {
            StatSide::Submitter => &mut self.submitter,
            StatSide::Backend => &mut self.backend,
        };
        match table.get_mut(key) {
            Some(record) => record.observe(delta),
            None => {
                table.insert(key.to_string(), StatRecord::first(delta));
            }
        }
    }

    pub fn get(&self, key: &str, side: StatSide) -> Option<&StatRecord> {
        self.table(side).get(key)
    }

    pub fn len(&self, side: StatSide) -> usize {
        self.table(side).len()
    }

    pub fn is_empty(&self) -> bool {
        self.submitter.is_empty() && self.backend.is_empty()
    }

    pub fn side_total(&self, side: StatSide) -> u64 {
        self.table(side)
            .values()
            .fold(0u64, |acc, record| acc.saturating_add(record.total))
    }

    /// Rows sorted by key, each with its share of the side's total
    pub fn rows(&self, side: StatSide) -> Vec<StatRow> {
        let side_total = self.side_total(side);
        let mut rows: Vec<StatRow> = self
            .table(side)
            .iter()
            .map(|(key, record)| StatRow {
                key: key.clone(),
                record: *record,
                share_percent: if side_total == 0 {
                    0.0
                } else {
                    record.total as f64 * 100.0 / side_total as f64
                },
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Human-readable report of both sides
    pub fn write_report(&self, out: &mut dyn Write) -> ShimResult<()> {
        for (side, title) in [
            (StatSide::Submitter, "Host Performance Timing Results"),
            (StatSide::Backend, "Device Performance Timing Results"),
        ] {
            let rows = self.rows(side);
            if rows.is_empty() {
                continue;
            }
            let width = rows
                .iter()
                .map(|row| row.key.len())
                .max()
                .unwrap_or(0)
                .max("Function Name".len());

            writeln!(out)?;
            writeln!(out, "{title}:")?;
            writeln!(out)?;
            writeln!(out, "Total Time (ns): {}", self.side_total(side))?;
            writeln!(out)?;
            writeln!(
                out,
                "{:>width$}, {:>6}, {:>16}, {:>8}, {:>14}, {:>14}, {:>14}",
                "Function Name",
                "Calls",
                "Time (ns)",
                "Time (%)",
                "Average (ns)",
                "Min (ns)",
                "Max (ns)",
            )?;
            for row in &rows {
                writeln!(
                    out,
                    "{:>width$}, {:>6}, {:>16}, {:>7.2}%, {:>14.0}, {:>14}, {:>14}",
                    row.key,
                    row.record.count,
                    row.record.total,
                    row.share_percent,
                    row.record.average(),
                    row.record.min,
                    row.record.max,
                )?;
            }
        }
        Ok(())
    }
}

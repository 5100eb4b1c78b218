//! Per-code-section metric accumulation.
//!
//! Repeated per-thread samples of one counter merge into an
//! observation-weighted running mean. Thread-level measurement noise
//! occasionally produces spurious near-zero or vastly larger samples, so a
//! cheap two-sided ratio test keeps the mean robust without a separate
//! outlier-detection pass.

use crate::profile::registry::CounterRegistry;
use crate::profile::round3;

/// A new sample more than 10/3 times the current mean resets the average;
/// one below a third of the mean is discarded.
const RESET_RATIO: f64 = 0.3;
const DISCARD_RATIO: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Synthetic whole-program root.
    Aggregate,
    Function,
    Loop,
}

#[derive(Debug, Clone)]
pub struct SectionProfile {
    pub label: String,
    pub kind: SectionKind,
    pub filename: Option<String>,
    pub line: u64,
    /// 0 for non-loop sections.
    pub loop_depth: u32,
    values: Vec<f64>,
    counts: Vec<u32>,
    lcpi: Vec<f64>,
    /// Share of total program cycles; -1 until the aggregate total is known.
    importance: f64,
    /// Observed total-instruction extremes across accepted samples.
    instr_range: Option<(f64, f64)>,
}

impl SectionProfile {
    pub fn new(label: String, kind: SectionKind, slots: usize, lcpi_slots: usize) -> Self {
        Self {
            label,
            kind,
            filename: None,
            line: 0,
            loop_depth: 0,
            values: vec![0.0; slots],
            counts: vec![0; slots],
            lcpi: vec![0.0; lcpi_slots],
            importance: -1.0,
            instr_range: None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind == SectionKind::Aggregate
    }

    /// Fold one sample into the slot's running average, applying the outlier
    /// rule, tracking the instruction min/max, and recomputing importance
    /// whenever the cycles slot moves and the aggregate total is known.
    pub fn record_sample(&mut self, slot: usize, value: f64, registry: &CounterRegistry) {
        if slot >= self.values.len() {
            return;
        }

        let is_instructions = registry.index_of_instructions() == Some(slot);
        if self.counts[slot] != 0 {
            let average = self.values[slot] / self.counts[slot] as f64;
            let ratio = if value != 0.0 { average / value } else { 1.0 };

            if ratio < RESET_RATIO {
                // Prior accumulation looks like noise next to this sample.
                self.values[slot] = value;
                self.counts[slot] = 1;
                if is_instructions {
                    self.instr_range = Some((value, value));
                }
            } else if ratio > DISCARD_RATIO {
                // Low outlier, the established average wins.
                return;
            } else {
                self.values[slot] += value;
                self.counts[slot] += 1;
                if is_instructions {
                    self.widen_instr_range(value);
                }
            }
        } else {
            self.values[slot] += value;
            self.counts[slot] += 1;
            if is_instructions {
                self.widen_instr_range(value);
            }
        }

        if registry.index_of_cycles() == Some(slot) && registry.aggregate_cycles() != 0.0 {
            self.importance =
                (self.values[slot] / self.counts[slot] as f64) / registry.aggregate_cycles();
        }
    }

    fn widen_instr_range(&mut self, value: f64) {
        let (min, max) = self.instr_range.unwrap_or((f64::MAX, f64::MIN));
        self.instr_range = Some((min.min(value), max.max(value)));
    }

    /// Observation-weighted mean for a slot, rounded to three decimals;
    /// zero when the slot was never sampled.
    pub fn metric_mean(&self, slot: usize) -> f64 {
        match (self.values.get(slot), self.counts.get(slot)) {
            (Some(&value), Some(&count)) if count != 0 && value != 0.0 => {
                round3(value / count as f64)
            }
            _ => 0.0,
        }
    }

    pub fn metric_by_name(&self, name: &str, registry: &CounterRegistry) -> f64 {
        registry
            .slot_of(name)
            .map(|slot| self.metric_mean(slot))
            .unwrap_or(0.0)
    }

    /// Sampling variation of the instruction count, `(max - min) / max`.
    pub fn variation(&self) -> f64 {
        match self.instr_range {
            Some((min, max)) if max != 0.0 => round3((max - min) / max),
            _ => 0.0,
        }
    }

    pub fn importance(&self) -> f64 {
        round3(self.importance)
    }

    pub fn importance_known(&self) -> bool {
        self.importance != -1.0
    }

    pub fn set_importance(&mut self, importance: f64) {
        self.importance = importance;
    }

    /// Late importance resolution for sections whose cycles arrived before
    /// the aggregate total was discovered.
    pub fn resolve_importance(&mut self, cycles_slot: usize, aggregate_cycles: f64) {
        if self.importance_known() || aggregate_cycles == 0.0 {
            return;
        }
        if self.counts.get(cycles_slot).copied().unwrap_or(0) != 0 {
            self.importance =
                (self.values[cycles_slot] / self.counts[cycles_slot] as f64) / aggregate_cycles;
        }
    }

    pub fn lcpi(&self, index: usize) -> f64 {
        self.lcpi.get(index).copied().map(round3).unwrap_or(0.0)
    }

    pub fn set_lcpi(&mut self, index: usize, value: f64) {
        if let Some(slot) = self.lcpi.get_mut(index) {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CounterRegistry {
        let mut r = CounterRegistry::new();
        r.register(0, "PAPI_TOT_CYC");
        r.register(1, "PAPI_TOT_INS");
        r
    }

    fn section(r: &CounterRegistry) -> SectionProfile {
        SectionProfile::new("Function f()".into(), SectionKind::Function, r.len(), 0)
    }

    #[test]
    fn high_sample_resets_the_average() {
        let r = registry();
        let mut s = section(&r);
        for _ in 0..3 {
            s.record_sample(1, 10.0, &r);
        }
        s.record_sample(1, 100.0, &r); // avg 10 / 100 = 0.1 < 0.3
        assert_eq!(s.metric_mean(1), 100.0);
    }

    #[test]
    fn borderline_reset_at_ten_thirty_five() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(1, 10.0, &r);
        s.record_sample(1, 35.0, &r); // 10/35 ≈ 0.286 < 0.3
        assert_eq!(s.metric_mean(1), 35.0);
    }

    #[test]
    fn close_samples_accumulate() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(1, 10.0, &r);
        s.record_sample(1, 11.0, &r); // 10/11 ≈ 0.91, normal accumulation
        assert_eq!(s.metric_mean(1), 10.5);
    }

    #[test]
    fn low_outlier_is_discarded() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(1, 100.0, &r);
        s.record_sample(1, 10.0, &r); // 100/10 = 10 > 3
        assert_eq!(s.metric_mean(1), 100.0);
    }

    #[test]
    fn zero_sample_keeps_ratio_neutral() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(1, 10.0, &r);
        s.record_sample(1, 0.0, &r); // guard leaves ratio = 1, accumulate
        assert_eq!(s.metric_mean(1), 5.0);
    }

    #[test]
    fn variation_tracks_accepted_instruction_extremes() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(1, 80.0, &r);
        s.record_sample(1, 100.0, &r);
        assert_eq!(s.variation(), 0.2);
        // Cycles samples never move the instruction range.
        s.record_sample(0, 1000.0, &r);
        assert_eq!(s.variation(), 0.2);
    }

    #[test]
    fn reset_also_resets_instruction_range() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(1, 10.0, &r);
        s.record_sample(1, 100.0, &r); // reset
        assert_eq!(s.variation(), 0.0);
    }

    #[test]
    fn importance_follows_cycles_once_aggregate_is_known() {
        let mut r = registry();
        let mut s = section(&r);
        s.record_sample(0, 250.0, &r);
        assert!(!s.importance_known());
        r.set_aggregate_cycles(1000.0);
        s.record_sample(0, 250.0, &r);
        assert_eq!(s.importance(), 0.25);
    }

    #[test]
    fn deferred_resolution_uses_recorded_cycles() {
        let r = registry();
        let mut s = section(&r);
        s.record_sample(0, 500.0, &r);
        assert!(!s.importance_known());
        s.resolve_importance(0, 2000.0);
        assert_eq!(s.importance(), 0.25);
    }
}

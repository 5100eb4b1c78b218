//! Per-section derived-metric computation.
//!
//! Each configured formula is evaluated against the section's averaged raw
//! counters, falling back to machine characteristics for non-counter names.
//! A formula that fails to evaluate logs the failure and contributes zero,
//! it never aborts the batch.

use rustc_hash::FxHashMap;
use tracing::error;

use crate::config::{LcpiConfig, MachineConfig};
use crate::lcpi::eval::FormulaEvaluator;
use crate::profile::registry::CounterRegistry;
use crate::profile::round3;
use crate::profile::section::SectionProfile;

pub struct MetricDeriver<'a, E> {
    lcpi: &'a LcpiConfig,
    machine: &'a MachineConfig,
    evaluator: E,
}

impl<'a, E: FormulaEvaluator> MetricDeriver<'a, E> {
    pub fn new(lcpi: &'a LcpiConfig, machine: &'a MachineConfig, evaluator: E) -> Self {
        Self {
            lcpi,
            machine,
            evaluator,
        }
    }

    /// Evaluate every configured formula and store the results in the
    /// section's derived-metric slots.
    pub fn derive(&self, section: &mut SectionProfile, registry: &CounterRegistry) {
        for (index, metric) in self.lcpi.metrics.iter().enumerate() {
            let value = {
                let lookup = |name: &str| {
                    registry
                        .slot_of(name)
                        .map(|slot| section.metric_mean(slot))
                        .or_else(|| self.machine.characteristic(name))
                };
                match self.evaluator.evaluate(&metric.formula, &lookup) {
                    Ok(value) => round3(value),
                    Err(err) => {
                        error!(
                            metric = %metric.name,
                            formula = %metric.formula,
                            %err,
                            "formula evaluation failed, defaulting to zero"
                        );
                        0.0
                    }
                }
            };
            section.set_lcpi(index, value);
        }
    }

    /// Derived metrics keyed by name, plus the loop depth and the machine's
    /// expected good CPI entries, in the shape the recommendation engine
    /// consumes.
    pub fn lcpi_map(&self, section: &SectionProfile) -> FxHashMap<String, f64> {
        let mut map = FxHashMap::default();
        for (index, metric) in self.lcpi.metrics.iter().enumerate() {
            map.insert(metric.name.clone(), section.lcpi(index));
        }
        map.insert("loop-depth".to_string(), section.loop_depth as f64);
        if let Some(value) = self.machine.good_int_cpi {
            map.insert("good-int-CPI".to_string(), value);
        }
        if let Some(value) = self.machine.good_fp_cpi {
            map.insert("good-fp-CPI".to_string(), value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LcpiConfig, MachineConfig};
    use crate::lcpi::eval::ExpressionEvaluator;
    use crate::profile::section::SectionKind;

    fn machine() -> MachineConfig {
        toml::from_str(
            r#"
            cpu_freq = 1000000000.0
            good_int_cpi = 0.5
            good_fp_cpi = 1.0

            [characteristics]
            L1_dlat = 3.0
            "#,
        )
        .unwrap()
    }

    fn lcpi() -> LcpiConfig {
        toml::from_str(
            r#"
            [[metric]]
            name = "overall"
            formula = "PAPI_TOT_CYC / PAPI_TOT_INS"

            [[metric]]
            name = "data_accesses.L1d_hits"
            formula = "PAPI_L1_DCA * L1_dlat / PAPI_TOT_CYC"

            [[metric]]
            name = "broken"
            formula = "PAPI_NO_SUCH / PAPI_TOT_INS"
            "#,
        )
        .unwrap()
    }

    fn section_with_samples() -> (SectionProfile, CounterRegistry) {
        let mut registry = CounterRegistry::new();
        registry.register(0, "PAPI_TOT_CYC");
        registry.register(1, "PAPI_TOT_INS");
        registry.register(2, "PAPI_L1_DCA");
        let mut section =
            SectionProfile::new("Loop at k.c:4".into(), SectionKind::Loop, registry.len(), 3);
        section.loop_depth = 2;
        section.record_sample(0, 3000.0, &registry);
        section.record_sample(1, 1000.0, &registry);
        section.record_sample(2, 400.0, &registry);
        (section, registry)
    }

    #[test]
    fn formulas_fill_lcpi_slots_in_order() {
        let lcpi_config = lcpi();
        let machine_config = machine();
        let deriver = MetricDeriver::new(&lcpi_config, &machine_config, ExpressionEvaluator);
        let (mut section, registry) = section_with_samples();
        deriver.derive(&mut section, &registry);
        assert_eq!(section.lcpi(0), 3.0); // 3000 / 1000
        assert_eq!(section.lcpi(1), 0.4); // 400 * 3 / 3000
    }

    #[test]
    fn failing_formula_defaults_to_zero() {
        let lcpi_config = lcpi();
        let machine_config = machine();
        let deriver = MetricDeriver::new(&lcpi_config, &machine_config, ExpressionEvaluator);
        let (mut section, registry) = section_with_samples();
        deriver.derive(&mut section, &registry);
        assert_eq!(section.lcpi(2), 0.0);
    }

    #[test]
    fn engine_feed_carries_depth_and_good_cpi() {
        let lcpi_config = lcpi();
        let machine_config = machine();
        let deriver = MetricDeriver::new(&lcpi_config, &machine_config, ExpressionEvaluator);
        let (mut section, registry) = section_with_samples();
        deriver.derive(&mut section, &registry);
        let map = deriver.lcpi_map(&section);
        assert_eq!(map["overall"], 3.0);
        assert_eq!(map["loop-depth"], 2.0);
        assert_eq!(map["good-int-CPI"], 0.5);
        assert_eq!(map["good-fp-CPI"], 1.0);
    }
}

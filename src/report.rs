//! Terminal presentation of aggregated profiles.
//!
//! Renders the per-section summary (ratio rows as 0-100 bars, LCPI rows as
//! threshold-scaled bars, optional side-by-side comparison) and drives the
//! recommendation engine in suggestion mode. Formatting only: everything
//! here reads the aggregator's output shape.

use std::fmt::Write;

use tracing::error;

use crate::config::{LcpiConfig, MachineConfig};
use crate::lcpi::{ExpressionEvaluator, MetricDeriver};
use crate::profile::AggregatedProfile;
use crate::recommend::RecommendationEngine;

const MAX_BAR_WIDTH: f64 = 47.0;
const SECTION_RULE: &str =
    "===============================================================================";
const PERF_RULE: &str =
    "-------------------------------------------------------------------------------";
const VARIATION_WARNING_LEVEL: f64 = 0.2;

/// Render the summary tables for one profile, optionally compared against a
/// second one matched by section label.
pub fn present_summary(
    primary: &mut AggregatedProfile,
    mut comparison: Option<&mut AggregatedProfile>,
    lcpi_config: &LcpiConfig,
    machine: &MachineConfig,
    file01: &str,
    file02: Option<&str>,
    aggregate_only: bool,
) -> String {
    let mut out = String::new();
    if primary.sections.is_empty() {
        return out;
    }
    let Some(cycles_slot) = primary.registry.index_of_cycles() else {
        error!("could not find PAPI_TOT_CYC among the discovered counters, cannot compute derived metrics");
        return out;
    };
    let Some(instr_slot) = primary.registry.index_of_instructions() else {
        error!("could not find PAPI_TOT_INS among the discovered counters, cannot compute derived metrics");
        return out;
    };

    derive_all(primary, lcpi_config, machine);
    if let Some(comp) = comparison.as_deref_mut() {
        derive_all(comp, lcpi_config, machine);
    }
    let comparison = comparison.as_deref();

    let cpu_freq = machine.cpu_freq;
    if let Some(aggregate) = primary.aggregate() {
        let _ = writeln!(
            out,
            "Total running time for \"{}\" is {} sec",
            file01,
            fmt3(aggregate.metric_mean(cycles_slot) / cpu_freq)
        );
    }
    if let (Some(comp), Some(file02)) = (comparison, file02) {
        if let (Some(aggregate), Some(comp_cycles)) =
            (comp.aggregate(), comp.registry.index_of_cycles())
        {
            let _ = writeln!(
                out,
                "Total running time for \"{}\" is {} sec",
                file02,
                fmt3(aggregate.metric_mean(comp_cycles) / cpu_freq)
            );
        }
    }

    for section in &primary.sections {
        if section.is_aggregate() != aggregate_only {
            continue;
        }
        if !section.importance_known() {
            continue;
        }

        let cycles = section.metric_mean(cycles_slot);
        let instructions = section.metric_mean(instr_slot);
        let matching = comparison.and_then(|c| c.section_by_label(&section.label));

        match matching {
            None => {
                let _ = write!(
                    out,
                    "\n{} ({}% of the total runtime)\n",
                    section.label,
                    fmt3(section.importance() * 100.0)
                );
            }
            Some(other) => {
                let other_cycles = comparison
                    .and_then(|c| c.registry.index_of_cycles())
                    .map(|slot| other.metric_mean(slot))
                    .unwrap_or(0.0);
                let _ = write!(
                    out,
                    "\n{} (runtimes are {}s and {}s)\n",
                    section.label,
                    fmt3(cycles / cpu_freq),
                    fmt3(other_cycles / cpu_freq)
                );
            }
        }
        let _ = writeln!(out, "{SECTION_RULE}");

        let variation = matching
            .map(|m| m.variation().max(section.variation()))
            .unwrap_or_else(|| section.variation());
        if variation > VARIATION_WARNING_LEVEL {
            let _ = writeln!(
                out,
                "WARNING: The instruction count variation is {}%, making the results unreliable",
                fmt3(variation * 100.0)
            );
        }
        if cycles < cpu_freq {
            let _ = writeln!(
                out,
                "WARNING: The runtime for this code section is too short to gather meaningful measurements"
            );
            continue;
        }

        if instructions != 0.0 && cycles / instructions <= machine.cpi_threshold {
            let _ = writeln!(out, "The performance of this code section is good");
        }

        render_metric_rows(&mut out, section, matching, lcpi_config, machine);
    }
    out
}

fn render_metric_rows(
    out: &mut String,
    section: &crate::profile::SectionProfile,
    matching: Option<&crate::profile::SectionProfile>,
    lcpi_config: &LcpiConfig,
    machine: &MachineConfig,
) {
    let mut ratio_header_printed = false;
    let mut perf_header_printed = false;

    for (index, metric) in lcpi_config.metrics.iter().enumerate() {
        let (mut category, mut subcategory) = split_metric_name(&metric.name);

        let mut value1 = section.lcpi(index);
        let mut value2 = matching.map(|m| m.lcpi(index)).unwrap_or(value1);

        let is_ratio = if category.eq_ignore_ascii_case("ratio") {
            if !ratio_header_printed {
                let _ = writeln!(
                    out,
                    "{:<25}    %  0.........25...........50.........75........100",
                    "ratio to total instrns"
                );
                ratio_header_printed = true;
            }
            true
        } else if category.eq_ignore_ascii_case("percent") {
            // Percent metrics render as ratios of their nested name.
            (category, subcategory) = split_metric_name(subcategory);
            true
        } else {
            if !perf_header_printed {
                let _ = writeln!(out, "{PERF_RULE}");
                let _ = writeln!(
                    out,
                    "{:<25}  LCPI good......okay......fair......poor......bad....",
                    "performance assessment"
                );
                perf_header_printed = true;
            }
            false
        };

        let row_label = if subcategory.eq_ignore_ascii_case("overall") {
            format!("* {}", category.replace('_', " "))
        } else {
            format!("   - {}", subcategory.replace('_', " "))
        };
        let _ = write!(out, "{row_label:<25}: ");

        if is_ratio {
            value1 = value1.min(1.0);
            value2 = value2.min(1.0);
            if matching.is_none() {
                let _ = write!(out, "{:4.0} ", value1 * 100.0);
            } else {
                let _ = write!(out, "     ");
            }
            out.push_str(&bar(value1 * 100.0, value2 * 100.0, '*', MAX_BAR_WIDTH / 100.0));
        } else {
            if matching.is_none() {
                let _ = write!(out, "{value1:4.1} ");
            } else {
                let _ = write!(out, "     ");
            }
            out.push_str(&bar(value1, value2, '>', 10.0 / machine.cpi_threshold));
        }

        if category.eq_ignore_ascii_case("overall") {
            let _ = writeln!(out, "upper bound estimates");
        }
    }
}

/// Feed every reportable section through the recommendation engine and
/// return its rendered suggestions.
pub fn present_recommendations(
    profile: &mut AggregatedProfile,
    lcpi_config: &LcpiConfig,
    machine: &MachineConfig,
    engine: &mut RecommendationEngine,
    aggregate_only: bool,
    max_suggestions: i32,
) -> String {
    if profile.sections.is_empty() {
        error!("received empty profiles as input");
        return String::new();
    }
    if profile.registry.index_of_cycles().is_none()
        || profile.registry.index_of_instructions().is_none()
    {
        error!("total cycles and instructions counters are required for recommendations");
        return String::new();
    }

    derive_all(profile, lcpi_config, machine);
    let deriver = MetricDeriver::new(lcpi_config, machine, ExpressionEvaluator);

    for section in &profile.sections {
        if section.is_aggregate() != aggregate_only {
            continue;
        }
        if !section.importance_known() {
            continue;
        }
        let header = format!(
            "{} ({}% of the total runtime)",
            section.label,
            fmt3(section.importance() * 100.0)
        );
        engine.add_code_section(&header, &deriver.lcpi_map(section));
    }
    engine.recommend(max_suggestions)
}

fn derive_all(profile: &mut AggregatedProfile, lcpi_config: &LcpiConfig, machine: &MachineConfig) {
    let deriver = MetricDeriver::new(lcpi_config, machine, ExpressionEvaluator);
    let registry = &profile.registry;
    for section in &mut profile.sections {
        deriver.derive(section, registry);
    }
}

/// `name` → (category, rest): `overall` → ("overall", "overall"),
/// `data_accesses.L1d_hits` → ("data_accesses", "L1d_hits").
fn split_metric_name(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((category, rest)) => (category, rest),
        None => ("overall", name),
    }
}

/// One comparison bar: `base` glyphs for the shared part, `1`/`2` for the
/// profile that extends further, `+` marking overflow past the bar width.
fn bar(value1: f64, value2: f64, base: char, scale: f64) -> String {
    let mut v1 = (value1 * scale).max(1.0);
    let mut v2 = (value2 * scale).max(1.0);

    let mut term = ' ';
    if v1 > MAX_BAR_WIDTH {
        term = '+';
        v1 = MAX_BAR_WIDTH - 1.0;
    }
    if v2 > MAX_BAR_WIDTH {
        term = '+';
        v2 = MAX_BAR_WIDTH - 1.0;
    }

    let mut shared = v1.min(v2);
    v1 -= shared;
    v2 -= shared;

    let mut out = String::new();
    loop {
        let more = shared > 0.5;
        shared -= 1.0;
        if !more {
            break;
        }
        out.push(base);
    }

    let (mut rest, glyph) = if v1 > 0.0 { (v1, '1') } else { (v2, '2') };
    rest += shared;
    loop {
        let more = rest > 0.5;
        rest -= 1.0;
        if !more {
            break;
        }
        out.push(glyph);
    }

    if term != ' ' {
        out.push(term);
    }
    out.push('\n');
    out
}

/// Up to three decimal places with trailing zeros trimmed.
fn fmt3(value: f64) -> String {
    let text = format!("{value:.3}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

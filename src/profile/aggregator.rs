//! Flat-profile aggregation.
//!
//! Consumes the flat document produced by the flattening stage as a stream.
//! Each procedure/loop boundary starts a section profile; metric events feed
//! running averages through the counter registry; importance is computed
//! against the synthetic root's cycle total and unimportant sections are
//! pruned from the tail, with a finalization pass at end of stream for
//! sections whose importance only became resolvable late.

use std::cmp::Ordering;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::profile::registry::{CounterNameFilter, CounterRegistry, CounterResolution};
use crate::profile::section::{SectionKind, SectionProfile};
use crate::xml::{Element, XmlError, XmlEvent, XmlReader};

const UNKNOWN_FILE: &str = "~unknown-file~";

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("no performance counters were discovered; check the input document and the thread selection")]
    NoCountersDiscovered,
    #[error("{element} element with no '{attr}' attribute")]
    MissingAttribute {
        element: &'static str,
        attr: &'static str,
    },
    #[error("{element} element with a non-numeric '{attr}' attribute")]
    InvalidNumber {
        element: &'static str,
        attr: &'static str,
    },
    #[error("closing {0} element without a matching open section")]
    UnbalancedClose(String),
    #[error("invalid thread selector: {0}")]
    ThreadSelector(#[from] regex::Error),
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// Result of one aggregation pass: the ordered section list (aggregate
/// first, then descending importance) and the registry that resolves
/// counter names for it.
#[derive(Debug)]
pub struct AggregatedProfile {
    pub sections: Vec<SectionProfile>,
    pub registry: CounterRegistry,
}

impl AggregatedProfile {
    pub fn aggregate(&self) -> Option<&SectionProfile> {
        self.sections.first().filter(|s| s.is_aggregate())
    }

    pub fn section_by_label(&self, label: &str) -> Option<&SectionProfile> {
        self.sections.iter().find(|s| s.label == label)
    }
}

/// One parser instance per input document. The first successful pass is
/// memoized; later calls return the cached result without re-parsing.
pub struct FlatProfileParser {
    threshold: f64,
    thread_regex: String,
    aggregate_only: bool,
    lcpi_slots: usize,
    parsed: Option<AggregatedProfile>,
}

impl FlatProfileParser {
    pub fn new(threshold: f64, thread_regex: &str, aggregate_only: bool, lcpi_slots: usize) -> Self {
        Self {
            threshold,
            thread_regex: thread_regex.to_string(),
            aggregate_only,
            lcpi_slots,
            parsed: None,
        }
    }

    pub fn parse(&mut self, input: &str) -> Result<&AggregatedProfile, AggregateError> {
        let profile = match self.parsed.take() {
            Some(cached) => cached,
            None => {
                let pass = Pass::new(
                    self.threshold,
                    &self.thread_regex,
                    self.aggregate_only,
                    self.lcpi_slots,
                )?;
                pass.run(input)?
            }
        };
        Ok(self.parsed.insert(profile))
    }

    /// Hand over the memoized result, if a parse has succeeded.
    pub fn into_parsed(self) -> Option<AggregatedProfile> {
        self.parsed
    }
}

struct Pass {
    threshold: f64,
    aggregate_only: bool,
    lcpi_slots: usize,
    filter: CounterNameFilter,
    registry: CounterRegistry,
    sections: Vec<SectionProfile>,
    /// Index of the currently open section, if its metrics are being recorded.
    current: Option<usize>,
    aggregate_recorded: bool,
    callsite_depth: usize,
    loop_depth: u32,
    filename: Option<String>,
    proc_stack: Vec<String>,
}

impl Pass {
    fn new(
        threshold: f64,
        thread_regex: &str,
        aggregate_only: bool,
        lcpi_slots: usize,
    ) -> Result<Self, AggregateError> {
        Ok(Self {
            threshold,
            aggregate_only,
            lcpi_slots,
            filter: CounterNameFilter::new(thread_regex)?,
            registry: CounterRegistry::new(),
            sections: Vec::new(),
            current: None,
            aggregate_recorded: false,
            callsite_depth: 0,
            loop_depth: 0,
            filename: None,
            proc_stack: Vec::new(),
        })
    }

    fn run(mut self, input: &str) -> Result<AggregatedProfile, AggregateError> {
        let mut reader = XmlReader::new(input);
        while let Some(event) = reader.next_event()? {
            let done = match event {
                XmlEvent::Open(element) => self.open(&element)?,
                XmlEvent::Close(name) => self.close(&name)?,
            };
            if done {
                break;
            }
        }
        self.finalize()?;

        let mut sections = self.sections;
        if sections.len() > 2 {
            // Keep the aggregate at the head, order the rest by importance.
            sections[1..].sort_by(|a, b| {
                b.importance()
                    .partial_cmp(&a.importance())
                    .unwrap_or(Ordering::Equal)
            });
        }
        debug!(sections = sections.len(), "aggregation pass complete");
        Ok(AggregatedProfile {
            sections,
            registry: self.registry,
        })
    }

    /// Handle one open element; `Ok(true)` stops the pass early.
    fn open(&mut self, element: &Element) -> Result<bool, AggregateError> {
        if self.callsite_depth > 0 {
            if element.name == "C" {
                self.callsite_depth += 1;
            }
            return Ok(false);
        }

        match element.name.as_str() {
            "P" => {
                if self.section_break() {
                    return Ok(true);
                }
                let line = req_u64(element, "P", "l")?;
                let name = element
                    .attr("n")
                    .ok_or(AggregateError::MissingAttribute { element: "P", attr: "n" })?
                    .to_string();
                self.proc_stack.push(name.clone());
                let location = self.format_code_section(line, true);
                let parens = if name.contains('(') { "" } else { "()" };

                let mut section = SectionProfile::new(
                    format!("Function {name}{parens}{location}"),
                    SectionKind::Function,
                    self.registry.len(),
                    self.lcpi_slots,
                );
                section.filename = self.filename.clone();
                section.line = line;
                self.sections.push(section);
                self.current = Some(self.sections.len() - 1);
            }
            "L" => {
                if self.section_break() {
                    return Ok(true);
                }
                let line = req_u64(element, "L", "l")?;
                self.loop_depth += 1;
                let location = self.format_code_section(line, false);

                let mut section = SectionProfile::new(
                    format!("Loop{location}"),
                    SectionKind::Loop,
                    self.registry.len(),
                    self.lcpi_slots,
                );
                section.filename = self.filename.clone();
                section.line = line;
                section.loop_depth = self.loop_depth;
                self.sections.push(section);
                self.current = Some(self.sections.len() - 1);
            }
            "M" => self.metric_value(element)?,
            "F" => {
                if self.section_break() {
                    return Ok(true);
                }
                self.filename = element.attr("n").map(str::to_string);
            }
            "LM" => {
                if self.section_break() {
                    return Ok(true);
                }
                debug!(module = element.attr("n").unwrap_or("?"), "entering load module");
            }
            "S" => {
                if self.section_break() {
                    return Ok(true);
                }
            }
            "C" => {
                if self.section_break() {
                    return Ok(true);
                }
                self.callsite_depth = 1;
            }
            "Metric" => {
                let name = element
                    .attr("n")
                    .ok_or(AggregateError::MissingAttribute { element: "Metric", attr: "n" })?;
                let doc_index = req_u64(element, "Metric", "i")?;
                match self.filter.resolve(name) {
                    CounterResolution::Accepted(resolved) => {
                        self.registry.register(doc_index, &resolved);
                    }
                    CounterResolution::OutOfSelection => {}
                    CounterResolution::Invalid => {
                        debug!(counter = name, "counter name does not follow the naming convention, ignored");
                    }
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn close(&mut self, name: &str) -> Result<bool, AggregateError> {
        if self.callsite_depth > 0 {
            if name == "C" {
                self.callsite_depth -= 1;
                if self.callsite_depth == 0 {
                    self.current = None;
                    self.aggregate_recorded = true;
                }
            }
            return Ok(false);
        }

        match name {
            "MetricTable" => {
                if self.registry.is_empty() {
                    return Err(AggregateError::NoCountersDiscovered);
                }
            }
            "P" => {
                if self.proc_stack.pop().is_none() {
                    return Err(AggregateError::UnbalancedClose("P".to_string()));
                }
                self.current = None;
            }
            "L" => {
                if self.loop_depth == 0 {
                    return Err(AggregateError::UnbalancedClose("L".to_string()));
                }
                self.loop_depth -= 1;
                self.current = None;
            }
            "F" => {
                self.current = None;
                self.filename = None;
            }
            "LM" => {
                self.current = None;
            }
            _ => {}
        }
        Ok(false)
    }

    fn metric_value(&mut self, element: &Element) -> Result<(), AggregateError> {
        let doc_index = req_u64(element, "M", "n")?;
        let value: f64 = element
            .attr("v")
            .ok_or(AggregateError::MissingAttribute { element: "M", attr: "v" })?
            .parse()
            .map_err(|_| AggregateError::InvalidNumber { element: "M", attr: "v" })?;

        if self.current.is_none() {
            if self.aggregate_recorded {
                // Stray metric under a module/file marker, not a sample.
                debug!("metric value outside any section, ignored");
                return Ok(());
            }
            // First metric of the document opens the synthetic root.
            debug!("metric value marks the start of the aggregate record");
            let section = SectionProfile::new(
                "Aggregate".to_string(),
                SectionKind::Aggregate,
                self.registry.len(),
                self.lcpi_slots,
            );
            self.sections.push(section);
            self.current = Some(self.sections.len() - 1);
            self.aggregate_recorded = true;
        }

        if let (Some(index), Some(slot)) = (self.current, self.registry.slot_for_doc_index(doc_index)) {
            self.sections[index].record_sample(slot, value, &self.registry);
        }
        Ok(())
    }

    /// Shared prologue of every section boundary: drop the current section,
    /// make sure the aggregate total is picked up, and run the tail pruning
    /// check. Returns `true` when an aggregate-only pass should stop here.
    fn section_break(&mut self) -> bool {
        self.current = None;
        self.aggregate_recorded = true;
        self.adopt_aggregate_and_prune_tail();
        self.aggregate_only
    }

    fn adopt_aggregate_and_prune_tail(&mut self) {
        if self.sections.is_empty() {
            error!("aggregate cycles adjustment requested with an empty section list");
            return;
        }

        if self.registry.aggregate_cycles() == 0.0 {
            if let Some(cycles_slot) = self.registry.index_of_cycles() {
                let total = self.sections[0].metric_mean(cycles_slot).trunc();
                self.registry.set_aggregate_cycles(total);
                self.sections[0].set_importance(1.0);
            }
        }

        // Only the most recently completed section is ever inspected here; a
        // section whose importance resolves later is caught by the final
        // end-of-stream sweep.
        let last = self.sections.len() - 1;
        if !self.sections[last].importance_known() {
            return;
        }
        if self.sections[last].importance() < self.threshold {
            debug!(
                section = %self.sections[last].label,
                importance = self.sections[last].importance(),
                threshold = self.threshold,
                "pruning unimportant section"
            );
            self.sections.remove(last);
        }
    }

    fn finalize(&mut self) -> Result<(), AggregateError> {
        if self.registry.is_empty() {
            return Err(AggregateError::NoCountersDiscovered);
        }
        if self.sections.is_empty() {
            warn!("collected zero sections, is the input document valid?");
            return Ok(());
        }

        // The aggregate total may only have become computable at the very
        // end, e.g. when the document carried a single useful counter.
        self.adopt_aggregate_and_prune_tail();

        let aggregate_cycles = self.registry.aggregate_cycles();
        if let Some(cycles_slot) = self.registry.index_of_cycles() {
            for section in &mut self.sections {
                section.resolve_importance(cycles_slot, aggregate_cycles);
            }
        }

        let threshold = self.threshold;
        let mut index = 0;
        self.sections.retain(|section| {
            let keep = index == 0
                || !section.importance_known()
                || section.importance() >= threshold;
            if !keep {
                debug!(section = %section.label, "pruned in final sweep");
            }
            index += 1;
            keep
        });
        Ok(())
    }

    /// Format a `[ in function foo()] at file.c:90` location suffix.
    fn format_code_section(&self, line: u64, new_procedure: bool) -> String {
        let proc_name = if new_procedure {
            None
        } else {
            self.proc_stack.last()
        };
        let file_known = self
            .filename
            .as_deref()
            .is_some_and(|f| f != UNKNOWN_FILE);

        if line == 0 && self.proc_stack.is_empty() && !file_known {
            return "~unknown-location~".to_string();
        }

        let function_part = proc_name
            .map(|name| {
                let parens = if name.contains('(') { "" } else { "()" };
                format!(" in function {name}{parens}")
            })
            .unwrap_or_default();

        if file_known && line != 0 {
            let filename = self.filename.as_deref().unwrap_or(UNKNOWN_FILE);
            return format!("{function_part} at {filename}:{line}");
        }
        if line != 0 {
            return format!(" line {line}");
        }
        let file_part = if file_known {
            let filename = self.filename.as_deref().unwrap_or(UNKNOWN_FILE);
            format!(" in file \"{filename}\"")
        } else {
            String::new()
        };
        format!("{function_part}{file_part}")
    }
}

fn req_u64(
    element: &Element,
    name: &'static str,
    attr: &'static str,
) -> Result<u64, AggregateError> {
    element
        .attr(attr)
        .ok_or(AggregateError::MissingAttribute { element: name, attr })?
        .parse()
        .map_err(|_| AggregateError::InvalidNumber { element: name, attr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ranges::thread_regex;

    fn flat_doc(body: &str) -> String {
        format!(
            r#"<HPCToolkitExperiment version="2.0">
<Header n="bench">
  <Info/>
</Header>
<SecFlatProfile i="0" n="main profile">
<SecHeader>
 <MetricTable>
    <Metric i="0" n="PAPI_TOT_CYC.[0,0] (E)" v="final" t="exclusive" s="1"> </Metric>
    <Metric i="1" n="PAPI_TOT_INS.[0,0] (E)" v="final" t="exclusive" s="1"> </Metric>
    <Metric i="2" n="PAPI_TOT_CYC.[0,1] (E)" v="final" t="exclusive" s="1"> </Metric>
 </MetricTable>
</SecHeader>
<SecFlatProfileData>
{body}
</SecFlatProfileData></SecFlatProfile></HPCToolkitExperiment>"#
        )
    }

    fn parse(body: &str, threshold: f64) -> Result<AggregatedProfile, AggregateError> {
        let doc = flat_doc(body);
        Pass::new(threshold, &thread_regex(None).unwrap(), false, 0)?.run(&doc)
    }

    #[test]
    fn aggregate_record_opens_on_first_metric() {
        let profile = parse(
            r#"<M n="0" v="1000"/><M n="1" v="500"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="compute" l="20">
                   <M n="0" v="800"/><M n="1" v="400"/>
                 </P></F></LM>"#,
            0.1,
        )
        .unwrap();
        assert_eq!(profile.sections.len(), 2);
        assert!(profile.sections[0].is_aggregate());
        assert_eq!(profile.sections[0].importance(), 1.0);
        assert_eq!(profile.sections[0].metric_mean(0), 1000.0);
        assert_eq!(profile.sections[1].label, "Function compute() at kernel.c:20");
        assert_eq!(profile.sections[1].importance(), 0.8);
    }

    #[test]
    fn per_thread_counters_merge_into_one_slot() {
        let profile = parse(
            r#"<M n="0" v="1000"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="compute" l="20">
                   <M n="0" v="800"/><M n="2" v="820"/>
                 </P></F></LM>"#,
            0.1,
        )
        .unwrap();
        assert_eq!(profile.registry.len(), 2);
        // Both thread samples merged: (800 + 820) / 2.
        assert_eq!(profile.sections[1].metric_mean(0), 810.0);
    }

    #[test]
    fn sections_below_threshold_are_pruned() {
        let profile = parse(
            r#"<M n="0" v="1000"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="hot" l="20"><M n="0" v="900"/></P>
                 <P i="11" n="cold" l="40"><M n="0" v="10"/></P>
                </F></LM>"#,
            0.1,
        )
        .unwrap();
        let labels: Vec<&str> = profile.sections.iter().map(|s| s.label.as_str()).collect();
        assert!(labels.iter().any(|l| l.contains("hot")));
        assert!(!labels.iter().any(|l| l.contains("cold")));
    }

    #[test]
    fn section_at_exact_threshold_is_retained() {
        let profile = parse(
            r#"<M n="0" v="1000"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="edge" l="20"><M n="0" v="100"/></P>
                </F></LM>"#,
            0.1,
        )
        .unwrap();
        assert!(profile
            .sections
            .iter()
            .any(|s| s.label.contains("edge") && s.importance() == 0.1));
    }

    #[test]
    fn loop_sections_carry_nesting_depth() {
        let profile = parse(
            r#"<M n="0" v="1000"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="compute" l="20">
                   <M n="0" v="900"/>
                   <L i="4" s="6" l="22">
                     <M n="0" v="700"/>
                     <L i="5" s="7" l="23"><M n="0" v="500"/></L>
                   </L>
                 </P></F></LM>"#,
            0.1,
        )
        .unwrap();
        let inner = profile
            .section_by_label("Loop in function compute() at kernel.c:23")
            .unwrap();
        assert_eq!(inner.loop_depth, 2);
        let outer = profile
            .section_by_label("Loop in function compute() at kernel.c:22")
            .unwrap();
        assert_eq!(outer.loop_depth, 1);
    }

    #[test]
    fn callsite_reference_frames_are_skipped() {
        let profile = parse(
            r#"<M n="0" v="1000"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="compute" l="20">
                   <M n="0" v="900"/>
                   <C i="0" l="0"><PF i="11" n="helper" l="30"/></C>
                 </P></F></LM>"#,
            0.1,
        )
        .unwrap();
        assert_eq!(profile.sections.len(), 2);
    }

    #[test]
    fn empty_metric_table_is_fatal() {
        let doc = r#"<SecHeader><MetricTable></MetricTable></SecHeader>"#;
        let result = Pass::new(0.1, &thread_regex(None).unwrap(), false, 0)
            .unwrap()
            .run(doc);
        assert!(matches!(result, Err(AggregateError::NoCountersDiscovered)));
    }

    #[test]
    fn unbalanced_section_close_is_rejected() {
        let err = parse(r#"<M n="0" v="1000"/></P>"#, 0.1).unwrap_err();
        assert!(matches!(err, AggregateError::UnbalancedClose(_)));
    }

    #[test]
    fn aggregate_only_stops_at_first_boundary() {
        let doc = flat_doc(
            r#"<M n="0" v="1000"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="compute" l="20"><M n="0" v="900"/></P>
                </F></LM>"#,
        );
        let profile = Pass::new(0.1, &thread_regex(None).unwrap(), true, 0)
            .unwrap()
            .run(&doc)
            .unwrap();
        assert_eq!(profile.sections.len(), 1);
        assert!(profile.sections[0].is_aggregate());
    }

    #[test]
    fn parse_is_memoized_per_instance() {
        let doc = flat_doc(r#"<M n="0" v="1000"/>"#);
        let mut parser = FlatProfileParser::new(0.1, &thread_regex(None).unwrap(), false, 0);
        let first_len = parser.parse(&doc).unwrap().sections.len();
        // A second call with different (even invalid) input returns the
        // memoized result untouched.
        let second = parser.parse("<garbage/>").unwrap();
        assert_eq!(second.sections.len(), first_len);
    }

    #[test]
    fn thread_selection_drops_out_of_range_counters() {
        let doc = flat_doc(
            r#"<M n="0" v="1000"/><M n="2" v="500"/>
               <LM i="2" n="Load module /usr/bin/bench">
                <F i="3" n="kernel.c">
                 <P i="10" n="compute" l="20"><M n="0" v="900"/><M n="2" v="42"/></P>
                </F></LM>"#,
        );
        let profile = Pass::new(0.1, &thread_regex(Some("0")).unwrap(), false, 0)
            .unwrap()
            .run(&doc)
            .unwrap();
        // Thread 1's counter (doc index 2) was never registered, so its
        // samples are not valid observations.
        assert_eq!(profile.registry.len(), 2);
        assert_eq!(profile.sections[1].metric_mean(0), 900.0);
    }
}

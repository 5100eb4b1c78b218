//! Counter-name registry.
//!
//! Counter names carry a thread selector and an exclusivity tag, e.g.
//! `PAPI_TOT_CYC.[0,3].2 (E)`. Names that pass the structural pattern and
//! the caller's thread selection resolve to a dense performance-engine slot;
//! per-thread duplicates of the same logical counter share one slot so their
//! samples merge into a single running average.

use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::debug;

pub const INSTRUCTIONS_COUNTER: &str = "PAPI_TOT_INS";
pub const CYCLES_COUNTER: &str = "PAPI_TOT_CYC";

/// Outcome of matching one declared counter name.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterResolution {
    /// Structurally valid and within the thread selection.
    Accepted(String),
    /// Structurally valid but for an unselected thread.
    OutOfSelection,
    /// Does not follow the counter naming convention.
    Invalid,
}

pub struct CounterNameFilter {
    general: Regex,
    selected: Regex,
}

impl CounterNameFilter {
    pub fn new(thread_regex: &str) -> Result<Self, regex::Error> {
        let general =
            Regex::new(r"^(|\d+\.)(?P<name>[\w:]+)\.\[(\d+,)?(\d+)\](|\.\d+) \((?P<x>\w)\)$")?;
        let selected = Regex::new(&format!(
            r"^(|\d+\.)(?P<name>[\w:]+)\.\[{thread_regex}\](|\.\d+) \((?P<x>\w)\)$"
        ))?;
        Ok(Self { general, selected })
    }

    pub fn resolve(&self, metric_name: &str) -> CounterResolution {
        if !self.general.is_match(metric_name) {
            return CounterResolution::Invalid;
        }
        match self.selected.captures(metric_name) {
            Some(captures) => {
                let name = &captures["name"];
                let resolved = if &captures["x"] == "I" {
                    format!("{name}_I")
                } else {
                    name.to_string()
                };
                CounterResolution::Accepted(resolved)
            }
            None => CounterResolution::OutOfSelection,
        }
    }
}

/// Per-pass mapping from counter names and document metric indices to dense
/// performance-engine slots, plus the resolved positions of the two counters
/// every downstream consumer needs.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    by_name: FxHashMap<String, usize>,
    doc_to_slot: FxHashMap<u64, usize>,
    names: Vec<String>,
    index_of_instructions: Option<usize>,
    index_of_cycles: Option<usize>,
    aggregate_cycles: f64,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, doc_index: u64, name: &str) {
        if let Some(&slot) = self.by_name.get(name) {
            debug!(counter = name, slot, "registered duplicate counter");
            self.doc_to_slot.insert(doc_index, slot);
            return;
        }
        let slot = self.names.len();
        if name == INSTRUCTIONS_COUNTER {
            self.index_of_instructions = Some(slot);
        }
        if name == CYCLES_COUNTER {
            self.index_of_cycles = Some(slot);
        }
        self.by_name.insert(name.to_string(), slot);
        self.doc_to_slot.insert(doc_index, slot);
        self.names.push(name.to_string());
        debug!(counter = name, doc_index, slot, "registered new counter");
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn slot_for_doc_index(&self, doc_index: u64) -> Option<usize> {
        self.doc_to_slot.get(&doc_index).copied()
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn counter_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn index_of_instructions(&self) -> Option<usize> {
        self.index_of_instructions
    }

    pub fn index_of_cycles(&self) -> Option<usize> {
        self.index_of_cycles
    }

    pub fn aggregate_cycles(&self) -> f64 {
        self.aggregate_cycles
    }

    pub fn set_aggregate_cycles(&mut self, cycles: f64) {
        self.aggregate_cycles = cycles;
    }
}

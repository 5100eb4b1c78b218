//! Suggestion rule database.
//!
//! The database is a text blob bounded by `BEGIN-DB`/`END-DB`. Entries are
//! separated by runs of five or more dots; inside an entry, runs of five or
//! more dashes split it into exactly five components: description,
//! explanation, code example, compiler flags, and the tag line naming the
//! entry's bottleneck categories and required structural attributes.

use std::path::Path;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

pub const CATEGORIES: [&str; 9] = [
    "d-L1", "d-L2", "d-mem", "d-tlb", "i-access", "i-tlb", "br-i", "fpt-fast", "fpt-slow",
];

/// Virtual weight slot for the normalized overall LCPI; not a matchable
/// category.
pub const OVERALL: usize = 9;
pub const WEIGHT_SLOTS: usize = 10;

pub const D_L1: usize = 0;
pub const D_L2: usize = 1;
pub const D_MEM: usize = 2;
pub const D_TLB: usize = 3;
pub const I_ACCESS: usize = 4;
pub const I_TLB: usize = 5;
pub const BR_I: usize = 6;
pub const FPT_FAST: usize = 7;
pub const FPT_SLOW: usize = 8;

/// Loop-depth attributes must stay first, the loop/no-loop match test
/// masks them together.
pub const ATTRIBUTES: [&str; 6] = [
    "loop1",
    "loop2",
    "loop3",
    "multiple_loops",
    "multiple_functions",
    "boost",
];

pub const LOOP1_ATTR: u32 = 0;
pub const LOOP2_ATTR: u32 = 1;
pub const LOOP3_ATTR: u32 = 2;
pub const MULTIPLE_LOOPS_ATTR: u32 = 3;
pub const MULTIPLE_FUNCTIONS_ATTR: u32 = 4;
pub const BOOST_ATTR: u32 = 5;

pub(crate) const LOOP_MASK: u32 = (1 << LOOP1_ATTR) | (1 << LOOP2_ATTR) | (1 << LOOP3_ATTR);

const DB_START: &str = "BEGIN-DB";
const DB_END: &str = "END-DB";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to read rule database {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rule database is missing its {DB_START}/{DB_END} markers")]
    MissingMarkers,
    #[error("internal pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub description: String,
    pub explanation: String,
    pub example: String,
    pub compiler_flags: String,
    /// Bottleneck categories this entry addresses.
    pub categories: u32,
    /// Structural attributes the code section must provide.
    pub attributes: u32,
    /// Tie-break rank: attribute count, deeper loop requirements counted
    /// extra, computed before the boost bit is stripped.
    pub specificity: u32,
}

impl RuleEntry {
    /// Required attributes must be a subset of the available ones, and the
    /// entry's loop requirement must agree exactly with the section's loop
    /// state.
    pub fn matches(&self, available: u32) -> bool {
        (self.attributes & available) == self.attributes
            && ((self.attributes & LOOP_MASK == 0) == (available & LOOP_MASK == 0))
    }

    /// Sum of the section's weights over this entry's categories.
    pub fn score(&self, weights: &[f64; WEIGHT_SLOTS]) -> f64 {
        weights
            .iter()
            .enumerate()
            .filter(|(index, _)| self.categories & (1 << index) != 0)
            .map(|(_, weight)| weight)
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct RuleDatabase {
    entries: Vec<RuleEntry>,
}

impl RuleDatabase {
    pub fn load(path: &Path) -> Result<Self, DbError> {
        let text = std::fs::read_to_string(path).map_err(|source| DbError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, DbError> {
        let start = text
            .find(DB_START)
            .map(|index| index + DB_START.len())
            .ok_or(DbError::MissingMarkers)?;
        let end = text.find(DB_END).ok_or(DbError::MissingMarkers)?;
        if end <= start {
            return Err(DbError::MissingMarkers);
        }
        let database = &text[start..end];

        let entry_separator = Regex::new(r"\.{5,}\s+")?;
        let component_separator = Regex::new(r"-{5,}\s+")?;

        let mut entries = Vec::new();
        for entry_text in entry_separator.split(database) {
            if entry_text.trim().is_empty() {
                continue;
            }
            let components: Vec<&str> = component_separator.splitn(entry_text, 5).collect();
            if components.len() != 5 {
                warn!(
                    found = components.len(),
                    "rule entry does not split into five components, skipping"
                );
                continue;
            }

            let mut categories = 0u32;
            let mut attributes = 0u32;
            for token in components[4].split_whitespace() {
                if let Some(index) = ATTRIBUTES.iter().position(|a| *a == token) {
                    attributes |= 1 << index;
                } else if let Some(index) = CATEGORIES.iter().position(|c| *c == token) {
                    categories |= 1 << index;
                } else {
                    warn!(token, "unknown category or attribute");
                }
            }

            let mut specificity = attributes.count_ones();
            // Entries requiring deeper loop nests rank ahead on ties.
            if attributes & (1 << LOOP2_ATTR) != 0 {
                specificity += 1;
            }
            if attributes & (1 << LOOP3_ATTR) != 0 {
                specificity += 2;
            }
            attributes &= !(1 << BOOST_ATTR);

            if categories == 0 {
                warn!("rule entry names no category, skipping");
                continue;
            }
            entries.push(RuleEntry {
                description: components[0].to_string(),
                explanation: components[1].to_string(),
                example: components[2].to_string(),
                compiler_flags: components[3].to_string(),
                categories,
                attributes,
                specificity,
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Suggestion matching, scoring and ranking.
//!
//! Each added code section becomes a weight vector over the bottleneck
//! categories plus structural attributes (loop depth, batch-wide
//! multiple-functions/-loops). `recommend` matches every database entry
//! against each section, scores the matches, and renders the ranked
//! suggestions.

use std::cmp::Ordering;

use rustc_hash::FxHashMap;

use crate::recommend::db::{
    RuleDatabase, RuleEntry, BR_I, D_L1, D_L2, D_MEM, D_TLB, FPT_FAST, FPT_SLOW, I_ACCESS, I_TLB,
    MULTIPLE_FUNCTIONS_ATTR, MULTIPLE_LOOPS_ATTR, OVERALL, WEIGHT_SLOTS,
};

/// Candidates scoring at or under this fraction of the best score are
/// dropped.
const SCORE_CUTOFF: f64 = 0.5;
/// Fraction of the largest category weight below which a category does not
/// count as significant.
const MIN_SUPPORT: f64 = 0.1;

const SECTION_RULE: &str =
    "********************************************************************************";
const ENTRY_RULE: &str =
    "--------------------------------------------------------------------------------\n\n";

const DEFAULT_GOOD_INT_CPI: f64 = 0.5;
const DEFAULT_GOOD_FP_CPI: f64 = 1.0;

struct CodeSection {
    header: String,
    is_loop: bool,
    depth: u32,
    weights: [f64; WEIGHT_SLOTS],
}

pub struct RecommendationEngine {
    db: RuleDatabase,
    /// Function and loop section counts for the current batch.
    func_loop: [u32; 2],
    sections: Vec<CodeSection>,
}

impl RecommendationEngine {
    pub fn new(db: RuleDatabase) -> Self {
        Self {
            db,
            func_loop: [0, 0],
            sections: Vec::new(),
        }
    }

    /// Convert a section's derived metrics into the category weight vector
    /// and queue it for the next `recommend` call.
    pub fn add_code_section(&mut self, header: &str, lcpi: &FxHashMap<String, f64>) {
        let get = |key: &str| lcpi.get(key).copied().unwrap_or(0.0);

        let is_loop = header.starts_with("Loop");
        let mut depth = 0;
        if is_loop {
            depth = (get("loop-depth") as u32).min(3);
        }
        self.func_loop[usize::from(is_loop)] += 1;

        let int_cpi = lcpi
            .get("good-int-CPI")
            .copied()
            .unwrap_or(DEFAULT_GOOD_INT_CPI);
        let fp_cpi = lcpi
            .get("good-fp-CPI")
            .copied()
            .unwrap_or(DEFAULT_GOOD_FP_CPI);
        let fp_ratio = get("ratio.floating_point");

        let mut weights = [0.0; WEIGHT_SLOTS];
        weights[OVERALL] =
            get("overall") * 100.0 / (int_cpi * (100.0 - fp_ratio) + fp_cpi * fp_ratio);
        weights[D_L1] = get("data_accesses.L1d_hits");
        weights[D_L2] = get("data_accesses.L2d_hits");
        weights[D_MEM] = get("data_accesses.L2d_misses");
        weights[D_TLB] = get("data_TLB.overall");
        weights[I_ACCESS] = get("instruction_accesses.overall");
        weights[I_TLB] = get("instruction_TLB.overall");
        weights[BR_I] = get("branch_instructions.overall");
        weights[FPT_FAST] = get("floating-point_instr.fast_FP_instr");
        weights[FPT_SLOW] = get("floating-point_instr.slow_FP_instr");

        // Minimum-support floor: categories merely close to the maximum are
        // noise, subtract a fraction of the largest bar from every one.
        let mut floor = 0.0f64;
        for weight in &weights[..OVERALL] {
            floor = floor.max(*weight);
        }
        floor *= MIN_SUPPORT;
        for weight in &mut weights[..OVERALL] {
            *weight -= floor;
        }

        self.sections.push(CodeSection {
            header: header.to_string(),
            is_loop,
            depth,
            weights,
        });
    }

    /// Render ranked suggestions for every queued section, up to `max` per
    /// section (all when `max <= 0`). The batch state is reset afterwards.
    pub fn recommend(&mut self, max: i32) -> String {
        let mut batch_attrs = 0u32;
        if self.func_loop[0] > 1 {
            batch_attrs |= 1 << MULTIPLE_FUNCTIONS_ATTR;
        }
        if self.func_loop[1] > 1 {
            batch_attrs |= 1 << MULTIPLE_LOOPS_ATTR;
        }

        let mut output = String::new();
        for section in &self.sections {
            let mut available = batch_attrs;
            for bit in 0..section.depth {
                available |= 1 << bit;
            }
            output.push('\n');
            output.push_str(SECTION_RULE);
            output.push('\n');
            output.push_str(&section.header);
            output.push('\n');
            output.push_str(SECTION_RULE);
            output.push('\n');
            output.push_str(&self.recommend_one(available, &section.weights, max));
        }

        self.func_loop = [0, 0];
        self.sections.clear();
        output
    }

    fn recommend_one(&self, available: u32, weights: &[f64; WEIGHT_SLOTS], max: i32) -> String {
        if weights[OVERALL] < 1.0 {
            return "The performance of this code section is already good.".to_string();
        }

        let mut high_score = 0.0f64;
        let mut candidates: Vec<(&RuleEntry, f64)> = Vec::new();
        for entry in self.db.entries() {
            if entry.matches(available) {
                let score = entry.score(weights);
                high_score = high_score.max(score);
                candidates.push((entry, score));
            }
        }

        let cutoff = high_score * SCORE_CUTOFF;
        let mut selected: Vec<(&RuleEntry, f64)> = candidates
            .into_iter()
            .filter(|(_, score)| *score > cutoff)
            .collect();

        // Descending by score, ties by specificity; sort_by is stable so
        // exact ties keep database order.
        selected.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(b.0.specificity.cmp(&a.0.specificity))
        });

        let mut size = selected.len();
        if max > 0 && size > max as usize {
            size = max as usize;
        }
        let selected = &selected[..size];

        let mut suggestion = String::from("\n");
        for (entry, _) in selected {
            suggestion.push_str(&entry.compiler_flags);
        }
        if suggestion.len() > 2 {
            suggestion.push_str(ENTRY_RULE);
        }
        for (index, (entry, _)) in selected.iter().enumerate() {
            suggestion.push_str(&entry.description);
            if !entry.explanation.is_empty() {
                suggestion.push_str(&entry.explanation);
                suggestion.push('\n');
            }
            suggestion.push_str(&entry.example);
            let has_content = !entry.description.is_empty()
                || !entry.explanation.is_empty()
                || !entry.example.is_empty();
            if index != size - 1 && has_content {
                suggestion.push_str(ENTRY_RULE);
            }
        }
        if suggestion.len() <= 2 {
            suggestion.push_str("Sorry, there are no suggestions for this code section in the database.\n");
        }
        suggestion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommend::db::RuleDatabase;

    fn database() -> RuleDatabase {
        RuleDatabase::parse(
            "BEGIN-DB\n\
             tile the loop\n-----\n\n-----\nexample A\n-----\n\n-----\nd-L1 d-L2 loop1\n\
             ......\n\
             block for L2\n-----\n\n-----\nexample B\n-----\n\n-----\nd-L1 d-L2 loop1 loop2\n\
             ......\n\
             align hot data\n-----\n\n-----\nexample C\n-----\n-falign\n-----\nd-L1\n\
             ......\n\
             reduce branches\n-----\n\n-----\nexample D\n-----\n\n-----\nbr-i\n\
             END-DB",
        )
        .unwrap()
    }

    fn lcpi(entries: &[(&str, f64)]) -> FxHashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn good_sections_exit_early() {
        let mut engine = RecommendationEngine::new(database());
        engine.add_code_section(
            "Function fast() at a.c:1",
            &lcpi(&[("overall", 0.3), ("ratio.floating_point", 0.0)]),
        );
        let output = engine.recommend(0);
        assert!(output.contains("The performance of this code section is already good."));
        assert!(!output.contains("tile the loop"));
    }

    #[test]
    fn loop_entries_require_loop_context() {
        let mut engine = RecommendationEngine::new(database());
        engine.add_code_section(
            "Function slow() at a.c:1",
            &lcpi(&[
                ("overall", 2.0),
                ("data_accesses.L1d_hits", 3.0),
            ]),
        );
        let output = engine.recommend(0);
        // Only the no-loop entry may match a function section.
        assert!(output.contains("align hot data"));
        assert!(!output.contains("tile the loop"));
    }

    #[test]
    fn deeper_loop_requirements_win_ties() {
        let mut engine = RecommendationEngine::new(database());
        engine.add_code_section(
            "Loop in function slow() at a.c:4",
            &lcpi(&[
                ("overall", 2.0),
                ("loop-depth", 2.0),
                ("data_accesses.L1d_hits", 2.0),
                ("data_accesses.L2d_hits", 1.0),
            ]),
        );
        let output = engine.recommend(0);
        // Identical scores (both sum d-L1 + d-L2); the loop2 entry is more
        // specific and must come first.
        let pos_block = output.find("block for L2").unwrap();
        let pos_tile = output.find("tile the loop").unwrap();
        assert!(pos_block < pos_tile);
    }

    #[test]
    fn exact_ties_preserve_database_order() {
        let db_text = "BEGIN-DB\n\
             first identical entry\n-----\n\n-----\n\n-----\n\n-----\nd-L1\n\
             ......\n\
             second identical entry\n-----\n\n-----\n\n-----\n\n-----\nd-L1\n\
             END-DB";
        let mut engine = RecommendationEngine::new(RuleDatabase::parse(db_text).unwrap());
        engine.add_code_section(
            "Function slow() at a.c:1",
            &lcpi(&[("overall", 2.0), ("data_accesses.L1d_hits", 3.0)]),
        );
        let output = engine.recommend(0);
        // Same score, same specificity: the stable sort keeps insertion
        // order.
        let pos_first = output.find("first identical entry").unwrap();
        let pos_second = output.find("second identical entry").unwrap();
        assert!(pos_first < pos_second);
    }

    #[test]
    fn low_scores_are_cut_off() {
        let mut engine = RecommendationEngine::new(database());
        engine.add_code_section(
            "Function slow() at a.c:1",
            &lcpi(&[
                ("overall", 2.0),
                ("data_accesses.L1d_hits", 5.0),
                ("branch_instructions.overall", 1.0),
            ]),
        );
        let output = engine.recommend(0);
        assert!(output.contains("align hot data"));
        // After the min-support floor the branch score (0.5) sits below
        // half of the L1 score (4.5), so the branch entry is discarded.
        assert!(!output.contains("reduce branches"));
    }

    #[test]
    fn max_suggestions_caps_output() {
        let mut engine = RecommendationEngine::new(database());
        engine.add_code_section(
            "Loop in function slow() at a.c:4",
            &lcpi(&[
                ("overall", 2.0),
                ("loop-depth", 2.0),
                ("data_accesses.L1d_hits", 2.0),
                ("data_accesses.L2d_hits", 1.9),
            ]),
        );
        let output = engine.recommend(1);
        assert!(output.contains("block for L2"));
        assert!(!output.contains("tile the loop"));
    }

    #[test]
    fn compiler_flags_precede_descriptions() {
        let mut engine = RecommendationEngine::new(database());
        engine.add_code_section(
            "Function slow() at a.c:1",
            &lcpi(&[("overall", 2.0), ("data_accesses.L1d_hits", 3.0)]),
        );
        let output = engine.recommend(0);
        let pos_flags = output.find("-falign").unwrap();
        let pos_desc = output.find("align hot data").unwrap();
        assert!(pos_flags < pos_desc);
    }

    #[test]
    fn multiple_functions_attribute_needs_more_than_one() {
        let db_text = "BEGIN-DB\n\
             split this function\n-----\n\n-----\n\n-----\n\n-----\nd-L1 multiple_functions\n\
             END-DB";
        let metrics = lcpi(&[("overall", 2.0), ("data_accesses.L1d_hits", 3.0)]);

        let mut engine = RecommendationEngine::new(RuleDatabase::parse(db_text).unwrap());
        engine.add_code_section("Function one() at a.c:1", &metrics);
        let output = engine.recommend(0);
        assert!(!output.contains("split this function"));

        engine.add_code_section("Function one() at a.c:1", &metrics);
        engine.add_code_section("Function two() at a.c:9", &metrics);
        let output = engine.recommend(0);
        assert!(output.contains("split this function"));
    }

    #[test]
    fn batch_state_resets_after_recommend() {
        let mut engine = RecommendationEngine::new(database());
        let metrics = lcpi(&[("overall", 2.0), ("data_accesses.L1d_hits", 3.0)]);
        engine.add_code_section("Function one() at a.c:1", &metrics);
        let first = engine.recommend(0);
        assert!(first.contains("Function one()"));
        let second = engine.recommend(0);
        assert!(second.is_empty());
    }

    #[test]
    fn unmatched_sections_get_the_canned_message() {
        let mut engine = RecommendationEngine::new(database());
        // Overall is bad but every category weight is zero, so all matches
        // score zero and nothing survives.
        engine.add_code_section(
            "Loop at a.c:4",
            &lcpi(&[("overall", 2.0), ("loop-depth", 1.0)]),
        );
        let output = engine.recommend(0);
        assert!(output.contains("Sorry, there are no suggestions"));
    }
}

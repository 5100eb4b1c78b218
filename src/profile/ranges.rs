//! Thread-range selector expansion.
//!
//! Selections like `"0"`, `"0,2-4"` or `"8-"` expand into an alternation
//! regex fragment that is substituted into the counter-name pattern, so only
//! counters recorded for the selected threads resolve to metric slots.

use thiserror::Error;

pub const MAX_THREADS: u32 = 128;

/// Matches any thread when no selection is given.
const ANY_THREAD: &str = r"(\d+,)?([\d]+)";

#[derive(Error, Debug)]
pub enum RangeError {
    #[error("invalid thread range pattern: {0}")]
    InvalidPattern(String),
}

/// Expand a thread selection into a regex fragment with exactly two capture
/// groups (rank prefix, thread id), the shape the counter-name pattern
/// expects.
pub fn thread_regex(pattern: Option<&str>) -> Result<String, RangeError> {
    let pattern = match pattern {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(ANY_THREAD.to_string()),
    };

    let mut threads = Vec::new();
    for part in pattern.split(',') {
        if part.chars().all(|c| c.is_ascii_digit()) && !part.is_empty() {
            threads.push(parse_thread(part)?);
        } else if let Some((from, to)) = part.split_once('-') {
            if !from.chars().all(|c| c.is_ascii_digit()) || !to.chars().all(|c| c.is_ascii_digit())
            {
                return Err(RangeError::InvalidPattern(part.to_string()));
            }
            let from = if from.is_empty() { 0 } else { parse_thread(from)? };
            let to = if to.is_empty() { MAX_THREADS } else { parse_thread(to)? };
            if to < from {
                return Err(RangeError::InvalidPattern(part.to_string()));
            }
            threads.extend(from..=to);
        } else {
            return Err(RangeError::InvalidPattern(part.to_string()));
        }
    }

    let alternation = threads
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join("|");
    Ok(format!(r"(\d+,)?({alternation})"))
}

fn parse_thread(text: &str) -> Result<u32, RangeError> {
    text.parse()
        .map_err(|_| RangeError::InvalidPattern(text.to_string()))
}

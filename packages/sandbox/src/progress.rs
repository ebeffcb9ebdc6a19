//! Translation of tool output lines into structured progress.

use std::sync::LazyLock;

use regex::Regex;
use scan_core::ProgressPattern;

/// Stage-local progress reported by a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolProgress {
    pub current: u64,
    pub total: u64,
}

// `Processed file [7/20]`, `Matching block [2/3, 1/3]`
static FRACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+)/(\d+)(?:,\s*(\d+)/(\d+))?\]").expect("static regex")
});

// `Registering image #12 (5)`: the parenthesised number counts registered images.
static REGISTERED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Registering image #\d+ \((\d+)\)").expect("static regex")
});

/// Stateful per-invocation parser. Reports only forward movement.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    pattern: ProgressPattern,
    expected_total: Option<u64>,
    last: Option<ToolProgress>,
}

impl ProgressParser {
    pub fn new(pattern: ProgressPattern, expected_total: Option<u64>) -> Self {
        Self {
            pattern,
            expected_total,
            last: None,
        }
    }

    pub fn parse(&mut self, line: &str) -> Option<ToolProgress> {
        let next = match self.pattern {
            ProgressPattern::None => None,
            ProgressPattern::Fraction => parse_fraction(line),
            ProgressPattern::RegisteredImages => {
                let total = self.expected_total.filter(|t| *t > 0)?;
                REGISTERED
                    .captures(line)
                    .and_then(|c| c[1].parse::<u64>().ok())
                    .map(|n| ToolProgress {
                        current: n.min(total),
                        total,
                    })
            }
        }?;

        match self.last {
            Some(last) if last.total == next.total && next.current <= last.current => None,
            _ => {
                self.last = Some(next);
                Some(next)
            }
        }
    }
}

fn parse_fraction(line: &str) -> Option<ToolProgress> {
    let caps = FRACTION.captures(line)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
    let (outer, outer_total) = (num(1)?, num(2)?);
    if outer_total == 0 {
        return None;
    }
    let progress = match (num(3), num(4)) {
        (Some(inner), Some(inner_total)) if inner_total > 0 => {
            // Counts come straight from tool output; anything that does not
            // fit is not progress.
            let total = outer_total.checked_mul(inner_total)?;
            let done = outer.saturating_sub(1).checked_mul(inner_total)?;
            ToolProgress {
                current: done.saturating_add(inner).min(total),
                total,
            }
        }
        _ => ToolProgress {
            current: outer.min(outer_total),
            total: outer_total,
        },
    };
    Some(progress)
}

//! Cumulative ratio table walk shared by RANDOM and HASH allocation.

use pisces_core::types::GroupAllocation;

/// Return the first group whose cumulative ratio exceeds `draw`. Falls back to
/// the first group when the ratios sum below `draw`; `None` for an empty table.
pub fn pick(allocation: &[GroupAllocation], draw: f64) -> Option<&str> {
    let first = allocation.first()?;
    let mut cumulative = 0.0;
    for entry in allocation {
        cumulative += entry.ratio;
        if draw < cumulative {
            return Some(entry.group.as_str());
        }
    }
    Some(first.group.as_str())
}

//! Plan-string parsing.

/// Parse `"500k"` → `500_000`, `"100m"` → `100_000_000`, `"unlimited"` →
/// `None`, an unknown string → `Some(0)`.
pub fn parse_daily_limit(plan: &str) -> Option<u64> {
    let plan = plan.trim();
    if plan.eq_ignore_ascii_case("unlimited") {
        return None;
    }
    let lower = plan.to_ascii_lowercase();
    let (digits, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1_000u64),
        Some('m') => (&lower[..lower.len() - 1], 1_000_000u64),
        Some('b') => (&lower[..lower.len() - 1], 1_000_000_000u64),
        _ => (lower.as_str(), 1u64),
    };
    match digits.parse::<u64>() {
        Ok(n) => Some(n.saturating_mul(multiplier)),
        Err(_) => Some(0),
    }
}

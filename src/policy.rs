use std::num::NonZero;

/// How many items may run at once, before the host and batch size are known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    /// Explicit cap. Zero means "not set".
    pub concurrency_limit: Option<usize>,

    /// Items per processing unit. Wins over `concurrency_limit` when the host
    /// reports at least one processing unit. Zero means "not set".
    pub per_unit_multiplier: Option<usize>,
}

/// Processing units reported by the host, or 0 when it cannot tell.
pub fn available_processing_units() -> usize {
    std::thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(0)
}

/// Resolve the effective concurrency limit.
///
/// Fallback order:
/// - multiplier x processing units, if both are non-zero
/// - explicit cap, if non-zero
/// - item count (everything at once)
///
/// The result is always at least 1.
pub fn resolve_limit(
    policy: &ConcurrencyPolicy,
    processing_units: usize,
    item_count: usize,
) -> usize {
    let limit = match (policy.per_unit_multiplier, policy.concurrency_limit) {
        (Some(m), _) if m > 0 && processing_units > 0 => m.saturating_mul(processing_units),
        (_, Some(c)) if c > 0 => c,
        _ => item_count,
    };
    limit.max(1)
}

//! Benchmark utilities.

/// Deterministic payload of the given size.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Record ids `r0..r{count}`.
pub fn record_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("r{i}")).collect()
}

//! Cache budget allocation across worker kinds.
//!
//! Each kind receives a share of the total budget proportional to its number
//! of non-aggregator connections. Aggregators have no data of their own and
//! count in neither numerator nor denominator.

use std::collections::HashMap;

use crate::config::LogicalConnection;

/// Count non-aggregator connections per worker kind.
///
/// Kinds whose connections are all aggregators appear with a count of 0.
pub fn connection_counts<'a>(
    connections: impl IntoIterator<Item = &'a LogicalConnection>,
) -> HashMap<String, u64> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for conn in connections {
        let count = counts.entry(conn.plugin.clone()).or_insert(0);
        if !conn.is_aggregator() {
            *count += 1;
        }
    }
    counts
}

/// Split `total_mb` across kinds by connection count.
///
/// A total of 0 means unlimited, so every kind gets 0. A kind with at least
/// one connection never gets less than 1 MB, since 0 would read as unlimited.
pub fn allocate(total_mb: u64, counts: &HashMap<String, u64>) -> HashMap<String, u64> {
    let global: u64 = counts.values().sum();

    counts
        .iter()
        .map(|(kind, &count)| {
            let share = if total_mb == 0 || count == 0 || global == 0 {
                0
            } else {
                ((total_mb as u128 * count as u128) / global as u128).max(1) as u64
            };
            (kind.clone(), share)
        })
        .collect()
}

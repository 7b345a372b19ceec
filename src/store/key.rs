//! Query key derivation.

use super::params::ParamMap;

/// Derive the cache index for a parameter map.
///
/// The map's values are serialized as a JSON array in ascending key order
/// (structural in `BTreeMap`), so two maps holding equal values under equal
/// keys produce identical strings regardless of insertion order.
#[must_use]
pub fn query_key(params: &ParamMap) -> String {
    let values: Vec<_> = params.values().collect();
    serde_json::to_string(&values).unwrap_or_else(|_| "[]".to_string())
}

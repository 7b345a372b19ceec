//! Parameter sources and the resolver binding them to the coordinator.
//!
//! Each configured parameter is either a static JSON value or a reactive
//! cell. The resolver snapshots the cells once at construction and keeps the
//! merged map current as change notifications arrive; listener tasks are
//! spawned by the store so they can reach the coordinator.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::signal::AttachValue;

pub type ParamValue = Value;
pub type ParamMap = BTreeMap<String, ParamValue>;

/// A single configured parameter.
#[derive(Debug, Clone)]
pub enum ParamSource {
    Static(ParamValue),
    Reactive(AttachValue<ParamValue>),
}

impl From<ParamValue> for ParamSource {
    fn from(value: ParamValue) -> Self {
        Self::Static(value)
    }
}

impl From<AttachValue<ParamValue>> for ParamSource {
    fn from(cell: AttachValue<ParamValue>) -> Self {
        Self::Reactive(cell)
    }
}

/// The `enabled` option follows the same static-or-reactive rule.
#[derive(Debug, Clone)]
pub enum EnabledSource {
    Static(bool),
    Reactive(AttachValue<bool>),
}

impl Default for EnabledSource {
    fn default() -> Self {
        Self::Static(true)
    }
}

impl From<bool> for EnabledSource {
    fn from(value: bool) -> Self {
        Self::Static(value)
    }
}

impl From<AttachValue<bool>> for EnabledSource {
    fn from(cell: AttachValue<bool>) -> Self {
        Self::Reactive(cell)
    }
}

impl EnabledSource {
    #[must_use]
    pub(crate) fn current(&self) -> bool {
        match self {
            Self::Static(value) => *value,
            Self::Reactive(cell) => cell.value(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ParamResolver {
    cells: Vec<(String, AttachValue<ParamValue>)>,
    current: Mutex<ParamMap>,
}

impl ParamResolver {
    pub(crate) fn new(sources: BTreeMap<String, ParamSource>) -> Self {
        let mut cells = Vec::new();
        let mut current = ParamMap::new();

        for (name, source) in sources {
            match source {
                ParamSource::Static(value) => {
                    current.insert(name, value);
                }
                ParamSource::Reactive(cell) => {
                    current.insert(name.clone(), cell.value());
                    cells.push((name, cell));
                }
            }
        }

        Self {
            cells,
            current: Mutex::new(current),
        }
    }

    /// Latest observed parameter map.
    pub(crate) fn current(&self) -> ParamMap {
        self.lock().clone()
    }

    pub(crate) fn set_value(&self, name: &str, value: ParamValue) {
        self.lock().insert(name.to_string(), value);
    }

    pub(crate) fn cells(&self) -> &[(String, AttachValue<ParamValue>)] {
        &self.cells
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ParamMap> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::signal;
    use serde_json::json;

    #[tokio::test]
    async fn test_initial_resolution_merges_static_and_reactive() {
        let sig = signal(json!(7));
        let mut sources = BTreeMap::new();
        sources.insert("fixed".to_string(), ParamSource::from(json!("a")));
        sources.insert("live".to_string(), ParamSource::from(sig.attach()));

        let resolver = ParamResolver::new(sources);
        let params = resolver.current();
        assert_eq!(params.get("fixed"), Some(&json!("a")));
        assert_eq!(params.get("live"), Some(&json!(7)));
        assert_eq!(resolver.cells().len(), 1);
    }

    #[tokio::test]
    async fn test_set_value_updates_snapshot() {
        let resolver = ParamResolver::new(BTreeMap::new());
        resolver.set_value("id", json!(2));
        assert_eq!(resolver.current().get("id"), Some(&json!(2)));
    }
}

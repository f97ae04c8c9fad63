use arc_swap::ArcSwap;
use opentelemetry::KeyValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Attribute key to the set of values that force a trace to be sampled.
///
/// Clones share the table. Readers load a snapshot, [`DyeingTable::set`]
/// publishes a complete replacement; a table is never edited in place.
#[derive(Clone, Debug, Default)]
pub struct DyeingTable {
    inner: Arc<ArcSwap<HashMap<String, HashSet<String>>>>,
}

impl DyeingTable {
    /// Creates a table with the given entries.
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let table = DyeingTable::default();
        table.set(collect(entries));
        table
    }

    /// Replaces the whole table.
    pub fn set(&self, table: HashMap<String, HashSet<String>>) {
        self.inner.store(Arc::new(table));
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<HashMap<String, HashSet<String>>> {
        self.inner.load_full()
    }

    /// Returns the first attribute whose value is listed for its key.
    pub fn matches<'a>(&self, attributes: &'a [KeyValue]) -> Option<&'a KeyValue> {
        let table = self.inner.load();
        if table.is_empty() {
            return None;
        }
        attributes.iter().find(|kv| {
            table
                .get(kv.key.as_str())
                .is_some_and(|values| values.contains(kv.value.as_str().as_ref()))
        })
    }
}

pub(crate) fn collect<I, K, V>(entries: I) -> HashMap<String, HashSet<String>>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: IntoIterator,
    V::Item: Into<String>,
{
    let mut table: HashMap<String, HashSet<String>> = HashMap::new();
    for (key, values) in entries {
        table
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }
    table
}

//! Process-level attributes stamped on every export.
use crate::semconv;
use opentelemetry::{KeyValue, Value};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Immutable set of resource attributes, cheap to clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resource {
    inner: Arc<Vec<KeyValue>>,
}

impl Resource {
    /// Creates a resource, later duplicates of a key replace earlier ones.
    pub fn new<T: IntoIterator<Item = KeyValue>>(kvs: T) -> Self {
        let mut attributes: Vec<KeyValue> = Vec::new();
        for kv in kvs {
            match attributes.iter().position(|existing| existing.key == kv.key) {
                Some(pos) => attributes[pos].value = kv.value,
                None => attributes.push(kv),
            }
        }
        Resource {
            inner: Arc::new(attributes),
        }
    }

    /// Creates an empty resource.
    pub fn empty() -> Self {
        Resource::default()
    }

    /// Returns a resource with `other` applied on top of `self`.
    pub fn merge(&self, other: &Resource) -> Self {
        Resource::new(self.iter().chain(other.iter()).cloned())
    }

    /// Iterates the attributes in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, KeyValue> {
        self.inner.iter()
    }

    /// Looks up one attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the resource carries no attributes.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The tenant this process reports under, if set.
    pub fn tenant_id(&self) -> Option<String> {
        self.get(semconv::TENANT_ID).map(|v| v.as_str().into_owned())
    }
}

/// A resource that can be amended while the pipeline runs.
///
/// Exporters load the current value for every batch; remote appliers publish
/// a new value with [`SharedResource::update`].
#[derive(Debug, Clone, Default)]
pub struct SharedResource {
    inner: Arc<ArcSwap<Resource>>,
}

impl SharedResource {
    /// Wraps `resource`.
    pub fn new(resource: Resource) -> Self {
        SharedResource {
            inner: Arc::new(ArcSwap::from_pointee(resource)),
        }
    }

    /// Current value.
    pub fn load(&self) -> Arc<Resource> {
        self.inner.load_full()
    }

    /// Merges `attributes` on top of the current value and publishes the result.
    pub fn update<T: IntoIterator<Item = KeyValue>>(&self, attributes: T) {
        let extra = Resource::new(attributes);
        self.inner.rcu(|current| current.merge(&extra));
    }
}

impl From<Resource> for SharedResource {
    fn from(resource: Resource) -> Self {
        SharedResource::new(resource)
    }
}

impl From<&Resource> for ProtoResource {
    fn from(resource: &Resource) -> Self {
        ProtoResource {
            attributes: resource.iter().map(crate::transform::key_value).collect(),
            dropped_attributes_count: 0,
            ..Default::default()
        }
    }
}

//! The descriptor contract consumed by the scheduler.
//!
//! Plugins implement [`KvDescriptor`] with their own typed `Value` and
//! `Metadata`. The registry wraps every descriptor into a
//! [`DescriptorAdapter`], which exposes the object-safe
//! [`ErasedDescriptor`] the engine works with. Type checks happen only at
//! that boundary; the engine itself never inspects value types.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;
use crate::value::{AnyMetadata, AnyValue, KeyValuePair, ValueOrigin};

/// What a dependency points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyTarget {
    /// A single key which must be satisfied.
    Key(String),
    /// Satisfied when at least one key under any of the prefixes is satisfied.
    AnyOf { key_prefixes: Vec<String> },
}

/// A labelled dependency declared by a descriptor for one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub label: String,
    pub target: DependencyTarget,
}

impl Dependency {
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    pub fn any_of(label: impl Into<String>, key_prefixes: Vec<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf { key_prefixes },
        }
    }

    /// Whether `key` can satisfy this dependency.
    pub fn matches(&self, key: &str) -> bool {
        match &self.target {
            DependencyTarget::Key(k) => k == key,
            DependencyTarget::AnyOf { key_prefixes } => {
                key_prefixes.iter().any(|p| key.starts_with(p.as_str()))
            }
        }
    }
}

/// A retrieved (or previously known) key-value pair with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct KvWithMetadata<V, M> {
    pub key: String,
    pub value: V,
    pub metadata: Option<M>,
    pub origin: ValueOrigin,
}

/// Type-erased form of [`KvWithMetadata`].
#[derive(Debug, Clone)]
pub struct ErasedKv {
    pub key: String,
    pub value: AnyValue,
    pub metadata: Option<AnyMetadata>,
    pub origin: ValueOrigin,
}

/// Per-value-type policy object contributed by a plugin.
///
/// Only `name`, `key_prefix`, `create` and `delete` are mandatory. Everything
/// else has a default matching the most common case.
#[async_trait]
pub trait KvDescriptor: Send + Sync + 'static {
    type Value: Clone
        + PartialEq
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    type Metadata: Clone + fmt::Debug + Serialize + Send + Sync + 'static;

    /// Unique descriptor name.
    fn name(&self) -> &str;

    /// Prefix of every key this descriptor owns.
    fn key_prefix(&self) -> &str;

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(self.key_prefix())
    }

    /// Short identifier of a key inside the descriptor scope.
    fn key_label(&self, key: &str) -> String {
        key.strip_prefix(self.key_prefix()).unwrap_or(key).to_string()
    }

    fn validate(&self, _key: &str, _value: &Self::Value) -> Result<(), DescriptorError> {
        Ok(())
    }

    async fn create(&self, key: &str, value: &Self::Value)
        -> Result<Self::Metadata, DescriptorError>;

    async fn update(
        &self,
        key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> Result<Self::Metadata, DescriptorError> {
        Err(DescriptorError::non_retriable(format!(
            "descriptor {} does not support update of {key}",
            self.name()
        )))
    }

    /// When `true`, a change is applied as Delete followed by Create.
    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        false
    }

    async fn delete(
        &self,
        key: &str,
        value: &Self::Value,
        metadata: Option<&Self::Metadata>,
    ) -> Result<(), DescriptorError>;

    /// Dump actual state. `Ok(None)` means the descriptor cannot retrieve,
    /// in which case the scheduler keeps trusting its own records.
    async fn retrieve(
        &self,
        _correlate: &[KvWithMetadata<Self::Value, Self::Metadata>],
    ) -> Result<Option<Vec<KvWithMetadata<Self::Value, Self::Metadata>>>, DescriptorError> {
        Ok(None)
    }

    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }

    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    fn equivalent(&self, _key: &str, a: &Self::Value, b: &Self::Value) -> bool {
        a == b
    }

    /// Descriptors whose Retrieve must run before this one.
    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        err.retriable
    }
}

/// Object-safe view of a descriptor operating on [`AnyValue`]s.
#[async_trait]
pub trait ErasedDescriptor: Send + Sync {
    fn name(&self) -> &str;
    fn key_prefix(&self) -> &str;
    fn key_selector(&self, key: &str) -> bool;
    fn key_label(&self, key: &str) -> String;

    /// Decode a lazy value (or type-check a typed one) into this
    /// descriptor's value type.
    fn normalize(&self, key: &str, value: &AnyValue) -> Result<AnyValue, DescriptorError>;

    fn validate(&self, key: &str, value: &AnyValue) -> Result<(), DescriptorError>;
    async fn create(&self, key: &str, value: &AnyValue) -> Result<AnyMetadata, DescriptorError>;
    async fn update(
        &self,
        key: &str,
        old: &AnyValue,
        new: &AnyValue,
        metadata: Option<&AnyMetadata>,
    ) -> Result<AnyMetadata, DescriptorError>;
    fn update_with_recreate(
        &self,
        key: &str,
        old: &AnyValue,
        new: &AnyValue,
        metadata: Option<&AnyMetadata>,
    ) -> bool;
    async fn delete(
        &self,
        key: &str,
        value: &AnyValue,
        metadata: Option<&AnyMetadata>,
    ) -> Result<(), DescriptorError>;
    async fn retrieve(&self, correlate: &[ErasedKv])
        -> Result<Option<Vec<ErasedKv>>, DescriptorError>;
    fn dependencies(&self, key: &str, value: &AnyValue) -> Vec<Dependency>;
    fn derived_values(&self, key: &str, value: &AnyValue) -> Vec<KeyValuePair>;
    fn equivalent(&self, key: &str, a: &AnyValue, b: &AnyValue) -> bool;
    fn retrieve_dependencies(&self) -> Vec<String>;
    fn is_retriable_failure(&self, err: &DescriptorError) -> bool;
}

/// Wraps a typed [`KvDescriptor`] into an [`ErasedDescriptor`].
pub struct DescriptorAdapter<D: KvDescriptor> {
    inner: D,
}

impl<D: KvDescriptor> DescriptorAdapter<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn typed<'a>(&self, key: &str, value: &'a AnyValue) -> Result<&'a D::Value, DescriptorError> {
        value.downcast_ref::<D::Value>().ok_or_else(|| {
            DescriptorError::invalid_value(
                format!(
                    "value of {key} is not of the type handled by descriptor {}",
                    self.inner.name()
                ),
                Vec::new(),
            )
        })
    }

    fn typed_metadata<'a>(metadata: Option<&'a AnyMetadata>) -> Option<&'a D::Metadata> {
        metadata.and_then(|m| m.downcast_ref::<D::Metadata>())
    }

    fn erase_kv(kv: KvWithMetadata<D::Value, D::Metadata>) -> ErasedKv {
        ErasedKv {
            key: kv.key,
            value: AnyValue::new(kv.value),
            metadata: kv.metadata.map(AnyMetadata::new),
            origin: kv.origin,
        }
    }
}

#[async_trait]
impl<D: KvDescriptor> ErasedDescriptor for DescriptorAdapter<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn key_prefix(&self) -> &str {
        self.inner.key_prefix()
    }

    fn key_selector(&self, key: &str) -> bool {
        self.inner.key_selector(key)
    }

    fn key_label(&self, key: &str) -> String {
        self.inner.key_label(key)
    }

    fn normalize(&self, key: &str, value: &AnyValue) -> Result<AnyValue, DescriptorError> {
        if value.downcast_ref::<D::Value>().is_some() {
            return Ok(value.clone());
        }
        if value.is_lazy() {
            let decoded: D::Value = serde_json::from_value(value.to_json()).map_err(|e| {
                DescriptorError::invalid_value(
                    format!("failed to decode value of {key}: {e}"),
                    Vec::new(),
                )
            })?;
            return Ok(AnyValue::new(decoded));
        }
        self.typed(key, value).map(|_| value.clone())
    }

    fn validate(&self, key: &str, value: &AnyValue) -> Result<(), DescriptorError> {
        let value = self.typed(key, value)?;
        self.inner.validate(key, value)
    }

    async fn create(&self, key: &str, value: &AnyValue) -> Result<AnyMetadata, DescriptorError> {
        let value = self.typed(key, value)?;
        let metadata = self.inner.create(key, value).await?;
        Ok(AnyMetadata::new(metadata))
    }

    async fn update(
        &self,
        key: &str,
        old: &AnyValue,
        new: &AnyValue,
        metadata: Option<&AnyMetadata>,
    ) -> Result<AnyMetadata, DescriptorError> {
        let old = self.typed(key, old)?;
        let new = self.typed(key, new)?;
        let metadata = self
            .inner
            .update(key, old, new, Self::typed_metadata(metadata))
            .await?;
        Ok(AnyMetadata::new(metadata))
    }

    fn update_with_recreate(
        &self,
        key: &str,
        old: &AnyValue,
        new: &AnyValue,
        metadata: Option<&AnyMetadata>,
    ) -> bool {
        match (self.typed(key, old), self.typed(key, new)) {
            (Ok(old), Ok(new)) => {
                self.inner
                    .update_with_recreate(key, old, new, Self::typed_metadata(metadata))
            }
            // An applied value of a foreign type can only be replaced.
            _ => true,
        }
    }

    async fn delete(
        &self,
        key: &str,
        value: &AnyValue,
        metadata: Option<&AnyMetadata>,
    ) -> Result<(), DescriptorError> {
        let value = self.typed(key, value)?;
        self.inner
            .delete(key, value, Self::typed_metadata(metadata))
            .await
    }

    async fn retrieve(
        &self,
        correlate: &[ErasedKv],
    ) -> Result<Option<Vec<ErasedKv>>, DescriptorError> {
        let typed: Vec<KvWithMetadata<D::Value, D::Metadata>> = correlate
            .iter()
            .filter_map(|kv| {
                let value = self.normalize(&kv.key, &kv.value).ok()?;
                let value = value.downcast_ref::<D::Value>()?.clone();
                Some(KvWithMetadata {
                    key: kv.key.clone(),
                    value,
                    metadata: Self::typed_metadata(kv.metadata.as_ref()).cloned(),
                    origin: kv.origin,
                })
            })
            .collect();
        let retrieved = self.inner.retrieve(&typed).await?;
        Ok(retrieved.map(|kvs| kvs.into_iter().map(Self::erase_kv).collect()))
    }

    fn dependencies(&self, key: &str, value: &AnyValue) -> Vec<Dependency> {
        self.typed(key, value)
            .map(|v| self.inner.dependencies(key, v))
            .unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &AnyValue) -> Vec<KeyValuePair> {
        self.typed(key, value)
            .map(|v| self.inner.derived_values(key, v))
            .unwrap_or_default()
    }

    fn equivalent(&self, key: &str, a: &AnyValue, b: &AnyValue) -> bool {
        match (self.typed(key, a), self.typed(key, b)) {
            (Ok(a), Ok(b)) => self.inner.equivalent(key, a, b),
            _ => a.json_eq(b),
        }
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.inner.retrieve_dependencies()
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        self.inner.is_retriable_failure(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Route {
        dst: String,
        via: String,
    }

    struct RouteDescriptor;

    #[async_trait]
    impl KvDescriptor for RouteDescriptor {
        type Value = Route;
        type Metadata = u32;

        fn name(&self) -> &str {
            "route"
        }

        fn key_prefix(&self) -> &str {
            "route/"
        }

        fn validate(&self, _key: &str, value: &Route) -> Result<(), DescriptorError> {
            if value.via.is_empty() {
                return Err(DescriptorError::invalid_value(
                    "missing next hop",
                    vec!["via".into()],
                ));
            }
            Ok(())
        }

        async fn create(&self, _key: &str, _value: &Route) -> Result<u32, DescriptorError> {
            Ok(7)
        }

        async fn delete(
            &self,
            _key: &str,
            _value: &Route,
            metadata: Option<&u32>,
        ) -> Result<(), DescriptorError> {
            match metadata {
                Some(7) => Ok(()),
                other => Err(DescriptorError::non_retriable(format!(
                    "unexpected metadata {other:?}"
                ))),
            }
        }

        fn dependencies(&self, _key: &str, value: &Route) -> Vec<Dependency> {
            vec![Dependency::on_key("next-hop", format!("iface/{}", value.via))]
        }
    }

    fn adapter() -> DescriptorAdapter<RouteDescriptor> {
        DescriptorAdapter::new(RouteDescriptor)
    }

    #[test]
    fn lazy_value_is_decoded() {
        let lazy = AnyValue::from_json(serde_json::json!({"dst": "10.0.0.0/8", "via": "if1"}));
        let typed = adapter().normalize("route/r1", &lazy).unwrap();
        assert!(!typed.is_lazy());
        assert_eq!(typed.downcast_ref::<Route>().unwrap().via, "if1");
    }

    #[test]
    fn undecodable_value_is_a_validation_error() {
        let lazy = AnyValue::from_json(serde_json::json!({"dst": 42}));
        let err = adapter().normalize("route/r1", &lazy).unwrap_err();
        assert!(!err.retriable);
        assert!(err.message.contains("route/r1"));
    }

    #[test]
    fn foreign_typed_value_is_rejected() {
        let err = adapter()
            .normalize("route/r1", &AnyValue::new("not a route".to_string()))
            .unwrap_err();
        assert!(err.message.contains("route"));
    }

    #[test]
    fn validate_and_dependencies_go_through_typed_value() {
        let a = adapter();
        let value = AnyValue::new(Route {
            dst: "0.0.0.0/0".into(),
            via: "".into(),
        });
        let err = a.validate("route/default", &value).unwrap_err();
        assert_eq!(err.invalid_fields, vec!["via".to_string()]);

        let value = AnyValue::new(Route {
            dst: "0.0.0.0/0".into(),
            via: "eth0".into(),
        });
        let deps = a.dependencies("route/default", &value);
        assert_eq!(deps, vec![Dependency::on_key("next-hop", "iface/eth0")]);
    }

    #[tokio::test]
    async fn metadata_is_threaded_back_to_delete() {
        let a = adapter();
        let value = AnyValue::new(Route {
            dst: "0.0.0.0/0".into(),
            via: "eth0".into(),
        });
        let md = a.create("route/default", &value).await.unwrap();
        assert_eq!(md.downcast_ref::<u32>(), Some(&7));
        a.delete("route/default", &value, Some(&md)).await.unwrap();
        assert!(a.delete("route/default", &value, None).await.is_err());
    }

    #[tokio::test]
    async fn default_update_is_unsupported_and_retrieve_is_unavailable() {
        let a = adapter();
        let value = AnyValue::new(Route {
            dst: "0.0.0.0/0".into(),
            via: "eth0".into(),
        });
        let err = a
            .update("route/default", &value, &value, None)
            .await
            .unwrap_err();
        assert!(!a.is_retriable_failure(&err));
        assert!(a.retrieve(&[]).await.unwrap().is_none());
    }

    #[test]
    fn any_of_dependency_matches_prefixes() {
        let dep = Dependency::any_of("uplink", vec!["iface/eth".into(), "iface/bond".into()]);
        assert!(dep.matches("iface/eth0"));
        assert!(dep.matches("iface/bond1"));
        assert!(!dep.matches("iface/lo"));
        assert_eq!(adapter().key_label("route/default"), "default");
    }
}

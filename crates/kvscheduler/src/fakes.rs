//! In-memory fakes for the descriptor contract (testing only)
//!
//! Provides `MockDescriptor`, a configurable descriptor over JSON values, and
//! `MockPlane`, the southbound plane it writes to. The plane records every
//! call so tests can assert ordering and concurrency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::descriptor::{Dependency, KvDescriptor, KvWithMetadata};
use crate::error::DescriptorError;
use crate::state::TxnOperation;
use crate::value::{KeyValuePair, ValueOrigin};

// ---------------------------------------------------------------------------
// MockPlane
// ---------------------------------------------------------------------------

/// One descriptor call seen by the plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub descriptor: String,
    pub operation: TxnOperation,
    pub key: String,
}

#[derive(Debug, Default)]
struct PlaneState {
    values: BTreeMap<String, (Value, ValueOrigin)>,
    calls: Vec<Call>,
    in_flight: HashMap<String, u32>,
    max_in_flight_per_key: u32,
    in_flight_total: u32,
    max_in_flight_total: u32,
    next_metadata: u64,
}

/// Shared in-memory southbound plane. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockPlane {
    state: Arc<Mutex<PlaneState>>,
}

impl MockPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value currently present in the plane.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().values.get(key).map(|(v, _)| v.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().values.keys().cloned().collect()
    }

    /// Put a value into the plane behind the scheduler's back, as if the
    /// southbound side created it on its own.
    pub fn insert_sb(&self, key: &str, value: Value) {
        self.state
            .lock()
            .unwrap()
            .values
            .insert(key.to_string(), (value, ValueOrigin::FromSb));
    }

    /// Change or drop a value behind the scheduler's back.
    pub fn set_raw(&self, key: &str, value: Option<Value>) {
        let mut state = self.state.lock().unwrap();
        match value {
            Some(v) => {
                let origin = state
                    .values
                    .get(key)
                    .map(|(_, o)| *o)
                    .unwrap_or(ValueOrigin::Unknown);
                state.values.insert(key.to_string(), (v, origin));
            }
            None => {
                state.values.remove(key);
            }
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls of one operation kind, in the order they started.
    pub fn calls_of(&self, operation: TxnOperation) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.key)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Highest number of concurrent calls observed for a single key.
    pub fn max_in_flight_per_key(&self) -> u32 {
        self.state.lock().unwrap().max_in_flight_per_key
    }

    /// Highest number of concurrent calls observed overall.
    pub fn max_in_flight_total(&self) -> u32 {
        self.state.lock().unwrap().max_in_flight_total
    }

    fn begin(&self, descriptor: &str, operation: TxnOperation, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            descriptor: descriptor.to_string(),
            operation,
            key: key.to_string(),
        });
        let count = state.in_flight.entry(key.to_string()).or_default();
        *count += 1;
        let count = *count;
        state.max_in_flight_per_key = state.max_in_flight_per_key.max(count);
        state.in_flight_total += 1;
        state.max_in_flight_total = state.max_in_flight_total.max(state.in_flight_total);
    }

    fn end(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.in_flight.get_mut(key) {
            *count -= 1;
        }
        state.in_flight_total = state.in_flight_total.saturating_sub(1);
    }

    fn store(&self, key: &str, value: &Value) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_metadata += 1;
        state
            .values
            .insert(key.to_string(), (value.clone(), ValueOrigin::FromNb));
        state.next_metadata
    }

    fn remove(&self, key: &str) {
        self.state.lock().unwrap().values.remove(key);
    }

    fn dump(&self, prefix: &str) -> Vec<(String, Value, ValueOrigin)> {
        self.state
            .lock()
            .unwrap()
            .values
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, o))| (k.clone(), v.clone(), *o))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockDescriptor
// ---------------------------------------------------------------------------

type DepsFn = Arc<dyn Fn(&str, &Value) -> Vec<Dependency> + Send + Sync>;
type DerivedFn = Arc<dyn Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync>;
type ValidateFn = Arc<dyn Fn(&str, &Value) -> Result<(), DescriptorError> + Send + Sync>;
type RecreateFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    remaining: u32,
    retriable: bool,
}

/// Descriptor over `serde_json::Value` with injectable behaviour.
///
/// Metadata is a counter handed out by the plane on every Create/Update.
#[derive(Clone)]
pub struct MockDescriptor {
    name: String,
    prefix: String,
    plane: MockPlane,
    dependencies: Option<DepsFn>,
    derived: Option<DerivedFn>,
    validate: Option<ValidateFn>,
    recreate: Option<RecreateFn>,
    supports_update: bool,
    retrieve: bool,
    retrieve_dependencies: Vec<String>,
    failures: Arc<Mutex<HashMap<String, FailurePlan>>>,
    retrieve_failures: Arc<Mutex<u32>>,
    latency: Option<Duration>,
}

impl MockDescriptor {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            plane: MockPlane::new(),
            dependencies: None,
            derived: None,
            validate: None,
            recreate: None,
            supports_update: true,
            retrieve: false,
            retrieve_dependencies: Vec::new(),
            failures: Arc::default(),
            retrieve_failures: Arc::default(),
            latency: None,
        }
    }

    /// Write into a plane shared with other descriptors.
    pub fn with_plane(mut self, plane: MockPlane) -> Self {
        self.plane = plane;
        self
    }

    pub fn with_dependencies<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) -> Vec<Dependency> + Send + Sync + 'static,
    {
        self.dependencies = Some(Arc::new(f));
        self
    }

    pub fn with_derived<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync + 'static,
    {
        self.derived = Some(Arc::new(f));
        self
    }

    pub fn with_validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<(), DescriptorError> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    /// Apply changes for which `f(old, new)` holds by Delete + Create.
    pub fn with_recreate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.recreate = Some(Arc::new(f));
        self
    }

    pub fn without_update(mut self) -> Self {
        self.supports_update = false;
        self
    }

    /// Answer Retrieve with the plane's content.
    pub fn with_retrieve(mut self) -> Self {
        self.retrieve = true;
        self
    }

    pub fn with_retrieve_dependencies(mut self, names: Vec<String>) -> Self {
        self.retrieve_dependencies = names;
        self
    }

    /// Fail the next `times` Create/Update/Delete calls on `key`.
    pub fn fail_on(self, key: &str, times: u32, retriable: bool) -> Self {
        self.failures.lock().unwrap().insert(
            key.to_string(),
            FailurePlan {
                remaining: times,
                retriable,
            },
        );
        self
    }

    /// Fail the next `times` Retrieve calls.
    pub fn fail_retrieve(self, times: u32) -> Self {
        *self.retrieve_failures.lock().unwrap() = times;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn plane(&self) -> MockPlane {
        self.plane.clone()
    }

    async fn call<T>(
        &self,
        operation: TxnOperation,
        key: &str,
        apply: impl FnOnce(&MockPlane) -> T,
    ) -> Result<T, DescriptorError> {
        self.plane.begin(&self.name, operation, key);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failure = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(key) {
                Some(plan) if plan.remaining > 0 => {
                    plan.remaining -= 1;
                    Some(plan.retriable)
                }
                _ => None,
            }
        };
        let result = match failure {
            Some(true) => Err(DescriptorError::new(format!("{operation} of {key}: device busy"))),
            Some(false) => Err(DescriptorError::non_retriable(format!(
                "{operation} of {key}: rejected by plane"
            ))),
            None => Ok(apply(&self.plane)),
        };
        self.plane.end(key);
        result
    }
}

#[async_trait]
impl KvDescriptor for MockDescriptor {
    type Value = Value;
    type Metadata = u64;

    fn name(&self) -> &str {
        &self.name
    }

    fn key_prefix(&self) -> &str {
        &self.prefix
    }

    fn validate(&self, key: &str, value: &Value) -> Result<(), DescriptorError> {
        match &self.validate {
            Some(f) => f(key, value),
            None => Ok(()),
        }
    }

    async fn create(&self, key: &str, value: &Value) -> Result<u64, DescriptorError> {
        self.call(TxnOperation::Create, key, |plane| plane.store(key, value))
            .await
    }

    async fn update(
        &self,
        key: &str,
        _old: &Value,
        new: &Value,
        _metadata: Option<&u64>,
    ) -> Result<u64, DescriptorError> {
        if !self.supports_update {
            return Err(DescriptorError::non_retriable(format!(
                "descriptor {} does not support update of {key}",
                self.name
            )));
        }
        self.call(TxnOperation::Update, key, |plane| plane.store(key, new))
            .await
    }

    fn update_with_recreate(
        &self,
        _key: &str,
        old: &Value,
        new: &Value,
        _metadata: Option<&u64>,
    ) -> bool {
        match &self.recreate {
            Some(f) => f(old, new),
            None => !self.supports_update,
        }
    }

    async fn delete(
        &self,
        key: &str,
        _value: &Value,
        _metadata: Option<&u64>,
    ) -> Result<(), DescriptorError> {
        self.call(TxnOperation::Delete, key, |plane| plane.remove(key))
            .await
    }

    async fn retrieve(
        &self,
        correlate: &[KvWithMetadata<Value, u64>],
    ) -> Result<Option<Vec<KvWithMetadata<Value, u64>>>, DescriptorError> {
        if !self.retrieve {
            return Ok(None);
        }
        {
            let mut failures = self.retrieve_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(DescriptorError::new(format!(
                    "{}: southbound plane unreachable",
                    self.name
                )));
            }
        }
        let known: HashMap<&str, &KvWithMetadata<Value, u64>> =
            correlate.iter().map(|kv| (kv.key.as_str(), kv)).collect();
        let dumped = self
            .plane
            .dump(&self.prefix)
            .into_iter()
            .map(|(key, value, origin)| {
                let metadata = known.get(key.as_str()).and_then(|kv| kv.metadata);
                KvWithMetadata {
                    key,
                    value,
                    metadata,
                    origin: match origin {
                        ValueOrigin::FromSb => ValueOrigin::FromSb,
                        _ => ValueOrigin::Unknown,
                    },
                }
            })
            .collect();
        Ok(Some(dumped))
    }

    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
        match &self.dependencies {
            Some(f) => f(key, value),
            None => Vec::new(),
        }
    }

    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair> {
        match &self.derived {
            Some(f) => f(key, value),
            None => Vec::new(),
        }
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.retrieve_dependencies.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn plane_tracks_calls_and_values() {
        let mock = MockDescriptor::new("iface", "iface/").with_retrieve();
        let plane = mock.plane();
        let meta = mock.create("iface/if1", &json!({"mtu": 1500})).await.unwrap();
        assert_eq!(meta, 1);
        assert_eq!(plane.get("iface/if1"), Some(json!({"mtu": 1500})));
        assert_eq!(plane.calls_of(TxnOperation::Create), vec!["iface/if1"]);

        let dumped = mock.retrieve(&[]).await.unwrap().unwrap();
        assert_eq!(dumped.len(), 1);
        assert_eq!(dumped[0].origin, ValueOrigin::Unknown);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let mock = MockDescriptor::new("iface", "iface/").fail_on("iface/if1", 1, true);
        let err = mock.create("iface/if1", &json!({})).await.unwrap_err();
        assert!(err.retriable);
        mock.create("iface/if1", &json!({})).await.unwrap();
    }
}

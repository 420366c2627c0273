//! Type-erased values and metadata carried through the graph.
//!
//! The engine never branches on the concrete type of a value. Descriptors see
//! their own typed `Value`/`Metadata`; everything in between moves around as
//! [`AnyValue`] / [`AnyMetadata`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Anything that can be stored in the graph as a value or as metadata.
pub trait ValueType: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> serde_json::Value;
}

impl<T> ValueType for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .unwrap_or_else(|e| serde_json::Value::String(format!("<unserializable: {e}>")))
    }
}

/// Cheaply clonable, type-erased value.
///
/// Either holds a concrete typed value, or a JSON document not yet decoded
/// into the owning descriptor's type ("lazy" value, as received from a
/// transport adapter).
#[derive(Clone)]
pub struct AnyValue {
    inner: Arc<dyn ValueType>,
    lazy: bool,
}

impl AnyValue {
    pub fn new<T: ValueType>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            lazy: false,
        }
    }

    /// Wrap a JSON document to be decoded by the descriptor claiming the key.
    pub fn from_json(json: serde_json::Value) -> Self {
        Self {
            inner: Arc::new(json),
            lazy: true,
        }
    }

    /// Value with no content, typically used for derived "property" values.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.inner.to_json()
    }

    /// Short SHA-256 fingerprint of the JSON rendering.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }

    /// Structural comparison through the JSON rendering. Used for values that
    /// have no descriptor to compare them.
    pub fn json_eq(&self, other: &AnyValue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.to_json() == other.to_json()
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lazy {
            write!(f, "Lazy({:?})", self.inner)
        } else {
            fmt::Debug::fmt(&*self.inner, f)
        }
    }
}

impl fmt::Display for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Type-erased metadata returned by Create/Update and threaded back into
/// later calls for the same key.
#[derive(Clone)]
pub struct AnyMetadata(Arc<dyn ValueType>);

impl AnyMetadata {
    pub fn new<T: ValueType>(metadata: T) -> Self {
        Self(Arc::new(metadata))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.0.to_json()
    }
}

impl fmt::Debug for AnyMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Key paired with a value, e.g. a derived value.
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: AnyValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOrigin {
    /// Retrieved value whose origin the descriptor cannot tell.
    #[default]
    Unknown,
    /// Supplied by a desired-state (northbound) request.
    FromNb,
    /// Discovered in, or created automatically by, the southbound plane.
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrigin::Unknown => write!(f, "unknown"),
            ValueOrigin::FromNb => write!(f, "from-NB"),
            ValueOrigin::FromSb => write!(f, "from-SB"),
        }
    }
}

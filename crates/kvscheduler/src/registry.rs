//! Explicit descriptor registry handed to the scheduler at construction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{DescriptorAdapter, ErasedDescriptor, KvDescriptor};
use crate::error::{Result, SchedulerError};

/// Table of registered descriptors, in registration order.
///
/// Each scheduler owns its own registry, so independent instances (e.g. in
/// tests) never share registrations.
#[derive(Clone, Default)]
pub struct DescriptorRegistry {
    descriptors: Vec<Arc<dyn ErasedDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed descriptor.
    pub fn register<D: KvDescriptor>(&mut self, descriptor: D) -> Result<()> {
        self.register_erased(Arc::new(DescriptorAdapter::new(descriptor)))
    }

    /// Register an already type-erased descriptor.
    ///
    /// Fails when the name is taken, or when the key selector of either
    /// descriptor claims the key prefix of the other.
    pub fn register_erased(&mut self, descriptor: Arc<dyn ErasedDescriptor>) -> Result<()> {
        let name = descriptor.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(SchedulerError::DuplicateDescriptor { name });
        }
        for existing in &self.descriptors {
            let collides = existing.key_selector(descriptor.key_prefix())
                || descriptor.key_selector(existing.key_prefix());
            if collides {
                return Err(SchedulerError::KeySelectorCollision {
                    new: name,
                    existing: existing.name().to_string(),
                    prefix: descriptor.key_prefix().to_string(),
                });
            }
        }
        debug!(descriptor = %name, prefix = %descriptor.key_prefix(), "descriptor registered");
        self.by_name.insert(name, self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ErasedDescriptor>> {
        self.by_name.get(name).map(|&i| &self.descriptors[i])
    }

    /// The descriptor whose key selector claims `key`.
    pub fn descriptor_for_key(&self, key: &str) -> Option<&Arc<dyn ErasedDescriptor>> {
        self.descriptors.iter().find(|d| d.key_selector(key))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<dyn ErasedDescriptor>> {
        self.descriptors.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl std::fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("descriptors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MockDescriptor;

    #[test]
    fn lookup_by_key_and_name() {
        let mut registry = DescriptorRegistry::new();
        registry.register(MockDescriptor::new("iface", "iface/")).unwrap();
        registry.register(MockDescriptor::new("bd", "bd/")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.descriptor_for_key("bd/bd1").map(|d| d.name()),
            Some("bd")
        );
        assert!(registry.descriptor_for_key("route/r1").is_none());
        assert!(registry.get("iface").is_some());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = DescriptorRegistry::new();
        registry.register(MockDescriptor::new("iface", "iface/")).unwrap();
        let err = registry
            .register(MockDescriptor::new("iface", "interface/"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateDescriptor { .. }));
    }

    #[test]
    fn overlapping_selectors_are_rejected() {
        let mut registry = DescriptorRegistry::new();
        registry.register(MockDescriptor::new("iface", "iface/")).unwrap();
        let err = registry
            .register(MockDescriptor::new("iface-vrf", "iface/vrf/"))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::KeySelectorCollision { ref existing, .. } if existing == "iface"
        ));
        assert_eq!(registry.len(), 1);
    }
}

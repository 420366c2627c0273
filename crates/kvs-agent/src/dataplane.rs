//! In-memory demo dataplane: interfaces and bridge domains.
//!
//! Interfaces live under `iface/<name>` and derive one address property per
//! configured IP (`iface/<name>/address/<ip>`). Bridge domains live under
//! `bd/<name>` and depend on every member interface.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kvscheduler::{
    AnyValue, DescriptorError, DescriptorRegistry, Dependency, KeyValuePair, KvDescriptor,
    KvWithMetadata, ValueOrigin,
};
use serde::{Deserialize, Serialize};

pub const IFACE_PREFIX: &str = "iface/";
pub const BD_PREFIX: &str = "bd/";

const MIN_MTU: u32 = 576;
const MAX_MTU: u32 = 9216;

fn default_mtu() -> u32 {
    1500
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Interface {
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Addresses in `ip/len` notation.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            enabled: default_enabled(),
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeDomain {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub learning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceMeta {
    pub sw_if_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeDomainMeta {
    pub bd_id: u32,
}

#[derive(Debug, Clone)]
struct InterfaceEntry {
    config: Interface,
    sw_if_index: u32,
    /// Created by the dataplane itself rather than through a descriptor.
    builtin: bool,
}

#[derive(Debug, Clone)]
struct BridgeDomainEntry {
    config: BridgeDomain,
    bd_id: u32,
    /// Member interfaces by index, resolved at creation.
    ports: Vec<u32>,
}

#[derive(Debug, Default)]
struct Tables {
    interfaces: BTreeMap<String, InterfaceEntry>,
    bridge_domains: BTreeMap<String, BridgeDomainEntry>,
    next_if_index: u32,
    next_bd_id: u32,
}

/// Shared handle to the dataplane tables.
#[derive(Debug, Clone, Default)]
pub struct Dataplane {
    tables: Arc<Mutex<Tables>>,
}

impl Dataplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an interface the way the platform would, e.g. a loopback that
    /// exists before any configuration arrives.
    pub fn add_builtin_interface(&self, name: &str, config: Interface) -> u32 {
        let mut tables = self.lock();
        tables.next_if_index += 1;
        let sw_if_index = tables.next_if_index;
        tables.interfaces.insert(
            name.to_string(),
            InterfaceEntry {
                config,
                sw_if_index,
                builtin: true,
            },
        );
        sw_if_index
    }

    pub fn interface(&self, name: &str) -> Option<Interface> {
        self.lock().interfaces.get(name).map(|e| e.config.clone())
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.lock().interfaces.keys().cloned().collect()
    }

    pub fn bridge_domain(&self, name: &str) -> Option<BridgeDomain> {
        self.lock().bridge_domains.get(name).map(|e| e.config.clone())
    }

    /// Interface indexes attached to a bridge domain.
    pub fn bridge_domain_ports(&self, name: &str) -> Option<Vec<u32>> {
        self.lock().bridge_domains.get(name).map(|e| e.ports.clone())
    }
}

fn interface_name(key: &str) -> Option<&str> {
    key.strip_prefix(IFACE_PREFIX)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// Key of the address property derived from an interface.
pub fn address_key(iface: &str, address: &str) -> String {
    format!("{IFACE_PREFIX}{iface}/address/{address}")
}

fn validate_address(address: &str) -> bool {
    let (ip, len) = match address.split_once('/') {
        Some((ip, len)) => (ip, Some(len)),
        None => (address, None),
    };
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    let max = if ip.is_ipv4() { 32 } else { 128 };
    match len {
        Some(len) => len.parse::<u8>().map(|l| l <= max).unwrap_or(false),
        None => true,
    }
}

pub struct InterfaceDescriptor {
    dataplane: Dataplane,
}

impl InterfaceDescriptor {
    pub fn new(dataplane: Dataplane) -> Self {
        Self { dataplane }
    }
}

#[async_trait]
impl KvDescriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = InterfaceMeta;

    fn name(&self) -> &str {
        "interface"
    }

    fn key_prefix(&self) -> &str {
        IFACE_PREFIX
    }

    fn key_selector(&self, key: &str) -> bool {
        interface_name(key).is_some()
    }

    fn validate(&self, _key: &str, value: &Interface) -> Result<(), DescriptorError> {
        if !(MIN_MTU..=MAX_MTU).contains(&value.mtu) {
            return Err(DescriptorError::invalid_value(
                format!("mtu {} outside {MIN_MTU}..={MAX_MTU}", value.mtu),
                vec!["mtu".to_string()],
            ));
        }
        if let Some(bad) = value.addresses.iter().find(|a| !validate_address(a)) {
            return Err(DescriptorError::invalid_value(
                format!("malformed address {bad}"),
                vec!["addresses".to_string()],
            ));
        }
        Ok(())
    }

    async fn create(
        &self,
        key: &str,
        value: &Interface,
    ) -> Result<InterfaceMeta, DescriptorError> {
        let name = interface_name(key)
            .ok_or_else(|| DescriptorError::non_retriable(format!("bad interface key {key}")))?;
        let mut tables = self.dataplane.lock();
        if tables.interfaces.contains_key(name) {
            return Err(DescriptorError::non_retriable(format!(
                "interface {name} already exists"
            )));
        }
        tables.next_if_index += 1;
        let sw_if_index = tables.next_if_index;
        tables.interfaces.insert(
            name.to_string(),
            InterfaceEntry {
                config: value.clone(),
                sw_if_index,
                builtin: false,
            },
        );
        Ok(InterfaceMeta { sw_if_index })
    }

    async fn update(
        &self,
        key: &str,
        _old: &Interface,
        new: &Interface,
        _metadata: Option<&InterfaceMeta>,
    ) -> Result<InterfaceMeta, DescriptorError> {
        let name = interface_name(key).unwrap_or(key);
        let mut tables = self.dataplane.lock();
        let entry = tables
            .interfaces
            .get_mut(name)
            .ok_or_else(|| DescriptorError::new(format!("interface {name} not found")))?;
        entry.config = new.clone();
        Ok(InterfaceMeta {
            sw_if_index: entry.sw_if_index,
        })
    }

    async fn delete(
        &self,
        key: &str,
        _value: &Interface,
        _metadata: Option<&InterfaceMeta>,
    ) -> Result<(), DescriptorError> {
        let name = interface_name(key).unwrap_or(key);
        let mut tables = self.dataplane.lock();
        if let Some(index) = tables.interfaces.get(name).map(|e| e.sw_if_index) {
            let in_use = tables
                .bridge_domains
                .values()
                .any(|bd| bd.ports.contains(&index));
            if in_use {
                return Err(DescriptorError::new(format!(
                    "interface {name} is still a bridge domain member"
                )));
            }
        }
        tables.interfaces.remove(name);
        Ok(())
    }

    async fn retrieve(
        &self,
        _correlate: &[KvWithMetadata<Interface, InterfaceMeta>],
    ) -> Result<Option<Vec<KvWithMetadata<Interface, InterfaceMeta>>>, DescriptorError> {
        let tables = self.dataplane.lock();
        let dumped = tables
            .interfaces
            .iter()
            .map(|(name, entry)| KvWithMetadata {
                key: format!("{IFACE_PREFIX}{name}"),
                value: entry.config.clone(),
                metadata: Some(InterfaceMeta {
                    sw_if_index: entry.sw_if_index,
                }),
                origin: if entry.builtin {
                    ValueOrigin::FromSb
                } else {
                    ValueOrigin::Unknown
                },
            })
            .collect();
        Ok(Some(dumped))
    }

    fn derived_values(&self, key: &str, value: &Interface) -> Vec<KeyValuePair> {
        let Some(name) = interface_name(key) else {
            return Vec::new();
        };
        value
            .addresses
            .iter()
            .map(|address| {
                KeyValuePair::new(address_key(name, address), AnyValue::new(address.clone()))
            })
            .collect()
    }
}

pub struct BridgeDomainDescriptor {
    dataplane: Dataplane,
}

impl BridgeDomainDescriptor {
    pub fn new(dataplane: Dataplane) -> Self {
        Self { dataplane }
    }

    fn resolve_ports(tables: &Tables, members: &[String]) -> Result<Vec<u32>, DescriptorError> {
        members
            .iter()
            .map(|m| {
                tables
                    .interfaces
                    .get(m)
                    .map(|e| e.sw_if_index)
                    .ok_or_else(|| DescriptorError::new(format!("member interface {m} not found")))
            })
            .collect()
    }
}

#[async_trait]
impl KvDescriptor for BridgeDomainDescriptor {
    type Value = BridgeDomain;
    type Metadata = BridgeDomainMeta;

    fn name(&self) -> &str {
        "bridge-domain"
    }

    fn key_prefix(&self) -> &str {
        BD_PREFIX
    }

    fn validate(&self, _key: &str, value: &BridgeDomain) -> Result<(), DescriptorError> {
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = value.members.iter().find(|m| !seen.insert(m.as_str())) {
            return Err(DescriptorError::invalid_value(
                format!("interface {dup} listed twice"),
                vec!["members".to_string()],
            ));
        }
        Ok(())
    }

    async fn create(
        &self,
        key: &str,
        value: &BridgeDomain,
    ) -> Result<BridgeDomainMeta, DescriptorError> {
        let name = key.strip_prefix(BD_PREFIX).unwrap_or(key);
        let mut tables = self.dataplane.lock();
        let ports = Self::resolve_ports(&tables, &value.members)?;
        tables.next_bd_id += 1;
        let bd_id = tables.next_bd_id;
        tables.bridge_domains.insert(
            name.to_string(),
            BridgeDomainEntry {
                config: value.clone(),
                bd_id,
                ports,
            },
        );
        Ok(BridgeDomainMeta { bd_id })
    }

    async fn update(
        &self,
        key: &str,
        _old: &BridgeDomain,
        new: &BridgeDomain,
        _metadata: Option<&BridgeDomainMeta>,
    ) -> Result<BridgeDomainMeta, DescriptorError> {
        let name = key.strip_prefix(BD_PREFIX).unwrap_or(key);
        let mut tables = self.dataplane.lock();
        let ports = Self::resolve_ports(&tables, &new.members)?;
        let entry = tables
            .bridge_domains
            .get_mut(name)
            .ok_or_else(|| DescriptorError::new(format!("bridge domain {name} not found")))?;
        entry.config = new.clone();
        entry.ports = ports;
        Ok(BridgeDomainMeta { bd_id: entry.bd_id })
    }

    async fn delete(
        &self,
        key: &str,
        _value: &BridgeDomain,
        _metadata: Option<&BridgeDomainMeta>,
    ) -> Result<(), DescriptorError> {
        let name = key.strip_prefix(BD_PREFIX).unwrap_or(key);
        self.dataplane.lock().bridge_domains.remove(name);
        Ok(())
    }

    async fn retrieve(
        &self,
        _correlate: &[KvWithMetadata<BridgeDomain, BridgeDomainMeta>],
    ) -> Result<Option<Vec<KvWithMetadata<BridgeDomain, BridgeDomainMeta>>>, DescriptorError> {
        let tables = self.dataplane.lock();
        let dumped = tables
            .bridge_domains
            .iter()
            .map(|(name, entry)| KvWithMetadata {
                key: format!("{BD_PREFIX}{name}"),
                value: entry.config.clone(),
                metadata: Some(BridgeDomainMeta { bd_id: entry.bd_id }),
                origin: ValueOrigin::Unknown,
            })
            .collect();
        Ok(Some(dumped))
    }

    fn dependencies(&self, _key: &str, value: &BridgeDomain) -> Vec<Dependency> {
        value
            .members
            .iter()
            .map(|m| Dependency::on_key(format!("member-{m}"), format!("{IFACE_PREFIX}{m}")))
            .collect()
    }

    /// Learning can only be toggled on an empty domain.
    fn update_with_recreate(
        &self,
        _key: &str,
        old: &BridgeDomain,
        new: &BridgeDomain,
        _metadata: Option<&BridgeDomainMeta>,
    ) -> bool {
        old.learning != new.learning
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec!["interface".to_string()]
    }
}

/// Register both demo descriptors against one dataplane.
pub fn register_demo(
    registry: &mut DescriptorRegistry,
    dataplane: &Dataplane,
) -> kvscheduler::Result<()> {
    registry.register(InterfaceDescriptor::new(dataplane.clone()))?;
    registry.register(BridgeDomainDescriptor::new(dataplane.clone()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_selector_skips_derived_keys() {
        let descriptor = InterfaceDescriptor::new(Dataplane::new());
        assert!(descriptor.key_selector("iface/if1"));
        assert!(!descriptor.key_selector("iface/if1/address/10.0.0.1/24"));
        assert!(!descriptor.key_selector("iface/"));
        assert!(!descriptor.key_selector("bd/bd1"));
    }

    #[test]
    fn interface_validation() {
        let descriptor = InterfaceDescriptor::new(Dataplane::new());
        assert!(descriptor
            .validate("iface/if1", &Interface::default())
            .is_ok());

        let err = descriptor
            .validate(
                "iface/if1",
                &Interface {
                    mtu: 100,
                    ..Interface::default()
                },
            )
            .unwrap_err();
        assert!(!err.retriable);
        assert_eq!(err.invalid_fields, vec!["mtu".to_string()]);

        let err = descriptor
            .validate(
                "iface/if1",
                &Interface {
                    addresses: vec!["10.0.0.1/24".into(), "10.0.0.300".into()],
                    ..Interface::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.invalid_fields, vec!["addresses".to_string()]);
    }

    #[test]
    fn addresses_become_derived_properties() {
        let descriptor = InterfaceDescriptor::new(Dataplane::new());
        let derived = descriptor.derived_values(
            "iface/if1",
            &Interface {
                addresses: vec!["10.0.0.1/24".into(), "fd00::1/64".into()],
                ..Interface::default()
            },
        );
        let keys: Vec<&str> = derived.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["iface/if1/address/10.0.0.1/24", "iface/if1/address/fd00::1/64"]
        );
    }

    #[test]
    fn bridge_domain_depends_on_members() {
        let descriptor = BridgeDomainDescriptor::new(Dataplane::new());
        let deps = descriptor.dependencies(
            "bd/bd1",
            &BridgeDomain {
                members: vec!["if1".into(), "if2".into()],
                learning: false,
            },
        );
        assert_eq!(deps.len(), 2);
        assert!(deps[0].matches("iface/if1"));
        assert!(deps[1].matches("iface/if2"));
        assert!(!deps[0].matches("iface/if2"));
    }

    #[tokio::test]
    async fn interface_lifecycle_assigns_indexes() {
        let dataplane = Dataplane::new();
        let local = dataplane.add_builtin_interface("local0", Interface::default());
        let descriptor = InterfaceDescriptor::new(dataplane.clone());

        let meta = descriptor
            .create("iface/if1", &Interface::default())
            .await
            .unwrap();
        assert_eq!(meta.sw_if_index, local + 1);

        let bigger = Interface {
            mtu: 9000,
            ..Interface::default()
        };
        let updated = descriptor
            .update("iface/if1", &Interface::default(), &bigger, Some(&meta))
            .await
            .unwrap();
        assert_eq!(updated, meta);
        assert_eq!(dataplane.interface("if1"), Some(bigger.clone()));

        let dumped = descriptor.retrieve(&[]).await.unwrap().unwrap();
        assert_eq!(dumped.len(), 2);
        let local0 = dumped.iter().find(|kv| kv.key == "iface/local0").unwrap();
        assert_eq!(local0.origin, ValueOrigin::FromSb);

        descriptor
            .delete("iface/if1", &bigger, Some(&meta))
            .await
            .unwrap();
        assert_eq!(dataplane.interface_names(), vec!["local0".to_string()]);
    }

    #[tokio::test]
    async fn bridge_domain_needs_its_members() {
        let dataplane = Dataplane::new();
        let bds = BridgeDomainDescriptor::new(dataplane.clone());
        let bd = BridgeDomain {
            members: vec!["if1".into()],
            learning: true,
        };

        let err = bds.create("bd/bd1", &bd).await.unwrap_err();
        assert!(err.retriable);

        let index = dataplane.add_builtin_interface("if1", Interface::default());
        bds.create("bd/bd1", &bd).await.unwrap();
        assert_eq!(dataplane.bridge_domain_ports("bd1"), Some(vec![index]));

        // A member cannot go away while the domain still uses it.
        let ifaces = InterfaceDescriptor::new(dataplane.clone());
        assert!(ifaces
            .delete("iface/if1", &Interface::default(), None)
            .await
            .is_err());
    }
}

//! Storage policies
//!
//! A policy is an ordered list of disks. New parts go to the first disk
//! that can reserve their size.

use crate::disk::{Disk, DiskRegistry, Reservation};
use std::sync::Arc;
use tierstore_common::config::StorageConfig;
use tierstore_common::{Error, Result};
use tracing::debug;

/// Name of the policy used by tables that do not pick one
pub const DEFAULT_POLICY: &str = "default";

#[derive(Clone, Debug, PartialEq)]
pub struct StoragePolicy {
    pub name: String,
    pub disks: Vec<String>,
    pub move_factor: f64,
}

impl StoragePolicy {
    /// Look up `name` in the configuration
    ///
    /// Without an explicit `default` policy, the default policy holds the
    /// first configured disk.
    pub fn resolve(config: &StorageConfig, name: &str) -> Result<Self> {
        if let Some(policy) = config.policies.iter().find(|p| p.name == name) {
            return Ok(Self {
                name: policy.name.clone(),
                disks: policy.disks.clone(),
                move_factor: policy.move_factor,
            });
        }
        match (name, config.disks.first()) {
            (DEFAULT_POLICY, Some(disk)) => Ok(Self {
                name: DEFAULT_POLICY.to_string(),
                disks: vec![disk.name.clone()],
                move_factor: 0.1,
            }),
            _ => Err(Error::PolicyNotFound(name.to_string())),
        }
    }

    /// Disk holding table-level files (format marker, mutation records)
    pub fn main_disk(&self) -> Result<&str> {
        self.disks
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::configuration(format!("storage policy '{}' has no disks", self.name)))
    }

    #[must_use]
    pub fn contains(&self, disk: &str) -> bool {
        self.disks.iter().any(|d| d == disk)
    }

    /// Reserve `bytes` on the first disk with room
    pub fn reserve(&self, registry: &DiskRegistry, bytes: u64) -> Result<(Arc<dyn Disk>, Reservation)> {
        let mut last_error = None;
        for name in &self.disks {
            let disk = registry.get(name)?;
            match disk.reserve(bytes) {
                Ok(reservation) => return Ok((disk, reservation)),
                Err(e) => {
                    debug!("Disk '{}' cannot reserve {} bytes: {}", name, bytes, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::PolicyNotFound(self.name.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierstore_client::Connector;
    use tierstore_common::config::{DiskConfig, PolicyConfig};

    #[test]
    fn test_resolve() {
        let mut config = StorageConfig::default();
        config.disks.push(DiskConfig::local("default", "/tmp/unused"));
        config.disks.push(DiskConfig::local("hdd", "/tmp/unused-hdd"));
        config.policies.push(PolicyConfig::new("tiered", &["default", "hdd"]));

        let default = StoragePolicy::resolve(&config, DEFAULT_POLICY).unwrap();
        assert_eq!(default.disks, vec!["default".to_string()]);
        let tiered = StoragePolicy::resolve(&config, "tiered").unwrap();
        assert!(tiered.contains("hdd"));
        assert_eq!(tiered.main_disk().unwrap(), "default");
        assert!(matches!(
            StoragePolicy::resolve(&config, "missing"),
            Err(Error::PolicyNotFound(_))
        ));
    }

    #[test]
    fn test_reserve_falls_through_full_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut small = DiskConfig::local("small", dir.path().join("small"));
        small.capacity = Some(10);
        let big = DiskConfig::local("big", dir.path().join("big"));
        let mut config = StorageConfig::default();
        config.disks = vec![small, big];
        config.policies.push(PolicyConfig::new("tiered", &["small", "big"]));
        let registry = DiskRegistry::open(&config, Connector::new()).unwrap();

        let policy = StoragePolicy::resolve(&config, "tiered").unwrap();
        let (disk, reservation) = policy.reserve(&registry, 1000).unwrap();
        assert_eq!(disk.name(), "big");
        assert_eq!(reservation.bytes(), 1000);
    }
}

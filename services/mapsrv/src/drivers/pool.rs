//! Connection pooling keyed by physical-channel identity.
//!
//! In Modbus RTU mode many devices hang off one serial port on RS-485, and a
//! Modbus TCP endpoint is a single session; neither tolerates a second
//! concurrent connection. The pool guarantees one driver per channel key
//! (serial device path, or "ip:port/slave") for the life of the process.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::ProtocolDriver;
use crate::error::Result;

/// Channel-identity keyed pool of live drivers.
pub struct DriverPool {
    drivers: DashMap<String, Arc<dyn ProtocolDriver>>,
}

impl Default for DriverPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverPool {
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
        }
    }

    /// Fetch the driver for `key`, creating it with `make` on first use.
    ///
    /// The entry is created under the map shard lock, so two devices racing
    /// on the same key still resolve to a single driver instance.
    pub fn get_or_create<F>(&self, key: &str, make: F) -> Result<Arc<dyn ProtocolDriver>>
    where
        F: FnOnce() -> Result<Arc<dyn ProtocolDriver>>,
    {
        if let Some(existing) = self.drivers.get(key) {
            return Ok(existing.value().clone());
        }
        match self.drivers.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let driver = make()?;
                debug!(channel = %key, "created driver");
                entry.insert(driver.clone());
                Ok(driver)
            },
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ProtocolDriver>> {
        self.drivers.get(key).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Close every pooled driver concurrently, logging (not propagating)
    /// stop failures.
    pub async fn close_all(&self) {
        let drivers: Vec<(String, Arc<dyn ProtocolDriver>)> = self
            .drivers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        futures::future::join_all(drivers.into_iter().map(|(key, driver)| async move {
            if let Err(err) = driver.close().await {
                warn!(channel = %key, %err, "failed to stop driver");
            }
        }))
        .await;
        self.drivers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::virt::VirtualDriver;

    #[tokio::test]
    async fn same_key_resolves_to_same_instance() {
        let pool = DriverPool::new();
        let a = pool
            .get_or_create("/dev/ttyS0", || {
                Ok(Arc::new(VirtualDriver::new("/dev/ttyS0")) as Arc<dyn ProtocolDriver>)
            })
            .unwrap();
        let b = pool
            .get_or_create("/dev/ttyS0", || {
                Ok(Arc::new(VirtualDriver::new("/dev/ttyS0")) as Arc<dyn ProtocolDriver>)
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        let c = pool
            .get_or_create("192.168.1.9:502/1", || {
                Ok(Arc::new(VirtualDriver::new("192.168.1.9:502/1")) as Arc<dyn ProtocolDriver>)
            })
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let pool = DriverPool::new();
        pool.get_or_create("x", || Ok(Arc::new(VirtualDriver::new("x")) as _))
            .unwrap();
        pool.close_all().await;
        assert!(pool.is_empty());
    }
}

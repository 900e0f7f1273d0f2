//! Sequential GATT service discovery
//!
//! Queries are issued strictly one at a time, in list order. The driver's
//! `on_service_discovered` callback is the only thing that advances the
//! cursor; once the last query completes, service enablement is started.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::driver::DongleDriver;
use crate::error::{CentralError, Result};

/// Generic Access service
pub const UUID_GENERIC_ACCESS: u16 = 0x1800;

/// Battery service
pub const UUID_BATTERY_SERVICE: u16 = 0x180F;

/// Human Interface Device service
pub const UUID_HID_SERVICE: u16 = 0x1812;

/// Service type value for a Bluetooth SIG 16-bit UUID
pub const SERVICE_TYPE_BLE: u8 = 1;

/// One service lookup: 16-bit UUID plus UUID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceQuery {
    /// 16-bit service UUID
    pub uuid: u16,
    /// UUID type as understood by the dongle
    #[serde(default = "default_service_type")]
    pub service_type: u8,
}

fn default_service_type() -> u8 {
    SERVICE_TYPE_BLE
}

impl ServiceQuery {
    /// Query for a SIG-assigned service UUID
    pub const fn new(uuid: u16) -> Self {
        Self {
            uuid,
            service_type: SERVICE_TYPE_BLE,
        }
    }

    /// Human-readable service name for well-known UUIDs
    pub fn name(&self) -> &'static str {
        match self.uuid {
            UUID_GENERIC_ACCESS => "Generic Access",
            UUID_BATTERY_SERVICE => "Battery Service",
            UUID_HID_SERVICE => "Human Interface Device",
            0x180A => "Device Information",
            _ => "Unknown Service",
        }
    }
}

impl fmt::Display for ServiceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}({})", self.uuid, self.name())
    }
}

/// Default query list: Generic Access, Battery, HID
pub fn default_service_queries() -> Vec<ServiceQuery> {
    vec![
        ServiceQuery::new(UUID_GENERIC_ACCESS),
        ServiceQuery::new(UUID_BATTERY_SERVICE),
        ServiceQuery::new(UUID_HID_SERVICE),
    ]
}

/// What happened after a service discovery completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStep {
    /// The query at this index was issued
    Next(usize),
    /// All queries done; `service_enable_start` was issued
    Enabling,
}

/// Walks the service query list one entry at a time
#[derive(Debug)]
pub struct ServiceEnumerator {
    queries: Vec<ServiceQuery>,
    cursor: Option<usize>,
}

impl ServiceEnumerator {
    /// Create an enumerator over an ordered query list
    pub fn new(queries: Vec<ServiceQuery>) -> Self {
        Self {
            queries,
            cursor: None,
        }
    }

    /// Configured queries
    pub fn queries(&self) -> &[ServiceQuery] {
        &self.queries
    }

    /// Index of the query currently awaiting completion
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Reset the cursor to 0 and issue the first query
    ///
    /// An empty list skips straight to enablement.
    pub async fn start<D: DongleDriver + ?Sized>(&mut self, driver: &D) -> Result<DiscoveryStep> {
        self.cursor = None;
        if self.queries.is_empty() {
            return self.enable(driver).await;
        }
        self.issue(driver, 0).await
    }

    /// Handle a discovery completion and issue whatever comes next
    ///
    /// Returns `None` when no discovery is running, so stray or duplicate
    /// completions cannot move the cursor.
    pub async fn on_discovered<D: DongleDriver + ?Sized>(
        &mut self,
        driver: &D,
        last_handle: u16,
    ) -> Option<Result<DiscoveryStep>> {
        let index = self.cursor?;
        debug!(
            index,
            last_handle = format_args!("0x{:04X}", last_handle),
            "Service discovery completed"
        );

        let next = index + 1;
        if next < self.queries.len() {
            Some(self.issue(driver, next).await)
        } else {
            self.cursor = None;
            Some(self.enable(driver).await)
        }
    }

    /// Stop tracking progress
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    async fn issue<D: DongleDriver + ?Sized>(
        &mut self,
        driver: &D,
        index: usize,
    ) -> Result<DiscoveryStep> {
        let query = self.queries[index];
        info!("Discovering service {} ({}/{})", query, index + 1, self.queries.len());
        match driver.service_discovery_start(query).await {
            Ok(()) => {
                self.cursor = Some(index);
                Ok(DiscoveryStep::Next(index))
            }
            Err(code) => {
                self.cursor = None;
                Err(CentralError::Driver {
                    stage: "service_discovery_start",
                    code,
                })
            }
        }
    }

    async fn enable<D: DongleDriver + ?Sized>(&mut self, driver: &D) -> Result<DiscoveryStep> {
        info!("All services discovered, enabling");
        driver
            .service_enable_start()
            .await
            .map_err(|code| CentralError::Driver {
                stage: "service_enable_start",
                code,
            })?;
        Ok(DiscoveryStep::Enabling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverCode;
    use crate::test_utils::{DriverCall, MockDongle};

    #[test]
    fn test_default_queries() {
        let queries = default_service_queries();
        let uuids: Vec<u16> = queries.iter().map(|q| q.uuid).collect();
        assert_eq!(uuids, vec![0x1800, 0x180F, 0x1812]);
        assert!(queries.iter().all(|q| q.service_type == 1));
    }

    #[test]
    fn test_query_display() {
        assert_eq!(
            ServiceQuery::new(0x180F).to_string(),
            "0x180F(Battery Service)"
        );
    }

    #[tokio::test]
    async fn test_walks_queries_in_order_then_enables() {
        let driver = MockDongle::new();
        let mut services = ServiceEnumerator::new(default_service_queries());

        assert_eq!(services.start(&driver).await.unwrap(), DiscoveryStep::Next(0));
        assert_eq!(
            services.on_discovered(&driver, 0x10).await.unwrap().unwrap(),
            DiscoveryStep::Next(1)
        );
        assert_eq!(
            services.on_discovered(&driver, 0x20).await.unwrap().unwrap(),
            DiscoveryStep::Next(2)
        );
        assert_eq!(
            services.on_discovered(&driver, 0x30).await.unwrap().unwrap(),
            DiscoveryStep::Enabling
        );
        assert_eq!(services.cursor(), None);

        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::ServiceDiscoveryStart(ServiceQuery::new(0x1800)),
                DriverCall::ServiceDiscoveryStart(ServiceQuery::new(0x180F)),
                DriverCall::ServiceDiscoveryStart(ServiceQuery::new(0x1812)),
                DriverCall::ServiceEnableStart,
            ]
        );
    }

    #[tokio::test]
    async fn test_stray_completion_is_ignored() {
        let driver = MockDongle::new();
        let mut services = ServiceEnumerator::new(default_service_queries());

        assert!(services.on_discovered(&driver, 0x10).await.is_none());
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_resets_cursor() {
        let driver = MockDongle::new();
        let mut services = ServiceEnumerator::new(default_service_queries());

        services.start(&driver).await.unwrap();
        services.on_discovered(&driver, 0x10).await;
        assert_eq!(services.cursor(), Some(1));

        services.start(&driver).await.unwrap();
        assert_eq!(services.cursor(), Some(0));
    }

    #[tokio::test]
    async fn test_driver_failure_clears_cursor() {
        let driver = MockDongle::new();
        driver.fail_next("service_discovery_start", DriverCode::new(0x11));
        let mut services = ServiceEnumerator::new(default_service_queries());

        let err = services.start(&driver).await.unwrap_err();
        assert_eq!(err.error_code(), "DRIVER_FAILURE");
        assert_eq!(services.cursor(), None);
    }

    #[tokio::test]
    async fn test_empty_list_enables_immediately() {
        let driver = MockDongle::new();
        let mut services = ServiceEnumerator::new(Vec::new());

        assert_eq!(services.start(&driver).await.unwrap(), DiscoveryStep::Enabling);
        assert_eq!(driver.calls(), vec![DriverCall::ServiceEnableStart]);
    }
}

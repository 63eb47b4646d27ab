//! Drivers and the Depot Registry
//!
//! A [`Driver`] understands one family of endpoint names and builds buses for
//! them. The [`Depot`] owns an ordered registration table of drivers and
//! resolves names and creates buses by asking each driver in turn. Depots are
//! explicit context objects: construct one at startup (or per test) and pass
//! it where it is needed.

use crate::bus::{AnyBus, BusKind, MemoryBus, MessageBus};
use crate::echo::EchoDriver;
use crate::endpoint::EndPoint;
use crate::error::{BusError, Result};
use crate::loopback::{LoopbackConfig, LoopbackDriver};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Transport driver contract
pub trait Driver: Send + Sync {
    /// Resolve a name this driver understands; `Ok(None)` for foreign names
    fn resolve_endpoint(&self, name: &str) -> Result<Option<EndPoint>>;

    /// Whether this driver can create a bus for the endpoint. `None` asks
    /// whether the driver can serve as the default.
    fn is_supported(&self, endpoint: Option<&EndPoint>) -> bool;

    /// Create an unopened bus bound to `endpoint`
    fn create_bus(&self, endpoint: &EndPoint) -> Result<AnyBus>;

    /// Record the owning depot
    fn set_depot(&self, depot: Weak<Depot>);

    fn depot(&self) -> Option<Arc<Depot>>;
}

/// Ordered driver registry
pub struct Depot {
    drivers: Vec<(String, Arc<dyn Driver>)>,
    default_endpoint: String,
}

impl Depot {
    /// Build a depot from an explicit registration table. Registration order
    /// is resolution order; duplicate names are rejected.
    pub fn new(drivers: Vec<(String, Arc<dyn Driver>)>, default_endpoint: impl Into<String>) -> Result<Arc<Self>> {
        for (i, (name, _)) in drivers.iter().enumerate() {
            if drivers[..i].iter().any(|(other, _)| other == name) {
                return Err(BusError::DuplicateDriver { name: name.clone() });
            }
        }

        let default_endpoint = default_endpoint.into();
        let depot = Arc::new_cyclic(|weak: &Weak<Depot>| {
            for (_, driver) in &drivers {
                driver.set_depot(weak.clone());
            }
            Depot {
                drivers,
                default_endpoint,
            }
        });

        info!(
            drivers = ?depot.driver_names(),
            default_endpoint = %depot.default_endpoint,
            "Depot initialized"
        );
        Ok(depot)
    }

    /// Depot with the built-in echo and loopback drivers
    pub fn from_config(config: &DepotConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let drivers: Vec<(String, Arc<dyn Driver>)> = vec![
            ("echo".to_string(), Arc::new(EchoDriver::new()) as Arc<dyn Driver>),
            (
                "loopback".to_string(),
                Arc::new(LoopbackDriver::new(config.loopback.clone())) as Arc<dyn Driver>,
            ),
        ];
        Self::new(drivers, config.default_endpoint.clone())
    }

    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn driver(&self, name: &str) -> Option<&Arc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|(registered, _)| registered == name)
            .map(|(_, driver)| driver)
    }

    pub fn default_endpoint(&self) -> &str {
        &self.default_endpoint
    }

    /// First driver to recognise the name wins
    pub fn resolve_endpoint(&self, name: &str) -> Result<EndPoint> {
        for (driver_name, driver) in &self.drivers {
            if let Some(endpoint) = driver.resolve_endpoint(name)? {
                debug!(%endpoint, driver = %driver_name, "Resolved endpoint");
                return Ok(endpoint);
            }
        }
        Err(BusError::unresolvable(name))
    }

    /// Create a message bus; `None` uses the default endpoint
    pub fn create_message_bus(&self, endpoint: Option<&EndPoint>) -> Result<Arc<dyn MessageBus>> {
        match self.create_bus(endpoint, BusKind::Message)? {
            AnyBus::Message(bus) => Ok(bus),
            AnyBus::Memory(_) => Err(BusError::illegal_state("driver returned a memory bus")),
        }
    }

    /// Create a memory bus; `None` uses the default endpoint
    pub fn create_memory_bus(&self, endpoint: Option<&EndPoint>) -> Result<Arc<dyn MemoryBus>> {
        match self.create_bus(endpoint, BusKind::Memory)? {
            AnyBus::Memory(bus) => Ok(bus),
            AnyBus::Message(_) => Err(BusError::illegal_state("driver returned a message bus")),
        }
    }

    /// Create a bus of the requested kind
    pub fn create_bus(&self, endpoint: Option<&EndPoint>, kind: BusKind) -> Result<AnyBus> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.resolve_endpoint(&self.default_endpoint)?,
        };

        let (name, driver) = self
            .drivers
            .iter()
            .find(|(_, driver)| driver.is_supported(Some(&endpoint)))
            .ok_or_else(|| BusError::unsupported(&endpoint))?;

        let bus = driver.create_bus(&endpoint)?;
        if bus.kind() != kind {
            warn!(%endpoint, driver = %name, requested = %kind, "Driver produced the wrong bus kind");
            // Opening and closing releases whatever the driver acquired
            if let Err(e) = bus.open().and_then(|_| bus.close()) {
                debug!(%endpoint, error = %e, "Failed to recycle mismatched bus");
            }
            return Err(BusError::UnsupportedBusKind {
                endpoint: endpoint.to_string(),
                kind: kind.as_str(),
            });
        }

        debug!(%endpoint, driver = %name, kind = %kind, "Created bus");
        Ok(bus)
    }
}

impl std::fmt::Debug for Depot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depot")
            .field("drivers", &self.driver_names())
            .field("default_endpoint", &self.default_endpoint)
            .finish()
    }
}

/// Expand a whitespace separated endpoint list.
///
/// A token containing `..` names a port range: `lb://host:80..82` yields
/// ports 80, 81 and 82; `lb://host:82..80` yields them in descending order.
/// The prefix ends at the last `.` or `:` before the range start.
pub fn parse_endpoints(depot: &Depot, names: &str) -> Result<Vec<EndPoint>> {
    let mut endpoints = Vec::new();
    for token in names.split_whitespace() {
        match token.find("..") {
            None => endpoints.push(depot.resolve_endpoint(token)?),
            Some(range_at) => {
                let head = &token[..range_at];
                let split = head
                    .rfind(|c: char| c == '.' || c == ':')
                    .ok_or_else(|| BusError::invalid_endpoint(token, "range without a port prefix"))?;
                let prefix = &head[..=split];
                let start: u32 = head[split + 1..]
                    .parse()
                    .map_err(|_| BusError::invalid_endpoint(token, "invalid range start"))?;
                let end: u32 = token[range_at + 2..]
                    .parse()
                    .map_err(|_| BusError::invalid_endpoint(token, "invalid range end"))?;

                let ports: Box<dyn Iterator<Item = u32>> = if start <= end {
                    Box::new(start..=end)
                } else {
                    Box::new((end..=start).rev())
                };
                for port in ports {
                    endpoints.push(depot.resolve_endpoint(&format!("{}{}", prefix, port))?);
                }
            }
        }
    }
    Ok(endpoints)
}

/// Depot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Endpoint used when a bus is created without one
    pub default_endpoint: String,
    pub loopback: LoopbackConfig,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            default_endpoint: "lb://default".to_string(),
            loopback: LoopbackConfig::default(),
        }
    }
}

impl DepotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_endpoint.trim().is_empty() {
            return Err(BusError::configuration("must not be empty", Some("default_endpoint")));
        }
        self.loopback.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    struct NamedDriver {
        protocol: &'static str,
        depot: RwLock<Weak<Depot>>,
    }

    impl NamedDriver {
        fn new(protocol: &'static str) -> Arc<Self> {
            Arc::new(Self {
                protocol,
                depot: RwLock::new(Weak::new()),
            })
        }
    }

    impl Driver for NamedDriver {
        fn resolve_endpoint(&self, name: &str) -> Result<Option<EndPoint>> {
            match name.strip_prefix(self.protocol).and_then(|rest| rest.strip_prefix("://")) {
                Some(address) => Ok(Some(EndPoint::new(self.protocol, address, None))),
                None => Ok(None),
            }
        }

        fn is_supported(&self, endpoint: Option<&EndPoint>) -> bool {
            endpoint.is_some_and(|ep| ep.protocol() == self.protocol)
        }

        fn create_bus(&self, endpoint: &EndPoint) -> Result<AnyBus> {
            Err(BusError::unsupported(endpoint))
        }

        fn set_depot(&self, depot: Weak<Depot>) {
            *self.depot.write() = depot;
        }

        fn depot(&self) -> Option<Arc<Depot>> {
            self.depot.read().upgrade()
        }
    }

    #[test]
    fn test_resolution_in_registration_order() {
        let first = NamedDriver::new("x");
        let second = NamedDriver::new("y");
        let depot = Depot::new(
            vec![
                ("first".to_string(), first.clone() as Arc<dyn Driver>),
                ("second".to_string(), second.clone() as Arc<dyn Driver>),
            ],
            "x://default",
        )
        .unwrap();

        assert_eq!(depot.resolve_endpoint("y://b").unwrap().protocol(), "y");
        assert!(matches!(
            depot.resolve_endpoint("z://c"),
            Err(BusError::UnresolvableEndPoint { .. })
        ));
        assert!(first.depot().is_some());
        assert!(Arc::ptr_eq(&second.depot().unwrap(), &depot));
    }

    #[test]
    fn test_duplicate_driver_rejected() {
        let result = Depot::new(
            vec![
                ("dup".to_string(), NamedDriver::new("x") as Arc<dyn Driver>),
                ("dup".to_string(), NamedDriver::new("y") as Arc<dyn Driver>),
            ],
            "x://default",
        );
        assert!(matches!(result, Err(BusError::DuplicateDriver { .. })));
    }

    #[test]
    fn test_range_expansion_both_directions() {
        let depot = Depot::new(
            vec![("x".to_string(), NamedDriver::new("x") as Arc<dyn Driver>)],
            "x://default",
        )
        .unwrap();

        let up: Vec<_> = parse_endpoints(&depot, "x://host:80..82")
            .unwrap()
            .iter()
            .map(|ep| ep.address().to_string())
            .collect();
        assert_eq!(up, vec!["host:80", "host:81", "host:82"]);

        let down: Vec<_> = parse_endpoints(&depot, "x://host:82..80 x://other:1")
            .unwrap()
            .iter()
            .map(|ep| ep.address().to_string())
            .collect();
        assert_eq!(down, vec!["host:82", "host:81", "host:80", "other:1"]);
    }

    #[test]
    fn test_unsupported_endpoint() {
        let depot = Depot::new(
            vec![("x".to_string(), NamedDriver::new("x") as Arc<dyn Driver>)],
            "x://default",
        )
        .unwrap();
        let foreign = EndPoint::new("q", "nowhere", None);
        assert!(matches!(
            depot.create_message_bus(Some(&foreign)),
            Err(BusError::UnsupportedEndPoint { .. })
        ));
    }
}

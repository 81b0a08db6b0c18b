use std::collections::BTreeSet;

use crate::{
    autolink::{
        error::{AutolinkError, config_conflict, invalid_config},
        types::{AutolinkSpec, ContainerId, WaypointDeclaration},
    },
    config::Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecId(pub usize);

/// Immutable table of configured autolinks and waypoint declarations.
#[derive(Debug, Clone, Default)]
pub struct AutolinkRegistry {
    specs: Vec<AutolinkSpec>,
    waypoints: Vec<WaypointDeclaration>,
}

impl AutolinkRegistry {
    pub fn new(
        specs: Vec<AutolinkSpec>,
        waypoints: Vec<WaypointDeclaration>,
    ) -> Result<Self, AutolinkError> {
        let mut seen = BTreeSet::new();
        for spec in &specs {
            if spec.address.trim().is_empty() {
                return Err(invalid_config("autolink address cannot be empty"));
            }
            if spec.container_id.trim().is_empty() {
                return Err(invalid_config(format!(
                    "autolink '{}' is missing a container_id",
                    spec.address
                )));
            }
            if spec.address.contains('#') {
                return Err(invalid_config(format!(
                    "autolink address '{}' must not carry a phase qualifier; use phase",
                    spec.address
                )));
            }

            let key = (
                spec.container_id.as_str(),
                spec.address.as_str(),
                spec.direction,
                spec.phase,
            );
            if !seen.insert(key) {
                return Err(config_conflict(format!(
                    "duplicate autolink: container_id={} address={} direction={} phase={}",
                    spec.container_id, spec.address, spec.direction, spec.phase
                )));
            }
        }

        for declaration in &waypoints {
            if declaration.prefix.trim().is_empty() {
                return Err(invalid_config("address prefix cannot be empty"));
            }
        }

        Ok(Self { specs, waypoints })
    }

    pub fn from_config(config: &Config) -> Result<Self, AutolinkError> {
        Self::new(config.autolinks.clone(), config.addresses.clone())
    }

    pub fn specs(&self) -> &[AutolinkSpec] {
        &self.specs
    }

    pub fn specs_for<'a>(
        &'a self,
        container_id: &'a str,
    ) -> impl Iterator<Item = (SpecId, &'a AutolinkSpec)> + 'a {
        self.specs
            .iter()
            .enumerate()
            .filter(move |(_, spec)| spec.container_id == container_id)
            .map(|(index, spec)| (SpecId(index), spec))
    }

    /// Distinct container ids in configuration order.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = Vec::new();
        for spec in &self.specs {
            if !ids.contains(&spec.container_id) {
                ids.push(spec.container_id.clone());
            }
        }
        ids
    }

    /// Whether links on `address` are served by this subsystem rather than the
    /// general router. Autolink addresses always are; otherwise the longest
    /// matching prefix declaration decides.
    pub fn handles(&self, address: &str) -> bool {
        if self.specs.iter().any(|spec| spec.address == address) {
            return true;
        }

        self.waypoints
            .iter()
            .filter(|declaration| address.starts_with(declaration.prefix.as_str()))
            .max_by_key(|declaration| declaration.prefix.len())
            .is_some_and(|declaration| declaration.waypoint)
    }
}

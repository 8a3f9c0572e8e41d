//! Advisor registry shared by the router and the nursery.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

use crate::advisor::{Advisor, AdvisorDescriptor};
use crate::error::{CouncilError, Result};

/// Active and retired advisors keyed by id. Iteration is always in
/// lexicographic id order.
#[derive(Default)]
pub struct AdvisorRegistry {
    active: RwLock<BTreeMap<String, Arc<dyn Advisor>>>,
    retired: RwLock<BTreeMap<String, AdvisorDescriptor>>,
}

impl AdvisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_advisors(advisors: Vec<Arc<dyn Advisor>>) -> Result<Self> {
        let registry = Self::new();
        for advisor in advisors {
            registry.register(advisor)?;
        }
        Ok(registry)
    }

    pub fn register(&self, advisor: Arc<dyn Advisor>) -> Result<()> {
        let id = advisor.id().to_string();
        let mut active = self.active.write();
        if active.contains_key(&id) || self.retired.read().contains_key(&id) {
            return Err(CouncilError::DuplicateAdvisor(id));
        }
        info!("Registering advisor: {}", id);
        active.insert(id, advisor);
        Ok(())
    }

    /// Move an advisor out of the active pool. The descriptor is kept for audit.
    pub fn retire(&self, id: &str) -> Result<AdvisorDescriptor> {
        let advisor = self
            .active
            .write()
            .remove(id)
            .ok_or_else(|| CouncilError::UnknownAdvisor(id.to_string()))?;
        let descriptor = advisor.descriptor().clone();
        self.retired.write().insert(id.to_string(), descriptor.clone());
        info!("Retired advisor: {}", id);
        Ok(descriptor)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Advisor>> {
        self.active.read().get(id).cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.read().contains_key(id)
    }

    pub fn active(&self) -> Vec<Arc<dyn Advisor>> {
        self.active.read().values().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<AdvisorDescriptor> {
        self.active
            .read()
            .values()
            .map(|a| a.descriptor().clone())
            .collect()
    }

    pub fn retired(&self) -> Vec<AdvisorDescriptor> {
        self.retired.read().values().cloned().collect()
    }

    /// Every capability tag of the active advisors.
    pub fn vocabulary(&self) -> BTreeSet<String> {
        self.active
            .read()
            .values()
            .flat_map(|a| a.descriptor().capabilities.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }
}

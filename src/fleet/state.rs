use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::fleet::provider::Instance;

/// A worker instance known to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub address: String,
    pub registered_at: DateTime<Utc>,
}

/// The supervisor's authoritative view of the fleet.
///
/// Lives behind one lock. Every method is a short, synchronous critical
/// section; nothing here touches the network.
#[derive(Debug, Default)]
pub struct FleetState {
    instances: HashMap<String, InstanceRecord>,
    launches_in_flight: usize,
    reconciled_at: Option<DateTime<Utc>>,
    /// Removal time of retired instances. A listing that began before the
    /// removal may still report them.
    retired: HashMap<String, DateTime<Utc>>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known instances plus launches that have been authorized but not resolved.
    pub fn committed(&self) -> usize {
        self.instances.len() + self.launches_in_flight
    }

    /// Decide whether one more instance may be launched.
    ///
    /// Grants only while queued tasks outnumber committed instances and the
    /// ceiling has not been reached. A grant is counted as in flight before
    /// returning, so concurrent launchers never act on the same deficit.
    pub fn authorize_launch(&mut self, queue_len: usize, ceiling: usize) -> bool {
        let committed = self.committed();
        if queue_len <= committed || committed >= ceiling {
            return false;
        }
        self.launches_in_flight += 1;
        true
    }

    /// Settle a previously authorized launch, registering the instance if one
    /// was created. Returns true if the instance was not known before.
    pub fn resolve_launch(&mut self, launched: Option<&Instance>) -> bool {
        self.launches_in_flight = self.launches_in_flight.saturating_sub(1);
        launched.is_some_and(|instance| self.register(instance))
    }

    /// Add an instance to the fleet. Instances without an address are skipped
    /// until a later reconciliation reports one. Retired instances are never
    /// registered again.
    pub fn register(&mut self, instance: &Instance) -> bool {
        let Some(address) = instance.address.as_deref().filter(|a| !a.is_empty()) else {
            return false;
        };
        if self.instances.contains_key(&instance.id) || self.retired.contains_key(&instance.id) {
            return false;
        }
        self.instances.insert(
            instance.id.clone(),
            InstanceRecord {
                id: instance.id.clone(),
                address: address.to_string(),
                registered_at: Utc::now(),
            },
        );
        true
    }

    /// Forget an instance after it was destroyed.
    pub fn remove(&mut self, id: &str) -> Option<InstanceRecord> {
        self.retired.insert(id.to_string(), Utc::now());
        self.instances.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.get(id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn launches_in_flight(&self) -> usize {
        self.launches_in_flight
    }

    /// Record a completed reconciliation whose listing began at `listed_at`.
    ///
    /// Instances removed before that listing began cannot appear in it or in
    /// any later one, so their tombstones are dropped.
    pub fn mark_reconciled(&mut self, listed_at: DateTime<Utc>) {
        self.reconciled_at = Some(listed_at);
        self.retired.retain(|_, removed_at| *removed_at >= listed_at);
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn reconciled_at(&self) -> Option<DateTime<Utc>> {
        self.reconciled_at
    }

    /// Known instances sorted by registration time.
    pub fn instances(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.instances.values().cloned().collect();
        records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        records
    }
}

//! Registry Store
//!
//! Concurrent map of component registrations. Entries are sharded by id so
//! register and heartbeat traffic for different components never contend on
//! one lock. Health status is never stored; it is derived from the last
//! heartbeat every time an entry is read.

use super::{
    ComponentRegistration, HealthPolicy, HealthStatus, HeartbeatAck, ListFilter, RegisterAck,
    ServiceRecord,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct RegistryEntry {
    registration: ComponentRegistration,
    session: String,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    sequence: u64,
}

impl RegistryEntry {
    fn record(&self, status: HealthStatus) -> ServiceRecord {
        ServiceRecord {
            registration: self.registration.clone(),
            status,
            last_heartbeat: self.last_heartbeat,
            registered_at: self.registered_at,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,

    pub healthy: usize,

    pub degraded: usize,

    pub expired: usize,
}

pub struct RegistryStore {
    entries: DashMap<String, RegistryEntry>,

    policy: HealthPolicy,

    clock: Arc<dyn Clock>,

    next_sequence: AtomicU64,
}

impl RegistryStore {
    pub fn new(policy: HealthPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            clock,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Registers a component. The same session may re-register freely; a
    /// different session is refused while the current holder is not expired.
    pub fn register(
        &self,
        registration: ComponentRegistration,
        session: Option<String>,
    ) -> RegistryResult<RegisterAck> {
        registration.validate()?;
        let registration = registration.normalized();
        let id = registration.id.clone();
        let now = self.clock.now();

        let ack = match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let same_session = session.as_deref() == Some(existing.session.as_str());
                let expired =
                    self.policy.status_at(existing.last_heartbeat, now) == HealthStatus::Expired;

                if !same_session && !expired {
                    return Err(RegistryError::DuplicateId { id });
                }

                let (session, sequence, registered_at) = if same_session {
                    (
                        existing.session.clone(),
                        existing.sequence,
                        existing.registered_at,
                    )
                } else {
                    (session.unwrap_or_else(new_session), self.next_sequence(), now)
                };
                // A re-registration may carry an older stamp than the last beat.
                let last_heartbeat = existing.last_heartbeat.max(now);

                occupied.insert(RegistryEntry {
                    registration,
                    session: session.clone(),
                    registered_at,
                    last_heartbeat,
                    sequence,
                });
                RegisterAck { id, session }
            }
            Entry::Vacant(vacant) => {
                let session = session.unwrap_or_else(new_session);
                vacant.insert(RegistryEntry {
                    registration,
                    session: session.clone(),
                    registered_at: now,
                    last_heartbeat: now,
                    sequence: self.next_sequence(),
                });
                RegisterAck { id, session }
            }
        };

        info!(component = %ack.id, "component registered");
        Ok(ack)
    }

    pub fn heartbeat(&self, id: &str, timestamp: DateTime<Utc>) -> RegistryResult<HeartbeatAck> {
        self.heartbeat_with_report(id, timestamp, &[])
    }

    /// Applies a heartbeat and the endpoint health it reports. Older
    /// heartbeats are dropped without error so `last_heartbeat` never
    /// regresses.
    pub fn heartbeat_with_report(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        unhealthy_endpoints: &[String],
    ) -> RegistryResult<HeartbeatAck> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if timestamp < entry.last_heartbeat {
            debug!(
                component = %id,
                stale = %timestamp,
                current = %entry.last_heartbeat,
                "dropping out-of-order heartbeat"
            );
            return Ok(HeartbeatAck {
                id: id.to_string(),
                applied: false,
            });
        }

        entry.last_heartbeat = timestamp;
        for endpoint in entry.registration.endpoints.iter_mut() {
            endpoint.healthy = !unhealthy_endpoints.contains(&endpoint.name);
        }

        Ok(HeartbeatAck {
            id: id.to_string(),
            applied: true,
        })
    }

    pub fn unregister(&self, id: &str) -> RegistryResult<()> {
        match self.entries.remove(id) {
            Some(_) => {
                info!(component = %id, "component unregistered");
                Ok(())
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    pub fn get(&self, id: &str) -> Option<ServiceRecord> {
        let now = self.clock.now();
        self.entries
            .get(id)
            .map(|e| e.record(self.policy.status_at(e.last_heartbeat, now)))
    }

    pub fn status_of(&self, id: &str) -> Option<HealthStatus> {
        let now = self.clock.now();
        self.entries
            .get(id)
            .map(|e| self.policy.status_at(e.last_heartbeat, now))
    }

    /// Snapshot of matching registrations in registration order.
    pub fn list(&self, filter: &ListFilter) -> Vec<ServiceRecord> {
        let now = self.clock.now();
        let mut records: Vec<ServiceRecord> = self
            .entries
            .iter()
            .map(|e| e.record(self.policy.status_at(e.last_heartbeat, now)))
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes `id` only if it is still expired at the moment of removal, so
    /// a heartbeat that lands mid-sweep keeps the entry alive.
    pub fn remove_if_expired(&self, id: &str) -> bool {
        self.entries
            .remove_if(id, |_, entry| {
                self.policy.status_at(entry.last_heartbeat, self.clock.now())
                    == HealthStatus::Expired
            })
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let now = self.clock.now();
        let mut stats = RegistryStats::default();
        for entry in self.entries.iter() {
            stats.total += 1;
            match self.policy.status_at(entry.last_heartbeat, now) {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Degraded => stats.degraded += 1,
                HealthStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

fn new_session() -> String {
    uuid::Uuid::new_v4().to_string()
}

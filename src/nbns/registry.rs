//! In-memory NetBIOS name registry shared by the UDP and TCP servers.

use crate::error::RegistryError;
use crate::nbns::name::NetBiosName;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameType {
    Unique,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStatus {
    Active,
    /// Hidden from queries and closed to registration until released or expired
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRecord {
    pub name: NetBiosName,
    pub name_type: NameType,
    pub status: NameStatus,
    /// Never empty; exactly one entry for unique names
    pub owners: Vec<Ipv4Addr>,
    pub deadline: Instant,
    pub refresh_interval: Duration,
}

impl NameRecord {
    fn new(name: &NetBiosName, name_type: NameType, owner: Ipv4Addr, ttl: Duration) -> Self {
        let now = Instant::now();
        NameRecord {
            name: name.clone(),
            name_type,
            status: NameStatus::Active,
            owners: vec![owner],
            deadline: expiry(now, ttl),
            refresh_interval: ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline < now
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or(now)
}

/// Name table guarded by a single readers-writer lock. Every operation is
/// atomic with respect to the others.
#[derive(Debug, Default)]
pub struct Registry {
    records: RwLock<HashMap<NetBiosName, NameRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `owner` for `name`.
    ///
    /// Group registrations coalesce with an active group record. Anything
    /// involving a unique name, or a name marked in conflict, is refused
    /// without touching the existing record; owners renew through `refresh`.
    /// A record past its deadline counts as absent.
    pub fn register(
        &self,
        name: &NetBiosName,
        name_type: NameType,
        owner: Ipv4Addr,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let now = Instant::now();
        if records.get(name).is_some_and(|r| r.is_expired(now)) {
            records.remove(name);
        }
        let Some(existing) = records.get_mut(name) else {
            records.insert(name.clone(), NameRecord::new(name, name_type, owner, ttl));
            return Ok(());
        };

        match (existing.name_type, name_type) {
            (NameType::Group, NameType::Group) if existing.status == NameStatus::Active => {
                if !existing.owners.contains(&owner) {
                    existing.owners.push(owner);
                    existing.deadline = expiry(now, ttl);
                }
                Ok(())
            }
            _ => Err(RegistryError::Conflict(name.to_string())),
        }
    }

    /// Owners and type of an active, unexpired name
    pub fn query(&self, name: &NetBiosName) -> Result<(Vec<Ipv4Addr>, NameType), RegistryError> {
        let records = self.records.read();
        match records.get(name) {
            Some(record)
                if record.status == NameStatus::Active && !record.is_expired(Instant::now()) =>
            {
                Ok((record.owners.clone(), record.name_type))
            }
            _ => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Remove `owner` from `name`; the record goes away with its last owner.
    pub fn release(&self, name: &NetBiosName, owner: Ipv4Addr) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let Some(index) = record.owners.iter().position(|o| *o == owner) else {
            return Err(RegistryError::OwnerMismatch(name.to_string()));
        };
        match record.name_type {
            NameType::Unique => {
                records.remove(name);
            }
            NameType::Group => {
                record.owners.remove(index);
                if record.owners.is_empty() {
                    records.remove(name);
                }
            }
        }
        Ok(())
    }

    /// Push the deadline of `name` out by its refresh interval.
    pub fn refresh(&self, name: &NetBiosName, owner: Ipv4Addr) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !record.owners.contains(&owner) {
            return Err(RegistryError::NotOwner(name.to_string()));
        }
        record.deadline = expiry(Instant::now(), record.refresh_interval);
        Ok(())
    }

    /// Hide `name` from queries
    pub fn mark_conflict(&self, name: &NetBiosName) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        record.status = NameStatus::Conflict;
        Ok(())
    }

    /// Hand a unique name to `new_owner` when its current owner is `previous`.
    pub fn reassign(
        &self,
        name: &NetBiosName,
        previous: Ipv4Addr,
        new_owner: Ipv4Addr,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if record.name_type != NameType::Unique || record.owners != [previous] {
            return Err(RegistryError::OwnerMismatch(name.to_string()));
        }
        *record = NameRecord::new(name, NameType::Unique, new_owner, ttl);
        Ok(())
    }

    /// Drop every record whose deadline has passed; returns how many
    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of the record for `name`, whatever its status
    pub fn record(&self, name: &NetBiosName) -> Option<NameRecord> {
        self.records.read().get(name).cloned()
    }
}

/// Periodically purge expired registrations until the task is aborted
pub fn spawn_cleanup(registry: Arc<Registry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = registry.clean_expired();
            if removed > 0 {
                tracing::debug!(removed = removed, remaining = registry.len(), "NBNS expired names purged");
            }
        }
    })
}

//! Slave registry: live workers, health, and watch events
//!
//! A concurrent map with snapshot reads. Writers are the registration
//! handler and the heartbeat sweeper; readers are the scheduler and the
//! realtime status surface. Watchers get add/remove/status events in FIFO
//! order per subscriber.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use flowkit::domain::{SlaveInfo, SlaveState, SlaveStatus};
use flowkit::now_ms;

/// Registry change notifications
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added { info: SlaveInfo },
    Removed { slave_id: String },
    StatusChanged { slave_id: String, status: SlaveStatus },
}

/// One registered slave with its live status and connection epoch
#[derive(Debug, Clone)]
pub struct SlaveEntry {
    pub info: SlaveInfo,
    pub status: SlaveStatus,
    pub epoch: String,
}

/// Authoritative map of known slaves
pub struct SlaveRegistry {
    inner: RwLock<HashMap<String, SlaveEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to subsequent registry events
    ///
    /// Delivery is at-least-once from the subscriber's point of view:
    /// pair this with a [`SlaveRegistry::list`] snapshot for current state.
    pub fn watch(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Add (or replace, on reconnect) a slave
    pub fn add(&self, info: SlaveInfo, epoch: String) {
        let slave_id = info.id.clone();
        let entry = SlaveEntry {
            info: info.clone(),
            status: SlaveStatus {
                state: SlaveState::Online,
                load: 0.0,
                active_tasks: 0,
                last_seen_ms: now_ms(),
            },
            epoch,
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slave_id.clone(), entry);
        info!(%slave_id, "slave registered");
        let _ = self.events.send(RegistryEvent::Added { info });
    }

    pub fn remove(&self, slave_id: &str) -> bool {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(slave_id)
            .is_some();
        if removed {
            info!(%slave_id, "slave removed");
            let _ = self.events.send(RegistryEvent::Removed {
                slave_id: slave_id.to_string(),
            });
        }
        removed
    }

    /// Apply a heartbeat: refresh status and `last_seen`
    pub fn heartbeat(&self, slave_id: &str, mut status: SlaveStatus) {
        status.last_seen_ms = now_ms();
        let mut changed = None;
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = inner.get_mut(slave_id) {
                if entry.status.state == SlaveState::Offline {
                    debug!(%slave_id, "slave back online");
                }
                entry.status = status.clone();
                changed = Some(status);
            } else {
                warn!(%slave_id, "heartbeat from unknown slave");
            }
        }
        if let Some(status) = changed {
            let _ = self.events.send(RegistryEvent::StatusChanged {
                slave_id: slave_id.to_string(),
                status,
            });
        }
    }

    /// Mark a slave offline (disconnect or missed heartbeats)
    pub fn mark_offline(&self, slave_id: &str) -> bool {
        let mut marked = None;
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = inner.get_mut(slave_id)
                && entry.status.state != SlaveState::Offline
            {
                entry.status.state = SlaveState::Offline;
                marked = Some(entry.status.clone());
            }
        }
        if let Some(status) = marked {
            warn!(%slave_id, "slave offline");
            let _ = self.events.send(RegistryEvent::StatusChanged {
                slave_id: slave_id.to_string(),
                status,
            });
            true
        } else {
            false
        }
    }

    pub fn get(&self, slave_id: &str) -> Option<SlaveEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slave_id)
            .cloned()
    }

    /// Snapshot of all entries
    pub fn list(&self) -> Vec<SlaveEntry> {
        let mut entries: Vec<SlaveEntry> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Health sweep: `online → offline` past the heartbeat timeout, and
    /// remove offline slaves whose lease expired. Returns the ids newly
    /// marked offline (the scheduler reschedules their work).
    pub fn sweep(&self, heartbeat_timeout_ms: i64, lease_ms: i64) -> Vec<String> {
        let now = now_ms();
        let mut newly_offline = Vec::new();
        let mut expired = Vec::new();
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            for (id, entry) in inner.iter() {
                let silent_for = now - entry.status.last_seen_ms;
                match entry.status.state {
                    SlaveState::Offline => {
                        if silent_for > lease_ms {
                            expired.push(id.clone());
                        }
                    }
                    _ => {
                        if silent_for > heartbeat_timeout_ms {
                            newly_offline.push(id.clone());
                        }
                    }
                }
            }
        }
        for id in &newly_offline {
            self.mark_offline(id);
        }
        for id in &expired {
            self.remove(id);
        }
        newly_offline
    }
}

//! Per-ENVKEY daemon state.
//!
//! All mutable daemon state lives in one [`DaemonState`] value guarded by a
//! single lock. Critical sections only read or swap map entries; network
//! and crypto work always happens outside the lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use envkey_core::EnvMap;
use tokio::sync::mpsc;

use crate::ipc::Notification;
use crate::ws::SocketControl;

/// Client identity remembered from the first fetch, reused for
/// daemon-initiated refetches.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub client_name: String,
    pub client_version: String,
}

/// Everything the daemon tracks for one ENVKEY.
#[derive(Default)]
pub struct EnvkeyRecord {
    pub current_env: Option<EnvMap>,
    pub previous_env: Option<EnvMap>,
    pub meta: ClientMeta,
    pub socket: Option<SocketControl>,
    pub subscribers: HashMap<String, mpsc::UnboundedSender<Notification>>,
    pub rolling: bool,
}

/// Result of removing a subscriber.
pub struct SubscriberRemoval {
    /// The removed subscriber was the last one for its ENVKEY.
    pub last_for_envkey: bool,
}

/// Process-wide state keyed by full ENVKEY string.
#[derive(Default)]
pub struct DaemonState {
    records: Mutex<HashMap<String, EnvkeyRecord>>,
}

impl DaemonState {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, EnvkeyRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_env(&self, envkey: &str) -> Option<EnvMap> {
        self.records()
            .get(envkey)
            .and_then(|record| record.current_env.clone())
    }

    /// Read current and previous env plus the socket control in one
    /// critical section.
    pub fn fetch_snapshot(&self, envkey: &str) -> (Option<EnvMap>, Option<EnvMap>, Option<SocketControl>) {
        let records = self.records();
        match records.get(envkey) {
            Some(record) => (
                record.current_env.clone(),
                record.previous_env.clone(),
                record.socket.clone(),
            ),
            None => (None, None, None),
        }
    }

    /// Clear `previous_env` after it has been returned to one client.
    pub fn clear_previous_env(&self, envkey: &str) {
        if let Some(record) = self.records().get_mut(envkey) {
            record.previous_env = None;
        }
    }

    /// Install a freshly fetched env. Returns whether it differs from the
    /// env it replaces; on change the old env becomes `previous_env`.
    pub fn update_env(&self, envkey: &str, env: EnvMap, meta: ClientMeta) -> bool {
        let mut records = self.records();
        let record = records.entry(envkey.to_string()).or_default();

        let changed = record
            .current_env
            .as_ref()
            .map(|current| *current != env)
            .unwrap_or(true);

        if changed {
            record.previous_env = record.current_env.take();
            record.current_env = Some(env);
            record.meta = meta;
        }
        changed
    }

    pub fn meta(&self, envkey: &str) -> ClientMeta {
        self.records()
            .get(envkey)
            .map(|record| record.meta.clone())
            .unwrap_or_default()
    }

    /// Register a socket for an ENVKEY. Returns false when one is already
    /// installed (the caller should not dial again).
    pub fn set_socket(&self, envkey: &str, control: SocketControl) -> bool {
        let mut records = self.records();
        let record = records.entry(envkey.to_string()).or_default();
        if record.socket.is_some() {
            return false;
        }
        record.socket = Some(control);
        true
    }

    pub fn socket(&self, envkey: &str) -> Option<SocketControl> {
        self.records()
            .get(envkey)
            .and_then(|record| record.socket.clone())
    }

    /// Register a TCP subscriber. Fails when the ENVKEY has no current env
    /// (the client must `/fetch` first).
    pub fn add_subscriber(
        &self,
        envkey: &str,
        connection_id: &str,
        sender: mpsc::UnboundedSender<Notification>,
    ) -> bool {
        let mut records = self.records();
        match records.get_mut(envkey) {
            Some(record) if record.current_env.is_some() => {
                record
                    .subscribers
                    .insert(connection_id.to_string(), sender);
                true
            }
            _ => false,
        }
    }

    pub fn remove_subscriber(&self, envkey: &str, connection_id: &str) -> SubscriberRemoval {
        let mut records = self.records();
        let last_for_envkey = match records.get_mut(envkey) {
            Some(record) => {
                record.subscribers.remove(connection_id);
                record.subscribers.is_empty()
            }
            None => false,
        };
        SubscriberRemoval { last_for_envkey }
    }

    /// Senders for every live subscriber of an ENVKEY.
    pub fn subscriber_senders(&self, envkey: &str) -> Vec<mpsc::UnboundedSender<Notification>> {
        self.records()
            .get(envkey)
            .map(|record| record.subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_rolling(&self, envkey: &str, rolling: bool) {
        if let Some(record) = self.records().get_mut(envkey) {
            record.rolling = rolling;
        }
    }

    pub fn is_rolling(&self, envkey: &str) -> bool {
        self.records()
            .get(envkey)
            .map(|record| record.rolling)
            .unwrap_or(false)
    }

    /// Drop every trace of an ENVKEY, returning the record so the caller
    /// can close its socket and subscribers outside the lock.
    pub fn remove_record(&self, envkey: &str) -> Option<EnvkeyRecord> {
        self.records().remove(envkey)
    }

    /// ENVKEYs that currently hold an env, with their remembered client
    /// identity.
    pub fn live_envkeys(&self) -> Vec<(String, ClientMeta)> {
        self.records()
            .iter()
            .filter(|(_, record)| record.current_env.is_some())
            .map(|(envkey, record)| (envkey.clone(), record.meta.clone()))
            .collect()
    }

    /// Number of ENVKEYs with a live socket.
    pub fn socket_count(&self) -> usize {
        self.records()
            .values()
            .filter(|record| record.socket.is_some())
            .count()
    }

    /// Broadcast a notification to every subscriber of an ENVKEY. Senders
    /// are collected under the lock; sending happens outside it.
    pub fn broadcast(&self, envkey: &str, notification: Notification) -> usize {
        let senders = self.subscriber_senders(envkey);
        let mut delivered = 0;
        for sender in &senders {
            if sender.send(notification.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

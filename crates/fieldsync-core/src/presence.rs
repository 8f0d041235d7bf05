//! Presence Tracker: ephemeral registry of who is viewing or editing a
//! document.
//!
//! Advisory only - presence never gates or blocks document mutation; it
//! feeds collaborative-awareness UI. Records are refreshed by heartbeat
//! and expire after a timeout with no heartbeat. Nothing here is ever
//! persisted: on reconnect the registry is rebuilt from the server
//! roster returned by the transport heartbeat.
//!
//! All methods take `now_ms` explicitly so expiry is deterministic under
//! test; the engine supplies wall-clock time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Activity state advertised by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceStatus {
    Online,
    Away,
}

/// One user's presence on one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    /// Display color for avatars/cursors, e.g. "#e07a5f".
    pub color: String,
    pub status: PresenceStatus,
    /// Last heartbeat in ms since epoch (local clock).
    pub last_heartbeat_ms: u64,
}

/// Timing configuration for presence liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Expected heartbeat cadence while a document is open.
    pub heartbeat_interval: Duration,
    /// A record with no heartbeat for this long is expired.
    /// Recommended 2-3x the heartbeat interval.
    pub expiry: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            expiry: Duration::from_secs(50),
        }
    }
}

/// Registry of presence records per document.
pub struct PresenceTracker {
    config: PresenceConfig,
    documents: RwLock<HashMap<String, HashMap<String, PresenceRecord>>>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PresenceConfig::default())
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Register a user on a document and begin the heartbeat obligation.
    ///
    /// Joining twice is idempotent: the existing record is refreshed.
    pub fn join(
        &self,
        document_id: &str,
        user_id: &str,
        display_name: &str,
        color: &str,
        now_ms: u64,
    ) -> PresenceRecord {
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            color: color.to_string(),
            status: PresenceStatus::Online,
            last_heartbeat_ms: now_ms,
        };
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents
            .entry(document_id.to_string())
            .or_default()
            .insert(user_id.to_string(), record.clone());
        record
    }

    /// Refresh a user's last-seen time. Returns false if the user has
    /// no record (expired or never joined) - the caller should re-join.
    pub fn heartbeat(&self, document_id: &str, user_id: &str, now_ms: u64) -> bool {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        match documents
            .get_mut(document_id)
            .and_then(|users| users.get_mut(user_id))
        {
            Some(record) => {
                record.last_heartbeat_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Update a user's online/away status (refreshes liveness too).
    pub fn set_status(
        &self,
        document_id: &str,
        user_id: &str,
        status: PresenceStatus,
        now_ms: u64,
    ) -> bool {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        match documents
            .get_mut(document_id)
            .and_then(|users| users.get_mut(user_id))
        {
            Some(record) => {
                record.status = status;
                record.last_heartbeat_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Remove a user's record (explicit departure).
    pub fn leave(&self, document_id: &str, user_id: &str) {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(users) = documents.get_mut(document_id) {
            users.remove(user_id);
        }
    }

    /// All records on a document that have not expired, ordered by user
    /// id for deterministic display.
    pub fn active_users(&self, document_id: &str, now_ms: u64) -> Vec<PresenceRecord> {
        let expiry_ms = self.config.expiry.as_millis() as u64;
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<PresenceRecord> = documents
            .get(document_id)
            .map(|users| {
                users
                    .values()
                    .filter(|r| now_ms.saturating_sub(r.last_heartbeat_ms) < expiry_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Drop every expired record, returning what was removed so the
    /// caller can emit events.
    pub fn prune(&self, now_ms: u64) -> Vec<(String, PresenceRecord)> {
        let expiry_ms = self.config.expiry.as_millis() as u64;
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        let mut expired = Vec::new();

        for (document_id, users) in documents.iter_mut() {
            let gone: Vec<String> = users
                .values()
                .filter(|r| now_ms.saturating_sub(r.last_heartbeat_ms) >= expiry_ms)
                .map(|r| r.user_id.clone())
                .collect();
            for user_id in gone {
                if let Some(record) = users.remove(&user_id) {
                    expired.push((document_id.clone(), record));
                }
            }
        }
        documents.retain(|_, users| !users.is_empty());

        expired
    }

    /// Replace a document's roster from the server's view (returned by
    /// the transport heartbeat). Liveness restarts on the local clock.
    pub fn replace_roster(&self, document_id: &str, roster: Vec<PresenceRecord>, now_ms: u64) {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        let users = documents.entry(document_id.to_string()).or_default();
        users.clear();
        for mut record in roster {
            record.last_heartbeat_ms = now_ms;
            users.insert(record.user_id.clone(), record);
        }
    }

    /// Forget everything for a document (connection lost; presence is
    /// rebuilt from scratch on reconnect).
    pub fn clear(&self, document_id: &str) {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.remove(document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(PresenceConfig {
            heartbeat_interval: Duration::from_secs(20),
            expiry: Duration::from_secs(50),
        })
    }

    #[test]
    fn test_join_makes_user_active() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 1_000);

        let active = presence.active_users("prop-1", 1_000);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].display_name, "Dana");
        assert_eq!(active[0].status, PresenceStatus::Online);
    }

    #[test]
    fn test_record_expires_without_heartbeat() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 0);

        // Just inside the expiry window
        assert_eq!(presence.active_users("prop-1", 49_999).len(), 1);
        // At the boundary the record is gone
        assert!(presence.active_users("prop-1", 50_000).is_empty());
    }

    #[test]
    fn test_heartbeat_extends_liveness() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 0);

        assert!(presence.heartbeat("prop-1", "u-1", 40_000));
        // Would have expired at 50_000 without the refresh
        assert_eq!(presence.active_users("prop-1", 80_000).len(), 1);
    }

    #[test]
    fn test_heartbeat_for_unknown_user_reports_rejoin() {
        let presence = tracker();
        assert!(!presence.heartbeat("prop-1", "u-1", 1_000));
    }

    #[test]
    fn test_prune_reports_expired_records() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 0);
        presence.join("prop-1", "u-2", "Sam", "#3d405b", 30_000);

        let expired = presence.prune(60_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "prop-1");
        assert_eq!(expired[0].1.user_id, "u-1");

        let active = presence.active_users("prop-1", 60_000);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "u-2");
    }

    #[test]
    fn test_rejoin_is_idempotent_refresh() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 0);
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 45_000);

        assert_eq!(presence.active_users("prop-1", 80_000).len(), 1);
    }

    #[test]
    fn test_set_status_away() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 0);
        presence.set_status("prop-1", "u-1", PresenceStatus::Away, 1_000);

        let active = presence.active_users("prop-1", 1_000);
        assert_eq!(active[0].status, PresenceStatus::Away);
    }

    #[test]
    fn test_replace_roster_rebuilds_from_server_view() {
        let presence = tracker();
        presence.join("prop-1", "u-stale", "Ghost", "#000000", 0);

        presence.replace_roster(
            "prop-1",
            vec![
                PresenceRecord {
                    user_id: "u-2".into(),
                    display_name: "Sam".into(),
                    color: "#3d405b".into(),
                    status: PresenceStatus::Online,
                    last_heartbeat_ms: 12, // server clock; replaced
                },
                PresenceRecord {
                    user_id: "u-1".into(),
                    display_name: "Dana".into(),
                    color: "#e07a5f".into(),
                    status: PresenceStatus::Online,
                    last_heartbeat_ms: 7,
                },
            ],
            100_000,
        );

        let active = presence.active_users("prop-1", 100_000);
        let ids: Vec<&str> = active.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u-1", "u-2"]);
        // Liveness restarted on the local clock
        assert!(active.iter().all(|r| r.last_heartbeat_ms == 100_000));
    }

    #[test]
    fn test_documents_are_independent() {
        let presence = tracker();
        presence.join("prop-1", "u-1", "Dana", "#e07a5f", 0);
        presence.join("prop-2", "u-2", "Sam", "#3d405b", 0);

        assert_eq!(presence.active_users("prop-1", 0).len(), 1);
        assert_eq!(presence.active_users("prop-2", 0).len(), 1);
        presence.clear("prop-1");
        assert!(presence.active_users("prop-1", 0).is_empty());
        assert_eq!(presence.active_users("prop-2", 0).len(), 1);
    }
}

//! Agent registry and configuration state machine.
//!
//! Per-agent lifecycle:
//! `Disconnected` → handshake → `Connected` (effective config captured on
//! the first status report). An operator-submitted config becomes
//! `pending`; the next agent message carries it down. The pending entry is
//! cleared only when the agent acknowledges with an effective config whose
//! hash matches — hash equality implies config equality because the hash is
//! SHA-256 of the body. Transport loss retains state for the TTL so
//! reconnects resume cleanly; a delivered-but-unacknowledged pending goes
//! stale after the TTL and is re-delivered on the next connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

/// SHA-256 of a config body; equality implies body equality.
pub fn config_hash(body: &str) -> [u8; 32] {
    Sha256::digest(body.as_bytes()).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connected,
    Disconnected,
}

/// A config queued for delivery to one agent.
#[derive(Debug, Clone)]
pub struct PendingConfig {
    pub body: String,
    pub hash: [u8; 32],
    pub queued_at: DateTime<Utc>,
    /// Set when the update was sent; cleared again if the ack never comes
    /// within the TTL (stale → retry on next connection).
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AgentState {
    pub instance_uid: Uuid,
    pub agent_type: String,
    pub agent_version: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub effective_config: Option<String>,
    pub pending: Option<PendingConfig>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// A config update the transport should send to the agent now.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDelivery {
    pub body: String,
    pub hash: [u8; 32],
}

/// Receipt returned to the operator for an accepted config submission.
#[derive(Debug, Serialize)]
pub struct AcceptReceipt {
    pub accepted: bool,
    pub targets: usize,
    pub pending_hash: String,
}

/// Status row for the REST facade.
#[derive(Debug, Serialize)]
pub struct AgentStatusEntry {
    pub instance_id: Uuid,
    pub agent_type: String,
    pub agent_version: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub has_pending_config: bool,
}

/// Connected-agent registry shared by the WebSocket transport and the REST
/// facade.
pub struct AgentRegistry {
    agents: DashMap<Uuid, AgentState>,
    /// A broadcast submitted while no agent was connected; handed to the
    /// next agent that appears.
    queued_broadcast: Mutex<Option<PendingConfig>>,
    pending_ttl: Duration,
}

impl AgentRegistry {
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            queued_broadcast: Mutex::new(None),
            pending_ttl,
        }
    }

    /// Process an inbound agent status report.
    ///
    /// Returns a [`ConfigDelivery`] when a pending config should go out on
    /// this connection now.
    pub fn handle_status(
        &self,
        instance_uid: Uuid,
        description: Option<(String, String)>,
        effective_config: Option<String>,
    ) -> Option<ConfigDelivery> {
        let now = Utc::now();
        let mut entry = self.agents.entry(instance_uid).or_insert_with(|| {
            let queued = self
                .queued_broadcast
                .lock()
                .expect("broadcast slot poisoned")
                .clone();
            AgentState {
                instance_uid,
                agent_type: String::new(),
                agent_version: String::new(),
                status: AgentStatus::Connected,
                last_seen: now,
                effective_config: None,
                pending: queued,
                disconnected_at: None,
            }
        });
        let agent = entry.value_mut();
        agent.status = AgentStatus::Connected;
        agent.last_seen = now;
        agent.disconnected_at = None;
        if let Some((agent_type, agent_version)) = description {
            agent.agent_type = agent_type;
            agent.agent_version = agent_version;
        }

        if let Some(effective) = effective_config {
            // Pending clears iff the agent now runs exactly what we sent.
            if let Some(pending) = &agent.pending {
                if config_hash(&effective) == pending.hash {
                    agent.pending = None;
                }
            }
            agent.effective_config = Some(effective);
        }

        match &mut agent.pending {
            Some(pending) if pending.delivered_at.is_none() => {
                pending.delivered_at = Some(now);
                Some(ConfigDelivery {
                    body: pending.body.clone(),
                    hash: pending.hash,
                })
            }
            _ => None,
        }
    }

    /// Record a transport close. State is retained for the TTL.
    pub fn mark_disconnected(&self, instance_uid: Uuid) {
        if let Some(mut agent) = self.agents.get_mut(&instance_uid) {
            agent.status = AgentStatus::Disconnected;
            agent.disconnected_at = Some(Utc::now());
        }
    }

    /// Store a config as pending for one agent or for all known agents.
    ///
    /// A broadcast with no agents connected is accepted and queued for the
    /// next agent to appear.
    pub fn set_pending(&self, target: Option<Uuid>, body: &str) -> Result<AcceptReceipt> {
        let hash = config_hash(body);
        let pending = PendingConfig {
            body: body.to_owned(),
            hash,
            queued_at: Utc::now(),
            delivered_at: None,
        };

        let targets = match target {
            Some(uid) => {
                let mut agent = self
                    .agents
                    .get_mut(&uid)
                    .ok_or_else(|| Error::not_found(format!("unknown agent instance {uid}")))?;
                agent.pending = Some(pending);
                1
            }
            None => {
                if self.agents.is_empty() {
                    *self
                        .queued_broadcast
                        .lock()
                        .expect("broadcast slot poisoned") = Some(pending);
                    0
                } else {
                    let mut count = 0;
                    for mut agent in self.agents.iter_mut() {
                        agent.pending = Some(pending.clone());
                        count += 1;
                    }
                    count
                }
            }
        };

        Ok(AcceptReceipt {
            accepted: true,
            targets,
            pending_hash: hex::encode(hash),
        })
    }

    /// The effective config of an agent; with no id, the sole agent's
    /// config when exactly one agent is known.
    pub fn get_agent(&self, target: Option<Uuid>) -> Result<AgentState> {
        match target {
            Some(uid) => self
                .agents
                .get(&uid)
                .map(|a| a.clone())
                .ok_or_else(|| Error::not_found(format!("unknown agent instance {uid}"))),
            None => {
                if self.agents.len() == 1 {
                    Ok(self
                        .agents
                        .iter()
                        .next()
                        .expect("len() == 1")
                        .value()
                        .clone())
                } else {
                    Err(Error::invalid(
                        "instance_id is required when more than one agent is connected",
                    ))
                }
            }
        }
    }

    pub fn status_list(&self) -> Vec<AgentStatusEntry> {
        let mut list: Vec<AgentStatusEntry> = self
            .agents
            .iter()
            .map(|a| AgentStatusEntry {
                instance_id: a.instance_uid,
                agent_type: a.agent_type.clone(),
                agent_version: a.agent_version.clone(),
                status: a.status,
                last_seen: a.last_seen,
                has_pending_config: a.pending.is_some(),
            })
            .collect();
        list.sort_by_key(|a| a.instance_id);
        list
    }

    pub fn connected_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.agents.len()
    }

    /// Expire disconnected agents and reset stale deliveries.
    ///
    /// Called periodically: disconnected agents older than the TTL are
    /// forgotten; pending configs delivered but unacknowledged within the
    /// TTL lose their delivered mark so the next connection retries them.
    pub fn sweep(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));

        self.agents.retain(|_, agent| {
            agent
                .disconnected_at
                .is_none_or(|at| now - at < ttl)
        });

        for mut agent in self.agents.iter_mut() {
            let instance_uid = agent.instance_uid;
            if let Some(pending) = &mut agent.pending {
                if pending.delivered_at.is_some_and(|at| now - at >= ttl) {
                    tracing::debug!(
                        instance_id = %instance_uid,
                        "Pending config unacknowledged past TTL, marking for re-delivery"
                    );
                    pending.delivered_at = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1800);

    fn uid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(TTL)
    }

    #[test]
    fn handshake_captures_description_and_config() {
        let reg = registry();
        let delivery = reg.handle_status(
            uid(1),
            Some(("otelcol".into(), "0.104.0".into())),
            Some("receivers: {}".into()),
        );
        assert_eq!(delivery, None);

        let agent = reg.get_agent(Some(uid(1))).unwrap();
        assert_eq!(agent.agent_type, "otelcol");
        assert_eq!(agent.status, AgentStatus::Connected);
        assert_eq!(agent.effective_config.as_deref(), Some("receivers: {}"));
    }

    #[test]
    fn pending_config_full_cycle() {
        let reg = registry();
        reg.handle_status(uid(1), None, Some("old".into()));

        let receipt = reg.set_pending(Some(uid(1)), "new").unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.targets, 1);

        // Next status report triggers delivery.
        let delivery = reg.handle_status(uid(1), None, None).unwrap();
        assert_eq!(delivery.body, "new");
        assert_eq!(delivery.hash, config_hash("new"));

        // Delivered but unacknowledged: no duplicate send.
        assert_eq!(reg.handle_status(uid(1), None, None), None);
        assert!(reg.get_agent(Some(uid(1))).unwrap().pending.is_some());

        // Agent acks by reporting the new config as effective.
        assert_eq!(reg.handle_status(uid(1), None, Some("new".into())), None);
        let agent = reg.get_agent(Some(uid(1))).unwrap();
        assert_eq!(agent.effective_config.as_deref(), Some("new"));
        assert!(agent.pending.is_none());
    }

    #[test]
    fn mismatched_ack_keeps_pending() {
        let reg = registry();
        reg.handle_status(uid(1), None, None);
        reg.set_pending(Some(uid(1)), "wanted").unwrap();
        reg.handle_status(uid(1), None, None); // delivered

        // The agent reports something else entirely: pending must survive.
        reg.handle_status(uid(1), None, Some("other".into()));
        assert!(reg.get_agent(Some(uid(1))).unwrap().pending.is_some());
    }

    #[test]
    fn unknown_target_is_not_found() {
        let reg = registry();
        let err = reg.set_pending(Some(uid(9)), "x").unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = reg.get_agent(Some(uid(9))).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn broadcast_with_no_agents_is_queued() {
        let reg = registry();
        let receipt = reg.set_pending(None, "later").unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.targets, 0);

        // The next agent to appear inherits the queued broadcast.
        let delivery = reg.handle_status(uid(1), None, None).unwrap();
        assert_eq!(delivery.body, "later");
    }

    #[test]
    fn broadcast_targets_every_known_agent() {
        let reg = registry();
        reg.handle_status(uid(1), None, None);
        reg.handle_status(uid(2), None, None);
        let receipt = reg.set_pending(None, "fleet").unwrap();
        assert_eq!(receipt.targets, 2);
    }

    #[test]
    fn sole_agent_resolves_without_id() {
        let reg = registry();
        reg.handle_status(uid(1), None, Some("cfg".into()));
        assert_eq!(
            reg.get_agent(None).unwrap().effective_config.as_deref(),
            Some("cfg")
        );

        reg.handle_status(uid(2), None, None);
        assert_eq!(reg.get_agent(None).unwrap_err().code(), "invalid_argument");
    }

    #[test]
    fn disconnect_retains_state() {
        let reg = registry();
        reg.handle_status(uid(1), None, Some("cfg".into()));
        reg.mark_disconnected(uid(1));
        let agent = reg.get_agent(Some(uid(1))).unwrap();
        assert_eq!(agent.status, AgentStatus::Disconnected);
        assert_eq!(agent.effective_config.as_deref(), Some("cfg"));

        // Within the TTL the sweep keeps it.
        reg.sweep();
        assert_eq!(reg.total_count(), 1);
    }

    #[test]
    fn hash_equality_implies_config_equality() {
        assert_eq!(config_hash("a"), config_hash("a"));
        assert_ne!(config_hash("a"), config_hash("b"));
    }
}

//! OpAMP wire messages.
//!
//! The subset of the OpAMP protocol this coordinator speaks, as
//! hand-tagged prost messages: status reporting, effective config, and
//! remote-config delivery. Field numbers follow the OpAMP proto definition
//! so real collector agents interoperate; capability groups we do not
//! implement (packages, connection settings, commands) are simply absent —
//! protobuf skips unknown fields in both directions.

use std::collections::HashMap;

use opentelemetry_proto::tonic::common::v1::KeyValue;
use prost::Message;

/// Agent → server status report.
#[derive(Clone, PartialEq, Message)]
pub struct AgentToServer {
    /// Globally unique agent instance id (16 opaque bytes).
    #[prost(bytes = "vec", tag = "1")]
    pub instance_uid: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub sequence_num: u64,
    #[prost(message, optional, tag = "3")]
    pub agent_description: Option<AgentDescription>,
    #[prost(uint64, tag = "4")]
    pub capabilities: u64,
    #[prost(message, optional, tag = "6")]
    pub effective_config: Option<EffectiveConfig>,
    #[prost(message, optional, tag = "7")]
    pub remote_config_status: Option<RemoteConfigStatus>,
    #[prost(message, optional, tag = "9")]
    pub agent_disconnect: Option<AgentDisconnect>,
    #[prost(uint64, tag = "10")]
    pub flags: u64,
}

/// Server → agent response, possibly carrying a config update.
#[derive(Clone, PartialEq, Message)]
pub struct ServerToAgent {
    #[prost(bytes = "vec", tag = "1")]
    pub instance_uid: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub remote_config: Option<AgentRemoteConfig>,
    #[prost(uint64, tag = "6")]
    pub flags: u64,
    #[prost(uint64, tag = "7")]
    pub capabilities: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentDescription {
    #[prost(message, repeated, tag = "1")]
    pub identifying_attributes: Vec<KeyValue>,
    #[prost(message, repeated, tag = "2")]
    pub non_identifying_attributes: Vec<KeyValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EffectiveConfig {
    #[prost(message, optional, tag = "1")]
    pub config_map: Option<AgentConfigMap>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentConfigMap {
    #[prost(map = "string, message", tag = "1")]
    pub config_map: HashMap<String, AgentConfigFile>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentConfigFile {
    #[prost(bytes = "vec", tag = "1")]
    pub body: Vec<u8>,
    #[prost(string, tag = "2")]
    pub content_type: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentRemoteConfig {
    #[prost(message, optional, tag = "1")]
    pub config: Option<AgentConfigMap>,
    #[prost(bytes = "vec", tag = "2")]
    pub config_hash: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoteConfigStatus {
    #[prost(bytes = "vec", tag = "1")]
    pub last_remote_config_hash: Vec<u8>,
    /// `RemoteConfigStatuses` value; see the constants below.
    #[prost(int32, tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// Clean-shutdown marker.
#[derive(Clone, PartialEq, Message)]
pub struct AgentDisconnect {}

/// `RemoteConfigStatuses` values.
pub mod remote_config_statuses {
    pub const UNSET: i32 = 0;
    pub const APPLIED: i32 = 1;
    pub const APPLYING: i32 = 2;
    pub const FAILED: i32 = 3;
}

impl EffectiveConfig {
    /// The agent's config document as text.
    ///
    /// OpAMP allows a multi-file config map; a single-document agent uses
    /// the empty key. Files are concatenated in key order so the result is
    /// deterministic either way.
    pub fn as_text(&self) -> Option<String> {
        let map = self.config_map.as_ref()?;
        if map.config_map.is_empty() {
            return None;
        }
        let mut keys: Vec<&String> = map.config_map.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            out.push_str(&String::from_utf8_lossy(&map.config_map[key].body));
        }
        Some(out)
    }
}

impl AgentRemoteConfig {
    /// Wrap a single YAML document for delivery.
    pub fn single_document(body: &str, hash: &[u8]) -> Self {
        let mut config_map = HashMap::new();
        config_map.insert(
            String::new(),
            AgentConfigFile {
                body: body.as_bytes().to_vec(),
                content_type: "text/yaml".to_owned(),
            },
        );
        Self {
            config: Some(AgentConfigMap { config_map }),
            config_hash: hash.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_to_server_roundtrip() {
        let msg = AgentToServer {
            instance_uid: vec![7; 16],
            sequence_num: 3,
            effective_config: Some(EffectiveConfig {
                config_map: Some(AgentConfigMap {
                    config_map: HashMap::from([(
                        String::new(),
                        AgentConfigFile {
                            body: b"receivers: {}".to_vec(),
                            content_type: "text/yaml".into(),
                        },
                    )]),
                }),
            }),
            ..Default::default()
        };
        let bytes = msg.encode_to_vec();
        let back = AgentToServer::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.effective_config.unwrap().as_text().unwrap(), "receivers: {}");
    }

    #[test]
    fn empty_effective_config_is_none() {
        assert_eq!(EffectiveConfig::default().as_text(), None);
        let empty_map = EffectiveConfig {
            config_map: Some(AgentConfigMap::default()),
        };
        assert_eq!(empty_map.as_text(), None);
    }

    #[test]
    fn multi_file_config_concatenates_in_key_order() {
        let config = EffectiveConfig {
            config_map: Some(AgentConfigMap {
                config_map: HashMap::from([
                    (
                        "b.yaml".to_owned(),
                        AgentConfigFile {
                            body: b"two".to_vec(),
                            content_type: String::new(),
                        },
                    ),
                    (
                        "a.yaml".to_owned(),
                        AgentConfigFile {
                            body: b"one".to_vec(),
                            content_type: String::new(),
                        },
                    ),
                ]),
            }),
        };
        assert_eq!(config.as_text().unwrap(), "onetwo");
    }

    #[test]
    fn single_document_delivery_shape() {
        let remote = AgentRemoteConfig::single_document("exporters: {}", &[0xab; 32]);
        let map = remote.config.unwrap().config_map;
        assert_eq!(map.len(), 1);
        assert_eq!(map[""].body, b"exporters: {}");
        assert_eq!(remote.config_hash, vec![0xab; 32]);
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEA_ADVERTISE_SUBJECT: &str = "dea.advertise";
pub const DEA_SHUTDOWN_SUBJECT: &str = "dea.shutdown";
pub const DEA_DISPATCH_SUBJECT: &str = "dea.resource.dispatch";
pub const DISPATCH_QUEUE_GROUP: &str = "QUEUE_DISPATCH";
pub const APP_DELETED_SUBJECT: &str = "jae.deleted";
pub const STAGING_SUCCESS_SUBJECT: &str = "jae.staging.success";

/// Periodic resource broadcast from one execution node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeaAdvertiseMsg {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub stacks: Vec<String>,
    #[serde(default)]
    pub available_memory: i64,
    #[serde(default)]
    pub available_disk: i64,
    #[serde(default)]
    pub app_id_to_count: HashMap<String, i64>,
    #[serde(default)]
    pub placement_properties: HashMap<String, String>,
    #[serde(default)]
    pub docker_vm: bool,
}

/// Shutdown notice from a node leaving the fleet. `ip`, `version` and
/// `app_id_to_count` arrive on the wire but nothing consumes them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeaShutdownMsg {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub app_id_to_count: HashMap<String, i64>,
}

/// Placement query, carried both over the bus and the HTTP finddea route.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FindDeaRequest {
    #[serde(rename = "appId", default)]
    pub app_id: String,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub disk: i64,
    #[serde(default)]
    pub stacks: String,
    /// Only report the nodes already running this app.
    #[serde(rename = "ownerApp", default)]
    pub owner_app: bool,
    /// Exclude nodes already running this app from the candidate set.
    #[serde(rename = "otherDea", default)]
    pub other_dea: bool,
    #[serde(default)]
    pub docker: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FindDeaReply {
    #[serde(rename = "OwnerDeaIds")]
    pub owner_dea_ids: Vec<String>,
    #[serde(rename = "DeaIds")]
    pub dea_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagingSuccessMsg {
    #[serde(default)]
    pub guid: String,
}

pub fn serialize_message<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("serialize_message")
}

pub fn deserialize_message<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_tolerates_missing_fields() {
        let msg: DeaAdvertiseMsg = deserialize_message(br#"{"id":"dea-1"}"#).unwrap();
        assert_eq!(msg.id, "dea-1");
        assert!(msg.stacks.is_empty());
        assert!(!msg.docker_vm);
    }

    #[test]
    fn find_request_uses_wire_field_names() {
        let req: FindDeaRequest = deserialize_message(
            br#"{"appId":"0001","memory":10,"disk":10,"stacks":"linux","ownerApp":true,"otherDea":false,"docker":false}"#,
        )
        .unwrap();
        assert_eq!(req.app_id, "0001");
        assert!(req.owner_app);
        assert!(!req.other_dea);
    }

    #[test]
    fn reply_serializes_wire_field_names() {
        let reply = FindDeaReply {
            owner_dea_ids: vec!["0000000001".into()],
            dea_id: "0000000003".into(),
        };
        let json = String::from_utf8(serialize_message(&reply)).unwrap();
        assert_eq!(json, r#"{"OwnerDeaIds":["0000000001"],"DeaIds":"0000000003"}"#);
    }
}

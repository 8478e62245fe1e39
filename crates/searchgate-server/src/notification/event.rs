//! Row change events as published by the store trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Marker property set on resources that live on the hub cluster.
pub const HUB_RESOURCE_PROPERTY: &str = "_hubClusterResource";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Insert, Operation::Update, Operation::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("invalid operation: {s}"))
    }
}

/// One row-level change. Lives only for the duration of fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// The document describing the resource: `old_data` for deletes, `new_data` otherwise.
    pub fn data(&self) -> Option<&Map<String, Value>> {
        match self.operation {
            Operation::Delete => self.old_data.as_ref(),
            Operation::Insert | Operation::Update => self.new_data.as_ref(),
        }
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data()?.get(key)?.as_str()
    }

    pub fn kind(&self) -> Option<&str> {
        self.data_str("kind")
    }

    pub fn kind_plural(&self) -> Option<&str> {
        self.data_str("kind_plural")
    }

    /// API group; the core group is the empty string.
    pub fn api_group(&self) -> &str {
        self.data_str("apigroup").unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.data_str("namespace")
    }

    pub fn labels(&self) -> Option<&Map<String, Value>> {
        self.data()?.get("label")?.as_object()
    }

    pub fn is_hub_resource(&self) -> bool {
        self.data()
            .is_some_and(|data| data.contains_key(HUB_RESOURCE_PROPERTY))
    }
}

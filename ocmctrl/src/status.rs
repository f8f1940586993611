use serde::{Deserialize, Serialize};

/// Reason codes the reconciler attaches to a not-ready condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyReason {
    GetResourceFailed,
    CheckVersionFailed,
    GetComponentVersionFailed,
    DeletionFailed,
    ConfigureContextFailed,
}

impl ReadyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyReason::GetResourceFailed => "GetResourceFailed",
            ReadyReason::CheckVersionFailed => "CheckVersionFailed",
            ReadyReason::GetComponentVersionFailed => "GetComponentVersionFailed",
            ReadyReason::DeletionFailed => "DeletionFailed",
            ReadyReason::ConfigureContextFailed => "ConfigureContextFailed",
        }
    }
}

/// A `Ready` status condition in the shape the host controller expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub typ: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

impl Condition {
    pub fn ready() -> Condition {
        Condition {
            typ: "Ready".to_string(),
            status: "True".to_string(),
            reason: None,
            message: String::new(),
        }
    }

    pub fn not_ready(reason: ReadyReason, message: impl Into<String>) -> Condition {
        Condition {
            typ: "Ready".to_string(),
            status: "False".to_string(),
            reason: Some(reason.as_str().to_string()),
            message: message.into(),
        }
    }
}

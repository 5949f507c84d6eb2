use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One signing task from a request body array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// Base64 bytes for the file and data routes, a hex digest for the
    /// hash route.
    pub input: String,
    /// Target signer; the principal's default signer when absent.
    #[serde(rename = "keyid", default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Signer-specific options, merged over the signer's defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// One signed result, in the same position as its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureResponse {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub mode: String,
    pub signer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5u: Option<String>,
}

/// Fresh opaque identifier for a response entry.
pub fn new_reference() -> String {
    Uuid::new_v4().simple().to_string()
}

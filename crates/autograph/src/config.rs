use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Top-level service configuration, loaded from a JSON file at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub signers: Vec<SignerConfig>,
    pub authorizations: Vec<AuthorizationConfig>,
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Maximum allowed deviation between the Hawk timestamp and the
    /// server clock, in seconds.
    pub max_skew_secs: u64,
    /// Nonce cache bound; sustained request rate times the TTL must fit
    /// under this.
    pub nonce_capacity: usize,
    /// Trust X-Forwarded-Host/X-Forwarded-Proto when reconstructing the
    /// canonical request behind a reverse proxy.
    pub trust_forwarded: bool,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            max_skew_secs: 60,
            nonce_capacity: 65_536,
            trust_forwarded: false,
            max_body_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerType {
    ContentSignature,
    ContentSignaturePki,
    GenericRsa,
    Apk2,
}

impl SignerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerType::ContentSignature => "contentsignature",
            SignerType::ContentSignaturePki => "contentsignaturepki",
            SignerType::GenericRsa => "genericrsa",
            SignerType::Apk2 => "apk2",
        }
    }
}

/// One signer instance. Which optional fields are required depends on
/// the type tag; the signer factory enforces that and names the signer
/// in its diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub type_tag: SignerType,
    /// Mode discriminator where a type supports several (genericrsa:
    /// "pss" or "pkcs15").
    #[serde(default)]
    pub mode: Option<String>,
    /// PEM private key (SEC1, PKCS#1 or PKCS#8), or a `pkcs11:` URI for
    /// HSM-resident keys.
    pub private_key: String,
    #[serde(default)]
    pub certificate: Option<String>,
    /// PKI signers: PEM certificate of the issuing intermediate.
    #[serde(default)]
    pub issuer_cert: Option<String>,
    /// PKI signers: PEM certificate of the trust root.
    #[serde(default)]
    pub root_cert: Option<String>,
    /// Optional SHA-256 pin of the root certificate, hex with or
    /// without colon separators.
    #[serde(default)]
    pub root_hash: Option<String>,
    /// `s3://bucket/prefix/` or `file:///absolute/path/`.
    #[serde(default)]
    pub chain_upload_location: Option<String>,
    /// Public base URL under which uploaded chains are reachable;
    /// defaults to the upload location.
    #[serde(default)]
    pub x5u_base: Option<String>,
    #[serde(default)]
    pub validity_days: Option<i64>,
    /// How long before end-entity expiry a renewal becomes due.
    #[serde(default)]
    pub refresh_window_days: Option<i64>,
    /// genericrsa: "sha256", "sha384" or "sha512".
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    pub id: String,
    pub key: String,
    /// Permitted signers, first entry is the default.
    pub signers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub key: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(content).context("failed to parse configuration")?;
        Ok(config)
    }

    /// Fail-fast startup checks; every violation names the offending ID.
    pub fn validate(&self) -> Result<()> {
        let mut signer_ids = HashSet::new();
        for signer in &self.signers {
            if signer.id.is_empty() {
                bail!("signer with empty id in configuration");
            }
            if !signer_ids.insert(signer.id.as_str()) {
                bail!("duplicate signer id {:?}", signer.id);
            }
        }
        if signer_ids.is_empty() {
            bail!("no signers configured");
        }

        let mut principal_ids = HashSet::new();
        for auth in &self.authorizations {
            if auth.id.is_empty() {
                bail!("authorization with empty principal id");
            }
            if !principal_ids.insert(auth.id.as_str()) {
                bail!("duplicate principal id {:?}", auth.id);
            }
            if auth.key.is_empty() {
                bail!("principal {:?} has an empty key", auth.id);
            }
            if auth.signers.is_empty() {
                bail!("principal {:?} has no permitted signers", auth.id);
            }
            for signer in &auth.signers {
                if !signer_ids.contains(signer.as_str()) {
                    bail!(
                        "principal {:?} references unknown signer {:?}",
                        auth.id,
                        signer
                    );
                }
            }
        }

        if let Some(monitoring) = &self.monitoring {
            if monitoring.key.is_empty() {
                bail!("monitoring key is empty");
            }
        }

        Ok(())
    }
}

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;
use std::process::Command;

use crate::config::SignerConfig;
use crate::signing::keys::{self, ParsedKey};
use crate::signing::signer::FileSigner;

const APKSIGNER_JAR: &str = "/usr/bin/apksigner";

/// Signs whole APKs by shelling out to apksigner.
///
/// apksigner wants a PKCS#8 key and rewrites the archive in place, so
/// each invocation works on scratch copies inside a per-call temp
/// directory that is removed on every exit path.
#[derive(Debug)]
pub struct Apk2Signer {
    id: String,
    pkcs8_key: Vec<u8>,
    certificate: String,
    /// ECDSA keys are only supported by Android SDK 18 and later.
    min_sdk_version: &'static str,
}

impl Apk2Signer {
    pub fn new(conf: &SignerConfig) -> Result<Self> {
        let key = keys::parse_private_key(&conf.private_key)?;
        let min_sdk_version = match key {
            ParsedKey::EcdsaP256(_) => {
                tracing::info!(signer = %conf.id, "ecdsa key, minimum android sdk version 18");
                "18"
            }
            ParsedKey::Rsa(_) => "9",
        };
        let pkcs8_key = key
            .to_pkcs8_der()
            .context("failed to marshal signing key for apksigner")?;

        let certificate = conf
            .certificate
            .clone()
            .filter(|cert| !cert.is_empty())
            .context("apk2 requires a public certificate in the signer configuration")?;

        Ok(Self {
            id: conf.id.clone(),
            pkcs8_key,
            certificate,
            min_sdk_version,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn min_sdk_version(&self) -> &str {
        self.min_sdk_version
    }

    /// Options are not implemented for this signer.
    pub fn defaults(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// A valid unsigned archive for the monitoring endpoint.
    pub fn test_file() -> &'static [u8] {
        include_bytes!("../../tests/fixtures/test.apk")
    }
}

fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

impl FileSigner for Apk2Signer {
    fn sign_file(&self, file: &[u8], _options: &serde_json::Value) -> Result<Vec<u8>> {
        let digest = hex::encode(Sha256::digest(file));
        let scratch = tempfile::Builder::new()
            .prefix(&format!("apk2_{}_", self.id))
            .tempdir()
            .context("failed to create scratch directory")?;

        let key_path = scratch.path().join(format!("{digest}.p8"));
        write_with_mode(&key_path, &self.pkcs8_key, 0o400)?;

        let cert_path = scratch.path().join(format!("{digest}.cert"));
        write_with_mode(&cert_path, self.certificate.as_bytes(), 0o400)?;

        let apk_path = scratch.path().join(format!("{digest}.apk"));
        write_with_mode(&apk_path, file, 0o600)?;

        let output = Command::new("java")
            .arg("-jar")
            .arg(APKSIGNER_JAR)
            .arg("sign")
            .arg("--key")
            .arg(&key_path)
            .arg("--cert")
            .arg(&cert_path)
            .arg("--v1-signing-enabled")
            .arg("true")
            .arg("--v2-signing-enabled")
            .arg("true")
            .arg("--min-sdk-version")
            .arg(self.min_sdk_version)
            .arg(&apk_path)
            .output()
            .context("failed to run apksigner")?;
        if !output.status.success() {
            bail!(
                "apksigner exited with {}: {}{}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
        }
        tracing::debug!(signer = %self.id, "apksigner completed");

        let signed = std::fs::read(&apk_path).context("failed to read signed archive")?;
        Ok(signed)
    }
}

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use url::Url;
use x509_parser::pem::Pem;

/// Chain retrieval and verification failures, by the caller-facing
/// category they map to.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain unavailable: {0}")]
    Unavailable(String),
    #[error("chain malformed: {0}")]
    Malformed(String),
    #[error("chain untrusted: {0}")]
    Untrusted(String),
}

/// Publishes `data` under `name` at the configured upload location.
///
/// Failures here are fatal at startup, so this reports through anyhow
/// rather than the retrieval-side error categories.
pub async fn upload(location: &str, name: &str, data: &[u8]) -> Result<()> {
    let target = Url::parse(location).context("failed to parse chain upload location")?;
    match target.scheme() {
        "s3" => upload_to_s3(&target, name, data).await,
        "file" => write_local_file(&target, name, data),
        other => bail!("unsupported upload scheme {other:?}"),
    }
}

async fn upload_to_s3(target: &Url, name: &str, data: &[u8]) -> Result<()> {
    let bucket = target
        .host_str()
        .context("s3 upload location has no bucket")?;
    let key = format!("{}{}", target.path().trim_start_matches('/'), name);
    let object_url = format!("https://{bucket}.s3.amazonaws.com/{key}");

    let response = reqwest::Client::new()
        .put(&object_url)
        .header(reqwest::header::CONTENT_TYPE, "binary/octet-stream")
        .header(reqwest::header::CONTENT_DISPOSITION, "attachment")
        .header("x-amz-acl", "public-read")
        .body(data.to_vec())
        .send()
        .await
        .with_context(|| format!("failed to upload chain to {object_url}"))?;
    response
        .error_for_status()
        .with_context(|| format!("object store rejected upload to {object_url}"))?;
    Ok(())
}

fn write_local_file(target: &Url, name: &str, data: &[u8]) -> Result<()> {
    let dir = Path::new(target.path());
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create upload directory {}", dir.display()))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to set permissions on {}", dir.display()))?;

    let path = dir.join(name);
    std::fs::write(&path, data)
        .with_context(|| format!("failed to write chain to {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Retrieves the chain an X5U points at. The `file` scheme reads the
/// filesystem directly, which also serves as the test transport.
pub async fn fetch_x5u(x5u: &str) -> Result<Vec<u8>, ChainError> {
    let url =
        Url::parse(x5u).map_err(|e| ChainError::Unavailable(format!("invalid x5u {x5u:?}: {e}")))?;
    if url.scheme() == "file" {
        return tokio::fs::read(url.path())
            .await
            .map_err(|e| ChainError::Unavailable(format!("failed to read {x5u}: {e}")));
    }

    let response = reqwest::get(x5u)
        .await
        .map_err(|e| ChainError::Unavailable(format!("failed to retrieve {x5u}: {e}")))?;
    if !response.status().is_success() {
        return Err(ChainError::Unavailable(format!(
            "failed to retrieve {x5u}: {}",
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| ChainError::Unavailable(format!("failed to read {x5u}: {e}")))?;
    Ok(body.to_vec())
}

/// The validated facts a verifier needs from a chain.
#[derive(Debug)]
pub struct VerifiedChain {
    /// Uncompressed SEC1 point of the end-entity public key.
    pub ee_public_key: Vec<u8>,
    /// Lowercase hex SHA-256 of the root certificate DER.
    pub root_fingerprint: String,
}

fn parse_cert<'a>(
    pem: &'a Pem,
    role: &str,
) -> Result<x509_parser::certificate::X509Certificate<'a>, ChainError> {
    pem.parse_x509()
        .map_err(|e| ChainError::Malformed(format!("failed to parse {role} certificate: {e}")))
}

const PEM_END_MARKER: &[u8] = b"-----END CERTIFICATE-----";

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The bytes following the third `END CERTIFICATE` line, or None when
/// fewer than three blocks terminate.
fn bytes_after_third_block(body: &[u8]) -> Option<&[u8]> {
    let mut pos = 0;
    for _ in 0..3 {
        let idx = find_subslice(&body[pos..], PEM_END_MARKER)?;
        pos += idx + PEM_END_MARKER.len();
    }
    Some(&body[pos..])
}

fn normalize_fingerprint(fp: &str) -> String {
    fp.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Parses and verifies a retrieved chain: exactly three certificates,
/// end-entity first, each within its validity window, the end-entity
/// carrying the code-signing extended key usage, every signature
/// chaining up to the self-signed root, and the root matching the pin
/// when one is configured.
pub fn verify_chain(body: &[u8], root_hash: Option<&str>) -> Result<VerifiedChain, ChainError> {
    let pems: Vec<Pem> = Pem::iter_from_buffer(body)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ChainError::Malformed(format!("failed to decode PEM: {e}")))?;
    if pems.len() != 3 {
        return Err(ChainError::Malformed(format!(
            "expected exactly 3 certificates in chain, found {}",
            pems.len()
        )));
    }
    for pem in &pems {
        if pem.label != "CERTIFICATE" {
            return Err(ChainError::Malformed(format!(
                "unexpected PEM block {:?} in chain",
                pem.label
            )));
        }
    }

    // Nothing may follow the root certificate.
    let rest = bytes_after_third_block(body).ok_or_else(|| {
        ChainError::Malformed("chain does not contain three certificate blocks".to_string())
    })?;
    if rest.iter().any(|b| !b.is_ascii_whitespace()) {
        return Err(ChainError::Malformed(
            "trailing data after the root certificate".to_string(),
        ));
    }

    let ee = parse_cert(&pems[0], "end-entity")?;
    let intermediate = parse_cert(&pems[1], "intermediate")?;
    let root = parse_cert(&pems[2], "root")?;

    for (role, cert) in [
        ("end-entity", &ee),
        ("intermediate", &intermediate),
        ("root", &root),
    ] {
        if !cert.validity().is_valid() {
            return Err(ChainError::Untrusted(format!(
                "{role} certificate is expired or not yet valid"
            )));
        }
    }

    match ee.extended_key_usage() {
        Ok(Some(eku)) if eku.value.code_signing => {}
        _ => {
            return Err(ChainError::Untrusted(
                "end-entity lacks the code-signing extended key usage".to_string(),
            ))
        }
    }

    ee.verify_signature(Some(intermediate.public_key()))
        .map_err(|_| {
            ChainError::Untrusted("end-entity is not signed by the intermediate".to_string())
        })?;
    intermediate
        .verify_signature(Some(root.public_key()))
        .map_err(|_| {
            ChainError::Untrusted("intermediate is not signed by the root".to_string())
        })?;
    root.verify_signature(None)
        .map_err(|_| ChainError::Untrusted("root certificate is not self-signed".to_string()))?;

    let root_fingerprint = hex::encode(Sha256::digest(&pems[2].contents));
    if let Some(pin) = root_hash {
        if normalize_fingerprint(pin) != root_fingerprint {
            return Err(ChainError::Untrusted(
                "root certificate does not match the configured root hash".to_string(),
            ));
        }
    }

    Ok(VerifiedChain {
        ee_public_key: ee.public_key().subject_public_key.data.to_vec(),
        root_fingerprint,
    })
}

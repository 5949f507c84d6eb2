use anyhow::{ensure, Context, Result};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use p256::pkcs8::{DecodePrivateKey as _, EncodePublicKey as _};
use parking_lot::RwLock;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::chainstore;
use crate::config::SignerConfig;
use crate::signing::contentsignature::{templated_digest, DIGEST_LEN};
use crate::signing::signer::{DataSigner, HashSigner};

const DEFAULT_VALIDITY_DAYS: i64 = 90;
const DEFAULT_REFRESH_WINDOW_DAYS: i64 = 30;

/// The signing state bound to one end-entity certificate.
///
/// Swapped wholesale on renewal; in-flight signs keep their `Arc` to
/// the state they started with.
#[derive(Debug)]
pub struct EndEntity {
    pub signing_key: SigningKey,
    pub public_key_der: Vec<u8>,
    pub x5u: String,
    pub fingerprint: String,
    pub not_after: OffsetDateTime,
}

/// Content-signature signer whose certificate chain is materialized at
/// startup: a fresh end-entity is issued under the configured
/// intermediate, the full chain is published to the chain store, then
/// fetched back and verified before the signer goes live.
#[derive(Debug)]
pub struct ContentSignaturePkiSigner {
    id: String,
    issuer_key: KeyPair,
    issuer_cert_pem: String,
    root_cert_pem: String,
    root_hash: Option<String>,
    chain_upload_location: String,
    x5u_base: String,
    validity: Duration,
    refresh_window: Duration,
    state: RwLock<Arc<EndEntity>>,
}

impl ContentSignaturePkiSigner {
    pub async fn new(conf: &SignerConfig) -> Result<Self> {
        let issuer_key = KeyPair::from_pem(&conf.private_key)
            .context("failed to parse issuer private key (PKCS#8 PEM expected)")?;
        let issuer_cert_pem = conf
            .issuer_cert
            .clone()
            .context("contentsignaturepki requires issuer_cert")?;
        let root_cert_pem = conf
            .root_cert
            .clone()
            .context("contentsignaturepki requires root_cert")?;
        let chain_upload_location = conf
            .chain_upload_location
            .clone()
            .context("contentsignaturepki requires chain_upload_location")?;
        let x5u_base = conf
            .x5u_base
            .clone()
            .unwrap_or_else(|| chain_upload_location.clone());
        let validity = Duration::days(conf.validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS));
        let refresh_window = Duration::days(
            conf.refresh_window_days
                .unwrap_or(DEFAULT_REFRESH_WINDOW_DAYS),
        );

        let state = materialize(
            &conf.id,
            &issuer_key,
            &issuer_cert_pem,
            &root_cert_pem,
            conf.root_hash.as_deref(),
            &chain_upload_location,
            &x5u_base,
            validity,
        )
        .await?;

        Ok(Self {
            id: conf.id.clone(),
            issuer_key,
            issuer_cert_pem,
            root_cert_pem,
            root_hash: conf.root_hash.clone(),
            chain_upload_location,
            x5u_base,
            validity,
            refresh_window,
            state: RwLock::new(Arc::new(state)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the live end-entity state.
    pub fn current(&self) -> Arc<EndEntity> {
        self.state.read().clone()
    }

    pub fn x5u(&self) -> String {
        self.current().x5u.clone()
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        self.current().public_key_der.clone()
    }

    /// No per-request options are defined for this signer.
    pub fn defaults(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// True once the end-entity is inside its refresh window.
    pub fn needs_renewal(&self) -> bool {
        OffsetDateTime::now_utc() + self.refresh_window >= self.current().not_after
    }

    /// Issues, publishes and verifies a new end-entity, then swaps it
    /// in. Requests signing during the swap finish against the state
    /// they resolved.
    pub async fn rotate(&self) -> Result<()> {
        let fresh = materialize(
            &self.id,
            &self.issuer_key,
            &self.issuer_cert_pem,
            &self.root_cert_pem,
            self.root_hash.as_deref(),
            &self.chain_upload_location,
            &self.x5u_base,
            self.validity,
        )
        .await?;
        let fingerprint = fresh.fingerprint.clone();
        *self.state.write() = Arc::new(fresh);
        tracing::info!(signer = %self.id, %fingerprint, "end-entity certificate rotated");
        Ok(())
    }

    fn sign_prehashed(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let state = self.current();
        let signature: p256::ecdsa::Signature = state
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| anyhow::anyhow!("ecdsa sign_prehash failed: {e}"))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// Issue + upload + fetch-back + verify. Any failure here is fatal to
/// signer construction, and leaves a previously live state untouched
/// during rotation.
#[allow(clippy::too_many_arguments)]
async fn materialize(
    id: &str,
    issuer_key: &KeyPair,
    issuer_cert_pem: &str,
    root_cert_pem: &str,
    root_hash: Option<&str>,
    chain_upload_location: &str,
    x5u_base: &str,
    validity: Duration,
) -> Result<EndEntity> {
    let issuer_params = CertificateParams::from_ca_cert_pem(issuer_cert_pem)
        .context("failed to parse issuer certificate")?;
    // Descriptor for issuance only; the published chain carries the
    // configured issuer PEM verbatim.
    let issuer_cert = issuer_params
        .self_signed(issuer_key)
        .context("failed to reconstruct issuer certificate")?;

    let ee_key = KeyPair::generate().context("failed to generate end-entity key")?;
    let now = OffsetDateTime::now_utc();

    let mut params = CertificateParams::new(Vec::<String>::new())
        .context("failed to initialize end-entity parameters")?;
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{id} signing certificate"));
    params.not_before = now - Duration::minutes(30);
    params.not_after = now + validity;
    params.serial_number = Some(SerialNumber::from(
        uuid::Uuid::new_v4().as_bytes().to_vec(),
    ));
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::CodeSigning);
    let not_after = params.not_after;

    let ee_cert = params
        .signed_by(&ee_key, &issuer_cert, issuer_key)
        .context("failed to issue end-entity certificate")?;

    let fingerprint = hex::encode(Sha256::digest(ee_cert.der()));
    let chain = format!(
        "{}\n{}\n{}\n",
        ee_cert.pem().trim_end(),
        issuer_cert_pem.trim(),
        root_cert_pem.trim(),
    );

    let name = format!("{fingerprint}.pem");
    chainstore::upload(chain_upload_location, &name, chain.as_bytes())
        .await
        .with_context(|| format!("failed to upload chain for signer {id:?}"))?;

    let x5u = format!("{}/{}", x5u_base.trim_end_matches('/'), name);
    let fetched = chainstore::fetch_x5u(&x5u)
        .await
        .with_context(|| format!("failed to fetch back uploaded chain for signer {id:?}"))?;
    let verified = chainstore::verify_chain(&fetched, root_hash)
        .with_context(|| format!("uploaded chain for signer {id:?} does not verify"))?;

    let signing_key = SigningKey::from_pkcs8_der(&ee_key.serialize_der())
        .context("failed to load generated end-entity key")?;
    let verifying_key = signing_key.verifying_key();
    let point = verifying_key.to_encoded_point(false);
    ensure!(
        verified.ee_public_key == point.as_bytes(),
        "published end-entity public key does not match the signing key"
    );
    let public_key_der = verifying_key
        .to_public_key_der()
        .context("failed to encode end-entity public key")?
        .into_vec();

    Ok(EndEntity {
        signing_key,
        public_key_der,
        x5u,
        fingerprint,
        not_after,
    })
}

impl DataSigner for ContentSignaturePkiSigner {
    fn sign_data(&self, data: &[u8], _options: &serde_json::Value) -> Result<Vec<u8>> {
        self.sign_prehashed(&templated_digest(data))
    }
}

impl HashSigner for ContentSignaturePkiSigner {
    fn sign_hash(&self, digest: &[u8], _options: &serde_json::Value) -> Result<Vec<u8>> {
        self.sign_prehashed(digest)
    }

    fn expected_digest_len(&self) -> usize {
        DIGEST_LEN
    }
}

use anyhow::{anyhow, bail, Context, Result};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePublicKey as _;
use sha2::{Digest, Sha256};

use crate::config::SignerConfig;
use crate::signing::keys::{self, ParsedKey};
use crate::signing::signer::{DataSigner, HashSigner};

/// Prefix mixed into every signed payload so content signatures can
/// never be confused with signatures over raw data.
pub const SIGNATURE_PREFIX: &[u8] = b"Content-Signature:\x00";

/// Expected digest size for the hash route (SHA-256 for P-256).
pub const DIGEST_LEN: usize = 32;

/// ECDSA P-256 signer producing detached content signatures.
///
/// Keys are either software (parsed from PEM) or HSM-resident behind
/// the `pkcs11` feature; both produce the same 64-byte r||s signature.
#[derive(Debug)]
pub struct ContentSignatureSigner {
    id: String,
    backend: EcdsaBackend,
    public_key_der: Vec<u8>,
}

#[derive(Debug)]
enum EcdsaBackend {
    Software(SigningKey),
    #[cfg(feature = "pkcs11")]
    Hsm(crate::signing::hsm::HsmKey),
}

impl ContentSignatureSigner {
    pub fn new(conf: &SignerConfig) -> Result<Self> {
        if keys::is_pkcs11_uri(&conf.private_key) {
            #[cfg(feature = "pkcs11")]
            {
                let hsm = crate::signing::hsm::HsmKey::open(&conf.private_key)
                    .context("failed to open pkcs11 key")?;
                let public_key_der = hsm.public_key_der().to_vec();
                return Ok(Self {
                    id: conf.id.clone(),
                    backend: EcdsaBackend::Hsm(hsm),
                    public_key_der,
                });
            }
            #[cfg(not(feature = "pkcs11"))]
            bail!("key is a pkcs11: URI but the service was built without the pkcs11 feature");
        }

        let key = match keys::parse_private_key(&conf.private_key)? {
            ParsedKey::EcdsaP256(key) => key,
            other => bail!(
                "contentsignature requires an ECDSA P-256 key, got {}",
                other.algorithm()
            ),
        };
        let public_key_der = key
            .verifying_key()
            .to_public_key_der()
            .context("failed to encode public key")?
            .into_vec();
        Ok(Self {
            id: conf.id.clone(),
            backend: EcdsaBackend::Software(key),
            public_key_der,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// No per-request options are defined for this signer.
    pub fn defaults(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn sign_prehashed(&self, digest: &[u8]) -> Result<Vec<u8>> {
        match &self.backend {
            EcdsaBackend::Software(key) => {
                let signature: p256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| anyhow!("ecdsa sign_prehash failed: {e}"))?;
                Ok(signature.to_bytes().to_vec())
            }
            #[cfg(feature = "pkcs11")]
            EcdsaBackend::Hsm(key) => key.sign_prehashed(digest),
        }
    }
}

/// SHA-256 over the content-signature template for `data`.
pub fn templated_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(SIGNATURE_PREFIX);
    hasher.update(data);
    hasher.finalize().to_vec()
}

impl DataSigner for ContentSignatureSigner {
    fn sign_data(&self, data: &[u8], _options: &serde_json::Value) -> Result<Vec<u8>> {
        self.sign_prehashed(&templated_digest(data))
    }
}

impl HashSigner for ContentSignatureSigner {
    fn sign_hash(&self, digest: &[u8], _options: &serde_json::Value) -> Result<Vec<u8>> {
        self.sign_prehashed(digest)
    }

    fn expected_digest_len(&self) -> usize {
        DIGEST_LEN
    }
}

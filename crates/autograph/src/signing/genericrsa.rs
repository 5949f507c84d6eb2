use anyhow::{bail, Context, Result};
use rsa::pkcs8::EncodePublicKey as _;
use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey};
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::config::SignerConfig;
use crate::signing::keys::{self, ParsedKey};
use crate::signing::signer::{DataSigner, HashSigner};

/// Per-request options for RSA signing.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Options {
    /// PSS salt length in bytes; the digest length when absent.
    /// Ignored in pkcs15 mode.
    #[serde(default, rename = "saltlength")]
    pub salt_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaMode {
    Pss,
    Pkcs15,
}

impl RsaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsaMode::Pss => "pss",
            RsaMode::Pkcs15 => "pkcs15",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlg {
    pub fn len(&self) -> usize {
        match self {
            DigestAlg::Sha256 => 32,
            DigestAlg::Sha384 => 48,
            DigestAlg::Sha512 => 64,
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlg::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlg::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlg::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// RSA signer over pre-hashed digests, PSS or PKCS#1 v1.5.
#[derive(Debug)]
pub struct GenericRsaSigner {
    id: String,
    key: Box<RsaPrivateKey>,
    mode: RsaMode,
    digest: DigestAlg,
    public_key_der: Vec<u8>,
}

impl GenericRsaSigner {
    pub fn new(conf: &SignerConfig) -> Result<Self> {
        let key = match keys::parse_private_key(&conf.private_key)? {
            ParsedKey::Rsa(key) => key,
            other => bail!("genericrsa requires an RSA key, got {}", other.algorithm()),
        };

        let mode = match conf.mode.as_deref() {
            None | Some("pss") => RsaMode::Pss,
            Some("pkcs15") => RsaMode::Pkcs15,
            Some(other) => bail!("unknown genericrsa mode {other:?}, expected pss or pkcs15"),
        };
        let digest = match conf.digest.as_deref() {
            None | Some("sha256") => DigestAlg::Sha256,
            Some("sha384") => DigestAlg::Sha384,
            Some("sha512") => DigestAlg::Sha512,
            Some(other) => bail!("unknown genericrsa digest {other:?}"),
        };

        let public_key_der = key
            .to_public_key()
            .to_public_key_der()
            .context("failed to encode RSA public key")?
            .into_vec();

        Ok(Self {
            id: conf.id.clone(),
            key,
            mode,
            digest,
            public_key_der,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> RsaMode {
        self.mode
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Option defaults advertised to the dispatch layer.
    pub fn defaults(&self) -> serde_json::Value {
        serde_json::json!({ "saltlength": self.digest.len() })
    }

    fn salt_length(&self, options: &serde_json::Value) -> Result<usize> {
        let parsed = match options {
            serde_json::Value::Null => Options::default(),
            value => serde_json::from_value::<Options>(value.clone())
                .context("invalid genericrsa options")?,
        };
        Ok(parsed.salt_length.unwrap_or_else(|| self.digest.len()))
    }

    fn sign_digest(&self, digest: &[u8], options: &serde_json::Value) -> Result<Vec<u8>> {
        let salt_length = self.salt_length(options)?;
        let signature = match (self.mode, self.digest) {
            (RsaMode::Pkcs15, DigestAlg::Sha256) => {
                self.key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            }
            (RsaMode::Pkcs15, DigestAlg::Sha384) => {
                self.key.sign(Pkcs1v15Sign::new::<Sha384>(), digest)
            }
            (RsaMode::Pkcs15, DigestAlg::Sha512) => {
                self.key.sign(Pkcs1v15Sign::new::<Sha512>(), digest)
            }
            (RsaMode::Pss, DigestAlg::Sha256) => self.key.sign_with_rng(
                &mut rand::thread_rng(),
                Pss::new_with_salt::<Sha256>(salt_length),
                digest,
            ),
            (RsaMode::Pss, DigestAlg::Sha384) => self.key.sign_with_rng(
                &mut rand::thread_rng(),
                Pss::new_with_salt::<Sha384>(salt_length),
                digest,
            ),
            (RsaMode::Pss, DigestAlg::Sha512) => self.key.sign_with_rng(
                &mut rand::thread_rng(),
                Pss::new_with_salt::<Sha512>(salt_length),
                digest,
            ),
        };
        signature.context("rsa signing failed")
    }
}

impl DataSigner for GenericRsaSigner {
    fn sign_data(&self, data: &[u8], options: &serde_json::Value) -> Result<Vec<u8>> {
        self.sign_digest(&self.digest.hash(data), options)
    }
}

impl HashSigner for GenericRsaSigner {
    fn sign_hash(&self, digest: &[u8], options: &serde_json::Value) -> Result<Vec<u8>> {
        self.sign_digest(digest, options)
    }

    fn expected_digest_len(&self) -> usize {
        self.digest.len()
    }
}

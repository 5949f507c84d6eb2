use anyhow::{Context as _, Result};
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine as _;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{SignerConfig, SignerType};
use crate::signing::apk2::Apk2Signer;
use crate::signing::contentsignature::ContentSignatureSigner;
use crate::signing::contentsignaturepki::ContentSignaturePkiSigner;
use crate::signing::genericrsa::GenericRsaSigner;

/// Fixed input every data/hash signer signs for `/__monitor__`.
pub const MONITORING_INPUT: &[u8] = b"AUTOGRAPH MONITORING";

/// A signer's public identity, echoed in responses.
#[derive(Debug, Clone, Serialize)]
pub struct Configuration {
    pub id: String,
    #[serde(rename = "type")]
    pub type_tag: &'static str,
    pub mode: String,
}

/// Signs whole containers, returning a rewritten file.
///
/// Implementations are sync; signing is CPU-bound or shells out, and
/// callers dispatch through `spawn_blocking`. The `options` value is
/// the task's options merged over the signer's defaults.
pub trait FileSigner: Send + Sync {
    fn sign_file(&self, file: &[u8], options: &serde_json::Value) -> Result<Vec<u8>>;
}

/// Signs raw bytes; the signer decides how to digest them. `options`
/// as in [`FileSigner`].
pub trait DataSigner: Send + Sync {
    fn sign_data(&self, data: &[u8], options: &serde_json::Value) -> Result<Vec<u8>>;
}

/// Signs an already-computed digest. `options` as in [`FileSigner`].
pub trait HashSigner: Send + Sync {
    fn sign_hash(&self, digest: &[u8], options: &serde_json::Value) -> Result<Vec<u8>>;
    /// Inputs must be exactly this long; the dispatch layer rejects
    /// anything else before the signer sees it.
    fn expected_digest_len(&self) -> usize;
}

/// The registered signer set, one variant per signer type.
///
/// Dispatch probes capabilities structurally through the `as_*`
/// accessors; a `None` becomes a typed capability error at the handler,
/// never a stub invocation.
#[derive(Debug)]
pub enum AnySigner {
    ContentSignature(ContentSignatureSigner),
    ContentSignaturePki(ContentSignaturePkiSigner),
    GenericRsa(GenericRsaSigner),
    Apk2(Apk2Signer),
}

impl AnySigner {
    pub fn id(&self) -> &str {
        match self {
            AnySigner::ContentSignature(s) => s.id(),
            AnySigner::ContentSignaturePki(s) => s.id(),
            AnySigner::GenericRsa(s) => s.id(),
            AnySigner::Apk2(s) => s.id(),
        }
    }

    pub fn type_tag(&self) -> SignerType {
        match self {
            AnySigner::ContentSignature(_) => SignerType::ContentSignature,
            AnySigner::ContentSignaturePki(_) => SignerType::ContentSignaturePki,
            AnySigner::GenericRsa(_) => SignerType::GenericRsa,
            AnySigner::Apk2(_) => SignerType::Apk2,
        }
    }

    pub fn config(&self) -> Configuration {
        let mode = match self {
            AnySigner::ContentSignature(_) | AnySigner::ContentSignaturePki(_) => {
                "p256ecdsa".to_string()
            }
            AnySigner::GenericRsa(s) => s.mode().as_str().to_string(),
            AnySigner::Apk2(_) => "v1v2".to_string(),
        };
        Configuration {
            id: self.id().to_string(),
            type_tag: self.type_tag().as_str(),
            mode,
        }
    }

    /// The signer's option defaults; the dispatch layer overlays each
    /// task's options on top before invoking a capability.
    pub fn defaults(&self) -> serde_json::Value {
        match self {
            AnySigner::ContentSignature(s) => s.defaults(),
            AnySigner::ContentSignaturePki(s) => s.defaults(),
            AnySigner::GenericRsa(s) => s.defaults(),
            AnySigner::Apk2(s) => s.defaults(),
        }
    }

    pub fn as_file_signer(&self) -> Option<&dyn FileSigner> {
        match self {
            AnySigner::Apk2(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data_signer(&self) -> Option<&dyn DataSigner> {
        match self {
            AnySigner::ContentSignature(s) => Some(s),
            AnySigner::ContentSignaturePki(s) => Some(s),
            AnySigner::GenericRsa(s) => Some(s),
            AnySigner::Apk2(_) => None,
        }
    }

    pub fn as_hash_signer(&self) -> Option<&dyn HashSigner> {
        match self {
            AnySigner::ContentSignature(s) => Some(s),
            AnySigner::ContentSignaturePki(s) => Some(s),
            AnySigner::GenericRsa(s) => Some(s),
            AnySigner::Apk2(_) => None,
        }
    }

    /// Base64 DER SubjectPublicKeyInfo, for signers that publish one.
    pub fn public_key(&self) -> Option<String> {
        match self {
            AnySigner::ContentSignature(s) => Some(B64.encode(s.public_key_der())),
            AnySigner::ContentSignaturePki(s) => Some(B64.encode(s.public_key_der())),
            AnySigner::GenericRsa(s) => Some(B64.encode(s.public_key_der())),
            AnySigner::Apk2(_) => None,
        }
    }

    pub fn x5u(&self) -> Option<String> {
        match self {
            AnySigner::ContentSignaturePki(s) => Some(s.x5u()),
            _ => None,
        }
    }

    /// Wire encoding of a detached signature. Content signatures travel
    /// as unpadded URL-safe base64, everything else as standard base64.
    pub fn encode_signature(&self, signature: &[u8]) -> String {
        match self {
            AnySigner::ContentSignature(_) | AnySigner::ContentSignaturePki(_) => {
                B64_URL.encode(signature)
            }
            _ => B64.encode(signature),
        }
    }

    /// Input the monitoring endpoint signs with this signer.
    pub fn monitoring_input(&self) -> &'static [u8] {
        match self {
            AnySigner::Apk2(_) => Apk2Signer::test_file(),
            _ => MONITORING_INPUT,
        }
    }
}

/// Builds one signer from its validated configuration record.
pub async fn build_signer(conf: &SignerConfig) -> Result<AnySigner> {
    let signer = match conf.type_tag {
        SignerType::ContentSignature => {
            AnySigner::ContentSignature(ContentSignatureSigner::new(conf)?)
        }
        SignerType::ContentSignaturePki => {
            AnySigner::ContentSignaturePki(ContentSignaturePkiSigner::new(conf).await?)
        }
        SignerType::GenericRsa => AnySigner::GenericRsa(GenericRsaSigner::new(conf)?),
        SignerType::Apk2 => AnySigner::Apk2(Apk2Signer::new(conf)?),
    };
    Ok(signer)
}

/// Builds the process-wide registry. Any misconfigured signer aborts
/// startup with a diagnostic naming it.
pub async fn build_registry(
    configs: &[SignerConfig],
) -> Result<HashMap<String, Arc<AnySigner>>> {
    let mut registry = HashMap::with_capacity(configs.len());
    for conf in configs {
        let signer = build_signer(conf)
            .await
            .with_context(|| format!("failed to initialize signer {:?}", conf.id))?;
        tracing::info!(
            signer = %conf.id,
            signer_type = conf.type_tag.as_str(),
            "signer initialized"
        );
        registry.insert(conf.id.clone(), Arc::new(signer));
    }
    Ok(registry)
}

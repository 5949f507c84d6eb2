use anyhow::{anyhow, bail, Context as _, Result};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use p256::pkcs8::EncodePublicKey as _;
use parking_lot::Mutex;

/// Parsed `pkcs11:` key reference.
///
/// `pkcs11:token=<label>;object=<label>?module-path=<path>&pin-value=<pin>`
#[derive(Debug, Clone)]
pub struct Pkcs11Uri {
    pub token_label: String,
    pub object_label: String,
    pub module_path: String,
    pub pin: String,
}

pub fn parse_uri(uri: &str) -> Result<Pkcs11Uri> {
    let rest = uri
        .trim()
        .strip_prefix("pkcs11:")
        .ok_or_else(|| anyhow!("not a pkcs11: URI"))?;
    let (path_part, query_part) = rest.split_once('?').unwrap_or((rest, ""));

    let mut token_label = None;
    let mut object_label = None;
    for attr in path_part.split(';').filter(|a| !a.is_empty()) {
        match attr.split_once('=') {
            Some(("token", v)) => token_label = Some(v.to_string()),
            Some(("object", v)) => object_label = Some(v.to_string()),
            _ => {}
        }
    }

    let mut module_path = None;
    let mut pin = None;
    for attr in query_part.split('&').filter(|a| !a.is_empty()) {
        match attr.split_once('=') {
            Some(("module-path", v)) => module_path = Some(v.to_string()),
            Some(("pin-value", v)) => pin = Some(v.to_string()),
            _ => {}
        }
    }

    Ok(Pkcs11Uri {
        token_label: token_label.ok_or_else(|| anyhow!("pkcs11 URI is missing token="))?,
        object_label: object_label.ok_or_else(|| anyhow!("pkcs11 URI is missing object="))?,
        module_path: module_path
            .ok_or_else(|| anyhow!("pkcs11 URI is missing module-path="))?,
        pin: pin.ok_or_else(|| anyhow!("pkcs11 URI is missing pin-value="))?,
    })
}

/// A P-256 key resident in a PKCS#11 token.
///
/// Sessions are not thread-safe, so all signing goes through one
/// mutex-guarded session per signer. A failed sign gets one session
/// reopen before the error surfaces to the request.
pub struct HsmKey {
    ctx: Pkcs11,
    slot: Slot,
    uri: Pkcs11Uri,
    session: Mutex<SessionState>,
    public_key_der: Vec<u8>,
}

struct SessionState {
    session: Session,
    key: ObjectHandle,
}

impl HsmKey {
    pub fn open(uri: &str) -> Result<Self> {
        let uri = parse_uri(uri)?;
        let ctx = Pkcs11::new(&uri.module_path)
            .with_context(|| format!("failed to load pkcs11 module {}", uri.module_path))?;
        match ctx.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(Pkcs11Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(e) => return Err(anyhow::Error::new(e)).context("pkcs11 initialize failed"),
        }

        let slot = find_slot(&ctx, &uri.token_label)?;
        let state = open_session(&ctx, slot, &uri)?;
        let public_key_der = load_public_key_der(&state.session, &uri.object_label)?;

        Ok(Self {
            ctx,
            slot,
            uri,
            session: Mutex::new(state),
            public_key_der,
        })
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// CKM_ECDSA over a pre-computed digest; raw r||s out, same shape
    /// as the software backend.
    pub fn sign_prehashed(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.session.lock();
        match state.session.sign(&Mechanism::Ecdsa, state.key, digest) {
            Ok(signature) => Ok(signature),
            Err(first_err) => {
                // One reopen attempt; sessions die when the token resets.
                tracing::warn!(error = %first_err, "pkcs11 sign failed, reopening session");
                *state = open_session(&self.ctx, self.slot, &self.uri)?;
                state
                    .session
                    .sign(&Mechanism::Ecdsa, state.key, digest)
                    .context("pkcs11 sign failed after session reopen")
            }
        }
    }
}

fn find_slot(ctx: &Pkcs11, token_label: &str) -> Result<Slot> {
    for slot in ctx.get_slots_with_token().context("failed to list slots")? {
        if let Ok(info) = ctx.get_token_info(slot) {
            if info.label() == token_label {
                return Ok(slot);
            }
        }
    }
    bail!("no pkcs11 slot with token label {token_label:?}");
}

fn open_session(ctx: &Pkcs11, slot: Slot, uri: &Pkcs11Uri) -> Result<SessionState> {
    let session = ctx
        .open_rw_session(slot)
        .context("failed to open pkcs11 session")?;
    session
        .login(UserType::User, Some(&AuthPin::new(uri.pin.clone().into())))
        .context("pkcs11 login failed")?;
    let key = session
        .find_objects(&[
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Label(uri.object_label.as_bytes().to_vec()),
        ])
        .context("failed to search for private key")?
        .pop()
        .ok_or_else(|| anyhow!("pkcs11 private key {:?} not found", uri.object_label))?;
    Ok(SessionState { session, key })
}

fn load_public_key_der(session: &Session, object_label: &str) -> Result<Vec<u8>> {
    let public = session
        .find_objects(&[
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Label(object_label.as_bytes().to_vec()),
        ])
        .context("failed to search for public key")?
        .pop()
        .ok_or_else(|| anyhow!("pkcs11 public key {object_label:?} not found"))?;

    let attr = session
        .get_attributes(public, &[AttributeType::EcPoint])
        .context("failed to read EC_POINT")?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("missing EC_POINT attribute"))?;
    let raw = match attr {
        Attribute::EcPoint(v) => v,
        _ => bail!("unexpected EC_POINT attribute type"),
    };

    let point_bytes = decode_ec_point(&raw)?;
    let point = p256::EncodedPoint::from_bytes(&point_bytes)
        .map_err(|e| anyhow!("invalid EC point from token: {e}"))?;
    let verifying_key = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
        .map_err(|e| anyhow!("invalid public key from token: {e}"))?;
    Ok(verifying_key
        .to_public_key_der()
        .context("failed to encode public key")?
        .into_vec())
}

/// Tokens usually return CKA_EC_POINT as a DER OCTET STRING wrapping
/// the uncompressed point.
fn decode_ec_point(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() == 65 && bytes.first() == Some(&0x04) {
        return Ok(bytes.to_vec());
    }
    if bytes.len() >= 3 && bytes[0] == 0x04 {
        let (len, off) = if bytes[1] & 0x80 == 0 {
            (bytes[1] as usize, 2usize)
        } else if bytes[1] == 0x81 {
            (bytes[2] as usize, 3usize)
        } else {
            bail!("unsupported DER length form in EC_POINT");
        };
        let end = off + len;
        if end <= bytes.len() {
            let inner = &bytes[off..end];
            if inner.len() == 65 && inner.first() == Some(&0x04) {
                return Ok(inner.to_vec());
            }
        }
    }
    bail!("unsupported EC_POINT encoding ({} bytes)", bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = parse_uri(
            "pkcs11:token=dev;object=appkey?module-path=/usr/lib/softhsm/libsofthsm2.so&pin-value=1234",
        )
        .unwrap();
        assert_eq!(uri.token_label, "dev");
        assert_eq!(uri.object_label, "appkey");
        assert_eq!(uri.module_path, "/usr/lib/softhsm/libsofthsm2.so");
        assert_eq!(uri.pin, "1234");
    }

    #[test]
    fn missing_module_path_is_rejected() {
        let err = parse_uri("pkcs11:token=dev;object=appkey?pin-value=1234")
            .unwrap_err()
            .to_string();
        assert!(err.contains("module-path"), "{err}");
    }

    #[test]
    fn unwraps_octet_string_ec_point() {
        let mut wrapped = vec![0x04, 65];
        let mut point = vec![0x04];
        point.extend_from_slice(&[0xAA; 64]);
        wrapped.extend_from_slice(&point);
        assert_eq!(decode_ec_point(&wrapped).unwrap(), point);
        assert_eq!(decode_ec_point(&point).unwrap(), point);
    }
}

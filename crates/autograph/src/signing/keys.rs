use anyhow::{bail, Context, Result};
use p256::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use rsa::pkcs1::DecodeRsaPrivateKey as _;

/// Private-key material after parsing, tagged by algorithm family.
///
/// Signer constructors match on this to enforce their key-type
/// requirements (content-signature rejects RSA, and so on).
pub enum ParsedKey {
    EcdsaP256(p256::ecdsa::SigningKey),
    Rsa(Box<rsa::RsaPrivateKey>),
}

impl ParsedKey {
    pub fn algorithm(&self) -> &'static str {
        match self {
            ParsedKey::EcdsaP256(_) => "ecdsa-p256",
            ParsedKey::Rsa(_) => "rsa",
        }
    }

    /// PKCS#8 DER encoding, for signers that hand the key to an
    /// external tool.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let doc = match self {
            ParsedKey::EcdsaP256(key) => key
                .to_pkcs8_der()
                .context("failed to encode EC key as PKCS#8")?,
            ParsedKey::Rsa(key) => key
                .to_pkcs8_der()
                .context("failed to encode RSA key as PKCS#8")?,
        };
        Ok(doc.as_bytes().to_vec())
    }
}

/// Is this key material an HSM reference rather than inline PEM?
pub fn is_pkcs11_uri(material: &str) -> bool {
    material.trim_start().starts_with("pkcs11:")
}

/// Parses inline PEM private-key material: SEC1 (`EC PRIVATE KEY`),
/// PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`).
pub fn parse_private_key(material: &str) -> Result<ParsedKey> {
    let material = material.trim();
    if is_pkcs11_uri(material) {
        bail!("pkcs11 key references are only valid for HSM-capable signers");
    }

    if material.contains("BEGIN EC PRIVATE KEY") {
        let secret =
            p256::SecretKey::from_sec1_pem(material).context("failed to parse EC private key")?;
        return Ok(ParsedKey::EcdsaP256(p256::ecdsa::SigningKey::from(&secret)));
    }
    if material.contains("BEGIN RSA PRIVATE KEY") {
        let key = rsa::RsaPrivateKey::from_pkcs1_pem(material)
            .context("failed to parse RSA private key")?;
        return Ok(ParsedKey::Rsa(Box::new(key)));
    }
    if material.contains("BEGIN PRIVATE KEY") {
        if let Ok(secret) = p256::SecretKey::from_pkcs8_pem(material) {
            return Ok(ParsedKey::EcdsaP256(p256::ecdsa::SigningKey::from(&secret)));
        }
        let key = rsa::RsaPrivateKey::from_pkcs8_pem(material)
            .context("failed to parse PKCS#8 private key as EC or RSA")?;
        return Ok(ParsedKey::Rsa(Box::new(key)));
    }

    bail!("unrecognized private key material, expected a PEM block or a pkcs11: URI");
}

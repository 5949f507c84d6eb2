mod apk2;
mod contentsignature;
mod contentsignaturepki;
mod genericrsa;
#[cfg(feature = "pkcs11")]
mod hsm;
mod keys;
mod signer;

pub use apk2::Apk2Signer;
pub use contentsignature::{templated_digest, ContentSignatureSigner, SIGNATURE_PREFIX};
pub use contentsignaturepki::ContentSignaturePkiSigner;
pub use genericrsa::{GenericRsaSigner, Options as GenericRsaOptions};
pub use signer::{
    build_registry, build_signer, AnySigner, Configuration, DataSigner, FileSigner, HashSigner,
    MONITORING_INPUT,
};

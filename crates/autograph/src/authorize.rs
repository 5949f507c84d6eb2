use std::collections::HashMap;

use crate::hawk::AuthError;

/// An authenticated caller: Hawk credential id plus shared secret.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub key: String,
}

/// Read-only principal → permitted-signers matrix, built at startup.
///
/// The first signer in a principal's list is its default. Referential
/// integrity against the signer registry is checked by config
/// validation before this is constructed.
pub struct Authorizations {
    map: HashMap<String, Vec<String>>,
}

impl Authorizations {
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self {
            map: entries.into_iter().collect(),
        }
    }

    pub fn permitted(&self, principal: &str, signer: &str) -> bool {
        self.map
            .get(principal)
            .is_some_and(|signers| signers.iter().any(|s| s == signer))
    }

    pub fn default_signer(&self, principal: &str) -> Option<&str> {
        self.map
            .get(principal)
            .and_then(|signers| signers.first())
            .map(String::as_str)
    }

    /// Resolves the signer a task addresses: a named signer must be in
    /// the principal's permitted set, no name means the default.
    pub fn resolve<'a>(
        &'a self,
        principal: &str,
        requested: Option<&'a str>,
    ) -> Result<&'a str, AuthError> {
        match requested {
            Some(signer) => {
                if self.permitted(principal, signer) {
                    Ok(signer)
                } else {
                    Err(AuthError::ForbiddenSigner(signer.to_string()))
                }
            }
            None => self
                .default_signer(principal)
                .ok_or_else(|| AuthError::ForbiddenSigner("<default>".to_string())),
        }
    }
}

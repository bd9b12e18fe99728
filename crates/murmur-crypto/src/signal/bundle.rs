//! Pre-key bundles and their publication.
//!
//! A bundle is what a peer fetches from the registration directory to start a
//! session while we are offline.

use serde::{Deserialize, Serialize};

use crate::identity::IdentityKeyPair;
use crate::signal::keystore::KeyStore;
use crate::CryptoError;

/// Public half of a signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    #[serde(with = "crate::serde_hex::key32")]
    pub public_key: [u8; 32],
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(with = "crate::serde_hex::key32")]
    pub public_key: [u8; 32],
}

/// The public keys a peer needs to initiate a session with us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Ed25519 identity public key.
    #[serde(with = "crate::serde_hex::key32")]
    pub identity_key: [u8; 32],
    pub registration_id: u32,
    pub signed_prekey: SignedPreKeyPublic,
    /// Optional one-time prekey (consumed on first use).
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Check the signed prekey signature against the identity key.
    ///
    /// Must succeed before any key in the bundle is used.
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(
            &self.identity_key,
            &self.signed_prekey.public_key,
            &self.signed_prekey.signature,
        )
    }

    pub fn with_one_time_prekey(mut self, one_time_prekey: Option<OneTimePreKeyPublic>) -> Self {
        self.one_time_prekey = one_time_prekey;
        self
    }
}

/// Everything a registration directory stores for a new user: the bundle
/// (without a one-time prekey) and the pool of one-time prekeys it hands out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationUpload {
    pub bundle: PreKeyBundle,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

/// Builds public bundles from the current key store contents.
pub struct BundlePublisher<'a> {
    key_store: &'a KeyStore,
}

impl<'a> BundlePublisher<'a> {
    pub fn new(key_store: &'a KeyStore) -> Self {
        Self { key_store }
    }

    /// Snapshot a bundle, including at most one one-time prekey.
    ///
    /// The included prekey is issued right away so no other bundle carries
    /// it. An empty pool is not an error: the bundle is returned without one.
    pub fn publish(&self) -> Result<PreKeyBundle, CryptoError> {
        let base = self.base_bundle()?;
        let one_time_prekey = match self.key_store.issue_one_time_prekey() {
            Ok(public) => Some(public),
            Err(CryptoError::KeyExhausted) => {
                tracing::warn!("publishing bundle without a one-time prekey: pool exhausted");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(base.with_one_time_prekey(one_time_prekey))
    }

    /// Bundle plus up to `max_one_time_prekeys` issued one-time prekeys, for
    /// upload to a registration directory.
    pub fn registration_upload(
        &self,
        max_one_time_prekeys: u32,
    ) -> Result<RegistrationUpload, CryptoError> {
        let bundle = self.base_bundle()?;
        let one_time_prekeys = self.issue_one_time_prekeys(max_one_time_prekeys)?;
        tracing::debug!(
            registration_id = bundle.registration_id,
            one_time_prekeys = one_time_prekeys.len(),
            "prepared registration upload"
        );
        Ok(RegistrationUpload {
            bundle,
            one_time_prekeys,
        })
    }

    /// Issue up to `max` one-time prekeys for upload; fewer when the pool
    /// runs out.
    pub fn issue_one_time_prekeys(&self, max: u32) -> Result<Vec<OneTimePreKeyPublic>, CryptoError> {
        let mut issued = Vec::new();
        for _ in 0..max {
            match self.key_store.issue_one_time_prekey() {
                Ok(public) => issued.push(public),
                Err(CryptoError::KeyExhausted) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(issued)
    }

    fn base_bundle(&self) -> Result<PreKeyBundle, CryptoError> {
        let identity = self.key_store.load_identity()?;
        let registration_id = self.key_store.registration_id()?;
        let signed_prekey = self.key_store.current_signed_prekey()?;
        Ok(PreKeyBundle {
            identity_key: identity.public_key_bytes(),
            registration_id,
            signed_prekey: signed_prekey.public(),
            one_time_prekey: None,
        })
    }
}

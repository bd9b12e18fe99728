//! Identity pinning (Trust On First Use) with a pluggable decision policy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::signal::keystore::KeyStore;
use crate::CryptoError;

/// Outcome of checking a peer identity key against the pinned one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Matches the pinned key.
    Trusted,
    /// No key pinned yet; the caller must record it.
    FirstUse,
    /// Differs from the pinned key.
    Changed { previous: [u8; 32] },
}

/// How a [`TrustDecision::Changed`] is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStrictness {
    /// Proceed, re-pin, and surface the change for human verification.
    #[default]
    Advisory,
    /// Refuse the session with `UntrustedIdentity`.
    Strict,
}

/// Receives identity changes that need a user-facing trust decision.
pub trait IdentityChangeListener: Send + Sync {
    fn identity_changed(&self, peer: &str, previous: &[u8; 32], current: &[u8; 32]);
}

/// Decides whether a peer identity may be used for a session.
pub trait IdentityTrustPolicy: Send + Sync {
    fn evaluate(&self, peer: &str, identity_key: &[u8; 32], pinned: Option<&[u8; 32]>) -> TrustDecision {
        let _ = peer;
        match pinned {
            None => TrustDecision::FirstUse,
            Some(pinned) if pinned == identity_key => TrustDecision::Trusted,
            Some(pinned) => TrustDecision::Changed { previous: *pinned },
        }
    }

    /// Whether a session may proceed under `decision`.
    fn permits(&self, peer: &str, identity_key: &[u8; 32], decision: &TrustDecision) -> bool;
}

/// Default policy: trust on first use, changes handled per strictness.
pub struct TrustOnFirstUse {
    strictness: TrustStrictness,
    listener: Option<Arc<dyn IdentityChangeListener>>,
}

impl TrustOnFirstUse {
    pub fn new(strictness: TrustStrictness) -> Self {
        Self {
            strictness,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn IdentityChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl Default for TrustOnFirstUse {
    fn default() -> Self {
        Self::new(TrustStrictness::default())
    }
}

impl IdentityTrustPolicy for TrustOnFirstUse {
    fn permits(&self, peer: &str, identity_key: &[u8; 32], decision: &TrustDecision) -> bool {
        let TrustDecision::Changed { previous } = decision else {
            return true;
        };
        tracing::warn!(
            peer,
            previous = hex::encode(previous),
            current = hex::encode(identity_key),
            strictness = ?self.strictness,
            "peer identity key changed"
        );
        if let Some(listener) = &self.listener {
            listener.identity_changed(peer, previous, identity_key);
        }
        self.strictness == TrustStrictness::Advisory
    }
}

/// Evaluate `identity_key` for `peer` and enforce the policy.
///
/// Nothing is recorded here; call [`pin_identity`] once the session that
/// depends on the decision has been persisted.
pub fn check_identity(
    policy: &dyn IdentityTrustPolicy,
    key_store: &KeyStore,
    peer: &str,
    identity_key: &[u8; 32],
) -> Result<TrustDecision, CryptoError> {
    let pinned = key_store.trusted_identity(peer)?;
    let decision = policy.evaluate(peer, identity_key, pinned.as_ref());
    if !policy.permits(peer, identity_key, &decision) {
        return Err(CryptoError::UntrustedIdentity {
            peer: peer.to_string(),
        });
    }
    Ok(decision)
}

/// Record the identity after an accepted [`TrustDecision`].
pub fn pin_identity(
    key_store: &KeyStore,
    peer: &str,
    identity_key: &[u8; 32],
    decision: &TrustDecision,
) -> Result<(), CryptoError> {
    match decision {
        TrustDecision::Trusted => Ok(()),
        TrustDecision::FirstUse | TrustDecision::Changed { .. } => {
            key_store.pin_identity(peer, identity_key)
        }
    }
}

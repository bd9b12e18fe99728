use serde::{Deserialize, Serialize};

use crate::signal::trust::TrustStrictness;

/// Tunables for session establishment and the ratchet.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest counter gap a single message may open within one chain.
    pub max_skip: u32,
    /// Upper bound on cached skipped message keys; oldest are evicted first.
    pub max_skipped_keys: usize,
    /// Receiving chains kept per session after DH ratchet steps.
    pub max_receiving_chains: usize,
    /// One-time prekeys generated per registration or replenish call.
    pub one_time_prekey_batch: u32,
    /// How a changed peer identity key is handled.
    pub trust: TrustStrictness,
    /// Device id used in session addresses. Single-device only.
    pub device_id: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
            max_receiving_chains: 5,
            one_time_prekey_batch: 100,
            trust: TrustStrictness::default(),
            device_id: 0,
        }
    }
}

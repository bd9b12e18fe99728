use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::signal::prekeys::KeyPair;
use crate::CryptoError;

/// Format tag prepended to serialized sessions.
const SESSION_FORMAT_VERSION: u8 = 2;

/// Handshakes remembered from sessions this one replaced.
const MAX_SUPERSEDED_BASE_KEYS: usize = 40;

/// One symmetric chain: its current key and the index of the next message.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainState {
    pub(crate) chain_key: [u8; 32],
    pub(crate) counter: u32,
}

impl ChainState {
    pub(crate) fn new(chain_key: [u8; 32]) -> Self {
        Self {
            chain_key,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ReceivingChain {
    pub(crate) ratchet_key: [u8; 32],
    pub(crate) chain: ChainState,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SkippedMessageKey {
    pub(crate) ratchet_key: [u8; 32],
    pub(crate) counter: u32,
    pub(crate) message_key: [u8; 32],
}

/// Handshake material the initiator repeats until the responder answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingPreKey {
    pub(crate) signed_prekey_id: u32,
    pub(crate) one_time_prekey_id: Option<u32>,
}

/// Double Ratchet state for one peer session.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub(crate) root_key: [u8; 32],
    /// Our current DH ratchet key pair.
    pub(crate) local_ratchet: KeyPair,
    /// Their current DH ratchet public key.
    pub(crate) remote_ratchet: Option<[u8; 32]>,
    pub(crate) sending_chain: ChainState,
    /// Newest last; bounded, oldest dropped first.
    pub(crate) receiving_chains: VecDeque<ReceivingChain>,
    /// Length of our previous sending chain, sent in headers.
    pub(crate) previous_counter: u32,
    /// Oldest first; bounded, oldest evicted first.
    pub(crate) skipped_keys: VecDeque<SkippedMessageKey>,
    pub(crate) local_identity_key: [u8; 32],
    pub(crate) remote_identity_key: [u8; 32],
    pub(crate) remote_registration_id: u32,
    /// Initiator's ephemeral key from the handshake that created the session.
    pub(crate) base_key: [u8; 32],
    /// Set on the initiator until the first reply arrives.
    pub(crate) pending_prekey: Option<PendingPreKey>,
    /// Initiator identity || responder identity, bound into every AEAD tag.
    pub(crate) associated_data: Vec<u8>,
    /// Base keys of earlier sessions with this peer, newest last.
    pub(crate) superseded_base_keys: VecDeque<[u8; 32]>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("remote_identity_key", &hex::encode(self.remote_identity_key))
            .field("remote_registration_id", &self.remote_registration_id)
            .field("sending_counter", &self.sending_chain.counter)
            .field("receiving_chains", &self.receiving_chains.len())
            .field("skipped_keys", &self.skipped_keys.len())
            .field("pending_prekey", &self.pending_prekey)
            .finish_non_exhaustive()
    }
}

impl SessionState {
    pub fn remote_identity_key(&self) -> &[u8; 32] {
        &self.remote_identity_key
    }

    pub fn local_identity_key(&self) -> &[u8; 32] {
        &self.local_identity_key
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    /// Number of messages sent on the current sending chain.
    pub fn sending_counter(&self) -> u32 {
        self.sending_chain.counter
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    pub fn receiving_chain_count(&self) -> usize {
        self.receiving_chains.len()
    }

    /// Whether we are still waiting for the peer to answer our handshake.
    pub fn has_pending_prekey(&self) -> bool {
        self.pending_prekey.is_some()
    }

    /// Whether `base_key` started a session that this one replaced.
    pub fn supersedes(&self, base_key: &[u8; 32]) -> bool {
        self.superseded_base_keys.contains(base_key)
    }

    /// Take over the handshake history of `previous`, which this session
    /// replaces.
    pub(crate) fn inherit_history(&mut self, previous: &SessionState) {
        let mut history = previous.superseded_base_keys.clone();
        history.push_back(previous.base_key);
        history.retain(|key| key != &self.base_key);
        while history.len() > MAX_SUPERSEDED_BASE_KEYS {
            history.pop_front();
        }
        self.superseded_base_keys = history;
    }

    pub(crate) fn receiving_chain_mut(&mut self, ratchet_key: &[u8; 32]) -> Option<&mut ChainState> {
        self.receiving_chains
            .iter_mut()
            .find(|c| &c.ratchet_key == ratchet_key)
            .map(|c| &mut c.chain)
    }

    pub(crate) fn push_receiving_chain(&mut self, ratchet_key: [u8; 32], chain: ChainState, max_chains: usize) {
        self.receiving_chains.push_back(ReceivingChain { ratchet_key, chain });
        while self.receiving_chains.len() > max_chains.max(1) {
            if let Some(dropped) = self.receiving_chains.pop_front() {
                tracing::trace!(ratchet_key = hex::encode(dropped.ratchet_key), "dropped old receiving chain");
            }
        }
    }

    pub(crate) fn take_skipped_key(&mut self, ratchet_key: &[u8; 32], counter: u32) -> Option<[u8; 32]> {
        let position = self
            .skipped_keys
            .iter()
            .position(|k| &k.ratchet_key == ratchet_key && k.counter == counter)?;
        self.skipped_keys.remove(position).map(|k| k.message_key)
    }

    pub(crate) fn push_skipped_key(
        &mut self,
        ratchet_key: [u8; 32],
        counter: u32,
        message_key: [u8; 32],
        max_keys: usize,
    ) {
        self.skipped_keys.push_back(SkippedMessageKey {
            ratchet_key,
            counter,
            message_key,
        });
        while self.skipped_keys.len() > max_keys {
            self.skipped_keys.pop_front();
        }
    }

    /// Encode for the session store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![SESSION_FORMAT_VERSION];
        bincode::serialize_into(&mut out, self)
            .map_err(|e| CryptoError::StorageFailure(format!("encode session: {e}")))?;
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        match data.split_first() {
            Some((&SESSION_FORMAT_VERSION, rest)) => bincode::deserialize(rest)
                .map_err(|e| CryptoError::StorageFailure(format!("corrupt session record: {e}"))),
            Some((version, _)) => Err(CryptoError::StorageFailure(format!(
                "unsupported session format version {version}"
            ))),
            None => Err(CryptoError::StorageFailure("empty session record".into())),
        }
    }
}

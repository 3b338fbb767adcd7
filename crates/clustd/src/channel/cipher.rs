//! Per-message key rotation and AES-128-GCM framing.
//!
//! Every message gets its own key: `SHA-256(secret ++ be32(counter) [++ be32(ticket)])`
//! truncated to 16 bytes. Counters are pre-incremented per direction and must
//! be consumed in the same order on both ends, otherwise keys diverge and
//! authentication fails. Frames are `iv(12) ++ tag(16) ++ ciphertext`.

use std::sync::Arc;

use rand::RngCore;
use ring::aead::{AES_128_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use clustd_common::ClustdError;
use clustd_common::constants::{IV_LENGTH, KEY_LENGTH, TAG_LENGTH};

/// Key schedule and counters for one socket
pub struct MessageCipher {
    secret: Arc<[u8]>,
    outgoing: u32,
    incoming: u32,
    ticket: u32,
    initialized: bool,
}

impl MessageCipher {
    /// Fresh cipher with zeroed counters and a random ticket
    pub fn new(secret: Arc<[u8]>) -> Self {
        Self {
            secret,
            outgoing: 0,
            incoming: 0,
            ticket: rand::random(),
            initialized: false,
        }
    }

    pub fn ticket(&self) -> u32 {
        self.ticket
    }

    pub fn set_ticket(&mut self, ticket: u32) {
        self.ticket = ticket;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Mix the session ticket into every key from now on
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn outgoing_counter(&self) -> u32 {
        self.outgoing
    }

    pub fn incoming_counter(&self) -> u32 {
        self.incoming
    }

    /// Serialize and seal `value` under the next outgoing key
    pub fn encrypt<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>, ClustdError> {
        let plaintext = serde_json::to_vec(value)?;
        self.outgoing = next_counter(self.outgoing)?;
        let key = self.key(self.outgoing)?;

        let mut iv = [0u8; IV_LENGTH];
        rand::rng().fill_bytes(&mut iv);

        let mut in_out = plaintext;
        let tag = key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| ClustdError::Serialization("message encryption failed".into()))?;

        let mut frame = Vec::with_capacity(IV_LENGTH + TAG_LENGTH + in_out.len());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(tag.as_ref());
        frame.extend_from_slice(&in_out);
        Ok(frame)
    }

    /// Open a frame under the next incoming key and parse its JSON body
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Value, ClustdError> {
        self.incoming = next_counter(self.incoming)?;
        if frame.len() < IV_LENGTH + TAG_LENGTH {
            return Err(ClustdError::Decrypt);
        }
        let key = self.key(self.incoming)?;

        let (iv, rest) = frame.split_at(IV_LENGTH);
        let (tag, ciphertext) = rest.split_at(TAG_LENGTH);
        let nonce = Nonce::try_assume_unique_for_key(iv).map_err(|_| ClustdError::Decrypt)?;

        // ring expects the tag appended to the ciphertext
        let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LENGTH);
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);

        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| ClustdError::Decrypt)?;

        serde_json::from_slice(plaintext).map_err(|_| ClustdError::Decrypt)
    }

    /// Decrypt and deserialize into a concrete type
    pub fn decrypt_as<T: serde::de::DeserializeOwned>(&mut self, frame: &[u8]) -> Result<T, ClustdError> {
        let value = self.decrypt(frame)?;
        Ok(serde_json::from_value(value)?)
    }

    fn key(&self, counter: u32) -> Result<LessSafeKey, ClustdError> {
        let digest = derive_key(&self.secret, counter, self.initialized.then_some(self.ticket));
        let unbound = UnboundKey::new(&AES_128_GCM, &digest)
            .map_err(|_| ClustdError::Protocol("invalid derived key length".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

/// Next counter value. Never wraps.
fn next_counter(counter: u32) -> Result<u32, ClustdError> {
    counter
        .checked_add(1)
        .ok_or_else(|| ClustdError::Protocol("message counter exhausted".into()))
}

/// First 16 bytes of `SHA-256(secret ++ be32(counter) [++ be32(ticket)])`
pub fn derive_key(secret: &[u8], counter: u32, ticket: Option<u32>) -> [u8; KEY_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(counter.to_be_bytes());
    if let Some(ticket) = ticket {
        hasher.update(ticket.to_be_bytes());
    }
    let digest = hasher.finalize();

    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&digest[..KEY_LENGTH]);
    key
}

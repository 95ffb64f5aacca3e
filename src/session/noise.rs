// src/session/noise.rs
//! Thin wrapper around the snow Noise XX state machines.
//!
//! Pattern: Noise_XX_25519_ChaChaPoly_SHA256. Three handshake messages,
//! mutual static authentication, per-session forward secrecy. Transport
//! nonces are the 64-bit counters snow maintains internally; out-of-order
//! ciphertexts fail authentication and surface as decrypt errors.

use snow::{Builder, HandshakeState, TransportState};

use crate::crypto::NoiseKeyPair;

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Maximum Noise message size, fixed by the Noise protocol framing
pub const NOISE_MAX_MESSAGE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

pub enum NoiseSessionState {
    HandshakeInProgress {
        handshake_state: Box<HandshakeState>,
    },
    TransportReady {
        transport_state: Box<TransportState>,
    },
    Terminated,
}

pub struct NoiseSession {
    pub role: NoiseRole,
    state: NoiseSessionState,
    remote_static: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
}

impl NoiseSession {
    pub fn new_initiator(local_keypair: &NoiseKeyPair) -> Result<Self, snow::Error> {
        Self::new(local_keypair, NoiseRole::Initiator)
    }

    pub fn new_responder(local_keypair: &NoiseKeyPair) -> Result<Self, snow::Error> {
        Self::new(local_keypair, NoiseRole::Responder)
    }

    fn new(local_keypair: &NoiseKeyPair, role: NoiseRole) -> Result<Self, snow::Error> {
        let params = NOISE_PATTERN.parse()?;
        let private_bytes = local_keypair.private_bytes();
        let builder = Builder::new(params).local_private_key(&private_bytes)?;
        let handshake = match role {
            NoiseRole::Initiator => builder.build_initiator()?,
            NoiseRole::Responder => builder.build_responder()?,
        };

        Ok(Self {
            role,
            state: NoiseSessionState::HandshakeInProgress {
                handshake_state: Box::new(handshake),
            },
            remote_static: None,
            handshake_hash: None,
        })
    }

    pub fn write_handshake_message(&mut self) -> Result<Vec<u8>, snow::Error> {
        match &mut self.state {
            NoiseSessionState::HandshakeInProgress { handshake_state } => {
                let mut buffer = vec![0u8; NOISE_MAX_MESSAGE];
                let len = handshake_state.write_message(&[], &mut buffer)?;
                buffer.truncate(len);
                self.promote_if_finished()?;
                Ok(buffer)
            }
            _ => Err(snow::Error::Input),
        }
    }

    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<(), snow::Error> {
        match &mut self.state {
            NoiseSessionState::HandshakeInProgress { handshake_state } => {
                let mut buffer = vec![0u8; NOISE_MAX_MESSAGE];
                handshake_state.read_message(message, &mut buffer)?;
                self.promote_if_finished()?;
                Ok(())
            }
            _ => Err(snow::Error::Input),
        }
    }

    /// Move into transport mode once the final token has been processed
    fn promote_if_finished(&mut self) -> Result<(), snow::Error> {
        let finished = matches!(
            &self.state,
            NoiseSessionState::HandshakeInProgress { handshake_state }
                if handshake_state.is_handshake_finished()
        );
        if !finished {
            return Ok(());
        }

        let old_state = std::mem::replace(&mut self.state, NoiseSessionState::Terminated);
        if let NoiseSessionState::HandshakeInProgress { handshake_state } = old_state {
            if let Some(remote) = handshake_state.get_remote_static() {
                let mut key = [0u8; 32];
                key.copy_from_slice(remote);
                self.remote_static = Some(key);
            }

            let hash_slice = handshake_state.get_handshake_hash();
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&hash_slice[..32]);
            self.handshake_hash = Some(hash);

            let transport = handshake_state.into_transport_mode()?;
            self.state = NoiseSessionState::TransportReady {
                transport_state: Box::new(transport),
            };
        }
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, snow::Error> {
        match &mut self.state {
            NoiseSessionState::TransportReady { transport_state } => {
                let mut buffer = vec![0u8; plaintext.len() + 16];
                let len = transport_state.write_message(plaintext, &mut buffer)?;
                buffer.truncate(len);
                Ok(buffer)
            }
            _ => Err(snow::Error::Input),
        }
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, snow::Error> {
        match &mut self.state {
            NoiseSessionState::TransportReady { transport_state } => {
                let mut buffer = vec![0u8; ciphertext.len()];
                let len = transport_state.read_message(ciphertext, &mut buffer)?;
                buffer.truncate(len);
                Ok(buffer)
            }
            _ => Err(snow::Error::Input),
        }
    }

    /// In-session KDF step for the sending direction
    pub fn rekey_outgoing(&mut self) -> Result<(), snow::Error> {
        match &mut self.state {
            NoiseSessionState::TransportReady { transport_state } => {
                transport_state.rekey_outgoing();
                Ok(())
            }
            _ => Err(snow::Error::Input),
        }
    }

    /// In-session KDF step for the receiving direction
    pub fn rekey_incoming(&mut self) -> Result<(), snow::Error> {
        match &mut self.state {
            NoiseSessionState::TransportReady { transport_state } => {
                transport_state.rekey_incoming();
                Ok(())
            }
            _ => Err(snow::Error::Input),
        }
    }

    pub fn is_handshake_finished(&self) -> bool {
        matches!(self.state, NoiseSessionState::TransportReady { .. })
    }

    /// Remote static public key, available as soon as the handshake has
    /// delivered it (after msg2 for the initiator, msg3 for the responder)
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        if let Some(key) = self.remote_static {
            return Some(key);
        }
        match &self.state {
            NoiseSessionState::HandshakeInProgress { handshake_state } => {
                handshake_state.get_remote_static().map(|remote| {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(remote);
                    key
                })
            }
            _ => None,
        }
    }

    /// Channel-binding hash of the completed handshake
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    /// Drop the cipher states; snow zeroizes key material on drop
    pub fn terminate(&mut self) {
        self.state = NoiseSessionState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair() -> (NoiseSession, NoiseSession) {
        let alice_keys = NoiseKeyPair::generate();
        let bob_keys = NoiseKeyPair::generate();
        let mut alice = NoiseSession::new_initiator(&alice_keys).unwrap();
        let mut bob = NoiseSession::new_responder(&bob_keys).unwrap();

        let msg1 = alice.write_handshake_message().unwrap();
        bob.read_handshake_message(&msg1).unwrap();
        let msg2 = bob.write_handshake_message().unwrap();
        alice.read_handshake_message(&msg2).unwrap();
        let msg3 = alice.write_handshake_message().unwrap();
        bob.read_handshake_message(&msg3).unwrap();

        (alice, bob)
    }

    #[test]
    fn test_xx_handshake_converges() {
        let (alice, bob) = handshake_pair();
        assert!(alice.is_handshake_finished());
        assert!(bob.is_handshake_finished());

        // Both sides derived the same channel binding
        assert_eq!(alice.handshake_hash(), bob.handshake_hash());
        assert!(alice.remote_static().is_some());
        assert!(bob.remote_static().is_some());
    }

    #[test]
    fn test_transport_both_directions() {
        let (mut alice, mut bob) = handshake_pair();

        let ciphertext = alice.encrypt(b"from alice").unwrap();
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"from alice");

        let ciphertext = bob.encrypt(b"from bob").unwrap();
        assert_eq!(alice.decrypt(&ciphertext).unwrap(), b"from bob");
    }

    #[test]
    fn test_out_of_order_decrypt_fails() {
        let (mut alice, mut bob) = handshake_pair();

        let first = alice.encrypt(b"one").unwrap();
        let second = alice.encrypt(b"two").unwrap();

        // Nonce mismatch: delivering the second ciphertext first fails
        assert!(bob.decrypt(&second).is_err());
        let _ = first;
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut alice, mut bob) = handshake_pair();
        let mut ciphertext = alice.encrypt(b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(bob.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_symmetric_rekey() {
        let (mut alice, mut bob) = handshake_pair();

        alice.rekey_outgoing().unwrap();
        bob.rekey_incoming().unwrap();

        let ciphertext = alice.encrypt(b"after rekey").unwrap();
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"after rekey");
    }

    #[test]
    fn test_encrypt_before_established_fails() {
        let keys = NoiseKeyPair::generate();
        let mut session = NoiseSession::new_initiator(&keys).unwrap();
        assert!(session.encrypt(b"too early").is_err());
    }
}

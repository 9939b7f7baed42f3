//! AEAD encryption using ChaCha20-Poly1305

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use dav_core::{DavError, DavResult};

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// AEAD cipher wrapper
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    /// Create a new cipher from key bytes
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        AeadCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt plaintext with associated data
    /// Returns ciphertext with appended auth tag
    pub fn encrypt(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> DavResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| DavError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data
    /// Ciphertext should include the auth tag at the end
    pub fn decrypt(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], ciphertext: &[u8]) -> DavResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| DavError::DecryptionFailed)
    }
}

/// Derive the nonce of one frame from its direction and position in the stream
pub fn derive_nonce(direction: u8, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = direction;
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = AeadCipher::new(&[0x42u8; KEY_SIZE]);
        let nonce = derive_nonce(1, 7);

        let ciphertext = cipher.encrypt(&nonce, b"\x01", b"telegram").unwrap();
        assert_eq!(ciphertext.len(), b"telegram".len() + TAG_SIZE);
        assert_eq!(cipher.decrypt(&nonce, b"\x01", &ciphertext).unwrap(), b"telegram");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = AeadCipher::new(&[0x42u8; KEY_SIZE]);
        let cipher2 = AeadCipher::new(&[0x43u8; KEY_SIZE]);
        let nonce = derive_nonce(0, 1);

        let ciphertext = cipher1.encrypt(&nonce, b"", b"secret").unwrap();
        assert_eq!(
            cipher2.decrypt(&nonce, b"", &ciphertext),
            Err(DavError::DecryptionFailed)
        );
    }

    #[test]
    fn test_nonce_uniqueness() {
        assert_ne!(derive_nonce(0, 1), derive_nonce(1, 1));
        assert_ne!(derive_nonce(0, 1), derive_nonce(0, 2));
    }
}

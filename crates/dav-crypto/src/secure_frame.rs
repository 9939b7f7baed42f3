//! Frame encryption bound to an authenticated session
//!
//! After a successful SRP login both peers hold the same session key. Two
//! directional keys are derived from it with HKDF-SHA256, and every frame
//! body is sealed with an implicit per-direction counter as nonce. The
//! stream is ordered, so a dropped, replayed or reordered frame fails to
//! open.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;

use dav_core::{DavError, DavResult};

use crate::{derive_nonce, AeadCipher, KEY_SIZE};

const HKDF_SALT: &[u8] = b"dav-channel-v1";
const CLIENT_TO_SERVER: u8 = 0x01;
const SERVER_TO_CLIENT: u8 = 0x02;

/// Shared secret established by an SRP exchange.
///
/// Never printed; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(pub [u8; KEY_SIZE]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Which end of the SRP exchange this side was
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    /// Proved its password (initiator of the link)
    Client,
    /// Verified the password (acceptor of the link)
    Server,
}

/// Seals outgoing frame bodies
pub struct FrameSealer {
    cipher: AeadCipher,
    direction: u8,
    counter: u64,
}

impl FrameSealer {
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> DavResult<Vec<u8>> {
        let nonce = derive_nonce(self.direction, self.counter);
        let sealed = self.cipher.encrypt(&nonce, aad, plaintext)?;
        self.counter += 1;
        Ok(sealed)
    }
}

/// Opens incoming frame bodies
pub struct FrameOpener {
    cipher: AeadCipher,
    direction: u8,
    counter: u64,
}

impl FrameOpener {
    pub fn open(&mut self, aad: &[u8], sealed: &[u8]) -> DavResult<Vec<u8>> {
        let nonce = derive_nonce(self.direction, self.counter);
        let plaintext = self.cipher.decrypt(&nonce, aad, sealed)?;
        self.counter += 1;
        Ok(plaintext)
    }
}

/// Derive the sealer/opener pair for one side of a link
pub fn derive_frame_ciphers(key: &SessionKey, role: ChannelRole) -> DavResult<(FrameSealer, FrameOpener)> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &key.0);

    let mut c2s = [0u8; KEY_SIZE];
    let mut s2c = [0u8; KEY_SIZE];
    hk.expand(b"client->server", &mut c2s)
        .map_err(|_| DavError::EncryptionFailed)?;
    hk.expand(b"server->client", &mut s2c)
        .map_err(|_| DavError::EncryptionFailed)?;

    let (seal_key, seal_dir, open_key, open_dir) = match role {
        ChannelRole::Client => (c2s, CLIENT_TO_SERVER, s2c, SERVER_TO_CLIENT),
        ChannelRole::Server => (s2c, SERVER_TO_CLIENT, c2s, CLIENT_TO_SERVER),
    };

    Ok((
        FrameSealer {
            cipher: AeadCipher::new(&seal_key),
            direction: seal_dir,
            counter: 0,
        },
        FrameOpener {
            cipher: AeadCipher::new(&open_key),
            direction: open_dir,
            counter: 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> ((FrameSealer, FrameOpener), (FrameSealer, FrameOpener)) {
        let key = SessionKey([9u8; KEY_SIZE]);
        (
            derive_frame_ciphers(&key, ChannelRole::Client).unwrap(),
            derive_frame_ciphers(&key, ChannelRole::Server).unwrap(),
        )
    }

    #[test]
    fn test_both_directions() {
        let ((mut client_seal, mut client_open), (mut server_seal, mut server_open)) = pair();

        for i in 0..3u8 {
            let sealed = client_seal.seal(&[1], &[i; 10]).unwrap();
            assert_eq!(server_open.open(&[1], &sealed).unwrap(), vec![i; 10]);

            let sealed = server_seal.seal(&[1], &[i; 4]).unwrap();
            assert_eq!(client_open.open(&[1], &sealed).unwrap(), vec![i; 4]);
        }
    }

    #[test]
    fn test_replayed_frame_fails() {
        let ((mut client_seal, _), (_, mut server_open)) = pair();

        let first = client_seal.seal(&[1], b"one").unwrap();
        assert!(server_open.open(&[1], &first).is_ok());
        assert_eq!(server_open.open(&[1], &first), Err(DavError::DecryptionFailed));
    }

    #[test]
    fn test_reflected_frame_fails() {
        let ((mut client_seal, mut client_open), _) = pair();
        let sealed = client_seal.seal(&[1], b"echo").unwrap();
        assert!(client_open.open(&[1], &sealed).is_err());
    }

    #[test]
    fn test_session_key_redacted() {
        assert_eq!(format!("{:?}", SessionKey([1; KEY_SIZE])), "SessionKey(..)");
    }
}

//! Fabricated verifiers for unknown users
//!
//! A login for a user that does not exist must look exactly like a login
//! with a wrong password. The server therefore answers with a salt and a
//! verifier derived from a secret created once per process and the user
//! name: the same user always gets the same fake within one process, and
//! a restarted process produces different (but again stable) fakes.
//!
//! The secret is security sensitive. It is never serialized and its `Debug`
//! output is redacted.

use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{private_key_from_digest, SrpVerifier, SALT_SIZE};

const SECRET_SIZE: usize = 32;

/// Process-lifetime source of fabricated SRP verifiers
pub struct FakeVerifierSource {
    secret: [u8; SECRET_SIZE],
}

impl FakeVerifierSource {
    /// Create a source with a fresh random secret
    pub fn new() -> Self {
        let mut secret = [0u8; SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);
        FakeVerifierSource { secret }
    }

    /// Create a source with a fixed secret
    pub fn with_secret(secret: [u8; SECRET_SIZE]) -> Self {
        FakeVerifierSource { secret }
    }

    /// Fabricated verifier for `user` (and optionally a one-time password index)
    pub fn verifier(&self, user: &str, one_time_index: Option<u32>) -> SrpVerifier {
        let index = one_time_index.map(|i| i as i64).unwrap_or(-1).to_le_bytes();

        let salt = self.derive(b"salt", user, &index)[..SALT_SIZE].to_vec();
        let x = self.derive(b"verifier", user, &index);
        SrpVerifier::from_private_key(salt, &private_key_from_digest(&x))
    }

    fn derive(&self, label: &[u8], user: &str, index: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(self.secret);
        hasher.update(user.as_bytes());
        hasher.update(index);
        hasher.finalize().into()
    }
}

impl Default for FakeVerifierSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FakeVerifierSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FakeVerifierSource(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SrpClient, SrpServerSession};
    use dav_core::DavError;

    #[test]
    fn test_stable_within_process() {
        let source = FakeVerifierSource::new();
        assert_eq!(source.verifier("ghost", None), source.verifier("ghost", None));
        assert_ne!(source.verifier("ghost", None), source.verifier("other", None));
        assert_ne!(source.verifier("ghost", None), source.verifier("ghost", Some(1)));
    }

    #[test]
    fn test_differs_across_processes() {
        let first = FakeVerifierSource::new();
        let second = FakeVerifierSource::new();
        assert_ne!(first.verifier("ghost", None), second.verifier("ghost", None));
    }

    #[test]
    fn test_salt_looks_real() {
        let fake = FakeVerifierSource::new().verifier("ghost", None);
        let real = SrpVerifier::generate("dav1", "secret");
        assert_eq!(fake.salt.len(), real.salt.len());
    }

    #[test]
    fn test_fake_exchange_is_failed_login() {
        let record = FakeVerifierSource::with_secret([3; SECRET_SIZE]).verifier("ghost", None);
        let client = SrpClient::new("ghost");
        let server = SrpServerSession::start("ghost", None, &client.public_ephemeral(), &record, true).unwrap();

        // The client can complete its side; the failure shows up as a login failure
        let proof = client
            .process_challenge("anything", &record.salt, &server.public_ephemeral())
            .unwrap();
        assert!(matches!(
            server.verify(&proof.m1),
            Err(DavError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            proof.verify_server(&[]),
            Err(DavError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_debug_redacted() {
        let source = FakeVerifierSource::with_secret([0xAB; SECRET_SIZE]);
        assert_eq!(format!("{:?}", source), "FakeVerifierSource(..)");
    }
}

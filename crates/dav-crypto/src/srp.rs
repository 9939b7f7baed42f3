//! SRP-6a password authenticated key exchange
//!
//! Group: RFC 5054 2048-bit, generator 2, hash SHA-256.
//!
//! ```text
//! k  = H(N | PAD(g))
//! x  = H(salt | H(user ":" password))
//! v  = g^x
//! A  = g^a                        (client)
//! B  = k*v + g^b                  (server)
//! u  = H(PAD(A) | PAD(B))
//! S  = (B - k*g^x)^(a + u*x)      (client)
//!    = (A * v^u)^b                (server)
//! K  = H(S)
//! M1 = H(PAD(A) | PAD(B) | K)
//! M2 = H(PAD(A) | M1 | K)
//! ```

use std::fmt;
use std::sync::OnceLock;

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use dav_core::{DavError, DavResult};

use crate::SessionKey;

/// Size of generated salts
pub const SALT_SIZE: usize = 16;

/// Size of private ephemeral exponents
const EPHEMERAL_SIZE: usize = 32;

const RFC5054_N_2048: &str = "\
    AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050\
    A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50\
    E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8\
    55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B\
    CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748\
    544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6\
    AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6\
    94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";

/// Parameters of an SRP group
pub struct SrpGroup {
    pub n: BigUint,
    pub g: BigUint,
    k: BigUint,
    len: usize,
}

impl SrpGroup {
    /// The group used on every distributor link
    pub fn standard() -> &'static SrpGroup {
        static GROUP: OnceLock<SrpGroup> = OnceLock::new();
        GROUP.get_or_init(|| {
            let n_bytes: Vec<u8> = hex_nibbles(RFC5054_N_2048)
                .chunks(2)
                .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
                .collect();
            SrpGroup::new(BigUint::from_bytes_be(&n_bytes), BigUint::from(2u32))
        })
    }

    pub fn new(n: BigUint, g: BigUint) -> Self {
        let len = n.to_bytes_be().len();
        let k = BigUint::from_bytes_be(&hash(&[n.to_bytes_be().as_slice(), pad(&g, len).as_slice()]));
        SrpGroup { n, g, k, len }
    }

    fn pad(&self, value: &BigUint) -> Vec<u8> {
        pad(value, self.len)
    }

    fn pow_g(&self, exp: &BigUint) -> BigUint {
        self.g.modpow(exp, &self.n)
    }
}

fn hex_nibbles(s: &str) -> Vec<u8> {
    s.chars().filter_map(|c| c.to_digit(16)).map(|d| d as u8).collect()
}

fn pad(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= len {
        return bytes;
    }
    let mut padded = vec![0u8; len - bytes.len()];
    padded.extend_from_slice(&bytes);
    padded
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn random_exponent() -> BigUint {
    let mut bytes = [0u8; EPHEMERAL_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

/// Private key `x` derived from the password
pub fn private_key(user: &str, password: &str, salt: &[u8]) -> BigUint {
    let inner = hash(&[user.as_bytes(), &b":"[..], password.as_bytes()]);
    private_key_from_digest(&hash(&[salt, &inner[..]]))
}

/// Private key from an already computed digest
pub fn private_key_from_digest(digest: &[u8]) -> BigUint {
    BigUint::from_bytes_be(digest)
}

/// Stored verifier of one user (or one one-time password)
#[derive(Clone, PartialEq, Eq)]
pub struct SrpVerifier {
    pub salt: Vec<u8>,
    pub verifier: BigUint,
}

impl SrpVerifier {
    /// Compute a verifier with a fresh random salt
    pub fn generate(user: &str, password: &str) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(user, password, salt)
    }

    pub fn with_salt(user: &str, password: &str, salt: Vec<u8>) -> Self {
        let x = private_key(user, password, &salt);
        Self::from_private_key(salt, &x)
    }

    pub fn from_private_key(salt: Vec<u8>, x: &BigUint) -> Self {
        SrpVerifier {
            verifier: SrpGroup::standard().pow_g(x),
            salt,
        }
    }
}

impl fmt::Debug for SrpVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrpVerifier")
            .field("salt_len", &self.salt.len())
            .finish_non_exhaustive()
    }
}

fn scramble(group: &SrpGroup, a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&hash(&[group.pad(a_pub).as_slice(), group.pad(b_pub).as_slice()]))
}

fn client_proof(group: &SrpGroup, a_pub: &BigUint, b_pub: &BigUint, key: &[u8]) -> [u8; 32] {
    hash(&[group.pad(a_pub).as_slice(), group.pad(b_pub).as_slice(), key])
}

fn server_proof(group: &SrpGroup, a_pub: &BigUint, m1: &[u8], key: &[u8]) -> [u8; 32] {
    hash(&[group.pad(a_pub).as_slice(), m1, key])
}

/// Client side of one login attempt
pub struct SrpClient {
    user: String,
    a: BigUint,
    a_pub: BigUint,
}

impl SrpClient {
    pub fn new(user: &str) -> Self {
        let group = SrpGroup::standard();
        let a = random_exponent();
        let a_pub = group.pow_g(&a);
        SrpClient {
            user: user.to_string(),
            a,
            a_pub,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Public ephemeral `A` to send with the request
    pub fn public_ephemeral(&self) -> Vec<u8> {
        SrpGroup::standard().pad(&self.a_pub)
    }

    /// Answer the server challenge. Fails on a malformed challenge, which is
    /// a protocol error rather than a failed login.
    pub fn process_challenge(self, password: &str, salt: &[u8], b_bytes: &[u8]) -> DavResult<SrpClientProof> {
        let group = SrpGroup::standard();
        let b_pub = BigUint::from_bytes_be(b_bytes);
        if (&b_pub % &group.n) == BigUint::default() {
            return Err(DavError::InvalidWireFormat("illegal server ephemeral".into()));
        }

        let u = scramble(group, &self.a_pub, &b_pub);
        if u == BigUint::default() {
            return Err(DavError::InvalidWireFormat("illegal scrambling parameter".into()));
        }

        let x = private_key(&self.user, password, salt);
        let kgx = (&group.k * group.pow_g(&x)) % &group.n;
        let base = ((&b_pub % &group.n) + &group.n - kgx) % &group.n;
        let exp = &self.a + &u * &x;
        let s = base.modpow(&exp, &group.n);
        let key = hash(&[group.pad(&s).as_slice()]);

        let m1 = client_proof(group, &self.a_pub, &b_pub, &key);
        let m2 = server_proof(group, &self.a_pub, &m1, &key);

        Ok(SrpClientProof {
            m1: m1.to_vec(),
            expected_m2: m2.to_vec(),
            key: SessionKey(key),
        })
    }
}

/// Client proof `M1` plus what is needed to check the server's answer
pub struct SrpClientProof {
    pub m1: Vec<u8>,
    expected_m2: Vec<u8>,
    key: SessionKey,
}

impl SrpClientProof {
    /// Check the server proof. An empty or wrong `M2` is a failed login.
    pub fn verify_server(self, m2: &[u8]) -> DavResult<SessionKey> {
        if m2.is_empty() {
            return Err(DavError::AuthenticationFailed("login rejected by remote side".into()));
        }
        if m2 != self.expected_m2.as_slice() {
            return Err(DavError::AuthenticationFailed("remote side failed to prove the password".into()));
        }
        Ok(self.key)
    }
}

/// Server side of one login attempt. Consumed by [`SrpServerSession::verify`],
/// so its state never outlives the attempt.
pub struct SrpServerSession {
    user: String,
    one_time_index: Option<u32>,
    fake: bool,
    verifier: BigUint,
    b: BigUint,
    a_pub: BigUint,
    b_pub: BigUint,
}

impl SrpServerSession {
    /// Start the exchange with the client's `A`. `fake` marks a fabricated
    /// verifier; such sessions never succeed but look like real ones.
    pub fn start(
        user: &str,
        one_time_index: Option<u32>,
        a_bytes: &[u8],
        record: &SrpVerifier,
        fake: bool,
    ) -> DavResult<Self> {
        let group = SrpGroup::standard();
        let a_pub = BigUint::from_bytes_be(a_bytes);
        if (&a_pub % &group.n) == BigUint::default() {
            return Err(DavError::InvalidWireFormat("illegal client ephemeral".into()));
        }

        let b = random_exponent();
        let b_pub = (&group.k * &record.verifier + group.pow_g(&b)) % &group.n;

        Ok(SrpServerSession {
            user: user.to_string(),
            one_time_index,
            fake,
            verifier: record.verifier.clone(),
            b,
            a_pub,
            b_pub,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn one_time_index(&self) -> Option<u32> {
        self.one_time_index
    }

    /// Public ephemeral `B` to send with the salt
    pub fn public_ephemeral(&self) -> Vec<u8> {
        SrpGroup::standard().pad(&self.b_pub)
    }

    /// Check the client proof `M1`
    pub fn verify(self, m1: &[u8]) -> DavResult<SrpServerSuccess> {
        let group = SrpGroup::standard();
        let u = scramble(group, &self.a_pub, &self.b_pub);
        let s = ((&self.a_pub * self.verifier.modpow(&u, &group.n)) % &group.n).modpow(&self.b, &group.n);
        let key = hash(&[group.pad(&s).as_slice()]);

        let expected = client_proof(group, &self.a_pub, &self.b_pub, &key);
        if self.fake || m1 != expected.as_slice() {
            return Err(DavError::AuthenticationFailed(format!(
                "wrong password for user {}",
                self.user
            )));
        }

        Ok(SrpServerSuccess {
            user: self.user,
            one_time_index: self.one_time_index,
            m2: server_proof(group, &self.a_pub, m1, &key).to_vec(),
            key: SessionKey(key),
        })
    }
}

/// Result of a successful server-side verification
#[derive(Debug)]
pub struct SrpServerSuccess {
    pub user: String,
    pub one_time_index: Option<u32>,
    pub m2: Vec<u8>,
    pub key: SessionKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(user: &str, stored: &str, tried: &str) -> (DavResult<SrpServerSuccess>, SrpClientProof) {
        let record = SrpVerifier::generate(user, stored);
        let client = SrpClient::new(user);
        let server = SrpServerSession::start(user, None, &client.public_ephemeral(), &record, false).unwrap();
        let proof = client
            .process_challenge(tried, &record.salt, &server.public_ephemeral())
            .unwrap();
        (server.verify(&proof.m1), proof)
    }

    #[test]
    fn test_group_size() {
        let group = SrpGroup::standard();
        assert_eq!(group.n.bits(), 2048);
        assert_eq!(group.pad(&group.g).len(), 256);
    }

    #[test]
    fn test_successful_exchange() {
        let (result, proof) = login("dav1", "secret", "secret");
        let success = result.unwrap();
        let client_key = proof.verify_server(&success.m2).unwrap();
        assert_eq!(client_key, success.key);
    }

    #[test]
    fn test_wrong_password() {
        let (result, proof) = login("dav1", "secret", "guess");
        assert!(matches!(result, Err(DavError::AuthenticationFailed(_))));
        assert!(matches!(
            proof.verify_server(&[]),
            Err(DavError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_zero_ephemeral_rejected() {
        let record = SrpVerifier::generate("u", "p");
        let n = SrpGroup::standard().n.to_bytes_be();
        assert!(SrpServerSession::start("u", None, &n, &record, false).is_err());

        let client = SrpClient::new("u");
        assert!(client.process_challenge("p", &record.salt, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_fake_session_never_succeeds() {
        let record = SrpVerifier::generate("ghost", "whatever");
        let client = SrpClient::new("ghost");
        let server = SrpServerSession::start("ghost", None, &client.public_ephemeral(), &record, true).unwrap();
        let proof = client
            .process_challenge("whatever", &record.salt, &server.public_ephemeral())
            .unwrap();
        assert!(server.verify(&proof.m1).is_err());
    }
}

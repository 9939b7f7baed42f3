//! Credential lookup and server-side SRP logins
//!
//! The user database itself lives outside the distributor (it is part of
//! the configuration). [`VerifierStore`] is the seam to it; the in-memory
//! [`CredentialStore`] is used by tests and small deployments.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use dav_core::{DavError, DavResult, UserId};

use crate::{FakeVerifierSource, SrpServerSession, SrpServerSuccess, SrpVerifier};

/// Source of SRP verifiers and legacy passwords
pub trait VerifierStore: Send + Sync {
    /// Verifier of the permanent password, or of one-time password `index`
    /// if it exists and has not been used yet
    fn verifier(&self, user: &str, one_time_index: Option<u32>) -> Option<SrpVerifier>;

    /// Mark one-time password `index` as used. Returns false if it was
    /// already used or does not exist.
    fn consume_one_time(&self, user: &str, index: u32) -> bool;

    /// Plain password for the legacy HMAC login
    fn legacy_password(&self, user: &str) -> Option<String>;

    fn user_id(&self, user: &str) -> Option<UserId>;
}

/// Name and password this distributor logs in with
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub user: String,
    pub password: String,
}

impl ClientCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        ClientCredentials {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

struct UserRecord {
    id: UserId,
    verifier: SrpVerifier,
    password: String,
    one_time: HashMap<u32, SrpVerifier>,
    used: HashSet<u32>,
}

/// In-memory user database
#[derive(Default)]
pub struct CredentialStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user
    pub fn add_user(&self, user: &str, id: UserId, password: &str) {
        self.users.write().insert(
            user.to_string(),
            UserRecord {
                id,
                verifier: SrpVerifier::generate(user, password),
                password: password.to_string(),
                one_time: HashMap::new(),
                used: HashSet::new(),
            },
        );
    }

    /// Register one-time password `index` for an existing user
    pub fn add_one_time_password(&self, user: &str, index: u32, password: &str) -> DavResult<()> {
        let mut users = self.users.write();
        let record = users
            .get_mut(user)
            .ok_or_else(|| DavError::MissingCredentials(user.to_string()))?;
        record.one_time.insert(index, SrpVerifier::generate(user, password));
        record.used.remove(&index);
        Ok(())
    }

    pub fn remove_user(&self, user: &str) -> bool {
        self.users.write().remove(user).is_some()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.read().contains_key(user)
    }
}

impl VerifierStore for CredentialStore {
    fn verifier(&self, user: &str, one_time_index: Option<u32>) -> Option<SrpVerifier> {
        let users = self.users.read();
        let record = users.get(user)?;
        match one_time_index {
            None => Some(record.verifier.clone()),
            Some(index) if record.used.contains(&index) => None,
            Some(index) => record.one_time.get(&index).cloned(),
        }
    }

    fn consume_one_time(&self, user: &str, index: u32) -> bool {
        let mut users = self.users.write();
        match users.get_mut(user) {
            Some(record) if record.one_time.contains_key(&index) => record.used.insert(index),
            _ => false,
        }
    }

    fn legacy_password(&self, user: &str) -> Option<String> {
        self.users.read().get(user).map(|r| r.password.clone())
    }

    fn user_id(&self, user: &str) -> Option<UserId> {
        self.users.read().get(user).map(|r| r.id)
    }
}

/// First answer of the server: salt and `B`, plus the pending session
pub struct SrpChallenge {
    pub session: SrpServerSession,
    pub salt: Vec<u8>,
    pub b: Vec<u8>,
}

/// Server-side SRP logins against a [`VerifierStore`]
///
/// Unknown users and used one-time passwords get a fabricated verifier, so
/// the answer has the same shape as for a known user.
#[derive(Clone)]
pub struct SrpAuthenticator {
    store: Arc<dyn VerifierStore>,
    fake: Arc<FakeVerifierSource>,
}

impl SrpAuthenticator {
    pub fn new(store: Arc<dyn VerifierStore>, fake: Arc<FakeVerifierSource>) -> Self {
        SrpAuthenticator { store, fake }
    }

    pub fn store(&self) -> &Arc<dyn VerifierStore> {
        &self.store
    }

    /// Handle an SRP request
    pub fn start(&self, user: &str, one_time_index: Option<u32>, a: &[u8]) -> DavResult<SrpChallenge> {
        let (record, fake) = match self.store.verifier(user, one_time_index) {
            Some(record) => (record, false),
            None => (self.fake.verifier(user, one_time_index), true),
        };
        let session = SrpServerSession::start(user, one_time_index, a, &record, fake)?;
        let b = session.public_ephemeral();
        Ok(SrpChallenge {
            session,
            salt: record.salt,
            b,
        })
    }

    /// Handle the validate request. A successful login with a one-time
    /// password disables that password; losing the race against a
    /// concurrent login with the same index is a failed login.
    pub fn finish(&self, session: SrpServerSession, m1: &[u8]) -> DavResult<SrpServerSuccess> {
        let success = session.verify(m1)?;
        if let Some(index) = success.one_time_index {
            if !self.store.consume_one_time(&success.user, index) {
                return Err(DavError::AuthenticationFailed(format!(
                    "one-time password {} of user {} was already used",
                    index, success.user
                )));
            }
        }
        Ok(success)
    }
}

impl fmt::Debug for SrpAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrpAuthenticator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SrpClient;

    fn authenticator() -> (Arc<CredentialStore>, SrpAuthenticator) {
        let store = Arc::new(CredentialStore::new());
        store.add_user("dav1", UserId(7), "secret");
        let auth = SrpAuthenticator::new(store.clone(), Arc::new(FakeVerifierSource::new()));
        (store, auth)
    }

    fn login(auth: &SrpAuthenticator, user: &str, password: &str, index: Option<u32>) -> DavResult<SrpServerSuccess> {
        let client = SrpClient::new(user);
        let challenge = auth.start(user, index, &client.public_ephemeral())?;
        let proof = client.process_challenge(password, &challenge.salt, &challenge.b)?;
        let success = auth.finish(challenge.session, &proof.m1)?;
        proof.verify_server(&success.m2)?;
        Ok(success)
    }

    #[test]
    fn test_permanent_password() {
        let (store, auth) = authenticator();
        assert!(login(&auth, "dav1", "secret", None).is_ok());
        assert!(login(&auth, "dav1", "wrong", None).is_err());
        assert_eq!(store.user_id("dav1"), Some(UserId(7)));
        assert_eq!(store.legacy_password("dav1").as_deref(), Some("secret"));
    }

    #[test]
    fn test_unknown_user_is_failed_login() {
        let (_, auth) = authenticator();
        let result = login(&auth, "nobody", "secret", None);
        assert!(matches!(result, Err(DavError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_one_time_password_single_use() {
        let (store, auth) = authenticator();
        store.add_one_time_password("dav1", 3, "otp-3").unwrap();

        assert!(login(&auth, "dav1", "otp-3", Some(3)).is_ok());
        assert!(matches!(
            login(&auth, "dav1", "otp-3", Some(3)),
            Err(DavError::AuthenticationFailed(_))
        ));
        // Permanent password is unaffected
        assert!(login(&auth, "dav1", "secret", None).is_ok());
    }

    #[test]
    fn test_one_time_race_has_one_winner() {
        let (store, auth) = authenticator();
        store.add_one_time_password("dav1", 1, "otp").unwrap();

        let first = SrpClient::new("dav1");
        let second = SrpClient::new("dav1");
        let c1 = auth.start("dav1", Some(1), &first.public_ephemeral()).unwrap();
        let c2 = auth.start("dav1", Some(1), &second.public_ephemeral()).unwrap();
        let p1 = first.process_challenge("otp", &c1.salt, &c1.b).unwrap();
        let p2 = second.process_challenge("otp", &c2.salt, &c2.b).unwrap();

        assert!(auth.finish(c1.session, &p1.m1).is_ok());
        assert!(auth.finish(c2.session, &p2.m1).is_err());
    }

    #[test]
    fn test_one_time_password_needs_user() {
        let store = CredentialStore::new();
        assert_eq!(
            store.add_one_time_password("ghost", 1, "x"),
            Err(DavError::MissingCredentials("ghost".into()))
        );
        assert!(!store.consume_one_time("ghost", 1));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = ClientCredentials::new("dav1", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}

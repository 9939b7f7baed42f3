//! Legacy challenge/response login
//!
//! Only used when the remote side does not speak SRP and the local policy
//! allows it. The server hands out a random text, the client answers with
//! HMAC-SHA256 keyed by its password over that text.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Name of the keyed digest sent with legacy authentication requests
pub const LEGACY_PROCESS_NAME: &str = "HMAC-SHA256";

const TEXT_LEN: usize = 32;

/// Keyed digest of a challenge text
pub fn legacy_digest(password: &str, text: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(password.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(text.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Hands out challenge texts and checks the answers
///
/// Each requester (keyed by its distributor id or application name) has at
/// most one outstanding text. A text is dropped after one check, whatever
/// the outcome.
#[derive(Default)]
pub struct AuthenticationTextComponent {
    texts: Mutex<HashMap<String, String>>,
}

impl AuthenticationTextComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding text for `requester`, creating one if needed
    pub fn text_for(&self, requester: &str) -> String {
        self.texts
            .lock()
            .entry(requester.to_string())
            .or_insert_with(random_text)
            .clone()
    }

    /// Check `answer` against the outstanding text of `requester`
    pub fn authenticate(&self, requester: &str, process: &str, password: &str, answer: &[u8]) -> bool {
        let Some(text) = self.texts.lock().remove(requester) else {
            return false;
        };
        if process != LEGACY_PROCESS_NAME {
            return false;
        }
        let Ok(mut mac) = HmacSha256::new_from_slice(password.as_bytes()) else {
            return false;
        };
        mac.update(text.as_bytes());
        mac.verify_slice(answer).is_ok()
    }

    pub fn outstanding(&self) -> usize {
        self.texts.lock().len()
    }
}

fn random_text() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEXT_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_answer() {
        let component = AuthenticationTextComponent::new();
        let text = component.text_for("dav-2");
        assert_eq!(text.len(), TEXT_LEN);
        assert_eq!(component.text_for("dav-2"), text);

        let answer = legacy_digest("secret", &text);
        assert!(component.authenticate("dav-2", LEGACY_PROCESS_NAME, "secret", &answer));
    }

    #[test]
    fn test_text_single_use() {
        let component = AuthenticationTextComponent::new();
        let text = component.text_for("dav-2");
        let answer = legacy_digest("secret", &text);

        assert!(!component.authenticate("dav-2", LEGACY_PROCESS_NAME, "wrong", &answer));
        assert_eq!(component.outstanding(), 0);
        assert!(!component.authenticate("dav-2", LEGACY_PROCESS_NAME, "secret", &answer));
        assert_ne!(component.text_for("dav-2"), text);
    }

    #[test]
    fn test_unknown_process_rejected() {
        let component = AuthenticationTextComponent::new();
        let text = component.text_for("app");
        let answer = legacy_digest("secret", &text);
        assert!(!component.authenticate("app", "MD5", "secret", &answer));
    }

    #[test]
    fn test_digest_depends_on_password() {
        assert_ne!(legacy_digest("a", "text"), legacy_digest("b", "text"));
        assert_eq!(legacy_digest("a", "text").len(), 32);
    }
}

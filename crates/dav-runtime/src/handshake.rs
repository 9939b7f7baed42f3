//! Rendezvous for synchronous handshake exchanges
//!
//! A handshake step registers the answer type it expects *before* sending
//! its request, then waits for it with a bounded timeout. The dispatch task
//! hands matching answers over; everything else keeps flowing through the
//! normal dispatch.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use dav_core::{DavError, DavResult};
use dav_wire::{ComParameters, Telegram, TelegramKind};

/// Smallest send keep-alive a server accepts
pub const MIN_SEND_KEEP_ALIVE_MS: u64 = 5000;

/// Smallest receive keep-alive a server accepts
pub const MIN_RECEIVE_KEEP_ALIVE_MS: u64 = 6000;

#[derive(Default)]
struct Slots {
    waiting: HashMap<TelegramKind, oneshot::Sender<Telegram>>,
    closed: bool,
}

/// Answers some handshake step is waiting for
#[derive(Default)]
pub struct PendingReplies {
    slots: Mutex<Slots>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce that an answer of `expected` type is awaited
    pub fn register(&self, expected: TelegramKind) -> DavResult<oneshot::Receiver<Telegram>> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(DavError::ConnectionTerminated("connection already terminated".into()));
        }
        if slots.waiting.contains_key(&expected) {
            return Err(DavError::IllegalState(format!("already waiting for {:?}", expected)));
        }
        let (tx, rx) = oneshot::channel();
        slots.waiting.insert(expected, tx);
        Ok(rx)
    }

    /// Hand `telegram` to its waiter. Gives it back if nobody waits for it.
    pub fn deliver(&self, telegram: Telegram) -> Result<(), Telegram> {
        let waiter = self.slots.lock().waiting.remove(&telegram.kind());
        match waiter {
            Some(tx) => tx.send(telegram),
            None => Err(telegram),
        }
    }

    pub fn is_waiting(&self, kind: TelegramKind) -> bool {
        self.slots.lock().waiting.contains_key(&kind)
    }

    /// Fail every current and future wait
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.waiting.clear();
    }
}

/// Wait for a registered answer
pub async fn wait_reply(
    rx: oneshot::Receiver<Telegram>,
    timeout: Duration,
    expected: TelegramKind,
) -> DavResult<Telegram> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(telegram)) => Ok(telegram),
        Ok(Err(_)) => Err(DavError::ConnectionTerminated(format!(
            "connection terminated while waiting for {:?}",
            expected
        ))),
        Err(_) => Err(DavError::Timeout(format!(
            "distributor not answering, no {:?} within {}",
            expected,
            humantime::format_duration(timeout)
        ))),
    }
}

/// Highest version both sides speak, `-1` if there is none
pub fn preferred_version(supported: &[i32], proposed: &[i32]) -> i32 {
    proposed
        .iter()
        .filter(|v| supported.contains(v))
        .copied()
        .max()
        .unwrap_or(-1)
}

/// Check the version a server answered with
pub fn check_negotiated(version: i32, supported: &[i32]) -> DavResult<i32> {
    if version < 0 {
        return Err(DavError::NegotiationFailed(format!(
            "remote distributor supports none of the protocol versions {:?}",
            supported
        )));
    }
    if !supported.contains(&version) {
        return Err(DavError::NegotiationFailed(format!(
            "remote distributor chose unsupported protocol version {}",
            version
        )));
    }
    Ok(version)
}

/// Server-side floors for requested keep-alive timeouts
pub fn clamp_com_parameters(requested: ComParameters) -> ComParameters {
    let send = requested.send_keep_alive_ms.max(MIN_SEND_KEEP_ALIVE_MS);
    ComParameters {
        send_keep_alive_ms: send,
        receive_keep_alive_ms: requested.receive_keep_alive_ms.max(MIN_RECEIVE_KEEP_ALIVE_MS),
        ..requested
    }
}

/// Local keep-alive settings as wire parameters
pub fn com_parameters(send: Duration, receive: Duration) -> ComParameters {
    ComParameters {
        send_keep_alive_ms: send.as_millis() as u64,
        receive_keep_alive_ms: receive.as_millis() as u64,
        cache_threshold_percent: 75,
        flow_control_threshold_ms: 60_000,
        min_connection_speed: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_delivered_reply() {
        let replies = PendingReplies::new();
        let rx = replies.register(TelegramKind::ProtocolVersionAnswer).unwrap();
        assert!(replies.is_waiting(TelegramKind::ProtocolVersionAnswer));
        replies
            .deliver(Telegram::ProtocolVersionAnswer { version: 3 })
            .unwrap();
        let got = wait_reply(rx, Duration::from_secs(1), TelegramKind::ProtocolVersionAnswer)
            .await
            .unwrap();
        assert_eq!(got, Telegram::ProtocolVersionAnswer { version: 3 });
        assert!(!replies.is_waiting(TelegramKind::ProtocolVersionAnswer));
    }

    #[test]
    fn test_unexpected_reply_returned() {
        let replies = PendingReplies::new();
        let _rx = replies.register(TelegramKind::SrpAnswer).unwrap();
        let back = replies.deliver(Telegram::KeepAlive);
        assert_eq!(back, Err(Telegram::KeepAlive));
        assert!(replies.is_waiting(TelegramKind::SrpAnswer));
    }

    #[test]
    fn test_double_registration() {
        let replies = PendingReplies::new();
        let _rx = replies.register(TelegramKind::SrpAnswer).unwrap();
        assert!(matches!(
            replies.register(TelegramKind::SrpAnswer),
            Err(DavError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let replies = PendingReplies::new();
        let rx = replies.register(TelegramKind::ComParametersAnswer).unwrap();
        let result = wait_reply(rx, Duration::from_millis(20), TelegramKind::ComParametersAnswer).await;
        assert!(matches!(result, Err(DavError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let replies = PendingReplies::new();
        let rx = replies.register(TelegramKind::SrpValidateAnswer).unwrap();
        replies.close();
        let result = wait_reply(rx, Duration::from_secs(5), TelegramKind::SrpValidateAnswer).await;
        assert!(matches!(result, Err(DavError::ConnectionTerminated(_))));
        assert!(replies.register(TelegramKind::SrpValidateAnswer).is_err());
    }

    #[test]
    fn test_negotiation() {
        assert_eq!(preferred_version(&[2, 3], &[1, 2, 3, 4]), 3);
        assert_eq!(preferred_version(&[2], &[2, 3]), 2);
        assert_eq!(preferred_version(&[3], &[1, 2]), -1);
        assert!(check_negotiated(3, &[2, 3]).is_ok());
        assert!(matches!(check_negotiated(-1, &[2, 3]), Err(DavError::NegotiationFailed(_))));
        assert!(matches!(check_negotiated(4, &[2, 3]), Err(DavError::NegotiationFailed(_))));
    }

    #[test]
    fn test_clamp() {
        let clamped = clamp_com_parameters(com_parameters(Duration::from_secs(1), Duration::from_secs(2)));
        assert_eq!(clamped.send_keep_alive_ms, 5000);
        assert_eq!(clamped.receive_keep_alive_ms, 6000);

        let kept = clamp_com_parameters(com_parameters(Duration::from_secs(20), Duration::from_secs(30)));
        assert_eq!(kept.send_keep_alive_ms, 20_000);
        assert_eq!(kept.receive_keep_alive_ms, 30_000);
    }

    proptest! {
        #[test]
        fn prop_negotiated_is_max_of_intersection(
            supported in proptest::collection::btree_set(0i32..8, 0..6),
            proposed in proptest::collection::btree_set(0i32..8, 0..6),
        ) {
            let supported: Vec<i32> = supported.into_iter().collect();
            let proposed: Vec<i32> = proposed.into_iter().collect();
            let version = preferred_version(&supported, &proposed);
            let common: Vec<i32> = supported.iter().filter(|v| proposed.contains(v)).copied().collect();
            match common.iter().max() {
                Some(max) => {
                    prop_assert_eq!(version, *max);
                    prop_assert_eq!(check_negotiated(version, &supported).ok(), Some(*max));
                }
                None => {
                    prop_assert_eq!(version, -1);
                    prop_assert!(check_negotiated(version, &supported).is_err());
                }
            }
        }
    }
}

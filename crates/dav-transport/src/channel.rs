//! Telegram channel abstraction
//!
//! Everything above the transport sees a link as a [`TelegramChannel`]:
//! telegrams go in through a non-blocking `send`, telegrams and the end of
//! the link come out as [`ChannelEvent`]s on a receiver handed out when the
//! channel is created.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use dav_core::DavResult;
use dav_crypto::{ChannelRole, SessionKey};
use dav_wire::Telegram;

/// Something that happened on a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A telegram arrived, in wire order
    Telegram(Telegram),
    /// The link ended. `None` means the remote side closed it in order.
    Closed(Option<String>),
}

/// Receiver side of a channel's events
pub type ChannelEvents = mpsc::Receiver<ChannelEvent>;

/// Duplex telegram transport
pub trait TelegramChannel: Send + Sync {
    /// Queue a telegram. Sends from any thread are serialized by the channel.
    fn send(&self, telegram: Telegram) -> DavResult<()>;

    /// Encrypt everything queued after this call, and expect encrypted
    /// frames from the remote side
    fn enable_encryption(&self, key: SessionKey, role: ChannelRole) -> DavResult<()>;

    /// Send plain frames from now on. Encrypted frames still in flight from
    /// the remote side are accepted.
    fn disable_encryption(&self) -> DavResult<()>;

    fn is_encrypted(&self) -> bool;

    /// Update keep-alive timeouts. The send side emits a keep-alive after
    /// `send` of silence, the receive side fails the link after `receive`.
    fn set_keep_alive(&self, send: Duration, receive: Duration);

    /// Close the link after queued telegrams were written. No `Closed`
    /// event is produced for a local close.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn is_loopback(&self) -> bool {
        self.remote_addr().map(|a| a.ip().is_loopback()).unwrap_or(false)
    }
}

/// Channel settings
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Silence after which a keep-alive is sent
    pub send_keep_alive: Duration,
    /// Silence after which the link is considered dead
    pub receive_keep_alive: Duration,
    /// How long a frame may wait for a pending encryption switch
    pub mode_switch_wait: Duration,
    /// Capacity of the event queue
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            send_keep_alive: Duration::from_secs(20),
            receive_keep_alive: Duration::from_secs(30),
            mode_switch_wait: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

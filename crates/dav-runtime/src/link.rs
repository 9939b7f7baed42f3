//! Narrow view of a live distributor link
//!
//! Router and subscription manager only need to know who is at the other
//! end of a link and how to hand it a telegram. They never own
//! connections.

use std::fmt;

use dav_core::{ConnectionId, DavResult, DistributorId, UserId};
use dav_wire::Telegram;

/// Established link to a neighbouring distributor
pub trait TransmitterLink: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn remote_id(&self) -> DistributorId;

    /// Configured weight ("throughput resistance") of the link
    fn weight(&self) -> u32;

    /// User the remote distributor authenticated as
    fn user_id(&self) -> UserId {
        UserId::SYSTEM
    }

    /// Queue a telegram, never blocks
    fn send_telegram(&self, telegram: Telegram) -> DavResult<()>;
}

impl fmt::Debug for dyn TransmitterLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({} via {})", self.remote_id(), self.connection_id())
    }
}

//! Connection and subscription state values shared by all layers

use std::fmt;

/// State of a link between two distributors, seen from one of them.
///
/// `NotConnected`, `UnusedReplacementConnection`, `Disabled`, `NotRelevant`
/// and `Listening` are quiescent states that only appear in status reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    /// Waiting for the next connect attempt
    NotConnected,
    /// Replacement link that is currently not needed
    UnusedReplacementConnection,
    /// Link administratively disabled
    Disabled,
    /// This distributor is not an endpoint of the link
    NotRelevant,
    /// Waiting for the remote side to connect
    Listening,
    /// Like `NotConnected`, but the last connection ended with an error
    Error,
    /// Transport being established
    Connecting,
    /// Authentication in progress
    Authenticating,
    /// Fully established
    Connected,
    /// Being torn down, subscriptions are being removed
    Disconnecting,
}

impl CommunicationState {
    pub fn label(self) -> &'static str {
        match self {
            CommunicationState::NotConnected => "not connected",
            CommunicationState::UnusedReplacementConnection => "replacement link (not connected)",
            CommunicationState::Disabled => "disabled (not connected)",
            CommunicationState::NotRelevant => "no configured link",
            CommunicationState::Listening => "waiting for incoming connection",
            CommunicationState::Error => "error",
            CommunicationState::Connecting => "connecting",
            CommunicationState::Authenticating => "authenticating",
            CommunicationState::Connected => "connected",
            CommunicationState::Disconnecting => "disconnecting",
        }
    }

    /// Whether a live socket backs this state
    pub fn is_live(self) -> bool {
        matches!(
            self,
            CommunicationState::Connecting
                | CommunicationState::Authenticating
                | CommunicationState::Connected
                | CommunicationState::Disconnecting
        )
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction in which a link was established
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    /// Accepted by this distributor
    Incoming,
    /// Initiated by this distributor
    Outgoing,
}

/// What a distributor-to-distributor subscription asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransmitterSubscriptionType {
    /// The subscriber has senders and looks for the drain
    Sender,
    /// The subscriber has receivers and looks for the source
    Receiver,
}

impl TransmitterSubscriptionType {
    pub fn to_byte(self) -> u8 {
        match self {
            TransmitterSubscriptionType::Sender => 0,
            TransmitterSubscriptionType::Receiver => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(TransmitterSubscriptionType::Sender),
            1 => Some(TransmitterSubscriptionType::Receiver),
            _ => None,
        }
    }
}

/// Receipt code on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiptCode {
    /// Responsible and allowed
    Positive,
    /// Not responsible
    Negative,
    /// Responsible, but the subscribing user lacks the rights
    PositiveNoRight,
    /// More than one distributor claims responsibility
    MoreThanOnePositive,
}

impl ReceiptCode {
    pub fn to_byte(self) -> u8 {
        match self {
            ReceiptCode::Negative => 0,
            ReceiptCode::Positive => 1,
            ReceiptCode::PositiveNoRight => 2,
            ReceiptCode::MoreThanOnePositive => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ReceiptCode::Negative),
            1 => Some(ReceiptCode::Positive),
            2 => Some(ReceiptCode::PositiveNoRight),
            3 => Some(ReceiptCode::MoreThanOnePositive),
            _ => None,
        }
    }
}

/// State of a subscription sent to another distributor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Sent, no receipt yet
    ToRemoteWaiting,
    /// The remote side found the central distributor
    ToRemoteOk,
    /// The remote side is not responsible
    ToRemoteNotResponsible,
    /// Central distributor found, but access was denied
    ToRemoteNotAllowed,
    /// The remote side sees more than one central distributor
    ToRemoteMultiple,
}

impl ConnectionState {
    pub fn from_receipt(code: ReceiptCode) -> Self {
        match code {
            ReceiptCode::Positive => ConnectionState::ToRemoteOk,
            ReceiptCode::Negative => ConnectionState::ToRemoteNotResponsible,
            ReceiptCode::PositiveNoRight => ConnectionState::ToRemoteNotAllowed,
            ReceiptCode::MoreThanOnePositive => ConnectionState::ToRemoteMultiple,
        }
    }

    /// Receipt code to send for this state. `None` while still waiting.
    pub fn receipt_code(self) -> Option<ReceiptCode> {
        match self {
            ConnectionState::ToRemoteWaiting => None,
            ConnectionState::ToRemoteOk => Some(ReceiptCode::Positive),
            ConnectionState::ToRemoteNotResponsible => Some(ReceiptCode::Negative),
            ConnectionState::ToRemoteNotAllowed => Some(ReceiptCode::PositiveNoRight),
            ConnectionState::ToRemoteMultiple => Some(ReceiptCode::MoreThanOnePositive),
        }
    }

    /// A central distributor was found (with or without rights)
    pub fn has_central(self) -> bool {
        matches!(
            self,
            ConnectionState::ToRemoteOk | ConnectionState::ToRemoteNotAllowed
        )
    }
}

/// State reported to a local sending application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SenderState {
    Unknown,
    ReceiversAvailable,
    NoReceivers,
    Waiting,
    NotAllowed,
    InvalidSubscription,
    NoRemoteDrain,
    MultipleRemoteLock,
}

impl SenderState {
    /// Whether data from this sender is accepted
    pub fn is_valid_sender(self) -> bool {
        matches!(
            self,
            SenderState::ReceiversAvailable | SenderState::NoReceivers | SenderState::Waiting
        )
    }
}

/// State reported to a local receiving application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    Unknown,
    SendersAvailable,
    NoSenders,
    Waiting,
    NotAllowed,
    InvalidSubscription,
    NoRemoteSource,
    MultipleRemoteLock,
}

//! Telegrams exchanged between distributors

use bytes::Bytes;

use dav_core::{BaseSubscriptionInfo, DistributorId, ReceiptCode, TransmitterSubscriptionType};

/// Telegram type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TelegramKind {
    ProtocolVersionRequest = 0x01,
    ProtocolVersionAnswer = 0x02,
    AuthenticationTextRequest = 0x03,
    AuthenticationTextAnswer = 0x04,
    AuthenticationRequest = 0x05,
    AuthenticationAnswer = 0x06,
    SrpRequest = 0x07,
    SrpAnswer = 0x08,
    SrpValidateRequest = 0x09,
    SrpValidateAnswer = 0x0A,
    DisableEncryptionRequest = 0x0B,
    DisableEncryptionAnswer = 0x0C,
    TransmitterRequest = 0x0D,
    ComParametersRequest = 0x0E,
    ComParametersAnswer = 0x0F,
    TelegramTimeRequest = 0x10,
    TelegramTimeAnswer = 0x11,
    Subscription = 0x20,
    Unsubscription = 0x21,
    SubscriptionReceipt = 0x22,
    BestWayUpdate = 0x23,
    ListsSubscription = 0x24,
    ListsUnsubscription = 0x25,
    ListsUpdate = 0x26,
    Data = 0x30,
    TerminateOrder = 0x40,
    Closing = 0x41,
    KeepAlive = 0x42,
}

impl TelegramKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        use TelegramKind::*;
        Some(match b {
            0x01 => ProtocolVersionRequest,
            0x02 => ProtocolVersionAnswer,
            0x03 => AuthenticationTextRequest,
            0x04 => AuthenticationTextAnswer,
            0x05 => AuthenticationRequest,
            0x06 => AuthenticationAnswer,
            0x07 => SrpRequest,
            0x08 => SrpAnswer,
            0x09 => SrpValidateRequest,
            0x0A => SrpValidateAnswer,
            0x0B => DisableEncryptionRequest,
            0x0C => DisableEncryptionAnswer,
            0x0D => TransmitterRequest,
            0x0E => ComParametersRequest,
            0x0F => ComParametersAnswer,
            0x10 => TelegramTimeRequest,
            0x11 => TelegramTimeAnswer,
            0x20 => Subscription,
            0x21 => Unsubscription,
            0x22 => SubscriptionReceipt,
            0x23 => BestWayUpdate,
            0x24 => ListsSubscription,
            0x25 => ListsUnsubscription,
            0x26 => ListsUpdate,
            0x30 => Data,
            0x40 => TerminateOrder,
            0x41 => Closing,
            0x42 => KeepAlive,
            _ => return None,
        })
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Routed telegrams that may arrive before the link finished its
    /// initialization. They are queued and replayed afterwards.
    pub fn is_early(self) -> bool {
        matches!(
            self,
            TelegramKind::Data
                | TelegramKind::Subscription
                | TelegramKind::Unsubscription
                | TelegramKind::SubscriptionReceipt
                | TelegramKind::BestWayUpdate
                | TelegramKind::ListsSubscription
                | TelegramKind::ListsUnsubscription
                | TelegramKind::ListsUpdate
        )
    }
}

/// Keep-alive and flow control parameters of a link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComParameters {
    /// Interval after which the sending side emits a keep-alive
    pub send_keep_alive_ms: u64,
    /// Silence after which the receiving side gives up
    pub receive_keep_alive_ms: u64,
    /// Send buffer fill level (percent) that triggers throughput checks
    pub cache_threshold_percent: u8,
    /// Interval between throughput checks
    pub flow_control_threshold_ms: u64,
    /// Minimum acceptable throughput in bytes per second
    pub min_connection_speed: u32,
}

/// One entry of a routing advertisement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingUpdate {
    pub destination: DistributorId,
    /// Cumulative cost, `None` when the destination became unreachable
    pub resistance: Option<u32>,
    /// Distributors the advertised path runs through, advertiser excluded
    pub involved: Vec<DistributorId>,
}

/// Subscription forwarded toward potential central distributors
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionTelegram {
    pub info: BaseSubscriptionInfo,
    pub kind: TransmitterSubscriptionType,
    pub distributors: Vec<DistributorId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsubscriptionTelegram {
    pub info: BaseSubscriptionInfo,
    pub kind: TransmitterSubscriptionType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptTelegram {
    pub info: BaseSubscriptionInfo,
    pub kind: TransmitterSubscriptionType,
    pub code: ReceiptCode,
    pub central: Option<DistributorId>,
}

/// Auxiliary metadata propagation (lists of objects served by a distributor)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListsTelegram {
    pub distributor: DistributorId,
    pub payload: Bytes,
}

/// One (possibly partial) data packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataTelegram {
    pub info: BaseSubscriptionInfo,
    pub data_index: u64,
    /// Zero-based fragment number
    pub telegram_number: u16,
    /// Number of fragments of the logical packet
    pub total_telegrams: u16,
    /// Travelling from a sender toward the central distributor
    pub toward_central: bool,
    pub error_flag: u8,
    pub payload: Bytes,
}

impl DataTelegram {
    pub fn is_fragmented(&self) -> bool {
        self.total_telegrams > 1
    }

    pub fn is_last_fragment(&self) -> bool {
        self.telegram_number + 1 == self.total_telegrams
    }
}

/// Every telegram a distributor link carries
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Telegram {
    ProtocolVersionRequest {
        versions: Vec<i32>,
    },
    /// `-1` when no proposed version is supported
    ProtocolVersionAnswer {
        version: i32,
    },
    AuthenticationTextRequest {
        distributor: DistributorId,
    },
    AuthenticationTextAnswer {
        text: String,
    },
    AuthenticationRequest {
        process: String,
        user: String,
        encrypted_password: Vec<u8>,
    },
    AuthenticationAnswer {
        success: bool,
        distributor: Option<DistributorId>,
    },
    /// `one_time_index` is `-1` for the permanent password
    SrpRequest {
        user: String,
        one_time_index: i32,
        a: Vec<u8>,
    },
    SrpAnswer {
        salt: Vec<u8>,
        b: Vec<u8>,
    },
    SrpValidateRequest {
        m1: Vec<u8>,
    },
    /// Empty `m2` signals a failed login
    SrpValidateAnswer {
        m2: Vec<u8>,
    },
    DisableEncryptionRequest,
    DisableEncryptionAnswer {
        disabled: bool,
    },
    TransmitterRequest {
        distributor: DistributorId,
    },
    ComParametersRequest(ComParameters),
    ComParametersAnswer(ComParameters),
    TelegramTimeRequest {
        start_time: u64,
    },
    TelegramTimeAnswer {
        start_time: u64,
    },
    Subscription(SubscriptionTelegram),
    Unsubscription(UnsubscriptionTelegram),
    SubscriptionReceipt(ReceiptTelegram),
    BestWayUpdate {
        updates: Vec<RoutingUpdate>,
    },
    ListsSubscription(ListsTelegram),
    ListsUnsubscription(ListsTelegram),
    ListsUpdate(ListsTelegram),
    Data(DataTelegram),
    TerminateOrder {
        message: String,
    },
    Closing {
        message: String,
    },
    KeepAlive,
}

impl Telegram {
    pub fn kind(&self) -> TelegramKind {
        match self {
            Telegram::ProtocolVersionRequest { .. } => TelegramKind::ProtocolVersionRequest,
            Telegram::ProtocolVersionAnswer { .. } => TelegramKind::ProtocolVersionAnswer,
            Telegram::AuthenticationTextRequest { .. } => TelegramKind::AuthenticationTextRequest,
            Telegram::AuthenticationTextAnswer { .. } => TelegramKind::AuthenticationTextAnswer,
            Telegram::AuthenticationRequest { .. } => TelegramKind::AuthenticationRequest,
            Telegram::AuthenticationAnswer { .. } => TelegramKind::AuthenticationAnswer,
            Telegram::SrpRequest { .. } => TelegramKind::SrpRequest,
            Telegram::SrpAnswer { .. } => TelegramKind::SrpAnswer,
            Telegram::SrpValidateRequest { .. } => TelegramKind::SrpValidateRequest,
            Telegram::SrpValidateAnswer { .. } => TelegramKind::SrpValidateAnswer,
            Telegram::DisableEncryptionRequest => TelegramKind::DisableEncryptionRequest,
            Telegram::DisableEncryptionAnswer { .. } => TelegramKind::DisableEncryptionAnswer,
            Telegram::TransmitterRequest { .. } => TelegramKind::TransmitterRequest,
            Telegram::ComParametersRequest(_) => TelegramKind::ComParametersRequest,
            Telegram::ComParametersAnswer(_) => TelegramKind::ComParametersAnswer,
            Telegram::TelegramTimeRequest { .. } => TelegramKind::TelegramTimeRequest,
            Telegram::TelegramTimeAnswer { .. } => TelegramKind::TelegramTimeAnswer,
            Telegram::Subscription(_) => TelegramKind::Subscription,
            Telegram::Unsubscription(_) => TelegramKind::Unsubscription,
            Telegram::SubscriptionReceipt(_) => TelegramKind::SubscriptionReceipt,
            Telegram::BestWayUpdate { .. } => TelegramKind::BestWayUpdate,
            Telegram::ListsSubscription(_) => TelegramKind::ListsSubscription,
            Telegram::ListsUnsubscription(_) => TelegramKind::ListsUnsubscription,
            Telegram::ListsUpdate(_) => TelegramKind::ListsUpdate,
            Telegram::Data(_) => TelegramKind::Data,
            Telegram::TerminateOrder { .. } => TelegramKind::TerminateOrder,
            Telegram::Closing { .. } => TelegramKind::Closing,
            Telegram::KeepAlive => TelegramKind::KeepAlive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bytes_are_stable() {
        for b in 0u8..=0xFF {
            if let Some(kind) = TelegramKind::from_byte(b) {
                assert_eq!(kind.to_byte(), b);
            }
        }
        assert_eq!(TelegramKind::from_byte(0x00), None);
    }

    #[test]
    fn test_early_telegrams() {
        assert!(TelegramKind::Data.is_early());
        assert!(TelegramKind::BestWayUpdate.is_early());
        assert!(!TelegramKind::SrpRequest.is_early());
        assert!(!TelegramKind::KeepAlive.is_early());
    }

    #[test]
    fn test_last_fragment() {
        let telegram = DataTelegram {
            info: BaseSubscriptionInfo::new(1, 1, 0),
            data_index: 1,
            telegram_number: 2,
            total_telegrams: 3,
            toward_central: false,
            error_flag: 0,
            payload: Bytes::new(),
        };
        assert!(telegram.is_fragmented());
        assert!(telegram.is_last_fragment());
    }
}

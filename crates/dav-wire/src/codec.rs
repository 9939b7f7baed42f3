//! Binary encoding of telegram bodies
//!
//! Body = type tag (1 byte) + fields. Integers are little endian, strings
//! are UTF-8 with a u16 length prefix, byte blobs carry a u32 length prefix
//! and id lists a u16 count.

use bytes::{Buf, BufMut, Bytes};

use dav_core::{
    BaseSubscriptionInfo, DavError, DavResult, DistributorId, ReceiptCode,
    TransmitterSubscriptionType,
};

use crate::{
    ComParameters, DataTelegram, ListsTelegram, ReceiptTelegram, RoutingUpdate,
    SubscriptionTelegram, Telegram, TelegramKind, UnsubscriptionTelegram,
};

impl Telegram {
    /// Encode the telegram body (without frame header)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.put_u8(self.kind().to_byte());

        match self {
            Telegram::ProtocolVersionRequest { versions } => {
                buf.put_u16_le(versions.len() as u16);
                for v in versions {
                    buf.put_i32_le(*v);
                }
            }
            Telegram::ProtocolVersionAnswer { version } => buf.put_i32_le(*version),
            Telegram::AuthenticationTextRequest { distributor } => put_id(&mut buf, *distributor),
            Telegram::AuthenticationTextAnswer { text } => put_str(&mut buf, text),
            Telegram::AuthenticationRequest {
                process,
                user,
                encrypted_password,
            } => {
                put_str(&mut buf, process);
                put_str(&mut buf, user);
                put_blob(&mut buf, encrypted_password);
            }
            Telegram::AuthenticationAnswer {
                success,
                distributor,
            } => {
                buf.put_u8(*success as u8);
                put_opt_id(&mut buf, *distributor);
            }
            Telegram::SrpRequest {
                user,
                one_time_index,
                a,
            } => {
                put_str(&mut buf, user);
                buf.put_i32_le(*one_time_index);
                put_blob(&mut buf, a);
            }
            Telegram::SrpAnswer { salt, b } => {
                put_blob(&mut buf, salt);
                put_blob(&mut buf, b);
            }
            Telegram::SrpValidateRequest { m1 } => put_blob(&mut buf, m1),
            Telegram::SrpValidateAnswer { m2 } => put_blob(&mut buf, m2),
            Telegram::DisableEncryptionRequest => {}
            Telegram::DisableEncryptionAnswer { disabled } => buf.put_u8(*disabled as u8),
            Telegram::TransmitterRequest { distributor } => put_id(&mut buf, *distributor),
            Telegram::ComParametersRequest(p) | Telegram::ComParametersAnswer(p) => {
                buf.put_u64_le(p.send_keep_alive_ms);
                buf.put_u64_le(p.receive_keep_alive_ms);
                buf.put_u8(p.cache_threshold_percent);
                buf.put_u64_le(p.flow_control_threshold_ms);
                buf.put_u32_le(p.min_connection_speed);
            }
            Telegram::TelegramTimeRequest { start_time }
            | Telegram::TelegramTimeAnswer { start_time } => buf.put_u64_le(*start_time),
            Telegram::Subscription(t) => {
                put_info(&mut buf, t.info);
                buf.put_u8(t.kind.to_byte());
                put_ids(&mut buf, &t.distributors);
            }
            Telegram::Unsubscription(t) => {
                put_info(&mut buf, t.info);
                buf.put_u8(t.kind.to_byte());
            }
            Telegram::SubscriptionReceipt(t) => {
                put_info(&mut buf, t.info);
                buf.put_u8(t.kind.to_byte());
                buf.put_u8(t.code.to_byte());
                put_opt_id(&mut buf, t.central);
            }
            Telegram::BestWayUpdate { updates } => {
                buf.put_u16_le(updates.len() as u16);
                for u in updates {
                    put_id(&mut buf, u.destination);
                    // Unreachable is encoded as -1
                    buf.put_i64_le(u.resistance.map(i64::from).unwrap_or(-1));
                    put_ids(&mut buf, &u.involved);
                }
            }
            Telegram::ListsSubscription(t)
            | Telegram::ListsUnsubscription(t)
            | Telegram::ListsUpdate(t) => {
                put_id(&mut buf, t.distributor);
                put_blob(&mut buf, &t.payload);
            }
            Telegram::Data(t) => {
                put_info(&mut buf, t.info);
                buf.put_u64_le(t.data_index);
                buf.put_u16_le(t.telegram_number);
                buf.put_u16_le(t.total_telegrams);
                buf.put_u8(t.toward_central as u8);
                buf.put_u8(t.error_flag);
                put_blob(&mut buf, &t.payload);
            }
            Telegram::TerminateOrder { message } | Telegram::Closing { message } => {
                put_str(&mut buf, message)
            }
            Telegram::KeepAlive => {}
        }

        buf
    }

    /// Decode a telegram body
    pub fn decode(body: &[u8]) -> DavResult<Telegram> {
        let mut r = WireReader::new(body);
        let tag = r.u8()?;
        let kind = TelegramKind::from_byte(tag).ok_or(DavError::UnknownTelegramType(tag))?;

        let telegram = match kind {
            TelegramKind::ProtocolVersionRequest => {
                let count = r.u16()? as usize;
                let mut versions = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    versions.push(r.i32()?);
                }
                Telegram::ProtocolVersionRequest { versions }
            }
            TelegramKind::ProtocolVersionAnswer => {
                Telegram::ProtocolVersionAnswer { version: r.i32()? }
            }
            TelegramKind::AuthenticationTextRequest => Telegram::AuthenticationTextRequest {
                distributor: r.id()?,
            },
            TelegramKind::AuthenticationTextAnswer => {
                Telegram::AuthenticationTextAnswer { text: r.string()? }
            }
            TelegramKind::AuthenticationRequest => Telegram::AuthenticationRequest {
                process: r.string()?,
                user: r.string()?,
                encrypted_password: r.blob()?.to_vec(),
            },
            TelegramKind::AuthenticationAnswer => Telegram::AuthenticationAnswer {
                success: r.bool()?,
                distributor: r.opt_id()?,
            },
            TelegramKind::SrpRequest => Telegram::SrpRequest {
                user: r.string()?,
                one_time_index: r.i32()?,
                a: r.blob()?.to_vec(),
            },
            TelegramKind::SrpAnswer => Telegram::SrpAnswer {
                salt: r.blob()?.to_vec(),
                b: r.blob()?.to_vec(),
            },
            TelegramKind::SrpValidateRequest => Telegram::SrpValidateRequest {
                m1: r.blob()?.to_vec(),
            },
            TelegramKind::SrpValidateAnswer => Telegram::SrpValidateAnswer {
                m2: r.blob()?.to_vec(),
            },
            TelegramKind::DisableEncryptionRequest => Telegram::DisableEncryptionRequest,
            TelegramKind::DisableEncryptionAnswer => Telegram::DisableEncryptionAnswer {
                disabled: r.bool()?,
            },
            TelegramKind::TransmitterRequest => Telegram::TransmitterRequest {
                distributor: r.id()?,
            },
            TelegramKind::ComParametersRequest => Telegram::ComParametersRequest(r.com_parameters()?),
            TelegramKind::ComParametersAnswer => Telegram::ComParametersAnswer(r.com_parameters()?),
            TelegramKind::TelegramTimeRequest => Telegram::TelegramTimeRequest {
                start_time: r.u64()?,
            },
            TelegramKind::TelegramTimeAnswer => Telegram::TelegramTimeAnswer {
                start_time: r.u64()?,
            },
            TelegramKind::Subscription => Telegram::Subscription(SubscriptionTelegram {
                info: r.info()?,
                kind: r.subscription_type()?,
                distributors: r.ids()?,
            }),
            TelegramKind::Unsubscription => Telegram::Unsubscription(UnsubscriptionTelegram {
                info: r.info()?,
                kind: r.subscription_type()?,
            }),
            TelegramKind::SubscriptionReceipt => {
                let info = r.info()?;
                let kind = r.subscription_type()?;
                let code_byte = r.u8()?;
                let code = ReceiptCode::from_byte(code_byte).ok_or_else(|| {
                    DavError::InvalidWireFormat(format!("Unknown receipt code {}", code_byte))
                })?;
                Telegram::SubscriptionReceipt(ReceiptTelegram {
                    info,
                    kind,
                    code,
                    central: r.opt_id()?,
                })
            }
            TelegramKind::BestWayUpdate => {
                let count = r.u16()? as usize;
                let mut updates = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let destination = r.id()?;
                    let raw = r.i64()?;
                    let resistance = if raw < 0 {
                        None
                    } else {
                        Some(u32::try_from(raw).map_err(|_| {
                            DavError::InvalidWireFormat(format!("Resistance out of range: {}", raw))
                        })?)
                    };
                    updates.push(RoutingUpdate {
                        destination,
                        resistance,
                        involved: r.ids()?,
                    });
                }
                Telegram::BestWayUpdate { updates }
            }
            TelegramKind::ListsSubscription => Telegram::ListsSubscription(r.lists()?),
            TelegramKind::ListsUnsubscription => Telegram::ListsUnsubscription(r.lists()?),
            TelegramKind::ListsUpdate => Telegram::ListsUpdate(r.lists()?),
            TelegramKind::Data => Telegram::Data(DataTelegram {
                info: r.info()?,
                data_index: r.u64()?,
                telegram_number: r.u16()?,
                total_telegrams: r.u16()?,
                toward_central: r.bool()?,
                error_flag: r.u8()?,
                payload: Bytes::copy_from_slice(r.blob()?),
            }),
            TelegramKind::TerminateOrder => Telegram::TerminateOrder {
                message: r.string()?,
            },
            TelegramKind::Closing => Telegram::Closing {
                message: r.string()?,
            },
            TelegramKind::KeepAlive => Telegram::KeepAlive,
        };

        if r.remaining() != 0 {
            return Err(DavError::InvalidWireFormat(format!(
                "{} trailing bytes after {:?}",
                r.remaining(),
                kind
            )));
        }

        if let Telegram::Data(data) = &telegram {
            if data.total_telegrams == 0 || data.telegram_number >= data.total_telegrams {
                return Err(DavError::InvalidWireFormat(format!(
                    "Fragment {} of {} out of range",
                    data.telegram_number, data.total_telegrams
                )));
            }
        }

        Ok(telegram)
    }
}

fn put_id(buf: &mut Vec<u8>, id: DistributorId) {
    buf.put_slice(&id.to_bytes());
}

fn put_opt_id(buf: &mut Vec<u8>, id: Option<DistributorId>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            put_id(buf, id);
        }
        None => buf.put_u8(0),
    }
}

fn put_ids(buf: &mut Vec<u8>, ids: &[DistributorId]) {
    buf.put_u16_le(ids.len() as u16);
    for id in ids {
        put_id(buf, *id);
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut Vec<u8>, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

fn put_info(buf: &mut Vec<u8>, info: BaseSubscriptionInfo) {
    buf.put_slice(&info.to_bytes());
}

/// Bounds-checked reader over a telegram body
struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        WireReader { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> DavResult<()> {
        if self.buf.remaining() < n {
            return Err(DavError::BufferTooShort {
                expected: n,
                actual: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> DavResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> DavResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DavError::InvalidWireFormat(format!("Invalid boolean {}", b))),
        }
    }

    fn u16(&mut self) -> DavResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i32(&mut self) -> DavResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u32(&mut self) -> DavResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> DavResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> DavResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn take(&mut self, n: usize) -> DavResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn blob(&mut self) -> DavResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> DavResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DavError::InvalidWireFormat("Invalid UTF-8 string".into()))
    }

    fn id(&mut self) -> DavResult<DistributorId> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(DistributorId::from_bytes(raw))
    }

    fn opt_id(&mut self) -> DavResult<Option<DistributorId>> {
        if self.bool()? {
            Ok(Some(self.id()?))
        } else {
            Ok(None)
        }
    }

    fn ids(&mut self) -> DavResult<Vec<DistributorId>> {
        let count = self.u16()? as usize;
        self.need(count * 8)?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.id()?);
        }
        Ok(ids)
    }

    fn info(&mut self) -> DavResult<BaseSubscriptionInfo> {
        let bytes = self.take(BaseSubscriptionInfo::WIRE_SIZE)?;
        let mut raw = [0u8; BaseSubscriptionInfo::WIRE_SIZE];
        raw.copy_from_slice(bytes);
        Ok(BaseSubscriptionInfo::from_bytes(raw))
    }

    fn subscription_type(&mut self) -> DavResult<TransmitterSubscriptionType> {
        let b = self.u8()?;
        TransmitterSubscriptionType::from_byte(b)
            .ok_or_else(|| DavError::InvalidWireFormat(format!("Unknown subscription type {}", b)))
    }

    fn com_parameters(&mut self) -> DavResult<ComParameters> {
        Ok(ComParameters {
            send_keep_alive_ms: self.u64()?,
            receive_keep_alive_ms: self.u64()?,
            cache_threshold_percent: self.u8()?,
            flow_control_threshold_ms: self.u64()?,
            min_connection_speed: self.u32()?,
        })
    }

    fn lists(&mut self) -> DavResult<ListsTelegram> {
        Ok(ListsTelegram {
            distributor: self.id()?,
            payload: Bytes::copy_from_slice(self.blob()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info() -> BaseSubscriptionInfo {
        BaseSubscriptionInfo::new(99, 7, 0)
    }

    #[test]
    fn test_routing_update_encoding() {
        let telegram = Telegram::BestWayUpdate {
            updates: vec![
                RoutingUpdate {
                    destination: DistributorId::new(3),
                    resistance: Some(7),
                    involved: vec![DistributorId::new(2), DistributorId::new(3)],
                },
                RoutingUpdate {
                    destination: DistributorId::new(4),
                    resistance: None,
                    involved: vec![],
                },
            ],
        };

        let bytes = telegram.encode();
        assert_eq!(bytes[0], TelegramKind::BestWayUpdate.to_byte());
        assert_eq!(Telegram::decode(&bytes).unwrap(), telegram);
    }

    #[test]
    fn test_receipt_without_central() {
        let telegram = Telegram::SubscriptionReceipt(ReceiptTelegram {
            info: info(),
            kind: TransmitterSubscriptionType::Receiver,
            code: ReceiptCode::Negative,
            central: None,
        });
        assert_eq!(Telegram::decode(&telegram.encode()).unwrap(), telegram);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let telegram = Telegram::SrpRequest {
            user: "dav1".into(),
            one_time_index: -1,
            a: vec![1; 64],
        };
        let bytes = telegram.encode();
        let result = Telegram::decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(DavError::BufferTooShort { .. })));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Telegram::KeepAlive.encode();
        bytes.push(0);
        assert!(Telegram::decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            Telegram::decode(&[0xEE]),
            Err(DavError::UnknownTelegramType(0xEE))
        );
    }

    #[test]
    fn test_fragment_number_validated() {
        let telegram = Telegram::Data(DataTelegram {
            info: info(),
            data_index: 1,
            telegram_number: 3,
            total_telegrams: 3,
            toward_central: true,
            error_flag: 0,
            payload: Bytes::from_static(b"x"),
        });
        assert!(Telegram::decode(&telegram.encode()).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Telegram::decode(&body);
        }

        #[test]
        fn prop_data_telegram_survives_encoding(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            index in any::<u64>(),
            total in 1u16..50,
        ) {
            let telegram = Telegram::Data(DataTelegram {
                info: info(),
                data_index: index,
                telegram_number: total - 1,
                total_telegrams: total,
                toward_central: false,
                error_flag: 0,
                payload: Bytes::from(payload),
            });
            prop_assert_eq!(Telegram::decode(&telegram.encode()).unwrap(), telegram);
        }
    }
}

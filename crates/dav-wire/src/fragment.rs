//! Splitting of data packets that exceed one frame

use bytes::{Bytes, BytesMut};

use dav_core::{BaseSubscriptionInfo, DavError, DavResult};

use crate::DataTelegram;

/// Largest payload carried by one data telegram
pub const MAX_DATA_FRAGMENT_SIZE: usize = 4096;

/// Split a logical data packet into fragment telegrams of at most
/// `max_fragment` payload bytes each. An empty payload still yields one
/// telegram.
pub fn split_data(
    info: BaseSubscriptionInfo,
    data_index: u64,
    toward_central: bool,
    error_flag: u8,
    payload: Bytes,
    max_fragment: usize,
) -> DavResult<Vec<DataTelegram>> {
    let max_fragment = max_fragment.max(1);
    let count = payload.len().div_ceil(max_fragment).max(1);
    let total = u16::try_from(count).map_err(|_| DavError::FrameTooLarge {
        size: payload.len(),
        max: max_fragment * u16::MAX as usize,
    })?;

    let mut fragments = Vec::with_capacity(count);
    for number in 0..total {
        let start = number as usize * max_fragment;
        let end = (start + max_fragment).min(payload.len());
        fragments.push(DataTelegram {
            info,
            data_index,
            telegram_number: number,
            total_telegrams: total,
            toward_central,
            error_flag,
            payload: payload.slice(start..end),
        });
    }
    Ok(fragments)
}

/// Concatenate the payloads of a complete, ordered fragment list
pub fn join_fragments(fragments: &[DataTelegram]) -> DavResult<Bytes> {
    let first = fragments
        .first()
        .ok_or_else(|| DavError::InvalidWireFormat("Empty fragment list".into()))?;

    if fragments.len() != first.total_telegrams as usize {
        return Err(DavError::InvalidWireFormat(format!(
            "Expected {} fragments, got {}",
            first.total_telegrams,
            fragments.len()
        )));
    }
    if fragments.len() == 1 {
        return Ok(first.payload.clone());
    }

    let size = fragments.iter().map(|f| f.payload.len()).sum();
    let mut buf = BytesMut::with_capacity(size);
    for (expected, fragment) in fragments.iter().enumerate() {
        if fragment.telegram_number as usize != expected || fragment.info != first.info {
            return Err(DavError::InvalidWireFormat(format!(
                "Fragment {} out of sequence at position {}",
                fragment.telegram_number, expected
            )));
        }
        buf.extend_from_slice(&fragment.payload);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info() -> BaseSubscriptionInfo {
        BaseSubscriptionInfo::new(5, 6, 0)
    }

    #[test]
    fn test_small_packet_single_fragment() {
        let fragments = split_data(info(), 1, false, 0, Bytes::from_static(b"abc"), 16).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].total_telegrams, 1);
        assert!(!fragments[0].is_fragmented());
    }

    #[test]
    fn test_empty_packet() {
        let fragments = split_data(info(), 1, false, 0, Bytes::new(), 16).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(join_fragments(&fragments).unwrap(), Bytes::new());
    }

    #[test]
    fn test_exact_multiple() {
        let fragments = split_data(info(), 9, true, 0, Bytes::from(vec![1u8; 32]), 16).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments[1].is_last_fragment());
        assert!(fragments.iter().all(|f| f.toward_central && f.data_index == 9));
    }

    #[test]
    fn test_join_rejects_gaps() {
        let mut fragments = split_data(info(), 1, false, 0, Bytes::from(vec![7u8; 40]), 16).unwrap();
        fragments.swap(0, 1);
        assert!(join_fragments(&fragments).is_err());
        fragments.truncate(1);
        assert!(join_fragments(&fragments).is_err());
    }

    proptest! {
        #[test]
        fn prop_split_then_join(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            max in 1usize..300,
        ) {
            let fragments = split_data(info(), 3, false, 0, Bytes::from(payload.clone()), max).unwrap();
            prop_assert!(fragments.iter().all(|f| f.payload.len() <= max));
            prop_assert_eq!(join_fragments(&fragments).unwrap().to_vec(), payload);
        }
    }
}

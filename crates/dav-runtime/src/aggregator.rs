//! Reassembly of fragmented data packets
//!
//! Fragments of one logical packet arrive in wire order on one connection.
//! The first fragment opens a buffer, every further fragment must carry the
//! next number, the last fragment hands out the whole list. Anything out of
//! sequence drops the packet.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use dav_wire::DataTelegram;

/// Outcome of feeding one fragment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// All fragments of a packet, in order
    Complete(Vec<DataTelegram>),
    /// More fragments expected
    Pending,
    /// Sequence error, the packet is lost
    Discarded,
}

/// Per-key fragment buffers
///
/// Not thread safe on purpose: callers feed fragments of one key from a
/// single task.
#[derive(Debug)]
pub struct TelegramAggregator<K> {
    buffers: HashMap<K, Vec<DataTelegram>>,
}

impl<K: Hash + Eq + Debug> Default for TelegramAggregator<K> {
    fn default() -> Self {
        TelegramAggregator {
            buffers: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Debug> TelegramAggregator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&mut self, key: K, telegram: DataTelegram) -> Aggregation {
        let total = telegram.total_telegrams as usize;
        if total <= 1 {
            return Aggregation::Complete(vec![telegram]);
        }

        let number = telegram.telegram_number as usize;
        if number == 0 {
            let mut buffer = Vec::with_capacity(total);
            buffer.push(telegram);
            if let Some(stale) = self.buffers.insert(key, buffer) {
                tracing::warn!(
                    "new packet started before the previous one was complete, {} fragments dropped",
                    stale.len()
                );
            }
            return Aggregation::Pending;
        }

        if number >= total {
            tracing::warn!("fragment {} of {} for {:?} is out of range", number, total, key);
            self.buffers.remove(&key);
            return Aggregation::Discarded;
        }

        let Some(buffer) = self.buffers.get_mut(&key) else {
            tracing::warn!("fragment {} of {:?} arrived without the first fragment", number, key);
            return Aggregation::Discarded;
        };
        if number != buffer.len() || buffer[0].total_telegrams as usize != total {
            tracing::warn!(
                "fragments of {:?} out of order: got {}, expected {}",
                key,
                number,
                buffer.len()
            );
            self.buffers.remove(&key);
            return Aggregation::Discarded;
        }

        buffer.push(telegram);
        if number + 1 < total {
            return Aggregation::Pending;
        }
        match self.buffers.remove(&key) {
            Some(complete) => Aggregation::Complete(complete),
            None => Aggregation::Discarded,
        }
    }

    /// Packets currently being reassembled
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dav_core::BaseSubscriptionInfo;
    use dav_wire::{join_fragments, split_data};
    use proptest::prelude::*;

    fn info() -> BaseSubscriptionInfo {
        BaseSubscriptionInfo::new(1, 2, 0)
    }

    fn fragments(len: usize, max: usize) -> (Bytes, Vec<DataTelegram>) {
        let payload: Bytes = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let parts = split_data(info(), 9, false, 0, payload.clone(), max).unwrap();
        (payload, parts)
    }

    #[test]
    fn test_single_fragment_passes_through() {
        let mut aggregator = TelegramAggregator::new();
        let (_, parts) = fragments(10, 100);
        assert_eq!(parts.len(), 1);
        assert_eq!(
            aggregator.aggregate(info(), parts[0].clone()),
            Aggregation::Complete(parts.clone())
        );
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn test_in_order() {
        let mut aggregator = TelegramAggregator::new();
        let (payload, parts) = fragments(250, 100);
        assert_eq!(parts.len(), 3);
        assert_eq!(aggregator.aggregate(info(), parts[0].clone()), Aggregation::Pending);
        assert_eq!(aggregator.aggregate(info(), parts[1].clone()), Aggregation::Pending);
        match aggregator.aggregate(info(), parts[2].clone()) {
            Aggregation::Complete(list) => assert_eq!(join_fragments(&list).unwrap(), payload),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn test_out_of_order_discards_buffer() {
        let mut aggregator = TelegramAggregator::new();
        let (_, parts) = fragments(400, 100);
        assert_eq!(aggregator.aggregate(info(), parts[0].clone()), Aggregation::Pending);
        assert_eq!(aggregator.aggregate(info(), parts[2].clone()), Aggregation::Discarded);
        assert_eq!(aggregator.pending(), 0);
        // The rest of the packet cannot complete anymore
        assert_eq!(aggregator.aggregate(info(), parts[3].clone()), Aggregation::Discarded);
    }

    #[test]
    fn test_last_without_first() {
        let mut aggregator = TelegramAggregator::new();
        let (_, parts) = fragments(200, 100);
        assert_eq!(aggregator.aggregate(info(), parts[1].clone()), Aggregation::Discarded);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut aggregator = TelegramAggregator::new();
        let (_, parts) = fragments(200, 100);
        assert_eq!(aggregator.aggregate((info(), true), parts[0].clone()), Aggregation::Pending);
        assert_eq!(aggregator.aggregate((info(), false), parts[0].clone()), Aggregation::Pending);
        assert_eq!(aggregator.pending(), 2);
        assert!(matches!(
            aggregator.aggregate((info(), true), parts[1].clone()),
            Aggregation::Complete(_)
        ));
        assert_eq!(aggregator.pending(), 1);
    }

    proptest! {
        #[test]
        fn prop_reassembles_in_order(len in 0usize..2000, max in 1usize..300) {
            let mut aggregator = TelegramAggregator::new();
            let (payload, parts) = fragments(len, max);
            let count = parts.len();
            let mut result = None;
            for (i, part) in parts.into_iter().enumerate() {
                match aggregator.aggregate(info(), part) {
                    Aggregation::Complete(list) => {
                        prop_assert_eq!(i + 1, count);
                        result = Some(list);
                    }
                    Aggregation::Pending => prop_assert!(i + 1 < count),
                    Aggregation::Discarded => prop_assert!(false, "discarded"),
                }
            }
            let list = result.unwrap();
            prop_assert_eq!(join_fragments(&list).unwrap(), payload);
        }

        #[test]
        fn prop_skipped_fragment_never_completes(len in 300usize..2000, skip_seed in any::<usize>()) {
            let mut aggregator = TelegramAggregator::new();
            let (_, parts) = fragments(len, 100);
            let skip = 1 + skip_seed % (parts.len() - 1);
            for (i, part) in parts.into_iter().enumerate() {
                if i == skip {
                    continue;
                }
                let outcome = aggregator.aggregate(info(), part);
                prop_assert!(!matches!(outcome, Aggregation::Complete(_)));
            }
        }
    }
}

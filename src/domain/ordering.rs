//! Stable chain ordering for deterministic processing.

/// Ordering key for anything positioned in the chain by (block, log index).
///
/// Ordering: block_number -> log_index -> tx_hash.
/// Log indices are unique within a block, so tx_hash only breaks ties on
/// malformed input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainOrderKey {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: String,
}

/// Types that carry a chain position.
pub trait ChainOrdered {
    fn chain_order_key(&self) -> ChainOrderKey;
}

impl ChainOrdered for crate::domain::Trade {
    fn chain_order_key(&self) -> ChainOrderKey {
        ChainOrderKey {
            block_number: self.block_number.as_u64(),
            log_index: self.log_index,
            tx_hash: self.tx_hash.clone(),
        }
    }
}

/// Sort items deterministically in chain order.
pub fn sort_chain_order<T: ChainOrdered>(items: &mut [T]) {
    items.sort_by_cached_key(|item| item.chain_order_key());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pos(u64, u64, &'static str);

    impl ChainOrdered for Pos {
        fn chain_order_key(&self) -> ChainOrderKey {
            ChainOrderKey {
                block_number: self.0,
                log_index: self.1,
                tx_hash: self.2.to_string(),
            }
        }
    }

    #[test]
    fn test_block_then_log_index() {
        let mut items = vec![Pos(11, 0, "0xb"), Pos(10, 5, "0xa"), Pos(10, 2, "0xc")];
        sort_chain_order(&mut items);
        let order: Vec<(u64, u64)> = items.iter().map(|p| (p.0, p.1)).collect();
        assert_eq!(order, vec![(10, 2), (10, 5), (11, 0)]);
    }

    #[test]
    fn test_tx_hash_breaks_ties() {
        let mut items = vec![Pos(1, 1, "0xff"), Pos(1, 1, "0x01")];
        sort_chain_order(&mut items);
        assert_eq!(items[0].2, "0x01");
    }
}

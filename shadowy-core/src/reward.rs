/// Satoshi scale of the native coin.
pub const SATOSHIS_PER_SHADOW: u64 = 100_000_000;

/// Hard cap on total SHADOW issuance.
pub const MAX_SATOSHIS: u64 = 21_000_000 * SATOSHIS_PER_SHADOW;

pub const INITIAL_BLOCK_REWARD: u64 = 50 * SATOSHIS_PER_SHADOW;
pub const HALVING_INTERVAL: u64 = 210_000;

/// Flat SHADOW fee burned on pool creation.
pub const POOL_CREATION_FEE: u64 = 5 * SATOSHIS_PER_SHADOW;

/// Flat SHADOW fee burned on trade-offer NFT creation.
pub const TRADE_NFT_CREATION_FEE: u64 = SATOSHIS_PER_SHADOW / 10;

/// Coinbase reward at `height`: `initial >> (height / interval)`, flooring
/// at zero once the shift exhausts the mantissa.
pub fn block_reward(height: u64, initial: u64, halving_interval: u64) -> u64 {
    if halving_interval == 0 {
        return initial;
    }
    let halvings = height / halving_interval;
    initial.checked_shr(halvings as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_schedule_boundaries() {
        let initial = 50 * SATOSHIS_PER_SHADOW;
        assert_eq!(block_reward(0, initial, 210_000), initial);
        assert_eq!(block_reward(210_000 - 1, initial, 210_000), initial);
        assert_eq!(block_reward(210_000, initial, 210_000), initial / 2);
        assert_eq!(block_reward(210_000 * 64, initial, 210_000), 0);
    }

    #[test]
    fn reward_eventually_floors_at_zero() {
        let mut height = 0;
        loop {
            let r = block_reward(height, INITIAL_BLOCK_REWARD, HALVING_INTERVAL);
            if r == 0 {
                break;
            }
            height += HALVING_INTERVAL;
            assert!(height < HALVING_INTERVAL * 100, "reward never reached zero");
        }
    }
}

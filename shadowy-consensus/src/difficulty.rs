use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// 256-bit PoST target for a leading-zero-bits difficulty: the largest
/// acceptable XOR score is `MAX >> bits`.
pub fn target_from_bits(bits: u32) -> [u8; 32] {
    let mut target = [0xffu8; 32];
    let full_bytes = (bits / 8) as usize;
    let partial = bits % 8;
    for byte in target.iter_mut().take(full_bytes.min(32)) {
        *byte = 0;
    }
    if full_bytes < 32 && partial > 0 {
        target[full_bytes] = 0xff >> partial;
    }
    target
}

/// Big-endian comparison of a plot score against the target threshold.
pub fn score_meets_target(score: &[u8; 32], target: &[u8; 32]) -> bool {
    score <= target
}

/// Retarget at interval boundaries: compare the observed span of the last
/// window against the expected span and move difficulty by at most two bits
/// per step. More zero bits demanded means a harder chain.
pub fn retarget(
    current_bits: u32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    interval: u64,
    target_block_time: Duration,
) -> u32 {
    if interval == 0 {
        return current_bits;
    }
    let expected = target_block_time * interval as i32;
    let observed = window_end - window_start;
    if observed <= Duration::zero() || expected <= Duration::zero() {
        return current_bits;
    }

    let step = if observed * 4 <= expected {
        2
    } else if observed * 2 <= expected {
        1
    } else if observed >= expected * 4 {
        -2
    } else if observed >= expected * 2 {
        -1
    } else {
        0
    };
    let next = current_bits.saturating_add_signed(step).min(255);
    if next != current_bits {
        info!(
            current_bits,
            next,
            observed_secs = observed.num_seconds(),
            expected_secs = expected.num_seconds(),
            "difficulty retargeted"
        );
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn target_shapes() {
        assert_eq!(target_from_bits(0), [0xff; 32]);
        let t8 = target_from_bits(8);
        assert_eq!(t8[0], 0);
        assert_eq!(t8[1], 0xff);
        let t12 = target_from_bits(12);
        assert_eq!(t12[0], 0);
        assert_eq!(t12[1], 0x0f);
        assert_eq!(t12[2], 0xff);
    }

    #[test]
    fn score_comparison_is_big_endian() {
        let target = target_from_bits(8);
        let mut passing = [0xffu8; 32];
        passing[0] = 0;
        assert!(score_meets_target(&passing, &target));
        let mut failing = [0u8; 32];
        failing[0] = 1;
        assert!(!score_meets_target(&failing, &target));
    }

    #[test]
    fn retarget_moves_toward_spacing() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let spacing = Duration::seconds(600);
        // blocks came in four times too fast: difficulty up two bits
        assert_eq!(
            retarget(12, start, start + Duration::seconds(600 * 144 / 4), 144, spacing),
            14
        );
        // twice too slow: difficulty down one bit
        assert_eq!(
            retarget(12, start, start + Duration::seconds(600 * 144 * 2), 144, spacing),
            11
        );
        // on pace: unchanged
        assert_eq!(
            retarget(12, start, start + Duration::seconds(600 * 144), 144, spacing),
            12
        );
    }
}

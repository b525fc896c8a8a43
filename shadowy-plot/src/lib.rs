pub mod farm;
pub mod format;
pub mod plot;

use shadowy_core::Hash32;
use thiserror::Error;

pub use farm::{Farm, FarmCandidate};
pub use format::{create_plot, PLOT_MAGIC, PLOT_VERSION};
pub use plot::{PlotCandidate, PlotHandle};

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("plot i/o: {0}")]
    FileIo(#[from] std::io::Error),
    #[error("not a plot file (bad magic)")]
    BadMagic,
    #[error("unsupported plot version {0}")]
    UnsupportedVersion(u32),
    #[error("plot file truncated")]
    Truncated,
    #[error("corrupt plot header: {0}")]
    CorruptHeader(String),
    #[error("corrupt entry {identifier}: {reason}")]
    CorruptEntry { identifier: Hash32, reason: String },
    #[error("identifier {0} not present in plot")]
    UnknownIdentifier(Hash32),
    #[error("blob encoding: {0}")]
    BlobEncoding(String),
}

/// Standalone difficulty check: an identifier passes when it has at least
/// `difficulty_bits` leading zero bits.
pub fn verify_identifier(identifier: &Hash32, difficulty_bits: u32) -> bool {
    identifier.leading_zero_bits() >= difficulty_bits
}

/// Gaps in a height set, as inclusive ranges. Input need not be sorted;
/// heights above the maximum present are not reported.
pub fn scan_missing_ranges(available_heights: &[u64]) -> Vec<(u64, u64)> {
    if available_heights.is_empty() {
        return Vec::new();
    }
    let mut heights: Vec<u64> = available_heights.to_vec();
    heights.sort_unstable();
    heights.dedup();

    let mut missing = Vec::new();
    let mut expected = 0u64;
    for height in heights {
        if height > expected {
            missing.push((expected, height - 1));
        }
        expected = height + 1;
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_check_boundaries() {
        // 0x00000000ffff… : exactly 32 leading zero bits
        let mut raw = [0xffu8; 32];
        raw[0] = 0;
        raw[1] = 0;
        raw[2] = 0;
        raw[3] = 0;
        let id = Hash32(raw);
        assert!(verify_identifier(&id, 16));
        assert!(verify_identifier(&id, 32));
        assert!(!verify_identifier(&id, 33));
    }

    #[test]
    fn missing_ranges_reports_gap() {
        assert_eq!(scan_missing_ranges(&[0, 1, 2, 4, 5]), vec![(3, 3)]);
        assert_eq!(scan_missing_ranges(&[2, 5]), vec![(0, 1), (3, 4)]);
        assert!(scan_missing_ranges(&[0, 1, 2]).is_empty());
        assert!(scan_missing_ranges(&[]).is_empty());
    }
}

use shadowy_core::Hash32;
use shadowy_plot::scan_missing_ranges;
use shadowy_storage::{ChainStore, StorageError};
use std::collections::HashSet;
use tracing::warn;

/// Diagnostic result of a full chain traversal. Never consulted by
/// consensus; surfaces what a damaged store looks like.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainWalkReport {
    pub tip: Option<(u64, Hash32)>,
    /// inclusive height ranges absent from the canonical index
    pub missing: Vec<(u64, u64)>,
    /// heights whose block does not link to the block below
    pub broken_links: Vec<u64>,
    /// heights whose stored block re-hashes to a different id
    pub hash_mismatches: Vec<u64>,
    /// stored blocks that no canonical height points at
    pub orphans: Vec<Hash32>,
}

impl ChainWalkReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.broken_links.is_empty()
            && self.hash_mismatches.is_empty()
            && self.orphans.is_empty()
    }
}

/// Walks heights 0..tip checking completeness, linkage and hash integrity.
pub async fn walk_chain(store: &dyn ChainStore) -> Result<ChainWalkReport, StorageError> {
    let mut report = ChainWalkReport {
        tip: store.tip().await?,
        ..ChainWalkReport::default()
    };

    let heights = store.canonical_heights().await?;
    report.missing = scan_missing_ranges(&heights);

    let mut canonical: HashSet<Hash32> = HashSet::new();
    let mut previous: Option<(u64, Hash32)> = None;
    for height in &heights {
        let Some(hash) = store.canonical_hash(*height).await? else {
            continue;
        };
        canonical.insert(hash);
        let Some(block) = store.block_by_hash(&hash).await? else {
            warn!(height, %hash, "canonical index points at a missing block");
            report.missing.push((*height, *height));
            continue;
        };
        if block.hash() != hash {
            report.hash_mismatches.push(*height);
        }
        if let Some((prev_height, prev_hash)) = previous {
            if *height == prev_height + 1 && block.header.previous_block_hash != prev_hash {
                report.broken_links.push(*height);
            }
        }
        previous = Some((*height, hash));
    }

    for (hash, _) in store.all_blocks().await? {
        if !canonical.contains(&hash) {
            report.orphans.push(hash);
        }
    }
    Ok(report)
}

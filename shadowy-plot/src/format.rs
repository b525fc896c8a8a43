use crate::PlotError;
use shadowy_core::{sha3_digest, Hash32};
use shadowy_crypto::{KeyBlob, Keypair};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

pub const PLOT_MAGIC: &[u8; 8] = b"SHDWPLOT";
pub const PLOT_VERSION: u32 = 1;

/// magic + version + entry count + header checksum.
pub const PLOT_PREAMBLE_LEN: u64 = 8 + 4 + 8 + 8;
pub const PLOT_ENTRY_LEN: u64 = 32 + 8;

/// First 8 bytes of the entry-table digest, the header integrity check.
pub fn header_checksum(entry_table: &[u8]) -> u64 {
    let digest = sha3_digest(entry_table);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
}

/// Generates `count` keypairs and writes a complete plot file: preamble,
/// identifier-sorted entry table, then length-prefixed key blobs. Plots are
/// immutable once written. `progress` is called after each generated key.
pub fn create_plot(
    path: &Path,
    count: u64,
    mut progress: impl FnMut(u64),
) -> Result<(), PlotError> {
    let mut entries: Vec<(Hash32, Vec<u8>)> = Vec::with_capacity(count as usize);
    for i in 0..count {
        let keypair = Keypair::generate();
        let blob = bincode::serialize(&KeyBlob::from_keypair(&keypair))
            .map_err(|e| PlotError::BlobEncoding(e.to_string()))?;
        entries.push((keypair.identifier(), blob));
        progress(i + 1);
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    // offsets are laid out in identifier order right after the header
    let mut offset = PLOT_PREAMBLE_LEN + PLOT_ENTRY_LEN * count;
    let mut table = Vec::with_capacity((PLOT_ENTRY_LEN * count) as usize);
    for (identifier, blob) in &entries {
        table.extend_from_slice(identifier.as_bytes());
        table.extend_from_slice(&offset.to_le_bytes());
        offset += 4 + blob.len() as u64;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(PLOT_MAGIC)?;
    writer.write_all(&PLOT_VERSION.to_le_bytes())?;
    writer.write_all(&count.to_le_bytes())?;
    writer.write_all(&header_checksum(&table).to_le_bytes())?;
    writer.write_all(&table)?;
    for (_, blob) in &entries {
        writer.write_all(&(blob.len() as u32).to_le_bytes())?;
        writer.write_all(blob)?;
    }
    writer.flush()?;
    info!(path = %path.display(), count, "plot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sensitive() {
        let a = header_checksum(b"table one");
        let b = header_checksum(b"table two");
        assert_ne!(a, b);
        assert_eq!(a, header_checksum(b"table one"));
    }
}

use crate::{PlotError, PlotHandle};
use shadowy_core::{Hash32, PlotProof};
use shadowy_crypto::CryptoError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Best candidate across the whole farm, ready to be turned into a proof.
#[derive(Debug, Clone)]
pub struct FarmCandidate {
    pub identifier: Hash32,
    pub score: [u8; 32],
    pub plot: Arc<PlotHandle>,
}

/// All loaded plots of a node. Corrupt files are reported and excluded at
/// load time; an empty farm is not an error, it just never wins a round.
#[derive(Debug, Default, Clone)]
pub struct Farm {
    plots: Vec<Arc<PlotHandle>>,
}

impl Farm {
    /// Opens every `*.plot` file under `dir`. A single bad file is logged
    /// and skipped; farming continues with the rest.
    pub fn load(dir: &Path) -> Result<Self, PlotError> {
        let mut plots = Vec::new();
        if !dir.exists() {
            warn!(dir = %dir.display(), "plot directory missing, farming disabled");
            return Ok(Self { plots });
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "plot").unwrap_or(false))
            .collect();
        paths.sort();
        for path in paths {
            match PlotHandle::open(&path) {
                Ok(handle) => {
                    info!(path = %path.display(), entries = handle.len(), "plot loaded");
                    plots.push(Arc::new(handle));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt plot");
                }
            }
        }
        Ok(Self { plots })
    }

    pub fn plot_count(&self) -> usize {
        self.plots.len()
    }

    pub fn entry_count(&self) -> usize {
        self.plots.iter().map(|p| p.len()).sum()
    }

    /// Scans every plot in parallel and reduces to the single best
    /// identifier for the challenge. Lower XOR score wins; ties across
    /// plots go to the lower identifier.
    pub fn lookup_best(&self, challenge: &Hash32) -> Option<FarmCandidate> {
        let results: Vec<Option<(Hash32, Arc<PlotHandle>)>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .plots
                .iter()
                .map(|plot| {
                    let plot = Arc::clone(plot);
                    scope.spawn(move || plot.best_entry(challenge).map(|(id, _)| (id, plot)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("scan thread")).collect()
        });

        let mut best: Option<FarmCandidate> = None;
        for (identifier, plot) in results.into_iter().flatten() {
            let score = identifier.xor_distance(challenge);
            let better = match &best {
                None => true,
                Some(current) => {
                    score < current.score
                        || (score == current.score && identifier < current.identifier)
                }
            };
            if better {
                best = Some(FarmCandidate {
                    identifier,
                    score,
                    plot,
                });
            }
        }
        best
    }

    /// Produces the plot proof for a round: looks up the winning entry,
    /// reconstructs its keypair and signs the challenge bytes. Returns
    /// `Ok(None)` when the farm has no viable plot this round.
    pub fn prove(&self, challenge: &Hash32) -> Result<Option<PlotProof>, PlotError> {
        let Some(candidate) = self.lookup_best(challenge) else {
            return Ok(None);
        };
        let blob = candidate.plot.load_blob(&candidate.identifier)?;
        let keypair = blob.into_keypair().map_err(corrupt(candidate.identifier))?;
        let signature = keypair
            .sign(challenge.as_bytes())
            .map_err(corrupt(candidate.identifier))?;
        Ok(Some(PlotProof {
            identifier: candidate.identifier,
            public_key: keypair.public_key.clone(),
            signature,
        }))
    }
}

fn corrupt(identifier: Hash32) -> impl FnOnce(CryptoError) -> PlotError {
    move |e| PlotError::CorruptEntry {
        identifier,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::create_plot;
    use shadowy_core::sha3_digest;

    #[test]
    fn farm_skips_corrupt_and_scans_rest() {
        let dir = tempfile::tempdir().unwrap();
        create_plot(&dir.path().join("a.plot"), 3, |_| {}).unwrap();
        create_plot(&dir.path().join("b.plot"), 3, |_| {}).unwrap();
        std::fs::write(dir.path().join("c.plot"), b"garbage").unwrap();

        let farm = Farm::load(dir.path()).unwrap();
        assert_eq!(farm.plot_count(), 2);
        assert_eq!(farm.entry_count(), 6);

        let challenge = sha3_digest(b"round 1");
        let candidate = farm.lookup_best(&challenge).unwrap();
        // farm-wide best is at least as good as each per-plot best
        for plot in &farm.plots {
            let (id, _) = plot.best_entry(&challenge).unwrap();
            assert!(candidate.score <= id.xor_distance(&challenge));
        }
    }

    #[test]
    fn prove_signs_the_challenge() {
        let dir = tempfile::tempdir().unwrap();
        create_plot(&dir.path().join("a.plot"), 2, |_| {}).unwrap();
        let farm = Farm::load(dir.path()).unwrap();
        let challenge = sha3_digest(b"challenge");
        let proof = farm.prove(&challenge).unwrap().unwrap();
        shadowy_crypto::verify(&proof.public_key, challenge.as_bytes(), &proof.signature)
            .unwrap();
        assert_eq!(
            shadowy_core::identifier_from_public_key(&proof.public_key),
            proof.identifier
        );
    }

    #[test]
    fn empty_farm_idles() {
        let dir = tempfile::tempdir().unwrap();
        let farm = Farm::load(dir.path()).unwrap();
        assert!(farm.lookup_best(&sha3_digest(b"c")).is_none());
        assert!(farm.prove(&sha3_digest(b"c")).unwrap().is_none());
    }
}

//! One-way hash-chain primitive backing the heartbeat protocol.
//!
//! A chain of length `N` is the sequence `x_0, x_1, ..., x_N` with
//! `x_{k+1} = H(x_k)` under SHA-256.  `x_0` is the secret seed drawn from
//! the OS CSPRNG and `x_N` is the **anchor**, the only point ever shown to
//! the Coordinator ahead of time.  The i-th heartbeat discloses
//! `w_i = x_{N-i}`, which verifies against the anchor by
//! `H^i(w_i) == x_N`.  Revealing pre-images from the anchor backwards means
//! an observer of beats `1..i` still cannot forge beat `i+1`.
//!
//! Chain artifacts (`seed.bin`, `chain.bin`, `anchor.bin`) are written via
//! temp-file-then-rename into the target directory so that a crash mid-write
//! can never leave a truncated chain behind.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use subtle::ConstantTimeEq;

/// Width in bytes of every chain point and tag (SHA-256).
pub const DIGEST_WIDTH: usize = 32;

/// Upper bound on the number of beats a single chain may carry.
pub const MAX_CHAIN_LENGTH: usize = 10_000;

/// A single chain point or authenticator tag.
pub type ChainDigest = [u8; DIGEST_WIDTH];

/// Filename of the secret seed artifact (`x_0`).
pub const SEED_FILE: &str = "seed.bin";
/// Filename of the full-chain artifact (all points, concatenated).
pub const CHAIN_FILE: &str = "chain.bin";
/// Filename of the public anchor artifact (`x_N`).
pub const ANCHOR_FILE: &str = "anchor.bin";

/// Errors surfaced by chain generation, loading, and persistence.
#[derive(Debug, Clone)]
pub enum ChainError {
    /// Requested length fell outside `[1, MAX_CHAIN_LENGTH]`.
    LengthOutOfRange(usize),
    /// A stored or generated chain failed its internal consistency check.
    Corrupt(String),
    /// Filesystem interaction failure.
    Io(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthOutOfRange(n) => write!(f, "chain length {n} outside [1, {MAX_CHAIN_LENGTH}]"),
            Self::Corrupt(msg) => write!(f, "chain corrupt: {msg}"),
            Self::Io(msg) => write!(f, "chain I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ChainError {}

/// Computes `H^k(x)`; `k = 0` returns `x` unchanged.
pub fn iterate_hash(x: &ChainDigest, k: usize) -> ChainDigest {
    let mut point = *x;
    for _ in 0..k {
        point = hash_point(&point);
    }
    point
}

/// Constant-time equality over two digests.
pub fn digests_equal(a: &ChainDigest, b: &ChainDigest) -> bool {
    a.ct_eq(b).into()
}

/// Authenticator tag binding a heartbeat payload to its pre-image:
/// `H(payload || w)`.
pub fn compute_tag(payload: &[u8], w: &ChainDigest) -> ChainDigest {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(w);
    hasher.finalize().into()
}

fn hash_point(x: &ChainDigest) -> ChainDigest {
    let mut hasher = Sha256::new();
    hasher.update(x);
    hasher.finalize().into()
}

/// An in-memory hash chain of `N + 1` points, seed first, anchor last.
#[derive(Clone)]
pub struct HashChain {
    points: Vec<ChainDigest>,
}

impl HashChain {
    /// Generates a fresh chain with `length` beats from the OS CSPRNG.
    ///
    /// Every link is re-verified as it is produced; a mismatch aborts with
    /// [`ChainError::Corrupt`].
    pub fn generate(length: usize) -> Result<Self, ChainError> {
        if length == 0 || length > MAX_CHAIN_LENGTH {
            return Err(ChainError::LengthOutOfRange(length));
        }
        let mut seed = [0u8; DIGEST_WIDTH];
        OsRng.fill_bytes(&mut seed);
        let mut points = Vec::with_capacity(length + 1);
        points.push(seed);
        for k in 1..=length {
            let next = hash_point(&points[k - 1]);
            points.push(next);
            if !digests_equal(&points[k], &hash_point(&points[k - 1])) {
                return Err(ChainError::Corrupt(format!("link mismatch at step {k}")));
            }
        }
        Ok(Self { points })
    }

    /// Number of beats this chain can carry (`N`).
    pub fn length(&self) -> usize {
        self.points.len() - 1
    }

    /// The public chain tip `x_N`.
    pub fn anchor(&self) -> &ChainDigest {
        self.points.last().expect("chain holds at least two points")
    }

    /// The pre-image `w_i = x_{N-i}` disclosed by the i-th beat.
    ///
    /// `reveal(0)` is the anchor itself; indices past `N` return `None`.
    pub fn reveal(&self, i: usize) -> Option<&ChainDigest> {
        let n = self.length();
        if i > n {
            return None;
        }
        Some(&self.points[n - i])
    }

    /// Writes `seed.bin`, `chain.bin`, and `anchor.bin` into `dir`.
    ///
    /// Each file lands via temp-then-rename in the same directory, so a
    /// crash leaves either the old artifact or the new one, never a
    /// truncated mix.
    pub fn write_artifacts(&self, dir: &Path) -> Result<(), ChainError> {
        fs::create_dir_all(dir).map_err(|err| ChainError::Io(err.to_string()))?;
        let mut joined = Vec::with_capacity(self.points.len() * DIGEST_WIDTH);
        for point in &self.points {
            joined.extend_from_slice(point);
        }
        write_atomic(&dir.join(SEED_FILE), &self.points[0])?;
        write_atomic(&dir.join(CHAIN_FILE), &joined)?;
        write_atomic(&dir.join(ANCHOR_FILE), self.anchor())?;
        Ok(())
    }

    /// Loads a chain from a `chain.bin` artifact.
    ///
    /// The file must hold a whole number of 32-byte points, at least two of
    /// them, no more than `MAX_CHAIN_LENGTH + 1`, and every adjacent pair
    /// must satisfy `x_{k+1} = H(x_k)`.
    pub fn load(chain_file: &Path) -> Result<Self, ChainError> {
        let data = fs::read(chain_file).map_err(|err| ChainError::Io(err.to_string()))?;
        if data.is_empty() || data.len() % DIGEST_WIDTH != 0 {
            return Err(ChainError::Corrupt(format!(
                "{} holds {} bytes, not a multiple of {DIGEST_WIDTH}",
                chain_file.display(),
                data.len()
            )));
        }
        let count = data.len() / DIGEST_WIDTH;
        if count < 2 {
            return Err(ChainError::Corrupt("chain shorter than two points".to_string()));
        }
        if count - 1 > MAX_CHAIN_LENGTH {
            return Err(ChainError::LengthOutOfRange(count - 1));
        }
        let mut points = Vec::with_capacity(count);
        for k in 0..count {
            let mut point = [0u8; DIGEST_WIDTH];
            point.copy_from_slice(&data[k * DIGEST_WIDTH..(k + 1) * DIGEST_WIDTH]);
            points.push(point);
        }
        for k in 1..count {
            if !digests_equal(&points[k], &hash_point(&points[k - 1])) {
                return Err(ChainError::Corrupt(format!("link mismatch at step {k}")));
            }
        }
        Ok(Self { points })
    }
}

impl std::fmt::Debug for HashChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print chain points; the seed side is secret material.
        f.debug_struct("HashChain")
            .field("length", &self.length())
            .field("anchor", &hex::encode(self.anchor()))
            .finish()
    }
}

/// Writes `data` to `path` via a temp file in the same directory plus an
/// atomic rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ChainError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| ChainError::Io(err.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|err| ChainError::Io(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("swarm_pulse_{tag}_{nanos}"))
    }

    #[test]
    fn generate_rejects_out_of_range_lengths() {
        assert!(matches!(
            HashChain::generate(0),
            Err(ChainError::LengthOutOfRange(0))
        ));
        assert!(matches!(
            HashChain::generate(MAX_CHAIN_LENGTH + 1),
            Err(ChainError::LengthOutOfRange(_))
        ));
    }

    #[test]
    fn iterate_zero_is_identity() {
        let x = [7u8; DIGEST_WIDTH];
        assert_eq!(iterate_hash(&x, 0), x);
    }

    #[test]
    fn every_reveal_verifies_against_the_anchor() {
        let chain = HashChain::generate(16).unwrap();
        let anchor = *chain.anchor();
        for i in 0..=16 {
            let w = chain.reveal(i).unwrap();
            assert_eq!(iterate_hash(w, i), anchor, "beat {i} failed to verify");
        }
        assert!(chain.reveal(17).is_none());
    }

    #[test]
    fn artifacts_round_trip() {
        let dir = temp_dir("artifacts");
        let chain = HashChain::generate(8).unwrap();
        chain.write_artifacts(&dir).unwrap();

        let seed = std::fs::read(dir.join(SEED_FILE)).unwrap();
        let anchor = std::fs::read(dir.join(ANCHOR_FILE)).unwrap();
        assert_eq!(seed.as_slice(), chain.reveal(8).unwrap());
        assert_eq!(anchor.as_slice(), chain.anchor());

        let reloaded = HashChain::load(&dir.join(CHAIN_FILE)).unwrap();
        assert_eq!(reloaded.length(), 8);
        assert_eq!(reloaded.anchor(), chain.anchor());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_rejects_truncated_and_tampered_chains() {
        let dir = temp_dir("corrupt");
        let chain = HashChain::generate(4).unwrap();
        chain.write_artifacts(&dir).unwrap();
        let path = dir.join(CHAIN_FILE);

        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 1);
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(HashChain::load(&path), Err(ChainError::Corrupt(_))));

        chain.write_artifacts(&dir).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data[40] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(HashChain::load(&path), Err(ChainError::Corrupt(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tag_binds_payload_and_preimage() {
        let w = [3u8; DIGEST_WIDTH];
        let tag = compute_tag(b"SN000001|12.5|1", &w);
        assert_ne!(tag, compute_tag(b"SN000001|12.5|2", &w));
        assert_ne!(tag, compute_tag(b"SN000001|12.5|1", &[4u8; DIGEST_WIDTH]));
    }

    proptest! {
        #[test]
        fn reveal_always_verifies(length in 1usize..64, beat in 0usize..64) {
            let chain = HashChain::generate(length).unwrap();
            if beat <= length {
                let w = chain.reveal(beat).unwrap();
                prop_assert_eq!(iterate_hash(w, beat), *chain.anchor());
            } else {
                prop_assert!(chain.reveal(beat).is_none());
            }
        }
    }
}

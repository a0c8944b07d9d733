//! Per-document vector index: exact and trained approximate flavors.
//!
//! Two flavors are selected by corpus size at build time:
//! - **[`FlatIndex`]** — brute-force L2 over every vector. Always correct;
//!   used below [`crate::config::IndexConfig::flat_threshold`] vectors and
//!   always for a single-vector corpus.
//! - **[`IvfFlatIndex`]** — inverted-file index with a k-means quantizer of
//!   `nlist = min(100, max(1, floor(sqrt(n))))` partitions, trained on the
//!   exact vector set being indexed in the same build pass.
//!
//! Distances are squared L2, ascending, ties broken by insertion order.
//! Indices serialize to a versioned JSON artifact; a round-trip yields a
//! structure that returns identical search results.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ARTIFACT_VERSION: u32 = 1;

/// Lloyd iterations cap for quantizer training.
const KMEANS_MAX_ITERS: usize = 25;

/// A `(distance, position)` search hit. Position is the vector's 0-based
/// insertion order in the index.
pub type Hit = (f32, usize);

/// Partition count for a trained index over `n` vectors.
pub fn nlist_for(n: usize) -> usize {
    let root = (n as f64).sqrt().floor() as usize;
    root.clamp(1, 100)
}

/// Squared L2 distance.
fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Sort hits ascending by distance, ties by insertion position.
fn sort_hits(hits: &mut Vec<Hit>, k: usize) {
    hits.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    hits.truncate(k);
}

// ============ Flat (exact) ============

/// Exact brute-force index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
        }
    }

    pub fn add(&mut self, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        self.vectors.push(vector);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<Hit> {
        let mut hits: Vec<Hit> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(pos, v)| (l2_sq(query, v), pos))
            .collect();
        sort_hits(&mut hits, k.min(self.vectors.len()));
        hits
    }
}

// ============ IVF (approximate, trained) ============

/// Inverted-file index with a k-means quantizer.
///
/// Vectors are kept in insertion order; each inverted list holds positions
/// into that order, so provenance survives training and serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfFlatIndex {
    dim: usize,
    nlist: usize,
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
    vectors: Vec<Vec<f32>>,
}

impl IvfFlatIndex {
    /// Train the quantizer on `vectors` and insert them, one build pass.
    /// The training set is exactly the indexed set; there is no incremental
    /// re-training later.
    pub fn train(vectors: Vec<Vec<f32>>, nlist: usize) -> Result<Self> {
        let n = vectors.len();
        if nlist == 0 || n < nlist {
            return Err(Error::IndexTrain(format!(
                "cannot train {nlist} partitions over {n} vectors"
            )));
        }
        let dim = vectors[0].len();

        let centroids = kmeans(&vectors, nlist, dim);

        let mut lists = vec![Vec::new(); nlist];
        for (pos, v) in vectors.iter().enumerate() {
            lists[nearest_centroid(&centroids, v)].push(pos);
        }

        // Probe a quarter of the partitions by default; search falls back
        // to all of them when the probed lists run short of candidates.
        let nprobe = nlist.div_ceil(4).max(1);

        Ok(Self {
            dim,
            nlist,
            nprobe,
            centroids,
            lists,
            vectors,
        })
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<Hit> {
        let want = k.min(self.vectors.len());

        let mut hits = self.search_probes(query, self.nprobe, want);
        if hits.len() < want {
            hits = self.search_probes(query, self.nlist, want);
        }
        hits
    }

    fn search_probes(&self, query: &[f32], nprobe: usize, want: usize) -> Vec<Hit> {
        let mut by_centroid: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (l2_sq(query, c), i))
            .collect();
        by_centroid.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut hits: Vec<Hit> = by_centroid
            .iter()
            .take(nprobe)
            .flat_map(|&(_, list)| self.lists[list].iter())
            .map(|&pos| (l2_sq(query, &self.vectors[pos]), pos))
            .collect();
        sort_hits(&mut hits, want);
        hits
    }
}

/// Lloyd's algorithm with deterministic spread initialization.
fn kmeans(vectors: &[Vec<f32>], nlist: usize, dim: usize) -> Vec<Vec<f32>> {
    let n = vectors.len();

    // Seed centroids with evenly spaced samples of the training set.
    let mut centroids: Vec<Vec<f32>> = (0..nlist)
        .map(|i| vectors[i * n / nlist].clone())
        .collect();

    let mut assignment = vec![usize::MAX; n];

    for _ in 0..KMEANS_MAX_ITERS {
        let mut changed = false;
        for (pos, v) in vectors.iter().enumerate() {
            let best = nearest_centroid(&centroids, v);
            if assignment[pos] != best {
                assignment[pos] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; dim]; nlist];
        let mut counts = vec![0usize; nlist];
        for (pos, v) in vectors.iter().enumerate() {
            let c = assignment[pos];
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                *s += x;
            }
        }
        for (c, sum) in sums.into_iter().enumerate() {
            // An emptied cluster keeps its previous centroid.
            if counts[c] > 0 {
                centroids[c] = sum.into_iter().map(|s| s / counts[c] as f32).collect();
            }
        }
    }

    centroids
}

fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = l2_sq(v, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

// ============ Index flavor selection + artifact ============

/// A per-document vector index of either flavor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorIndex {
    Flat(FlatIndex),
    IvfFlat(IvfFlatIndex),
}

#[derive(Serialize, Deserialize)]
struct Artifact {
    version: u32,
    index: VectorIndex,
}

impl VectorIndex {
    /// Build an index over a document's chunk vectors, choosing the flavor
    /// by corpus size. A single-vector corpus always gets the exact flavor;
    /// a trained index with one degenerate cluster is never attempted.
    pub fn build(vectors: Vec<Vec<f32>>, flat_threshold: usize) -> Result<Self> {
        let n = vectors.len();
        if n == 0 {
            return Err(Error::EmptyInput);
        }

        let dim = vectors[0].len();
        for v in &vectors {
            if v.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: v.len(),
                });
            }
        }

        if n == 1 || n < flat_threshold {
            let mut index = FlatIndex::new(dim);
            for v in vectors {
                index.add(v)?;
            }
            Ok(VectorIndex::Flat(index))
        } else {
            Ok(VectorIndex::IvfFlat(IvfFlatIndex::train(
                vectors,
                nlist_for(n),
            )?))
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            VectorIndex::Flat(i) => i.dim,
            VectorIndex::IvfFlat(i) => i.dim,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VectorIndex::Flat(i) => i.vectors.len(),
            VectorIndex::IvfFlat(i) => i.vectors.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// K-nearest-neighbor search: at most `min(k, n)` hits, ascending by
    /// distance, ties stable by insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        if query.len() != self.dim() {
            return Err(Error::DimensionMismatch {
                expected: self.dim(),
                actual: query.len(),
            });
        }
        Ok(match self {
            VectorIndex::Flat(i) => i.search(query, k),
            VectorIndex::IvfFlat(i) => i.search(query, k),
        })
    }

    /// Serialize to a versioned artifact.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let artifact = Artifact {
            version: ARTIFACT_VERSION,
            index: self.clone(),
        };
        Ok(serde_json::to_vec(&artifact)?)
    }

    /// Load from a serialized artifact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let artifact: Artifact = serde_json::from_slice(bytes)?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(Error::IndexTrain(format!(
                "unsupported artifact version {}",
                artifact.version
            )));
        }
        Ok(artifact.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0; dim];
                v[i % dim] = 1.0 + (i / dim) as f32;
                v
            })
            .collect()
    }

    #[test]
    fn nlist_formula() {
        assert_eq!(nlist_for(1), 1);
        assert_eq!(nlist_for(3), 1);
        assert_eq!(nlist_for(4), 2);
        assert_eq!(nlist_for(100), 10);
        assert_eq!(nlist_for(10_000), 100);
        assert_eq!(nlist_for(1_000_000), 100);
    }

    #[test]
    fn empty_corpus_is_empty_input() {
        assert!(matches!(
            VectorIndex::build(vec![], 256),
            Err(Error::EmptyInput)
        ));
    }

    #[test]
    fn single_vector_degrades_to_flat() {
        let index = VectorIndex::build(vec![vec![1.0, 2.0]], 0).unwrap();
        assert!(matches!(index, VectorIndex::Flat(_)));
        let hits = index.search(&[1.0, 2.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 0);
    }

    #[test]
    fn mixed_dimensions_rejected() {
        let err = VectorIndex::build(vec![vec![1.0, 2.0], vec![1.0]], 256).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn flat_search_is_ascending_and_bounded() {
        let index = VectorIndex::build(unit_vectors(5, 4), 256).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 5);
        for pair in hits.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        assert_eq!(hits[0].1, 0);

        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn flat_ties_break_by_insertion_order() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0]];
        let index = VectorIndex::build(vectors, 256).unwrap();
        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        // Positions 0 and 2 are equidistant; 0 must come first.
        assert_eq!(hits[0].1, 0);
        assert_eq!(hits[1].1, 2);
        assert_eq!(hits[2].1, 1);
    }

    #[test]
    fn large_corpus_gets_trained_flavor() {
        let index = VectorIndex::build(unit_vectors(300, 8), 256).unwrap();
        assert!(matches!(index, VectorIndex::IvfFlat(_)));
        assert_eq!(index.len(), 300);
    }

    #[test]
    fn ivf_search_is_ascending_and_bounded() {
        let vectors = unit_vectors(300, 8);
        let query = vectors[17].clone();
        let index = VectorIndex::build(vectors, 16).unwrap();

        let hits = index.search(&query, 10).unwrap();
        assert_eq!(hits.len(), 10);
        for pair in hits.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        // The indexed copy of the query itself is the nearest hit.
        assert_eq!(hits[0].1, 17);
        assert_eq!(hits[0].0, 0.0);
    }

    #[test]
    fn ivf_returns_min_k_n_even_with_sparse_lists() {
        let vectors = unit_vectors(40, 4);
        let index = VectorIndex::build(vectors, 8).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 100).unwrap();
        assert_eq!(hits.len(), 40);
    }

    #[test]
    fn training_more_partitions_than_vectors_fails() {
        let err = IvfFlatIndex::train(unit_vectors(3, 4), 8).unwrap_err();
        assert!(matches!(err, Error::IndexTrain(_)));
    }

    #[test]
    fn query_dimension_mismatch() {
        let index = VectorIndex::build(unit_vectors(4, 4), 256).unwrap();
        let err = index.search(&[1.0, 0.0], 3).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn artifact_roundtrip_preserves_search_results() {
        for flat_threshold in [256, 16] {
            let vectors = unit_vectors(120, 6);
            let query = vec![0.3, 0.9, 0.1, 0.0, 0.2, 0.7];
            let index = VectorIndex::build(vectors, flat_threshold).unwrap();

            let before = index.search(&query, 10).unwrap();
            let restored = VectorIndex::from_bytes(&index.to_bytes().unwrap()).unwrap();
            let after = restored.search(&query, 10).unwrap();

            assert_eq!(before, after);
        }
    }
}

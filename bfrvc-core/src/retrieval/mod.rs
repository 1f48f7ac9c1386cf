//! Retrieval-based timbre matching.
//!
//! Every content frame is pulled toward its nearest neighbours in a store of
//! target-speaker embeddings. The store is anything implementing
//! [`NeighborSearch`]; refinement only ever reads from it, so one index is
//! shared by all chunk workers.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use tracing::{debug, trace};

use crate::content::ContentEmbeddingSequence;
use crate::error::{Result, VcError};
use crate::pitch::PitchContour;

/// Neighbour count RVC blends over.
pub const DEFAULT_K: usize = 8;
/// `protect` values at or above this leave unvoiced frames alone.
pub const PROTECT_DISABLED: f32 = 0.5;

/// Keeps `1 / d²` finite for exact matches.
const MIN_SQ_DISTANCE: f32 = 1e-12;

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub vector: Vec<f32>,
    /// Euclidean distance to the query.
    pub distance: f32,
}

/// Read-only nearest-neighbour search over fixed-width vectors.
pub trait NeighborSearch: Send + Sync {
    fn dim(&self) -> usize;

    /// Up to `k` nearest stored vectors, closest first.
    fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor>;
}

/// Exact L2 search over an in-memory matrix.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    vectors: Array2<f32>,
}

impl FlatIndex {
    /// `vectors` is `count × dim`.
    pub fn new(vectors: Array2<f32>) -> Self {
        Self { vectors }
    }

    /// Stack the frames of reference sequences into one index.
    ///
    /// # Errors
    /// `VcError::Model` if the sequences disagree on width.
    pub fn from_sequences<'a, I>(sequences: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a ContentEmbeddingSequence>,
    {
        let mut rows: Vec<f32> = Vec::new();
        let mut dim = None;
        let mut count = 0usize;
        for seq in sequences {
            match dim {
                None => dim = Some(seq.dim()),
                Some(d) if d != seq.dim() => {
                    return Err(VcError::Model(format!(
                        "reference embeddings mix widths {d} and {}",
                        seq.dim()
                    )))
                }
                Some(_) => {}
            }
            rows.extend(seq.features.iter().copied());
            count += seq.frames();
        }
        let dim = dim.unwrap_or(0);
        let vectors = Array2::from_shape_vec((count, dim), rows)
            .map_err(|e| VcError::Model(format!("index shape: {e}")))?;
        Ok(Self::new(vectors))
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_shared(self) -> Arc<dyn NeighborSearch> {
        Arc::new(self)
    }
}

impl NeighborSearch for FlatIndex {
    fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .outer_iter()
            .enumerate()
            .map(|(i, row)| {
                let sq: f32 = row.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum();
                (i, sq)
            })
            .collect();
        // Index breaks ties so results do not depend on sort stability.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(i, sq)| Neighbor {
                vector: self.vectors.row(i).to_vec(),
                distance: sq.sqrt(),
            })
            .collect()
    }
}

/// Blend every frame of `embeddings` toward its `k` nearest neighbours.
///
/// `ratio` 0 (or no index) returns the input untouched; 1 replaces each frame
/// with the inverse-square-distance weighted neighbour mean.
///
/// # Errors
/// - `VcError::InvalidConfig` if `ratio` is outside `[0, 1]`.
/// - `VcError::Model` if the index width differs from the embedding width.
pub fn refine(
    embeddings: ContentEmbeddingSequence,
    index: Option<&dyn NeighborSearch>,
    ratio: f32,
    k: usize,
) -> Result<ContentEmbeddingSequence> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(VcError::InvalidConfig(format!(
            "retrieval ratio {ratio} outside [0, 1]"
        )));
    }
    let Some(index) = index else {
        return Ok(embeddings);
    };
    if ratio == 0.0 || embeddings.is_empty() {
        return Ok(embeddings);
    }
    if index.dim() != embeddings.dim() {
        return Err(VcError::Model(format!(
            "index width {} does not match embedding width {}",
            index.dim(),
            embeddings.dim()
        )));
    }

    let mut embeddings = embeddings;
    let mut untouched = 0usize;
    for mut row in embeddings.features.axis_iter_mut(Axis(0)) {
        let query = row.to_vec();
        let Some(retrieved) = weighted_mean(&index.nearest(&query, k), query.len()) else {
            untouched += 1;
            continue;
        };
        row.zip_mut_with(&retrieved, |e, r| *e = ratio * r + (1.0 - ratio) * *e);
    }
    if untouched > 0 {
        debug!(untouched, "frames without neighbours left unrefined");
    }
    trace!(frames = embeddings.frames(), ratio, k, "retrieval refine");
    Ok(embeddings)
}

fn weighted_mean(neighbors: &[Neighbor], dim: usize) -> Option<Array1<f32>> {
    if neighbors.is_empty() {
        return None;
    }
    let weights: Vec<f32> = neighbors
        .iter()
        .map(|n| 1.0 / (n.distance * n.distance).max(MIN_SQ_DISTANCE))
        .collect();
    let total: f32 = weights.iter().sum();
    let mut acc = Array1::<f32>::zeros(dim);
    for (n, w) in neighbors.iter().zip(&weights) {
        acc.scaled_add(w / total, &ArrayView1::from(&n.vector[..]));
    }
    Some(acc)
}

/// Pull unvoiced frames of `refined` back toward `original`
/// (`out = p·refined + (1 − p)·original`), keeping consonants intelligible.
/// A no-op when `protect >= 0.5`.
///
/// # Errors
/// `VcError::Alignment` if the two sequences differ in frame count.
pub fn protect(
    refined: &mut ContentEmbeddingSequence,
    original: &ContentEmbeddingSequence,
    pitch: &PitchContour,
    protect: f32,
) -> Result<()> {
    if protect >= PROTECT_DISABLED {
        return Ok(());
    }
    if refined.frames() != original.frames() {
        return Err(VcError::Alignment {
            what: "protected embeddings",
            got: refined.frames(),
            expected: original.frames(),
        });
    }
    let p = protect.max(0.0);
    let mut protected = 0usize;
    for (i, (mut row, orig)) in refined
        .features
        .axis_iter_mut(Axis(0))
        .zip(original.features.axis_iter(Axis(0)))
        .enumerate()
    {
        if pitch.is_voiced(i) {
            continue;
        }
        row.zip_mut_with(&orig, |r, o| *r = p * *r + (1.0 - p) * o);
        protected += 1;
    }
    trace!(protected, p, "consonant protection");
    Ok(())
}

//! In-process exact index: a dense row-major matrix of unit vectors plus
//! the metadata row for each vector, persisted as a pair of files.
//!
//! Vector file: `NVEC` magic, bincode header, raw `f32` rows.
//! Metadata file: versioned JSON carrying the same `count` and `generation`
//! as the vector header, so a mismatched pair is detected on load.
#![forbid(unsafe_code)]

use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::vector_index::{
    canonical_similarity, dot_product, ensure_dimension, ensure_parallel, normalize, unit_vector, IndexStore,
    ScoredEntry, VectorIndex,
};
use crate::error::{Result, SearchError};
use crate::models::{IndexEntry, NutritionRecord};

type Float = f32;

const VECTOR_MAGIC: &[u8; 4] = b"NVEC";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct VectorFileHeader {
    version: u32,
    little_endian: bool,
    dimension: u32,
    count: u64,
    generation: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    version: u32,
    dimension: usize,
    count: usize,
    generation: u64,
    entries: Vec<IndexEntry>,
}

#[derive(PartialEq)]
struct ScoredIndex {
    score: Float,
    index: usize,
}

impl Eq for ScoredIndex {}

impl PartialOrd for ScoredIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredIndex {
    // "Greater" means a worse hit: lower score, or same score inserted later.
    // The max-heap therefore keeps the worst of the current top-k on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.index.cmp(&other.index))
    }
}

#[derive(Debug)]
pub struct LocalExactIndex {
    dimension: usize,
    matrix: Vec<Float>,
    entries: Vec<IndexEntry>,
    vectors_path: PathBuf,
    metadata_path: PathBuf,
    generation: u64,
}

impl LocalExactIndex {
    pub fn new(dimension: usize, vectors_path: &Path, metadata_path: &Path) -> Self {
        Self {
            dimension,
            matrix: Vec::new(),
            entries: Vec::new(),
            vectors_path: vectors_path.to_path_buf(),
            metadata_path: metadata_path.to_path_buf(),
            generation: 0,
        }
    }

    /// Reads a persisted pair. Any inconsistency is a `CorruptIndex` error.
    pub fn load(dimension: usize, vectors_path: &Path, metadata_path: &Path) -> Result<Self> {
        if !vectors_path.exists() || !metadata_path.exists() {
            return Err(SearchError::CorruptIndex(format!(
                "index pair incomplete: {:?} exists={}, {:?} exists={}",
                vectors_path,
                vectors_path.exists(),
                metadata_path,
                metadata_path.exists()
            )));
        }

        let (header, matrix) = read_vector_file(vectors_path)?;
        let metadata: MetadataFile = serde_json::from_str(&fs::read_to_string(metadata_path)?)
            .map_err(|e| SearchError::CorruptIndex(format!("unreadable metadata file: {}", e)))?;

        if metadata.version != FORMAT_VERSION {
            return Err(SearchError::CorruptIndex(format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }
        ensure_dimension(dimension, header.dimension as usize)?;
        if metadata.dimension != dimension {
            return Err(SearchError::CorruptIndex(format!(
                "metadata dimension {} does not match vectors dimension {}",
                metadata.dimension, dimension
            )));
        }
        if header.generation != metadata.generation {
            return Err(SearchError::CorruptIndex(format!(
                "vectors generation {} does not match metadata generation {}",
                header.generation, metadata.generation
            )));
        }
        let count = header.count as usize;
        if count != metadata.count || count != metadata.entries.len() {
            return Err(SearchError::CorruptIndex(format!(
                "vector count {} does not match metadata count {} ({} entries)",
                count,
                metadata.count,
                metadata.entries.len()
            )));
        }
        if matrix.len() != count * dimension {
            return Err(SearchError::CorruptIndex(format!(
                "Matrix size mismatch: expected {}, got {}",
                count * dimension,
                matrix.len()
            )));
        }

        Ok(Self {
            dimension,
            matrix,
            entries: metadata.entries,
            vectors_path: vectors_path.to_path_buf(),
            metadata_path: metadata_path.to_path_buf(),
            generation: header.generation,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stored row at `position`, already normalised.
    pub fn vector(&self, position: usize) -> Option<&[Float]> {
        let start = position.checked_mul(self.dimension)?;
        self.matrix.get(start..start + self.dimension)
    }

    pub fn append(&mut self, vectors: &[Vec<Float>], entries: &[IndexEntry]) -> Result<usize> {
        ensure_parallel(vectors.len(), entries.len())?;
        let rows = vectors
            .iter()
            .map(|vector| {
                ensure_dimension(self.dimension, vector.len())?;
                unit_vector(vector)
            })
            .collect::<Result<Vec<_>>>()?;
        self.matrix.reserve(rows.len() * self.dimension);
        for (row, entry) in rows.iter().zip(entries) {
            self.matrix.extend_from_slice(row);
            self.entries.push(entry.clone());
        }
        Ok(vectors.len())
    }

    /// Full scan over every row, top-k kept in a bounded heap.
    pub fn top_k(&self, query: &[Float], k: usize) -> Result<Vec<ScoredEntry>> {
        ensure_dimension(self.dimension, query.len())?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let k = k.min(self.entries.len());
        let query_norm = normalize(query);

        let scores: Vec<Float> = self
            .matrix
            .par_chunks_exact(self.dimension)
            .map(|row| canonical_similarity(dot_product(row, &query_norm)) + 0.0)
            .collect();

        let mut heap = BinaryHeap::with_capacity(k + 1);
        for (index, score) in scores.into_iter().enumerate() {
            heap.push(ScoredIndex { score, index });
            if heap.len() > k {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|si| ScoredEntry {
                position: si.index,
                entry: self.entries[si.index].clone(),
                similarity: si.score,
            })
            .collect())
    }

    /// Writes both files under temporary names, then renames them into place.
    pub fn save(&mut self) -> Result<()> {
        ensure_parallel(self.matrix.len() / self.dimension.max(1), self.entries.len())?;
        let generation = next_generation(self.generation);

        let header = VectorFileHeader {
            version: FORMAT_VERSION,
            little_endian: cfg!(target_endian = "little"),
            dimension: self.dimension as u32,
            count: self.entries.len() as u64,
            generation,
        };
        let metadata = MetadataFile {
            version: FORMAT_VERSION,
            dimension: self.dimension,
            count: self.entries.len(),
            generation,
            entries: self.entries.clone(),
        };

        let vectors_tmp = temp_path(&self.vectors_path);
        let metadata_tmp = temp_path(&self.metadata_path);
        write_vector_file(&vectors_tmp, &header, &self.matrix)?;
        write_synced(&metadata_tmp, serde_json::to_string(&metadata)?.as_bytes())?;

        fs::rename(&vectors_tmp, &self.vectors_path)?;
        fs::rename(&metadata_tmp, &self.metadata_path)?;
        self.generation = generation;

        info!(
            count = self.entries.len(),
            generation,
            vectors = ?self.vectors_path,
            metadata = ?self.metadata_path,
            "local index persisted"
        );
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LocalExactIndex {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    async fn add(&mut self, vectors: Vec<Vec<Float>>, records: &[NutritionRecord]) -> Result<usize> {
        let entries: Vec<IndexEntry> = records.iter().map(NutritionRecord::index_entry).collect();
        self.append(&vectors, &entries)
    }

    async fn search(&self, query: &[Float], k: usize) -> Result<Vec<ScoredEntry>> {
        self.top_k(query, k)
    }

    async fn persist(&mut self) -> Result<()> {
        self.save()
    }
}

/// Opens the two-file index at fixed paths.
#[derive(Debug, Clone)]
pub struct LocalIndexStore {
    dimension: usize,
    vectors_path: PathBuf,
    metadata_path: PathBuf,
}

impl LocalIndexStore {
    pub fn new(dimension: usize, vectors_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            dimension,
            vectors_path: vectors_path.into(),
            metadata_path: metadata_path.into(),
        }
    }

    pub fn artifacts_exist(&self) -> bool {
        self.vectors_path.exists() && self.metadata_path.exists()
    }
}

#[async_trait]
impl IndexStore for LocalIndexStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn open(&self) -> Result<Option<Box<dyn VectorIndex>>> {
        if !self.artifacts_exist() {
            debug!(vectors = ?self.vectors_path, metadata = ?self.metadata_path, "local index not built");
            return Ok(None);
        }
        match LocalExactIndex::load(self.dimension, &self.vectors_path, &self.metadata_path) {
            Ok(index) => {
                info!(count = index.len(), generation = index.generation(), "local index loaded");
                Ok(Some(Box::new(index)))
            }
            Err(e @ (SearchError::CorruptIndex(_) | SearchError::DimensionMismatch { .. })) => {
                warn!(error = %e, "persisted index is unusable, treating as not built");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_empty(&self) -> Result<Box<dyn VectorIndex>> {
        Ok(Box::new(LocalExactIndex::new(
            self.dimension,
            &self.vectors_path,
            &self.metadata_path,
        )))
    }
}

fn header_len() -> usize {
    let probe = VectorFileHeader {
        version: 0,
        little_endian: true,
        dimension: 0,
        count: 0,
        generation: 0,
    };
    bincode::serialized_size(&probe).unwrap_or(0) as usize
}

fn write_vector_file(path: &Path, header: &VectorFileHeader, matrix: &[Float]) -> Result<()> {
    let header_bytes = bincode::serialize(header)
        .map_err(|e| SearchError::CorruptIndex(format!("failed to encode vector header: {}", e)))?;
    let body: &[u8] = bytemuck::cast_slice(matrix);

    let mut bytes = Vec::with_capacity(VECTOR_MAGIC.len() + header_bytes.len() + body.len());
    bytes.extend_from_slice(VECTOR_MAGIC);
    bytes.extend_from_slice(&header_bytes);
    bytes.extend_from_slice(body);
    write_synced(path, &bytes)
}

fn read_vector_file(path: &Path) -> Result<(VectorFileHeader, Vec<Float>)> {
    let bytes = fs::read(path)?;
    let header_end = VECTOR_MAGIC.len() + header_len();
    if bytes.len() < header_end || &bytes[..VECTOR_MAGIC.len()] != VECTOR_MAGIC {
        return Err(SearchError::CorruptIndex(format!("{:?} is not a vector file", path)));
    }
    let header: VectorFileHeader = bincode::deserialize(&bytes[VECTOR_MAGIC.len()..header_end])
        .map_err(|e| SearchError::CorruptIndex(format!("unreadable vector header: {}", e)))?;
    if header.version != FORMAT_VERSION {
        return Err(SearchError::CorruptIndex(format!(
            "unsupported vector file version {}",
            header.version
        )));
    }
    if header.little_endian != cfg!(target_endian = "little") {
        return Err(SearchError::CorruptIndex("vector file written with foreign endianness".into()));
    }
    let body = &bytes[header_end..];
    if body.len() % std::mem::size_of::<Float>() != 0 {
        return Err(SearchError::CorruptIndex("vector file body is truncated".into()));
    }
    Ok((header, bytemuck::pod_collect_to_vec::<u8, Float>(body)))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// Strictly increasing within the process, even for saves in the same nanosecond.
static LAST_GENERATION: AtomicU64 = AtomicU64::new(0);

fn next_generation(previous: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let candidate = now.max(previous + 1);
    let last = LAST_GENERATION.fetch_max(candidate, AtomicOrdering::SeqCst);
    if last >= candidate {
        LAST_GENERATION.fetch_add(1, AtomicOrdering::SeqCst) + 1
    } else {
        candidate
    }
}

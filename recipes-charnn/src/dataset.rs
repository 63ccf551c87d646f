//! Character-level dataset and train/test split.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use recipes_core::Result;
use recipes_core::error::DatasetError;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fraction of the dataset assigned to the training split.
pub const TRAIN_FRACTION: f64 = 0.9;

/// A corpus encoded as symbol indices, served as overlapping windows.
///
/// Item `i` is the pair (`data[i..i+block]`, `data[i+1..i+block+1]`): the
/// target is the input shifted by one symbol.
#[derive(Debug, Clone)]
pub struct CharDataset {
    stoi: HashMap<char, u32>,
    itos: Vec<char>,
    data: Vec<u32>,
    block_size: usize,
}

impl CharDataset {
    /// Build a dataset from in-memory text. `source` only labels errors.
    pub fn from_text(text: &str, block_size: usize, source: &Path) -> Result<Self, DatasetError> {
        let itos: Vec<char> = text.chars().collect::<BTreeSet<_>>().into_iter().collect();
        let stoi: HashMap<char, u32> = itos
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32))
            .collect();
        let data: Vec<u32> = text.chars().map(|c| stoi[&c]).collect();

        if data.len() <= block_size {
            return Err(DatasetError::CorpusTooShort {
                path: source.to_path_buf(),
                len: data.len(),
                block_size,
            });
        }

        Ok(Self {
            stoi,
            itos,
            data,
            block_size,
        })
    }

    /// Read a UTF-8 corpus from disk.
    pub fn from_file(path: &Path, block_size: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let dataset = Self::from_text(&text, block_size, path)?;
        tracing::info!(
            path = %path.display(),
            symbols = dataset.data.len(),
            vocab_size = dataset.vocab_size(),
            "Loaded character corpus"
        );
        Ok(dataset)
    }

    /// Number of windows.
    pub fn len(&self) -> usize {
        self.data.len() - self.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vocab_size(&self) -> usize {
        self.itos.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stoi(&self) -> &HashMap<char, u32> {
        &self.stoi
    }

    pub fn itos(&self) -> &[char] {
        &self.itos
    }

    /// Input and target windows of item `idx`.
    pub fn get(&self, idx: usize) -> (&[u32], &[u32]) {
        let x = &self.data[idx..idx + self.block_size];
        let y = &self.data[idx + 1..idx + self.block_size + 1];
        (x, y)
    }

    /// Map text to indices; every symbol must be in the vocabulary.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, DatasetError> {
        text.chars()
            .map(|c| {
                self.stoi
                    .get(&c)
                    .copied()
                    .ok_or(DatasetError::UnknownSymbol { symbol: c })
            })
            .collect()
    }

    /// Map indices back to text.
    pub fn decode(&self, indices: &[u32]) -> String {
        indices
            .iter()
            .map(|&i| {
                self.itos
                    .get(i as usize)
                    .copied()
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect()
    }
}

/// A view of a dataset restricted to some item indices.
#[derive(Debug, Clone)]
pub struct Subset {
    dataset: Arc<CharDataset>,
    indices: Vec<usize>,
}

impl Subset {
    pub fn new(dataset: Arc<CharDataset>, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The unsplit dataset this subset views.
    pub fn dataset(&self) -> &Arc<CharDataset> {
        &self.dataset
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn get(&self, position: usize) -> (&[u32], &[u32]) {
        self.dataset.get(self.indices[position])
    }
}

/// Lengths of the train and test splits for `total` items.
pub fn split_lengths(total: usize) -> (usize, usize) {
    let train = (total as f64 * TRAIN_FRACTION).floor() as usize;
    (train, total - train)
}

/// Randomly partition the dataset into disjoint train and test views.
pub fn random_split(dataset: Arc<CharDataset>, seed: u64) -> (Subset, Subset) {
    let total = dataset.len();
    let (train_len, _) = split_lengths(total);
    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let test = order.split_off(train_len);
    (
        Subset::new(dataset.clone(), order),
        Subset::new(dataset, test),
    )
}

/// Placeholder path for datasets built from memory.
pub fn memory_source() -> PathBuf {
    PathBuf::from("<memory>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn dataset(text: &str, block_size: usize) -> CharDataset {
        CharDataset::from_text(text, block_size, &memory_source()).unwrap()
    }

    #[test]
    fn test_vocab_is_sorted_and_unique() {
        let ds = dataset("hello world", 3);
        assert_eq!(ds.itos(), &[' ', 'd', 'e', 'h', 'l', 'o', 'r', 'w']);
        assert_eq!(ds.vocab_size(), 8);
        assert_eq!(ds.stoi()[&'h'], 3);
    }

    #[test]
    fn test_windows_are_shifted_by_one() {
        let ds = dataset("abcdef", 3);
        assert_eq!(ds.len(), 3);
        let (x, y) = ds.get(1);
        assert_eq!(ds.decode(x), "bcd");
        assert_eq!(ds.decode(y), "cde");
    }

    #[test]
    fn test_short_corpus_is_rejected() {
        let err = CharDataset::from_text("abc", 3, &memory_source()).unwrap_err();
        assert!(matches!(err, DatasetError::CorpusTooShort { len: 3, .. }));
    }

    #[test]
    fn test_encode_unknown_symbol() {
        let ds = dataset("abcabc", 2);
        assert_eq!(ds.encode("cab").unwrap(), vec![2, 0, 1]);
        assert!(matches!(
            ds.encode("abz"),
            Err(DatasetError::UnknownSymbol { symbol: 'z' })
        ));
    }

    #[test]
    fn test_split_is_disjoint_and_exhaustive() {
        let ds = Arc::new(dataset(&"the quick brown fox ".repeat(10), 8));
        let total = ds.len();
        let (train, test) = random_split(ds.clone(), 42);
        assert_eq!(train.len(), (total as f64 * 0.9).floor() as usize);
        assert_eq!(test.len(), total - train.len());

        let a: HashSet<usize> = train.indices().iter().copied().collect();
        let b: HashSet<usize> = test.indices().iter().copied().collect();
        assert!(a.is_disjoint(&b));
        let all: HashSet<usize> = a.union(&b).copied().collect();
        assert_eq!(all, (0..total).collect());
        // both views share the same storage
        assert!(Arc::ptr_eq(train.dataset(), test.dataset()));
    }

    #[test]
    fn test_split_is_deterministic_for_seed() {
        let ds = Arc::new(dataset(&"abcdefgh".repeat(8), 4));
        let (a, _) = random_split(ds.clone(), 7);
        let (b, _) = random_split(ds, 7);
        assert_eq!(a.indices(), b.indices());
    }
}

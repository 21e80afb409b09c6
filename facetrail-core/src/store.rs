use crate::embed::Embedding;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Identity name cannot be empty")]
    EmptyName,
    #[error("Embedding has {found} dimensions, store holds {expected}-dimensional embeddings")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Embedding is empty")]
    EmptyEmbedding,
}

/// Enrolled identities: name -> reference embeddings, in enrollment order.
///
/// Names iterate in lexicographic order. A name is only present while it has
/// at least one embedding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityStore {
    identities: BTreeMap<String, Vec<Embedding>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from already validated parts (used by the codec)
    pub(crate) fn from_map(identities: BTreeMap<String, Vec<Embedding>>) -> Self {
        let identities = identities
            .into_iter()
            .filter(|(_, embeddings)| !embeddings.is_empty())
            .collect();
        Self { identities }
    }

    /// Append one reference embedding for `name`, creating the identity if needed
    pub fn append(&mut self, name: &str, embedding: Embedding) -> Result<(), StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::EmptyName);
        }
        if embedding.is_empty() {
            return Err(StorageError::EmptyEmbedding);
        }
        if let Some(expected) = self.dimension() {
            if embedding.len() != expected {
                return Err(StorageError::DimensionMismatch {
                    expected,
                    found: embedding.len(),
                });
            }
        }

        self.identities
            .entry(name.to_string())
            .or_default()
            .push(embedding);
        Ok(())
    }

    /// Names with at least one embedding
    pub fn names(&self) -> Vec<String> {
        self.identities.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn embeddings(&self, name: &str) -> &[Embedding] {
        self.identities
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.identities
            .iter()
            .map(|(name, embeddings)| (name.as_str(), embeddings.as_slice()))
    }

    /// Number of identities
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    /// Dimension shared by all stored embeddings, if any are stored
    pub fn dimension(&self) -> Option<usize> {
        self.identities
            .values()
            .flat_map(|embeddings| embeddings.first())
            .map(|embedding| embedding.len())
            .next()
    }

    /// Drop one identity; returns whether it existed
    pub fn remove(&mut self, name: &str) -> bool {
        self.identities.remove(name).is_some()
    }

    pub fn clear(&mut self) {
        self.identities.clear();
    }
}

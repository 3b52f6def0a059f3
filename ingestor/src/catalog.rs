use crate::types::{Batch, ItemId};
use std::collections::HashSet;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("could not read item catalog: {0}")]
    Io(#[from] io::Error),
    #[error("item catalog is empty")]
    Empty,
}

/// Ordered, de-duplicated list of item ids to sync.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemCatalog {
    ids: Vec<ItemId>,
}

impl ItemCatalog {
    pub fn new(ids: Vec<ItemId>) -> Self {
        let mut seen = HashSet::new();
        let ids = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
        ItemCatalog { ids }
    }

    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = tokio::fs::read(path).await?;
        Self::read(raw.as_slice())
    }

    /// Parses a delimited catalog: the first comma separated column of each line is the
    /// item id. Blank lines and `#` comments are ignored, as are any non-numeric lines
    /// before the first numeric id (column headers).
    pub fn read<R: Read>(reader: R) -> Result<Self, CatalogError> {
        let mut ids = Vec::new();

        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let id = line.split(',').next().unwrap_or_default().trim();
            if id.is_empty() {
                continue;
            }

            if ids.is_empty() && !id.bytes().all(|b| b.is_ascii_digit()) {
                tracing::debug!(line, "Skipping catalog header");
                continue;
            }

            ids.push(id.to_string());
        }

        let catalog = Self::new(ids);
        if catalog.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    /// Splits the catalog into consecutive batches of at most `batch_size` ids.
    pub fn into_batches(self, batch_size: usize) -> Vec<Batch> {
        let batch_size = batch_size.max(1);

        self.ids
            .chunks(batch_size)
            .enumerate()
            .map(|(index, ids)| Batch {
                index,
                ids: ids.to_vec(),
            })
            .collect()
    }
}

//! Accepted device-identifier sets and where they come from
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Identifiers that sort to the pass bin. Entries are trimmed; blanks are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedIdSet(BTreeSet<String>);

impl AcceptedIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse comma- and/or newline-separated identifiers. Text after `#` on a line is ignored.
    pub fn from_delimited(text: &str) -> Self {
        text.lines()
            .map(|line| line.split('#').next().unwrap_or(""))
            .flat_map(|line| line.split(','))
            .collect()
    }

    /// Returns `false` if the identifier was blank or already present
    pub fn insert(&mut self, id: impl AsRef<str>) -> bool {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return false;
        }
        self.0.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for AcceptedIdSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdSourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can hand the sorter its accepted identifiers for a job
pub trait IdSource {
    fn accepted_ids(&self) -> Result<AcceptedIdSet, IdSourceError>;
}

impl IdSource for AcceptedIdSet {
    fn accepted_ids(&self) -> Result<AcceptedIdSet, IdSourceError> {
        Ok(self.clone())
    }
}

/// Plain-text identifier list, one per line or comma separated
pub struct FileIdSource {
    path: PathBuf,
}

impl FileIdSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl IdSource for FileIdSource {
    fn accepted_ids(&self) -> Result<AcceptedIdSet, IdSourceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| IdSourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let ids = AcceptedIdSet::from_delimited(&text);
        log::info!("Loaded {} accepted identifiers from {}", ids.len(), self.path.display());
        Ok(ids)
    }
}

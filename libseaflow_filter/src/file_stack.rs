use super::error::FileStackError;
use super::file_id::{is_evt_path, FileId};

use std::path::{Path, PathBuf};

/// One discovered EVT file
#[derive(Debug, Clone)]
pub struct EvtEntry {
    pub path: PathBuf,
    pub id: FileId,
    pub size_bytes: u64,
}

/// The EVT files of a cruise in chronological order.
///
/// SeaFlow writes one EVT file every three minutes into a julian day directory (YYYY_DDD),
/// optionally gzipped. The stack is every such file found below the cruise directory.
#[derive(Debug, Clone, Default)]
pub struct FileStack {
    pub files: Vec<EvtEntry>,
    pub total_stack_size_bytes: u64,
}

impl FileStack {
    /// Search path recursively for EVT files
    pub fn new(path: &Path) -> Result<Self, FileStackError> {
        if !path.is_dir() {
            return Err(FileStackError::BadDirectory(path.to_path_buf()));
        }
        let mut files: Vec<EvtEntry> = Vec::new();
        Self::collect(path, &mut files)?;

        files.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
        // The same file may be present both plain and gzipped
        files.dedup_by(|later, kept| {
            let duplicate = later.id == kept.id;
            if duplicate {
                spdlog::warn!(
                    "Skipping {} as it duplicates {}",
                    later.path.display(),
                    kept.path.display()
                );
            }
            duplicate
        });

        Ok(Self::from_entries(files))
    }

    fn from_entries(files: Vec<EvtEntry>) -> Self {
        let total_stack_size_bytes = files.iter().fold(0, |sum, f| sum + f.size_bytes);
        Self {
            files,
            total_stack_size_bytes,
        }
    }

    fn collect(dir: &Path, files: &mut Vec<EvtEntry>) -> Result<(), FileStackError> {
        for item in dir.read_dir()? {
            let item = item?;
            let item_path = item.path();
            let file_type = item.file_type()?;
            if file_type.is_dir() {
                Self::collect(&item_path, files)?;
            } else if is_evt_path(&item_path) {
                if let Ok(id) = FileId::from_path(&item_path) {
                    files.push(EvtEntry {
                        size_bytes: item.metadata()?.len(),
                        path: item_path,
                        id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Keep files whose id lies within the inclusive [start, end] range. Boundaries are file
    /// names or paths in any form accepted by FileId.
    pub fn between(self, start: Option<&str>, end: Option<&str>) -> Result<Self, FileStackError> {
        let start = start.map(|s| FileId::from_path(Path::new(s))).transpose()?;
        let end = end.map(|s| FileId::from_path(Path::new(s))).transpose()?;
        let files = self
            .files
            .into_iter()
            .filter(|f| start.as_ref().map_or(true, |s| in_order(s, &f.id)))
            .filter(|f| end.as_ref().map_or(true, |e| in_order(&f.id, e)))
            .collect();
        Ok(Self::from_entries(files))
    }

    /// Keep at most the first n files
    pub fn limit(mut self, n: Option<usize>) -> Self {
        if let Some(n) = n {
            self.files.truncate(n);
        }
        Self::from_entries(self.files)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

// A boundary given without its julian directory matches on the file part alone
fn in_order(first: &FileId, second: &FileId) -> bool {
    if first.julian.is_none() || second.julian.is_none() {
        (&first.kind, first.name()) <= (&second.kind, second.name())
    } else {
        first <= second
    }
}

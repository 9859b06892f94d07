use crate::common::Result;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// One enrolled identity: a single reference image named after the person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

/// Read-only view over the durable identity directory.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All reference images, sorted by name so matching ties resolve stably.
    pub fn entries(&self) -> Result<Vec<IdentityEntry>> {
        let mut entries = Vec::new();

        for item in std::fs::read_dir(&self.dir)? {
            let item = item?;
            let path = item.path();
            if !path.is_file() || !is_image(&path) {
                continue;
            }
            let Some(name) = identity_name(&path) else { continue };
            let modified = item.metadata().and_then(|m| m.modified()).ok();
            entries.push(IdentityEntry { name, path, modified });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries()?.is_empty())
    }
}

/// Person name for a reference image: the file name up to the first dot.
pub fn identity_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = file_name.split('.').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

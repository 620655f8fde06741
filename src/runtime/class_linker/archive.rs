use crate::runtime::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};
use zip::{ZipArchive, result::ZipError};

/// A zip archive of class files on the boot or compile-time class path.
pub struct ClassPathArchive {
    location: PathBuf,
    entries: BTreeSet<String>,
    zip_file: Mutex<ZipArchive<File>>,
}

impl ClassPathArchive {
    pub fn open(path: impl AsRef<Path>) -> RuntimeResult<ClassPathArchive> {
        let location = path.as_ref().to_path_buf();
        let file = File::open(&location)?;
        let archive = ZipArchive::new(file).map_err(|source| RuntimeError::Archive {
            path: location.clone(),
            source,
        })?;
        let entries = archive.file_names().map(str::to_string).collect();
        Ok(ClassPathArchive {
            location,
            entries,
            zip_file: Mutex::new(archive),
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // both plain jars and jmod-style `classes/` layouts are accepted
    fn entry_name(&self, class_name: &str) -> Option<String> {
        [format!("{class_name}.class"), format!("classes/{class_name}.class")]
            .into_iter()
            .find(|name| self.entries.contains(name))
    }

    /// `class_name` is in internal form, e.g. `java/lang/Object`.
    pub fn contains_class(&self, class_name: &str) -> bool {
        self.entry_name(class_name).is_some()
    }

    pub fn read_class(&self, class_name: &str) -> RuntimeResult<Option<Vec<u8>>> {
        let Some(entry_name) = self.entry_name(class_name) else {
            return Ok(None);
        };
        let mut archive = self.zip_file.lock();
        let mut class_file = archive.by_name(&entry_name).map_err(|source| self.error(source))?;
        let mut content = Vec::with_capacity(class_file.size() as usize);
        class_file.read_to_end(&mut content)?;
        Ok(Some(content))
    }

    fn error(&self, source: ZipError) -> RuntimeError {
        RuntimeError::Archive {
            path: self.location.clone(),
            source,
        }
    }
}

impl fmt::Debug for ClassPathArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassPathArchive")
            .field("location", &self.location)
            .field("entries", &self.entries.len())
            .finish()
    }
}

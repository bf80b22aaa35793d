//! Synthesises a small folder tree with versioned files. Useful for trying
//! the engine end to end without touching a real filesystem.

use super::{ImportCallback, Source};
use crate::config::ImportParameters;
use crate::error::{ImportError, Result};
use crate::model::{ContentRef, Item, Version, VersionNumber};
use crate::status::ImportStatus;
use crate::target::{DEFAULT_CONTENT_TYPE, DEFAULT_FOLDER_TYPE};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub const SAMPLE_SOURCE_NAME: &str = "sample";

pub const PARAM_FOLDER_COUNT: &str = "folderCount";
pub const PARAM_FILES_PER_FOLDER: &str = "filesPerFolder";
pub const PARAM_VERSIONS_PER_FILE: &str = "versionsPerFile";

pub const COUNTER_FOLDERS: &str = "Folders synthesised";
pub const COUNTER_FILES: &str = "Files synthesised";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shape {
    folder_count: u64,
    files_per_folder: u64,
    versions_per_file: u64,
}

impl Default for Shape {
    fn default() -> Self {
        Self {
            folder_count: 3,
            files_per_folder: 2,
            versions_per_file: 10,
        }
    }
}

/// Generates `folderN` top-level folders, each with one `folderN.1` subfolder.
/// Every folder holds `filesPerFolder` files; the first file in each folder
/// carries `versionsPerFile` versions. One extra file sits at the root.
#[derive(Debug, Default)]
pub struct SampleSource {
    shape: RwLock<Shape>,
}

impl SampleSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn shape(&self) -> Shape {
        *self.shape.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folder paths in parent-first order.
    fn folder_paths(shape: &Shape) -> Vec<String> {
        let mut paths = Vec::new();
        for n in 1..=shape.folder_count {
            paths.push(format!("folder{}", n));
            paths.push(format!("folder{}/folder{}.1", n, n));
        }
        paths
    }

    fn folder_item(path: &str) -> Item {
        let (parent, name) = split_path(path);
        Item::directory(parent, name).with_version(
            Version::head()
                .with_type(DEFAULT_FOLDER_TYPE)
                .with_aspect("cm:titled")
                .with_property("cm:title", format!("Synthesised folder {}", name)),
        )
    }

    fn file_item(parent: Option<&str>, name: &str, versions: u64) -> Item {
        let path = match parent {
            Some(p) => format!("{}/{}", p, name),
            None => name.to_string(),
        };
        let mut item = Item::file(parent, name);
        for v in 1..=versions {
            let body = format!("Synthesised content of {}, version {}\n", path, v);
            let mut version = Version::numbered(VersionNumber::from_major(v as u32))
                .with_content(ContentRef::bytes(format!("sample:{}#{}", path, v), body.into_bytes()));
            if v == 1 {
                version = version
                    .with_type(DEFAULT_CONTENT_TYPE)
                    .with_property("cm:title", name.to_string());
            }
            if v > 1 {
                version = version.with_comment(format!("Synthesised revision {}", v));
            }
            item = item.with_version(version);
        }
        item
    }
}

fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    }
}

fn check(callback: &dyn ImportCallback) -> Result<()> {
    if callback.is_cancelled() {
        return Err(ImportError::Interrupted("synthesising sample items".to_string()));
    }
    Ok(())
}

impl Source for SampleSource {
    fn name(&self) -> &str {
        SAMPLE_SOURCE_NAME
    }

    fn description(&self) -> String {
        let shape = self.shape();
        format!(
            "Sample source ({} folders x {} files, up to {} versions)",
            shape.folder_count * 2,
            shape.files_per_folder,
            shape.versions_per_file
        )
    }

    fn init(&self, status: &ImportStatus, params: &ImportParameters) -> Result<()> {
        let defaults = Shape::default();
        let shape = Shape {
            folder_count: params.u64_or(PARAM_FOLDER_COUNT, defaults.folder_count)?,
            files_per_folder: params.u64_or(PARAM_FILES_PER_FOLDER, defaults.files_per_folder)?,
            versions_per_file: params
                .u64_or(PARAM_VERSIONS_PER_FILE, defaults.versions_per_file)?
                .max(1),
        };
        if shape.versions_per_file > u64::from(u32::MAX) {
            return Err(ImportError::InvalidParameter {
                name: PARAM_VERSIONS_PER_FILE.to_string(),
                message: "too many versions".to_string(),
            });
        }
        *self.shape.write().unwrap_or_else(PoisonError::into_inner) = shape;
        status.preregister_source_counters(&[COUNTER_FOLDERS, COUNTER_FILES]);
        debug!(?shape, "Sample source initialised");
        Ok(())
    }

    fn scan_folders(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()> {
        let shape = self.shape();
        for path in Self::folder_paths(&shape) {
            check(callback)?;
            status.set_currently_scanning(Some(path.clone()));
            callback.submit(Self::folder_item(&path))?;
            status.increment_source_counter(COUNTER_FOLDERS);
        }
        Ok(())
    }

    fn scan_files(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()> {
        let shape = self.shape();
        check(callback)?;
        callback.submit(Self::file_item(None, "file1.txt", 1))?;
        status.increment_source_counter(COUNTER_FILES);

        for folder in Self::folder_paths(&shape) {
            status.set_currently_scanning(Some(folder.clone()));
            for k in 1..=shape.files_per_folder {
                check(callback)?;
                let versions = if k == 1 { shape.versions_per_file } else { 1 };
                let name = format!("file{}.txt", k);
                callback.submit(Self::file_item(Some(folder.as_str()), &name, versions))?;
                status.increment_source_counter(COUNTER_FILES);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        items: Mutex<Vec<Item>>,
    }

    impl ImportCallback for Collect {
        fn submit(&self, item: Item) -> Result<()> {
            item.validate()?;
            self.items.lock().unwrap().push(item);
            Ok(())
        }

        fn is_cancelled(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_folders_are_parent_first() {
        let source = SampleSource::new();
        let status = ImportStatus::new();
        source.init(&status, &ImportParameters::new()).unwrap();
        let collect = Collect::default();
        source.scan_folders(&status, &collect).unwrap();

        let paths: Vec<String> = collect.items.lock().unwrap().iter().map(Item::path).collect();
        assert_eq!(
            paths,
            vec![
                "folder1",
                "folder1/folder1.1",
                "folder2",
                "folder2/folder2.1",
                "folder3",
                "folder3/folder3.1"
            ]
        );
        assert_eq!(status.source_counter(COUNTER_FOLDERS), Some(6));
    }

    #[test]
    fn test_files_shape_from_parameters() {
        let source = SampleSource::new();
        let status = ImportStatus::new();
        let params = ImportParameters::new()
            .with(PARAM_FOLDER_COUNT, "1")
            .with(PARAM_FILES_PER_FOLDER, "2")
            .with(PARAM_VERSIONS_PER_FILE, "4");
        source.init(&status, &params).unwrap();
        let collect = Collect::default();
        source.scan_files(&status, &collect).unwrap();

        let items = collect.items.lock().unwrap();
        // root file + 2 folders x 2 files
        assert_eq!(items.len(), 5);
        assert_eq!(items[1].path(), "folder1/file1.txt");
        assert_eq!(items[1].number_of_versions(), 4);
        assert_eq!(items[2].number_of_versions(), 1);
        assert_eq!(status.source_counter(COUNTER_FILES), Some(5));
    }

    #[test]
    fn test_bad_parameter_fails_init() {
        let source = SampleSource::new();
        let status = ImportStatus::new();
        let params = ImportParameters::new().with(PARAM_FOLDER_COUNT, "many");
        assert!(source.init(&status, &params).is_err());
    }
}

//! Item builders keyed by `/`-separated paths.

use bulkimport::model::{ContentRef, Item, Version, VersionNumber};

fn split(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    }
}

pub fn folder(path: &str) -> Item {
    let (parent, name) = split(path);
    Item::directory(parent, name).with_version(Version::head().with_type("cm:folder"))
}

/// Single-version file with streamed in-memory content.
pub fn text_file(path: &str, body: &str) -> Item {
    let (parent, name) = split(path);
    Item::file(parent, name).with_version(
        Version::head()
            .with_type("cm:content")
            .with_property("cm:title", name)
            .with_content(ContentRef::bytes(format!("mem:{}", path), body.as_bytes().to_vec())),
    )
}

/// File with `count` numbered major versions, each with content.
pub fn versioned_file(path: &str, count: u32) -> Item {
    let (parent, name) = split(path);
    (1..=count).fold(Item::file(parent, name), |item, n| {
        item.with_version(
            Version::numbered(VersionNumber::from_major(n))
                .with_content(ContentRef::bytes(
                    format!("mem:{}#{}", path, n),
                    format!("{} v{}", path, n).into_bytes(),
                ))
                .with_comment(format!("revision {}", n)),
        )
    })
}

/// Metadata-only file whose weight is exactly `weight`.
pub fn weighted_file(path: &str, weight: u32) -> Item {
    let (parent, name) = split(path);
    (1..=weight).fold(Item::file(parent, name), |item, n| {
        item.with_version(
            Version::numbered(VersionNumber::from_major(n)).with_property("cm:description", format!("v{}", n)),
        )
    })
}

/// `folders` top-level folders with `files` text files each, parent first.
pub fn tree(folders: usize, files: usize) -> (Vec<Item>, Vec<Item>) {
    let dirs = (0..folders).map(|f| folder(&format!("dir{}", f))).collect();
    let docs = (0..folders)
        .flat_map(|f| (0..files).map(move |n| (f, n)))
        .map(|(f, n)| text_file(&format!("dir{}/doc{}.txt", f, n), "content"))
        .collect();
    (dirs, docs)
}

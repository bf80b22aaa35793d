//! Items and versions handed from a source to the scanner.
//!
//! Sources build [`Item`] values by composition: an item is a node location
//! plus an ordered list of [`Version`]s, each of which carries metadata,
//! content, or both.

use crate::error::{ImportError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Bytes per weight step for streamed content.
pub const GIBIBYTE: u64 = 1024 * 1024 * 1024;

/// Extra weight per full gibibyte of streamed content.
pub const WEIGHT_PER_STREAMED_GIB: u64 = 100;

const VERSION_SCALE: i64 = 1_000_000;
const VERSION_FRACTION_DIGITS: usize = 6;

/// Decimal version number with six fractional digits ("1", "1.5", "2.25").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionNumber(i64);

impl VersionNumber {
    pub fn from_major(major: u32) -> Self {
        Self(i64::from(major) * VERSION_SCALE)
    }

    /// True if `self` is at least one whole version beyond `previous`.
    pub fn is_major_step_from(&self, previous: &VersionNumber) -> bool {
        self.0 - previous.0 >= VERSION_SCALE
    }
}

impl FromStr for VersionNumber {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ImportError::InvalidItem(format!("invalid version number '{}'", s));
        let trimmed = s.trim();
        let (whole, fraction) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if fraction.len() > VERSION_FRACTION_DIGITS || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let mut scaled_fraction = 0i64;
        for (i, digit) in fraction.bytes().enumerate() {
            let place = 10i64.pow((VERSION_FRACTION_DIGITS - 1 - i) as u32);
            scaled_fraction += i64::from(digit - b'0') * place;
        }
        whole
            .checked_mul(VERSION_SCALE)
            .and_then(|w| w.checked_add(scaled_fraction))
            .map(VersionNumber)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / VERSION_SCALE;
        let fraction = self.0 % VERSION_SCALE;
        if fraction == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:06}", fraction);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

/// Where a version's bytes come from.
#[derive(Debug, Clone)]
pub enum ContentData {
    File(PathBuf),
    Bytes(Arc<[u8]>),
}

/// A reference to one version's content.
#[derive(Debug, Clone)]
pub struct ContentRef {
    /// Human readable location, also used as the link target for in-place content.
    pub location: String,
    pub size_in_bytes: u64,
    /// Already where the target expects it; linked instead of copied.
    pub in_place: bool,
    data: ContentData,
}

impl ContentRef {
    pub fn file(path: impl Into<PathBuf>, size_in_bytes: u64, in_place: bool) -> Self {
        let path = path.into();
        Self {
            location: path.display().to_string(),
            size_in_bytes,
            in_place,
            data: ContentData::File(path),
        }
    }

    pub fn bytes(location: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            location: location.into(),
            size_in_bytes: bytes.len() as u64,
            in_place: false,
            data: ContentData::Bytes(bytes),
        }
    }

    pub fn data(&self) -> &ContentData {
        &self.data
    }

    /// Open the content for streaming.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.data {
            ContentData::File(path) => Ok(Box::new(File::open(path)?)),
            ContentData::Bytes(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }
}

/// One point in an item's history.
#[derive(Debug, Clone, Default)]
pub struct Version {
    number: Option<VersionNumber>,
    node_type: Option<String>,
    aspects: BTreeSet<String>,
    properties: BTreeMap<String, Value>,
    content: Option<ContentRef>,
    comment: Option<String>,
    metadata_source: Option<String>,
}

impl Version {
    /// A numbered version; use [`Version::head`] for the unnumbered latest one.
    pub fn numbered(number: VersionNumber) -> Self {
        Self {
            number: Some(number),
            ..Self::default()
        }
    }

    pub fn head() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_aspect(mut self, aspect: impl Into<String>) -> Self {
        self.aspects.insert(aspect.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: ContentRef) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_metadata_source(mut self, source: impl Into<String>) -> Self {
        self.metadata_source = Some(source.into());
        self
    }

    /// `None` means head, which sorts after every numbered version.
    pub fn number(&self) -> Option<VersionNumber> {
        self.number
    }

    pub fn node_type(&self) -> Option<&str> {
        self.node_type.as_deref()
    }

    pub fn aspects(&self) -> &BTreeSet<String> {
        &self.aspects
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn content(&self) -> Option<&ContentRef> {
        self.content.as_ref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn metadata_source(&self) -> Option<&str> {
        self.metadata_source.as_deref()
    }

    pub fn has_metadata(&self) -> bool {
        self.node_type.is_some() || !self.aspects.is_empty() || !self.properties.is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// 1 for carrying anything, plus a surcharge per full GiB streamed.
    pub fn weight(&self) -> u64 {
        let mut weight = 0;
        if self.has_content() || self.has_metadata() {
            weight += 1;
        }
        if let Some(content) = self.content.as_ref().filter(|c| !c.in_place) {
            weight += WEIGHT_PER_STREAMED_GIB * (content.size_in_bytes / GIBIBYTE);
        }
        weight
    }

    fn sort_key(&self) -> (bool, Option<VersionNumber>) {
        (self.number.is_none(), self.number)
    }
}

/// One importable node (file or folder) with its versions in ascending order.
#[derive(Debug, Clone)]
pub struct Item {
    parent_path: Option<String>,
    name: String,
    namespace: Option<String>,
    parent_association: Option<String>,
    is_directory: bool,
    versions: Vec<Version>,
}

impl Item {
    pub fn directory(parent_path: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(parent_path, name, true)
    }

    pub fn file(parent_path: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(parent_path, name, false)
    }

    fn new(parent_path: Option<&str>, name: impl Into<String>, is_directory: bool) -> Self {
        let parent_path = parent_path
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            parent_path,
            name: name.into(),
            namespace: None,
            parent_association: None,
            is_directory,
            versions: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_parent_association(mut self, association: impl Into<String>) -> Self {
        self.parent_association = Some(association.into());
        self
    }

    /// Add a version, keeping the list in ascending version order.
    pub fn with_version(mut self, version: Version) -> Self {
        let key = version.sort_key();
        let at = self.versions.partition_point(|v| v.sort_key() <= key);
        self.versions.insert(at, version);
        self
    }

    /// Reject items the importer cannot apply.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ImportError::InvalidItem("item has an empty name".to_string()));
        }
        if self.versions.is_empty() {
            return Err(ImportError::InvalidItem(format!("{} has no versions", self)));
        }
        if let Some(v) = self.versions.iter().find(|v| !v.has_content() && !v.has_metadata()) {
            let label = v.number().map_or_else(|| "head".to_string(), |n| n.to_string());
            return Err(ImportError::InvalidItem(format!(
                "version {} of {} has neither content nor metadata",
                label, self
            )));
        }
        Ok(())
    }

    /// Parent path relative to the import target; `None` is the target itself.
    pub fn parent_path(&self) -> Option<&str> {
        self.parent_path.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn parent_association(&self) -> Option<&str> {
        self.parent_association.as_deref()
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Path of this item relative to the import target.
    pub fn path(&self) -> String {
        match &self.parent_path {
            Some(parent) => format!("{}/{}", parent, self.name),
            None => self.name.clone(),
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.versions
            .iter()
            .filter_map(|v| v.content())
            .map(|c| c.size_in_bytes)
            .sum()
    }

    pub fn number_of_versions(&self) -> usize {
        self.versions.len()
    }

    pub fn number_of_aspects(&self) -> usize {
        self.versions.iter().map(|v| v.aspects().len()).sum()
    }

    pub fn number_of_metadata_properties(&self) -> usize {
        self.versions.iter().map(|v| v.properties().len()).sum()
    }

    pub fn weight(&self) -> u64 {
        self.versions.iter().map(Version::weight).sum()
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent_path {
            Some(parent) => write!(f, "{}/{}", parent, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionNumber {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_number_parse_and_display() {
        assert_eq!(v("1").to_string(), "1");
        assert_eq!(v("1.5").to_string(), "1.5");
        assert_eq!(v("2.250").to_string(), "2.25");
        assert_eq!(v("0.000001").to_string(), "0.000001");
        assert!("".parse::<VersionNumber>().is_err());
        assert!("1.2.3".parse::<VersionNumber>().is_err());
        assert!("-1".parse::<VersionNumber>().is_err());
        assert!("1.1234567".parse::<VersionNumber>().is_err());
    }

    #[test]
    fn test_major_step() {
        assert!(v("2").is_major_step_from(&v("1")));
        assert!(v("2.5").is_major_step_from(&v("1.5")));
        assert!(!v("1.9").is_major_step_from(&v("1")));
        assert!(!v("1.1").is_major_step_from(&v("1")));
    }

    #[test]
    fn test_versions_sorted_with_head_last() {
        let item = Item::file(Some("docs"), "a.txt")
            .with_version(Version::head().with_type("cm:content"))
            .with_version(Version::numbered(v("2")).with_type("cm:content"))
            .with_version(Version::numbered(v("1.5")).with_type("cm:content"));

        let numbers: Vec<_> = item.versions().iter().map(|v| v.number()).collect();
        assert_eq!(numbers, vec![Some(v("1.5")), Some(v("2")), None]);
    }

    #[test]
    fn test_weight_counts_streamed_gigabytes_only() {
        let meta_only = Version::head().with_property("cm:title", "x");
        assert_eq!(meta_only.weight(), 1);

        let small = Version::head().with_content(ContentRef::bytes("mem", vec![0u8; 10]));
        assert_eq!(small.weight(), 1);

        let big_streamed =
            Version::head().with_content(ContentRef::file("/data/big.iso", 3 * GIBIBYTE + 5, false));
        assert_eq!(big_streamed.weight(), 301);

        let big_in_place =
            Version::head().with_content(ContentRef::file("/data/big.iso", 3 * GIBIBYTE, true));
        assert_eq!(big_in_place.weight(), 1);

        let item = Item::file(None, "big.iso")
            .with_version(Version::numbered(v("1")).with_content(ContentRef::file("/a", GIBIBYTE, false)))
            .with_version(Version::numbered(v("2")).with_property("cm:title", "t"));
        assert_eq!(item.weight(), 102);
    }

    #[test]
    fn test_validate() {
        assert!(Item::file(None, "empty.txt").validate().is_err());
        assert!(Item::file(None, "bare.txt").with_version(Version::head()).validate().is_err());
        assert!(Item::directory(None, "")
            .with_version(Version::head().with_type("cm:folder"))
            .validate()
            .is_err());
        assert!(Item::directory(Some("/a/"), "b")
            .with_version(Version::head().with_type("cm:folder"))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_paths_and_derived_counts() {
        let item = Item::file(Some("/a/b/"), "c.txt")
            .with_version(
                Version::numbered(v("1"))
                    .with_aspect("cm:titled")
                    .with_property("cm:title", "one")
                    .with_content(ContentRef::bytes("mem:1", b"hello".to_vec())),
            )
            .with_version(
                Version::numbered(v("2"))
                    .with_property("cm:title", "two")
                    .with_property("cm:description", "d")
                    .with_content(ContentRef::bytes("mem:2", b"hello world".to_vec())),
            );

        assert_eq!(item.parent_path(), Some("a/b"));
        assert_eq!(item.path(), "a/b/c.txt");
        assert_eq!(item.to_string(), "a/b/c.txt");
        assert_eq!(item.size_in_bytes(), 16);
        assert_eq!(item.number_of_versions(), 2);
        assert_eq!(item.number_of_aspects(), 1);
        assert_eq!(item.number_of_metadata_properties(), 3);
    }

    #[test]
    fn test_content_open_bytes() {
        let content = ContentRef::bytes("mem", b"abc".to_vec());
        let mut buf = String::new();
        content.open().unwrap().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");
        assert_eq!(content.size_in_bytes, 3);
    }
}

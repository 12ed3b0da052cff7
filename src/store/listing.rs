//! Container listings
//!
//! A listing page is a JSON array. Entries carrying a `subdir` key are
//! pseudo-directories produced by a delimiter query; every other entry
//! describes an object.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use percent_encoding::utf8_percent_encode;
use serde::Deserialize;

use super::object::RemoteObject;
use super::{StoreContext, QUERY_VALUE};
use crate::error::{Result, StoreError};

/// Stream of listing entries across pages
pub type ListingStream = Pin<Box<dyn Stream<Item = Result<ListingEntry>> + Send>>;

/// A pseudo-directory: a shared name prefix ending in the delimiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subdir {
    path: String,
    delimiter: char,
}

impl Subdir {
    pub fn new(path: impl Into<String>, delimiter: char) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }

    /// Full prefix, including the trailing delimiter
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Last path component without the trailing delimiter
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches(self.delimiter);
        match trimmed.rfind(self.delimiter) {
            Some(idx) => &trimmed[idx + self.delimiter.len_utf8()..],
            None => trimmed,
        }
    }
}

/// One entry of a container listing
#[derive(Debug, Clone)]
pub enum ListingEntry {
    Object(RemoteObject),
    Subdir(Subdir),
}

impl ListingEntry {
    /// Name of the object, or path of the subdir; used as the paging marker
    pub fn name(&self) -> &str {
        match self {
            ListingEntry::Object(object) => object.name(),
            ListingEntry::Subdir(subdir) => subdir.path(),
        }
    }

    pub fn is_subdir(&self) -> bool {
        matches!(self, ListingEntry::Subdir(_))
    }

    pub fn as_object(&self) -> Option<&RemoteObject> {
        match self {
            ListingEntry::Object(object) => Some(object),
            ListingEntry::Subdir(_) => None,
        }
    }
}

/// Object entry of a listing page
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ObjectRecord {
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Subdir { subdir: String },
    Object(ObjectRecord),
}

/// Container entry of an account listing
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ContainerRecord {
    pub name: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub bytes: u64,
}

/// Query parameters of a listing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<char>,
    pub path: Option<String>,
    pub limit: Option<usize>,
    pub marker: Option<String>,
}

impl ListingQuery {
    pub(crate) fn to_query_string(&self) -> String {
        let mut params = vec!["format=json".to_string()];
        let mut push = |key: &str, value: &str| {
            params.push(format!(
                "{}={}",
                key,
                utf8_percent_encode(value, QUERY_VALUE)
            ));
        };

        if let Some(prefix) = &self.prefix {
            push("prefix", prefix);
        }
        if let Some(delimiter) = self.delimiter {
            push("delimiter", &delimiter.to_string());
        }
        if let Some(path) = &self.path {
            push("path", path);
        }
        if let Some(limit) = self.limit {
            push("limit", &limit.to_string());
        }
        if let Some(marker) = &self.marker {
            push("marker", marker);
        }
        params.join("&")
    }
}

pub(crate) fn parse_listing(
    body: &[u8],
    container: &str,
    context: &Arc<StoreContext>,
    delimiter: char,
) -> Result<Vec<ListingEntry>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawEntry> = serde_json::from_slice(body).map_err(|e| {
        StoreError::InvalidArgument(format!("Malformed listing of {}: {}", container, e))
    })?;

    Ok(raw
        .into_iter()
        .map(|entry| match entry {
            RawEntry::Subdir { subdir } => ListingEntry::Subdir(Subdir::new(subdir, delimiter)),
            RawEntry::Object(record) => ListingEntry::Object(RemoteObject::from_record(
                container,
                record,
                Arc::clone(context),
            )),
        })
        .collect())
}

pub(crate) fn parse_container_listing(body: &[u8]) -> Result<Vec<ContainerRecord>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(body)
        .map_err(|e| StoreError::InvalidArgument(format!("Malformed account listing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_subdir_name() {
        assert_eq!(Subdir::new("a/c/", '/').name(), "c");
        assert_eq!(Subdir::new("a/", '/').name(), "a");
        assert_eq!(Subdir::new("x|y|", '|').name(), "y");
    }

    #[test]
    fn test_query_string_encodes_values() {
        let query = ListingQuery {
            prefix: Some("my dir/".to_string()),
            delimiter: Some('/'),
            limit: Some(10),
            marker: Some("my dir/b&c".to_string()),
            ..Default::default()
        };
        assert_eq!(
            query.to_query_string(),
            "format=json&prefix=my%20dir%2F&delimiter=%2F&limit=10&marker=my%20dir%2Fb%26c"
        );
        assert_eq!(ListingQuery::default().to_query_string(), "format=json");
    }

    #[test]
    fn test_parse_listing_tags_entries() {
        let transport = Arc::new(MemoryTransport::new());
        let context = Arc::new(StoreContext::new(
            transport.endpoint().to_string(),
            "tk",
            transport,
        ));
        let body = br#"[
            {"name": "a/b.txt", "hash": "abc", "bytes": 3, "content_type": "text/plain",
             "last_modified": "2024-03-01T12:30:45.123456"},
            {"subdir": "a/c/"}
        ]"#;

        let entries = parse_listing(body, "c", &context, '/').unwrap();
        assert_eq!(entries.len(), 2);

        let object = entries[0].as_object().unwrap();
        assert_eq!(object.name(), "a/b.txt");
        assert_eq!(object.remote_length(), 3);
        assert_eq!(object.etag(), "abc");
        assert!(!object.has_local_content());

        assert!(entries[1].is_subdir());
        assert_eq!(entries[1].name(), "a/c/");
    }

    #[test]
    fn test_parse_container_listing() {
        let records =
            parse_container_listing(br#"[{"name": "photos", "count": 2, "bytes": 10}]"#).unwrap();
        assert_eq!(records[0].name, "photos");
        assert_eq!(records[0].count, 2);
        assert!(parse_container_listing(b"").unwrap().is_empty());
    }
}

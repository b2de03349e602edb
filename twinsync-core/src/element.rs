use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deepest path accepted anywhere in the broker. Recursive listings stop here too.
pub const MAX_PATH_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path segment is empty")]
    EmptySegment,
    #[error("path contains unsupported segment: {0}")]
    UnsupportedSegment(String),
    #[error("path is deeper than {} segments", MAX_PATH_DEPTH)]
    TooDeep,
    #[error("operation is not valid on the root path")]
    Root,
}

/// Root-anchored element path, stored as validated segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementPath {
    segments: Vec<String>,
}

impl ElementPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.len() > MAX_PATH_DEPTH {
            return Err(PathError::TooDeep);
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    pub fn parse(value: &str) -> Result<Self, PathError> {
        let trimmed = value.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        Self::from_segments(trimmed.trim_end_matches('/').split('/'))
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<ElementPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, segment: &str) -> Result<ElementPath, PathError> {
        if self.segments.len() >= MAX_PATH_DEPTH {
            return Err(PathError::TooDeep);
        }
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Same parent, different last segment.
    pub fn with_name(&self, name: &str) -> Result<ElementPath, PathError> {
        let parent = self.parent().ok_or(PathError::Root)?;
        parent.join(name)
    }

    /// `true` when `self` equals `other` or is one of its ancestors.
    pub fn is_ancestor_or_self(&self, other: &ElementPath) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Two paths overlap when one lies in the subtree of the other.
    pub fn overlaps(&self, other: &ElementPath) -> bool {
        self.is_ancestor_or_self(other) || other.is_ancestor_or_self(self)
    }

    /// Re-roots `self` from under `from` to under `to`.
    pub fn rebase(&self, from: &ElementPath, to: &ElementPath) -> Option<ElementPath> {
        if !from.is_ancestor_or_self(self) {
            return None;
        }
        let mut segments = to.segments.clone();
        segments.extend_from_slice(&self.segments[from.segments.len()..]);
        if segments.len() > MAX_PATH_DEPTH {
            return None;
        }
        Some(Self { segments })
    }
}

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if segment == "." || segment == ".." || segment.contains('/') || segment.contains('\0') {
        return Err(PathError::UnsupportedSegment(segment.to_string()));
    }
    Ok(())
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for ElementPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ElementPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ElementPath> for String {
    fn from(value: ElementPath) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    File,
    Folder,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::File => "file",
            ElementType::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(ElementType::File),
            "folder" => Some(ElementType::Folder),
            _ => None,
        }
    }
}

/// Snapshot of one path as reported by a provider or kept as a baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataElement {
    pub path: ElementPath,
    pub element_type: ElementType,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified: i64,
    pub properties: Option<BTreeMap<String, String>>,
}

impl DataElement {
    pub fn file(path: ElementPath, size: u64, modified: i64) -> Self {
        Self {
            path,
            element_type: ElementType::File,
            size,
            modified,
            properties: None,
        }
    }

    /// Folders carry neither size nor date so they only drift on type or properties.
    pub fn folder(path: ElementPath) -> Self {
        Self {
            path,
            element_type: ElementType::Folder,
            size: 0,
            modified: 0,
            properties: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.element_type == ElementType::File
    }

    pub fn is_folder(&self) -> bool {
        self.element_type == ElementType::Folder
    }

    /// Drift check: type, size, date and properties, path ignored.
    pub fn same_state(&self, other: &DataElement) -> bool {
        self.element_type == other.element_type
            && self.size == other.size
            && self.modified == other.modified
            && self.properties == other.properties
    }
}

impl PartialEq for DataElement {
    fn eq(&self, other: &Self) -> bool {
        self.same_state(other)
    }
}

impl Eq for DataElement {}

/// Compares two optional snapshots the way job snapshots are compared.
pub fn same_snapshot(left: Option<&DataElement>, right: Option<&DataElement>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => left.same_state(right),
        _ => false,
    }
}

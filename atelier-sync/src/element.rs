//! Canvas data model shared by the server and the client mirror.
//!
//! JSON shape (camelCase, one object per element):
//! ```text
//! {
//!   "id": "note-1",
//!   "type": "note" | "folder" | "file" | "image" | "rectangleGroup",
//!   "position": { "x": 0, "y": 0 },
//!   "size": { "width": 200, "height": 150 },
//!   "content": "free text" | FileReference | GroupInfo,
//!   "style": { ... opaque ... },
//!   "metadata": { "createdAt": "...", "updatedAt": "...", "createdBy": "..." }
//! }
//! ```
//!
//! The sync core never looks inside `content` or `style`; it only keys on `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of element variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    Note,
    Folder,
    File,
    Image,
    RectangleGroup,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Note => "note",
            ElementKind::Folder => "folder",
            ElementKind::File => "file",
            ElementKind::Image => "image",
            ElementKind::RectangleGroup => "rectangleGroup",
        }
    }
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 2D position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Descriptor of a file held by the file-storage service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub filename: String,
    pub original_path: String,
    pub stored_path: String,
    pub mime_type: String,
    pub size: u64,
    pub checksum: String,
}

/// Metadata carried by group regions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<String>>,
}

/// Variant payload of an element.
///
/// Untagged: a JSON string is text, an object with the full file descriptor
/// is a file, any other object is group metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ElementContent {
    Text(String),
    File(FileReference),
    Group(GroupInfo),
}

impl ElementContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ElementContent::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for ElementContent {
    fn default() -> Self {
        ElementContent::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl ElementMetadata {
    pub fn new(created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            created_by: created_by.into(),
        }
    }
}

/// One visual object on the shared canvas.
///
/// The latest snapshot for an `id` fully replaces the previous one; there is
/// no field-level merge anywhere in the sync path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub position: Point,
    pub size: Size,
    #[serde(default)]
    pub content: ElementContent,
    /// Presentation hints, opaque to the sync core.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub style: serde_json::Value,
    pub metadata: ElementMetadata,
}

impl Element {
    /// Create a text note at the given position.
    pub fn note(id: impl Into<String>, text: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::Note,
            position: Point::ZERO,
            size: Size::new(200.0, 150.0),
            content: ElementContent::Text(text.into()),
            style: serde_json::Value::Null,
            metadata: ElementMetadata::new(created_by),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Point::new(x, y);
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size = Size::new(width, height);
        self
    }

    /// Stamp `updatedAt` with the current time.
    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }
}

/// Pointer position reported by a client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, element_id: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardKind {
    Text,
    Html,
    Image,
}

/// Clipboard entry shared between devices. Relayed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardData {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ClipboardKind,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
}

/// Upload notification emitted after the file service accepted a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: String,
}

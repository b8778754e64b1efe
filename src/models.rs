//! Core data models shared by ingestion and resolution.
//!
//! Metadata is validated into these explicit structs once, at the ingestion
//! boundary or when a row is read back from the store. Nothing downstream
//! inspects raw JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an architectural drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawingType {
    FloorPlan,
    Elevation,
    RoomSizes,
    SitePlan,
    Section,
    Detail,
    Other,
}

impl DrawingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrawingType::FloorPlan => "floor_plan",
            DrawingType::Elevation => "elevation",
            DrawingType::RoomSizes => "room_sizes",
            DrawingType::SitePlan => "site_plan",
            DrawingType::Section => "section",
            DrawingType::Detail => "detail",
            DrawingType::Other => "other",
        }
    }

    /// Parses the snake_case name. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "floor_plan" => Some(DrawingType::FloorPlan),
            "elevation" => Some(DrawingType::Elevation),
            "room_sizes" => Some(DrawingType::RoomSizes),
            "site_plan" => Some(DrawingType::SitePlan),
            "section" => Some(DrawingType::Section),
            "detail" => Some(DrawingType::Detail),
            "other" => Some(DrawingType::Other),
            _ => None,
        }
    }

    /// Human label, e.g. `"floor plan"`.
    pub fn label(&self) -> String {
        self.as_str().replace('_', " ")
    }
}

impl fmt::Display for DrawingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Result of classifying one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub house_type_code: Option<String>,
    pub drawing_type: DrawingType,
    pub description: String,
    pub confidence: Confidence,
}

/// Canonical form used for every house-type comparison.
pub fn normalize_house_type(code: &str) -> Option<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_uppercase())
    }
}

/// The unit a request is made on behalf of. Resolved once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitIdentity {
    pub unit_id: String,
    pub development_id: String,
    pub house_type_code: Option<String>,
}

impl UnitIdentity {
    /// Normalized house type, if the unit has one.
    pub fn house_type(&self) -> Option<String> {
        self.house_type_code
            .as_deref()
            .and_then(normalize_house_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Development {
    pub id: String,
    pub tenant_id: Option<String>,
    pub name: String,
}

/// Stored metadata for one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: String,
    pub development_id: String,
    pub file_name: String,
    pub title: String,
    /// Stable location of the blob (not a signed URL).
    pub file_url: String,
    /// Key inside the blob store.
    pub storage_path: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub discipline: String,
    /// `None` for rows ingested before classification existed.
    pub drawing_type: Option<DrawingType>,
    /// Explicit document kind set by an operator, e.g. `"floor_plan"`.
    pub doc_kind: Option<String>,
    pub house_type_code: Option<String>,
    /// Set only for unit-specific overrides.
    pub unit_id: Option<String>,
    pub tags: Vec<String>,
    pub description: String,
    pub created_at: i64,
}

impl DocumentMetadata {
    /// Normalized house type of the document, if any.
    pub fn house_type(&self) -> Option<String> {
        self.house_type_code
            .as_deref()
            .and_then(normalize_house_type)
    }

    /// Lower-cased text the resolvers match keywords against.
    pub fn match_text(&self) -> String {
        format!(
            "{} {} {} {}",
            self.file_name,
            self.title,
            self.discipline,
            self.drawing_type.map(|d| d.as_str()).unwrap_or("")
        )
        .to_lowercase()
    }
}

/// A chunk of a document's extracted text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// One file of an upload batch.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record of one file's ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    pub id: String,
    pub tenant_id: String,
    pub development_id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub chunks: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// A document handed back to a caller, with time-limited access URLs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDocument {
    pub id: String,
    pub title: String,
    pub file_name: String,
    pub file_url: String,
    pub signed_url: String,
    pub download_url: String,
    pub discipline: String,
    pub drawing_type: Option<DrawingType>,
    pub house_type_code: Option<String>,
}

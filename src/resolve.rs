//! Access-safe document lookup for a homeowner's unit.
//!
//! Every lookup starts from the [`UnitIdentity`] and drops documents that
//! belong to a different house type or are pinned to a different unit
//! *before* any keyword scoring. A unit without a house type therefore only
//! ever sees documents that have no house type either.
//!
//! "Not found" and access denials are [`LinkResolution`] values with
//! `found: false`, never errors.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::blob::BlobStore;
use crate::classify::drawing_types_for_topic;
use crate::models::{DocumentMetadata, DrawingType, ResolvedDocument, UnitIdentity};
use crate::store::Store;

pub const UNIT_NOT_FOUND: &str = "Unable to find your unit information.";
pub const NO_DOCUMENTS: &str = "No documents are currently available for your development.";
pub const NO_HOUSE_TYPE_MATCH: &str = "No documents match your house type.";
pub const DOCUMENT_NOT_FOUND: &str = "I couldn't find the specific document you're looking for. Please check the Documents tab for all available documents.";
pub const HOUSE_TYPE_UNKNOWN: &str = "Unable to determine your house type.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResolution {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<ResolvedDocument>,
    pub explanation: String,
}

impl LinkResolution {
    pub fn not_found(explanation: impl Into<String>) -> Self {
        Self {
            found: false,
            document: None,
            explanation: explanation.into(),
        }
    }

    fn found(document: ResolvedDocument, explanation: String) -> Self {
        Self {
            found: true,
            document: Some(document),
            explanation,
        }
    }
}

/// Result of scanning a chat message for a document request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub is_link_request: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

static LINK_REQUEST_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b(download|link|view|preview|get|show|give|send)\s*(me\s*)?(a\s*)?(the\s*)?(download\s*)?(link|url|pdf|document|file|copy)\b",
        r"\bcan\s+(i|you)\s+(get|have|download|view|see|access)\s+(the\s*)?(it|this|that|them)\b",
        r"\b(where|how)\s+(can\s+i|do\s+i|to)\s+(find|get|download|access|view)\s+(it|them|the)\b",
        r"\bgive\s+me\s+(a\s+)?(link|copy|download)\b",
        r"\bsend\s+(me\s+)?(the|a)\s+(document|pdf|file|drawing)\b",
        r"\bdownload\s+(link|it|the|that)\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("valid regex"))
    .collect()
});

/// Keywords → canonical hint, first match wins.
const HINT_KEYWORDS: &[(&[&str], &str)] = &[
    (&["elevation", "elevations"], "elevation"),
    (&["floor plan", "floorplan", "floor plans"], "floor_plan"),
    (&["room size", "room sizes", "dimensions"], "room_sizes"),
    (&["site plan", "site layout"], "site_plan"),
    (&["section", "cross section"], "section"),
    (&["warranty", "guarantee"], "warranty"),
    (&["fire", "fire safety", "smoke alarm"], "fire"),
    (&["parking", "car park"], "parking"),
    (&["handover", "completion"], "handover"),
    (&["manual", "homeowner manual", "home manual"], "manual"),
    (&["specification", "spec", "specs"], "specification"),
    (&["certificate", "cert"], "certificate"),
    (&["drawing", "drawings"], "drawing"),
    (&["snag", "defect"], "snag"),
];

/// Detects "send me the floor plan"-style requests and extracts a hint.
pub fn detect_document_link_request(message: &str) -> LinkRequest {
    if !LINK_REQUEST_PATTERNS.iter().any(|re| re.is_match(message)) {
        return LinkRequest {
            is_link_request: false,
            hint: None,
        };
    }

    let lower = message.to_lowercase();
    let hint = HINT_KEYWORDS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, hint)| hint.to_string());

    LinkRequest {
        is_link_request: true,
        hint,
    }
}

/// One row of the keyword resolution table.
struct ResolverRule {
    search_terms: &'static [&'static str],
    doc_terms: &'static [&'static str],
    exclude_terms: &'static [&'static str],
    priority: u8,
}

impl ResolverRule {
    fn applies_to(&self, search_text: &str) -> bool {
        self.search_terms.iter().any(|t| search_text.contains(t))
    }

    fn accepts(&self, doc_text: &str) -> bool {
        self.doc_terms.iter().any(|t| doc_text.contains(t))
            && !self.exclude_terms.iter().any(|t| doc_text.contains(t))
    }
}

/// Evaluated top to bottom; priorities are non-decreasing.
const RESOLVER_RULES: &[ResolverRule] = &[
    ResolverRule {
        search_terms: &["elevation"],
        doc_terms: &["elevation", "elevations", "-elev-", "-elev."],
        exclude_terms: &["furnishing", "layout", "floor plan", "room size"],
        priority: 1,
    },
    ResolverRule {
        search_terms: &["floor plan", "floor_plan", "floorplan", "layout"],
        doc_terms: &[
            "floor plan",
            "floor_plan",
            "floorplan",
            "layout",
            "ground floor",
            "first floor",
        ],
        exclude_terms: &["elevation"],
        priority: 1,
    },
    ResolverRule {
        search_terms: &["room size", "room_sizes", "dimensions"],
        doc_terms: &["room size", "room_sizes", "dimensions"],
        exclude_terms: &[],
        priority: 1,
    },
    ResolverRule {
        search_terms: &["site plan", "site_plan"],
        doc_terms: &["site plan", "site_plan", "site layout"],
        exclude_terms: &[],
        priority: 1,
    },
    ResolverRule {
        search_terms: &["section", "cross section"],
        doc_terms: &["section", "cross section", "-sec-"],
        exclude_terms: &["elevation", "floor", "layout"],
        priority: 2,
    },
    ResolverRule {
        search_terms: &["warranty", "guarantee"],
        doc_terms: &["warranty", "guarantee"],
        exclude_terms: &[],
        priority: 2,
    },
    ResolverRule {
        search_terms: &["fire", "smoke"],
        doc_terms: &["fire", "smoke"],
        exclude_terms: &[],
        priority: 2,
    },
    ResolverRule {
        search_terms: &["manual", "homeowner"],
        doc_terms: &["manual", "homeowner"],
        exclude_terms: &[],
        priority: 3,
    },
    ResolverRule {
        search_terms: &["handover"],
        doc_terms: &["handover"],
        exclude_terms: &[],
        priority: 3,
    },
    ResolverRule {
        search_terms: &["parking", "car"],
        doc_terms: &["parking", "car"],
        exclude_terms: &[],
        priority: 3,
    },
    ResolverRule {
        search_terms: &["spec", "specification"],
        doc_terms: &["spec", "specification"],
        exclude_terms: &[],
        priority: 3,
    },
    ResolverRule {
        search_terms: &["cert", "certificate"],
        doc_terms: &["cert", "certificate"],
        exclude_terms: &[],
        priority: 3,
    },
];

/// Whether `unit` may see `doc`.
///
/// A document with a house type is visible only to units of that house
/// type; a document pinned to a unit only to that unit.
pub fn visible_to(doc: &DocumentMetadata, unit: &UnitIdentity) -> bool {
    if let Some(doc_type) = doc.house_type() {
        if unit.house_type().as_deref() != Some(doc_type.as_str()) {
            return false;
        }
    }
    match doc.unit_id.as_deref() {
        Some(pinned) => pinned == unit.unit_id,
        None => true,
    }
}

/// Signs view and download URLs for `doc`. A signing failure falls back to
/// the stored file URL.
pub async fn sign_document(
    blobs: &dyn BlobStore,
    ttl: Duration,
    doc: &DocumentMetadata,
) -> ResolvedDocument {
    let mut urls = Vec::with_capacity(2);
    for download in [false, true] {
        let url = match blobs
            .create_signed_url(&doc.storage_path, ttl, download)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(
                    document_id = %doc.id,
                    backend = blobs.name(),
                    download,
                    error = %e,
                    "signing failed, using stored file url"
                );
                doc.file_url.clone()
            }
        };
        urls.push(url);
    }
    let download_url = urls.pop().unwrap_or_default();
    let signed_url = urls.pop().unwrap_or_default();

    ResolvedDocument {
        id: doc.id.clone(),
        title: doc.title.clone(),
        file_name: doc.file_name.clone(),
        file_url: doc.file_url.clone(),
        signed_url,
        download_url,
        discipline: doc.discipline.clone(),
        drawing_type: doc.drawing_type,
        house_type_code: doc.house_type_code.clone(),
    }
}

fn topic_explanation(drawing_type: DrawingType, code: &str) -> String {
    match drawing_type {
        DrawingType::RoomSizes => format!(
            "I've found the Room Sizes drawing for your house type ({}). This document shows the dimensions and floor areas for each room, which should help answer your question.",
            code
        ),
        DrawingType::FloorPlan => format!(
            "I've attached the Floor Plan for your house type ({}). This shows the layout of rooms and can help you understand the space and dimensions.",
            code
        ),
        DrawingType::Elevation => format!(
            "Here are the Elevation drawings for your house type ({}). These show the external appearance of your home from different angles.",
            code
        ),
        DrawingType::SitePlan => "I've found the Site Plan for your development. This shows how your property sits within the overall scheme.".to_string(),
        DrawingType::Section => format!(
            "Here's a Section drawing for your house type ({}). This shows a cross-section view of the building construction.",
            code
        ),
        DrawingType::Detail => format!(
            "I've found a Construction Detail drawing for your house type ({}).",
            code
        ),
        DrawingType::Other => format!(
            "I've found a relevant drawing for your house type ({}).",
            code
        ),
    }
}

pub struct DocumentResolver {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    signed_url_ttl: Duration,
}

impl DocumentResolver {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, signed_url_ttl: Duration) -> Self {
        Self {
            store,
            blobs,
            signed_url_ttl,
        }
    }

    async fn unit(&self, unit_id: &str) -> Option<UnitIdentity> {
        match self.store.unit_identity(unit_id).await {
            Ok(unit) => unit,
            Err(e) => {
                tracing::error!(unit_id, error = %e, "unit lookup failed");
                None
            }
        }
    }

    async fn documents(&self, development_id: &str) -> Vec<DocumentMetadata> {
        match self.store.project_documents(development_id).await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::error!(development_id, error = %e, "document lookup failed");
                Vec::new()
            }
        }
    }

    /// Finds the document a homeowner asked for by `hint` (e.g.
    /// `"floor_plan"`), with optional surrounding chat `context`.
    pub async fn resolve(&self, unit_id: &str, hint: &str, context: Option<&str>) -> LinkResolution {
        let Some(unit) = self.unit(unit_id).await else {
            return LinkResolution::not_found(UNIT_NOT_FOUND);
        };

        let docs = self.documents(&unit.development_id).await;
        if docs.is_empty() {
            return LinkResolution::not_found(NO_DOCUMENTS);
        }

        let mut seen = HashSet::new();
        let visible: Vec<DocumentMetadata> = docs
            .into_iter()
            .filter(|d| seen.insert(d.file_name.clone()))
            .filter(|d| visible_to(d, &unit))
            .collect();
        if visible.is_empty() {
            tracing::info!(unit_id, house_type = ?unit.house_type(), "no documents for house type");
            return LinkResolution::not_found(NO_HOUSE_TYPE_MATCH);
        }

        let search_text = format!("{} {}", hint, context.unwrap_or("")).to_lowercase();
        let texts: Vec<String> = visible.iter().map(|d| d.match_text()).collect();

        let by_rule = RESOLVER_RULES
            .iter()
            .filter(|rule| rule.applies_to(&search_text))
            .find_map(|rule| texts.iter().position(|t| rule.accepts(t)));

        let chosen = by_rule.or_else(|| {
            let raw = hint.trim().to_lowercase();
            if raw.is_empty() {
                return None;
            }
            let spaced = raw.replace('_', " ");
            texts
                .iter()
                .position(|t| t.contains(&spaced) || t.contains(&raw))
        });

        let Some(index) = chosen else {
            tracing::debug!(unit_id, hint, "no document matched hint");
            return LinkResolution::not_found(DOCUMENT_NOT_FOUND);
        };
        let doc = &visible[index];

        let kind = match doc.drawing_type {
            Some(t) => t.label(),
            None if !doc.discipline.is_empty() => doc.discipline.replace('_', " "),
            None => "document".to_string(),
        };
        let resolved = sign_document(self.blobs.as_ref(), self.signed_url_ttl, doc).await;
        tracing::info!(unit_id, hint, document_id = %doc.id, "document resolved");
        LinkResolution::found(resolved, format!("Here's the {} document for your home.", kind))
    }

    /// Finds the drawing that answers a chat question `topic`, restricted to
    /// the unit's own house type.
    pub async fn resolve_topic(&self, unit_id: &str, topic: &str) -> LinkResolution {
        let Some(unit) = self.unit(unit_id).await else {
            return LinkResolution::not_found(UNIT_NOT_FOUND);
        };
        let Some(code) = unit.house_type() else {
            return LinkResolution::not_found(HOUSE_TYPE_UNKNOWN);
        };

        let wanted = drawing_types_for_topic(topic);
        if wanted.is_empty() {
            return LinkResolution::not_found("");
        }

        let candidates: Vec<DocumentMetadata> = self
            .documents(&unit.development_id)
            .await
            .into_iter()
            .filter(|d| visible_to(d, &unit) && d.house_type().as_deref() == Some(code.as_str()))
            .collect();

        for drawing_type in wanted {
            if let Some(doc) = candidates
                .iter()
                .find(|d| d.drawing_type == Some(*drawing_type))
            {
                let resolved = sign_document(self.blobs.as_ref(), self.signed_url_ttl, doc).await;
                return LinkResolution::found(resolved, topic_explanation(*drawing_type, &code));
            }
        }

        LinkResolution::not_found(format!("No drawings available for your house type ({}).", code))
    }
}

//! Drawing classification: house type and drawing type for an upload.
//!
//! Classification is a two-stage chain:
//!
//! 1. [`LocalClassifier`] applies filename/title patterns with no I/O.
//!    When it finds both a house type and a drawing type the result has
//!    `high` confidence and the oracle is never consulted.
//! 2. [`OracleClassifier`] asks the completion oracle for strict JSON and
//!    merges the reply with the local findings. Oracle failures and
//!    malformed replies are logged and the local result is used.
//!
//! AI-derived results are capped at `medium` confidence; anything without a
//! house type is `low`.

use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

use crate::config::OracleConfig;
use crate::models::{normalize_house_type, Classification, Confidence, DrawingType};
use crate::oracle::{create_oracle, CompletionOracle};

/// Characters of extracted text sent to the oracle.
const ORACLE_TEXT_PREVIEW_CHARS: usize = 2000;

static HOUSE_TYPE_PREFIXED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)house[_\s-]?type[_\s-]?([A-Z0-9]+)").expect("valid regex")
});
static TYPE_PREFIXED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)type[_\s-]?([A-Z]{1,2}\d{1,2})").expect("valid regex"));
static HOUSE_TYPE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^A-Za-z0-9])([A-Z]{1,3}\d{1,3}[A-Z]?)(?:$|[^A-Za-z0-9])")
        .expect("valid regex")
});

/// Keyword table in match priority order.
const DRAWING_KEYWORDS: &[(DrawingType, &[&str])] = &[
    (
        DrawingType::Elevation,
        &["elevation", "external view"],
    ),
    (
        DrawingType::FloorPlan,
        &[
            "floor plan",
            "floorplan",
            "ground floor",
            "first floor",
            "second floor",
            "floor level",
        ],
    ),
    (
        DrawingType::RoomSizes,
        &[
            "room size",
            "room dimensions",
            "room areas",
            "dimensions",
            "measurements",
        ],
    ),
    (
        DrawingType::SitePlan,
        &["site plan", "site layout", "location plan", "block plan"],
    ),
    (DrawingType::Section, &["section"]),
    (DrawingType::Detail, &["detail"]),
];

const ORACLE_SYSTEM_PROMPT: &str = r#"You are a construction drawing classifier. Given a filename and optional content from a drawing, extract:

1. house_type_code: the house type identifier (e.g. BD01, A02, C3). Look for patterns like "BD01", "A-02", "House Type BD01". Return null if not found.

2. drawing_type: one of
   - floor_plan: floor plans showing room layouts
   - elevation: external views of the building
   - room_sizes: room dimensions and measurements
   - site_plan: site layout or location plans
   - section: cross-section drawings
   - detail: construction details
   - other: unknown type

3. description: a brief description of what this drawing shows

Respond with a JSON object only:
{"house_type_code": "BD01" or null, "drawing_type": "floor_plan", "description": "..."}"#;

/// Findings of the local stage. Either field may be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFindings {
    pub house_type_code: Option<String>,
    pub drawing_type: Option<DrawingType>,
}

impl LocalFindings {
    pub fn is_complete(&self) -> bool {
        self.house_type_code.is_some() && self.drawing_type.is_some()
    }

    /// Local-only result: medium with a house type, low without.
    fn into_classification(self) -> Classification {
        let drawing_type = self.drawing_type.unwrap_or(DrawingType::Other);
        let confidence = if self.house_type_code.is_some() {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        Classification {
            description: describe(drawing_type, self.house_type_code.as_deref()),
            house_type_code: self.house_type_code,
            drawing_type,
            confidence,
        }
    }
}

/// Pattern-based classification with no I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClassifier;

impl LocalClassifier {
    pub fn classify(&self, filename: &str, title: Option<&str>) -> LocalFindings {
        LocalFindings {
            house_type_code: self.house_type(filename),
            drawing_type: self.drawing_type(filename, title),
        }
    }

    /// House-type code from a filename, upper-cased.
    ///
    /// Patterns are tried in order: `HOUSE-TYPE-<code>`, `TYPE-<code>`, then
    /// a delimiter-bounded token like `BD01`. A candidate must be 2-6 chars
    /// with at least one letter and one digit.
    pub fn house_type(&self, filename: &str) -> Option<String> {
        let stem = strip_extension(filename);

        for re in [&*HOUSE_TYPE_PREFIXED, &*TYPE_PREFIXED] {
            if let Some(code) = re
                .captures(stem)
                .and_then(|c| c.get(1))
                .and_then(|m| accept_house_type(m.as_str()))
            {
                return Some(code);
            }
        }

        HOUSE_TYPE_TOKEN
            .captures_iter(stem)
            .filter_map(|c| c.get(1))
            .find_map(|m| accept_house_type(m.as_str()))
    }

    /// First drawing type (in priority order) whose keyword appears in the
    /// filename or title.
    pub fn drawing_type(&self, filename: &str, title: Option<&str>) -> Option<DrawingType> {
        let text = format!("{} {}", filename, title.unwrap_or(""))
            .to_lowercase()
            .replace(['_', '-'], " ");
        DRAWING_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(t, _)| *t)
    }
}

fn strip_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(pos) if pos > 0 && !filename[pos + 1..].contains(['/', '\\']) => &filename[..pos],
        _ => filename,
    }
}

fn accept_house_type(candidate: &str) -> Option<String> {
    let code = candidate.to_ascii_uppercase();
    let len_ok = (2..=6).contains(&code.len());
    let has_letter = code.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = code.chars().any(|c| c.is_ascii_digit());
    if len_ok && has_letter && has_digit {
        Some(code)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct OracleReply {
    #[serde(default)]
    house_type_code: Option<String>,
    #[serde(default)]
    drawing_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Oracle fallback stage.
#[derive(Clone)]
pub struct OracleClassifier {
    oracle: Arc<dyn CompletionOracle>,
}

impl OracleClassifier {
    pub fn new(oracle: Arc<dyn CompletionOracle>) -> Self {
        Self { oracle }
    }

    /// Completes `local` with the oracle's answer. Never fails.
    pub async fn classify(
        &self,
        filename: &str,
        title: Option<&str>,
        extracted_text: Option<&str>,
        local: LocalFindings,
    ) -> Classification {
        let user = oracle_user_message(filename, title, extracted_text);

        let raw = match self.oracle.complete_json(ORACLE_SYSTEM_PROMPT, &user).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(file = filename, error = %e, "oracle classification failed, using local result");
                return local.into_classification();
            }
        };

        let reply: OracleReply = match serde_json::from_str(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(file = filename, error = %e, "malformed oracle reply, using local result");
                return local.into_classification();
            }
        };

        tracing::debug!(file = filename, ?reply, "oracle classification");
        merge(local, reply)
    }
}

fn oracle_user_message(filename: &str, title: Option<&str>, extracted_text: Option<&str>) -> String {
    let mut user = format!("Filename: {}", filename);
    if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
        user.push_str(&format!("\nTitle: {}", title));
    }
    if let Some(text) = extracted_text.filter(|t| !t.trim().is_empty()) {
        let preview: String = text.chars().take(ORACLE_TEXT_PREVIEW_CHARS).collect();
        user.push_str(&format!("\nContent preview: {}", preview));
    }
    user
}

/// Oracle house type wins unless null; oracle drawing type wins unless
/// missing, unknown or `other`.
fn merge(local: LocalFindings, reply: OracleReply) -> Classification {
    let house_type_code = reply
        .house_type_code
        .as_deref()
        .and_then(normalize_house_type)
        .or(local.house_type_code);

    let drawing_type = reply
        .drawing_type
        .as_deref()
        .and_then(DrawingType::parse)
        .filter(|t| *t != DrawingType::Other)
        .or(local.drawing_type)
        .unwrap_or(DrawingType::Other);

    let description = reply
        .description
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| describe(drawing_type, house_type_code.as_deref()));

    let confidence = if house_type_code.is_some() {
        Confidence::Medium
    } else {
        Confidence::Low
    };

    Classification {
        house_type_code,
        drawing_type,
        description,
        confidence,
    }
}

/// Local stage first, oracle only when the local stage is incomplete.
#[derive(Clone)]
pub struct DrawingClassifier {
    local: LocalClassifier,
    oracle: Option<OracleClassifier>,
}

impl DrawingClassifier {
    pub fn new(oracle: Option<Arc<dyn CompletionOracle>>) -> Self {
        Self {
            local: LocalClassifier,
            oracle: oracle.map(OracleClassifier::new),
        }
    }

    pub fn local_only() -> Self {
        Self::new(None)
    }

    pub fn from_config(config: &OracleConfig) -> anyhow::Result<Self> {
        if config.is_enabled() {
            Ok(Self::new(Some(create_oracle(config)?)))
        } else {
            Ok(Self::local_only())
        }
    }

    pub async fn classify(
        &self,
        filename: &str,
        title: Option<&str>,
        extracted_text: Option<&str>,
    ) -> Classification {
        let local = self.local.classify(filename, title);

        if let (Some(house_type), Some(drawing_type)) = (&local.house_type_code, local.drawing_type)
        {
            tracing::debug!(file = filename, house_type = %house_type, drawing_type = %drawing_type, "local classification");
            return Classification {
                description: describe(drawing_type, Some(house_type.as_str())),
                house_type_code: Some(house_type.clone()),
                drawing_type,
                confidence: Confidence::High,
            };
        }

        match &self.oracle {
            Some(oracle) => {
                oracle
                    .classify(filename, title, extracted_text, local)
                    .await
            }
            None => local.into_classification(),
        }
    }
}

/// Default description for a drawing.
pub fn describe(drawing_type: DrawingType, house_type: Option<&str>) -> String {
    let base = match drawing_type {
        DrawingType::FloorPlan => "Floor plan showing room layouts and dimensions",
        DrawingType::Elevation => "Elevation drawing showing external views of the building",
        DrawingType::RoomSizes => "Room sizes document with measurements for each room",
        DrawingType::SitePlan => "Site plan showing building location and surroundings",
        DrawingType::Section => "Section drawing showing building cross-section",
        DrawingType::Detail => "Construction detail drawing",
        DrawingType::Other => "Architectural drawing",
    };
    match house_type {
        Some(code) => format!("{} for house type {}", base, code),
        None => base.to_string(),
    }
}

static DISCIPLINE_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "architectural",
            r"\b(arch|architectural|floor.?plan|elevation|section|detail|ga\b)",
        ),
        (
            "structural",
            r"\b(struct|structural|foundation|beam|column|slab|rebar)",
        ),
        (
            "mechanical",
            r"\b(mech|mechanical|hvac|ventilat|heating|boiler)",
        ),
        (
            "electrical",
            r"\b(elec|electrical|lighting|power|socket|circuit)",
        ),
        (
            "plumbing",
            r"\b(plumb|plumbing|drainage|sanitary|water.?supply)",
        ),
        ("civil", r"\b(civil|site.?work|road|earthwork)"),
        ("landscape", r"\b(landscape|planting|hardscape)"),
        (
            "handover",
            r"\b(handover|warranty|manual|certificate|o&m|operation)",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        (
            name,
            Regex::new(&format!("(?i){}", pattern)).expect("valid regex"),
        )
    })
    .collect()
});

/// Engineering discipline guessed from a filename; `"general"` otherwise.
pub fn infer_discipline(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    DISCIPLINE_RULES
        .iter()
        .find(|(_, re)| re.is_match(&lower))
        .map(|(name, _)| *name)
        .unwrap_or("general")
}

const DIMENSION_TOPICS: &[&str] = &[
    "living_room_size",
    "kitchen_size",
    "bedroom_size",
    "bathroom_size",
    "floor_area",
    "room_sizes",
    "room_dimensions",
    "house_layout",
    "internal_floor_plans",
    "floor_plans",
];

const EXTERIOR_TOPICS: &[&str] = &[
    "house_exterior",
    "external_appearance",
    "external_elevations",
    "elevations",
];

/// Drawing types that answer a chat question topic, best first.
///
/// Only dimension and exterior questions are answered with drawings;
/// every other topic yields an empty list.
pub fn drawing_types_for_topic(topic: &str) -> &'static [DrawingType] {
    let topic = topic.trim().to_ascii_lowercase();
    if DIMENSION_TOPICS.contains(&topic.as_str()) {
        &[DrawingType::RoomSizes, DrawingType::FloorPlan]
    } else if EXTERIOR_TOPICS.contains(&topic.as_str()) {
        &[DrawingType::Elevation]
    } else {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a canned reply and counts calls.
    struct ScriptedOracle {
        reply: anyhow::Result<String>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn replying(json: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(json.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(anyhow::anyhow!("timeout")),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionOracle for ScriptedOracle {
        async fn complete_json(&self, _system: &str, _user: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[test]
    fn house_type_patterns() {
        let local = LocalClassifier;
        assert_eq!(local.house_type("BD01-Elevations.pdf"), Some("BD01".into()));
        assert_eq!(local.house_type("House-Type-A2B-plans.pdf"), Some("A2B".into()));
        assert_eq!(local.house_type("type_c3 ground floor.pdf"), Some("C3".into()));
        assert_eq!(local.house_type("Riverside_bd12_floor_plan.pdf"), Some("BD12".into()));
        assert_eq!(local.house_type("scan003.pdf"), None);
        assert_eq!(local.house_type("Elevations.pdf"), None);
    }

    #[test]
    fn extension_is_not_a_house_type() {
        // "mp4" would otherwise match the token pattern
        assert_eq!(LocalClassifier.house_type("walkthrough.mp4"), None);
    }

    #[test]
    fn drawing_type_priority() {
        let local = LocalClassifier;
        assert_eq!(
            local.drawing_type("BD01-Elevations.pdf", None),
            Some(DrawingType::Elevation)
        );
        assert_eq!(
            local.drawing_type("bd01_floor_plan.pdf", None),
            Some(DrawingType::FloorPlan)
        );
        // elevation outranks section
        assert_eq!(
            local.drawing_type("sections-and-elevations.pdf", None),
            Some(DrawingType::Elevation)
        );
        assert_eq!(
            local.drawing_type("A1.pdf", Some("Room Sizes Schedule")),
            Some(DrawingType::RoomSizes)
        );
        assert_eq!(local.drawing_type("scan003.pdf", None), None);
    }

    #[tokio::test]
    async fn complete_local_match_skips_oracle() {
        let oracle = ScriptedOracle::replying(r#"{"house_type_code":"ZZ9","drawing_type":"detail"}"#);
        let classifier = DrawingClassifier::new(Some(oracle.clone()));

        let c = classifier.classify("BD01-Elevations.pdf", None, None).await;
        assert_eq!(c.house_type_code.as_deref(), Some("BD01"));
        assert_eq!(c.drawing_type, DrawingType::Elevation);
        assert_eq!(c.confidence, Confidence::High);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn oracle_without_house_type_is_low() {
        let oracle =
            ScriptedOracle::replying(r#"{"house_type_code":null,"drawing_type":"other"}"#);
        let classifier = DrawingClassifier::new(Some(oracle.clone()));

        let c = classifier.classify("scan003.pdf", None, Some("scanned page")).await;
        assert_eq!(c.house_type_code, None);
        assert_eq!(c.drawing_type, DrawingType::Other);
        assert_eq!(c.confidence, Confidence::Low);
        assert_eq!(c.description, "Architectural drawing");
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn oracle_result_is_capped_at_medium() {
        let oracle = ScriptedOracle::replying(
            r#"{"house_type_code":"bd02","drawing_type":"floor_plan","description":"Ground floor"}"#,
        );
        let classifier = DrawingClassifier::new(Some(oracle));

        let c = classifier.classify("drawing-17.pdf", None, None).await;
        assert_eq!(c.house_type_code.as_deref(), Some("BD02"));
        assert_eq!(c.drawing_type, DrawingType::FloorPlan);
        assert_eq!(c.confidence, Confidence::Medium);
        assert_eq!(c.description, "Ground floor");
    }

    #[tokio::test]
    async fn local_house_type_survives_null_oracle_field() {
        let oracle = ScriptedOracle::replying(r#"{"house_type_code":null,"drawing_type":"section"}"#);
        let classifier = DrawingClassifier::new(Some(oracle));

        let c = classifier.classify("BD03-sheet.pdf", None, None).await;
        assert_eq!(c.house_type_code.as_deref(), Some("BD03"));
        assert_eq!(c.drawing_type, DrawingType::Section);
        assert_eq!(c.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn unknown_oracle_type_falls_back_to_local() {
        let oracle = ScriptedOracle::replying(r#"{"drawing_type":"blueprint"}"#);
        let classifier = DrawingClassifier::new(Some(oracle));

        let c = classifier.classify("Elevations.pdf", None, None).await;
        assert_eq!(c.drawing_type, DrawingType::Elevation);
        assert_eq!(c.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn malformed_reply_degrades_to_local() {
        let oracle = ScriptedOracle::replying("not json at all");
        let classifier = DrawingClassifier::new(Some(oracle.clone()));

        let c = classifier.classify("BD04.pdf", None, None).await;
        assert_eq!(c.house_type_code.as_deref(), Some("BD04"));
        assert_eq!(c.drawing_type, DrawingType::Other);
        assert_eq!(c.confidence, Confidence::Medium);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn oracle_error_degrades_to_local() {
        let oracle = ScriptedOracle::failing();
        let classifier = DrawingClassifier::new(Some(oracle.clone()));

        let c = classifier.classify("site plan.pdf", None, None).await;
        assert_eq!(c.drawing_type, DrawingType::SitePlan);
        assert_eq!(c.confidence, Confidence::Low);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn local_only_classifier_never_needs_oracle() {
        let c = DrawingClassifier::local_only()
            .classify("BD05 notes.txt", None, None)
            .await;
        assert_eq!(c.house_type_code.as_deref(), Some("BD05"));
        assert_eq!(c.confidence, Confidence::Medium);
    }

    #[test]
    fn user_message_truncates_preview() {
        let text = "x".repeat(5000);
        let msg = oracle_user_message("a.pdf", Some("Title"), Some(&text));
        assert!(msg.starts_with("Filename: a.pdf\nTitle: Title\nContent preview: "));
        assert_eq!(msg.matches('x').count(), ORACLE_TEXT_PREVIEW_CHARS);
    }

    #[test]
    fn descriptions() {
        assert_eq!(
            describe(DrawingType::Elevation, Some("BD01")),
            "Elevation drawing showing external views of the building for house type BD01"
        );
        assert_eq!(describe(DrawingType::Detail, None), "Construction detail drawing");
    }

    #[test]
    fn disciplines() {
        assert_eq!(infer_discipline("BD01 Floor Plan.pdf"), "architectural");
        assert_eq!(infer_discipline("foundation-layout.pdf"), "structural");
        assert_eq!(infer_discipline("Boiler Manual.pdf"), "mechanical");
        assert_eq!(infer_discipline("electrical_sockets.pdf"), "electrical");
        assert_eq!(infer_discipline("drainage.pdf"), "plumbing");
        assert_eq!(infer_discipline("planting schedule.pdf"), "landscape");
        assert_eq!(infer_discipline("Home Warranty.pdf"), "handover");
        assert_eq!(infer_discipline("brochure.pdf"), "general");
    }

    #[test]
    fn topics_map_to_drawing_types() {
        assert_eq!(
            drawing_types_for_topic("kitchen_size"),
            &[DrawingType::RoomSizes, DrawingType::FloorPlan]
        );
        assert_eq!(drawing_types_for_topic("elevations"), &[DrawingType::Elevation]);
        assert!(drawing_types_for_topic("boiler_brand").is_empty());
    }
}

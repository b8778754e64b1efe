//! Floor plan lookup for a unit, with tiered fallback.
//!
//! Only two kinds of document are ever eligible:
//!
//! 1. **Unit tier**: pinned to this unit (`unit_id` equals the unit).
//! 2. **House-type tier**: not pinned, house type equals the unit's.
//!
//! The unit tier wins when its detection finds at least one floor plan;
//! pinned documents that are not plans do not stop the house-type tier from
//! being searched. A document whose house type differs from the unit's is
//! never eligible, even when pinned to the unit, and a unit with no known
//! house type gets nothing at all.
//!
//! Within a tier, detection runs in stages and stops at the first stage
//! that finds something: explicit metadata, then discipline, then file
//! name pattern.

use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::blob::BlobStore;
use crate::models::{DocumentMetadata, DrawingType, ResolvedDocument, UnitIdentity};
use crate::resolve::{sign_document, visible_to, HOUSE_TYPE_UNKNOWN, UNIT_NOT_FOUND};
use crate::store::Store;

pub const MAX_FLOOR_PLANS: usize = 5;

static FLOOR_PLAN_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)floor[\s_-]?plan|floorplan|ground[\s_-]?floor|first[\s_-]?floor|room[\s_-]?sizes?|layout",
    )
    .expect("valid regex")
});

static NOT_A_PLAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)elevation|section|foundation").expect("valid regex"));

const PLAN_TAGS: &[&str] = &["floor plan", "floor_plan", "floorplan", "room sizes", "room_sizes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FloorPlanTier {
    Unit,
    HouseType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FloorPlanResolution {
    pub found: bool,
    pub documents: Vec<ResolvedDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<FloorPlanTier>,
    pub explanation: String,
}

impl FloorPlanResolution {
    fn not_found(explanation: impl Into<String>) -> Self {
        Self {
            found: false,
            documents: Vec::new(),
            tier: None,
            explanation: explanation.into(),
        }
    }
}

fn is_plan_type(t: DrawingType) -> bool {
    matches!(t, DrawingType::FloorPlan | DrawingType::RoomSizes)
}

fn metadata_says_plan(doc: &DocumentMetadata) -> bool {
    let kind = doc
        .doc_kind
        .as_deref()
        .map(|k| k.trim().to_lowercase().replace([' ', '-'], "_"));
    if matches!(kind.as_deref(), Some("floor_plan" | "floorplan" | "room_sizes")) {
        return true;
    }
    if doc.drawing_type.is_some_and(is_plan_type) {
        return true;
    }
    doc.tags.iter().any(|tag| {
        let tag = tag.to_lowercase();
        PLAN_TAGS.iter().any(|p| tag.contains(p))
    })
}

fn discipline_says_plan(doc: &DocumentMetadata, house_type: &str) -> bool {
    doc.discipline.eq_ignore_ascii_case("architectural")
        && doc.house_type().as_deref() == Some(house_type)
        && !NOT_A_PLAN.is_match(&doc.file_name)
        && !NOT_A_PLAN.is_match(&doc.title)
}

fn filename_says_plan(doc: &DocumentMetadata) -> bool {
    FLOOR_PLAN_FILENAME.is_match(&doc.file_name)
}

/// Runs the detection stages over one tier.
fn detect<'a>(tier: &[&'a DocumentMetadata], house_type: &str) -> Vec<&'a DocumentMetadata> {
    let stages: [&dyn Fn(&DocumentMetadata) -> bool; 3] = [
        &metadata_says_plan,
        &|d| discipline_says_plan(d, house_type),
        &filename_says_plan,
    ];
    for stage in stages {
        let hits: Vec<&DocumentMetadata> = tier.iter().copied().filter(|d| stage(d)).collect();
        if !hits.is_empty() {
            return hits;
        }
    }
    Vec::new()
}

pub struct FloorPlanFallbackResolver {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    signed_url_ttl: Duration,
}

impl FloorPlanFallbackResolver {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, signed_url_ttl: Duration) -> Self {
        Self {
            store,
            blobs,
            signed_url_ttl,
        }
    }

    pub async fn find(&self, unit_id: &str) -> FloorPlanResolution {
        let unit = match self.store.unit_identity(unit_id).await {
            Ok(Some(unit)) => unit,
            Ok(None) => return FloorPlanResolution::not_found(UNIT_NOT_FOUND),
            Err(e) => {
                tracing::error!(unit_id, error = %e, "unit lookup failed");
                return FloorPlanResolution::not_found(UNIT_NOT_FOUND);
            }
        };
        let Some(code) = unit.house_type() else {
            return FloorPlanResolution::not_found(HOUSE_TYPE_UNKNOWN);
        };

        let docs = match self.store.project_documents(&unit.development_id).await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::error!(unit_id, error = %e, "document lookup failed");
                Vec::new()
            }
        };

        let (tier, mut hits) = select_tier(&docs, &unit, &code);
        let Some(tier) = tier else {
            tracing::info!(unit_id, house_type = %code, "no floor plans found");
            return FloorPlanResolution::not_found(format!(
                "No floor plans are available for your house type ({}).",
                code
            ));
        };

        // explicit house type first, otherwise stable
        hits.sort_by_key(|d| d.house_type_code.is_none());
        hits.truncate(MAX_FLOOR_PLANS);

        let mut documents = Vec::with_capacity(hits.len());
        for doc in hits {
            documents.push(sign_document(self.blobs.as_ref(), self.signed_url_ttl, doc).await);
        }

        tracing::info!(unit_id, house_type = %code, ?tier, count = documents.len(), "floor plans resolved");
        let explanation = match tier {
            FloorPlanTier::Unit => "Here are the floor plans for your home.".to_string(),
            FloorPlanTier::HouseType => {
                format!("Here are the floor plans for your house type ({}).", code)
            }
        };
        FloorPlanResolution {
            found: true,
            documents,
            tier: Some(tier),
            explanation,
        }
    }
}

fn select_tier<'a>(
    docs: &'a [DocumentMetadata],
    unit: &UnitIdentity,
    code: &str,
) -> (Option<FloorPlanTier>, Vec<&'a DocumentMetadata>) {
    let visible: Vec<&DocumentMetadata> = docs.iter().filter(|d| visible_to(d, unit)).collect();

    let unit_tier: Vec<&DocumentMetadata> = visible
        .iter()
        .copied()
        .filter(|d| d.unit_id.as_deref() == Some(unit.unit_id.as_str()))
        .collect();
    let hits = detect(&unit_tier, code);
    if !hits.is_empty() {
        return (Some(FloorPlanTier::Unit), hits);
    }

    let house_tier: Vec<&DocumentMetadata> = visible
        .iter()
        .copied()
        .filter(|d| d.unit_id.is_none() && d.house_type().as_deref() == Some(code))
        .collect();
    let hits = detect(&house_tier, code);
    if !hits.is_empty() {
        return (Some(FloorPlanTier::HouseType), hits);
    }

    (None, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::models::Development;
    use crate::store::MemoryStore;

    fn doc(id: &str, file_name: &str, house_type: Option<&str>) -> DocumentMetadata {
        DocumentMetadata {
            id: id.to_string(),
            development_id: "dev-1".to_string(),
            file_name: file_name.to_string(),
            title: file_name.to_string(),
            file_url: format!("http://files/{}", file_name),
            storage_path: format!("dev-1/{}", file_name),
            mime_type: "application/pdf".to_string(),
            size_bytes: 1,
            discipline: "general".to_string(),
            drawing_type: None,
            doc_kind: None,
            house_type_code: house_type.map(|s| s.to_string()),
            unit_id: None,
            tags: vec![],
            description: String::new(),
            created_at: 1,
        }
    }

    async fn resolver(docs: Vec<DocumentMetadata>) -> FloorPlanFallbackResolver {
        let store = Arc::new(MemoryStore::new());
        store
            .add_development(&Development {
                id: "dev-1".into(),
                tenant_id: Some("t".into()),
                name: "Riverside".into(),
            })
            .await
            .unwrap();
        for (unit, ht) in [("u1", Some("BD01")), ("u2", Some("BD02")), ("u3", None)] {
            store
                .add_unit(&UnitIdentity {
                    unit_id: unit.into(),
                    development_id: "dev-1".into(),
                    house_type_code: ht.map(|s| s.to_string()),
                })
                .await
                .unwrap();
        }
        for d in docs {
            store.replace_document(&d, &[]).await.unwrap();
        }
        FloorPlanFallbackResolver::new(
            store,
            Arc::new(LocalBlobStore::new("/unused", "http://unitdocs.test", b"k")),
            Duration::from_secs(3600),
        )
    }

    fn ids(res: &FloorPlanResolution) -> Vec<&str> {
        res.documents.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn unknown_house_type_never_finds_anything() {
        let r = resolver(vec![doc("a", "Floor-Plan.pdf", None)]).await;
        let res = r.find("u3").await;
        assert!(!res.found);
        assert!(res.documents.is_empty());
        assert_eq!(res.explanation, HOUSE_TYPE_UNKNOWN);

        assert_eq!(r.find("missing").await.explanation, UNIT_NOT_FOUND);
    }

    #[tokio::test]
    async fn unit_tier_beats_house_type_tier() {
        let mut pinned = doc("pinned", "Plot-12-Floor-Plan.pdf", Some("BD01"));
        pinned.unit_id = Some("u1".into());
        let r = resolver(vec![doc("shared", "BD01-Floor-Plan.pdf", Some("BD01")), pinned]).await;

        let res = r.find("u1").await;
        assert_eq!(res.tier, Some(FloorPlanTier::Unit));
        assert_eq!(ids(&res), vec!["pinned"]);

        let r2 = resolver(vec![doc("shared", "BD01-Floor-Plan.pdf", Some("BD01"))]).await;
        let res = r2.find("u1").await;
        assert_eq!(res.tier, Some(FloorPlanTier::HouseType));
        assert_eq!(ids(&res), vec!["shared"]);
    }

    #[tokio::test]
    async fn pinned_non_plan_falls_through_to_house_type_tier() {
        let mut warranty = doc("warranty", "Plot-12-Warranty.pdf", Some("BD01"));
        warranty.unit_id = Some("u1".into());
        let r = resolver(vec![warranty, doc("shared", "BD01-Floor-Plan.pdf", Some("BD01"))]).await;

        let res = r.find("u1").await;
        assert!(res.found);
        assert_eq!(res.tier, Some(FloorPlanTier::HouseType));
        assert_eq!(ids(&res), vec!["shared"]);
        assert_eq!(res.explanation, "Here are the floor plans for your house type (BD01).");
    }

    #[tokio::test]
    async fn other_house_types_are_never_eligible() {
        let mut pinned_wrong = doc("wrong", "Floor-Plan.pdf", Some("BD02"));
        pinned_wrong.unit_id = Some("u1".into());
        let r = resolver(vec![
            pinned_wrong,
            doc("bd02", "BD02-Floor-Plan.pdf", Some("BD02")),
            doc("untyped", "Generic-Floor-Plan.pdf", None),
        ])
        .await;

        let res = r.find("u1").await;
        assert!(!res.found);
        assert_eq!(res.explanation, "No floor plans are available for your house type (BD01).");
    }

    #[tokio::test]
    async fn metadata_stage_shadows_filename_stage() {
        let mut tagged = doc("tagged", "BD01-A-101.pdf", Some("BD01"));
        tagged.drawing_type = Some(DrawingType::RoomSizes);
        let r = resolver(vec![doc("named", "BD01-Ground-Floor.pdf", Some("bd01")), tagged]).await;

        let res = r.find("u1").await;
        assert_eq!(ids(&res), vec!["tagged"]);
    }

    #[tokio::test]
    async fn discipline_stage_skips_elevations() {
        let mut elevation = doc("elev", "BD01-A-201 Elevations.pdf", Some("BD01"));
        elevation.discipline = "architectural".into();
        let mut plan = doc("ga", "BD01-A-100.pdf", Some("BD01"));
        plan.discipline = "Architectural".into();
        let r = resolver(vec![elevation, plan]).await;

        assert_eq!(ids(&r.find("u1").await), vec!["ga"]);
    }

    #[tokio::test]
    async fn results_are_capped_and_signed() {
        let docs = (0..7)
            .map(|i| {
                let mut d = doc(&format!("p{}", i), &format!("BD01-Floor-Plan-{}.pdf", i), Some("BD01"));
                d.doc_kind = Some("Floor Plan".into());
                d
            })
            .collect();
        let r = resolver(docs).await;

        let res = r.find("u1").await;
        assert!(res.found);
        assert_eq!(res.documents.len(), MAX_FLOOR_PLANS);
        assert_eq!(ids(&res), vec!["p0", "p1", "p2", "p3", "p4"]);
        assert!(res.documents[0].signed_url.contains("sig="));
        assert!(res.documents[0].download_url.contains("download=1"));
    }

    #[test]
    fn filename_pattern() {
        for name in ["BD01_floorplan.pdf", "ground-floor.pdf", "Room Sizes.pdf", "site layout.pdf"] {
            assert!(FLOOR_PLAN_FILENAME.is_match(name), "{}", name);
        }
        assert!(!FLOOR_PLAN_FILENAME.is_match("BD01-Elevations.pdf"));
    }
}

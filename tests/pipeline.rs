//! End-to-end library tests against SQLite and the local blob backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use unitdocs::config::{Config, LimitConfig};
use unitdocs::db;
use unitdocs::migrate;
use unitdocs::models::{Development, DrawingType, JobStatus, UnitIdentity, UploadFile};
use unitdocs::rate_limit::{RateLimiter, SqliteRateLimitStore};
use unitdocs::server::AppState;

const PDF: &str = "application/pdf";

fn test_config(root: &std::path::Path) -> Config {
    toml::from_str(&format!(
        r#"[db]
path = "{root}/data/unitdocs.sqlite"

[chunking]
max_tokens = 700

[server]
bind = "127.0.0.1:0"

[blob]
root = "{root}/blobs"
public_base_url = "http://unitdocs.test"
"#,
        root = root.display()
    ))
    .unwrap()
}

/// Minimal single-page PDF drawing `phrase` in Helvetica.
fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

async fn seeded_state(tmp: &TempDir) -> AppState {
    let config = test_config(tmp.path());
    let state = AppState::from_config(&config).await.unwrap();

    state
        .store
        .add_development(&Development {
            id: "dev-1".into(),
            tenant_id: Some("tenant-1".into()),
            name: "Riverside".into(),
        })
        .await
        .unwrap();
    for (unit, house_type) in [("u1", Some("BD01")), ("u2", Some("BD02")), ("u3", None)] {
        state
            .store
            .add_unit(&UnitIdentity {
                unit_id: unit.into(),
                development_id: "dev-1".into(),
                house_type_code: house_type.map(|s| s.to_string()),
            })
            .await
            .unwrap();
    }
    state
}

#[tokio::test]
async fn oversized_file_is_reported_but_batch_succeeds() {
    let tmp = TempDir::new().unwrap();
    let state = seeded_state(&tmp).await;

    let files = vec![
        UploadFile::new("BD01-Floor-Plan.pdf", PDF, minimal_pdf("ground floor")),
        UploadFile::new("BD01-Elevations.pdf", PDF, minimal_pdf("front elevation")),
        UploadFile::new("BD01-Section.pdf", PDF, minimal_pdf("section a-a")),
        UploadFile::new("big.pdf", PDF, vec![0u8; 50 * 1024 * 1024 + 1]),
    ];

    let outcome = state.trainer.handle_upload("dev-1", files).await.unwrap();
    let body = outcome.to_response();

    assert!(body.success);
    assert_eq!(body.total_files, 4);
    assert_eq!(body.valid_files, 3);
    assert_eq!(body.successful_files, 3);
    assert_eq!(body.failed_files, 0);
    assert!(body.failed_file_details.is_empty());
    assert_eq!(
        body.validation_errors,
        Some(vec!["big.pdf: File too large (max 50MB)".to_string()])
    );

    let jobs = state.store.jobs_for("tenant-1", "dev-1", 10).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn ingested_documents_resolve_only_for_matching_house_type() {
    let tmp = TempDir::new().unwrap();
    let state = seeded_state(&tmp).await;

    let files = vec![
        UploadFile::new("BD01-Elevations.pdf", PDF, minimal_pdf("bd01 front")),
        UploadFile::new("BD02-Elevations.pdf", PDF, minimal_pdf("bd02 front")),
        UploadFile::new("BD01-Floor-Plan.pdf", PDF, minimal_pdf("bd01 plan")),
        UploadFile::new(
            "Homeowner-Manual.txt",
            "text/plain; charset=utf-8",
            b"Welcome to your new home. Boiler instructions are on page 4.".to_vec(),
        ),
    ];
    let outcome = state.trainer.handle_upload("dev-1", files).await.unwrap();
    assert_eq!(outcome.report.successful_files.len(), 4);

    let docs = state.store.project_documents("dev-1").await.unwrap();
    let elevation = docs
        .iter()
        .find(|d| d.file_name == "BD02-Elevations.pdf")
        .unwrap();
    assert_eq!(elevation.house_type_code.as_deref(), Some("BD02"));
    assert_eq!(elevation.drawing_type, Some(DrawingType::Elevation));

    let res = state.resolver.resolve("u1", "elevation", None).await;
    assert!(res.found);
    assert_eq!(res.document.unwrap().file_name, "BD01-Elevations.pdf");

    let res = state.resolver.resolve("u2", "elevation", None).await;
    assert_eq!(res.document.unwrap().file_name, "BD02-Elevations.pdf");

    // no house type: typed drawings are hidden, shared documents are not
    assert!(!state.resolver.resolve("u3", "elevation", None).await.found);
    let res = state.resolver.resolve("u3", "manual", None).await;
    assert_eq!(res.document.unwrap().file_name, "Homeowner-Manual.txt");

    let plans = state.floor_plans.find("u1").await;
    assert!(plans.found);
    assert_eq!(plans.documents.len(), 1);
    assert_eq!(plans.documents[0].file_name, "BD01-Floor-Plan.pdf");
    assert!(!state.floor_plans.find("u2").await.found);
    assert!(!state.floor_plans.find("u3").await.found);

    let topic = state.resolver.resolve_topic("u1", "room_sizes").await;
    assert_eq!(topic.document.unwrap().file_name, "BD01-Floor-Plan.pdf");
    assert!(topic.explanation.starts_with("I've attached the Floor Plan for your house type (BD01)."));
}

#[tokio::test]
async fn reingesting_a_file_replaces_it() {
    let tmp = TempDir::new().unwrap();
    let state = seeded_state(&tmp).await;

    for text in ["first version", "second version"] {
        let file = UploadFile::new("Warranty.txt", "text/plain", text.as_bytes().to_vec());
        state.trainer.handle_upload("dev-1", vec![file]).await.unwrap();
    }

    let docs = state.store.project_documents("dev-1").await.unwrap();
    assert_eq!(docs.len(), 1);
    let jobs = state.store.jobs_for("tenant-1", "dev-1", 10).await.unwrap();
    assert_eq!(jobs.len(), 2);
}

async fn sqlite_limiter(tmp: &TempDir, max_requests: u32) -> RateLimiter {
    let config = test_config(tmp.path());
    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    RateLimiter::new(
        "train",
        LimitConfig {
            max_requests,
            window_secs: 60,
        },
        Arc::new(SqliteRateLimitStore::new(pool)),
    )
}

#[tokio::test]
async fn sqlite_window_rejects_over_max_and_recovers() {
    let tmp = TempDir::new().unwrap();
    let limiter = sqlite_limiter(&tmp, 3).await;
    let now = Utc::now();

    for expected_remaining in [2, 1, 0] {
        let d = limiter.check_at("tenant-1:train", now).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, expected_remaining);
    }
    let rejected = limiter.check_at("tenant-1:train", now).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);

    let later = rejected.reset_at + Duration::milliseconds(1);
    let d = limiter.check_at("tenant-1:train", later).await;
    assert!(d.allowed);
    assert_eq!(d.remaining, 2);
}

#[tokio::test]
async fn sqlite_window_is_atomic_under_concurrency() {
    let tmp = TempDir::new().unwrap();
    let limiter = sqlite_limiter(&tmp, 10).await;

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check("tenant-1:train").await.allowed })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
}

//! Upload batch validation.
//!
//! Batch-level problems (no files, too many files) reject the whole request.
//! Per-file problems only drop that file: the caller continues with the
//! valid subset and reports the messages alongside the results.
//!
//! Documents are keyed by file name within a development, so a second file
//! with the name of an already accepted one is rejected rather than
//! silently replacing it.

use std::collections::HashSet;

use crate::config::UploadConfig;
use crate::error::ValidationError;
use crate::extract::essence;
use crate::models::UploadFile;

/// Limits applied to one upload batch.
#[derive(Debug, Clone)]
pub struct UploadConstraints {
    pub max_file_bytes: u64,
    pub max_files: usize,
    pub allowed_types: Vec<String>,
}

impl From<&UploadConfig> for UploadConstraints {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            max_files: config.max_files,
            allowed_types: config.allowed_types.iter().map(|t| essence(t)).collect(),
        }
    }
}

impl Default for UploadConstraints {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub valid_files: Vec<UploadFile>,
    /// One `"<name>: <reason>"` line per rejected file, in input order.
    pub errors: Vec<String>,
}

pub struct FileValidator {
    constraints: UploadConstraints,
}

impl FileValidator {
    pub fn new(constraints: UploadConstraints) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &UploadConstraints {
        &self.constraints
    }

    /// Splits a batch into accepted files and per-file error messages.
    ///
    /// Fails only for batch-level problems; an outcome with zero valid
    /// files is returned as-is and the caller decides.
    pub fn validate(&self, files: Vec<UploadFile>) -> Result<ValidationOutcome, ValidationError> {
        if files.is_empty() {
            return Err(ValidationError::NoFiles);
        }
        if files.len() > self.constraints.max_files {
            return Err(ValidationError::TooManyFiles {
                count: files.len(),
                max: self.constraints.max_files,
            });
        }

        let mut outcome = ValidationOutcome::default();
        let mut accepted = HashSet::new();
        for file in files {
            let reason = self.check_file(&file).or_else(|| {
                accepted
                    .contains(&file.name)
                    .then(|| "Duplicate file name in batch".to_string())
            });
            if let Some(reason) = reason {
                tracing::debug!(file = %file.name, reason, "file rejected");
                outcome.errors.push(format!("{}: {}", file.name, reason));
            } else {
                accepted.insert(file.name.clone());
                outcome.valid_files.push(file);
            }
        }
        Ok(outcome)
    }

    fn check_file(&self, file: &UploadFile) -> Option<String> {
        if file.size() > self.constraints.max_file_bytes {
            return Some(format!(
                "File too large (max {}MB)",
                self.constraints.max_file_bytes / (1024 * 1024)
            ));
        }
        let mime = essence(&file.content_type);
        if !self.constraints.allowed_types.iter().any(|t| *t == mime) {
            return Some("Unsupported file type".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{MIME_PDF, MIME_TEXT};

    fn pdf(name: &str, size: usize) -> UploadFile {
        UploadFile::new(name, MIME_PDF, vec![0u8; size])
    }

    fn small_validator() -> FileValidator {
        FileValidator::new(UploadConstraints {
            max_file_bytes: 2 * 1024 * 1024,
            max_files: 3,
            allowed_types: vec![MIME_PDF.to_string(), MIME_TEXT.to_string()],
        })
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = small_validator().validate(vec![]).unwrap_err();
        assert!(matches!(err, ValidationError::NoFiles));
    }

    #[test]
    fn too_many_files_is_a_batch_error() {
        let files = (0..4).map(|i| pdf(&format!("{}.pdf", i), 10)).collect();
        let err = small_validator().validate(files).unwrap_err();
        assert!(matches!(err, ValidationError::TooManyFiles { count: 4, max: 3 }));
    }

    #[test]
    fn oversized_and_unsupported_files_are_dropped_individually() {
        let files = vec![
            pdf("plans.pdf", 100),
            pdf("huge.pdf", 3 * 1024 * 1024),
            UploadFile::new("photo.png", "image/png", vec![1, 2, 3]),
        ];
        let outcome = small_validator().validate(files).unwrap();
        assert_eq!(outcome.valid_files.len(), 1);
        assert_eq!(outcome.valid_files[0].name, "plans.pdf");
        assert_eq!(
            outcome.errors,
            vec![
                "huge.pdf: File too large (max 2MB)".to_string(),
                "photo.png: Unsupported file type".to_string(),
            ]
        );
    }

    #[test]
    fn later_duplicate_names_are_rejected() {
        let files = vec![
            pdf("huge.pdf", 3 * 1024 * 1024),
            pdf("huge.pdf", 10),
            pdf("plan.pdf", 10),
            pdf("plan.pdf", 20),
        ];
        let outcome = small_validator().validate(files).unwrap();
        // the oversized copy never took the name
        let kept: Vec<_> = outcome.valid_files.iter().map(|f| (f.name.as_str(), f.size())).collect();
        assert_eq!(kept, vec![("huge.pdf", 10), ("plan.pdf", 10)]);
        assert_eq!(
            outcome.errors,
            vec![
                "huge.pdf: File too large (max 2MB)".to_string(),
                "plan.pdf: Duplicate file name in batch".to_string(),
            ]
        );
    }

    #[test]
    fn mime_parameters_are_ignored() {
        let files = vec![UploadFile::new("notes.txt", "text/plain; charset=utf-8", b"hi".to_vec())];
        let outcome = small_validator().validate(files).unwrap();
        assert_eq!(outcome.valid_files.len(), 1);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn all_invalid_yields_empty_outcome() {
        let files = vec![UploadFile::new("a.exe", "application/x-msdownload", vec![0])];
        let outcome = small_validator().validate(files).unwrap();
        assert!(outcome.valid_files.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn default_constraints_match_upload_defaults() {
        let c = UploadConstraints::default();
        assert_eq!(c.max_files, 10);
        assert_eq!(c.max_file_bytes, 50 * 1024 * 1024);
        assert_eq!(c.allowed_types.len(), 5);
    }
}

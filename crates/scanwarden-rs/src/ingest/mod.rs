//! Normalization, deduplication and persistence of scanner results.

use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    db::Database,
    error::Result,
    models::{FindingStatus, IngestReport, NormalizedFinding},
    parser::{normalize_record, parse_results, ParseError},
};

/// Deterministic fingerprint of a finding's identity fields.
///
/// Absent fields hash as empty strings so that a record missing its matcher
/// name still lands on the same row every time.
pub fn content_hash(
    template_id: &str,
    host: &str,
    matched_at: &str,
    matcher_name: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_id.as_bytes());
    hasher.update(b"|");
    hasher.update(host.as_bytes());
    hasher.update(b"|");
    hasher.update(matched_at.as_bytes());
    hasher.update(b"|");
    hasher.update(matcher_name.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

impl NormalizedFinding {
    pub fn content_hash(&self) -> String {
        content_hash(
            &self.template_id,
            &self.host,
            &self.matched_at,
            self.matcher_name.as_deref(),
        )
    }
}

/// Reads and normalizes a results artifact. A missing file is a
/// [`ParseError::Missing`], which callers must keep apart from an empty result.
pub async fn load_artifact(path: &Path) -> Result<Vec<NormalizedFinding>, ParseError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ParseError::Missing(path.display().to_string()))
        }
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    };
    normalize_all(&raw)
}

pub fn normalize_all(raw: &[u8]) -> Result<Vec<NormalizedFinding>, ParseError> {
    parse_results(raw)?
        .iter()
        .enumerate()
        .map(|(i, v)| normalize_record(i, v))
        .collect()
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    db: Database,
}

impl Ingestor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upserts findings for `scan_id` in one transaction.
    ///
    /// Known findings get their payload, timestamps and scan reference
    /// refreshed; their triage status is kept, except that a finding marked
    /// `Fixed` or `Closed` which shows up again becomes `Regression`.
    pub async fn ingest(&self, scan_id: &str, findings: &[NormalizedFinding]) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if findings.is_empty() {
            return Ok(report);
        }

        let now = Utc::now();
        let mut tx = self.db.pool().begin().await?;
        for finding in findings {
            let hash = finding.content_hash();
            let existing: Option<(i64, FindingStatus)> =
                sqlx::query_as("SELECT id, status FROM findings WHERE content_hash = ?")
                    .bind(&hash)
                    .fetch_optional(&mut *tx)
                    .await?;

            match existing {
                Some((id, status)) => {
                    let status = match status {
                        FindingStatus::Fixed | FindingStatus::Closed => {
                            report.regressions += 1;
                            FindingStatus::Regression
                        }
                        other => other,
                    };
                    sqlx::query(
                        "UPDATE findings SET scan_id = ?, timestamp = ?, raw_payload = ?, request_raw = ?, response_raw = ?, status = ?, last_seen = ? WHERE id = ?",
                    )
                    .bind(scan_id)
                    .bind(&finding.timestamp)
                    .bind(&finding.raw_payload)
                    .bind(&finding.request_raw)
                    .bind(&finding.response_raw)
                    .bind(status.as_str())
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    report.updated += 1;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO findings(scan_id, template_id, template_path, name, severity, finding_type, host, matched_at, matcher_name, request_raw, response_raw, timestamp, content_hash, status, raw_payload, first_seen, last_seen) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'New', ?, ?, ?)",
                    )
                    .bind(scan_id)
                    .bind(&finding.template_id)
                    .bind(&finding.template_path)
                    .bind(&finding.name)
                    .bind(&finding.severity)
                    .bind(&finding.finding_type)
                    .bind(&finding.host)
                    .bind(&finding.matched_at)
                    .bind(&finding.matcher_name)
                    .bind(&finding.request_raw)
                    .bind(&finding.response_raw)
                    .bind(&finding.timestamp)
                    .bind(&hash)
                    .bind(&finding.raw_payload)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    report.inserted += 1;
                }
            }
            debug!(scan_id, hash = %hash, "finding upserted");
        }
        tx.commit().await?;

        info!(
            scan_id,
            inserted = report.inserted,
            updated = report.updated,
            regressions = report.regressions,
            "results ingested"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FindingStatus;

    const SAMPLE: &str = include_str!("../../fixtures/nuclei_results.json");

    #[test]
    fn content_hash_is_stable_and_field_sensitive() {
        let a = content_hash("t", "h", "m", Some("x"));
        assert_eq!(a, content_hash("t", "h", "m", Some("x")));
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("t", "h", "m", Some("y")));
        assert_ne!(a, content_hash("t", "h2", "m", Some("x")));
        assert_eq!(content_hash("t", "h", "m", None), content_hash("t", "h", "m", Some("")));
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        assert_ne!(
            content_hash("ab", "c", "", None),
            content_hash("a", "bc", "", None)
        );
    }

    #[tokio::test]
    async fn ingesting_twice_does_not_duplicate() {
        let db = Database::in_memory().await.unwrap();
        let ingestor = Ingestor::new(db.clone());
        let findings = normalize_all(SAMPLE.as_bytes()).unwrap();

        let first = ingestor.ingest("scan-1", &findings).await.unwrap();
        assert_eq!(first.inserted, 3);
        let second = ingestor.ingest("scan-2", &findings).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 3);
        assert_eq!(db.count_findings().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn triage_status_survives_reingest_but_fixed_regresses() {
        let db = Database::in_memory().await.unwrap();
        let ingestor = Ingestor::new(db.clone());
        let findings = normalize_all(SAMPLE.as_bytes()).unwrap();
        ingestor.ingest("scan-1", &findings).await.unwrap();

        let rows = db.list_findings(&Default::default()).await.unwrap();
        let confirmed = rows.iter().find(|f| f.template_id == "CVE-2021-44228").unwrap();
        let fixed = rows
            .iter()
            .find(|f| f.matcher_name.as_deref() == Some("x-frame-options"))
            .unwrap();
        db.set_finding_status(confirmed.id, FindingStatus::Confirmed).await.unwrap();
        db.set_finding_status(fixed.id, FindingStatus::Fixed).await.unwrap();

        let report = ingestor.ingest("scan-2", &findings).await.unwrap();
        assert_eq!(report.regressions, 1);
        assert_eq!(db.finding(confirmed.id).await.unwrap().status, FindingStatus::Confirmed);
        let regressed = db.finding(fixed.id).await.unwrap();
        assert_eq!(regressed.status, FindingStatus::Regression);
        assert_eq!(regressed.scan_id, "scan-2");
    }

    #[tokio::test]
    async fn missing_artifact_differs_from_empty_one() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_artifact(&missing).await,
            Err(ParseError::Missing(_))
        ));

        let empty = dir.path().join("empty.json");
        tokio::fs::write(&empty, b"[]").await.unwrap();
        assert!(load_artifact(&empty).await.unwrap().is_empty());
    }
}

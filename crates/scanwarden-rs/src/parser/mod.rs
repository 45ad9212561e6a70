use serde_json::Value;
use thiserror::Error;

use crate::models::NormalizedFinding;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("results artifact missing: {0}")]
    Missing(String),

    #[error("results artifact is not valid JSON: {0}")]
    Malformed(String),

    #[error("record {index} is invalid: {reason}")]
    InvalidRecord { index: usize, reason: String },
}

#[derive(Debug, serde::Deserialize)]
struct NucleiRecord {
    #[serde(rename = "template-id", alias = "templateId", alias = "template_id")]
    template_id: Option<String>,
    #[serde(rename = "template-path", alias = "templatePath", default)]
    template_path: Option<String>,
    #[serde(default)]
    info: Option<NucleiInfo>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(rename = "matched-at", alias = "matchedAt", default)]
    matched_at: Option<String>,
    #[serde(rename = "matcher-name", alias = "matcherName", default)]
    matcher_name: Option<String>,
    #[serde(default)]
    request: Option<String>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NucleiInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

/// Splits a results artifact into raw JSON records.
///
/// Accepts a JSON array, a single object (targeted rescans) or JSON lines.
/// Blank content is a valid, empty result.
pub fn parse_results(raw: &[u8]) -> Result<Vec<Value>, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(obj @ Value::Object(_)) => Ok(vec![obj]),
        Ok(other) => Err(ParseError::Malformed(format!(
            "expected an array or object, found {}",
            type_name(&other)
        ))),
        Err(whole) => trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match serde_json::from_str::<Value>(line) {
                Ok(obj @ Value::Object(_)) => Ok(obj),
                _ => Err(ParseError::Malformed(whole.to_string())),
            })
            .collect(),
    }
}

/// Maps one scanner record onto the normalized finding shape. Missing
/// identity fields fall back the way the scanner itself reports them:
/// `host` from `matched-at` and vice versa.
pub fn normalize_record(index: usize, value: &Value) -> Result<NormalizedFinding, ParseError> {
    let record: NucleiRecord =
        serde_json::from_value(value.clone()).map_err(|e| ParseError::InvalidRecord {
            index,
            reason: e.to_string(),
        })?;

    let template_id = record
        .template_id
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ParseError::InvalidRecord {
            index,
            reason: "missing template id".into(),
        })?;
    let info = record.info.unwrap_or(NucleiInfo {
        name: None,
        severity: None,
    });
    let host = record
        .host
        .clone()
        .or_else(|| record.matched_at.clone())
        .unwrap_or_default();
    let matched_at = record.matched_at.unwrap_or_else(|| host.clone());

    Ok(NormalizedFinding {
        name: info.name.unwrap_or_else(|| template_id.clone()),
        severity: info.severity.unwrap_or_else(|| "unknown".into()),
        template_id,
        template_path: record.template_path,
        finding_type: record.kind,
        host,
        matched_at,
        matcher_name: record.matcher_name,
        request_raw: record.request,
        response_raw: record.response,
        timestamp: record
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        raw_payload: value.to_string(),
    })
}

/// Stricter check for externally supplied files: every record must carry
/// `info.name`, `info.severity` and a template id.
pub fn validate_import_record(index: usize, value: &Value) -> Result<(), ParseError> {
    let has_str = |v: Option<&Value>| v.and_then(Value::as_str).is_some_and(|s| !s.is_empty());
    let info = value.get("info");
    let template = value
        .get("template-id")
        .or_else(|| value.get("templateId"))
        .or_else(|| value.get("template_id"));

    let missing: Vec<&str> = [
        ("info.name", has_str(info.and_then(|i| i.get("name")))),
        ("info.severity", has_str(info.and_then(|i| i.get("severity")))),
        ("template-id", has_str(template)),
    ]
    .into_iter()
    .filter_map(|(field, ok)| (!ok).then_some(field))
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ParseError::InvalidRecord {
            index,
            reason: format!("missing required fields: {}", missing.join(", ")),
        })
    }
}

/// Counts live hosts in a probe artifact (one JSON object per line).
pub fn count_probe_results(raw: &[u8]) -> Result<usize, ParseError> {
    Ok(parse_results(raw)?.len())
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../../fixtures/nuclei_results.json");

    #[test]
    fn parse_results_extracts_array_records() {
        let records = parse_results(SAMPLE.as_bytes()).expect("parse should work");
        assert_eq!(records.len(), 3);
        let finding = normalize_record(0, &records[0]).expect("normalize should work");
        assert_eq!(finding.template_id, "CVE-2021-44228");
        assert_eq!(finding.severity, "critical");
        assert_eq!(finding.host, "https://app.example.com");
        assert_eq!(finding.matcher_name.as_deref(), Some("log4j-rce"));
    }

    #[test]
    fn blank_artifact_is_empty_not_an_error() {
        assert!(parse_results(b"").unwrap().is_empty());
        assert!(parse_results(b"  \n").unwrap().is_empty());
        assert!(parse_results(b"[]").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_results(b"[{\"template-id\": "),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(parse_results(b"42"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn accepts_json_lines_and_single_objects() {
        let jsonl = b"{\"template-id\":\"a\",\"host\":\"h\"}\n{\"template-id\":\"b\",\"host\":\"h\"}\n";
        assert_eq!(parse_results(jsonl).unwrap().len(), 2);
        let single = b"{\"template-id\":\"a\",\"host\":\"h\"}";
        assert_eq!(parse_results(single).unwrap().len(), 1);
    }

    #[test]
    fn normalization_falls_back_between_host_and_matched_at() {
        let value = serde_json::json!({"templateId": "tech-detect", "matchedAt": "https://x.test/"});
        let finding = normalize_record(0, &value).unwrap();
        assert_eq!(finding.host, "https://x.test/");
        assert_eq!(finding.matched_at, "https://x.test/");
        assert_eq!(finding.name, "tech-detect");
    }

    #[test]
    fn records_without_template_are_rejected() {
        let value = serde_json::json!({"host": "h"});
        assert!(matches!(
            normalize_record(4, &value),
            Err(ParseError::InvalidRecord { index: 4, .. })
        ));
    }

    #[test]
    fn import_validation_names_missing_fields() {
        let value = serde_json::json!({"template-id": "x", "info": {"name": "X"}});
        let err = validate_import_record(1, &value).unwrap_err();
        assert!(err.to_string().contains("info.severity"));
        let ok = serde_json::json!({"template-id": "x", "info": {"name": "X", "severity": "low"}});
        assert!(validate_import_record(0, &ok).is_ok());
    }
}

//! Output rows: YAML preview plus a sha256 fingerprint per output field.

use carto_core::status::ResourceOutput;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::output::Output;

pub const PREVIEW_LIMIT: usize = 1024;

fn shorten(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn row(name: &str, value: &Value, now: &Time) -> Result<ResourceOutput, serde_yaml::Error> {
    let yaml = serde_yaml::to_string(value)?;
    let digest = Sha256::digest(yaml.as_bytes());
    Ok(ResourceOutput {
        name: name.to_string(),
        preview: shorten(&yaml, PREVIEW_LIMIT),
        digest: format!("sha256:{}", hex::encode(digest)),
        last_transition_time: now.clone(),
    })
}

/// Build status rows for an output.
///
/// A row whose digest matches the previous row of the same name keeps the
/// previous transition time.
pub fn output_rows(output: &Output, previous: &[ResourceOutput], now: Time) -> Result<Vec<ResourceOutput>, serde_yaml::Error> {
    let mut rows = Vec::new();
    for (name, value) in output.fields() {
        let mut r = row(name, value, &now)?;
        if let Some(prev) = previous.iter().find(|p| p.name == r.name) {
            if prev.digest == r.digest {
                r.last_transition_time = prev.last_transition_time.clone();
            }
        }
        rows.push(r);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).single().unwrap())
    }

    #[test]
    fn rows_for_source_output() {
        let out = Output::Source { url: json!("https://x"), revision: json!("abc") };
        let rows = output_rows(&out, &[], at(10)).unwrap();
        assert_eq!(rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["url", "revision"]);
        assert!(rows[0].digest.starts_with("sha256:"));
        assert_eq!(rows[0].digest.len(), "sha256:".len() + 64);
        assert_eq!(rows[0].preview.trim_end(), "https://x");
    }

    #[test]
    fn unchanged_digest_keeps_transition_time() {
        let first = output_rows(&Output::Image(json!("img:1")), &[], at(10)).unwrap();
        let same = output_rows(&Output::Image(json!("img:1")), &first, at(20)).unwrap();
        assert_eq!(same[0].last_transition_time, at(10));
        let moved = output_rows(&Output::Image(json!("img:2")), &first, at(30)).unwrap();
        assert_eq!(moved[0].last_transition_time, at(30));
        assert_ne!(moved[0].digest, first[0].digest);
    }

    #[test]
    fn preview_is_truncated() {
        let big = "x".repeat(PREVIEW_LIMIT * 2);
        let rows = output_rows(&Output::Config(json!(big)), &[], at(0)).unwrap();
        assert_eq!(rows[0].preview.len(), PREVIEW_LIMIT);
    }
}

//! Record extraction from raw catalog pages.

use crate::catalog::CatalogPage;
use crate::naming::is_valid_record_id;
use crate::types::{DigitalObjectRef, Record};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Records pulled out of one or more pages, plus the tallies needed for the
/// run summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Records with at least one digital object, in catalog order.
    pub records: Vec<Record>,
    /// Every entry looked at, including skipped ones.
    pub seen: usize,
    /// Entries skipped because of their shape.
    pub malformed: usize,
}

impl Extraction {
    /// Appends another extraction, keeping catalog order.
    pub fn merge(&mut self, other: Extraction) {
        self.records.extend(other.records);
        self.seen += other.seen;
        self.malformed += other.malformed;
    }
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_source")]
    source: RawSource,
}

#[derive(Deserialize)]
struct RawSource {
    record: RawRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    na_id: RawId,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    digital_objects: Option<Vec<RawObject>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObject {
    object_url: String,
    #[serde(default)]
    object_filename: Option<String>,
    #[serde(default)]
    object_type: Option<String>,
}

/// Maps a catalog page to the records that carry digital objects.
///
/// Entries that cannot be parsed are skipped and counted, never raised.
pub fn extract(page: &CatalogPage) -> Extraction {
    let mut extraction = Extraction::default();
    for hit in page.hits() {
        extraction.seen += 1;
        match parse_hit(hit) {
            Ok(Some(record)) => extraction.records.push(record),
            Ok(None) => {}
            Err(reason) => {
                warn!("Skipping malformed record on page {}: {}", page.cursor.0, reason);
                extraction.malformed += 1;
            }
        }
    }
    extraction
}

fn parse_hit(hit: &Value) -> Result<Option<Record>, String> {
    let raw: RawHit = RawHit::deserialize(hit).map_err(|e| e.to_string())?;
    let record = raw.source.record;

    let record_id = match record.na_id {
        RawId::Number(id) => id.to_string(),
        RawId::Text(id) if is_valid_record_id(id.trim()) => id.trim().to_string(),
        RawId::Text(id) => return Err(format!("unusable naId {:?}", id)),
    };

    let objects = record.digital_objects.unwrap_or_default();
    if objects.is_empty() {
        return Ok(None);
    }

    let mut digital_objects = Vec::with_capacity(objects.len());
    for object in objects {
        let source_url = object.object_url.trim().to_string();
        if source_url.is_empty() {
            return Err(format!("record {} has an object without objectUrl", record_id));
        }
        let suggested_filename = object
            .object_filename
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| filename_from_url(&source_url));
        digital_objects.push(DigitalObjectRef {
            source_url,
            suggested_filename,
            mime_hint: object.object_type,
        });
    }

    Ok(Some(Record {
        record_id,
        title: record.title.unwrap_or_default(),
        digital_objects,
    }))
}

/// Last path segment of a URL, without query or fragment.
fn filename_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

//! Deterministic names for everything written to disk.

use crate::types::Record;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Longest title fragment kept in a record directory name.
const MAX_TITLE_CHARS: usize = 80;

/// Byte ceiling for that fragment, keeping the whole directory name well under
/// the 255-byte component limit of common filesystems.
const MAX_TITLE_BYTES: usize = 160;

/// Raw catalog snapshot path for a series.
pub fn snapshot_path(output_root: &Path, series_id: &str) -> PathBuf {
    output_root.join(format!("results_{}.json", series_id))
}

/// Root directory holding every record directory of a series.
pub fn series_dir(output_root: &Path, series_id: &str) -> PathBuf {
    output_root.join(format!("output_{}", series_id))
}

/// `{recordId}_{snake_title}` directory of a record.
pub fn record_dir_name(record: &Record) -> String {
    let title = if record.title.trim().is_empty() {
        "untitled".to_string()
    } else {
        to_snake_case(&record.title)
    };
    let title = truncate_title(&title);
    format!("{}_{}", record.record_id, title)
}

/// Metadata CSV name inside a record directory.
pub fn csv_name(record_id: &str) -> String {
    format!("records_{}.csv", record_id)
}

/// Metadata CSV name for a record that never got a directory.
pub fn failed_csv_name(record_id: &str) -> String {
    format!("records_{}_failed.csv", record_id)
}

/// Series ids become file names, so only a conservative alphabet is allowed.
pub fn is_valid_series_id(series_id: &str) -> bool {
    is_safe_id(series_id)
}

/// Record ids are used verbatim in directory and CSV names and must be
/// distinct on disk whenever they are distinct in the catalog.
pub fn is_valid_record_id(record_id: &str) -> bool {
    is_safe_id(record_id)
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// First `MAX_TITLE_CHARS` characters, cut back to a char boundary within
/// `MAX_TITLE_BYTES`.
fn truncate_title(title: &str) -> &str {
    let mut end = 0;
    for (count, (offset, c)) in title.char_indices().enumerate() {
        if count == MAX_TITLE_CHARS || offset + c.len_utf8() > MAX_TITLE_BYTES {
            break;
        }
        end = offset + c.len_utf8();
    }
    &title[..end]
}

/// Lowercases and collapses every run of whitespace or non-word characters
/// into a single `_`.
pub fn to_snake_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_gap = false;
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            in_gap = false;
        } else if !in_gap {
            out.push('_');
            in_gap = true;
        }
    }
    out
}

/// Reduces a remote filename to a single safe path component.
fn sanitize_component(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => String::new(),
        trimmed => trimmed.to_string(),
    }
}

/// Chooses the on-disk filename of every object of a record, in catalog order.
///
/// The first object to claim a name keeps it; later ones become
/// `{stem}_{n}{ext}` with the smallest free `n >= 2`. The record's CSV name is
/// never handed out.
pub fn assign_filenames(record: &Record) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    taken.insert(csv_name(&record.record_id));
    taken.insert(failed_csv_name(&record.record_id));

    let mut names = Vec::with_capacity(record.digital_objects.len());
    for (index, object) in record.digital_objects.iter().enumerate() {
        let mut name = sanitize_component(&object.suggested_filename);
        if name.is_empty() {
            name = format!("object_{}", index + 1);
        }
        if taken.contains(&name) {
            let (stem, ext) = split_extension(&name);
            let mut n = 2;
            let renamed = loop {
                let candidate = format!("{}_{}{}", stem, n, ext);
                if !taken.contains(&candidate) {
                    break candidate;
                }
                n += 1;
            };
            warn!(
                "Record {}: filename {} already used, saving {} as {}",
                record.record_id, name, object.source_url, renamed
            );
            name = renamed;
        }
        taken.insert(name.clone());
        names.push(name);
    }
    names
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    }
}

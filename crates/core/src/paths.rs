use std::collections::{HashMap, HashSet};

use crate::models::FileRecord;

/// Fills in `path` for every record by walking parent links through the set.
///
/// A parent that is missing from the set ends the walk, as does a link back to a
/// record already on the current chain, so malformed hierarchies still terminate.
pub fn resolve_paths(mut records: Vec<FileRecord>) -> Vec<FileRecord> {
    let paths: Vec<String> = {
        let by_id: HashMap<&str, &FileRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();
        records.iter().map(|r| path_for(r, &by_id)).collect()
    };

    for (record, path) in records.iter_mut().zip(paths) {
        record.path = path;
    }
    records
}

fn path_for<'a>(record: &'a FileRecord, by_id: &HashMap<&'a str, &'a FileRecord>) -> String {
    let mut parts = vec![segment(record)];
    let mut visited: HashSet<&'a str> = HashSet::new();
    visited.insert(record.id.as_str());

    let mut current = record;
    while let Some(parent_id) = current.parent_id.as_deref() {
        if !visited.insert(parent_id) {
            break;
        }
        let Some(&parent) = by_id.get(parent_id) else {
            break;
        };
        parts.push(segment(parent));
        current = parent;
    }

    parts.reverse();
    parts.join("/")
}

// Unnamed items fall back to their id so the path is never empty.
fn segment(record: &FileRecord) -> &str {
    if record.name.is_empty() {
        &record.id
    } else {
        &record.name
    }
}

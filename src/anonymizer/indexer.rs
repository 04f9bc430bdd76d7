//! Search index extraction.

use serde_json::Value;

use crate::jobs::SearchIndexEntry;

/// Derives search index entries from a resource body.
pub trait SearchIndexer: Send + Sync {
    fn extract(&self, resource: &Value) -> Vec<SearchIndexEntry>;
}

/// Indexes every scalar leaf under its dotted field path.
///
/// Array positions are not part of the path, so `name[0].family` and
/// `name[1].family` both index as `name.family`.
#[derive(Debug, Clone, Default)]
pub struct FlatteningSearchIndexer;

impl SearchIndexer for FlatteningSearchIndexer {
    fn extract(&self, resource: &Value) -> Vec<SearchIndexEntry> {
        let mut entries = Vec::new();
        flatten(resource, &mut String::new(), &mut entries);
        entries
    }
}

fn flatten(value: &Value, path: &mut String, out: &mut Vec<SearchIndexEntry>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let len = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
                flatten(child, path, out);
                path.truncate(len);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| flatten(item, path, out)),
        Value::Null => {}
        Value::String(s) => out.push(entry(path, s.clone())),
        scalar => out.push(entry(path, scalar.to_string())),
    }
}

fn entry(path: &str, value: String) -> SearchIndexEntry {
    SearchIndexEntry {
        path: path.to_string(),
        value,
    }
}

//! Rule-driven de-identification of JSON resources.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use super::configuration::{
    AnonymizationMethod, AnonymizerConfiguration, ConfigurationError, is_type_segment,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnonymizeError {
    #[error("resource must be a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Key(String),
    Index(usize),
}

type NodePath = Vec<Segment>;

#[derive(Debug, Clone)]
struct CompiledRule {
    resource_type: Option<String>,
    segments: Vec<String>,
    method: AnonymizationMethod,
    replace_with: Option<Value>,
}

/// A validated configuration compiled for repeated use.
#[derive(Debug, Clone)]
pub struct AnonymizerEngine {
    configuration: AnonymizerConfiguration,
    rules: Vec<CompiledRule>,
}

/// Per-resource state for one `anonymize_resource` call.
struct Pass<'a> {
    engine: &'a AnonymizerEngine,
    date_shift_days: i64,
    processed: Vec<NodePath>,
    removals: Vec<NodePath>,
}

impl AnonymizerEngine {
    pub fn new(configuration: AnonymizerConfiguration) -> Result<Self, ConfigurationError> {
        configuration.validate()?;

        let rules = configuration
            .path_rules
            .iter()
            .map(|rule| {
                let mut segments: Vec<String> =
                    rule.path.split('.').map(|s| s.trim().to_string()).collect();
                let resource_type = if is_type_segment(&segments[0]) {
                    Some(segments.remove(0))
                } else {
                    None
                };
                CompiledRule {
                    resource_type,
                    segments,
                    method: rule.method,
                    replace_with: rule.replace_with.clone(),
                }
            })
            .collect();

        Ok(Self {
            configuration,
            rules,
        })
    }

    /// Engine that leaves every resource untouched.
    pub fn passthrough() -> Self {
        Self {
            configuration: AnonymizerConfiguration::default(),
            rules: Vec::new(),
        }
    }

    /// Returns a de-identified copy of `resource`.
    ///
    /// `resource_id` seeds the date shift so every date in one resource moves
    /// by the same offset.
    pub fn anonymize_resource(
        &self,
        resource_id: &str,
        resource: &Value,
    ) -> Result<Value, AnonymizeError> {
        if !resource.is_object() {
            return Err(AnonymizeError::NotAnObject);
        }

        let mut output = resource.clone();
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut pass = Pass {
            engine: self,
            date_shift_days: self.date_shift_days(resource_id),
            processed: Vec::new(),
            removals: Vec::new(),
        };

        for rule in &self.rules {
            if rule.resource_type.is_some() && rule.resource_type != resource_type {
                continue;
            }

            let mut matches = Vec::new();
            collect_matches(&output, &rule.segments, &mut Vec::new(), &mut matches);

            for path in matches {
                if pass.processed.iter().any(|p| path.starts_with(p)) {
                    continue;
                }
                pass.apply(&mut output, &path, rule);
                pass.processed.push(path);
            }
        }

        // Deepest and highest-index paths first so earlier removals never shift
        // a later one.
        pass.removals.sort();
        pass.removals.dedup();
        for path in pass.removals.iter().rev() {
            remove_at(&mut output, path);
        }

        Ok(output)
    }

    fn date_shift_days(&self, resource_id: &str) -> i64 {
        let Some(key) = self.configuration.parameters.date_shift_key.as_deref() else {
            return 0;
        };
        let range = i64::from(self.configuration.parameters.date_shift_range_days);
        let Some(digest) = hmac_digest(key, resource_id) else {
            return 0;
        };
        let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        i64::from(seed) % (2 * range + 1) - range
    }

    fn crypto_hash(&self, value: &Value) -> Option<Value> {
        let key = self.configuration.parameters.crypto_hash_key.as_deref()?;
        let input = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        hmac_digest(key, &input).map(|digest| Value::String(hex::encode(digest)))
    }
}

impl Pass<'_> {
    fn apply(&mut self, root: &mut Value, path: &NodePath, rule: &CompiledRule) {
        if rule.method == AnonymizationMethod::Keep {
            return;
        }

        let guarded = self
            .processed
            .iter()
            .any(|p| p.len() > path.len() && p.starts_with(path));

        if guarded {
            // An earlier rule owns part of this subtree; apply to the rest.
            let children: Vec<Segment> = match node(root, path) {
                Some(Value::Object(map)) => map.keys().cloned().map(Segment::Key).collect(),
                Some(Value::Array(items)) => (0..items.len()).map(Segment::Index).collect(),
                _ => Vec::new(),
            };
            for child in children {
                let mut child_path = path.clone();
                child_path.push(child);
                if self.processed.contains(&child_path) {
                    continue;
                }
                self.apply(root, &child_path, rule);
            }
            return;
        }

        match rule.method {
            AnonymizationMethod::Keep => {}
            AnonymizationMethod::Redact => self.removals.push(path.clone()),
            AnonymizationMethod::Substitute => {
                if let (Some(target), Some(replacement)) = (node_mut(root, path), &rule.replace_with)
                {
                    *target = replacement.clone();
                }
            }
            AnonymizationMethod::CryptoHash => {
                let engine = self.engine;
                if let Some(target) = node_mut(root, path) {
                    map_leaves(target, &|v| engine.crypto_hash(v));
                }
            }
            AnonymizationMethod::DateShift => {
                let days = self.date_shift_days;
                if let Some(target) = node_mut(root, path) {
                    map_leaves(target, &|v| v.as_str().and_then(|s| shift_date(s, days)));
                }
            }
        }
    }
}

fn collect_matches(
    value: &Value,
    segments: &[String],
    current: &mut NodePath,
    out: &mut Vec<NodePath>,
) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(current.clone());
        return;
    };

    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                current.push(Segment::Index(index));
                collect_matches(item, segments, current, out);
                current.pop();
            }
        }
        Value::Object(map) if head == "*" => {
            for (key, child) in map {
                current.push(Segment::Key(key.clone()));
                collect_matches(child, rest, current, out);
                current.pop();
            }
        }
        Value::Object(map) => {
            if let Some(child) = map.get(head) {
                current.push(Segment::Key(head.clone()));
                collect_matches(child, rest, current, out);
                current.pop();
            }
        }
        _ => {}
    }
}

fn node<'v>(root: &'v Value, path: &[Segment]) -> Option<&'v Value> {
    path.iter().try_fold(root, |value, segment| match segment {
        Segment::Key(key) => value.as_object()?.get(key),
        Segment::Index(index) => value.as_array()?.get(*index),
    })
}

fn node_mut<'v>(root: &'v mut Value, path: &[Segment]) -> Option<&'v mut Value> {
    path.iter().try_fold(root, |value, segment| match segment {
        Segment::Key(key) => value.as_object_mut()?.get_mut(key),
        Segment::Index(index) => value.as_array_mut()?.get_mut(*index),
    })
}

fn remove_at(root: &mut Value, path: &[Segment]) {
    let Some((last, parent_path)) = path.split_last() else {
        return;
    };
    match (node_mut(root, parent_path), last) {
        (Some(Value::Object(map)), Segment::Key(key)) => {
            map.remove(key);
        }
        (Some(Value::Array(items)), Segment::Index(index)) if *index < items.len() => {
            items.remove(*index);
        }
        _ => {}
    }
}

fn map_leaves(value: &mut Value, f: &dyn Fn(&Value) -> Option<Value>) {
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| map_leaves(v, f)),
        Value::Array(items) => items.iter_mut().for_each(|v| map_leaves(v, f)),
        leaf => {
            if let Some(replacement) = f(leaf) {
                *leaf = replacement;
            }
        }
    }
}

fn hmac_digest(key: &str, input: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(input.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

/// Shifts full dates and date-times by `days`, keeping their format.
/// Partial dates such as `1980` or `1980-04` are left alone.
fn shift_date(raw: &str, days: i64) -> Option<Value> {
    let delta = TimeDelta::try_days(days)?;

    if let Ok(date_time) = DateTime::parse_from_rfc3339(raw) {
        let shifted = date_time.checked_add_signed(delta)?;
        return Some(Value::String(format_like(raw, &shifted)));
    }

    if raw.len() == 10
        && let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    {
        let shifted = date.checked_add_signed(delta)?;
        return Some(Value::String(shifted.format("%Y-%m-%d").to_string()));
    }

    None
}

/// Renders `value` with the separator, fractional digit count and offset
/// style of `template`.
fn format_like(template: &str, value: &DateTime<FixedOffset>) -> String {
    let separator = template.get(10..11).unwrap_or("T");
    let digits = template
        .find('.')
        .map(|dot| {
            template[dot + 1..]
                .chars()
                .take_while(char::is_ascii_digit)
                .count()
        })
        .unwrap_or(0);

    let mut out = value
        .format(&format!("%Y-%m-%d{}%H:%M:%S", separator))
        .to_string();
    if digits > 0 {
        let nanos = format!("{:09}", value.timestamp_subsec_nanos());
        let kept = &nanos[..digits.min(9)];
        out.push('.');
        out.push_str(&format!("{:0<width$}", kept, width = digits));
    }
    match template.chars().last() {
        Some(zulu @ ('Z' | 'z')) => out.push(zulu),
        _ => out.push_str(&value.format("%:z").to_string()),
    }
    out
}

//! Feed payload normalization: raw JSON bytes in, canonical events out.
//!
//! The calendar feed has changed shape across deployments. Each known layout is a
//! [`ShapeStrategy`]; strategies are tried in order and the first that recognises the
//! document supplies the candidate event objects.

use calpull_core::NormalizedEvent;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "calpull-adapters";

type JsonObject = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("feed body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedShape {
    /// `{"events": [{"event": {...}}, ...]}`
    Wrapped,
    /// Event objects anywhere in the tree, found by a recursive walk.
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingTitle,
    MissingInstance,
    MissingExternalId,
    MissingStart,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingTitle => "missing title",
            Self::MissingInstance => "missing event instance",
            Self::MissingExternalId => "missing external id",
            Self::MissingStart => "missing or unparseable start",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    pub title: Option<String>,
    pub reason: SkipReason,
}

/// One feed candidate, kept in the position it had in the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEntry {
    Event(NormalizedEvent),
    Skipped(SkippedCandidate),
}

/// Everything one feed body yielded, in feed order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedBatch {
    pub shape: FeedShape,
    pub entries: Vec<FeedEntry>,
}

impl FeedBatch {
    pub fn events(&self) -> Vec<&NormalizedEvent> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                FeedEntry::Event(event) => Some(event),
                FeedEntry::Skipped(_) => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<&SkippedCandidate> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                FeedEntry::Skipped(skip) => Some(skip),
                FeedEntry::Event(_) => None,
            })
            .collect()
    }
}

pub trait ShapeStrategy: Sync {
    fn shape(&self) -> FeedShape;

    /// Candidate event objects, or `None` when the document is not in this shape.
    fn candidates<'a>(&self, root: &'a JsonValue) -> Option<Vec<Option<&'a JsonObject>>>;
}

pub struct WrappedShape;

impl ShapeStrategy for WrappedShape {
    fn shape(&self) -> FeedShape {
        FeedShape::Wrapped
    }

    fn candidates<'a>(&self, root: &'a JsonValue) -> Option<Vec<Option<&'a JsonObject>>> {
        let items = root.get("events")?.as_array()?;
        Some(
            items
                .iter()
                .map(|item| item.get("event").and_then(JsonValue::as_object))
                .collect(),
        )
    }
}

pub struct FlatShape;

impl ShapeStrategy for FlatShape {
    fn shape(&self) -> FeedShape {
        FeedShape::Flat
    }

    fn candidates<'a>(&self, root: &'a JsonValue) -> Option<Vec<Option<&'a JsonObject>>> {
        let mut out = Vec::new();
        walk_preorder(root, &mut out);
        Some(out)
    }
}

fn walk_preorder<'a>(node: &'a JsonValue, out: &mut Vec<Option<&'a JsonObject>>) {
    match node {
        JsonValue::Object(obj) => {
            if obj.contains_key("title") {
                out.push(Some(obj));
            }
            for child in obj.values() {
                walk_preorder(child, out);
            }
        }
        JsonValue::Array(items) => {
            for child in items {
                walk_preorder(child, out);
            }
        }
        _ => {}
    }
}

pub const STRATEGIES: &[&dyn ShapeStrategy] = &[&WrappedShape, &FlatShape];

pub fn normalize_feed(body: &[u8], tz: Tz) -> Result<FeedBatch, NormalizeError> {
    let root: JsonValue = serde_json::from_slice(body)?;
    Ok(normalize_value(&root, tz))
}

pub fn normalize_value(root: &JsonValue, tz: Tz) -> FeedBatch {
    let (shape, candidates) = STRATEGIES
        .iter()
        .find_map(|strategy| strategy.candidates(root).map(|c| (strategy.shape(), c)))
        .unwrap_or((FeedShape::Flat, Vec::new()));

    let mut entries = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let result = match candidate {
            Some(obj) => normalize_candidate(obj, tz),
            None => Err(SkippedCandidate {
                title: None,
                reason: SkipReason::MissingTitle,
            }),
        };
        match result {
            Ok(event) => entries.push(FeedEntry::Event(event)),
            Err(skip) => {
                debug!(title = ?skip.title, reason = %skip.reason, "feed candidate skipped");
                entries.push(FeedEntry::Skipped(skip));
            }
        }
    }

    FeedBatch { shape, entries }
}

fn normalize_candidate(obj: &JsonObject, tz: Tz) -> Result<NormalizedEvent, SkippedCandidate> {
    let Some(title) = obj.get("title").and_then(JsonValue::as_str) else {
        return Err(SkippedCandidate {
            title: None,
            reason: SkipReason::MissingTitle,
        });
    };
    let skip = |reason| SkippedCandidate {
        title: Some(title.to_string()),
        reason,
    };

    let instance = first_instance(obj).ok_or_else(|| skip(SkipReason::MissingInstance))?;
    let external_id = instance
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| skip(SkipReason::MissingExternalId))?;
    let start_at = instance
        .get("start")
        .and_then(JsonValue::as_str)
        .and_then(|raw| parse_timestamp(raw, tz))
        .ok_or_else(|| skip(SkipReason::MissingStart))?;
    let end_at = instance
        .get("end")
        .and_then(JsonValue::as_str)
        .and_then(|raw| parse_timestamp(raw, tz));

    let description = json_text(obj, "description_text")
        .or_else(|| json_text(obj, "description"))
        .unwrap_or_default();

    Ok(NormalizedEvent {
        title: title.to_string(),
        description,
        external_id,
        start_at,
        end_at,
        detail_url: json_text(obj, "localist_url"),
        image_url: json_text(obj, "photo_url"),
        slug: NormalizedEvent::slug_for(title),
    })
}

/// `event_instances[0].event_instance`, unwrapping nested instance arrays.
fn first_instance(obj: &JsonObject) -> Option<&JsonObject> {
    let mut cur = obj.get("event_instances")?;
    loop {
        match cur {
            JsonValue::Array(items) => cur = items.first()?,
            JsonValue::Object(wrapper) => return wrapper.get("event_instance")?.as_object(),
            _ => return None,
        }
    }
}

fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_text(obj: &JsonObject, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a feed timestamp into `tz`.
///
/// Offset-bearing values are converted; naive values are read as wall-clock time in `tz`.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return localize(naive, tz);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|naive| localize(naive, tz))
}

fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    // Ambiguous DST wall times resolve to the earlier instant; skipped ones don't exist.
    tz.from_local_datetime(&naive).earliest()
}

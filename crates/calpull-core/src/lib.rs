//! Core domain model for calpull: canonical feed events and the local records they map onto.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "calpull-core";

/// Category assigned to newly created records ("all news").
pub const DEFAULT_CATEGORY: i64 = 43;

/// Hourly, in the six-field cron dialect (seconds first).
pub const DEFAULT_SCHEDULE: &str = "0 0 * * * *";

/// Metadata keys written onto every synchronized record.
pub mod meta {
    pub const EVENT_DATE: &str = "event_date";
    pub const EVENT_START_TIME: &str = "event_start_time";
    pub const EVENT_END_TIME: &str = "event_end_time";
    pub const IS_EVENT: &str = "is_event";
    pub const CALENDAR_URL: &str = "calendar_url";
    pub const CALENDAR_ID: &str = "calendar_id";
    pub const CALENDAR_IMAGE: &str = "calendar_image";
}

const DATE_KEY_FORMAT: &str = "%Y%m%d";
const CLOCK_FORMAT: &str = "%I:%M %p";

/// Canonical event produced by the payload normalizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub title: String,
    pub description: String,
    pub external_id: String,
    pub start_at: DateTime<Tz>,
    pub end_at: Option<DateTime<Tz>>,
    pub detail_url: Option<String>,
    pub image_url: Option<String>,
    pub slug: String,
}

impl NormalizedEvent {
    pub fn slug_for(title: &str) -> String {
        title.replace(' ', "-")
    }

    /// `Ymd` date key of the start, in the event's zone.
    pub fn event_date(&self) -> String {
        self.start_at.format(DATE_KEY_FORMAT).to_string()
    }

    pub fn event_start_time(&self) -> String {
        self.start_at.format(CLOCK_FORMAT).to_string()
    }

    pub fn event_end_time(&self) -> Option<String> {
        self.end_at.map(|end| end.format(CLOCK_FORMAT).to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Publish,
    Draft,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Draft => "draft",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "publish" => Self::Publish,
            _ => Self::Draft,
        }
    }
}

/// Field set handed to the host store on create/update.
///
/// `slug` and `category` only apply on create; updates leave the stored values alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub title: String,
    pub description: String,
    pub slug: Option<String>,
    pub category: Option<i64>,
    pub status: RecordStatus,
    pub comments_open: bool,
    pub pings_open: bool,
}

impl RecordFields {
    pub fn for_create(event: &NormalizedEvent, category: i64) -> Self {
        Self {
            title: event.title.clone(),
            description: event.description.clone(),
            slug: Some(event.slug.clone()),
            category: Some(category),
            status: RecordStatus::Publish,
            comments_open: false,
            pings_open: false,
        }
    }

    pub fn for_update(event: &NormalizedEvent) -> Self {
        Self {
            title: event.title.clone(),
            description: event.description.clone(),
            slug: None,
            category: None,
            status: RecordStatus::Publish,
            comments_open: false,
            pings_open: false,
        }
    }
}

/// A persisted content record in the host store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEventRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub slug: String,
    pub category: i64,
    pub status: RecordStatus,
    pub comments_open: bool,
    pub pings_open: bool,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LocalEventRecord {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn external_id(&self) -> Option<&str> {
        self.meta(meta::CALENDAR_ID)
    }
}

/// A configured timezone name that is not in the IANA database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timezone {name:?}: {reason}")]
pub struct InvalidTimezone {
    pub name: String,
    reason: String,
}

/// Host configuration read once at the start of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub feed_url: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_category")]
    pub default_category: i64,
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            timezone: default_timezone(),
            default_category: DEFAULT_CATEGORY,
            schedule: default_schedule(),
        }
    }
}

impl Settings {
    pub fn parse_timezone(&self) -> Result<Tz, InvalidTimezone> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|e| InvalidTimezone {
                name: self.timezone.clone(),
                reason: e.to_string(),
            })
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_category() -> i64 {
    DEFAULT_CATEGORY
}

fn default_schedule() -> String {
    DEFAULT_SCHEDULE.to_string()
}

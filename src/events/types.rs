//! Payloads of the hub's server-to-client topics.
//!
//! Field names follow the hub's camelCase JSON. Timestamps are accepted
//! with or without an offset; offset-less values are taken as UTC, which
//! is what the server emits.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::PushEvent;

/// Live progress of a document being parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingProgress {
    /// Document being processed.
    pub document_id: String,
    /// Uploaded file name.
    pub file_name: String,
    /// Processing status label.
    pub status: String,
    /// 0-100.
    pub percent_complete: u8,
    /// Human-readable description of the current step.
    pub current_step: String,
    /// Server's estimate, when it has one.
    #[serde(default)]
    pub estimated_seconds_remaining: Option<u32>,
    /// Fields expected in the document.
    pub total_fields: u32,
    /// Fields extracted so far.
    pub processed_fields: u32,
}

impl PushEvent for ProcessingProgress {
    const TOPIC: &'static str = "ProcessingProgress";
}

/// A document finished processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingComplete {
    /// Document that finished.
    pub document_id: String,
    /// Whether parsing succeeded.
    pub success: bool,
    /// Completion time.
    #[serde(deserialize_with = "utc_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl PushEvent for ProcessingComplete {
    const TOPIC: &'static str = "ProcessingComplete";
}

/// Dashboard figures changed and should be re-fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardUpdate {
    /// When the change happened.
    #[serde(deserialize_with = "utc_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl PushEvent for DashboardUpdate {
    const TOPIC: &'static str = "DashboardUpdate";
}

/// Kind of notification, as named by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NotificationCategory {
    /// Informational.
    #[default]
    Info,
    /// Something completed successfully.
    Success,
    /// Needs attention.
    Warning,
    /// Something failed.
    Error,
    /// Document pipeline event.
    DocumentProcessing,
    /// Billing or plan change.
    Subscription,
    /// Account security event.
    Security,
    /// A category this client does not know yet.
    #[serde(other)]
    Other,
}

/// A notification, pushed live or loaded from the inbox endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// Server-assigned id.
    pub id: String,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Category.
    #[serde(rename = "type", default)]
    pub category: NotificationCategory,
    /// Read flag.
    #[serde(default)]
    pub is_read: bool,
    /// Creation time.
    #[serde(deserialize_with = "utc_timestamp")]
    pub created_at: DateTime<Utc>,
    /// When it was marked read. Never sent on the live topic.
    #[serde(default, deserialize_with = "optional_utc_timestamp")]
    pub read_at: Option<DateTime<Utc>>,
    /// Entity the notification is about (e.g. a document id).
    #[serde(default)]
    pub related_entity_id: Option<String>,
    /// In-app link to follow.
    #[serde(default)]
    pub action_url: Option<String>,
}

impl PushEvent for NotificationRecord {
    const TOPIC: &'static str = "Notification";
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(rfc_err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| rfc_err),
    }
}

fn utc_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn optional_utc_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

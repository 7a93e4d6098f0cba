/// Message dispatcher: wire events -> canonical `Message`
///
/// Every source (bulk history, live push frames, local echoes) passes through
/// `normalize`, so the aggregator only ever sees one shape.
use crate::error::{Result, SyncError};
use crate::model::{Message, MessageId, OutboundMessage};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Message as it appears on the wire. Nothing is trusted until `normalize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessageEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
}

impl RawMessageEvent {
    /// Wire form of a just-sent message before the store has seen it
    pub fn echo(outbound: &OutboundMessage, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: Some(Value::String(MessageId::local().to_string())),
            sender_id: Some(Value::String(outbound.sender_id.clone())),
            receiver_id: Some(Value::String(outbound.receiver_id.clone())),
            content: Some(outbound.content.clone()),
            sent_at: Some(Value::String(sent_at.to_rfc3339())),
            read: Some(true),
        }
    }
}

/// Normalize one event, stamping a missing `sentAt` with the current time
pub fn normalize(raw: RawMessageEvent) -> Result<Message> {
    normalize_at(raw, Utc::now())
}

/// Normalize one event; `received_at` stands in for a missing `sentAt`
pub fn normalize_at(raw: RawMessageEvent, received_at: DateTime<Utc>) -> Result<Message> {
    let sender_id = raw
        .sender_id
        .as_ref()
        .and_then(id_text)
        .ok_or_else(|| SyncError::MalformedMessage("missing senderId".to_string()))?;
    let receiver_id = raw
        .receiver_id
        .as_ref()
        .and_then(id_text)
        .ok_or_else(|| SyncError::MalformedMessage("missing receiverId".to_string()))?;
    let content = raw
        .content
        .ok_or_else(|| SyncError::MalformedMessage("missing content".to_string()))?;

    let id = match raw.id.as_ref() {
        None | Some(Value::Null) => MessageId::local(),
        Some(value) => MessageId::parse(
            &id_text(value).ok_or_else(|| SyncError::MalformedMessage(format!("unusable id: {}", value)))?,
        ),
    };

    let sent_at = match raw.sent_at.as_ref() {
        None | Some(Value::Null) => received_at,
        Some(value) => parse_timestamp(value)?,
    };

    Ok(Message {
        id,
        sender_id,
        receiver_id,
        content,
        sent_at,
        read: raw.read.unwrap_or(false),
    })
}

/// Decode and normalize the JSON body of one push frame
pub fn decode_frame(body: &str) -> Result<Message> {
    let raw: RawMessageEvent = serde_json::from_str(body)
        .map_err(|e| SyncError::MalformedMessage(format!("frame body is not a message object: {}", e)))?;
    normalize(raw)
}

/// Normalize a history batch. Malformed elements are logged and dropped.
pub fn normalize_batch(batch: Vec<RawMessageEvent>) -> Vec<Message> {
    let received_at = Utc::now();
    let total = batch.len();
    let messages: Vec<Message> = batch
        .into_iter()
        .filter_map(|raw| match normalize_at(raw, received_at) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Dropping malformed history entry");
                None
            }
        })
        .collect();
    if messages.len() < total {
        warn!(dropped = total - messages.len(), total, "History batch contained malformed entries");
    }
    messages
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => parse_timestamp_str(s.trim()),
        // [year, month, day, hour, minute, second, nanos] as emitted for local date-times
        Value::Array(parts) => parse_timestamp_parts(parts),
        _ => None,
    };
    parsed.ok_or_else(|| SyncError::MalformedMessage(format!("unparseable sentAt: {}", value)))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_timestamp_parts(parts: &[Value]) -> Option<DateTime<Utc>> {
    if parts.len() < 3 || parts.len() > 7 {
        return None;
    }
    let mut fields = [0i64; 7];
    for (slot, part) in fields.iter_mut().zip(parts) {
        *slot = part.as_i64()?;
    }
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(fields[0]).ok()?,
        u32::try_from(fields[1]).ok()?,
        u32::try_from(fields[2]).ok()?,
    )?;
    let naive = date.and_hms_nano_opt(
        u32::try_from(fields[3]).ok()?,
        u32::try_from(fields[4]).ok()?,
        u32::try_from(fields[5]).ok()?,
        u32::try_from(fields[6]).ok()?,
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

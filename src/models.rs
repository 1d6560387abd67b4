use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;

/// Type tag carried by every tracked event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    SourceError,
    JsError,
    HistoryPush,
    HistoryReplace,
    HashChange,
    DomClick,
    Ajax,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SourceError => "sourceError",
            EventKind::JsError => "jsError",
            EventKind::HistoryPush => "history.pushState",
            EventKind::HistoryReplace => "history.replaceState",
            EventKind::HashChange => "hashchange",
            EventKind::DomClick => "dom.click",
            EventKind::Ajax => "ajaxTracker",
            EventKind::Custom(tag) => tag,
        }
    }

    /// Unknown tags fall through to `Custom`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "sourceError" => EventKind::SourceError,
            "jsError" => EventKind::JsError,
            "history.pushState" => EventKind::HistoryPush,
            "history.replaceState" => EventKind::HistoryReplace,
            "hashchange" => EventKind::HashChange,
            "dom.click" => EventKind::DomClick,
            "ajaxTracker" => EventKind::Ajax,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

/// One decoded telemetry event: the shared envelope plus its variant
#[derive(Debug, Clone)]
pub struct Event {
    pub project: String,
    /// Epoch milliseconds
    pub time: i64,
    pub url: Option<String>,
    pub detail: TrackerEvent,
}

#[derive(Debug, Clone)]
pub enum TrackerEvent {
    SourceError(SourceError),
    JsError(JsError),
    HistoryPush(Navigation),
    HistoryReplace(Navigation),
    HashChange(HashChange),
    DomClick(DomClick),
    Ajax(AjaxOutcome),
    Custom { kind: String, payload: Map<String, Value> },
}

#[derive(Debug, Clone, Default)]
pub struct SourceError {
    pub source: Option<String>,
    pub tag_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JsError {
    pub message: Option<String>,
    pub filename: Option<String>,
    pub colno: Option<String>,
    pub lineno: Option<String>,
}

/// History navigations carry nothing beyond the envelope url.
#[derive(Debug, Clone, Default)]
pub struct Navigation;

#[derive(Debug, Clone, Default)]
pub struct HashChange {
    pub old_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DomClick {
    pub target_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AjaxOutcome {
    pub status: Option<String>,
    pub timeout: Option<String>,
    pub response_text: Option<String>,
    pub method: Option<String>,
    pub request_url: Option<String>,
    pub time_stamp_compute: Option<String>,
}

impl TrackerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrackerEvent::SourceError(_) => EventKind::SourceError,
            TrackerEvent::JsError(_) => EventKind::JsError,
            TrackerEvent::HistoryPush(_) => EventKind::HistoryPush,
            TrackerEvent::HistoryReplace(_) => EventKind::HistoryReplace,
            TrackerEvent::HashChange(_) => EventKind::HashChange,
            TrackerEvent::DomClick(_) => EventKind::DomClick,
            TrackerEvent::Ajax(_) => EventKind::Ajax,
            TrackerEvent::Custom { kind, .. } => EventKind::Custom(kind.clone()),
        }
    }
}

impl Event {
    /// Decode a loose field map posted by a browser agent.
    ///
    /// Only `project` and `time` are required. Everything else is
    /// best-effort: absent or oddly-typed fields become `None` instead of
    /// rejecting the event, and an event without a `type` is kept as a
    /// custom event tagged `undefined`.
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, ApiError> {
        let project = text(&fields, "project")
            .filter(|p| !p.is_empty())
            .ok_or(ApiError::MissingField("project"))?;
        let raw_time = text(&fields, "time").ok_or(ApiError::MissingField("time"))?;
        let time = parse_epoch_millis(&raw_time).ok_or(ApiError::InvalidTime(raw_time))?;
        let tag = text(&fields, "type")
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNTYPED_TAG.to_string());
        let url = text(&fields, "url");

        let detail = match EventKind::from_tag(&tag) {
            EventKind::SourceError => TrackerEvent::SourceError(SourceError {
                source: text(&fields, "source"),
                tag_name: text(&fields, "tagName"),
            }),
            EventKind::JsError => TrackerEvent::JsError(JsError {
                message: text(&fields, "message"),
                filename: text(&fields, "filename"),
                colno: text(&fields, "colno"),
                lineno: text(&fields, "lineno"),
            }),
            EventKind::HistoryPush => TrackerEvent::HistoryPush(Navigation),
            EventKind::HistoryReplace => TrackerEvent::HistoryReplace(Navigation),
            EventKind::HashChange => TrackerEvent::HashChange(HashChange {
                old_url: text(&fields, "oldURL"),
            }),
            EventKind::DomClick => TrackerEvent::DomClick(DomClick {
                target_key: text(&fields, "targetKey"),
            }),
            EventKind::Ajax => TrackerEvent::Ajax(AjaxOutcome {
                // Only the string "200" counts as success; a numeric 200 does not.
                status: string(&fields, "status"),
                timeout: text(&fields, "timeout"),
                response_text: text(&fields, "responseText"),
                method: text(&fields, "method"),
                request_url: text(&fields, "requestUrl"),
                time_stamp_compute: text(&fields, "timeStampCompute"),
            }),
            EventKind::Custom(kind) => TrackerEvent::Custom {
                kind,
                payload: fields,
            },
        };

        Ok(Event {
            project,
            time,
            url,
            detail,
        })
    }
}

/// Tag for events posted without a `type`
pub const UNTYPED_TAG: &str = "undefined";

/// Strings pass through, numbers and booleans are rendered as text.
fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key)?.as_str().map(str::to_string)
}

/// Fractional milliseconds are truncated toward zero.
fn parse_epoch_millis(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    trimmed.parse::<i64>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|ms| ms.is_finite() && ms.abs() < i64::MAX as f64)
            .map(|ms| ms.trunc() as i64)
    })
}

/// Aggregated `sourceError` occurrence
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceErrorRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub times: u64,
}

/// Aggregated `jsError` occurrence
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct JsErrorRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub times: u64,
}

/// History and hash navigations are counted per url
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct UrlRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub times: u64,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomClickRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
    pub times: u64,
}

/// Ajax call outcome. `response_text` is only kept for failed calls.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AjaxRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_stamp_compute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    pub times: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct HistoryData {
    pub push: Vec<UrlRecord>,
    pub replace: Vec<UrlRecord>,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct AjaxData {
    pub success: Vec<AjaxRecord>,
    pub error: Vec<AjaxRecord>,
}

/// Query envelope returned by the tracker read endpoints
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_numbers_are_carried_as_text() {
        let event = Event::from_fields(fields(json!({
            "project": "p1",
            "time": 1700000000000i64,
            "type": "jsError",
            "filename": "app.js",
            "colno": 12,
            "lineno": "40",
        })))
        .unwrap();

        assert_eq!(event.time, 1700000000000);
        match event.detail {
            TrackerEvent::JsError(js) => {
                assert_eq!(js.colno.as_deref(), Some("12"));
                assert_eq!(js.lineno.as_deref(), Some("40"));
                assert_eq!(js.message, None);
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_custom() {
        let event = Event::from_fields(fields(json!({
            "project": "p1",
            "time": "1700000000000",
            "type": "checkout",
            "cart": 3,
        })))
        .unwrap();

        assert_eq!(event.detail.kind(), EventKind::Custom("checkout".to_string()));
        match event.detail {
            TrackerEvent::Custom { payload, .. } => assert_eq!(payload["cart"], json!(3)),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_placement_fields_are_required() {
        let missing_project = Event::from_fields(fields(json!({
            "time": "1700000000000",
            "type": "dom.click",
        })));
        assert!(matches!(missing_project, Err(ApiError::MissingField("project"))));

        let bad_time = Event::from_fields(fields(json!({
            "project": "p1",
            "time": "yesterday",
            "type": "dom.click",
        })));
        assert!(matches!(bad_time, Err(ApiError::InvalidTime(_))));

        let missing_time = Event::from_fields(fields(json!({
            "project": "p1",
            "type": "dom.click",
        })));
        assert!(matches!(missing_time, Err(ApiError::MissingField("time"))));
    }

    #[test]
    fn test_missing_type_becomes_untyped_custom() {
        for raw in [
            json!({ "project": "p1", "time": "1700000000000", "url": "/x", "foo": 1 }),
            json!({ "project": "p1", "time": "1700000000000", "url": "/x", "type": "" }),
        ] {
            let event = Event::from_fields(fields(raw)).unwrap();
            assert_eq!(event.detail.kind(), EventKind::Custom(UNTYPED_TAG.to_string()));
            match event.detail {
                TrackerEvent::Custom { payload, .. } => assert_eq!(payload["url"], json!("/x")),
                other => panic!("unexpected variant {:?}", other),
            }
        }
    }

    #[test]
    fn test_fractional_time_is_truncated() {
        for time in [json!(1700000000000.5), json!("1700000000000.5"), json!("1700000000000.9")] {
            let event = Event::from_fields(fields(json!({
                "project": "p1",
                "time": time,
                "type": "dom.click",
            })))
            .unwrap();
            assert_eq!(event.time, 1700000000000);
        }

        let huge = Event::from_fields(fields(json!({
            "project": "p1",
            "time": "1e300",
            "type": "dom.click",
        })));
        assert!(matches!(huge, Err(ApiError::InvalidTime(_))));
    }

    #[test]
    fn test_ajax_status_must_be_text_200() {
        for (status, expected) in [(json!("200"), Some("200")), (json!(200), None)] {
            let event = Event::from_fields(fields(json!({
                "project": "p1",
                "time": 1,
                "type": "ajaxTracker",
                "status": status,
            })))
            .unwrap();
            match event.detail {
                TrackerEvent::Ajax(outcome) => assert_eq!(outcome.status.as_deref(), expected),
                other => panic!("unexpected variant {:?}", other),
            }
        }
    }

    #[test]
    fn test_kind_tags_round_trip() {
        for tag in [
            "sourceError",
            "jsError",
            "history.pushState",
            "history.replaceState",
            "hashchange",
            "dom.click",
            "ajaxTracker",
        ] {
            assert_eq!(EventKind::from_tag(tag).as_str(), tag);
        }
    }

    #[test]
    fn test_records_use_camel_case() {
        let record = AjaxRecord {
            request_url: Some("/api".to_string()),
            method: Some("GET".to_string()),
            time_stamp_compute: Some("12".to_string()),
            timeout: None,
            times: 1,
            response_text: None,
        };
        let value = serde_json::to_value(record).unwrap();
        assert_eq!(
            value,
            json!({ "requestUrl": "/api", "method": "GET", "timeStampCompute": "12", "times": 1 })
        );
    }
}

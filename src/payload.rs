use std::collections::HashMap;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Multipart, Request},
    http::header::CONTENT_TYPE,
    Form,
};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ApiError;

/// Raw tracker fields, whatever encoding the browser agent used.
///
/// Accepts `multipart/form-data` (what `navigator.sendBeacon(FormData)`
/// produces), url-encoded forms, and JSON for everything else. File parts
/// in multipart bodies are ignored.
#[derive(Debug)]
pub struct TrackerPayload(pub Map<String, Value>);

#[async_trait]
impl<S> FromRequest<S> for TrackerPayload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let fields = if content_type.starts_with("multipart/form-data") {
            read_multipart(req, state).await
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            read_form(req, state).await
        } else {
            read_json(req, state).await
        };

        fields.map(TrackerPayload).map_err(|err| {
            warn!(error = %err, content_type = %content_type, "unreadable tracker body");
            err
        })
    }
}

async fn read_multipart<S: Send + Sync>(req: Request, state: &S) -> Result<Map<String, Value>, ApiError> {
    let mut multipart = Multipart::from_request(req, state)
        .await
        .map_err(|err| ApiError::Body(err.body_text()))?;

    let mut fields = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Body(err.body_text()))?
    {
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field
            .text()
            .await
            .map_err(|err| ApiError::Body(err.body_text()))?;
        fields.insert(name, Value::String(value));
    }
    Ok(fields)
}

async fn read_form<S: Send + Sync>(req: Request, state: &S) -> Result<Map<String, Value>, ApiError> {
    let Form(pairs) = Form::<HashMap<String, String>>::from_request(req, state)
        .await
        .map_err(|err| ApiError::Body(err.body_text()))?;

    Ok(pairs
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect())
}

// Also covers `text/plain`, which is what sendBeacon uses for string bodies.
async fn read_json<S: Send + Sync>(req: Request, state: &S) -> Result<Map<String, Value>, ApiError> {
    let bytes = Bytes::from_request(req, state)
        .await
        .map_err(|err| ApiError::Body(err.body_text()))?;

    serde_json::from_slice(&bytes).map_err(|err| ApiError::Body(err.to_string()))
}

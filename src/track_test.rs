//! Endpoints the browser agent calls to produce ajax outcomes on demand

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use crate::error::ApiError;
use crate::AppState;

const DEFAULT_DELAY_MS: u64 = 5_000;

type Params = BTreeMap<String, String>;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/getSuccess", get(get_success))
        .route("/getError", get(get_error))
        .route("/getTimeout", get(get_timeout))
}

/// Echo the query string back as JSON
async fn get_success(Query(params): Query<Params>) -> Json<Params> {
    Json(params)
}

async fn get_error() -> Result<Json<Params>, ApiError> {
    Err(ApiError::Simulated)
}

/// Wait `timeout` ms (default 5000, capped by config) before echoing.
async fn get_timeout(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<Params> {
    let delay = requested_delay(params.get("timeout").map(String::as_str), state.max_test_delay_ms);
    tokio::time::sleep(delay).await;
    Json(params)
}

/// Reads the leading integer like a browser's `parseInt`: `"5abc"` is 5 and
/// a negative value fires at once. Zero or no digits falls back to the default.
fn requested_delay(raw: Option<&str>, cap_ms: u64) -> Duration {
    let ms = match raw.and_then(leading_integer) {
        Some(0) | None => DEFAULT_DELAY_MS,
        Some(ms) if ms < 0 => 0,
        Some(ms) => ms.unsigned_abs(),
    };
    Duration::from_millis(ms.min(cap_ms))
}

fn leading_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    // Too many digits saturates instead of failing.
    let value = rest[..digits].parse::<i64>().unwrap_or(i64::MAX);
    (digits > 0).then_some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_defaults_and_cap() {
        assert_eq!(requested_delay(None, 60_000), Duration::from_millis(5_000));
        assert_eq!(requested_delay(Some("soon"), 60_000), Duration::from_millis(5_000));
        assert_eq!(requested_delay(Some("0"), 60_000), Duration::from_millis(5_000));
        assert_eq!(requested_delay(Some("250"), 60_000), Duration::from_millis(250));
        assert_eq!(requested_delay(Some("90000"), 60_000), Duration::from_millis(60_000));
        assert_eq!(requested_delay(Some("5abc"), 60_000), Duration::from_millis(5));
        assert_eq!(requested_delay(Some(" 40ms"), 60_000), Duration::from_millis(40));
        assert_eq!(requested_delay(Some("-5"), 60_000), Duration::ZERO);
    }
}

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Local, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    AjaxData, AjaxOutcome, AjaxRecord, DomClick, DomClickRecord, Event, EventKind, HashChange,
    HistoryData, JsError, JsErrorRecord, Navigation, SourceError, SourceErrorRecord, TrackerEvent,
    UrlRecord,
};


/// Turns event timestamps into `YYYY-MM-DD` day keys
#[derive(Debug, Clone, Copy, Default)]
pub struct DayClock {
    offset: Option<FixedOffset>,
}

impl DayClock {
    pub fn local() -> Self {
        Self { offset: None }
    }

    pub fn fixed(offset: FixedOffset) -> Self {
        Self {
            offset: Some(offset),
        }
    }

    /// `None` when the timestamp is outside the representable range.
    pub fn day_of(&self, epoch_ms: i64) -> Option<String> {
        let instant = DateTime::<Utc>::from_timestamp_millis(epoch_ms)?;
        Some(self.format(instant))
    }

    pub fn today(&self) -> String {
        self.format(Utc::now())
    }

    fn format(&self, instant: DateTime<Utc>) -> String {
        match self.offset {
            Some(offset) => instant.with_timezone(&offset).format("%Y-%m-%d").to_string(),
            None => instant.with_timezone(&Local).format("%Y-%m-%d").to_string(),
        }
    }
}

/// Records that carry an occurrence counter
pub trait Tally {
    fn times_mut(&mut self) -> &mut u64;
}

/// How one event type folds into its counter bucket.
///
/// `identity` decides which events are the same occurrence, `first` builds
/// the stored record, and `repeat` updates it on every later match.
pub trait MergePolicy {
    type Record: Tally + Clone;

    fn identity(&self, url: Option<&str>) -> String;

    fn first(&self, url: Option<&str>) -> Self::Record;

    fn repeat(&self, record: &mut Self::Record) {
        *record.times_mut() += 1;
    }
}

impl Tally for SourceErrorRecord {
    fn times_mut(&mut self) -> &mut u64 {
        &mut self.times
    }
}

impl Tally for JsErrorRecord {
    fn times_mut(&mut self) -> &mut u64 {
        &mut self.times
    }
}

impl Tally for UrlRecord {
    fn times_mut(&mut self) -> &mut u64 {
        &mut self.times
    }
}

impl Tally for DomClickRecord {
    fn times_mut(&mut self) -> &mut u64 {
        &mut self.times
    }
}

impl Tally for AjaxRecord {
    fn times_mut(&mut self) -> &mut u64 {
        &mut self.times
    }
}

impl MergePolicy for SourceError {
    type Record = SourceErrorRecord;

    fn identity(&self, _url: Option<&str>) -> String {
        format!(
            "{}{}",
            self.source.as_deref().unwrap_or_default(),
            self.tag_name.as_deref().unwrap_or_default()
        )
    }

    fn first(&self, url: Option<&str>) -> SourceErrorRecord {
        SourceErrorRecord {
            source: self.source.clone(),
            tag_name: self.tag_name.clone(),
            url: url.map(str::to_string),
            times: 1,
        }
    }
}

impl MergePolicy for JsError {
    type Record = JsErrorRecord;

    fn identity(&self, _url: Option<&str>) -> String {
        format!(
            "{}&{}&{}",
            self.filename.as_deref().unwrap_or_default(),
            self.colno.as_deref().unwrap_or_default(),
            self.lineno.as_deref().unwrap_or_default()
        )
    }

    fn first(&self, _url: Option<&str>) -> JsErrorRecord {
        JsErrorRecord {
            filename: self.filename.clone(),
            colno: self.colno.clone(),
            lineno: self.lineno.clone(),
            message: self.message.clone(),
            times: 1,
        }
    }
}

impl MergePolicy for Navigation {
    type Record = UrlRecord;

    fn identity(&self, url: Option<&str>) -> String {
        url.unwrap_or_default().to_string()
    }

    fn first(&self, url: Option<&str>) -> UrlRecord {
        UrlRecord {
            url: url.map(str::to_string),
            times: 1,
        }
    }
}

// oldURL is carried but the envelope url is the identity.
impl MergePolicy for HashChange {
    type Record = UrlRecord;

    fn identity(&self, url: Option<&str>) -> String {
        Navigation.identity(url)
    }

    fn first(&self, url: Option<&str>) -> UrlRecord {
        Navigation.first(url)
    }
}

impl MergePolicy for DomClick {
    type Record = DomClickRecord;

    fn identity(&self, _url: Option<&str>) -> String {
        self.target_key.clone().unwrap_or_default()
    }

    fn first(&self, _url: Option<&str>) -> DomClickRecord {
        DomClickRecord {
            target_key: self.target_key.clone(),
            times: 1,
        }
    }
}

/// Successful ajax calls, merged per `requestUrl&method`
impl MergePolicy for AjaxOutcome {
    type Record = AjaxRecord;

    fn identity(&self, _url: Option<&str>) -> String {
        format!(
            "{}&{}",
            self.request_url.as_deref().unwrap_or_default(),
            self.method.as_deref().unwrap_or_default()
        )
    }

    fn first(&self, _url: Option<&str>) -> AjaxRecord {
        AjaxRecord {
            request_url: self.request_url.clone(),
            method: self.method.clone(),
            time_stamp_compute: self.time_stamp_compute.clone(),
            timeout: self.timeout.clone(),
            times: 1,
            response_text: None,
        }
    }

    /// Incremental mean: `(times * mean + sample) / (times + 1)`, using the
    /// count from before this sample.
    fn repeat(&self, record: &mut AjaxRecord) {
        let previous = record.times as f64;
        let mean = parse_sample(record.time_stamp_compute.as_deref());
        let sample = parse_sample(self.time_stamp_compute.as_deref());
        let updated = (previous * mean + sample) / (previous + 1.0);
        record.time_stamp_compute = Some(number_text(updated));
        record.times += 1;
    }
}

impl AjaxOutcome {
    fn is_success(&self) -> bool {
        self.status.as_deref() == Some("200")
    }

    fn error_record(&self) -> AjaxRecord {
        AjaxRecord {
            response_text: self.response_text.clone(),
            ..self.first(None)
        }
    }
}

/// Unparsable samples become NaN and poison the mean, as browsers would.
fn parse_sample(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

fn number_text(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let sign = if value > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if value == 0.0 {
        "0".to_string()
    } else if value.abs() >= 1e21 || value.abs() < 1e-6 {
        // Exponent form, with an explicit `+` on positive exponents.
        let rendered = format!("{value:e}");
        match rendered.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => rendered,
        }
    } else {
        value.to_string()
    }
}

/// Insertion-ordered map from identity key to counted record
#[derive(Debug)]
pub struct CounterMap<R> {
    positions: HashMap<String, usize>,
    records: Vec<R>,
}

impl<R> Default for CounterMap<R> {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
            records: Vec::new(),
        }
    }
}

impl<R: Tally + Clone> CounterMap<R> {
    pub fn merge<P>(&mut self, policy: &P, url: Option<&str>)
    where
        P: MergePolicy<Record = R>,
    {
        let key = policy.identity(url);
        match self.positions.get(&key) {
            Some(&idx) => policy.repeat(&mut self.records[idx]),
            None => {
                self.positions.insert(key, self.records.len());
                self.records.push(policy.first(url));
            }
        }
    }

    pub fn records(&self) -> Vec<R> {
        self.records.clone()
    }
}

/// Append-only list keyed by ordinal `"1"`, `"2"`, ...
#[derive(Debug)]
pub struct OrdinalLog<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for OrdinalLog<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Clone> OrdinalLog<T> {
    pub fn push(&mut self, value: T) {
        let key = (self.entries.len() + 1).to_string();
        self.entries.push((key, value));
    }

    #[cfg(test)]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.entries.iter().map(|(_, value)| value.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct AjaxBucket {
    success: CounterMap<AjaxRecord>,
    error: OrdinalLog<AjaxRecord>,
}

/// Storage for one `(project, day, type)` triple. The shape is chosen by
/// the event kind when the bucket is created and never changes.
#[derive(Debug)]
enum Bucket {
    SourceError(CounterMap<SourceErrorRecord>),
    JsError(CounterMap<JsErrorRecord>),
    Url(CounterMap<UrlRecord>),
    DomClick(CounterMap<DomClickRecord>),
    Ajax(AjaxBucket),
    Custom(OrdinalLog<Value>),
}

impl Bucket {
    fn for_kind(kind: &EventKind) -> Self {
        match kind {
            EventKind::SourceError => Bucket::SourceError(CounterMap::default()),
            EventKind::JsError => Bucket::JsError(CounterMap::default()),
            EventKind::HistoryPush | EventKind::HistoryReplace | EventKind::HashChange => {
                Bucket::Url(CounterMap::default())
            }
            EventKind::DomClick => Bucket::DomClick(CounterMap::default()),
            EventKind::Ajax => Bucket::Ajax(AjaxBucket::default()),
            EventKind::Custom(_) => Bucket::Custom(OrdinalLog::default()),
        }
    }

    /// Returns false if the event does not fit this bucket's shape.
    fn absorb(&mut self, url: Option<&str>, detail: TrackerEvent) -> bool {
        match (self, detail) {
            (Bucket::SourceError(map), TrackerEvent::SourceError(e)) => map.merge(&e, url),
            (Bucket::JsError(map), TrackerEvent::JsError(e)) => map.merge(&e, url),
            (Bucket::Url(map), TrackerEvent::HistoryPush(e))
            | (Bucket::Url(map), TrackerEvent::HistoryReplace(e)) => map.merge(&e, url),
            (Bucket::Url(map), TrackerEvent::HashChange(e)) => map.merge(&e, url),
            (Bucket::DomClick(map), TrackerEvent::DomClick(e)) => map.merge(&e, url),
            (Bucket::Ajax(ajax), TrackerEvent::Ajax(outcome)) => {
                if outcome.is_success() {
                    ajax.success.merge(&outcome, url);
                } else {
                    ajax.error.push(outcome.error_record());
                }
            }
            (Bucket::Custom(log), TrackerEvent::Custom { payload, .. }) => {
                log.push(Value::Object(payload));
            }
            _ => return false,
        }
        true
    }
}

type TypeBuckets = HashMap<String, Bucket>;

#[derive(Debug, Default)]
struct Index {
    /// Projects in first-seen order
    order: Vec<String>,
    projects: HashMap<String, HashMap<String, TypeBuckets>>,
}

impl Index {
    fn bucket_mut(&mut self, project: &str, day: String, kind: &EventKind) -> &mut Bucket {
        if !self.projects.contains_key(project) {
            self.order.push(project.to_string());
        }
        self.projects
            .entry(project.to_string())
            .or_default()
            .entry(day)
            .or_default()
            .entry(kind.as_str().to_string())
            .or_insert_with(|| Bucket::for_kind(kind))
    }

    fn bucket(&self, project: &str, day: &str, tag: &str) -> Option<&Bucket> {
        self.projects.get(project)?.get(day)?.get(tag)
    }
}

/// In-memory aggregation of tracked events per project, day and type
///
/// One instance is shared by every request for the life of the process.
/// Ingest holds the write lock across the whole create-then-merge step;
/// queries copy records out under the read lock.
#[derive(Debug, Default)]
pub struct TrackerStore {
    clock: DayClock,
    index: RwLock<Index>,
}

impl TrackerStore {
    pub fn new(clock: DayClock) -> Self {
        Self {
            clock,
            index: RwLock::new(Index::default()),
        }
    }

    /// Fold one event into its bucket. Never fails; an event whose day
    /// cannot be computed is dropped.
    pub fn ingest(&self, event: Event) {
        let Some(day) = self.clock.day_of(event.time) else {
            warn!(project = %event.project, time = event.time, "dropping event with unrepresentable time");
            return;
        };
        let kind = event.detail.kind();
        debug!(project = %event.project, %day, kind = kind.as_str(), "ingest");

        let mut index = self.index.write();
        let bucket = index.bucket_mut(&event.project, day, &kind);
        if !bucket.absorb(event.url.as_deref(), event.detail) {
            warn!(kind = kind.as_str(), "event does not match existing bucket shape");
        }
    }

    pub fn list_projects(&self) -> Vec<String> {
        self.index.read().order.clone()
    }

    pub fn js_errors(&self, project: &str) -> Vec<JsErrorRecord> {
        self.read_today(project, &EventKind::JsError, |bucket| match bucket {
            Bucket::JsError(map) => map.records(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    pub fn source_errors(&self, project: &str) -> Vec<SourceErrorRecord> {
        self.read_today(project, &EventKind::SourceError, |bucket| match bucket {
            Bucket::SourceError(map) => map.records(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    pub fn history_data(&self, project: &str) -> HistoryData {
        HistoryData {
            push: self.url_records(project, &EventKind::HistoryPush),
            replace: self.url_records(project, &EventKind::HistoryReplace),
        }
    }

    pub fn hash_changes(&self, project: &str) -> Vec<UrlRecord> {
        self.url_records(project, &EventKind::HashChange)
    }

    pub fn dom_clicks(&self, project: &str) -> Vec<DomClickRecord> {
        self.read_today(project, &EventKind::DomClick, |bucket| match bucket {
            Bucket::DomClick(map) => map.records(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    pub fn ajax_data(&self, project: &str) -> AjaxData {
        self.read_today(project, &EventKind::Ajax, |bucket| match bucket {
            Bucket::Ajax(ajax) => AjaxData {
                success: ajax.success.records(),
                error: ajax.error.values(),
            },
            _ => AjaxData::default(),
        })
        .unwrap_or_default()
    }

    /// Today's raw payloads for one application-defined event type
    pub fn custom_events(&self, project: &str, tag: &str) -> Vec<Value> {
        let kind = EventKind::from_tag(tag);
        self.read_today(project, &kind, |bucket| match bucket {
            Bucket::Custom(log) => log.values(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    fn url_records(&self, project: &str, kind: &EventKind) -> Vec<UrlRecord> {
        self.read_today(project, kind, |bucket| match bucket {
            Bucket::Url(map) => map.records(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    fn read_today<T>(
        &self,
        project: &str,
        kind: &EventKind,
        read: impl FnOnce(&Bucket) -> T,
    ) -> Option<T> {
        let today = self.clock.today();
        let index = self.index.read();
        index.bucket(project, &today, kind.as_str()).map(read)
    }
}

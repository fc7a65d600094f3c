// Shared data model for the rehabilitation pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

/// Query key carrying the completion timestamp on a rehabilitated asset URL
pub const COMPLETION_MARKER_KEY: &str = "t";

/// Content record owned by the surrounding system.
///
/// Only `image_ref` and `is_optimized` are ever written by this crate. Any other
/// fields the host stores are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default)]
    pub image_ref: String,
    #[serde(default)]
    pub is_optimized: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, title: impl Into<String>, image_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            slug: None,
            image_ref: image_ref.into(),
            is_optimized: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Stable, per-record slug used to derive storage paths.
    ///
    /// An explicit slug is unique in the host collection and is used as is.
    /// Titles are not unique, so a title-derived slug carries the id as well.
    pub fn stable_slug(&self) -> String {
        if let Some(slug) = self.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return slugify(slug);
        }
        let id = slugify(&self.id);
        let from_title = slugify(&self.title);
        if from_title.is_empty() {
            id
        } else if id.is_empty() {
            from_title
        } else {
            format!("{from_title}-{id}")
        }
    }

    /// Non-empty http(s) image reference
    pub fn has_remote_image(&self) -> bool {
        is_remote_uri(&self.image_ref)
    }

    /// Flag or completion marker present
    pub fn is_processed(&self) -> bool {
        self.is_optimized || has_completion_marker(&self.image_ref)
    }

    /// Title used in the error log, falling back to the id for untitled records
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

pub fn is_remote_uri(uri: &str) -> bool {
    let uri = uri.trim();
    if uri.is_empty() {
        return false;
    }
    match Url::parse(uri) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Lowercase ASCII slug with single dashes between words
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Append (or replace) the completion marker on a URI.
///
/// Strings that do not parse as absolute URLs get the marker appended textually.
pub fn append_completion_marker(uri: &str, timestamp_ms: i64) -> String {
    let value = timestamp_ms.to_string();
    match Url::parse(uri) {
        Ok(mut url) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != COMPLETION_MARKER_KEY)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut pairs = url.query_pairs_mut();
                pairs.clear();
                for (k, v) in &kept {
                    pairs.append_pair(k, v);
                }
                pairs.append_pair(COMPLETION_MARKER_KEY, &value);
            }
            url.to_string()
        }
        Err(_) => {
            let sep = if uri.contains('?') { '&' } else { '?' };
            format!("{uri}{sep}{COMPLETION_MARKER_KEY}={value}")
        }
    }
}

pub fn has_completion_marker(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => url
            .query_pairs()
            .any(|(k, v)| k == COMPLETION_MARKER_KEY && v.parse::<i64>().is_ok()),
        Err(_) => false,
    }
}

/// The URI with any completion marker removed
pub fn strip_completion_marker(uri: &str) -> String {
    let Ok(mut url) = Url::parse(uri) else {
        return uri.to_string();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != COMPLETION_MARKER_KEY)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }
    url.to_string()
}

/// Whether two references name the same stored object, ignoring the marker
pub fn same_asset(a: &str, b: &str) -> bool {
    strip_completion_marker(a) == strip_completion_marker(b)
}

/// Encoding produced by the local converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    WebP,
    Jpeg,
}

impl TargetFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            TargetFormat::WebP => "image/webp",
            TargetFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::WebP => "webp",
            TargetFormat::Jpeg => "jpg",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Some(TargetFormat::WebP),
            "jpeg" | "jpg" => Some(TargetFormat::Jpeg),
            _ => None,
        }
    }
}

/// Which local strategy produced an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DirectFetch,
    ElementLoad,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DirectFetch => "direct_fetch",
            StrategyKind::ElementLoad => "element_load",
        }
    }
}

/// Re-encoded bytes, owned by the call that produced them until upload
#[derive(Debug, Clone)]
pub struct ConvertedAsset {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub source_strategy: StrategyKind,
}

/// Which conversion path the orchestrator may take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeMode {
    /// Gateway when configured, local converter otherwise (if enabled)
    #[default]
    Auto,
    GatewayOnly,
    LocalOnly,
}

/// Ordered, de-duplicated accumulation of heavy records
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    items: Vec<Record>,
    ids: HashSet<String>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless a record with the same id is already present
    pub fn push(&mut self, record: Record) -> bool {
        if self.ids.contains(&record.id) {
            return false;
        }
        self.ids.insert(record.id.clone());
        self.items.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.items.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.items.get(index)
    }

    /// Drop the first `count` items, keeping the rest in order
    pub fn discard_front(&mut self, count: usize) {
        let count = count.min(self.items.len());
        for record in self.items.drain(..count) {
            self.ids.remove(&record.id);
        }
    }

    pub fn titles(&self) -> Vec<String> {
        self.items.iter().map(|r| r.display_title().to_string()).collect()
    }
}

/// Result of one scan window
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub processed: usize,
    pub candidates_added: usize,
    pub unknown_added: usize,
    pub skipped: usize,
    pub cursor: usize,
    pub total: usize,
    pub exhausted: bool,
}

/// Live batch progress, rebuilt on every unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub current: usize,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub status_message: String,
}

impl ProgressState {
    pub fn starting(total: usize) -> Self {
        Self {
            total,
            status_message: format!("Starting batch of {} items", total),
            ..Default::default()
        }
    }
}

/// One per-item failure during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorLogEntry {
    pub record_title: String,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl ErrorLogEntry {
    pub fn new(record_title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record_title: record_title.into(),
            message: message.into(),
            at: chrono::Utc::now(),
        }
    }
}

/// How a batch run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Operator read model
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub cursor: usize,
    pub total_records: usize,
    pub candidates: usize,
    pub unknown_count: usize,
    pub force_all: bool,
    pub progress: ProgressState,
    pub errors: Vec<ErrorLogEntry>,
    pub gateway_configured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Scanning,
    Running,
}

//! Recorded interaction playback and capture.

use crate::error::{EngineError, NoRecording};
use crate::exchange::{MockRequest, MockResponse, ResponseSource};
use base64::Engine as _;
use bytes::Bytes;
use hyper::StatusCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How a part of the request is compared against a recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Must be identical
    #[default]
    Exact,
    /// Not compared
    Ignored,
    /// Everything recorded must be present in the request
    Subset,
}

/// What happens when replay is armed but nothing matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFallback {
    /// Continue with the mock pipeline
    #[default]
    Mock,
    /// Answer 404
    Fail,
}

/// Request half of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
}

/// Response half of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
}

impl RecordedResponse {
    /// Body bytes and the content type implied by how the body was stored.
    fn body_bytes(&self) -> (Bytes, Option<&'static str>) {
        if let Some(encoded) = &self.body_base64 {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap_or_default();
            return (Bytes::from(bytes), Some("application/octet-stream"));
        }
        if let Some(text) = &self.body_text {
            return (Bytes::from(text.clone()), Some("text/plain"));
        }
        match &self.body {
            Some(value) => (Bytes::from(value.to_string()), Some("application/json")),
            None => (Bytes::new(), None),
        }
    }

    /// Rebuild the recorded response.
    pub fn to_response(&self) -> MockResponse {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let (body, implied) = self.body_bytes();
        let mut response = MockResponse::new(status, ResponseSource::Replay).with_body(body);
        for (name, value) in &self.headers {
            response.set_header(name.clone(), value.clone());
        }
        if let Some(content_type) = implied {
            if response.header("content-type").is_none() {
                response.set_header("Content-Type", content_type);
            }
        }
        response
    }
}

/// One recorded exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EntryRepr")]
pub struct ReplayEntry {
    pub request: RecordedRequest,
    pub response: RecordedResponse,
}

/// Accepted on-disk shapes: `{request, response}` or the flat
/// `{method, path, status, body}` form.
#[derive(Deserialize)]
#[serde(untagged)]
enum EntryRepr {
    Full {
        request: RecordedRequest,
        response: RecordedResponse,
    },
    Flat {
        method: String,
        path: String,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        body: Option<Value>,
    },
}

fn default_status() -> u16 {
    200
}

impl From<EntryRepr> for ReplayEntry {
    fn from(repr: EntryRepr) -> Self {
        match repr {
            EntryRepr::Full { request, response } => Self { request, response },
            EntryRepr::Flat {
                method,
                path,
                status,
                body,
            } => Self {
                request: RecordedRequest {
                    method,
                    path,
                    query: BTreeMap::new(),
                    body: None,
                    body_text: None,
                },
                response: RecordedResponse {
                    status,
                    headers: BTreeMap::new(),
                    body: body.filter(|b| !b.is_null()),
                    body_text: None,
                    body_base64: None,
                },
            },
        }
    }
}

/// Comparable form of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    body: Option<Value>,
    body_hash: Option<[u8; 32]>,
}

impl Fingerprint {
    pub fn of_request(request: &MockRequest) -> Self {
        let body = (!request.body.is_empty())
            .then(|| serde_json::from_slice::<Value>(&request.body).ok())
            .flatten();
        let body_hash = match &body {
            Some(value) => Some(hash(value.to_string().as_bytes())),
            None if request.body.is_empty() => None,
            None => Some(hash(&request.body)),
        };
        Self {
            method: request.method.as_str().to_ascii_uppercase(),
            path: request.path.clone(),
            query: request.query_pairs().into_iter().collect(),
            body,
            body_hash,
        }
    }

    fn of_recording(request: &RecordedRequest) -> Self {
        let body_hash = match (&request.body, &request.body_text) {
            (Some(value), _) => Some(hash(value.to_string().as_bytes())),
            (None, Some(text)) => Some(hash(text.as_bytes())),
            (None, None) => None,
        };
        Self {
            method: request.method.to_ascii_uppercase(),
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            body_hash,
        }
    }
}

fn hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// `expected` is contained in `actual` (objects by key, recursively).
fn json_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| json_subset(v, a))),
        _ => expected == actual,
    }
}

/// Finds the recording that answers a request.
#[derive(Debug, Clone)]
pub struct ReplayMatcher {
    entries: Vec<(Fingerprint, ReplayEntry)>,
    query_mode: MatchMode,
    body_mode: MatchMode,
}

impl ReplayMatcher {
    pub fn new(entries: Vec<ReplayEntry>, query_mode: MatchMode, body_mode: MatchMode) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (Fingerprint::of_recording(&entry.request), entry))
            .collect();
        Self {
            entries,
            query_mode,
            body_mode,
        }
    }

    /// Load a JSON recording file.
    pub fn load(path: &Path, query_mode: MatchMode, body_mode: MatchMode) -> Result<Self, EngineError> {
        let entries = load_entries(path)?;
        info!(path = %path.display(), recordings = entries.len(), "Loaded recordings");
        Ok(Self::new(entries, query_mode, body_mode))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best recording for a request: the most specific equivalent entry,
    /// ties going to the one recorded last.
    pub fn lookup(&self, request: &MockRequest) -> Result<&ReplayEntry, NoRecording> {
        let wanted = Fingerprint::of_request(request);
        let mut best: Option<((usize, usize), &ReplayEntry)> = None;

        for (recorded, entry) in &self.entries {
            let Some(score) = self.score(recorded, &wanted) else {
                continue;
            };
            if best.as_ref().map_or(true, |(current, _)| score >= *current) {
                best = Some((score, entry));
            }
        }

        match best {
            Some((_, entry)) => {
                debug!(method = %wanted.method, path = %wanted.path, "Replaying recording");
                Ok(entry)
            }
            None => Err(NoRecording {
                method: wanted.method,
                path: wanted.path,
            }),
        }
    }

    /// `None` when not equivalent; otherwise (query params compared, body compared).
    fn score(&self, recorded: &Fingerprint, wanted: &Fingerprint) -> Option<(usize, usize)> {
        if recorded.method != wanted.method || recorded.path != wanted.path {
            return None;
        }

        let query = match self.query_mode {
            MatchMode::Ignored => 0,
            MatchMode::Exact if recorded.query == wanted.query => recorded.query.len(),
            MatchMode::Subset
                if recorded
                    .query
                    .iter()
                    .all(|(k, v)| wanted.query.get(k) == Some(v)) =>
            {
                recorded.query.len()
            }
            _ => return None,
        };

        let body = match self.body_mode {
            MatchMode::Ignored => 0,
            MatchMode::Exact if recorded.body_hash == wanted.body_hash => {
                usize::from(recorded.body_hash.is_some())
            }
            MatchMode::Subset => match (&recorded.body, &wanted.body) {
                (None, _) if recorded.body_hash.is_none() => 0,
                (Some(expected), Some(actual)) if json_subset(expected, actual) => 1,
                _ => return None,
            },
            _ => return None,
        };

        Some((query, body))
    }
}

fn load_entries(path: &Path) -> Result<Vec<ReplayEntry>, EngineError> {
    let failure = |reason: String| EngineError::Recordings {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| failure(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| failure(e.to_string()))
}

/// Captures proxied exchanges and writes them out for later replay.
#[derive(Debug)]
pub struct Recorder {
    path: PathBuf,
    entries: Mutex<Vec<ReplayEntry>>,
}

impl Recorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn record(&self, request: &MockRequest, response: &MockResponse) {
        let (body, body_text) = split_body(&request.body);
        let recorded_request = RecordedRequest {
            method: request.method.as_str().to_string(),
            path: request.path.clone(),
            query: request.query_pairs().into_iter().collect(),
            body,
            body_text,
        };

        let (body, body_text) = split_body(&response.body);
        let body_base64 = (body.is_none() && body_text.is_none() && !response.body.is_empty())
            .then(|| base64::engine::general_purpose::STANDARD.encode(&response.body));
        let headers: HashMap<String, String> = response
            .headers
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.clone()))
            .collect();
        let recorded_response = RecordedResponse {
            status: response.status.as_u16(),
            headers: headers.into_iter().collect(),
            body,
            body_text,
            body_base64,
        };

        self.entries.lock().push(ReplayEntry {
            request: recorded_request,
            response: recorded_response,
        });
    }

    /// Write every captured exchange as a JSON array.
    pub fn save(&self) -> Result<usize, EngineError> {
        let entries = self.entries.lock();
        let json = serde_json::to_string_pretty(&*entries).map_err(|e| EngineError::Recordings {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&self.path, json).map_err(|e| EngineError::Recordings {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        info!(path = %self.path.display(), recordings = entries.len(), "Saved recordings");
        Ok(entries.len())
    }
}

/// JSON body, or text body when it is UTF-8 but not JSON.
fn split_body(body: &Bytes) -> (Option<Value>, Option<String>) {
    if body.is_empty() {
        return (None, None);
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return (Some(value), None);
    }
    match std::str::from_utf8(body) {
        Ok(text) => (None, Some(text.to_string())),
        Err(_) => (None, None),
    }
}

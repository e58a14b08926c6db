//! Watches a job document in the hosted document store through its REST API.
//!
//! The store exposes no push stream over plain REST, so the document is polled
//! and an observation is pushed whenever its status changes.

use super::{EventSink, JobWatcher, WatchHandle};
use crate::identity::Session;
use crate::model::{Credential, JobState, Observation, WatchEvent, WATCH_BROKEN};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";

pub struct FirestoreWatcher {
    http: reqwest::Client,
    base_url: reqwest::Url,
    project_id: String,
    collection: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
    sessions: Option<watch::Receiver<Option<Session>>>,
}

impl FirestoreWatcher {
    pub fn new(
        http: reqwest::Client,
        project_id: impl Into<String>,
        collection: impl Into<String>,
    ) -> Result<Self> {
        Self::with_base_url(http, FIRESTORE_URL, project_id, collection)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        base_url: &str,
        project_id: impl Into<String>,
        collection: impl Into<String>,
    ) -> Result<Self> {
        let base_url = reqwest::Url::parse(base_url)
            .with_context(|| format!("invalid document store URL: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("document store URL cannot be a base: {base_url}");
        }
        Ok(Self {
            http,
            base_url,
            project_id: project_id.into(),
            collection: collection.into(),
            poll_interval: Duration::from_secs(2),
            timeout: None,
            sessions: None,
        })
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(100));
        self
    }

    /// Give up on a job that has not settled within `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Authenticate polls with the latest session token, so a refreshed token
    /// replaces the one the watch started with.
    pub fn follow_session(mut self, sessions: watch::Receiver<Option<Session>>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    fn document_url(&self, job_id: &str) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().extend([
                "projects",
                self.project_id.as_str(),
                "databases",
                "(default)",
                "documents",
                self.collection.as_str(),
                job_id,
            ]);
        }
        url
    }
}

impl JobWatcher for FirestoreWatcher {
    fn watch(
        &self,
        job_id: &str,
        generation: u64,
        credential: &Credential,
        sink: EventSink,
    ) -> WatchHandle {
        let poll = DocumentPoll {
            http: self.http.clone(),
            url: self.document_url(job_id),
            credential: credential.clone(),
            sessions: self.sessions.clone(),
            job_id: job_id.to_string(),
            generation,
            interval: self.poll_interval,
            deadline: self.timeout.map(|t| Instant::now() + t),
        };
        tracing::debug!(job_id, generation, url = %poll.url, "watching job document");
        let task = tokio::spawn(poll.run(sink));
        WatchHandle::new(job_id, generation, move || task.abort())
    }
}

struct DocumentPoll {
    http: reqwest::Client,
    url: reqwest::Url,
    credential: Credential,
    sessions: Option<watch::Receiver<Option<Session>>>,
    job_id: String,
    generation: u64,
    interval: Duration,
    deadline: Option<Instant>,
}

impl DocumentPoll {
    async fn run(self, sink: EventSink) {
        let mut last: Option<Observation> = None;
        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(job_id = %self.job_id, "job did not settle before the watch timeout");
                self.emit(&sink, Observation::TransportError(WATCH_BROKEN.to_string()));
                return;
            }

            let observation = match self.fetch().await {
                Ok(None) => None,
                Ok(Some(doc)) => Some(match JobState::from_document(&doc) {
                    Some(state) => Observation::State(state),
                    None => Observation::Unrecognized,
                }),
                Err(e) => {
                    let detail = format!("{e:#}");
                    tracing::warn!(job_id = %self.job_id, error = %detail, "job watch failed");
                    Some(Observation::TransportError(WATCH_BROKEN.to_string()))
                }
            };

            if let Some(obs) = observation {
                let settled = match &obs {
                    Observation::State(state) => state.is_terminal(),
                    Observation::TransportError(_) => true,
                    Observation::Unrecognized => false,
                };
                if last.as_ref() != Some(&obs) {
                    last = Some(obs.clone());
                    if !self.emit(&sink, obs) {
                        return;
                    }
                }
                if settled {
                    return;
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Returns false once nobody is listening.
    fn emit(&self, sink: &EventSink, observation: Observation) -> bool {
        sink.send(WatchEvent {
            generation: self.generation,
            job_id: self.job_id.clone(),
            observation,
        })
        .is_ok()
    }

    fn bearer(&self) -> Credential {
        self.sessions
            .as_ref()
            .and_then(|rx| {
                rx.borrow()
                    .as_ref()
                    .filter(|s| !s.is_expired())
                    .map(|s| s.credential.clone())
            })
            .unwrap_or_else(|| self.credential.clone())
    }

    /// Fetch the job document, `None` if it has not been created yet.
    async fn fetch(&self) -> Result<Option<Value>> {
        let credential = self.bearer();
        let resp = self
            .http
            .get(self.url.clone())
            .bearer_auth(credential.bearer())
            .send()
            .await
            .context("document request failed")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().context("document request rejected")?;
        let raw: Value = resp.json().await.context("malformed document body")?;
        Ok(Some(decode_document(&raw)))
    }
}

/// Convert a REST document (`{"fields": {...}}` of typed values) into plain JSON.
pub fn decode_document(raw: &Value) -> Value {
    match raw.get("fields").and_then(Value::as_object) {
        Some(fields) => decode_fields(fields),
        None => Value::Object(Map::new()),
    }
}

fn decode_fields(fields: &Map<String, Value>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), decode_value(v)))
            .collect(),
    )
}

fn decode_value(v: &Value) -> Value {
    let Some(obj) = v.as_object() else {
        return Value::Null;
    };
    let Some((kind, inner)) = obj.iter().next() else {
        return Value::Null;
    };
    match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => inner.clone(),
        // 64-bit integers travel as strings.
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from)
            .unwrap_or_else(|| inner.clone()),
        "doubleValue" => inner.clone(),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "geoPointValue" => inner.clone(),
        "mapValue" => inner
            .get("fields")
            .and_then(Value::as_object)
            .map(decode_fields)
            .unwrap_or_else(|| Value::Object(Map::new())),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vals| vals.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        _ => Value::Null,
    }
}

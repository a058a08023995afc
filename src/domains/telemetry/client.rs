use super::sink::MetricsSink;
use crate::infrastructure::events::{BeaconChannel, HandlerId, MessageBus};
use chrono::Utc;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Well-known file holding the anonymous identifier, one line of plain text.
pub const IDENTIFIER_FILE: &str = "telemetry.txt";

#[derive(Debug)]
pub enum TelemetryError {
    ReadIdentifier(PathBuf, std::io::Error),
    WriteIdentifier(PathBuf, std::io::Error),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::ReadIdentifier(path, e) => {
                write!(f, "Failed to read identifier file {}: {e}", path.display())
            }
            TelemetryError::WriteIdentifier(path, e) => {
                write!(f, "Failed to write identifier file {}: {e}", path.display())
            }
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Per-user application data directory for this subsystem.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("beacon")
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event_name: String,
    properties: Map<String, Value>,
}

struct ClientState {
    /// `None` until the one-shot consent resolution; then fixed for the
    /// process lifetime.
    consent: Option<bool>,
    queue: Vec<QueuedEvent>,
}

/// Event-tracking client gated on user consent.
///
/// Owns the persistent anonymous identifier and an in-memory queue of events
/// tracked before consent is known. Building the client performs the
/// identifier file I/O but registers nothing on the bus; listening starts
/// when the owner calls [`TelemetryClient::register_handlers`] /
/// [`TelemetryClient::listen_for_install_consent`].
pub struct TelemetryClient {
    distinct_id: String,
    sink: Arc<dyn MetricsSink>,
    state: Mutex<ClientState>,
}

impl TelemetryClient {
    /// Read the identifier from `<data_dir>/telemetry.txt`, generating and
    /// persisting a fresh one on first run. I/O failures abort construction.
    pub fn new(data_dir: &Path, sink: Arc<dyn MetricsSink>) -> Result<Self, TelemetryError> {
        let distinct_id = load_or_create_distinct_id(data_dir)?;
        Ok(Self {
            distinct_id,
            sink,
            state: Mutex::new(ClientState {
                consent: None,
                queue: Vec::new(),
            }),
        })
    }

    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    /// Number of events waiting for consent to be resolved.
    pub fn pending_events(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Record an event. The identifier and a unix-millis timestamp are merged
    /// into the properties at call time. Sent immediately once consent is
    /// granted, queued otherwise. Any event name is accepted.
    pub fn track(&self, event_name: &str, properties: Option<Map<String, Value>>) {
        let mut merged = properties.unwrap_or_default();
        merged.insert(
            "distinct_id".to_string(),
            Value::String(self.distinct_id.clone()),
        );
        merged.insert("time".to_string(), Value::from(Utc::now().timestamp_millis()));

        let mut state = self.state.lock().unwrap();
        if state.consent == Some(true) {
            // Sending under the state lock keeps direct sends ordered behind
            // any flush still draining the queue.
            if let Err(e) = self.sink.track(event_name, &merged) {
                log::warn!("Failed to forward event '{event_name}' to metrics sink: {e}");
            }
            return;
        }

        state.queue.push(QueuedEvent {
            event_name: event_name.to_string(),
            properties: merged,
        });
        log::debug!(
            "Queued event '{event_name}' pending consent ({} waiting)",
            state.queue.len()
        );
    }

    /// Increment a numeric user property on the sink.
    ///
    /// Not gated on the consent flag: callers resolve consent before exposing
    /// this channel to peers.
    pub fn increment(&self, property: &str, by: f64) {
        if let Err(e) = self.sink.increment(&self.distinct_id, property, by) {
            log::warn!("Failed to increment user property '{property}': {e}");
        }
    }

    /// Resolve the consent flag. Only the first resolution takes effect; on
    /// `true`, queued events are flushed to the sink in insertion order.
    pub fn set_consent(&self, granted: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(resolved) = state.consent {
            log::warn!("Metrics consent already resolved to {resolved}; ignoring repeat");
            return;
        }
        state.consent = Some(granted);

        if !granted {
            log::info!(
                "Metrics consent denied; {} queued event(s) will not be sent",
                state.queue.len()
            );
            return;
        }

        let queued = std::mem::take(&mut state.queue);
        log::info!("Metrics consent granted; flushing {} queued event(s)", queued.len());
        // Still under the state lock: nothing tracked after the flip can
        // overtake the drained events.
        for event in queued {
            if let Err(e) = self.sink.track(&event.event_name, &event.properties) {
                log::warn!("Failed to flush queued event '{}': {e}", event.event_name);
            }
        }
    }

    /// Install the persistent track/increment handlers on the bus.
    pub fn register_handlers(self: &Arc<Self>, bus: &MessageBus) -> HandlerRegistration {
        let client = Arc::clone(self);
        let track = bus.on(BeaconChannel::TrackEvent, move |payload| {
            let Some(event_name) = payload.get("event").and_then(Value::as_str) else {
                log::warn!("Dropping track-event message without an event name");
                return;
            };
            let properties = payload.get("properties").and_then(Value::as_object).cloned();
            client.track(event_name, properties);
        });

        let client = Arc::clone(self);
        let increment = bus.on(BeaconChannel::IncrementUserProperty, move |payload| {
            let Some(property) = payload.get("property").and_then(Value::as_str) else {
                log::warn!("Dropping increment-user-property message without a property name");
                return;
            };
            let by = payload.get("by").and_then(Value::as_f64).unwrap_or(1.0);
            client.increment(property, by);
        });

        HandlerRegistration { track, increment }
    }

    /// Install the one-shot handler that resolves consent from the
    /// install/options completion message. A missing or non-boolean
    /// `allowMetrics` field counts as declined.
    pub fn listen_for_install_consent(self: &Arc<Self>, bus: &MessageBus) -> HandlerId {
        let client = Arc::clone(self);
        bus.once(BeaconChannel::InstallOptionsComplete, move |payload| {
            let allow = payload
                .get("allowMetrics")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            client.set_consent(allow);
        })
    }
}

/// Handles for the persistent bus handlers, kept by the owner for teardown.
pub struct HandlerRegistration {
    pub track: HandlerId,
    pub increment: HandlerId,
}

impl HandlerRegistration {
    pub fn deregister(&self, bus: &MessageBus) {
        bus.off(BeaconChannel::TrackEvent, self.track);
        bus.off(BeaconChannel::IncrementUserProperty, self.increment);
    }
}

fn load_or_create_distinct_id(data_dir: &Path) -> Result<String, TelemetryError> {
    let path = data_dir.join(IDENTIFIER_FILE);

    if path.exists() {
        let id = fs::read_to_string(&path)
            .map_err(|e| TelemetryError::ReadIdentifier(path.clone(), e))?;
        log::debug!("Loaded telemetry identifier from {}", path.display());
        return Ok(id);
    }

    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .map_err(|e| TelemetryError::WriteIdentifier(path.clone(), e))?;
    }

    let id = uuid::Uuid::new_v4().to_string();
    fs::write(&path, &id).map_err(|e| TelemetryError::WriteIdentifier(path.clone(), e))?;
    log::info!("Generated new telemetry identifier at {}", path.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::super::tests::RecordingSink;
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn client_in(dir: &TempDir) -> (Arc<TelemetryClient>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let client = TelemetryClient::new(dir.path(), sink.clone() as Arc<dyn MetricsSink>)
            .expect("client construction");
        (Arc::new(client), sink)
    }

    #[test]
    fn test_first_construction_creates_identifier_file() {
        let dir = TempDir::new().unwrap();
        let (client, _) = client_in(&dir);

        let path = dir.path().join(IDENTIFIER_FILE);
        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.is_empty());
        assert_eq!(written, client.distinct_id());
    }

    #[test]
    fn test_second_construction_reuses_identifier() {
        let dir = TempDir::new().unwrap();
        let (first, _) = client_in(&dir);

        let path = dir.path().join(IDENTIFIER_FILE);
        let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

        let (second, _) = client_in(&dir);
        assert_eq!(first.distinct_id(), second.distinct_id());

        let mtime_after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after, "file must not be rewritten");
    }

    #[test]
    fn test_existing_identifier_read_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IDENTIFIER_FILE);
        fs::write(&path, "existing-uuid").unwrap();

        let (client, _) = client_in(&dir);
        assert_eq!(client.distinct_id(), "existing-uuid");
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing-uuid");
    }

    #[test]
    fn test_construction_fails_on_unreadable_data_dir() {
        let dir = TempDir::new().unwrap();
        let file_as_dir = dir.path().join("not-a-dir");
        fs::write(&file_as_dir, "occupied").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let result = TelemetryClient::new(&file_as_dir, sink as Arc<dyn MetricsSink>);
        assert!(result.is_err());
    }

    #[test]
    fn test_track_before_consent_queues_with_merged_properties() {
        let dir = TempDir::new().unwrap();
        let (client, sink) = client_in(&dir);

        let mut properties = Map::new();
        properties.insert("page".to_string(), json!("settings"));
        client.track("page-viewed", Some(properties));

        assert_eq!(client.pending_events(), 1);
        assert!(sink.tracked().is_empty(), "nothing may reach the sink yet");

        // Flush and inspect the merged properties
        client.set_consent(true);
        let tracked = sink.tracked();
        assert_eq!(tracked.len(), 1);
        let (name, props) = &tracked[0];
        assert_eq!(name, "page-viewed");
        assert_eq!(props["page"], "settings");
        assert_eq!(props["distinct_id"], client.distinct_id());
        assert!(props["time"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_tracks_spanning_consent_boundary_all_reach_sink_in_order() {
        let dir = TempDir::new().unwrap();
        let (client, sink) = client_in(&dir);

        client.track("before-consent", None);
        client.set_consent(true);
        client.track("after-consent", None);

        assert_eq!(client.pending_events(), 0);
        let tracked = sink.tracked();
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].0, "before-consent");
        assert_eq!(tracked[1].0, "after-consent");
    }

    #[test]
    fn test_consent_denied_keeps_events_off_the_sink() {
        let dir = TempDir::new().unwrap();
        let (client, sink) = client_in(&dir);

        client.track("never-sent", None);
        client.set_consent(false);
        client.track("also-never-sent", None);

        assert!(sink.tracked().is_empty());
        assert_eq!(client.pending_events(), 2);
    }

    #[test]
    fn test_consent_resolves_only_once() {
        let dir = TempDir::new().unwrap();
        let (client, sink) = client_in(&dir);

        client.set_consent(false);
        client.track("spanned", None);
        // Second resolution must be ignored, so nothing flushes.
        client.set_consent(true);

        assert!(sink.tracked().is_empty());
        assert_eq!(client.pending_events(), 1);
    }

    #[test]
    fn test_increment_forwards_regardless_of_consent() {
        let dir = TempDir::new().unwrap();
        let (client, sink) = client_in(&dir);

        client.increment("launches", 1.0);
        client.set_consent(false);
        client.increment("launches", 2.0);

        let increments = sink.increments();
        assert_eq!(increments.len(), 2);
        assert_eq!(
            increments[0],
            (client.distinct_id().to_string(), "launches".to_string(), 1.0)
        );
        assert_eq!(increments[1].2, 2.0);
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::failing());
        let client = TelemetryClient::new(dir.path(), sink.clone() as Arc<dyn MetricsSink>)
            .expect("client construction");

        client.track("queued", None);
        client.set_consent(true);
        client.track("direct", None);
        client.increment("count", 1.0);
        // No panic, queue drained despite failures
        assert_eq!(client.pending_events(), 0);
    }
}

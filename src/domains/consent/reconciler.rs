use crate::infrastructure::events::{BeaconChannel, MessageBus};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

/// Settings-store key recording the application version the user last saw a
/// consent decision for.
pub const CONSENT_VERSION_KEY: &str = "telemetryConsentVersion";

/// Page identifier of the consent screen.
pub const CONSENT_PAGE: &str = "metrics-consent";

/// An unanswered prompt resolves to "no consent" after this long rather than
/// stalling startup forever.
const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Version-string store (host application's settings store).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
}

/// The user's metrics preference plus its persistence operation. `None`
/// means the user never decided.
pub trait MetricsPreferences: Send + Sync {
    fn metrics_enabled(&self) -> Option<bool>;
    fn set_metrics_enabled(&self, enabled: bool);
    fn save(&self) -> Result<(), String>;
}

/// Window/UI controller, used only to show the consent screen.
pub trait PageNavigator: Send + Sync {
    fn load_page(&self, page: &str);
}

/// One-shot startup routine deciding whether metrics collection is currently
/// permitted.
///
/// Compares the version the user last consented under against the running
/// version; an upgrade with a previous opt-in re-prompts via the UI and waits
/// for the one-time answer. The caller feeds the returned decision into
/// [`crate::domains::telemetry::TelemetryClient::set_consent`].
pub struct ConsentReconciler<'a> {
    store: &'a dyn KeyValueStore,
    preferences: &'a dyn MetricsPreferences,
    navigator: &'a dyn PageNavigator,
    bus: &'a MessageBus,
    current_version: String,
    prompt_timeout: Duration,
}

impl<'a> ConsentReconciler<'a> {
    pub fn new(
        store: &'a dyn KeyValueStore,
        preferences: &'a dyn MetricsPreferences,
        navigator: &'a dyn PageNavigator,
        bus: &'a MessageBus,
        current_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            preferences,
            navigator,
            bus,
            current_version: current_version.into(),
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
        }
    }

    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub async fn reconcile(&self) -> bool {
        let stored_version = self
            .store
            .get(CONSENT_VERSION_KEY)
            .and_then(|v| v.as_str().map(str::to_string));
        let preference = self.preferences.metrics_enabled();

        if stored_version.as_deref() == Some(self.current_version.as_str()) {
            // Already settled for this version; the stored preference stands.
            return preference == Some(true);
        }

        // Version changed or never recorded: mark the decision as settled for
        // this version up front, then work out what it is.
        self.store.set(
            CONSENT_VERSION_KEY,
            Value::String(self.current_version.clone()),
        );

        if preference != Some(true) {
            // Never opted in, or declined: no prompt, no metrics.
            log::debug!(
                "Metrics preference is {preference:?} at version change; resolving to no consent"
            );
            return false;
        }

        self.prompt_for_consent().await
    }

    /// The user opted in under an older version; ask again.
    async fn prompt_for_consent(&self) -> bool {
        log::info!(
            "Previous metrics opt-in predates version {}; re-prompting",
            self.current_version
        );

        let (tx, rx) = oneshot::channel();
        // Registered before navigation so the answer cannot race the prompt.
        let handler = self
            .bus
            .once(BeaconChannel::SetMetricsConsent, move |payload: Value| {
                // Anything other than an explicit boolean counts as declined.
                let _ = tx.send(payload.as_bool().unwrap_or(false));
            });

        self.navigator.load_page(CONSENT_PAGE);

        match tokio::time::timeout(self.prompt_timeout, rx).await {
            Ok(Ok(decision)) => {
                self.preferences.set_metrics_enabled(decision);
                if let Err(e) = self.preferences.save() {
                    log::warn!("Failed to persist metrics consent decision: {e}");
                }
                log::info!("User resolved metrics consent to {decision}");
                decision
            }
            Ok(Err(_)) => {
                // Handler torn down without firing; treat as declined.
                false
            }
            Err(_) => {
                log::warn!(
                    "Consent prompt unanswered after {:?}; treating as declined",
                    self.prompt_timeout
                );
                self.bus.off_once(BeaconChannel::SetMetricsConsent, handler);
                false
            }
        }
    }
}

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeaconChannel {
    InstallOptionsComplete,
    TrackEvent,
    IncrementUserProperty,
    SetMetricsConsent,
}

impl BeaconChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeaconChannel::InstallOptionsComplete => "beacon:install-options-complete",
            BeaconChannel::TrackEvent => "beacon:track-event",
            BeaconChannel::IncrementUserProperty => "beacon:increment-user-property",
            BeaconChannel::SetMetricsConsent => "beacon:set-metrics-consent",
        }
    }
}

/// Opaque handle returned by registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(Value) + Send + Sync>;
type OnceHandler = Box<dyn FnOnce(Value) + Send>;

#[derive(Default)]
struct Registry {
    persistent: HashMap<BeaconChannel, Vec<(HandlerId, Handler)>>,
    once: HashMap<BeaconChannel, Vec<(HandlerId, OnceHandler)>>,
}

/// In-process message bus the host application's IPC layer feeds into.
///
/// Registration is explicit and owned by the component that installs the
/// handler; every registration returns a [`HandlerId`] so the owner can tear
/// the handler down again. One-shot handlers are removed before they fire.
pub struct MessageBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on<F>(&self, channel: BeaconChannel, handler: F) -> HandlerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let mut registry = self.registry.lock().unwrap();
        registry
            .persistent
            .entry(channel)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn once<F>(&self, channel: BeaconChannel, handler: F) -> HandlerId
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let id = self.allocate_id();
        let mut registry = self.registry.lock().unwrap();
        registry
            .once
            .entry(channel)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    pub fn off(&self, channel: BeaconChannel, id: HandlerId) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(handlers) = registry.persistent.get_mut(&channel) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    pub fn off_once(&self, channel: BeaconChannel, id: HandlerId) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(handlers) = registry.once.get_mut(&channel) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    /// Deliver `payload` to every handler registered on `channel`.
    ///
    /// Persistent handlers run in registration order, then any one-shot
    /// handlers fire and are consumed. Handlers are invoked outside the
    /// registry lock, so they may register or deregister on the bus.
    pub fn emit(&self, channel: BeaconChannel, payload: Value) {
        let (handlers, once_handlers) = {
            let mut registry = self.registry.lock().unwrap();
            let handlers: Vec<Handler> = registry
                .persistent
                .get(&channel)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            let once_handlers = registry.once.remove(&channel).unwrap_or_default();
            (handlers, once_handlers)
        };

        log::debug!(
            "Dispatching '{}' to {} handler(s)",
            channel.as_str(),
            handlers.len() + once_handlers.len()
        );

        for handler in &handlers {
            handler(payload.clone());
        }
        for (_, handler) in once_handlers {
            handler(payload.clone());
        }
    }
}

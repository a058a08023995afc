pub mod reconciler;

pub use reconciler::{
    ConsentReconciler, KeyValueStore, MetricsPreferences, PageNavigator, CONSENT_PAGE,
    CONSENT_VERSION_KEY,
};

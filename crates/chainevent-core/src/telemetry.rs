//! Tracing / logging initialisation helpers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log levels for the event service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-crate overrides, e.g. `"chainevent-client" → "debug"`.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Emit JSON structured logs instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `"info,chainevent_client=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global tracing subscriber. Call once at application startup;
/// an invalid directive string falls back to `info`.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_with_components() {
        let mut config = LogConfig::default();
        config.components.insert("chainevent-client".into(), "debug".into());
        config.components.insert("chainevent-dispatcher".into(), "trace".into());
        assert_eq!(
            config.directives(),
            "info,chainevent_client=debug,chainevent_dispatcher=trace"
        );
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LogConfig {
            level: "not a level ===".into(),
            ..Default::default()
        };
        init_tracing(&config);
        init_tracing(&LogConfig::default());
    }
}

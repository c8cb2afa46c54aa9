//! Tracing / logging initialisation helpers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: crate name → level, e.g. `"chainfeed-ws": "debug"`
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String { "info".to_string() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

/// The `EnvFilter` directive string for `config`, e.g.
/// `"info,chainfeed_ws=debug"`.
pub fn directives(config: &LogConfig) -> String {
    let mut out = config.level.clone();
    for (component, level) in &config.components {
        out.push_str(&format!(",{}={}", component.replace('-', "_"), level));
    }
    out
}

/// Install the global subscriber described by `config`.
///
/// Returns `false` if a global subscriber was already set; the existing one
/// stays in place. Unparseable directives fall back to `info`.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(directives(config)).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[], "info")]
    #[case(&[("chainfeed-ws", "debug")], "info,chainfeed_ws=debug")]
    #[case(
        &[("chainfeed-filters", "trace"), ("chainfeed-core", "warn")],
        "info,chainfeed_core=warn,chainfeed_filters=trace"
    )]
    fn directive_string(#[case] components: &[(&str, &str)], #[case] expected: &str) {
        let config = LogConfig {
            components: components
                .iter()
                .map(|(c, l)| (c.to_string(), l.to_string()))
                .collect(),
            ..Default::default()
        };
        assert_eq!(directives(&config), expected);
    }

    #[test]
    fn config_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"json":true}"#).unwrap();
        assert_eq!(config.level, "info");
        assert!(config.components.is_empty());
        assert!(config.json);
    }

    #[test]
    fn second_init_is_a_no_op() {
        init_tracing(&LogConfig::default());
        assert!(!init_tracing(&LogConfig::default()));
    }
}

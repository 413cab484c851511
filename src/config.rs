//! Engine configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: builder methods such as [`EngineConfig::with_names_enabled`]
//! 2. **Environment variables**: `RIVULET_*` variables
//! 3. **Config file**: a TOML file (requires the `config-file` feature)
//! 4. **Defaults**: development defaults in debug builds, production otherwise
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `RIVULET_ENVIRONMENT` | `development`/`production` | base profile |
//! | `RIVULET_ENABLE_NAMES` | `bool` | `names_enabled` |
//! | `RIVULET_VALIDATE_SUBSCRIPTIONS` | `bool` | `validate_subscriptions` |
//! | `RIVULET_CHECK_INVARIANTS` | `bool` | `check_invariants` and `check_api_invariants` |
//! | `RIVULET_PURGE_TASKS_ON_RUNAWAY` | `bool` | `purge_tasks_when_runaway_detected` |
//! | `RIVULET_MAX_ROUNDS` | `usize` | `max_rounds` |
//!
//! The active configuration is per thread: streams, VPUs and schedulers never
//! leave the thread that created them, so neither does the configuration that
//! governs them. The first read on a thread loads [`EngineConfig::from_env`].

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use crate::tracing_compat::{debug, warn};

/// Environment variable selecting the base profile.
pub const ENV_ENVIRONMENT: &str = "RIVULET_ENVIRONMENT";
/// Environment variable toggling diagnostic names.
pub const ENV_ENABLE_NAMES: &str = "RIVULET_ENABLE_NAMES";
/// Environment variable toggling subscriber validation.
pub const ENV_VALIDATE_SUBSCRIPTIONS: &str = "RIVULET_VALIDATE_SUBSCRIPTIONS";
/// Environment variable toggling invariant checks.
pub const ENV_CHECK_INVARIANTS: &str = "RIVULET_CHECK_INVARIANTS";
/// Environment variable toggling the runaway purge policy.
pub const ENV_PURGE_TASKS_ON_RUNAWAY: &str = "RIVULET_PURGE_TASKS_ON_RUNAWAY";
/// Environment variable for the round-based executor budget.
pub const ENV_MAX_ROUNDS: &str = "RIVULET_MAX_ROUNDS";

/// Error raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable held a value of the wrong shape.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable or key name.
        var: String,
        /// Expected shape.
        expected: &'static str,
        /// Value found.
        value: String,
    },
    /// A config file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// A config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Base profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// All diagnostics on.
    Development,
    /// Diagnostics and checks elided.
    Production,
}

impl Environment {
    fn parse(var: &str, value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                expected: "development or production",
                value: value.to_string(),
            }),
        }
    }
}

/// Engine-wide flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct EngineConfig {
    /// Base profile the flags were derived from.
    pub environment: Environment,
    /// Generate diagnostic names for streams, hubs, tasks and VPUs.
    pub names_enabled: bool,
    /// Wrap every subscriber in the validating state machine.
    pub validate_subscriptions: bool,
    /// Evaluate internal invariants.
    pub check_invariants: bool,
    /// Evaluate API-usage invariants.
    pub check_api_invariants: bool,
    /// Deliver uncaught errors to registered handlers.
    pub uncaught_error_handlers_enabled: bool,
    /// Drop every queued task before failing on runaway detection.
    pub purge_tasks_when_runaway_detected: bool,
    /// Consecutive non-draining rounds allowed before a runaway is declared.
    pub max_rounds: usize,
}

impl EngineConfig {
    /// Default round budget for round-based executors.
    pub const DEFAULT_MAX_ROUNDS: usize = 100;

    /// Development profile: every diagnostic enabled.
    #[must_use]
    pub const fn development() -> Self {
        Self {
            environment: Environment::Development,
            names_enabled: true,
            validate_subscriptions: true,
            check_invariants: true,
            check_api_invariants: true,
            uncaught_error_handlers_enabled: true,
            purge_tasks_when_runaway_detected: true,
            max_rounds: Self::DEFAULT_MAX_ROUNDS,
        }
    }

    /// Production profile: checks and names elided.
    #[must_use]
    pub const fn production() -> Self {
        Self {
            environment: Environment::Production,
            names_enabled: false,
            validate_subscriptions: false,
            check_invariants: false,
            check_api_invariants: false,
            uncaught_error_handlers_enabled: true,
            purge_tasks_when_runaway_detected: true,
            max_rounds: Self::DEFAULT_MAX_ROUNDS,
        }
    }

    /// Profile for an environment.
    #[must_use]
    pub const fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::development(),
            Environment::Production => Self::production(),
        }
    }

    /// Defaults plus `RIVULET_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides read through `lookup`.
    ///
    /// `RIVULET_ENVIRONMENT` is applied first and resets every flag to that
    /// profile; individual flags then override the profile.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup(ENV_ENVIRONMENT) {
            *self = Self::for_environment(Environment::parse(ENV_ENVIRONMENT, &val)?);
        }
        if let Some(val) = lookup(ENV_ENABLE_NAMES) {
            self.names_enabled = parse_bool(ENV_ENABLE_NAMES, &val)?;
        }
        if let Some(val) = lookup(ENV_VALIDATE_SUBSCRIPTIONS) {
            self.validate_subscriptions = parse_bool(ENV_VALIDATE_SUBSCRIPTIONS, &val)?;
        }
        if let Some(val) = lookup(ENV_CHECK_INVARIANTS) {
            let on = parse_bool(ENV_CHECK_INVARIANTS, &val)?;
            self.check_invariants = on;
            self.check_api_invariants = on;
        }
        if let Some(val) = lookup(ENV_PURGE_TASKS_ON_RUNAWAY) {
            self.purge_tasks_when_runaway_detected =
                parse_bool(ENV_PURGE_TASKS_ON_RUNAWAY, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_ROUNDS) {
            self.max_rounds = parse_usize(ENV_MAX_ROUNDS, &val)?;
        }
        Ok(())
    }

    /// Sets `names_enabled`.
    #[must_use]
    pub const fn with_names_enabled(mut self, enabled: bool) -> Self {
        self.names_enabled = enabled;
        self
    }

    /// Sets `validate_subscriptions`.
    #[must_use]
    pub const fn with_validate_subscriptions(mut self, enabled: bool) -> Self {
        self.validate_subscriptions = enabled;
        self
    }

    /// Sets both invariant-checking flags.
    #[must_use]
    pub const fn with_invariant_checks(mut self, enabled: bool) -> Self {
        self.check_invariants = enabled;
        self.check_api_invariants = enabled;
        self
    }

    /// Sets `purge_tasks_when_runaway_detected`.
    #[must_use]
    pub const fn with_purge_on_runaway(mut self, enabled: bool) -> Self {
        self.purge_tasks_when_runaway_detected = enabled;
        self
    }

    /// Sets `uncaught_error_handlers_enabled`.
    #[must_use]
    pub const fn with_uncaught_error_handlers(mut self, enabled: bool) -> Self {
        self.uncaught_error_handlers_enabled = enabled;
        self
    }

    /// Sets `max_rounds`.
    #[must_use]
    pub const fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::development()
        } else {
            Self::production()
        }
    }
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var: var_name.to_string(),
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: var_name.to_string(),
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable engine configuration.
///
/// ```toml
/// environment = "production"
///
/// [diagnostics]
/// names_enabled = true
/// validate_subscriptions = false
/// check_invariants = false
///
/// [executor]
/// max_rounds = 250
/// purge_tasks_when_runaway_detected = true
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct EngineTomlConfig {
    /// Base profile.
    pub environment: Option<Environment>,
    /// Diagnostic switches.
    #[serde(default)]
    pub diagnostics: DiagnosticsToml,
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorToml,
}

/// Diagnostics section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct DiagnosticsToml {
    /// Generate diagnostic names.
    pub names_enabled: Option<bool>,
    /// Validate subscribers.
    pub validate_subscriptions: Option<bool>,
    /// Evaluate invariants.
    pub check_invariants: Option<bool>,
    /// Deliver uncaught errors to handlers.
    pub uncaught_error_handlers_enabled: Option<bool>,
}

/// Executor section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ExecutorToml {
    /// Round budget.
    pub max_rounds: Option<usize>,
    /// Runaway purge policy.
    pub purge_tasks_when_runaway_detected: Option<bool>,
}

#[cfg(feature = "config-file")]
impl EngineConfig {
    /// Applies a parsed TOML config; only present keys override.
    pub fn apply_toml(&mut self, toml: &EngineTomlConfig) {
        if let Some(environment) = toml.environment {
            *self = Self::for_environment(environment);
        }
        if let Some(v) = toml.diagnostics.names_enabled {
            self.names_enabled = v;
        }
        if let Some(v) = toml.diagnostics.validate_subscriptions {
            self.validate_subscriptions = v;
        }
        if let Some(v) = toml.diagnostics.check_invariants {
            self.check_invariants = v;
            self.check_api_invariants = v;
        }
        if let Some(v) = toml.diagnostics.uncaught_error_handlers_enabled {
            self.uncaught_error_handlers_enabled = v;
        }
        if let Some(v) = toml.executor.max_rounds {
            self.max_rounds = v;
        }
        if let Some(v) = toml.executor.purge_tasks_when_runaway_detected {
            self.purge_tasks_when_runaway_detected = v;
        }
    }

    /// Defaults overridden by a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let parsed: EngineTomlConfig =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();
        config.apply_toml(&parsed);
        Ok(config)
    }

    /// Defaults, then the TOML file, then `RIVULET_*` environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }
}

// =========================================================================
// Per-thread active configuration
// =========================================================================

thread_local! {
    static ACTIVE: Cell<Option<EngineConfig>> = const { Cell::new(None) };
}

/// Returns the configuration active on this thread.
#[must_use]
pub fn current() -> EngineConfig {
    ACTIVE.with(|active| {
        active.get().unwrap_or_else(|| {
            let loaded = EngineConfig::from_env().unwrap_or_else(|_err| {
                warn!(error = %_err, "ignoring invalid RIVULET_* environment");
                EngineConfig::default()
            });
            active.set(Some(loaded));
            loaded
        })
    })
}

/// Installs `config` on this thread, returning the previous configuration.
pub fn install(config: EngineConfig) -> EngineConfig {
    let previous = current();
    ACTIVE.with(|active| active.set(Some(config)));
    debug!(?config, "engine configuration installed");
    previous
}

/// Whether diagnostic names are generated.
#[must_use]
pub fn names_enabled() -> bool {
    current().names_enabled
}

/// Whether subscribers are wrapped in the validating state machine.
#[must_use]
pub fn validate_subscriptions() -> bool {
    current().validate_subscriptions
}

/// Whether internal invariants are evaluated.
#[must_use]
pub fn check_invariants() -> bool {
    current().check_invariants
}

/// Whether API-usage invariants are evaluated.
#[must_use]
pub fn check_api_invariants() -> bool {
    current().check_api_invariants
}

/// Whether uncaught errors reach registered handlers.
#[must_use]
pub fn uncaught_error_handlers_enabled() -> bool {
    current().uncaught_error_handlers_enabled
}

/// Whether runaway detection purges the task queue first.
#[must_use]
pub fn purge_tasks_when_runaway_detected() -> bool {
    current().purge_tasks_when_runaway_detected
}

/// Round budget for executors created on this thread.
#[must_use]
pub fn max_rounds() -> usize {
    current().max_rounds
}

/// Builds a diagnostic name as `prefix(params)`, or `None` when names are off.
///
/// An explicit `name` wins over the generated one.
#[must_use]
pub fn generate_name(name: Option<&str>, prefix: &str, params: Option<&str>) -> Option<String> {
    if !names_enabled() {
        return None;
    }
    Some(name.map_or_else(
        || format!("{prefix}({})", params.unwrap_or("")),
        ToString::to_string,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::collections::HashMap;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn profiles_differ_in_diagnostics() {
        init_test("profiles_differ_in_diagnostics");
        let dev = EngineConfig::development();
        let prod = EngineConfig::production();
        crate::assert_with_log!(dev.names_enabled, "dev names", true, dev.names_enabled);
        crate::assert_with_log!(!prod.check_invariants, "prod checks", false, prod.check_invariants);
        crate::assert_with_log!(
            prod.max_rounds == 100,
            "round budget",
            100,
            prod.max_rounds
        );
        crate::test_complete!("profiles_differ_in_diagnostics");
    }

    #[test]
    fn environment_resets_then_flags_override() {
        init_test("environment_resets_then_flags_override");
        let mut config = EngineConfig::development();
        config
            .apply_overrides(lookup(&[
                (ENV_ENVIRONMENT, "production"),
                (ENV_ENABLE_NAMES, "yes"),
                (ENV_MAX_ROUNDS, " 7 "),
            ]))
            .expect("valid overrides");
        crate::assert_with_log!(
            config.environment == Environment::Production,
            "environment",
            Environment::Production,
            config.environment
        );
        crate::assert_with_log!(config.names_enabled, "names", true, config.names_enabled);
        crate::assert_with_log!(
            !config.validate_subscriptions,
            "validation follows profile",
            false,
            config.validate_subscriptions
        );
        crate::assert_with_log!(config.max_rounds == 7, "rounds", 7, config.max_rounds);
        crate::test_complete!("environment_resets_then_flags_override");
    }

    #[test]
    fn invalid_values_are_rejected() {
        init_test("invalid_values_are_rejected");
        let mut config = EngineConfig::development();
        let err = config
            .apply_overrides(lookup(&[(ENV_VALIDATE_SUBSCRIPTIONS, "maybe")]))
            .expect_err("maybe is not a bool");
        let text = err.to_string();
        crate::assert_with_log!(
            text.contains(ENV_VALIDATE_SUBSCRIPTIONS),
            "error names the variable",
            ENV_VALIDATE_SUBSCRIPTIONS,
            text
        );
        let err = config
            .apply_overrides(lookup(&[(ENV_ENVIRONMENT, "staging")]))
            .expect_err("unknown environment");
        crate::assert_with_log!(
            matches!(err, ConfigError::InvalidValue { .. }),
            "invalid environment",
            "InvalidValue",
            err
        );
        crate::test_complete!("invalid_values_are_rejected");
    }

    #[test]
    fn install_is_thread_local() {
        init_test("install_is_thread_local");
        install(EngineConfig::production().with_names_enabled(true));
        crate::assert_with_log!(names_enabled(), "names on", true, names_enabled());
        let other = std::thread::spawn(|| {
            install(EngineConfig::development().with_names_enabled(false));
            names_enabled()
        })
        .join()
        .expect("thread");
        crate::assert_with_log!(!other, "other thread", false, other);
        crate::assert_with_log!(names_enabled(), "unchanged here", true, names_enabled());
        install(EngineConfig::development());
        crate::test_complete!("install_is_thread_local");
    }

    #[test]
    fn generated_names_follow_flag() {
        init_test("generated_names_follow_flag");
        install(EngineConfig::development());
        let name = generate_name(None, "limit", Some("3"));
        crate::assert_with_log!(
            name.as_deref() == Some("limit(3)"),
            "generated",
            "limit(3)",
            name
        );
        let name = generate_name(Some("firstThree"), "limit", Some("3"));
        crate::assert_with_log!(
            name.as_deref() == Some("firstThree"),
            "explicit",
            "firstThree",
            name
        );
        install(EngineConfig::development().with_names_enabled(false));
        let name = generate_name(None, "limit", None);
        crate::assert_with_log!(name.is_none(), "disabled", "None", name);
        install(EngineConfig::development());
        crate::test_complete!("generated_names_follow_flag");
    }

    #[test]
    fn config_serializes_with_defaults() {
        init_test("config_serializes_with_defaults");
        let parsed: EngineConfig =
            toml::from_str("names_enabled = false\nmax_rounds = 3").expect("parse");
        crate::assert_with_log!(!parsed.names_enabled, "names", false, parsed.names_enabled);
        crate::assert_with_log!(parsed.max_rounds == 3, "rounds", 3, parsed.max_rounds);
        crate::test_complete!("config_serializes_with_defaults");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_sections_override_profile() {
        init_test("toml_sections_override_profile");
        let config = EngineConfig::from_toml_str(
            "environment = \"production\"\n[diagnostics]\nnames_enabled = true\n[executor]\nmax_rounds = 250\n",
        )
        .expect("parse");
        crate::assert_with_log!(config.names_enabled, "names", true, config.names_enabled);
        crate::assert_with_log!(
            !config.check_invariants,
            "profile kept",
            false,
            config.check_invariants
        );
        crate::assert_with_log!(config.max_rounds == 250, "rounds", 250, config.max_rounds);
        crate::test_complete!("toml_sections_override_profile");
    }
}

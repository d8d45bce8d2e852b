//! Service configuration.
//!
//! Parsed from TOML. Every field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! [daemon]
//! log_level = "info"
//!
//! [timing]
//! click_window_ms = 1000
//! save_revoke_delay_ms = 60000
//!
//! [limits]
//! max_components_per_process = 500
//!
//! [consent]
//! file = "/var/lib/scmgr/consent.json"
//! required_kinds = ["location", "paste", "save"]
//!
//! [[displays]]
//! id = 0
//! width = 1260
//! height = 2720
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::ComponentKind;
use crate::occlusion::DEFAULT_UI_EXTENSION_MASK;
use crate::validator::ValidationPolicy;

/// Errors from loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub validation: ValidationPolicy,

    #[serde(default)]
    pub occlusion: OcclusionConfig,

    #[serde(default)]
    pub consent: ConsentConfig,

    /// Static display table used when running standalone.
    #[serde(default)]
    pub displays: Vec<DisplayConfig>,
}

impl ServiceConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails
    /// [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML, e.g. for `--check-config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be represented in TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values that would silently disable a protection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        for (name, value) in [
            ("timing.click_window_ms", t.click_window_ms),
            ("timing.save_revoke_delay_ms", t.save_revoke_delay_ms),
            (
                "timing.background_revoke_delay_ms",
                t.background_revoke_delay_ms,
            ),
            ("timing.service_exit_delay_ms", t.service_exit_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be non-zero")));
            }
        }

        if self.limits.max_components_per_process == 0 {
            return Err(ConfigError::Validation(
                "limits.max_components_per_process must be non-zero".to_string(),
            ));
        }
        if self.limits.max_info_len == 0 {
            return Err(ConfigError::Validation(
                "limits.max_info_len must be non-zero".to_string(),
            ));
        }

        let v = &self.validation;
        for (name, value) in [
            ("validation.min_font_size_without_icon", v.min_font_size_without_icon),
            ("validation.min_font_size_with_icon", v.min_font_size_with_icon),
            ("validation.min_icon_size", v.min_icon_size),
            ("validation.min_padding", v.min_padding),
            ("validation.borderless_padding", v.borderless_padding),
            ("validation.min_text_icon_space", v.min_text_icon_space),
            ("validation.color_distance_threshold", v.color_distance_threshold),
            ("validation.background_dominance_ratio", v.background_dominance_ratio),
            ("validation.max_screen_area_ratio", v.max_screen_area_ratio),
            ("validation.epsilon", v.epsilon),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{name} must be finite and non-negative"
                )));
            }
        }
        if v.max_screen_area_ratio > 1.0 || v.background_dominance_ratio > 1.0 {
            return Err(ConfigError::Validation(
                "validation ratios must not exceed 1.0".to_string(),
            ));
        }

        for display in &self.displays {
            if !(display.width.is_finite() && display.height.is_finite())
                || display.width <= 0.0
                || display.height <= 0.0
            {
                return Err(ConfigError::Validation(format!(
                    "display {} has a non-positive size",
                    display.id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Process-level settings for the daemon binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log to this file instead of stdout.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// Time windows and delays, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How far in the past a click timestamp may lie.
    pub click_window_ms: u64,
    /// Lifetime of one save grant.
    pub save_revoke_delay_ms: u64,
    /// Delay between going to the background and losing capability grants.
    pub background_revoke_delay_ms: u64,
    /// Idle time with no registered components before the service exits.
    pub service_exit_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            click_window_ms: crate::click::DEFAULT_CLICK_WINDOW_MS,
            save_revoke_delay_ms: 60_000,
            background_revoke_delay_ms: 10_000,
            service_exit_delay_ms: 30_000,
        }
    }
}

/// Resource bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_components_per_process: usize,
    /// Upper bound for the click extra-info payload.
    pub max_extra_info_len: usize,
    /// Upper bound for the declared component info document.
    pub max_info_len: usize,
    pub require_extra_info: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_components_per_process: 500,
            max_extra_info_len: crate::click::DEFAULT_MAX_EXTRA_INFO_LEN,
            max_info_len: 16 * 1024,
            require_extra_info: false,
        }
    }
}

/// Occlusion check settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionConfig {
    /// Window ids with all these bits set are UI-extension windows.
    pub ui_extension_mask: u32,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            ui_extension_mask: DEFAULT_UI_EXTENSION_MASK,
        }
    }
}

/// First-use consent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// Persisted consent records.
    pub file: PathBuf,
    /// Kinds that need a first-use consent before their first grant.
    pub required_kinds: Vec<ComponentKind>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/var/lib/scmgr/consent.json"),
            required_kinds: ComponentKind::all().to_vec(),
        }
    }
}

/// One entry of the static display table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub id: u64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub circular: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServiceConfig::from_toml("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.timing.click_window_ms, 1_000);
        assert_eq!(config.timing.save_revoke_delay_ms, 60_000);
        assert_eq!(config.limits.max_components_per_process, 500);
        assert_eq!(config.consent.required_kinds.len(), 3);
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_partial_sections() {
        let config = ServiceConfig::from_toml(
            r#"
            [timing]
            save_revoke_delay_ms = 5000

            [validation]
            min_icon_size = 16.0

            [consent]
            required_kinds = ["location"]

            [[displays]]
            id = 0
            width = 1080
            height = 2340

            [[displays]]
            id = 1
            width = 466
            height = 466
            circular = true
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.save_revoke_delay_ms, 5_000);
        assert_eq!(config.timing.click_window_ms, 1_000);
        assert!((config.validation.min_icon_size - 16.0).abs() < f64::EPSILON);
        assert!((config.validation.min_font_size_without_icon - 12.0).abs() < f64::EPSILON);
        assert_eq!(config.consent.required_kinds, vec![ComponentKind::Location]);
        assert_eq!(config.displays.len(), 2);
        assert!(config.displays[1].circular);
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = ServiceConfig::from_toml("[timing]\nclick_window_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("click_window_ms")));
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let err = ServiceConfig::from_toml("[validation]\nmin_padding = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_bad_display_rejected() {
        let err = ServiceConfig::from_toml("[[displays]]\nid = 3\nwidth = 0\nheight = 10\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("display 3")));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err =
            ServiceConfig::from_toml("[consent]\nrequired_kinds = [\"camera\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ServiceConfig::default();
        config.daemon.log_file = Some(PathBuf::from("/tmp/scmgr.log"));
        let text = config.to_toml().unwrap();
        assert_eq!(ServiceConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scmgr.toml");
        std::fs::write(&path, "[limits]\nmax_components_per_process = 3\n").unwrap();
        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.limits.max_components_per_process, 3);

        assert!(matches!(
            ServiceConfig::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}

//! # Engine Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! threading = "single"
//!
//! [simulation]
//! target_hz = 60
//!
//! [fences]
//! max_outstanding = 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{SyncError, SyncResult};

/// How the simulation and graphics loops are mapped onto threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingMode {
    /// One thread simulates and draws. Always fresh, costs serialized.
    Single,
    /// Separate simulation and graphics threads. Draw may be one cycle stale.
    #[default]
    Multi,
}

/// Pacing configuration for one frame scheduler.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Thread name.
    pub name: String,
    /// Cycle cap in Hz. `None` runs uncapped.
    pub target_hz: Option<u32>,
    /// Remaining budget (microseconds) below which the pacer spins instead of sleeping.
    pub spin_window_us: u64,
    /// Upper clamp for the per-tick elapsed time handed to the task. Must be
    /// finite and positive.
    pub max_delta_seconds: f32,
}

impl SchedulerConfig {
    /// Creates a named config with the given cap and default pacing.
    #[must_use]
    pub fn named(name: &str, target_hz: Option<u32>) -> Self {
        Self {
            name: name.to_owned(),
            target_hz,
            ..Self::default()
        }
    }

    /// Minimum time one iteration may take, if capped.
    #[must_use]
    pub fn min_cycle(&self) -> Option<Duration> {
        self.target_hz
            .filter(|hz| *hz > 0)
            .map(|hz| Duration::from_nanos(1_000_000_000 / u64::from(hz)))
    }

    /// Spin window as a duration.
    #[must_use]
    pub fn spin_window(&self) -> Duration {
        Duration::from_micros(self.spin_window_us)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "scheduler".to_owned(),
            target_hz: None,
            spin_window_us: 1000,
            max_delta_seconds: 0.1,
        }
    }
}

/// Outstanding-fence bound.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FenceConfig {
    /// Fences kept in flight before `push` waits on the oldest one.
    pub max_outstanding: usize,
    /// How long `push` waits on the oldest fence when over the bound (ms).
    pub overflow_wait_ms: u64,
}

impl FenceConfig {
    /// Overflow wait as a duration.
    #[must_use]
    pub fn overflow_wait(&self) -> Duration {
        Duration::from_millis(self.overflow_wait_ms)
    }
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 8,
            overflow_wait_ms: 16,
        }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Single- or multi-threaded operation.
    pub threading: ThreadingMode,
    /// Maximum commands in flight on the command queue.
    pub command_queue_capacity: usize,
    /// Per-thread join budget on shutdown (ms).
    pub shutdown_timeout_ms: u64,
    /// How long startup waits for the graphics context to come up (ms).
    pub context_init_timeout_ms: u64,
    /// How long `begin_write` waits on a pending fence before reusing the slot anyway (ms).
    pub fence_wait_timeout_ms: u64,
    /// Capacity of the draw-result event channel.
    pub frame_event_capacity: usize,
    /// Simulation loop pacing.
    pub simulation: SchedulerConfig,
    /// Graphics loop pacing.
    pub graphics: SchedulerConfig,
    /// Fence tracker bound.
    pub fences: FenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threading: ThreadingMode::Multi,
            command_queue_capacity: 4096,
            shutdown_timeout_ms: 2000,
            context_init_timeout_ms: 5000,
            fence_wait_timeout_ms: 50,
            frame_event_capacity: 256,
            simulation: SchedulerConfig::named("simulation", Some(120)),
            graphics: SchedulerConfig::named("graphics", Some(240)),
            fences: FenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the document is malformed or fails validation.
    pub fn from_toml_str(text: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first invalid field.
    pub fn validate(&self) -> SyncResult<()> {
        if self.command_queue_capacity == 0 {
            return Err(SyncError::Config("command_queue_capacity must be > 0".into()));
        }
        if self.frame_event_capacity == 0 {
            return Err(SyncError::Config("frame_event_capacity must be > 0".into()));
        }
        if self.fences.max_outstanding == 0 {
            return Err(SyncError::Config("fences.max_outstanding must be >= 1".into()));
        }
        for sched in [&self.simulation, &self.graphics] {
            if sched.target_hz == Some(0) {
                return Err(SyncError::Config(format!(
                    "{}.target_hz must be > 0 (omit it to run uncapped)",
                    sched.name
                )));
            }
            // NaN would compare false here and silently disable the clamp
            if !(sched.max_delta_seconds.is_finite() && sched.max_delta_seconds > 0.0) {
                return Err(SyncError::Config(format!(
                    "{}.max_delta_seconds must be a positive number",
                    sched.name
                )));
            }
        }
        Ok(())
    }

    /// Shutdown join budget as a duration.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Context startup budget as a duration.
    #[must_use]
    pub fn context_init_timeout(&self) -> Duration {
        Duration::from_millis(self.context_init_timeout_ms)
    }

    /// Fence wait budget as a duration.
    #[must_use]
    pub fn fence_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.threading, ThreadingMode::Multi);
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            threading = "single"
            fence_wait_timeout_ms = 5

            [simulation]
            name = "sim"
            target_hz = 60

            [fences]
            max_outstanding = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.threading, ThreadingMode::Single);
        assert_eq!(config.simulation.name, "sim");
        assert_eq!(config.simulation.target_hz, Some(60));
        // Unset fields inside a table fall back to defaults
        assert_eq!(config.simulation.spin_window_us, 1000);
        assert_eq!(config.fences.max_outstanding, 3);
        assert_eq!(config.fences.overflow_wait_ms, 16);
        assert_eq!(config.fence_wait_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn test_min_cycle() {
        let capped = SchedulerConfig::named("a", Some(100));
        assert_eq!(capped.min_cycle(), Some(Duration::from_millis(10)));

        let uncapped = SchedulerConfig::named("b", None);
        assert_eq!(uncapped.min_cycle(), None);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("command_queue_capacity = 0"),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[graphics]\ntarget_hz = 0"),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[fences]\nmax_outstanding = 0"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_validation_rejects_non_positive_delta_clamp() {
        for value in ["nan", "-nan", "inf", "0.0", "-0.1"] {
            let document = format!("[simulation]\nmax_delta_seconds = {value}");
            assert!(
                matches!(EngineConfig::from_toml_str(&document), Err(SyncError::Config(_))),
                "max_delta_seconds = {value} was accepted"
            );
        }
        assert!(EngineConfig::from_toml_str("[simulation]\nmax_delta_seconds = 0.25").is_ok());
    }

    #[test]
    fn test_unknown_threading_mode() {
        assert!(EngineConfig::from_toml_str("threading = \"hyper\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}

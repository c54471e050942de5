use std::{path::Path, time::Duration};

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::{Error, Result};

/// Name of the optional override file picked up by [`CoalescerConfig::load`].
pub const LOCAL_CONFIG: &str = "Coalescer.toml";

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
/// When a dispatched reservation stops holding the transport.
pub enum Release {
    /// Once the operation's future resolves
    #[default]
    Completion,
    /// Only when [`crate::Coalescer::transport_free`] is called
    Notify,
    /// Right after the call is dispatched, before it has finished
    Dispatch,
}

#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(default)]
/// Config values for [`crate::Coalescer`].
pub struct CoalescerConfig {
    /// Fraction of the poll interval used for the first poll when the transport is free
    pub priority_factor: f64,
    /// Milliseconds between polls
    pub poll_interval_ms: u64,
    /// Milliseconds a reservation may wait before it fails
    pub timeout_budget_ms: u64,
    /// How in-flight state is released after a dispatch
    pub release: Release,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            priority_factor: 0.6,
            poll_interval_ms: 500,
            timeout_budget_ms: 60_000,
            release: Release::Completion,
        }
    }
}

impl CoalescerConfig {
    /// Load configuration from the embedded defaults, `Coalescer.toml` in the
    /// working directory and `COALESCER_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(LOCAL_CONFIG)
    }

    /// Same as [`CoalescerConfig::load`] but with an explicit override file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut builder = Config::builder().add_source(File::from_str(
            include_str!("../Coalescer.toml"),
            FileFormat::Toml,
        ));

        if path.exists() {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config: Self = builder
            .add_source(Environment::with_prefix("COALESCER").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.priority_factor) {
            return Err(Error::InvalidConfig("priority_factor must be within [0, 1]"));
        }

        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("poll_interval_ms must be positive"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before the first poll of a cycle.
    ///
    /// Shortened by `priority_factor` when the transport is free, so a burst
    /// of reservations still has a moment to settle on its last member.
    pub fn first_delay(&self, transport_free: bool) -> Duration {
        if transport_free {
            let millis = (self.poll_interval_ms as f64 * self.priority_factor).round() as u64;
            Duration::from_millis(millis)
        } else {
            self.poll_interval()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::{const_mutex, Mutex, MutexGuard};

    use super::{CoalescerConfig, Release};
    use crate::Error;

    /// Loading reads the process environment, so loads run one at a time.
    static ENVIRONMENT: Mutex<()> = const_mutex(());

    /// Sets an environment variable for the lifetime of the guard.
    struct EnvVar {
        key: &'static str,
        _lock: MutexGuard<'static, ()>,
    }

    impl EnvVar {
        fn set(key: &'static str, value: &str) -> Self {
            let lock = ENVIRONMENT.lock();
            std::env::set_var(key, value);
            Self { key, _lock: lock }
        }
    }

    impl Drop for EnvVar {
        fn drop(&mut self) {
            std::env::remove_var(self.key);
        }
    }

    #[test]
    fn defaults_match_embedded_file() {
        let _lock = ENVIRONMENT.lock();
        let config = CoalescerConfig::load_from("this/file/does/not/exist.toml").unwrap();

        assert_eq!(config, CoalescerConfig::default());
    }

    #[test]
    fn local_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Coalescer.toml");
        std::fs::write(&path, "poll_interval_ms = 250\nrelease = \"notify\"\n").unwrap();
        let _lock = ENVIRONMENT.lock();

        let config = CoalescerConfig::load_from(&path).unwrap();

        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.release, Release::Notify);
        assert_eq!(config.priority_factor, 0.6);
        assert_eq!(config.timeout_budget_ms, 60_000);
    }

    #[test]
    fn invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Coalescer.toml");
        std::fs::write(&path, "priority_factor = 1.5\n").unwrap();
        let _lock = ENVIRONMENT.lock();

        assert_eq!(
            CoalescerConfig::load_from(&path),
            Err(Error::InvalidConfig("priority_factor must be within [0, 1]"))
        );
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Coalescer.toml");
        std::fs::write(&path, "poll_interval_ms = 100\n").unwrap();

        let _var = EnvVar::set("COALESCER_POLL_INTERVAL_MS", "250");
        let config = CoalescerConfig::load_from(&path).unwrap();

        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.timeout_budget_ms, 60_000);
        assert_eq!(config.release, Release::Completion);
    }

    #[test]
    fn validate_bounds() {
        let mut config = CoalescerConfig::default();
        assert!(config.validate().is_ok());

        config.priority_factor = f64::NAN;
        assert!(config.validate().is_err());

        config.priority_factor = 0.0;
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        config.poll_interval_ms = 1;
        config.timeout_budget_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn first_delay_is_shortened_only_when_free() {
        let config = CoalescerConfig::default();

        assert_eq!(config.first_delay(true), Duration::from_millis(300));
        assert_eq!(config.first_delay(false), Duration::from_millis(500));
    }
}

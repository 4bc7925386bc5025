use std::env;
use std::num::ParseIntError;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket front door listens on.
    pub port: u16,
    /// Bandwidth estimation mode: `true` selects TWCC/GCC, `false` the
    /// loss-based receiver-report path.
    pub gcc: bool,
    /// Root for resource resolution (data directories, assets).
    pub project_root: String,
    /// Logging level (e.g., "info", "debug").
    pub rust_log: String,
    /// `DS_ENV=DEV` switches to human-readable logs and dev asset behavior.
    pub dev_mode: bool,
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// A port value could not be parsed as a 16-bit integer.
    InvalidPort(String, ParseIntError),
    /// A port value was 0, which is logically invalid for this application.
    PortOutOfRange(u16),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort(val, err) => {
                write!(f, "PORT must be a valid port number (got '{}': {})", val, err)
            }
            ConfigError::PortOutOfRange(port) => {
                write!(f, "PORT must be between 1 and 65535 (got {})", port)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validates environment variables and returns a Config object.
pub fn validate_env() -> Result<Config, ConfigError> {
    let port_str = env::var("PORT").unwrap_or_else(|_| "8000".to_string());
    let port: u16 = port_str
        .parse()
        .map_err(|e| ConfigError::InvalidPort(port_str.clone(), e))?;
    if port == 0 {
        return Err(ConfigError::PortOutOfRange(port));
    }

    let gcc = matches!(
        env::var("GCC").unwrap_or_default().to_lowercase().as_str(),
        "1" | "true"
    );

    let project_root = env::var("PROJECT_ROOT").unwrap_or_else(|_| "./".to_string());

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let dev_mode = env::var("DS_ENV").unwrap_or_default() == "DEV";

    Ok(Config {
        port,
        gcc,
        project_root,
        rust_log,
        dev_mode,
    })
}

/// Bitrate bounds for one output stream kind, in bits per second.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub min_bitrate: u64,
    pub default_bitrate: u64,
    pub max_bitrate: u64,
}

/// Encoder-facing stream configuration shared by all rooms.
#[derive(Debug, Clone)]
pub struct StreamsConfig {
    pub audio: StreamConfig,
    pub video: StreamConfig,
    /// How often sender controllers and slices re-evaluate bitrate targets.
    pub encoder_control_period_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        StreamsConfig {
            audio: StreamConfig {
                min_bitrate: 16_000,
                default_bitrate: 32_000,
                max_bitrate: 64_000,
            },
            video: StreamConfig {
                min_bitrate: 150_000,
                default_bitrate: 1_000_000,
                max_bitrate: 2_500_000,
            },
            encoder_control_period_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    // Helper to set up and tear down environment variables for tests
    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_validate_env_defaults() {
        let mut guard = EnvGuard::new();
        guard.unset("PORT");
        guard.unset("GCC");
        guard.unset("DS_ENV");
        guard.unset("RUST_LOG");

        let config = validate_env().expect("expected valid configuration");
        assert_eq!(config.port, 8000);
        assert!(!config.gcc);
        assert!(!config.dev_mode);
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_validate_env_invalid_port() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "not-a-number");

        let result = validate_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(_, _)));
        assert!(err.to_string().contains("PORT must be a valid port number"));
    }

    #[test]
    fn test_validate_env_port_out_of_range() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "0");

        let result = validate_env();
        assert!(matches!(result, Err(ConfigError::PortOutOfRange(0))));
    }

    #[test]
    fn test_validate_env_gcc_flag() {
        let mut guard = EnvGuard::new();
        guard.set("GCC", "true");
        assert!(validate_env().unwrap().gcc);
        guard.set("GCC", "1");
        assert!(validate_env().unwrap().gcc);
        guard.set("GCC", "false");
        assert!(!validate_env().unwrap().gcc);
    }

    #[test]
    fn test_validate_env_dev_mode() {
        let mut guard = EnvGuard::new();
        guard.set("DS_ENV", "DEV");
        assert!(validate_env().unwrap().dev_mode);
        guard.set("DS_ENV", "BUILD_FRONT");
        assert!(!validate_env().unwrap().dev_mode);
    }

    #[test]
    fn test_streams_config_defaults_are_ordered() {
        let streams = StreamsConfig::default();
        for s in [streams.audio, streams.video] {
            assert!(s.min_bitrate <= s.default_bitrate);
            assert!(s.default_bitrate <= s.max_bitrate);
        }
        assert!(streams.encoder_control_period_ms > 0);
    }
}

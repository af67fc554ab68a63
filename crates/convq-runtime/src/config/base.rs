use super::{cache::CacheConfig, derivation::DerivationConfig, pass::PassConfig};
use alloc::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static CONVQ_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// Represents the global configuration for convq, combining cache, pass and derivation settings.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration for the scale and reorder cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Configuration for the graph passes.
    #[serde(default)]
    pub pass: PassConfig,

    /// Configuration for the scale derivation.
    #[serde(default)]
    pub derivation: DerivationConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `convq.toml` or `Convq.toml` in the
    /// current directory or its parents, then applies environment overrides. If no file is found,
    /// a default configuration is used.
    ///
    /// # Notes
    ///
    /// Calling this function takes a global lock. Execution contexts read it once when created.
    pub fn get() -> Arc<Self> {
        let mut state = CONVQ_GLOBAL_CONFIG.lock();

        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                cfg_if::cfg_if! {
                    if #[cfg(std_io)] {
                        let config = Self::from_current_dir().override_from_env();
                    } else {
                        let config = Self::default();
                    }
                }

                let config = Arc::new(config);
                *state = Some(config.clone());
                config
            }
        }
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = CONVQ_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    #[cfg(std_io)]
    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

        std::fs::write(path, content)
    }

    #[cfg(std_io)]
    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        use super::{cache::CacheLogLevel, pass::PassLogLevel};

        if let Ok(val) = std::env::var("CONVQ_DEBUG_LOG") {
            self.cache.logger.level = CacheLogLevel::Full;
            self.pass.logger.level = PassLogLevel::Full;

            match val.as_str() {
                "stdout" => {
                    self.cache.logger.stdout = true;
                    self.pass.logger.stdout = true;
                }
                "stderr" => {
                    self.cache.logger.stderr = true;
                    self.pass.logger.stderr = true;
                }
                "1" | "true" => {
                    let file_path = "/tmp/convq.log";
                    self.cache.logger.file = Some(file_path.into());
                    self.pass.logger.file = Some(file_path.into());
                }
                "0" | "false" => {
                    self.cache.logger.level = CacheLogLevel::Disabled;
                    self.pass.logger.level = PassLogLevel::Disabled;
                }
                file_path => {
                    self.cache.logger.file = Some(file_path.into());
                    self.pass.logger.file = Some(file_path.into());
                }
            }
        }

        if let Ok(val) = std::env::var("CONVQ_CACHE_PER_STREAM") {
            match val.as_str() {
                "0" | "false" => self.cache.per_stream = false,
                "1" | "true" => self.cache.per_stream = true,
                _ => {}
            }
        }

        if let Ok(val) = std::env::var("CONVQ_PARALLEL_THRESHOLD") {
            match val.parse() {
                Ok(threshold) => self.derivation.parallel_threshold = threshold,
                Err(_) => log::warn!("Ignoring invalid CONVQ_PARALLEL_THRESHOLD value `{val}`"),
            }
        }

        self
    }

    // Loads configuration from `convq.toml` or `Convq.toml` in the current directory or its parents.
    #[cfg(std_io)]
    fn from_current_dir() -> Self {
        let Ok(mut dir) = std::env::current_dir() else {
            return Self::default();
        };

        loop {
            for name in ["convq.toml", "Convq.toml"] {
                let path = dir.join(name);
                if path.is_file() {
                    return Self::from_file_path(&path);
                }
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    #[cfg(std_io)]
    fn from_file_path(path: &std::path::Path) -> Self {
        let parsed = std::fs::read_to_string(path)
            .map_err(|err| err.to_string())
            .and_then(|content| Self::from_toml(&content));

        match parsed {
            Ok(config) => config,
            Err(err) => {
                log::warn!(
                    "Unable to load config file '{}', using defaults ({err}).",
                    path.display()
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration from its TOML representation.
    #[cfg(feature = "std")]
    pub fn from_toml(content: &str) -> Result<Self, alloc::string::String> {
        toml::from_str(content).map_err(|err| alloc::format!("{err}"))
    }
}

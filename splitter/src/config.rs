//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `SPLITTER_CONFIG`
//! environment variable. A missing file is not an error: every field has a default.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `SPLITTER_` override YAML values
//! 3. **SUPABASE_URL / SUPABASE_SERVICE_KEY** - Special case: override `storage.url` and
//!    `storage.service_key` if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `SPLITTER_STORAGE__BUCKET=stems` sets the `storage.bucket` field.
//!
//! The storage endpoint and credential are deliberately not validated here. A deployment that
//! forgets them still starts, and fails on the first storage call.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! SPLITTER_PORT=8080
//!
//! # Object store endpoint and credential
//! SUPABASE_URL="https://project.supabase.co"
//! SUPABASE_SERVICE_KEY="service-role-key"
//!
//! # Switch to the in-process separation engine
//! SPLITTER_SEPARATION__ENGINE__TYPE=demucs
//! SPLITTER_SEPARATION__ENGINE__MODEL_PATH=models/htdemucs.onnx
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SPLITTER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,

    /// Create the storage bucket (public, audio MIME types only) on startup if it does not exist.
    #[arg(long)]
    pub setup_storage: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
    /// Source audio download settings
    pub download: DownloadConfig,
    /// Separation engine selection and limits
    pub separation: SeparationConfig,
    /// Object store the stems are published to
    pub storage: StorageConfig,
    /// Parent directory for per-request working directories (system temp dir when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
///
/// The default allows every origin, method and header.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard", serialize_with = "serialize_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn serialize_wildcard<S>(serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("*")
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

/// Source audio download configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Overall request timeout for fetching the source audio. Unbounded when unset.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// File name (without extension) the downloaded audio is stored under inside the
    /// request's working directory
    pub input_name: String,
    /// Extension used when the source URL has none
    pub default_extension: String,
}

/// Separation engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeparationConfig {
    /// Maximum number of separations running at once; further requests wait for a slot
    pub max_concurrent: usize,
    /// Upper bound on a single separation. Unbounded when unset.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Which engine performs the separation
    pub engine: EngineConfig,
}

/// The two separation engine variants.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineConfig {
    /// Shell out to the `spleeter` command line tool
    Spleeter {
        /// Executable to run (resolved through `PATH` when relative)
        #[serde(default = "default_spleeter_binary")]
        binary: PathBuf,
        /// Pretrained model preset passed as `-p spleeter:<preset>`
        #[serde(default)]
        preset: SpleeterPreset,
    },
    /// Run a pretrained waveform model in-process
    Demucs {
        /// Path to the exported ONNX model
        model_path: PathBuf,
        /// Number of independently owned model instances; each inference checks one out exclusively
        #[serde(default = "default_demucs_instances")]
        instances: usize,
        /// Sample rate the model was trained at; input audio is resampled to it
        #[serde(default = "default_demucs_sample_rate")]
        sample_rate: u32,
        /// Stem names in the order of the model's output dimension
        #[serde(default = "default_demucs_stems")]
        stems: Vec<String>,
        /// Segment length in samples fed to the model per inference. Whole track when unset.
        #[serde(default = "default_demucs_segment_samples")]
        segment_samples: Option<usize>,
        /// Fraction of each segment overlapping with its neighbour
        #[serde(default = "default_demucs_overlap")]
        overlap: f32,
    },
}

/// Spleeter pretrained model presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum SpleeterPreset {
    #[default]
    #[serde(rename = "2stems")]
    TwoStems,
    #[serde(rename = "4stems")]
    FourStems,
    #[serde(rename = "5stems")]
    FiveStems,
}

fn default_spleeter_binary() -> PathBuf {
    PathBuf::from("spleeter")
}

fn default_demucs_instances() -> usize {
    1
}

fn default_demucs_sample_rate() -> u32 {
    44_100
}

fn default_demucs_stems() -> Vec<String> {
    ["drums", "bass", "other", "vocals"].iter().map(|s| s.to_string()).collect()
}

fn default_demucs_segment_samples() -> Option<usize> {
    Some(343_980)
}

fn default_demucs_overlap() -> f32 {
    0.25
}

/// Object store backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Supabase-compatible storage REST API
    #[default]
    Supabase,
    /// Objects written below a local directory and served by this process
    Local,
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Storage backend to publish stems to
    pub backend: StorageBackend,
    /// Base URL of the storage project (e.g. `https://project.supabase.co`).
    /// Can also be set with `SUPABASE_URL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Service credential sent with every storage call.
    /// Can also be set with `SUPABASE_SERVICE_KEY`.
    #[serde(skip_serializing)]
    pub service_key: Option<String>,
    /// Bucket stems are uploaded to
    pub bucket: String,
    /// Overwrite existing objects with the same key instead of failing the upload
    pub upsert: bool,
    /// Create the bucket on startup if it is missing (same as `--setup-storage`)
    pub create_bucket: bool,
    /// Timeout for individual storage calls. Unbounded when unset.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Directory the local backend writes objects into
    pub local_root: PathBuf,
    /// Base URL public links of the local backend are formed from
    pub public_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            enable_metrics: false,
            enable_otel_export: false,
            cors: CorsConfig::default(),
            download: DownloadConfig::default(),
            separation: SeparationConfig::default(),
            storage: StorageConfig::default(),
            work_dir: None,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: Some(3600), // Cache preflight for 1 hour
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            input_name: "input".to_string(),
            default_extension: "mp3".to_string(),
        }
    }
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            timeout: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Spleeter {
            binary: default_spleeter_binary(),
            preset: SpleeterPreset::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: None,
            service_key: None,
            bucket: "processed".to_string(),
            upsert: true,
            create_bucket: false,
            timeout: None,
            local_root: PathBuf::from("./objects"),
            public_base_url: "http://localhost:8000/objects".to_string(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if args.setup_storage {
            config.storage.create_bucket = true;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("SPLITTER_").split("__"))
            // The storage project's conventional variable names
            .merge(Env::raw().only(&["SUPABASE_URL"]).map(|_| "storage.url".into()))
            .merge(Env::raw().only(&["SUPABASE_SERVICE_KEY"]).map(|_| "storage.service_key".into()))
    }

    /// Validate the configuration for internal consistency.
    ///
    /// Storage credentials are not checked: they fail lazily on first use.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.separation.max_concurrent == 0 {
            anyhow::bail!("Config validation: separation.max_concurrent must be at least 1");
        }

        if let EngineConfig::Demucs {
            instances,
            sample_rate,
            stems,
            segment_samples,
            overlap,
            ..
        } = &self.separation.engine
        {
            if *instances == 0 {
                anyhow::bail!("Config validation: separation.engine.instances must be at least 1");
            }
            if *sample_rate == 0 {
                anyhow::bail!("Config validation: separation.engine.sample_rate must be positive");
            }
            if stems.is_empty() {
                anyhow::bail!("Config validation: separation.engine.stems cannot be empty");
            }
            if *segment_samples == Some(0) {
                anyhow::bail!("Config validation: separation.engine.segment_samples must be positive");
            }
            if !(0.0..0.5).contains(overlap) {
                anyhow::bail!("Config validation: separation.engine.overlap must be in [0, 0.5), got {overlap}");
            }
        }

        if self.storage.bucket.trim().is_empty() {
            anyhow::bail!("Config validation: storage.bucket cannot be empty");
        }

        if self.storage.backend == StorageBackend::Local {
            Url::parse(&self.storage.public_base_url)
                .map_err(|e| anyhow::anyhow!("Config validation: storage.public_base_url is not a valid URL: {e}"))?;
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

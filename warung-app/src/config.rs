//! Warung configuration loader: TOML file, env overrides for secrets,
//! validation after load.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WarungConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dev: DevConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

fn default_port() -> u16 {
    8321
}

fn default_http_max_in_flight() -> usize {
    256
}

fn default_http_timeout_seconds() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            http_max_in_flight: default_http_max_in_flight(),
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Quiet period after the first fragment of a turn.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Extension granted by each subsequent fragment.
    #[serde(default = "default_extend_ms")]
    pub extend_ms: u64,
    /// Hard cap on total buffering time from first arrival.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,
    #[serde(default)]
    pub dedup_disabled: bool,
    #[serde(default = "default_conversation_ttl_seconds")]
    pub conversation_ttl_seconds: u64,
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    #[serde(default = "default_flush_tick_ms")]
    pub flush_tick_ms: u64,
    #[serde(default = "default_sweep_tick_ms")]
    pub sweep_tick_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_notify_on_failure")]
    pub notify_on_failure: bool,
    #[serde(default = "default_failure_text")]
    pub failure_text: String,
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_extend_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_fragments() -> usize {
    20
}

fn default_max_chars() -> usize {
    4000
}

fn default_dedup_ttl_seconds() -> u64 {
    300
}

fn default_conversation_ttl_seconds() -> u64 {
    1800
}

fn default_job_timeout_seconds() -> u64 {
    120
}

fn default_flush_tick_ms() -> u64 {
    500
}

fn default_sweep_tick_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_notify_on_failure() -> bool {
    true
}

fn default_failure_text() -> String {
    "Maaf, terjadi kendala saat memproses pesan Anda. Silakan coba lagi.".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            extend_ms: default_extend_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_fragments: default_max_fragments(),
            max_chars: default_max_chars(),
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            dedup_disabled: false,
            conversation_ttl_seconds: default_conversation_ttl_seconds(),
            job_timeout_seconds: default_job_timeout_seconds(),
            flush_tick_ms: default_flush_tick_ms(),
            sweep_tick_ms: default_sweep_tick_ms(),
            queue_capacity: default_queue_capacity(),
            retry_attempts: default_retry_attempts(),
            notify_on_failure: default_notify_on_failure(),
            failure_text: default_failure_text(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_jobs_db_path")]
    pub jobs_db_path: String,
}

fn default_jobs_db_path() -> String {
    "warung-jobs.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            jobs_db_path: default_jobs_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevConfig {
    /// Run the in-process echo worker instead of expecting an external AI
    /// worker to consume the queue.
    #[serde(default = "default_echo_worker")]
    pub echo_worker: bool,
    #[serde(default = "default_echo_prefix")]
    pub echo_prefix: String,
    #[serde(default = "default_echo_latency_ms")]
    pub echo_latency_ms: u64,
}

fn default_echo_worker() -> bool {
    true
}

fn default_echo_prefix() -> String {
    "echo: ".to_string()
}

fn default_echo_latency_ms() -> u64 {
    200
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            echo_worker: default_echo_worker(),
            echo_prefix: default_echo_prefix(),
            echo_latency_ms: default_echo_latency_ms(),
        }
    }
}

impl WarungConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg: WarungConfig = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
            toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
        } else {
            tracing::info!(config_path = %path.display(), "no config file; using defaults");
            WarungConfig::default_config()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            whatsapp: WhatsAppConfig::default(),
            storage: StorageConfig::default(),
            dev: DevConfig::default(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WARUNG_PORT") {
            if let Ok(port) = v.trim().parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("WHATSAPP_ACCESS_TOKEN") {
            if !v.trim().is_empty() {
                self.whatsapp.access_token = v;
                self.whatsapp.enabled = true;
            }
        }
        if let Ok(v) = std::env::var("WHATSAPP_PHONE_NUMBER_ID") {
            if !v.trim().is_empty() {
                self.whatsapp.phone_number_id = v;
            }
        }
        if let Ok(v) = std::env::var("WARUNG_JOBS_DB") {
            if !v.trim().is_empty() {
                self.storage.jobs_db_path = v;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.pipeline.debounce_ms == 0 || self.pipeline.extend_ms == 0 {
            return Err(anyhow::anyhow!(
                "pipeline.debounce_ms and pipeline.extend_ms must be > 0"
            ));
        }
        if self.pipeline.max_delay_ms < self.pipeline.debounce_ms {
            return Err(anyhow::anyhow!(
                "pipeline.max_delay_ms must be >= pipeline.debounce_ms"
            ));
        }
        if self.pipeline.max_fragments == 0 || self.pipeline.max_chars == 0 {
            return Err(anyhow::anyhow!(
                "pipeline.max_fragments and pipeline.max_chars must be > 0"
            ));
        }
        if self.pipeline.flush_tick_ms == 0 || self.pipeline.sweep_tick_ms == 0 {
            return Err(anyhow::anyhow!(
                "pipeline.flush_tick_ms and pipeline.sweep_tick_ms must be > 0"
            ));
        }
        if self.pipeline.job_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("pipeline.job_timeout_seconds must be > 0"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(anyhow::anyhow!("pipeline.queue_capacity must be > 0"));
        }
        if self.whatsapp.enabled {
            if self.whatsapp.access_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "whatsapp.access_token is required when whatsapp.enabled"
                ));
            }
            if self.whatsapp.phone_number_id.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "whatsapp.phone_number_id is required when whatsapp.enabled"
                ));
            }
        }
        Ok(())
    }

    pub fn buffer_config(&self) -> warung_core::BufferConfig {
        warung_core::BufferConfig {
            initial_delay: Duration::from_millis(self.pipeline.debounce_ms),
            extend_delay: Duration::from_millis(self.pipeline.extend_ms),
            max_delay: Duration::from_millis(self.pipeline.max_delay_ms),
            max_fragments: self.pipeline.max_fragments,
            max_chars: self.pipeline.max_chars,
        }
    }

    pub fn outbound_config(&self) -> warung_core::OutboundConfig {
        warung_core::OutboundConfig {
            notify_on_failure: self.pipeline.notify_on_failure,
            failure_text: self.pipeline.failure_text.clone(),
            send_attempts: self.pipeline.retry_attempts,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if let Ok(v) = std::env::var("WARUNG_CONFIG") {
        if !v.trim().is_empty() {
            return PathBuf::from(v);
        }
    }
    Path::new("warung.toml").to_path_buf()
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub distill: DistillConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Pages sampled when probing a PDF for a text layer.
    #[serde(default = "default_check_pages")]
    pub check_pages: usize,
    /// Average chars/page below which a PDF counts as scanned.
    #[serde(default = "default_scan_threshold")]
    pub scan_threshold: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            check_pages: default_check_pages(),
            scan_threshold: default_scan_threshold(),
        }
    }
}

fn default_check_pages() -> usize {
    2
}
fn default_scan_threshold() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// External OCR command template with `{input}`, `{first}`,
    /// `{last}` placeholders. Unset means scanned documents cannot be
    /// processed.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_ocr_batch_size")]
    pub batch_size: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            command: None,
            batch_size: default_ocr_batch_size(),
        }
    }
}

fn default_ocr_batch_size() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct DistillConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Providers tried, in order, when a chunk exceeds the primary
    /// provider's input tolerance.
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    #[serde(default = "default_pairs_per_chunk")]
    pub pairs_per_chunk: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Abort the document when this fraction of its chunks has
    /// permanently failed. Policy, not law.
    #[serde(default = "default_abort_fraction")]
    pub abort_fraction: f64,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            fallback_providers: Vec::new(),
            pairs_per_chunk: default_pairs_per_chunk(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            abort_fraction: default_abort_fraction(),
        }
    }
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_pairs_per_chunk() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_abort_fraction() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// JSON credential file; when unset, credentials come from
    /// environment variables.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Providers scanned when loading from the environment.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            file: None,
            providers: default_providers(),
            failure_threshold: default_failure_threshold(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

fn default_providers() -> Vec<String> {
    vec![
        "gemini".to_string(),
        "deepseek".to_string(),
        "openai".to_string(),
        "zhipu".to_string(),
    ]
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_minutes() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// Dataset line schema: `qa` ({question, answer}) or `alpaca`
    /// ({instruction, input, output}).
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            schema: default_schema(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/output")
}
fn default_schema() -> String {
    "qa".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointsConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

impl Default for CheckpointsConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".checkpoints")
}

impl Config {
    /// All-defaults configuration, used when no config file exists.
    pub fn minimal() -> Self {
        Config::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }
    if config.router.check_pages == 0 {
        anyhow::bail!("router.check_pages must be > 0");
    }
    if config.ocr.batch_size == 0 {
        anyhow::bail!("ocr.batch_size must be > 0");
    }
    if config.distill.provider.is_empty() {
        anyhow::bail!("distill.provider must be set");
    }
    if config.distill.pairs_per_chunk == 0 {
        anyhow::bail!("distill.pairs_per_chunk must be > 0");
    }
    if config.distill.max_retries == 0 {
        anyhow::bail!("distill.max_retries must be > 0");
    }
    if !(0.0..=1.0).contains(&config.distill.abort_fraction) {
        anyhow::bail!("distill.abort_fraction must be in [0.0, 1.0]");
    }
    if config.credentials.cooldown_minutes < 0 {
        anyhow::bail!("credentials.cooldown_minutes must be >= 0");
    }
    match config.output.schema.as_str() {
        "qa" | "alpaca" => {}
        other => anyhow::bail!("Unknown output.schema: '{}'. Must be qa or alpaca.", other),
    }
    Ok(())
}

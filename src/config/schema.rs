use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Switchboard configuration, loaded from `config.toml`.
///
/// Resolution order: `SWITCHBOARD_WORKSPACE` env → `~/.switchboard/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed at load time, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Event reconciliation engine tuning (`[engine]`).
    #[serde(default)]
    pub engine: EngineConfig,

    /// Bot/human handover behavior (`[handover]`).
    #[serde(default)]
    pub handover: HandoverConfig,

    /// Channel configurations (`[channels_config]`).
    #[serde(default)]
    pub channels_config: ChannelsConfig,

    /// Webhook ingest server: host, port, limits (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Durable storage (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Response generation endpoint (`[generator]`).
    #[serde(default)]
    pub generator: GeneratorConfig,
}

// ── Engine ────────────────────────────────────────────────────────

/// Tuning for the inbound event reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period after the last message in a burst before the burst is
    /// processed as one turn. Clamped to a minimum of 1.
    pub debounce_secs: u64,
    /// Per-channel debounce overrides, keyed by channel id.
    pub debounce_overrides: std::collections::HashMap<String, u64>,
    /// Events older than this relative to the channel's processing baseline
    /// (and to wall clock) are backlog and never answered.
    pub backlog_tolerance_secs: u64,
    /// Window for normalized-text echo matching.
    pub echo_text_window_secs: u64,
    /// Window for exact message-id echo matching.
    pub echo_id_window_secs: u64,
    /// Window for duplicate message-id suppression.
    pub duplicate_window_secs: u64,
    /// How often the maintenance task prunes expired in-memory entries.
    pub sweep_interval_secs: u64,
    /// How long a cached lock decision stays fresh before the durable
    /// record is consulted again.
    pub lock_cache_ttl_secs: u64,
    /// Artificial delay before probing the durable message log for an
    /// in-flight own-reply during self-origin classification.
    pub log_probe_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 2,
            debounce_overrides: std::collections::HashMap::new(),
            backlog_tolerance_secs: 120,
            echo_text_window_secs: 20,
            echo_id_window_secs: 600,
            duplicate_window_secs: 600,
            sweep_interval_secs: 180,
            lock_cache_ttl_secs: 30,
            log_probe_delay_ms: 400,
        }
    }
}

impl EngineConfig {
    /// Debounce wait with the 1-second floor applied.
    pub fn debounce_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.debounce_secs.max(1))
    }

    /// Per-channel debounce wait, falling back to the global setting.
    /// The 1-second floor applies to overrides too.
    pub fn debounce_wait_for(&self, channel_id: &str) -> std::time::Duration {
        let secs = self
            .debounce_overrides
            .get(channel_id)
            .copied()
            .unwrap_or(self.debounce_secs);
        std::time::Duration::from_secs(secs.max(1))
    }
}

// ── Handover ──────────────────────────────────────────────────────

/// Controls when automated replies yield to a human operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    /// Emoji that hand the conversation to a human when sent by an operator
    /// (or emitted by the agent itself).
    pub lock_emoji: Vec<String>,
    /// Emoji that return the conversation to the bot.
    pub unlock_emoji: Vec<String>,
    /// Labels that imply an immediate long-TTL lock when applied.
    pub blocking_labels: Vec<String>,
    /// Lock TTL after an operator reply that carries no control emoji.
    pub admin_reply_ttl_secs: u64,
    /// Lock TTL after an explicit lock emoji.
    pub emoji_ttl_secs: u64,
    /// Lock TTL after a blocking label is applied.
    pub label_ttl_secs: u64,
    /// How many recent stored messages the self-healing scan inspects.
    pub history_scan_depth: u32,
    /// Whether an order-capture directive in a generated reply also locks
    /// the conversation for human follow-up.
    pub lock_on_order: bool,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            lock_emoji: vec!["🔒".into()],
            unlock_emoji: vec!["🔓".into()],
            blocking_labels: vec!["human".into(), "support".into()],
            admin_reply_ttl_secs: 5 * 60,
            emoji_ttl_secs: 24 * 60 * 60,
            label_ttl_secs: 24 * 60 * 60,
            history_scan_depth: 50,
            lock_on_order: true,
        }
    }
}

impl HandoverConfig {
    pub fn contains_lock_emoji(&self, text: &str) -> bool {
        self.lock_emoji.iter().any(|e| text.contains(e.as_str()))
    }

    pub fn contains_unlock_emoji(&self, text: &str) -> bool {
        self.unlock_emoji.iter().any(|e| text.contains(e.as_str()))
    }

    pub fn is_blocking_label(&self, label: &str) -> bool {
        let needle = label.trim().to_lowercase();
        self.blocking_labels
            .iter()
            .any(|l| l.trim().to_lowercase() == needle)
    }
}

// ── Channels ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub whatsapp: Option<WhatsAppConfig>,
}

/// WhatsApp messaging gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Bearer token for the send API.
    pub access_token: String,
    /// Sender endpoint id (phone number id).
    pub phone_number_id: String,
    /// Token echoed back during webhook subscription verification.
    pub verify_token: String,
    /// Shared secret for webhook HMAC signatures. Empty disables checking.
    pub webhook_secret: String,
    /// Send API base URL. Override to point at a self-hosted gateway.
    pub api_url: String,
    /// Numbers allowed to interact (E.164). "*" allows everyone.
    pub allowed_numbers: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            verify_token: String::new(),
            webhook_secret: String::new(),
            api_url: "https://graph.facebook.com/v18.0".into(),
            allowed_numbers: vec!["*".into()],
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Sqlite database path. Relative paths resolve under the workspace.
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_path(&self, workspace_dir: &Path) -> PathBuf {
        match &self.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => workspace_dir.join(p),
            None => workspace_dir.join("switchboard.db"),
        }
    }
}

// ── Generator ─────────────────────────────────────────────────────

/// OpenAI-compatible chat completions endpoint used to produce replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// System prompt prepended to every turn.
    pub system_prompt: String,
    pub temperature: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            system_prompt: "You are a helpful customer assistant.".into(),
            temperature: 0.7,
        }
    }
}

// ── Load / save ───────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home = UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let base = home.join(".switchboard");
        Self {
            workspace_dir: base.clone(),
            config_path: base.join("config.toml"),
            engine: EngineConfig::default(),
            handover: HandoverConfig::default(),
            channels_config: ChannelsConfig::default(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml`, creating a default one on first run.
    ///
    /// `SWITCHBOARD_WORKSPACE` overrides the default `~/.switchboard`.
    pub fn load_or_init() -> Result<Self> {
        let workspace_dir = match std::env::var("SWITCHBOARD_WORKSPACE") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => UserDirs::new()
                .map(|u| u.home_dir().join(".switchboard"))
                .unwrap_or_else(|| PathBuf::from(".switchboard")),
        };
        Self::load_from(&workspace_dir)
    }

    pub fn load_from(workspace_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace directory: {}",
                workspace_dir.display()
            )
        })?;
        let config_path = workspace_dir.join("config.toml");

        let mut config: Config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Invalid config at {}", config_path.display()))?
        } else {
            let config = Config::default();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to serialize default config")?;
            std::fs::write(&config_path, rendered)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            config
        };

        config.workspace_dir = workspace_dir.to_path_buf();
        config.config_path = config_path;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let rendered = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.config_path, rendered)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.debounce_secs, 2);
        assert_eq!(cfg.engine.backlog_tolerance_secs, 120);
        assert_eq!(cfg.handover.lock_emoji, vec!["🔒".to_string()]);
        assert_eq!(cfg.handover.admin_reply_ttl_secs, 300);
        assert_eq!(cfg.gateway.port, 8787);
    }

    #[test]
    fn debounce_wait_floor() {
        let mut engine = EngineConfig::default();
        engine.debounce_secs = 0;
        assert_eq!(engine.debounce_wait(), std::time::Duration::from_secs(1));
        engine.debounce_secs = 5;
        assert_eq!(engine.debounce_wait(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn per_channel_debounce_override() {
        let mut engine = EngineConfig::default();
        engine.debounce_overrides.insert("slow-ch".into(), 6);
        engine.debounce_overrides.insert("zero-ch".into(), 0);
        assert_eq!(
            engine.debounce_wait_for("slow-ch"),
            std::time::Duration::from_secs(6)
        );
        assert_eq!(
            engine.debounce_wait_for("zero-ch"),
            std::time::Duration::from_secs(1)
        );
        assert_eq!(
            engine.debounce_wait_for("other"),
            std::time::Duration::from_secs(2)
        );
    }

    #[test]
    fn empty_toml_gets_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.engine.duplicate_window_secs, 600);
        assert_eq!(cfg.handover.history_scan_depth, 50);
        assert!(cfg.channels_config.whatsapp.is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[engine]\ndebounce_secs = 4\n").unwrap();
        assert_eq!(cfg.engine.debounce_secs, 4);
        assert_eq!(cfg.engine.echo_text_window_secs, 20);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.engine.sweep_interval_secs, cfg.engine.sweep_interval_secs);
        assert_eq!(parsed.handover.blocking_labels, cfg.handover.blocking_labels);
    }

    #[test]
    fn load_from_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(dir.path()).unwrap();
        assert!(cfg.config_path.exists());
        // Second load reads the file back.
        let again = Config::load_from(dir.path()).unwrap();
        assert_eq!(again.engine.debounce_secs, cfg.engine.debounce_secs);
    }

    #[test]
    fn blocking_label_matching_is_case_insensitive() {
        let handover = HandoverConfig::default();
        assert!(handover.is_blocking_label("Human"));
        assert!(handover.is_blocking_label(" SUPPORT "));
        assert!(!handover.is_blocking_label("vip"));
    }

    #[test]
    fn emoji_containment() {
        let handover = HandoverConfig::default();
        assert!(handover.contains_lock_emoji("taking over 🔒"));
        assert!(handover.contains_unlock_emoji("all yours 🔓"));
        assert!(!handover.contains_lock_emoji("plain text"));
    }

    #[test]
    fn storage_path_resolution() {
        let storage = StorageConfig::default();
        let ws = Path::new("/tmp/ws");
        assert_eq!(storage.resolve_path(ws), PathBuf::from("/tmp/ws/switchboard.db"));

        let rel = StorageConfig {
            path: Some(PathBuf::from("data/sb.db")),
        };
        assert_eq!(rel.resolve_path(ws), PathBuf::from("/tmp/ws/data/sb.db"));

        let abs = StorageConfig {
            path: Some(PathBuf::from("/var/sb.db")),
        };
        assert_eq!(abs.resolve_path(ws), PathBuf::from("/var/sb.db"));
    }
}

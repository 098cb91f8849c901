use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// Main widget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetConfig {
    /// Tenant (chatbot) identifier, sent with every request
    pub tenant_id: String,

    /// Base URL of the chat API
    pub api_base_url: String,

    /// Websocket endpoint for the human-handoff channel
    pub socket_url: String,

    /// Assistant greeting shown before any user turn, if any
    pub initial_greeting: Option<String>,

    /// Page URL reported as the conversation origin
    pub origin_url: Option<String>,

    /// Delay before the single reconnect attempt after an unclean close
    pub reconnect_delay_ms: u64,

    /// Minimum gap between host notification bubbles
    pub notify_cooldown_ms: u64,

    /// Cap on notification bubbles rendered per dispatch
    pub notify_max_bubbles: usize,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        WidgetConfig {
            tenant_id: String::new(),
            api_base_url: "https://api.example.com/v1".to_string(),
            socket_url: "wss://ws.example.com/conversations".to_string(),
            initial_greeting: None,
            origin_url: None,
            reconnect_delay_ms: 1_000,
            notify_cooldown_ms: 3_000,
            notify_max_bubbles: 3,
        }
    }
}

impl WidgetConfig {
    /// Load configuration from `~/.embedchat/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        let config_home = home.join(".embedchat");
        let config_path = config_home.join("config.toml");

        fs::create_dir_all(&config_home).context("Failed to create .embedchat directory")?;

        if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(WidgetConfig::default())
        }
    }

    /// Save configuration to `~/.embedchat/config.toml`.
    pub fn save(&self) -> Result<()> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        let config_path = home.join(".embedchat").join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// The configuration is usable once a tenant is set.
    pub fn is_configured(&self) -> bool {
        !self.tenant_id.trim().is_empty()
    }
}

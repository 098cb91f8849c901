use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// The persisted identity record for one tenant.
///
/// `conversation_id` is keyed under the visitor that owns it: changing the
/// visitor id invalidates the stored conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub visitor_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Client-side cache for `ConversationIdentity`, one JSON file per tenant.
///
/// This is the only conversation persistence the core keeps: a returning
/// visitor resumes the same conversation, nothing more. Cleared explicitly on
/// "start new conversation" or on a backend invalid-conversation error.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
    tenant_id: String,
}

impl IdentityStore {
    pub fn new(tenant_id: &str) -> Result<Self> {
        let home = dirs::home_dir().context("could not find home directory")?;
        Ok(Self::with_dir(home.join(".embedchat"), tenant_id))
    }

    /// Use an explicit directory (tests, embedded hosts with their own paths).
    pub fn with_dir(dir: PathBuf, tenant_id: &str) -> Self {
        Self {
            dir,
            tenant_id: tenant_id.to_string(),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("identity-{}.json", self.tenant_id))
    }

    /// Read the stored identity; missing or unreadable files are an empty identity.
    pub fn load(&self) -> StoredIdentity {
        let Ok(content) = fs::read_to_string(self.path()) else {
            return StoredIdentity::default();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn save(&self, identity: &StoredIdentity) -> Result<()> {
        fs::create_dir_all(&self.dir).context("failed to create identity directory")?;
        let content =
            serde_json::to_string_pretty(identity).context("failed to serialize identity")?;
        fs::write(self.path(), content).context("failed to write identity file")?;
        Ok(())
    }

    pub fn visitor_id(&self) -> Option<String> {
        self.load().visitor_id.filter(|v| !v.trim().is_empty())
    }

    /// Persist the backend-issued visitor id. A new visitor id drops any
    /// conversation stored under the old one.
    pub fn set_visitor_id(&self, visitor_id: &str) -> Result<()> {
        let trimmed = visitor_id.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let mut identity = self.load();
        if identity.visitor_id.as_deref() == Some(trimmed) {
            return Ok(());
        }
        identity.visitor_id = Some(trimmed.to_string());
        identity.conversation_id = None;
        self.save(&identity)
    }

    pub fn conversation_id(&self) -> Option<String> {
        let identity = self.load();
        // No visitor means no valid conversation key.
        identity.visitor_id.as_deref()?;
        identity.conversation_id.filter(|v| !v.trim().is_empty())
    }

    pub fn set_conversation_id(&self, conversation_id: &str) -> Result<()> {
        let trimmed = conversation_id.trim();
        if trimmed.is_empty() {
            return self.clear_conversation();
        }
        let mut identity = self.load();
        identity.conversation_id = Some(trimmed.to_string());
        self.save(&identity)
    }

    /// Forget the conversation but keep the visitor ("start new conversation").
    pub fn clear_conversation(&self) -> Result<()> {
        let mut identity = self.load();
        if identity.conversation_id.is_none() {
            return Ok(());
        }
        identity.conversation_id = None;
        self.save(&identity)
    }
}

//! Configuration management for the Genspark proxy server.
//!
//! All settings come from environment variables (optionally seeded from a
//! `.env` file). Parsing is done through a lookup function so the same code
//! path can be exercised in tests without touching the process environment.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::transformer::CHAT_MODELS;

/// Prefix every upstream credential must carry in its cookie form.
pub const SESSION_COOKIE_PREFIX: &str = "session_id=";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port, route prefix)
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream session credentials, normalized to cookie form
    pub credentials: Vec<String>,

    /// Inbound bearer secrets; empty disables authentication
    #[serde(default)]
    pub api_secrets: Vec<String>,

    /// Pre-provisioned image conversations (credential -> conversation id)
    #[serde(default)]
    pub image_session_map: Vec<(String, String)>,

    /// Fixed conversation per logical model
    #[serde(default)]
    pub model_chat_map: HashMap<String, String>,

    /// What happens to a finished upstream conversation
    #[serde(default)]
    pub conversation_policy: ConversationPolicy,

    /// Cooldown applied to a credential after a rate-limit sentinel
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,

    /// Cooldown applied to a credential after the free-tier quota sentinel
    #[serde(default = "default_free_limit_cooldown")]
    pub free_limit_cooldown_secs: u64,

    /// Inbound request rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Overall timeout for non-streaming and image calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout until a streaming call commits its first output
    #[serde(default = "default_request_timeout")]
    pub stream_timeout_secs: u64,

    /// Optional outbound proxy for upstream traffic
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Upstream origin
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,

    /// Log raw upstream lines at debug level
    #[serde(default)]
    pub debug: bool,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path prefix for the public routes
    #[serde(default)]
    pub route_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            route_prefix: String::new(),
        }
    }
}

/// Inbound rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per minute for a single client key
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
        }
    }
}

/// Post-success handling of upstream conversations.
///
/// The two flags are meant to be mutually exclusive, but they are kept as
/// independent switches: deletion only happens when recording is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPolicy {
    /// Remember (credential, model) -> conversation id for reuse
    pub auto_record: bool,
    /// Delete temporary conversations after a successful call
    pub auto_delete: bool,
}

impl Default for ConversationPolicy {
    fn default() -> Self {
        Self {
            auto_record: true,
            auto_delete: false,
        }
    }
}

impl ConversationPolicy {
    /// Whether a finished conversation should be recorded for reuse.
    pub fn should_record(&self) -> bool {
        self.auto_record
    }

    /// Whether a finished conversation should be deleted.
    pub fn should_delete(&self) -> bool {
        self.auto_delete && !self.auto_record
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7055
}

fn default_rate_limit_cooldown() -> u64 {
    600
}

fn default_free_limit_cooldown() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    300
}

fn default_upstream_base_url() -> String {
    "https://www.genspark.ai".to_string()
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self> {
        #[cfg(not(test))]
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let credentials = parse_credentials(&get("GS_COOKIE").unwrap_or_default());

        let api_secrets = get("API_SECRET")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        let image_session_map = match get("SESSION_IMAGE_CHAT_MAP") {
            Some(raw) => parse_image_session_map(&raw)
                .context("Invalid SESSION_IMAGE_CHAT_MAP")?,
            None => Vec::new(),
        };

        let model_chat_map = match get("MODEL_CHAT_MAP") {
            Some(raw) => parse_model_chat_map(&raw).context("Invalid MODEL_CHAT_MAP")?,
            None => HashMap::new(),
        };

        let conversation_policy = ConversationPolicy {
            auto_record: parse_u64(&get, "AUTO_MODEL_CHAT_MAP_TYPE", 1)? == 1,
            auto_delete: parse_u64(&get, "AUTO_DEL_CHAT", 0)? == 1,
        };

        let mut server = ServerConfig::default();
        if let Some(host) = get("HOST") {
            server.host = host;
        }
        if let Some(port) = get("PORT") {
            server.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", port))?;
        }
        if let Some(prefix) = get("ROUTE_PREFIX") {
            server.route_prefix = normalize_route_prefix(&prefix);
        }

        let config = AppConfig {
            server,
            credentials,
            api_secrets,
            image_session_map,
            model_chat_map,
            conversation_policy,
            rate_limit_cooldown_secs: parse_u64(
                &get,
                "RATE_LIMIT_COOKIE_LOCK_DURATION",
                default_rate_limit_cooldown(),
            )?,
            free_limit_cooldown_secs: parse_u64(
                &get,
                "FREE_LIMIT_COOKIE_LOCK_DURATION",
                default_free_limit_cooldown(),
            )?,
            rate_limit: RateLimitConfig {
                requests_per_minute: parse_u64(&get, "REQUEST_RATE_LIMIT", 60)? as u32,
            },
            request_timeout_secs: parse_u64(&get, "REQUEST_OUT_TIME", default_request_timeout())?,
            stream_timeout_secs: parse_u64(
                &get,
                "STREAM_REQUEST_OUT_TIME",
                default_request_timeout(),
            )?,
            proxy_url: get("PROXY_URL"),
            upstream_base_url: get("UPSTREAM_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(default_upstream_base_url),
            debug: get("DEBUG").map(|v| str_to_bool(&v)).unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            bail!("GS_COOKIE is not set or contains no credentials");
        }

        if !self.model_chat_map.is_empty() && self.conversation_policy.auto_record {
            bail!("AUTO_MODEL_CHAT_MAP_TYPE must not be 1 when MODEL_CHAT_MAP is set");
        }

        Ok(())
    }
}

fn parse_u64<F>(get: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, raw)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalize a raw credential to its cookie form.
pub fn normalize_credential(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains(SESSION_COOKIE_PREFIX) {
        trimmed.to_string()
    } else {
        format!("{}{}", SESSION_COOKIE_PREFIX, trimmed)
    }
}

/// Parse the comma separated credential list, skipping blanks and duplicates.
pub fn parse_credentials(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    split_list(raw)
        .iter()
        .map(|c| normalize_credential(c))
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Parse `credential=conversationId` pairs.
///
/// Credentials may themselves contain `=` (`session_id=...`), so each pair is
/// split on its last `=`.
pub fn parse_image_session_map(raw: &str) -> Result<Vec<(String, String)>> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for pair in split_list(raw) {
        let (credential, conversation_id) = pair
            .rsplit_once('=')
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .with_context(|| format!("expected credential=conversationId, got {:?}", pair))?;
        let credential = normalize_credential(credential);
        let conversation_id = conversation_id.trim().to_string();
        match entries.iter_mut().find(|(c, _)| *c == credential) {
            Some(entry) => entry.1 = conversation_id,
            None => entries.push((credential, conversation_id)),
        }
    }
    Ok(entries)
}

/// Parse `model=conversationId` pairs, rejecting unknown models.
pub fn parse_model_chat_map(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in split_list(raw) {
        let (model, conversation_id) = pair
            .split_once('=')
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .with_context(|| format!("expected model=conversationId, got {:?}", pair))?;
        let model = model.trim();
        if !CHAT_MODELS.contains(&model) {
            bail!("unsupported model in MODEL_CHAT_MAP: {}", model);
        }
        map.insert(model.to_string(), conversation_id.trim().to_string());
    }
    Ok(map)
}

fn normalize_route_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

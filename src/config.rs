//! Process-boundary configuration.
//!
//! Environment variables are read exactly once, through Figment, and turned
//! into plain resolved structs that components receive at construction. No
//! component reads the environment on its own.

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Fixed public OAuth client id for the Qwen device flow (no client secret).
pub const OAUTH_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

/// Scope requested during device authorization.
pub const OAUTH_SCOPE: &str = "openid profile email model.completion";

const DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";

/// API origin used when a credential carries no `resource_url` routing hint.
pub const DEFAULT_API_BASE: &str = "https://portal.qwen.ai/v1";

const CREDENTIAL_FILE: &str = "oauth_creds.json";
const LEGACY_CREDENTIAL_FILE: &str = "qwen_oauth_creds.json";
const ACCOUNTS_FILE: &str = "accounts.json";

/// Raw configuration managed by Figment (defaults merged with `CASTOR_*`
/// environment variables).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CastorConfig {
    /// Credential directory override. Env: `CASTOR_CREDENTIAL_DIR`.
    /// Default: `~/.qwen`.
    #[serde(default)]
    pub credential_dir: Option<PathBuf>,

    /// Accounts file name override, relative to the credential directory.
    /// Env: `CASTOR_ACCOUNTS_FILE`. Names escaping the credential directory
    /// are rejected and the default is used instead.
    #[serde(default)]
    pub accounts_file: Option<String>,

    /// Cooldown applied to an account after quota exhaustion, in seconds.
    /// Env: `CASTOR_QUOTA_COOLDOWN_SECS`. Default: 1800 (30 minutes).
    #[serde(default = "default_quota_cooldown_secs")]
    pub quota_cooldown_secs: u64,

    /// Enable the external CLI fallback path. Env: `CASTOR_CLI_FALLBACK_ENABLED`.
    #[serde(default)]
    pub cli_fallback_enabled: bool,

    /// Path to the external CLI binary. Env: `CASTOR_CLI_PATH`. Default: `qwen`
    /// resolved via `PATH`.
    #[serde(default)]
    pub cli_path: Option<PathBuf>,
}

impl Default for CastorConfig {
    fn default() -> Self {
        CastorConfig {
            credential_dir: None,
            accounts_file: None,
            quota_cooldown_secs: default_quota_cooldown_secs(),
            cli_fallback_enabled: false,
            cli_path: None,
        }
    }
}

fn default_quota_cooldown_secs() -> u64 {
    30 * 60
}

impl CastorConfig {
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(CastorConfig::default()))
            .merge(Env::prefixed("CASTOR_"))
    }

    /// Loads configuration from the environment, falling back to defaults on
    /// extraction failure (a malformed variable should not brick the host).
    pub fn from_env() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            warn!(error = %err, "failed to extract configuration from environment; using defaults");
            CastorConfig::default()
        })
    }

    pub fn credential_dir(&self) -> PathBuf {
        self.credential_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".qwen")
        })
    }

    pub fn auth(&self) -> AuthConfig {
        AuthConfig::with_dir(self.credential_dir())
    }

    pub fn registry(&self) -> RegistryConfig {
        let dir = self.credential_dir();
        RegistryConfig {
            accounts_path: resolve_accounts_path(&dir, self.accounts_file.as_deref()),
            credential_dir: dir,
            quota_cooldown: Duration::from_secs(self.quota_cooldown_secs),
        }
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            request_timeout: Duration::from_secs(600),
            max_retries: 2,
            fallback: FallbackConfig {
                enabled: self.cli_fallback_enabled,
                cli_path: self.cli_path.clone().unwrap_or_else(|| PathBuf::from("qwen")),
                timeout: Duration::from_secs(300),
                max_output_bytes: 256 * 1024,
            },
        }
    }
}

/// Resolved OAuth/token-store configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub credential_dir: PathBuf,
    pub device_code_url: Url,
    pub token_url: Url,
    pub client_id: String,
    pub scope: String,
    /// Timeout for a single OAuth HTTP call. Shorter than the request-level
    /// timeout; the two wrap different things and never overlap in meaning.
    pub http_timeout: Duration,
    /// Refresh-ahead buffer: a token is treated as expired this long before
    /// its hard expiry so it cannot lapse mid-request.
    pub expiry_buffer_ms: i64,
}

impl AuthConfig {
    pub fn with_dir(credential_dir: PathBuf) -> Self {
        AuthConfig {
            credential_dir,
            device_code_url: Url::parse(DEVICE_CODE_URL).expect("valid built-in device code URL"),
            token_url: Url::parse(TOKEN_URL).expect("valid built-in token URL"),
            client_id: OAUTH_CLIENT_ID.to_string(),
            scope: OAUTH_SCOPE.to_string(),
            http_timeout: Duration::from_secs(30),
            expiry_buffer_ms: 30_000,
        }
    }

    pub fn credential_path(&self) -> PathBuf {
        self.credential_dir.join(CREDENTIAL_FILE)
    }

    pub fn legacy_credential_path(&self) -> PathBuf {
        self.credential_dir.join(LEGACY_CREDENTIAL_FILE)
    }
}

/// Resolved multi-account registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub credential_dir: PathBuf,
    pub accounts_path: PathBuf,
    pub quota_cooldown: Duration,
}

/// Resolved dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub request_timeout: Duration,
    /// Plain-retry ceiling for generic retryable statuses.
    pub max_retries: u32,
    pub fallback: FallbackConfig,
}

/// Resolved CLI-fallback configuration.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub cli_path: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Resolve the accounts file path, constraining an override to stay inside the
/// credential directory. Empty names, absolute paths, and `..` traversal are
/// all rejected in favor of the default.
fn resolve_accounts_path(credential_dir: &Path, override_name: Option<&str>) -> PathBuf {
    let fallback = || credential_dir.join(ACCOUNTS_FILE);

    let Some(name) = override_name else {
        return fallback();
    };

    let trimmed = name.trim();
    if trimmed.is_empty() {
        warn!("empty accounts file override; using default");
        return fallback();
    }

    let candidate = Path::new(trimmed);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        warn!(name = %trimmed, "accounts file override escapes the credential directory; using default");
        return fallback();
    }

    credential_dir.join(candidate)
}

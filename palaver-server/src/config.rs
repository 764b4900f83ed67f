//! Server configuration.

use clap::Parser;

/// Default lifetime of issued login tokens (one hour).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Secret used when `JWT_SECRET` is not provided. Only acceptable for local
/// development; [`ServerConfig::uses_default_secret`] lets startup warn.
const DEV_JWT_SECRET: &str = "palaver-dev-secret";

const DEFAULT_FRONTEND_URL: &str = "http://localhost:5173";
const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "palaver-server", about = "Direct-messaging server with live presence")]
pub struct ServerConfig {
    /// Raw TCP listener (newline-delimited JSON frames).
    #[arg(long, env = "PALAVER_LISTEN", default_value = "127.0.0.1:5001")]
    pub listen_addr: String,

    /// HTTP + WebSocket listener. Pass an empty string to disable.
    #[arg(long, env = "PALAVER_WEB_ADDR", default_value = "0.0.0.0:5000")]
    pub web_addr: Option<String>,

    /// SQLite database path. Use `:memory:` for a throwaway database.
    #[arg(long, env = "PALAVER_DB", default_value = "palaver.db")]
    pub db_path: String,

    /// Origin allowed by CORS on the HTTP API.
    #[arg(long, env = "FRONTEND_URL", default_value = DEFAULT_FRONTEND_URL)]
    pub frontend_url: String,

    /// HMAC secret for login tokens.
    #[arg(long, env = "JWT_SECRET", default_value = DEV_JWT_SECRET, hide_env_values = true)]
    pub jwt_secret: String,

    /// Lifetime of login tokens in seconds.
    #[arg(long, env = "PALAVER_TOKEN_TTL_SECS", default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    pub token_ttl_secs: u64,

    /// bcrypt work factor for stored passwords.
    #[arg(long, env = "PALAVER_BCRYPT_COST", default_value_t = bcrypt::DEFAULT_COST)]
    pub bcrypt_cost: u32,

    /// Only let a connection send and log out as the username it identified as.
    #[arg(long, env = "PALAVER_ENFORCE_IDENTITY", default_value_t = false)]
    pub enforce_identity: bool,

    /// Outbound frames queued per connection before further frames are dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,
}

impl ServerConfig {
    /// Configuration for tests: ephemeral port, in-memory database, no web
    /// listener, cheapest password hashing. Built without reading the
    /// environment.
    pub fn for_test() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            web_addr: None,
            db_path: ":memory:".to_string(),
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            bcrypt_cost: 4,
            enforce_identity: false,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }

    /// The web listener address, treating an empty value as disabled.
    pub fn web_addr(&self) -> Option<&str> {
        self.web_addr.as_deref().filter(|a| !a.is_empty())
    }

    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

//! Server state and listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::TokenIssuer;
use crate::config::ServerConfig;
use crate::connection;
use crate::db::Db;
use crate::registry::ConnectionRegistry;

/// Shared state accessible by all connection handlers and HTTP routes.
pub struct SharedState {
    pub config: ServerConfig,
    /// Live connections and their bound usernames.
    pub registry: ConnectionRegistry,
    /// Held for the whole of a presence transition: registry mutation,
    /// directory write, snapshot read and broadcast. Routing never takes it.
    pub(crate) presence_gate: Mutex<()>,
    pub db: Mutex<Db>,
    pub tokens: TokenIssuer,
    pub started_at: Instant,
}

impl SharedState {
    pub fn new(config: ServerConfig, db: Db) -> Arc<Self> {
        let tokens = TokenIssuer::new(config.jwt_secret.as_bytes(), config.token_ttl_secs);
        Arc::new(Self {
            config,
            registry: ConnectionRegistry::new(),
            presence_gate: Mutex::new(()),
            db: Mutex::new(db),
            tokens,
            started_at: Instant::now(),
        })
    }

    /// Run a closure with the database.
    /// Logs errors but does not propagate them. Persistence failures
    /// must not break connection handling.
    pub fn with_db<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        match f(&db) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!("Database error: {e}");
                None
            }
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    fn build_state(&self) -> Result<Arc<SharedState>> {
        tracing::info!("Opening database: {}", self.config.db_path);
        let db = Db::open(&self.config.db_path)
            .with_context(|| format!("Failed to open database {}", self.config.db_path))?;
        if self.config.uses_default_secret() {
            tracing::warn!("JWT_SECRET not set, using the development secret");
        }
        Ok(SharedState::new(self.config.clone(), db))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("TCP listener on {}", self.config.listen_addr);

        if let Some(addr) = self.config.web_addr() {
            let router = crate::web::router(Arc::clone(&state));
            let web_listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            tracing::info!("HTTP/WebSocket listener on {addr}");
            tokio::spawn(async move {
                if let Err(e) = axum::serve(web_listener, router).await {
                    tracing::error!("HTTP server error: {e}");
                }
            });
        }

        accept_loop(listener, state).await
    }

    /// Start the TCP listener and return the bound address, the shared
    /// state, and the accept task (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let handle = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Ok((addr, state, handle))
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}

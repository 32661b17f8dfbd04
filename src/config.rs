use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Deserialize;

use crate::app::Application;
use crate::server::access_log::{AccessLog, NoAccessLog, TracingAccessLog};
use crate::server::spawn::{Spawner, TaskPerRequest, WorkerPool};

/// Settings read at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Hides server fault messages from clients.
    pub production: bool,
    /// Size of the worker pool; absent means one task per request.
    pub workers: Option<usize>,
    pub access_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            production: false,
            workers: None,
            access_log: true,
        }
    }
}

impl Config {
    /// Loads `ORDERLY_CONFIG` if set, then applies `LISTEN` and `ORDERLY_ENV`.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("ORDERLY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.listen_addr = listen_addr;
        }
        if let Ok(env) = std::env::var("ORDERLY_ENV") {
            cfg.production = env.eq_ignore_ascii_case("production");
        }

        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(text).context("invalid config")?;
        if cfg.workers == Some(0) {
            anyhow::bail!("workers must be at least 1");
        }
        Ok(cfg)
    }
}

/// Runtime configuration shared by every request controller.
///
/// Built once at startup; never mutated afterwards.
pub struct ServerConfig {
    pub app: Arc<dyn Application>,
    pub spawner: Arc<dyn Spawner>,
    pub access_log: Arc<dyn AccessLog>,
    pub production: bool,
}

impl ServerConfig {
    /// Task per request, tracing access log, non-production.
    pub fn new(app: impl Application) -> Self {
        Self {
            app: Arc::new(app),
            spawner: Arc::new(TaskPerRequest),
            access_log: Arc::new(TracingAccessLog),
            production: false,
        }
    }

    /// Must be called from within a tokio runtime when `workers` is set.
    pub fn from_config(cfg: &Config, app: impl Application) -> Self {
        let spawner: Arc<dyn Spawner> = match cfg.workers {
            Some(workers) => Arc::new(WorkerPool::new(workers)),
            None => Arc::new(TaskPerRequest),
        };
        let access_log: Arc<dyn AccessLog> = if cfg.access_log {
            Arc::new(TracingAccessLog)
        } else {
            Arc::new(NoAccessLog)
        };

        Self {
            app: Arc::new(app),
            spawner,
            access_log,
            production: cfg.production,
        }
    }

    pub fn spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    pub fn access_log(mut self, access_log: impl AccessLog + 'static) -> Self {
        self.access_log = Arc::new(access_log);
        self
    }

    pub fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }
}

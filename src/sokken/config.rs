use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP address serving `/health` (and `/tunnel/...` in server role).
    pub api_addr: String,
    pub role: Role,
    pub max_connections: usize,
    pub dial_timeout: Duration,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub enum Role {
    /// Accepts tunnels on the API address and dials allowlisted targets.
    Server { targets: Vec<String> },
    /// Listens locally and tunnels every connection to a remote responder.
    Client { routes: Vec<TunnelRoute> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Server,
    Client,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Server => "server",
            RoleKind::Client => "client",
        }
    }
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Server { .. } => RoleKind::Server,
            Role::Client { .. } => RoleKind::Client,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn server(targets: Vec<String>) -> anyhow::Result<Self> {
        let targets: Vec<String> = targets
            .into_iter()
            .map(|t| t.trim().to_string())
            .collect();
        if targets.is_empty() {
            anyhow::bail!("config: server needs at least one target address");
        }
        if let Some(i) = targets.iter().position(|t| t.is_empty()) {
            anyhow::bail!("config: target address #{} is empty", i + 1);
        }
        Ok(Role::Server { targets })
    }

    /// Builds client routes from `LOCAL_ADDR REMOTE_URL` pairs.
    pub fn client(args: &[String]) -> anyhow::Result<Self> {
        if args.is_empty() {
            anyhow::bail!("config: client needs at least one LOCAL_ADDR REMOTE_URL pair");
        }
        if args.len() % 2 != 0 {
            anyhow::bail!(
                "config: client routes must be LOCAL_ADDR REMOTE_URL pairs (got {} values)",
                args.len()
            );
        }
        let routes = args
            .chunks_exact(2)
            .enumerate()
            .map(|(i, pair)| {
                TunnelRoute::new(&pair[0], &pair[1])
                    .with_context(|| format!("config: route #{}", i + 1))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Role::Client { routes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRoute {
    pub local_addr: String,
    pub remote_url: String,
}

impl TunnelRoute {
    pub fn new(local_addr: &str, remote_url: &str) -> anyhow::Result<Self> {
        let local_addr = local_addr.trim();
        if local_addr.is_empty() {
            anyhow::bail!("empty local address");
        }
        Ok(Self {
            local_addr: local_addr.to_string(),
            remote_url: normalize_remote_url(remote_url)?,
        })
    }
}

fn normalize_remote_url(url: &str) -> anyhow::Result<String> {
    let url = url.trim();
    let (scheme, rest) = url
        .split_once("://")
        .with_context(|| format!("remote {url:?} is not a URL (expected ws://host:port/tunnel/<target>)"))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => anyhow::bail!("remote {url:?}: unsupported scheme {other:?} (expected ws|wss|http|https)"),
    };
    if rest.is_empty() {
        anyhow::bail!("remote {url:?}: missing host");
    }
    Ok(format!("{scheme}://{rest}"))
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
    pub rotation: String,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
            rotation: "never".into(),
            max_files: 7,
        }
    }
}

/// Values given on the command line (or their env vars); they win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_connections: Option<usize>,
    pub dial_timeout: Option<Duration>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_output: Option<String>,
    pub log_rotation: Option<String>,
    pub log_max_files: Option<usize>,
    pub log_debug: bool,
    pub log_pretty: bool,
}

/// Resolves the final configuration: defaults, then the optional file, then overrides.
pub fn build(
    api_addr: &str,
    role: Role,
    config_path: Option<&Path>,
    ov: &Overrides,
) -> anyhow::Result<Config> {
    let api_addr = api_addr.trim();
    if api_addr.is_empty() {
        anyhow::bail!("config: empty API address");
    }

    let mut cfg = Config {
        api_addr: api_addr.to_string(),
        role,
        max_connections: DEFAULT_MAX_CONNECTIONS,
        dial_timeout: DEFAULT_DIAL_TIMEOUT,
        logging: LoggingConfig::default(),
    };

    if let Some(path) = config_path {
        let fc = load_file(path).with_context(|| format!("load config: {}", path.display()))?;
        cfg.apply_file(fc)?;
    }

    cfg.apply_overrides(ov);
    cfg.validate()?;
    Ok(cfg)
}

fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };
    Ok(fc)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    max_connections: Option<i64>,
    dial_timeout_ms: Option<i64>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
    rotation: Option<String>,
    max_files: Option<i64>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    fn apply_file(&mut self, fc: FileConfig) -> anyhow::Result<()> {
        if let Some(n) = fc.max_connections {
            if n < 1 {
                anyhow::bail!("config: max_connections must be at least 1 (got {n})");
            }
            self.max_connections = n as usize;
        }
        if let Some(ms) = fc.dial_timeout_ms {
            self.dial_timeout = Duration::from_millis(ms.max(0) as u64);
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                self.logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                self.logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                self.logging.output = out;
            }
            if let Some(rot) = non_empty(&l.rotation) {
                self.logging.rotation = rot;
            }
            if let Some(n) = l.max_files {
                self.logging.max_files = n.max(0) as usize;
            }
            self.logging.add_source = l.add_source;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, ov: &Overrides) {
        if let Some(n) = ov.max_connections {
            self.max_connections = n;
        }
        if let Some(d) = ov.dial_timeout {
            self.dial_timeout = d;
        }
        if let Some(level) = non_empty(&ov.log_level) {
            self.logging.level = level;
        }
        if let Some(fmt) = non_empty(&ov.log_format) {
            self.logging.format = fmt;
        }
        if let Some(out) = non_empty(&ov.log_output) {
            self.logging.output = out;
        }
        if let Some(rot) = non_empty(&ov.log_rotation) {
            self.logging.rotation = rot;
        }
        if let Some(n) = ov.log_max_files {
            self.logging.max_files = n;
        }
        if ov.log_debug {
            self.logging.level = "debug".into();
        }
        // Pretty console output takes precedence over any file output.
        if ov.log_pretty {
            self.logging.format = "text".into();
            self.logging.output = "stderr".into();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("config: max_connections must be at least 1");
        }
        match self.logging.format.to_ascii_lowercase().as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("config: unknown log format {other:?} (expected json|text)"),
        }
        match self.logging.rotation.to_ascii_lowercase().as_str() {
            "never" | "minutely" | "hourly" | "daily" => {}
            other => anyhow::bail!(
                "config: unknown log rotation {other:?} (expected never|minutely|hourly|daily)"
            ),
        }
        Ok(())
    }
}

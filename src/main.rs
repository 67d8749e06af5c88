mod sokken;

use std::{path::PathBuf, time::Duration};

use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind};

use crate::sokken::config::{self, Overrides, Role};

#[derive(Debug, Parser)]
#[command(
    name = "sokken",
    version,
    about = "sokken - TCP over WebSocket tunnel"
)]
struct Cli {
    /// Optional config file (.toml/.yaml/.yml). Command-line values win over it.
    #[arg(long, env = "SOKKEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Maximum concurrently relayed connections [default: 100].
    #[arg(long, env = "SOKKEN_MAX_CONNECTIONS", global = true)]
    max_connections: Option<usize>,

    /// Timeout for dialing the remote side, e.g. `10s` or `500ms` [default: 10s].
    #[arg(long, env = "SOKKEN_DIAL_TIMEOUT", value_parser = humantime::parse_duration, global = true)]
    dial_timeout: Option<Duration>,

    /// debug|info|warn|error [default: info].
    #[arg(long, env = "SOKKEN_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[arg(long, env = "SOKKEN_LOG_FORMAT", value_parser = ["json", "text"], global = true)]
    log_format: Option<String>,

    /// stderr|stdout|discard or a file path [default: stderr].
    #[arg(long, env = "SOKKEN_LOG_OUTPUT", global = true)]
    log_output: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(long, env = "SOKKEN_LOG_DEBUG", global = true)]
    log_debug: bool,

    /// Human-readable logs on stderr.
    #[arg(long, env = "SOKKEN_LOG_PRETTY", global = true)]
    log_pretty: bool,

    /// Rotation of a log file output.
    #[arg(long, env = "SOKKEN_LOG_ROTATION", value_parser = ["never", "minutely", "hourly", "daily"], global = true)]
    log_rotation: Option<String>,

    /// Rotated log files to keep.
    #[arg(long, env = "SOKKEN_LOG_MAX_FILES", global = true)]
    log_max_files: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept tunnels on API_ADDR and relay them to allowlisted TCP targets.
    Server {
        /// Address serving /tunnel/<target> and /health, e.g. `:8080`.
        api_addr: String,
        /// `host:port` destinations clients may reach (exact match).
        #[arg(required = true, num_args = 1.., value_name = "TARGET_ADDR")]
        targets: Vec<String>,
    },
    /// Listen locally and tunnel every connection to a server.
    Client {
        /// Address serving /health, e.g. `127.0.0.1:8081`.
        api_addr: String,
        /// Pairs of local listen address and `ws://host:port/tunnel/<target>` URL.
        #[arg(required = true, num_args = 2.., value_names = ["LOCAL_ADDR", "REMOTE_URL"])]
        routes: Vec<String>,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            max_connections: self.max_connections,
            dial_timeout: self.dial_timeout,
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            log_output: self.log_output.clone(),
            log_rotation: self.log_rotation.clone(),
            log_max_files: self.log_max_files,
            log_debug: self.log_debug,
            log_pretty: self.log_pretty,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (api_addr, role) = match &cli.command {
        Command::Server { api_addr, targets } => (api_addr, Role::server(targets.clone())?),
        Command::Client { api_addr, routes } => {
            if routes.len() % 2 != 0 {
                Cli::command()
                    .error(
                        ErrorKind::WrongNumberOfValues,
                        "client routes must be LOCAL_ADDR REMOTE_URL pairs",
                    )
                    .exit();
            }
            (api_addr, Role::client(routes)?)
        }
    };

    let cfg = config::build(api_addr, role, cli.config.as_deref(), &cli.overrides())?;
    sokken::run(cfg).await
}

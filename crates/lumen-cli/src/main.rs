use anyhow::Context as _;
use clap::Parser;
use lumen_core::{DispatchModel, Server, ServerConfig};
use std::path::PathBuf;

/// Flags override `LUMEN_*` environment variables (and `.env`), which
/// override the built-in defaults.
#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Epoll-driven HTTP/1.1 static file server")]
#[command(version)]
struct Cli {
    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Document root
    #[arg(short = 'r', long = "root")]
    doc_root: Option<PathBuf>,

    /// Trigger modes: 0 = LT+LT, 1 = LT+ET, 2 = ET+LT, 3 = ET+ET (listen+conn)
    #[arg(short = 'm', long = "trig-mode", value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: Option<u8>,

    /// Enable SO_LINGER (1 s) on the listening socket
    #[arg(short = 'o', long, value_parser = clap::value_parser!(u8).range(0..=1))]
    linger: Option<u8>,

    /// Credential store handles
    #[arg(short = 's', long = "store-pool")]
    store_pool: Option<usize>,

    /// Worker threads
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Disable logging entirely (1 = off)
    #[arg(short = 'c', long = "close-log", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    close_log: u8,

    /// Dispatch model: 0 = inline I/O, 1 = deferred I/O
    #[arg(short = 'a', long = "actor-model", value_parser = clap::value_parser!(u8).range(0..=1))]
    actor_model: Option<u8>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Work queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Idle sweep period in seconds
    #[arg(long)]
    timeslot: Option<u32>,

    /// Page served for `/`
    #[arg(long)]
    default_page: Option<String>,

    /// `name:password` file backing the credential store
    #[arg(long)]
    users_file: Option<PathBuf>,

    /// Default log level (RUST_LOG takes precedence)
    #[arg(long, env = "LUMEN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) -> anyhow::Result<()> {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(root) = self.doc_root {
            config.doc_root = root;
        }
        if let Some(mode) = self.trig_mode {
            config.set_trig_combo(mode)?;
        }
        if let Some(linger) = self.linger {
            config.linger = linger == 1;
        }
        if let Some(size) = self.store_pool {
            config.store_pool_size = size;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(model) = self.actor_model {
            config.dispatch = if model == 0 {
                DispatchModel::Inline
            } else {
                DispatchModel::Deferred
            };
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = self.timeslot {
            config.timeslot_secs = secs;
        }
        if let Some(page) = self.default_page {
            config.default_page = page;
        }
        if let Some(path) = self.users_file {
            config.users_file = Some(path);
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.close_log == 0 {
        if cli.log_json {
            lumen_core::init_logging_json(&cli.log_level);
        } else {
            lumen_core::init_logging_with_level(&cli.log_level);
        }
    }

    let mut config = ServerConfig::from_env().context("failed to load configuration")?;
    cli.apply(&mut config)?;

    let mut server = Server::bind(config).context("failed to start server")?;
    server.run().context("server terminated with an error")?;

    tracing::info!("bye");
    Ok(())
}

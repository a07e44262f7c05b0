//! `whaisd` — the WHAIS database server daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use whais_server::{Server, ServerConfig, ServerState};
use whais_vm::NameSpace;

mod logger;

#[derive(Debug, Parser)]
#[command(name = "whaisd")]
#[command(about = "WHAIS database server", long_about = None, version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file to load.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run with built-in defaults and a single database directory.
    #[arg(long, conflicts_with = "config")]
    database: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() {
    std::process::exit(run(Cli::parse()));
}

fn run(cli: Cli) -> i32 {
    let mut config = match (&cli.config, &cli.database) {
        (Some(path), _) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("whaisd: {e}");
                return 2;
            }
        },
        (None, Some(dir)) => {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".into());
            let mut config = ServerConfig::default();
            config.working_directory = dir.clone();
            config.temp_directory = dir.join("tmp");
            config.databases.push(whais_server::DatabaseConfig {
                name,
                directory: dir.clone(),
                object_files: vec![],
            });
            config
        }
        (None, None) => {
            eprintln!("whaisd: either --config or --database is required");
            return 2;
        }
    };
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if config.databases.is_empty() {
        eprintln!("whaisd: the configuration serves no databases");
        return 2;
    }

    logger::init(config.show_debug, config.log_file.as_deref());

    let state = match ServerState::new(config, Arc::new(NameSpace::new())) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("whaisd: cannot open the configured databases: {e}");
            return 3;
        }
    };
    let server = match Server::bind(Arc::clone(&state)) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("whaisd: cannot bind the listen socket: {e}");
            return 3;
        }
    };
    match server.serve() {
        Ok(()) => 0,
        Err(e) => {
            log::error!("server loop failed: {e}");
            1
        }
    }
}

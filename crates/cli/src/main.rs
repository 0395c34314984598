use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "backhaul")]
#[command(about = "Expose a local HTTP server through a public relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: BACKHAUL_CONFIG_PATH or ~/.backhaul/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the relay gateway (public HTTP + tunnel WebSocket on one port).
    Gateway {
        /// Config file path (default: BACKHAUL_CONFIG_PATH or ~/.backhaul/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Connect a local server to the gateway and keep the tunnel up until Ctrl+C.
    Connect {
        /// Config file path (default: BACKHAUL_CONFIG_PATH or ~/.backhaul/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Gateway base URL, e.g. https://relay.example.com (default from config or BACKHAUL_SERVER)
        #[arg(long, short, value_name = "URL")]
        server: Option<String>,

        /// Tunnel name to claim; a fresh one is allocated when omitted
        #[arg(long, short, value_name = "NAME")]
        tunnel: Option<String>,

        /// Local server requests are forwarded to (default http://127.0.0.1:3000)
        #[arg(long, value_name = "URL")]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!(
                "backhaul {} (protocol {})",
                env!("CARGO_PKG_VERSION"),
                backhaul::protocol::PROTOCOL_VERSION
            );
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Connect {
            config,
            server,
            tunnel,
            target,
        }) => {
            if let Err(e) = run_connect(config, server, tunnel, target).await {
                log::error!("connect failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(backhaul::config::default_config_path);
    let dir = backhaul::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _path) = backhaul::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    backhaul::gateway::run_gateway(config).await
}

async fn run_connect(
    config_path: Option<std::path::PathBuf>,
    server: Option<String>,
    tunnel: Option<String>,
    target: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, _path) = backhaul::config::load_config(config_path)?;
    // Flags win over environment, environment wins over the config file.
    config.client.server = server.unwrap_or_else(|| backhaul::config::resolve_server(&config));
    config.client.tunnel = tunnel.or_else(|| backhaul::config::resolve_tunnel(&config));
    if let Some(t) = target {
        config.client.target = t;
    }
    backhaul::client::run_client(config).await
}

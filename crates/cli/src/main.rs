mod builtin_tools;
mod client_commands;
mod config_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: MCP client and server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (defaults to ./switchboard.{toml,yaml,yml,json}, then the
    /// user config directory).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured MCP servers.
    Servers,
    /// List the tools a server offers.
    Tools { server: String },
    /// Call a tool.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Per-request timeout in milliseconds (overrides config).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print progress notifications to stderr.
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// List the resources a server offers.
    Resources { server: String },
    /// Read one resource.
    Read { server: String, uri: String },
    /// List the prompts a server offers.
    Prompts { server: String },
    /// Serve the built-in tools over streamable HTTP, or stdio with `--stdio`.
    Serve {
        #[arg(long, default_value_t = false)]
        stdio: bool,
        /// Address to bind to (overrides config value).
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config value).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

/// Logs go to stderr so stdout stays free for command output and for the
/// stdio server's protocol frames.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    let config = switchboard_config::load_or_discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Servers => {
            client_commands::list_servers(&config.client);
            Ok(())
        },
        Commands::Tools { server } => client_commands::list_tools(config.client, &server).await,
        Commands::Call {
            server,
            tool,
            args,
            timeout_ms,
            progress,
        } => {
            let options = client_commands::CallOptions {
                timeout_ms,
                progress,
            };
            client_commands::call_tool(config.client, &server, &tool, &args, options).await
        },
        Commands::Resources { server } => {
            client_commands::list_resources(config.client, &server).await
        },
        Commands::Read { server, uri } => {
            client_commands::read_resource(config.client, &server, &uri).await
        },
        Commands::Prompts { server } => client_commands::list_prompts(config.client, &server).await,
        Commands::Serve { stdio, bind, port } => {
            let mut server = config.server;
            if let Some(bind) = bind {
                server.bind = bind;
            }
            if let Some(port) = port {
                server.port = port;
            }
            builtin_tools::serve(server, stdio).await
        },
        Commands::Config { action } => config_commands::handle_config(action, &config),
    }
}

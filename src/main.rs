use clap::Parser;
use client::network::{run_interactive, ClientConfig};
use log::info;
use server::network::{run_until_ctrl_c, ServerConfig};
use shared::Mode;

/// Runs either the chat server or an interactive chat client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(clap::ArgGroup::new("mode").required(true).args(["server", "client"])))]
struct Args {
    /// Run as the chat server, listening on all interfaces
    #[arg(long)]
    server: bool,

    /// Run as an interactive chat client
    #[arg(long)]
    client: bool,

    /// Server IP address (client mode)
    #[arg(long)]
    ip: Option<String>,

    /// Port to listen on or connect to
    #[arg(long)]
    port: Option<String>,

    /// Username to register with (client mode)
    #[arg(long)]
    user: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mode = Mode::resolve(
        args.server,
        args.client,
        args.ip.as_deref(),
        args.port.as_deref(),
        args.user.as_deref(),
    )?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result: Result<(), Box<dyn std::error::Error>> = match mode {
        Mode::Server { port } => {
            info!("Starting server on port {}", port);
            runtime
                .block_on(run_until_ctrl_c(ServerConfig::new("0.0.0.0", port)))
                .map_err(Into::into)
        }
        Mode::Client { ip, port, user } => {
            info!("Connecting to {}:{} as {}", ip, port, user);
            runtime
                .block_on(run_interactive(ClientConfig::new(&ip, port, &user)))
                .map_err(Into::into)
        }
    };
    // A pending stdin read cannot be cancelled, so don't wait for it
    runtime.shutdown_background();

    result
}

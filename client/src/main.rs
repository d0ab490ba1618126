use clap::Parser;
use client::network::{run_interactive, ClientConfig};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to connect to
    #[arg(short, long, default_value = shared::DEFAULT_HOST, value_parser = shared::config::parse_ip)]
    ip: String,

    /// Server port
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT, value_parser = shared::config::parse_port)]
    port: u16,

    /// Username to register with
    #[arg(short, long, value_parser = shared::config::parse_user)]
    user: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to {}:{} as {}", args.ip, args.port, args.user);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_interactive(ClientConfig::new(
        &args.ip, args.port, &args.user,
    )));
    // A pending stdin read cannot be cancelled, so don't wait for it
    runtime.shutdown_background();

    result?;
    Ok(())
}

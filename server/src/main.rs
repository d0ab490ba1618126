use clap::Parser;
use server::network::{run_until_ctrl_c, DispatchMode, ServerConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = shared::DEFAULT_HOST)]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT, value_parser = shared::config::parse_port)]
    port: u16,

    /// How accepted connections are handed to session workers
    #[arg(short, long, value_enum, default_value_t = DispatchMode::Pooled)]
    dispatch: DispatchMode,

    /// Seconds a client may stay silent before it is disconnected
    /// (defaults to 120 for pooled dispatch, 10 for queued)
    #[arg(short, long)]
    idle_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ServerConfig::new(&args.host, args.port).with_dispatch(args.dispatch);
    if let Some(secs) = args.idle_timeout {
        config = config.with_idle_timeout(Duration::from_secs(secs));
    }

    run_until_ctrl_c(config).await?;

    Ok(())
}

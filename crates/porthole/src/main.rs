mod porthole;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "porthole",
    version,
    about = "Porthole - expose a local TCP service on an ephemeral public port"
)]
struct Cli {
    /// Port of the local service to expose. Falls back to 3000 when absent or not a valid port.
    local_port: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    porthole::run(cli.local_port).await
}

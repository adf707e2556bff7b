pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod relay;
pub mod tracker;
pub mod tunnel;

pub async fn run(local_port: Option<String>) -> anyhow::Result<()> {
    app::run(local_port).await
}

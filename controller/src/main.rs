mod config;
mod control;
mod ebusd;
mod host;
mod hub;
mod mqtt;
mod status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

use anyhow::{Context, bail};
use std::time::Duration;
use valheim_runner::config::RconConfig;
use valheim_runner::transport::{RconClient, Transport};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!("usage: rcon_command <host:port> <password> <command...>");
    }

    let (host, port) = args[0]
        .rsplit_once(':')
        .context("address must be host:port")?;
    let port: u16 = port.parse().context("invalid port")?;

    let mut config = RconConfig::new(host, port, args[1].clone());
    config.timeout = Duration::from_secs(10);

    let client = RconClient::new(config);
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", args[0]))?;

    let command = args[2..].join(" ");
    tracing::info!(%command, "Sending command");
    let response = client.send(&command).await;
    client.disconnect().await?;

    println!("{}", response?);
    Ok(())
}

use anyhow::{Context, bail};
use futures::StreamExt;
use std::time::Duration;
use valheim_runner::logging::{self, LogOptions};
use valheim_runner::server::ProcessOptions;
use valheim_runner::{RunnerEvent, ServerRunner};

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // VALHEIM_RUNNER_LOG=debug for more detail
    logging::init(LogOptions::default())?;

    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(executable)) = (args.next(), args.next()) else {
        bail!("usage: supervise <config.json|config.yaml> <path to valheim_server>");
    };

    let options = ProcessOptions::new(executable);
    let mut runner = ServerRunner::from_config_file(&config_path, options)
        .with_context(|| format!("failed to load {}", config_path))?;
    let detached = runner.config().server.detached;

    let events = runner
        .events()
        .context("event stream already taken")?;

    // Pick up a server left running by an earlier detached run
    if runner.attach().await? {
        println!("Attached to running server");
    } else {
        runner.start().await.context("failed to start server")?;
        println!("Started {}", runner.config().server.name);
    }

    futures::pin_mut!(events);
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(RunnerEvent::Server(event)) => println!("{}", serde_json::to_string(&event)?),
                Some(RunnerEvent::Session(event)) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if detached {
                    println!("Detaching, the server keeps running");
                    runner.detach().await?;
                } else {
                    println!("Stopping server");
                    runner.stop(STOP_TIMEOUT).await?;
                }
                break;
            }
        }
    }

    Ok(())
}

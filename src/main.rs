mod checks;
mod config;
mod report;
mod runner;
mod scenario;
mod session;
#[cfg(test)]
mod test_server;

use anyhow::Context;

use crate::config::Config;
use crate::runner::Runner;

const CONFIG_FILE: &str = "config.toml";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    tracing_subscriber::fmt::init();
    tracing::debug!("Loaded config: {:?}", config);
    tracing::info!(
        "Load testing {} [rooms={}, messages={}, target_vus={}]",
        config.url,
        config.rooms,
        config.messages,
        config.target_vus
    );

    let runner = Runner::new(&config);

    let _exit_signal = {
        // Listen to tokio's ctrl_c signal. The first one ends the stages early and VUs still
        // get the graceful stop period, a second one interrupts them right away.
        let shutdown = runner.shutdown();
        tokio::spawn(async move {
            loop {
                match tokio::signal::ctrl_c().await {
                    Ok(_) => {
                        tracing::debug!("Tokio's ctrl_c signal received");
                        shutdown.signal();
                    }
                    Err(err) => {
                        // The OS failed to register the signal, so the run can only end on its own.
                        tracing::debug!("{}", err);
                        break;
                    }
                }
            }
        });
    };

    let summary = runner.run().await?;
    tracing::info!("{}", summary);
    for check in &summary.checks {
        tracing::info!("{}", check);
    }
    Ok(())
}

use std::env;
use std::error::Error;
use std::process;
use std::sync::Arc;

use clap::Parser;

use crate::bluetooth::Bluetooth;
use crate::cli::console::Console;
use crate::cli::Args;
use crate::config::Options;
use crate::drivers::joycon::transport::HidApiTransport;
use crate::input::manager::Manager;
use crate::input::target::TargetFactory;

mod bluetooth;
mod cli;
mod config;
mod constants;
mod drivers;
mod input;
mod sync;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let log_level = match env::var("LOG_LEVEL") {
        Ok(value) => value,
        Err(_) => "info".to_string(),
    };
    env::set_var("RUST_LOG", log_level);
    env_logger::init();
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    log::info!("Starting joycon-mux v{}", VERSION);

    let args = Args::parse();
    let options = Options::load(&args)?;
    log::debug!("Using options: {options:?}");

    let transport = Arc::new(HidApiTransport::new()?);
    let factory = Arc::new(TargetFactory::new(options.output));
    let bluetooth = Bluetooth::new(options.bluetooth).await?;
    let console_enabled = options.console;
    let manager = Manager::new(transport, factory, bluetooth, options);

    // Setup CTRL+C handler
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Unable to listen for shutdown signal: {e}");
            return;
        }
        signal_manager.shutdown().await;
        log::info!("Shutting down");
        process::exit(0);
    });

    let run_task = tokio::spawn(manager.clone().run());

    if console_enabled {
        let console = Console::new(manager.clone());
        tokio::spawn(async move {
            console.run().await;
            manager.shutdown().await;
        });
    }

    match run_task.await {
        Ok(Ok(())) => log::info!("The session manager task has exited"),
        Ok(Err(e)) => {
            log::error!("Error running the session manager: {e}");
            return Err(e);
        }
        Err(e) => {
            log::error!("Error in joining the session manager task: {e}");
            return Err(Box::new(e));
        }
    }

    log::info!("joycon-mux stopped");

    Ok(())
}

use std::process::ExitCode;

use clap::Parser;
use fern::colors::{Color, ColoredLevelConfig};
use log::{error, info};

use ghostchain_common::config::VERSION;
use ghostchain_daemon::{
    config::{exit_codes, NodeConfig},
    core::error::BlockchainError,
    node::Node,
};

fn setup_logger(level: log::LevelFilter) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::BrightBlack);
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        // quinn and rustls are chatty at debug level
        .level_for("quinn", log::LevelFilter::Warn)
        .level_for("rustls", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn exit_code_for(e: &BlockchainError) -> u8 {
    match e {
        BlockchainError::Genesis(_) => exit_codes::CONFIG_ERROR as u8,
        BlockchainError::Corruption(_) => exit_codes::STORAGE_CORRUPTION as u8,
        _ => exit_codes::FATAL_ERROR as u8,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = NodeConfig::parse();
    if setup_logger(config.log_level).is_err() {
        eprintln!("cannot initialize logging");
        return ExitCode::from(exit_codes::CONFIG_ERROR as u8);
    }
    info!("ghostchaind v{} starting on {}", VERSION, config.network);

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {}", e);
            return ExitCode::from(exit_code_for(&e));
        }
    };

    match node.run().await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(e) => {
            error!("fatal runtime error: {}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

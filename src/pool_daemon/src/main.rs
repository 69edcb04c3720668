mod admin;
mod config;
mod pool_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::config::DEFAULT_POOL_DAEMON_CONFIG_PATH;
use crate::pool_daemon::{run_pool_daemon, PoolDaemonRunOptions};

fn usage() -> String {
    format!(
        "usage: pool_daemon [--config <path>]\n\
         defaults:\n\
         --config {}",
        DEFAULT_POOL_DAEMON_CONFIG_PATH
    )
}

fn parse_args() -> Result<PoolDaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = PathBuf::from(DEFAULT_POOL_DAEMON_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(PoolDaemonRunOptions { config_path })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_pool_daemon(options) {
        error!("run pool_daemon failed: {}", err);
        std::process::exit(1);
    }
}

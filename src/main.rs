//! appvirt - CLI entry point
//!
//! Installs, lists, launches and removes virtual apps in a storage root.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use appvirt::config::RuntimeConfig;
use appvirt::runtime::{wait_for_exit, Runtime};

/// appvirt - Run application packages in a virtual environment
///
/// # Examples
///
/// Install a package (reads `demo.pkg.json` next to the archive):
///     appvirt install ./demo.pkg
///
/// Launch it for user 0 and wait until it exits:
///     appvirt --settings ./appvirt.json launch com.demo.app
#[derive(Parser, Debug)]
#[command(name = "appvirt")]
#[command(about = "Run application packages in a virtual environment")]
#[command(version)]
pub struct Cli {
    /// Path to settings JSON file
    ///
    /// If not provided, uses the default configuration (storage under
    /// `./appvirt-data`, all hooks enabled).
    #[arg(long, short = 's', global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'd', global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Install or update a package from an archive
    Install { archive: PathBuf },

    /// Kill a package's processes and remove it
    Uninstall { package_id: String },

    /// List installed packages
    List,

    /// Print a package record as JSON
    Info { package_id: String },

    /// Launch a package and wait for it to exit
    Launch {
        package_id: String,

        #[arg(long, short = 'u', default_value_t = 0)]
        user: u32,

        /// Liveness poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_logging(cli.debug)?;

    let config = if let Some(settings_path) = &cli.settings {
        tracing::info!("Loading configuration from: {}", settings_path.display());
        RuntimeConfig::from_file(settings_path)?
    } else {
        tracing::debug!("Using default configuration");
        RuntimeConfig::default()
    };

    let runtime = Runtime::with_defaults(config)?;
    let facade = runtime.facade();

    match cli.command {
        Command::Install { archive } => {
            let record = facade
                .try_install_app(&archive)
                .with_context(|| format!("Failed to install {}", archive.display()))?;
            println!(
                "{} {} ({})",
                record.package_id, record.version_name, record.version_code
            );
        }
        Command::Uninstall { package_id } => {
            facade
                .try_uninstall_app(&package_id)
                .with_context(|| format!("Failed to uninstall {}", package_id))?;
        }
        Command::List => {
            for record in facade.list_installed() {
                println!(
                    "{}\t{}\t{}",
                    record.package_id, record.version_name, record.version_code
                );
            }
        }
        Command::Info { package_id } => {
            let record = facade.try_get_package_record(&package_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Launch {
            package_id,
            user,
            poll_ms,
        } => {
            let record = facade.try_launch_app(&package_id, user)?;
            let pid = record.process_handle.map(|h| h.pid).unwrap_or_default();
            tracing::info!("{}:{} running as pid {}", package_id, user, pid);

            tokio::select! {
                _ = wait_for_exit(facade, &package_id, user, Duration::from_millis(poll_ms.max(10))) => {
                    tracing::info!("{}:{} exited", package_id, user);
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    tracing::info!("Interrupted, killing {}:{}", package_id, user);
                    facade.kill_app(&package_id, user);
                }
            }
        }
    }

    Ok(())
}

/// Initializes the logging system.
///
/// `debug` selects the DEBUG level instead of INFO. `RUST_LOG` overrides both.
fn initialize_logging(debug: bool) -> Result<()> {
    let log_level = if debug { "debug" } else { "info" };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_install() {
        let cli = Cli::try_parse_from(["appvirt", "install", "demo.pkg"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Install {
                archive: PathBuf::from("demo.pkg")
            }
        );
        assert!(cli.settings.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_parsing_launch_defaults() {
        let cli = Cli::try_parse_from(["appvirt", "launch", "com.demo.app"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Launch {
                package_id: "com.demo.app".to_string(),
                user: 0,
                poll_ms: 500
            }
        );
    }

    #[test]
    fn test_cli_parsing_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "appvirt", "launch", "com.demo.app", "-u", "10", "-s", "appvirt.json", "-d",
        ])
        .unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("appvirt.json")));
        assert!(cli.debug);
        assert!(matches!(cli.command, Command::Launch { user: 10, .. }));
    }

    #[test]
    fn test_cli_parsing_list_and_info() {
        let cli = Cli::try_parse_from(["appvirt", "--debug", "list"]).unwrap();
        assert_eq!(cli.command, Command::List);
        assert!(cli.debug);

        let cli = Cli::try_parse_from(["appvirt", "info", "com.demo.app"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Info {
                package_id: "com.demo.app".to_string()
            }
        );
    }

    #[test]
    fn test_cli_subcommand_required() {
        assert!(Cli::try_parse_from(["appvirt"]).is_err());
        assert!(Cli::try_parse_from(["appvirt", "install"]).is_err());
        assert!(Cli::try_parse_from(["appvirt", "launch", "x", "-u", "-1"]).is_err());
    }
}

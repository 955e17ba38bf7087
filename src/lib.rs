pub mod blockdev;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod fs;
pub mod host;
pub mod overlay;
pub mod provision;
pub mod resolver;
pub mod state;
pub mod types;

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser as _;
use cmd::IntoCommand as _;
use config::source::{cached::CachedConfigSource, fs::FileSystemConfigSource};
use shadow_rs::shadow;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

shadow!(build);

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Cli::parse();

    if let cli::GlobalSubcommand::BootService(boot_service_options) = &args.command {
        tracing::info!(
            "livepersist version: v{}  commit: {}  buildtime: {}",
            build::PKG_VERSION,
            build::COMMIT_HASH,
            build::BUILD_TIME
        );

        tracing::info!(
            "The livepersist is running in {} stage",
            boot_service_options.stage
        );
    }

    // Set to the given config dir from livepersist command line.
    if let Some(config_dir) = &args.config_dir {
        if !Path::new(config_dir).exists() || !Path::new(config_dir).is_dir() {
            bail!("Config dir {config_dir} does not exist or not a directory")
        }

        config::source::set_config_source(CachedConfigSource::new(
            FileSystemConfigSource::new(config_dir),
        ))
        .await;
    }

    // Check verbose option from config file, if is running as boot service.
    if let cli::GlobalSubcommand::BootService(_) | cli::GlobalSubcommand::MountOverlay(_) =
        args.command
    {
        match config::load_config().await {
            Ok(config) if config.boot.verbose => {
                reload_handle
                    .modify(|filter| {
                        *filter = tracing_subscriber::EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| "debug".into())
                    })
                    .context("Failed to update log level to DEBUG")?;

                tracing::info!("Log level set to DEBUG");
            }
            Ok(_) => {}
            // The boot chain must go on, it runs with the defaults.
            Err(e) => tracing::warn!("{e:#}"),
        }
    }

    tracing::debug!(
        "Using config source from {:?}",
        crate::config::source::get_config_source()
            .await
            .source_debug_string()
    );

    // Handle the command
    args.command.into_command().run().await?;

    Ok(())
}

/// A macro like scopeguard::defer! but can defer a future.
///
/// Note that other code running concurrently in the same task will be suspended
/// due to the call to block_in_place, until the future is finished.
///
/// # Examples
///
/// ```ignore
/// async_defer!(async {
///     // Do some cleanup
/// });
/// ```
///
/// # Panics
///
/// This macro should only be used in tokio multi-thread runtime, and will panics
/// if called from a [`current_thread`] runtime.
///
#[macro_export]
macro_rules! async_defer {
    ($future:expr) => {
        scopeguard::defer! {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = $future.await;
                });
            });
        }
    };
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use proxybox::app::reload::{reload_channel, ReloadNotifier, ReloadSignal};
use proxybox::config::load_options;
use proxybox::{BoxOptions, ProxyBox};

const WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "proxybox", version, about = "Proxy platform orchestrator")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service, rebuilding it on reload requests
    Run {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
        /// Do not watch the configuration file
        #[arg(long)]
        no_watch: bool,
    },
    /// Build the configuration and close it again
    Check {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Args::parse().command {
        Commands::Run { config, no_watch } => run(&config, !no_watch).await,
        Commands::Check { config } => check(&config).await,
    }
}

async fn check(path: &Path) -> Result<()> {
    let options = load_options(path)?;
    let instance = ProxyBox::new(BoxOptions::new(options)).await?;
    instance.close().await?;
    Ok(())
}

async fn start_box(path: &Path, root: &CancellationToken) -> Result<ProxyBox> {
    let options = load_options(path)?;
    let instance = ProxyBox::new(BoxOptions::new(options).with_context(root.clone())).await?;
    instance.start().await?;
    if let Err(e) = instance.post_start().await {
        if let Err(close_err) = instance.close().await {
            warn!(error = %close_err, "close after failed post-start");
        }
        return Err(e.into());
    }
    Ok(instance)
}

async fn run(path: &Path, watch: bool) -> Result<()> {
    let (file_notifier, file_signal) = reload_channel();
    let _watcher = if watch {
        Some(watch_config(path, file_notifier)?)
    } else {
        None
    };
    let root = CancellationToken::new();
    let mut first = true;

    loop {
        let instance = match start_box(path, &root).await {
            Ok(instance) => Some(instance),
            Err(e) if first => return Err(e),
            Err(e) => {
                error!(error = %format!("{:#}", e), "reload failed, waiting for the next change");
                None
            }
        };
        first = false;

        let reload = match &instance {
            Some(instance) => tokio::select! {
                _ = tokio::signal::ctrl_c() => false,
                _ = instance.reload_signal().recv() => true,
                _ = wait_file_change(&file_signal) => true,
            },
            None => tokio::select! {
                _ = tokio::signal::ctrl_c() => false,
                _ = wait_file_change(&file_signal) => true,
            },
        };

        if let Some(instance) = instance {
            if let Err(e) = instance.close().await {
                warn!(error = %e, "close");
            }
        }
        if !reload {
            break;
        }
        info!("reloading");
    }

    root.cancel();
    Ok(())
}

/// Editors emit bursts of events per save; settle before reloading.
async fn wait_file_change(signal: &ReloadSignal) {
    if signal.recv().await {
        tokio::time::sleep(WATCH_DEBOUNCE).await;
        signal.try_recv();
    } else {
        std::future::pending::<()>().await;
    }
}

fn watch_config(path: &Path, notifier: ReloadNotifier) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                notifier.notify();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "config watch error"),
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "config watcher started");
    Ok(watcher)
}

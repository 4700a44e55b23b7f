mod core;
mod display;
mod ledger;
mod link;
mod normalize;
mod settings;
mod sync;
mod upstream;

use anyhow::Result;
use clap::{arg, Arg, Command};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::settings::Settings;

static CLIENT_NAME: &str = "tally";

pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, starting graceful shutdown");
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run() -> Result<()> {
    let app = Command::new(CLIENT_NAME)
        .about("The tally utility pulls bank transactions from GoCardless Bank Account \
         Data and uploads them, deduplicated, to YNAB budgets.")
        .version("0.1.0")
        .subcommand_required(true)
        .allow_external_subcommands(false)
        .arg(arg!(CONFIG: -c --config [FILE] "Sets a custom config file"))
        .arg(arg!(verbose: -v --verbose "Enables debug logging"))
        .subcommand(Command::new("link")
            .about("Links bank accounts of an institution for syncing.")
            .arg(arg!(institution: -i --institution [ID] "The institution to link, overrides link.institution_id."))
            .arg(arg!(port: -p --port [PORT] "The local port receiving the authorization callback."))
            .arg(Arg::new("no-browser")
                .long("no-browser")
                .help("Prints the authorization link instead of opening a browser."))
            .subcommand(Command::new("status").about("Displays all requisitions and their current status.")))
        .subcommand(Command::new("sync")
            .about("Runs every configured job once, syncing the last twenty days of transactions.")
            .arg(arg!(source: -s --source [ACCOUNT] "Only runs the jobs reading from this source account.")))
        .subcommand(Command::new("serve")
            .about("Runs every configured job on the configured cron schedule until interrupted."));

    let matches = app.get_matches();
    init_tracing(matches.is_present("verbose"));

    let settings = Settings::new(matches.value_of("CONFIG"))?;

    match matches.subcommand() {
        Some(("link", link_matches)) => link::run(link_matches, settings).await?,
        Some(("sync", sync_matches)) => {
            sync::sync(settings, sync_matches.value_of("source")).await?
        }
        Some(("serve", _serve_matches)) => sync::serve(settings).await?,
        None => unreachable!("subcommand is required"),
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        println!("{:#}", err);
        std::process::exit(1);
    }
}

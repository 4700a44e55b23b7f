use std::net::SocketAddr;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ArgMatches;
use gocardless_link::{CallbackServer, LinkError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use crate::settings::Settings;
use crate::upstream::{
    self, gocardless, LinkSource, RequisitionRequest, RequisitionStatus, SessionManager,
};

const CALLBACK_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("callback receiver failed")]
    Callback(#[from] LinkError),
    #[error("upstream request failed")]
    Upstream(#[from] upstream::Error),
    #[error("requisition is not linked, status {0}")]
    NotLinked(RequisitionStatus),
    #[error("requisition is linked but has no accounts")]
    NoAccounts,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub institution_id: String,
    pub addr: SocketAddr,
    pub timeout: Duration,
    pub grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linked {
    pub requisition_id: String,
    pub accounts: Vec<String>,
}

/// LinkFlow walks an institution through agreement, requisition and user
/// authorization until the provider reports linked accounts.
pub struct LinkFlow<S> {
    sessions: SessionManager<S>,
    options: LinkOptions,
}

impl<S: LinkSource + Send + Sync> LinkFlow<S> {
    pub fn new(sessions: SessionManager<S>, options: LinkOptions) -> Self {
        Self { sessions, options }
    }

    /// Runs the flow once. `present` receives the authorization link after
    /// the callback receiver is already listening.
    pub async fn run<P>(&self, cancel: &CancellationToken, present: P) -> Result<Linked, FlowError>
    where
        P: FnOnce(&str),
    {
        let mut server = CallbackServer::bind(self.options.addr)?;
        info!(addr = %server.local_addr(), "callback receiver listening");

        let result = self.link(&mut server, cancel, present).await;
        server.shutdown().await;

        result
    }

    #[tracing::instrument(skip_all, fields(institution_id = %self.options.institution_id))]
    async fn link<P>(
        &self,
        server: &mut CallbackServer,
        cancel: &CancellationToken,
        present: P,
    ) -> Result<Linked, FlowError>
    where
        P: FnOnce(&str),
    {
        let source = self.sessions.authenticator();
        let session = self.sessions.session().await?;

        let agreement_id = source
            .create_agreement(&session, &self.options.institution_id)
            .await?;
        info!(agreement_id = %agreement_id, "agreement created");

        let requisition = source
            .create_requisition(
                &session,
                &RequisitionRequest {
                    institution_id: self.options.institution_id.clone(),
                    agreement_id,
                    redirect: server.callback_url(),
                    reference: Ulid::new().to_string(),
                },
            )
            .await?;
        info!(requisition_id = %requisition.id, "requisition created");

        present(&requisition.link);
        info!(
            timeout_secs = self.options.timeout.as_secs(),
            "awaiting callback"
        );

        let callback = server.wait(self.options.timeout, cancel).await?;
        info!(
            reference = ?callback.reference,
            error = ?callback.error,
            details = ?callback.details,
            "callback received"
        );

        // The provider may still be settling the requisition right after
        // redirecting.
        tokio::time::sleep(self.options.grace).await;

        let polled = source.requisition(&session, &requisition.id).await?;
        info!(status = %polled.status, accounts = polled.accounts.len(), "status polled");

        if polled.status != RequisitionStatus::Linked {
            return Err(FlowError::NotLinked(polled.status));
        }
        if polled.accounts.is_empty() {
            return Err(FlowError::NoAccounts);
        }

        info!(requisition_id = %polled.id, "linked");

        Ok(Linked {
            requisition_id: polled.id,
            accounts: polled.accounts,
        })
    }
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("rundll32");
    cmd.args(["url.dll,FileProtocolHandler", url]);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

fn present_link(link: &str, open_browser: bool) {
    if open_browser {
        match browser_command(link).spawn() {
            Ok(_) => {
                println!("Opened {} in your browser to link your account.", link);
                return;
            }
            Err(err) => warn!(%err, "failed to open browser"),
        }
    }

    println!("Visit {} to link your account.", link);
}

fn client(settings: &Settings) -> Result<gocardless::Client> {
    Ok(
        gocardless::Client::new(settings.gocardless.credentials()?, settings.http_timeout())?
            .with_base_url(&settings.gocardless.base_url),
    )
}

async fn link(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let institution_id = matches
        .value_of("institution")
        .or(settings.link.institution_id.as_deref())
        .context("no institution given, pass --institution or set link.institution_id")?
        .to_string();
    let port = match matches.value_of("port") {
        Some(port) => port
            .parse::<u16>()
            .with_context(|| format!("invalid port {:?}", port))?,
        None => settings.link.port,
    };
    let open_browser = settings.link.open_browser && !matches.is_present("no-browser");

    let flow = LinkFlow::new(
        SessionManager::new(client(&settings)?),
        LinkOptions {
            institution_id,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            timeout: Duration::from_secs(settings.link.auth_timeout_secs),
            grace: CALLBACK_GRACE,
        },
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        crate::shutdown_signal().await;
        on_signal.cancel();
    });

    let result = flow
        .run(&cancel, |link| present_link(link, open_browser))
        .await;
    signal.abort();

    let linked = result.context("failed to link account")?;
    crate::display::print_accounts(std::io::stdout(), &linked)?;
    println!(
        "\nAdd a [[jobs]] entry with source_account set to one of the ids above to sync it."
    );

    Ok(())
}

async fn status(settings: Settings) -> Result<()> {
    let sessions = SessionManager::new(client(&settings)?);
    let session = sessions.session().await?;
    let requisitions = sessions.authenticator().requisitions(&session).await?;

    crate::display::print_requisitions(std::io::stdout(), &requisitions)?;

    Ok(())
}

pub(crate) async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("status", _status_matches)) => status(settings).await,
        _ => link(matches, settings).await,
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info, warn};

use crate::core::Job;
use crate::ledger::{self, ynab, Ledger, UploadError};
use crate::normalize::normalize;
use crate::settings::Settings;
use crate::upstream::{
    self, gocardless, Authenticator, RawTransactions, SessionManager, TransactionSource,
};

const WINDOW_DAYS: i64 = 20;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to authenticate with upstream")]
    Login(#[source] upstream::Error),
    #[error("failed to fetch transactions")]
    Fetch(#[source] upstream::Error),
    #[error("rate limited by upstream, reset in {}", display_reset(.reset))]
    RateLimited { reset: Option<Duration> },
    #[error("backing off after rate limit, {}s remaining", .remaining.as_secs())]
    Backoff { remaining: Duration },
    #[error(transparent)]
    Upload(#[from] UploadError),
}

fn display_reset(reset: &Option<Duration>) -> String {
    match reset {
        Some(d) => format!("{}s", d.as_secs()),
        None => "unknown".to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub fetched: usize,
    pub normalized: usize,
    pub created: usize,
    pub duplicates: usize,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: Result<JobSummary, JobError>,
}

/// Window is the inclusive date range requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Window {
    /// The window ends at `now` truncated to the hour and starts
    /// [`WINDOW_DAYS`] before that, truncated to the day. Hour truncation
    /// never moves the calendar date, so both ends reduce to dates.
    pub fn ending_at(now: DateTime<Utc>) -> Self {
        let to = now.date_naive();

        Self {
            from: to - chrono::Duration::days(WINDOW_DAYS),
            to,
        }
    }
}

/// Synchronizer runs the fetch, normalize and upload pipeline per job.
pub struct Synchronizer<S, L> {
    sessions: SessionManager<S>,
    ledger: L,
    backoff: Mutex<HashMap<String, Instant>>,
}

impl<S, L> Synchronizer<S, L>
where
    S: Authenticator + TransactionSource + Send + Sync,
    L: Ledger + Send + Sync,
{
    pub fn new(sessions: SessionManager<S>, ledger: L) -> Self {
        Self {
            sessions,
            ledger,
            backoff: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts every job in order. A failing job never stops the ones
    /// after it.
    pub async fn run_all(&self, jobs: &[Job]) -> Vec<JobOutcome> {
        let window = Window::ending_at(Utc::now());
        info!(from = %window.from, to = %window.to, jobs = jobs.len(), "starting sync");

        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self.sync_job(job, window).await;
            if let Err(err) = &result {
                error!(
                    source_account = %job.source_account,
                    destination_account = %job.destination_account,
                    budget = %job.budget,
                    error = %err,
                    cause = ?std::error::Error::source(err).map(ToString::to_string),
                    "job failed"
                );
            }

            outcomes.push(JobOutcome {
                job: job.clone(),
                result,
            });
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(succeeded = outcomes.len() - failed, failed, "finished sync");

        outcomes
    }

    pub async fn run_one(&self, job: &Job) -> Result<JobSummary, JobError> {
        self.sync_job(job, Window::ending_at(Utc::now())).await
    }

    /// Runs only the jobs reading from `source_account`.
    pub async fn run_account(&self, jobs: &[Job], source_account: &str) -> Vec<JobOutcome> {
        let mut outcomes = vec![];
        for job in jobs.iter().filter(|j| j.source_account == source_account) {
            outcomes.push(JobOutcome {
                job: job.clone(),
                result: self.run_one(job).await,
            });
        }

        outcomes
    }

    #[tracing::instrument(
        skip(self, job, window),
        fields(
            source_account = %job.source_account,
            destination_account = %job.destination_account,
            budget = %job.budget,
        )
    )]
    async fn sync_job(&self, job: &Job, window: Window) -> Result<JobSummary, JobError> {
        if let Some(remaining) = self.backoff_remaining(&job.source_account).await {
            warn!(remaining_secs = remaining.as_secs(), "skipping rate limited account");
            return Err(JobError::Backoff { remaining });
        }

        let raw = self.fetch(&job.source_account, window).await?;
        let fetched = raw.booked.len() + raw.pending.len();

        let txs = normalize(raw);
        let normalized = txs.len();

        let saved = ledger::upload(
            &self.ledger,
            &job.destination_account,
            &job.budget,
            &txs,
        )
        .await?;

        let summary = JobSummary {
            fetched,
            normalized,
            created: saved.transaction_ids.len(),
            duplicates: saved.duplicate_import_ids.len(),
        };
        info!(
            fetched = summary.fetched,
            normalized = summary.normalized,
            created = summary.created,
            duplicates = summary.duplicates,
            "job complete"
        );

        Ok(summary)
    }

    async fn fetch(&self, account_id: &str, window: Window) -> Result<RawTransactions, JobError> {
        let source = self.sessions.authenticator();
        let session = self.sessions.session().await.map_err(JobError::Login)?;

        let result = match source
            .transactions(&session, account_id, window.from, window.to)
            .await
        {
            Err(err) if err.is_unauthorized() => {
                warn!("access token rejected, refreshing session");
                let session = self.sessions.refresh().await.map_err(JobError::Login)?;
                source
                    .transactions(&session, account_id, window.from, window.to)
                    .await
            }
            other => other,
        };

        match result {
            Ok(raw) => Ok(raw),
            Err(upstream::Error::RateLimited { reset }) => {
                if let Some(reset) = reset {
                    self.backoff
                        .lock()
                        .await
                        .insert(account_id.to_string(), Instant::now() + reset);
                }

                Err(JobError::RateLimited { reset })
            }
            Err(err) => Err(JobError::Fetch(err)),
        }
    }

    async fn backoff_remaining(&self, account_id: &str) -> Option<Duration> {
        let mut backoff = self.backoff.lock().await;
        let deadline = *backoff.get(account_id)?;

        let now = Instant::now();
        if deadline <= now {
            backoff.remove(account_id);
            return None;
        }

        Some(deadline - now)
    }
}

fn synchronizer(
    settings: &Settings,
) -> Result<Synchronizer<gocardless::Client, ynab::Client>> {
    let timeout = settings.http_timeout();

    let source = gocardless::Client::new(settings.gocardless.credentials()?, timeout)?
        .with_base_url(&settings.gocardless.base_url);
    let ledger = ynab::Client::new(settings.ynab.token()?, timeout)?
        .with_base_url(&settings.ynab.base_url);

    Ok(Synchronizer::new(SessionManager::new(source), ledger))
}

pub(crate) async fn sync(settings: Settings, source_account: Option<&str>) -> Result<()> {
    let jobs = settings.jobs()?;
    let synchronizer = synchronizer(&settings)?;

    let outcomes = match source_account {
        Some(account) => {
            let outcomes = synchronizer.run_account(&jobs, account).await;
            if outcomes.is_empty() {
                anyhow::bail!("no job reads from source account {}", account);
            }
            outcomes
        }
        None => synchronizer.run_all(&jobs).await,
    };
    crate::display::print_outcomes(std::io::stdout(), &outcomes)?;

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} jobs failed", failed, outcomes.len());
    }

    Ok(())
}

pub(crate) async fn serve(settings: Settings) -> Result<()> {
    let jobs = Arc::new(settings.jobs()?);
    let synchronizer = Arc::new(synchronizer(&settings)?);
    let in_flight = Arc::new(Mutex::new(()));

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let run_lock = in_flight.clone();
    let job = CronJob::new_async(settings.schedule.as_str(), move |_uuid, _l| {
        let synchronizer = synchronizer.clone();
        let jobs = jobs.clone();
        let run_lock = run_lock.clone();

        Box::pin(async move {
            let _running = run_lock.lock().await;
            synchronizer.run_all(&jobs).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", settings.schedule))?;

    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(schedule = %settings.schedule, "waiting for next scheduled sync");

    crate::shutdown_signal().await;

    sched.shutdown().await.context("stopping scheduler")?;
    // Let a run that already started finish its uploads.
    let _running = in_flight.lock().await;
    info!("scheduler stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use axum::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::ledger::{PayloadTransaction, SaveSummary};
    use crate::upstream::gocardless::RawAmount;
    use crate::upstream::{RawTransaction, Session};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn job(n: u32) -> Job {
        Job {
            source_account: format!("acc-{}", n),
            budget: "budget-1".to_string(),
            destination_account: format!("ynab-{}", n),
        }
    }

    fn batch() -> RawTransactions {
        RawTransactions {
            booked: vec![RawTransaction {
                transaction_id: Some("tx1".to_string()),
                value_date: Some("2023-01-01".to_string()),
                transaction_amount: RawAmount {
                    amount: "100.50".to_string(),
                    currency: "EUR".to_string(),
                },
                remittance_information_unstructured: Some("Payment for services".to_string()),
                debtor_name: Some("John Doe".to_string()),
                ..RawTransaction::default()
            }],
            pending: vec![RawTransaction {
                value_date: Some("not a date".to_string()),
                ..RawTransaction::default()
            }],
        }
    }

    #[derive(Default)]
    struct FakeSource {
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        reject_login: bool,
        // Scripted responses per account, a good batch once exhausted.
        script: StdMutex<HashMap<String, VecDeque<upstream::Result<RawTransactions>>>>,
        calls: StdMutex<Vec<(String, String, Window)>>,
    }

    impl FakeSource {
        fn respond(&self, account: &str, result: upstream::Result<RawTransactions>) {
            self.script
                .lock()
                .unwrap()
                .entry(account.to_string())
                .or_default()
                .push_back(result);
        }

        fn calls_for(&self, account: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _, _)| a == account)
                .map(|(_, token, _)| token.clone())
                .collect()
        }

        fn windows(&self) -> Vec<Window> {
            self.calls.lock().unwrap().iter().map(|(_, _, w)| *w).collect()
        }
    }

    #[async_trait]
    impl Authenticator for FakeSource {
        async fn login(&self) -> upstream::Result<Session> {
            if self.reject_login {
                return Err(upstream::Error::Authentication {
                    status: 401,
                    body: "invalid secret".to_string(),
                });
            }

            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Session {
                access: format!("access-{}", n),
                refresh: "refresh".to_string(),
            })
        }

        async fn refresh(&self, session: &Session) -> upstream::Result<Session> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                access: format!("{}-refreshed", session.access),
                refresh: session.refresh.clone(),
            })
        }
    }

    #[async_trait]
    impl TransactionSource for FakeSource {
        async fn transactions(
            &self,
            session: &Session,
            account_id: &str,
            from: NaiveDate,
            to: NaiveDate,
        ) -> upstream::Result<RawTransactions> {
            self.calls.lock().unwrap().push((
                account_id.to_string(),
                session.access.clone(),
                Window { from, to },
            ));

            self.script
                .lock()
                .unwrap()
                .get_mut(account_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(batch()))
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        batches: StdMutex<Vec<(String, Vec<PayloadTransaction>)>>,
        reject: bool,
    }

    #[async_trait]
    impl Ledger for FakeLedger {
        async fn create_transactions(
            &self,
            budget_id: &str,
            transactions: &[PayloadTransaction],
        ) -> Result<SaveSummary, ledger::Error> {
            if self.reject {
                return Err(ledger::Error::Api {
                    status: 404,
                    id: "404.2".to_string(),
                    name: "resource_not_found".to_string(),
                    detail: "Budget not found".to_string(),
                });
            }

            self.batches
                .lock()
                .unwrap()
                .push((budget_id.to_string(), transactions.to_vec()));

            Ok(SaveSummary {
                transaction_ids: vec!["ynab-tx".to_string(); transactions.len()],
                duplicate_import_ids: vec![],
            })
        }
    }

    fn synchronizer(source: FakeSource, ledger: FakeLedger) -> Synchronizer<FakeSource, FakeLedger> {
        Synchronizer::new(SessionManager::new(source), ledger)
    }

    #[test]
    fn window_spans_twenty_days() {
        let tests = vec![
            (
                Utc.with_ymd_and_hms(2023, 1, 21, 13, 45, 10).unwrap(),
                ("2023-01-01", "2023-01-21"),
            ),
            (
                Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap(),
                ("2023-02-09", "2023-03-01"),
            ),
            (
                Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap(),
                ("2024-02-19", "2024-03-10"),
            ),
        ];

        for t in tests {
            assert_eq!(
                Window::ending_at(t.0),
                Window {
                    from: date(t.1 .0),
                    to: date(t.1 .1),
                }
            );
        }
    }

    #[tokio::test]
    async fn failing_job_does_not_stop_others() {
        let source = FakeSource::default();
        source.respond(
            "acc-2",
            Err(upstream::Error::Fetch {
                status: 500,
                headers: vec![],
            }),
        );
        let sync = synchronizer(source, FakeLedger::default());

        let outcomes = sync.run_all(&[job(1), job(2), job(3)]).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &JobSummary {
                fetched: 2,
                normalized: 1,
                created: 1,
                duplicates: 0,
            }
        );
        assert!(matches!(
            outcomes[1].result,
            Err(JobError::Fetch(upstream::Error::Fetch { status: 500, .. }))
        ));
        assert_eq!(outcomes[1].job, job(2));
        assert!(outcomes[2].result.is_ok());

        let batches = sync.ledger.batches.lock().unwrap();
        let accounts: Vec<&str> = batches
            .iter()
            .map(|(_, txs)| txs[0].account_id.as_str())
            .collect();
        assert_eq!(accounts, vec!["ynab-1", "ynab-3"]);
        assert_eq!(
            batches[0].1[0].import_id.as_deref(),
            Some("YNAB:100500:2023-01-01:1")
        );
    }

    #[tokio::test]
    async fn fetches_the_trailing_window() {
        let sync = synchronizer(FakeSource::default(), FakeLedger::default());

        let before = Window::ending_at(Utc::now());
        sync.run_all(&[job(1), job(2)]).await;
        let after = Window::ending_at(Utc::now());

        let windows = sync.sessions.authenticator().windows();
        assert_eq!(windows.len(), 2);
        for window in windows {
            // Tolerates the run straddling midnight.
            assert!(window == before || window == after, "window {:?}", window);
            assert_eq!(window.to - window.from, chrono::Duration::days(20));
        }
    }

    #[tokio::test]
    async fn runs_only_jobs_of_one_account() {
        let sync = synchronizer(FakeSource::default(), FakeLedger::default());
        let shared = Job {
            destination_account: "ynab-9".to_string(),
            ..job(1)
        };

        let outcomes = sync
            .run_account(&[job(1), job(2), shared.clone()], "acc-1")
            .await;

        let ran: Vec<&Job> = outcomes.iter().map(|o| &o.job).collect();
        assert_eq!(ran, vec![&job(1), &shared]);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(sync.sessions.authenticator().calls_for("acc-2").is_empty());
        assert!(sync.run_account(&[job(2)], "acc-1").await.is_empty());
    }

    #[tokio::test]
    async fn logs_in_once_per_synchronizer() {
        let sync = synchronizer(FakeSource::default(), FakeLedger::default());

        sync.run_all(&[job(1), job(2)]).await;
        sync.run_all(&[job(3)]).await;

        assert_eq!(sync.sessions.authenticator().logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_failure_fails_each_job() {
        let sync = synchronizer(
            FakeSource {
                reject_login: true,
                ..FakeSource::default()
            },
            FakeLedger::default(),
        );

        let outcomes = sync.run_all(&[job(1), job(2)]).await;

        for outcome in outcomes {
            assert!(matches!(
                outcome.result,
                Err(JobError::Login(upstream::Error::Authentication { .. }))
            ));
        }
        assert!(sync.ledger.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_fetch_refreshes_and_retries_once() {
        let source = FakeSource::default();
        source.respond(
            "acc-1",
            Err(upstream::Error::Fetch {
                status: 401,
                headers: vec![],
            }),
        );
        let sync = synchronizer(source, FakeLedger::default());

        let summary = sync.run_one(&job(1)).await.unwrap();

        let source = sync.sessions.authenticator();
        assert_eq!(summary.created, 1);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            source.calls_for("acc-1"),
            vec!["access-1", "access-1-refreshed"]
        );
    }

    #[tokio::test]
    async fn second_unauthorized_fetch_fails_job() {
        let source = FakeSource::default();
        for _ in 0..2 {
            source.respond(
                "acc-1",
                Err(upstream::Error::Fetch {
                    status: 401,
                    headers: vec![],
                }),
            );
        }
        let sync = synchronizer(source, FakeLedger::default());

        let err = sync.run_one(&job(1)).await.unwrap_err();

        assert!(matches!(err, JobError::Fetch(ref e) if e.is_unauthorized()));
        assert_eq!(sync.sessions.authenticator().calls_for("acc-1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_account_backs_off_until_reset() {
        let source = FakeSource::default();
        source.respond(
            "acc-1",
            Err(upstream::Error::RateLimited {
                reset: Some(Duration::from_secs(30)),
            }),
        );
        let sync = synchronizer(source, FakeLedger::default());

        let first = sync.run_one(&job(1)).await.unwrap_err();
        assert!(matches!(
            first,
            JobError::RateLimited {
                reset: Some(d)
            } if d == Duration::from_secs(30)
        ));

        tokio::time::advance(Duration::from_secs(10)).await;
        match sync.run_one(&job(1)).await.unwrap_err() {
            JobError::Backoff { remaining } => assert_eq!(remaining, Duration::from_secs(20)),
            other => panic!("expected backoff, got {:?}", other),
        }
        // Other accounts are unaffected.
        assert!(sync.run_one(&job(2)).await.is_ok());
        assert_eq!(sync.sessions.authenticator().calls_for("acc-1").len(), 1);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(sync.run_one(&job(1)).await.is_ok());
        assert_eq!(sync.sessions.authenticator().calls_for("acc-1").len(), 2);
    }

    #[tokio::test]
    async fn unknown_reset_does_not_back_off() {
        let source = FakeSource::default();
        source.respond("acc-1", Err(upstream::Error::RateLimited { reset: None }));
        let sync = synchronizer(source, FakeLedger::default());

        let first = sync.run_one(&job(1)).await.unwrap_err();
        let second = sync.run_one(&job(1)).await;

        assert!(matches!(first, JobError::RateLimited { reset: None }));
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn upload_failure_is_reported() {
        let sync = synchronizer(
            FakeSource::default(),
            FakeLedger {
                reject: true,
                ..FakeLedger::default()
            },
        );

        let err = sync.run_one(&job(1)).await.unwrap_err();

        match err {
            JobError::Upload(err) => {
                assert_eq!(err.budget, "budget-1");
                assert!(err.source.to_string().contains("Budget not found"));
            }
            other => panic!("expected upload error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_fetch_skips_upload() {
        let source = FakeSource::default();
        source.respond("acc-1", Ok(RawTransactions::default()));
        let sync = synchronizer(source, FakeLedger::default());

        let summary = sync.run_one(&job(1)).await.unwrap();

        assert_eq!(summary, JobSummary::default());
        assert!(sync.ledger.batches.lock().unwrap().is_empty());
    }
}

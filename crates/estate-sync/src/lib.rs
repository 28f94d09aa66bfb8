//! Refresh orchestration: paginated fetch, parse, normalize, and reconcile into the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use estate_adapters::{fetch_with_retry, HttpListingSource, ListingParser, ListingSource, ParsedPage};
use estate_core::normalize_fragment;
use estate_storage::{ListingStore, PgListingStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod reconcile;

pub use config::{load_known_cities_csv, AppConfig, RefreshConfig};
pub use reconcile::{ReconcileOutcome, ReconcileSession, Reconciler};

pub const CRATE_NAME: &str = "estate-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Parsing,
    Normalizing,
    Reconciling,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Working stages in the order a run passes through them.
    const STAGES: [RunState; 4] = [Self::Fetching, Self::Parsing, Self::Normalizing, Self::Reconciling];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of one refresh. Every record that did not reach the store is
/// accounted for in one of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub listings_parsed: usize,
    pub listings_skipped: usize,
    pub listings_with_nulls: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_failed: usize,
    pub records_not_attempted: usize,
    pub batches_committed: usize,
    pub batches_dropped: usize,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            pages_fetched: 0,
            pages_failed: 0,
            listings_parsed: 0,
            listings_skipped: 0,
            listings_with_nulls: 0,
            records_inserted: 0,
            records_updated: 0,
            records_failed: 0,
            records_not_attempted: 0,
            batches_committed: 0,
            batches_dropped: 0,
            error: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(run_id = %self.run_id, from = ?self.state, to = ?state, "refresh state change");
        self.state = state;
        self.transitions.push(state);
        if state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Enters every stage between the current one and `target`. Pages stream
    /// through the pipeline, so the state records the furthest stage reached.
    fn advance_to(&mut self, target: RunState) {
        let Some(target_at) = RunState::STAGES.iter().position(|s| *s == target) else {
            return;
        };
        let from = RunState::STAGES
            .iter()
            .position(|s| *s == self.state)
            .map_or(0, |at| at + 1);
        for stage in RunState::STAGES.into_iter().take(target_at + 1).skip(from) {
            self.enter(stage);
        }
    }

    fn fail(mut self, message: String) -> Self {
        warn!(run_id = %self.run_id, error = %message, "refresh failed");
        self.error = Some(message);
        self.enter(RunState::Failed);
        self
    }

    /// Writes `<reports_root>/<run_id>/run_report.json` and returns its path.
    pub async fn write_json(&self, reports_root: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = reports_root.as_ref().join(self.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("run_report.json");
        let bytes = serde_json::to_vec_pretty(self).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RefreshPipeline {
    config: RefreshConfig,
    known_cities: Vec<String>,
    parser: Arc<ListingParser>,
    source: Arc<dyn ListingSource>,
    store: Arc<dyn ListingStore>,
}

impl RefreshPipeline {
    pub fn new(config: RefreshConfig, source: Arc<dyn ListingSource>, store: Arc<dyn ListingStore>) -> Result<Self> {
        let known_cities = config.resolve_known_cities()?;
        let parser = ListingParser::new(&config.selectors).context("compiling listing selectors")?;
        Ok(Self {
            config,
            known_cities,
            parser: Arc::new(parser),
            source,
            store,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> RunReport {
        let report = RunReport::new();
        let span = info_span!("refresh_run", run_id = %report.run_id);
        self.run_inner(report, cancel).instrument(span).await
    }

    async fn run_inner(&self, mut report: RunReport, cancel: CancellationToken) -> RunReport {
        let ping = tokio::time::timeout(self.config.commit_timeout(), self.store.ping()).await;
        match ping {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return report.fail(err.to_string()),
            Err(_) => return report.fail("store did not answer before the commit timeout".to_string()),
        }

        report.enter(RunState::Fetching);
        let reconciler = Reconciler::new(
            Arc::clone(&self.store),
            self.config.batch_size,
            self.config.store_concurrency,
            self.config.commit_timeout(),
        );
        let mut session = reconciler.session();
        let fetch_cancelled = self.ingest_pages(&cancel, &mut report, &mut session).await;
        if !fetch_cancelled {
            report.advance_to(RunState::Reconciling);
        }

        let outcome = session.finish(&cancel).await;
        report.records_inserted = outcome.inserted;
        report.records_updated = outcome.updated;
        report.records_failed = outcome.failed;
        report.records_not_attempted += outcome.not_attempted;
        report.batches_committed = outcome.batches_committed;
        report.batches_dropped = outcome.batches_dropped;

        report.enter(if fetch_cancelled || outcome.cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        });
        info!(
            pages_fetched = report.pages_fetched,
            pages_failed = report.pages_failed,
            listings_parsed = report.listings_parsed,
            inserted = report.records_inserted,
            updated = report.records_updated,
            failed = report.records_failed,
            not_attempted = report.records_not_attempted,
            "refresh finished"
        );
        report
    }

    /// Dispatches pages in index order to at most `concurrency` workers and
    /// streams their listings into `session` in page order.
    ///
    /// Only this loop decides where pagination ends, so an empty page at index
    /// `n` is honored after pages `1..=n` have all been dispatched. Returns
    /// `true` when cancelled; in-flight fetches are aborted and parsed pages
    /// still waiting for their turn are counted as not attempted.
    async fn ingest_pages(
        &self,
        cancel: &CancellationToken,
        report: &mut RunReport,
        session: &mut ReconcileSession<'_>,
    ) -> bool {
        let concurrency = self.config.concurrency.max(1);
        let filter = self.config.source_filter();
        let policy = self.config.backoff();
        let attempt_timeout = self.config.fetch_timeout();
        let observed_at = Utc::now();

        let mut workers = JoinSet::new();
        let mut next_page = 1u32;
        let mut page_cap = self.config.max_pages;
        let mut end_at: Option<u32> = None;
        // Finished pages not yet handed over; `None` marks a failed page.
        let mut ready: BTreeMap<u32, Option<ParsedPage>> = BTreeMap::new();
        let mut next_release = 1u32;

        loop {
            while workers.len() < concurrency
                && next_page <= page_cap
                && end_at.map_or(true, |end| next_page <= end)
            {
                let page_index = next_page;
                let source = Arc::clone(&self.source);
                let parser = Arc::clone(&self.parser);
                let filter = filter.clone();
                workers.spawn(
                    async move {
                        let fetched = fetch_with_retry(source.as_ref(), page_index, &filter, &policy, attempt_timeout).await;
                        (page_index, fetched.map(|page| parser.parse(&page)))
                    }
                    .instrument(info_span!("page", page_index)),
                );
                next_page += 1;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    workers.abort_all();
                    let held = std::mem::take(&mut ready).into_values().flatten().collect::<Vec<_>>();
                    for page in &held {
                        report.listings_skipped += page.skipped.len();
                        report.listings_parsed += page.fragments.len();
                        report.records_not_attempted += page.fragments.len();
                    }
                    info!(in_flight = workers.len(), held_pages = held.len(), "fetch cancelled");
                    return true;
                }
                joined = workers.join_next() => joined,
            };

            match joined {
                None => break,
                Some(Ok((page_index, Ok(parsed)))) => {
                    report.pages_fetched += 1;
                    if page_index == 1 {
                        if let Some(total) = parsed.total_count {
                            let estimated = u32::try_from(total / u64::from(self.config.page_size.max(1)) + 1)
                                .unwrap_or(u32::MAX);
                            if estimated < page_cap {
                                info!(total, estimated, "capping pagination by advertised total");
                                page_cap = estimated;
                            }
                        }
                    }
                    if parsed.is_end_of_results() && page_index >= self.config.min_pages {
                        info!(page_index, "empty page, ending pagination");
                        end_at = Some(end_at.map_or(page_index, |end| end.min(page_index)));
                    }
                    ready.insert(page_index, Some(parsed));
                }
                Some(Ok((page_index, Err(err)))) => {
                    report.pages_failed += 1;
                    warn!(page_index, error = %err, "page failed");
                    ready.insert(page_index, None);
                }
                Some(Err(join_err)) => {
                    report.pages_failed += 1;
                    warn!(error = %join_err, "page worker aborted");
                }
            }

            while let Some(entry) = ready.remove(&next_release) {
                next_release += 1;
                if let Some(page) = entry {
                    self.hand_over(page, observed_at, report, session, cancel).await;
                }
            }
        }

        // A panicked worker leaves a gap in the page order.
        for page in std::mem::take(&mut ready).into_values().flatten() {
            self.hand_over(page, observed_at, report, session, cancel).await;
        }
        false
    }

    /// Parses, normalizes and pushes one page's listings into the session.
    async fn hand_over(
        &self,
        page: ParsedPage,
        observed_at: DateTime<Utc>,
        report: &mut RunReport,
        session: &mut ReconcileSession<'_>,
        cancel: &CancellationToken,
    ) {
        report.advance_to(RunState::Parsing);
        report.listings_skipped += page.skipped.len();
        report.listings_parsed += page.fragments.len();

        report.advance_to(RunState::Normalizing);
        let records = page
            .fragments
            .iter()
            .map(|fragment| normalize_fragment(fragment, &self.known_cities, observed_at))
            .inspect(|normalized| {
                if normalized.has_nulls() {
                    report.listings_with_nulls += 1;
                }
            })
            .map(|normalized| normalized.listing)
            .collect::<Vec<_>>();

        report.advance_to(RunState::Reconciling);
        session.push(records, cancel).await;
    }
}

/// Runs one refresh. Configuration problems surface as a `Failed` report.
pub async fn run_refresh(
    config: RefreshConfig,
    source: Arc<dyn ListingSource>,
    store: Arc<dyn ListingStore>,
    cancel: CancellationToken,
) -> RunReport {
    match RefreshPipeline::new(config, source, store) {
        Ok(pipeline) => pipeline.run(cancel).await,
        Err(err) => RunReport::new().fail(format!("{err:#}")),
    }
}

/// Lazily connected Postgres store with the schema migrated when reachable.
pub async fn connect_store(app: &AppConfig, refresh: &RefreshConfig) -> Result<PgListingStore> {
    let store = PgListingStore::connect_lazy(&app.store_config(refresh))?;
    if let Err(err) = store.migrate().await {
        warn!(error = %err, "schema migration did not run");
    }
    Ok(store)
}

/// Builds the HTTP source and Postgres store from `app` and runs one refresh.
pub async fn run_refresh_with(app: &AppConfig, cancel: CancellationToken) -> Result<RunReport> {
    let refresh = app.refresh_config()?;
    let source = HttpListingSource::new(app.source_config())?;
    let store = connect_store(app, &refresh).await?;
    Ok(run_refresh(refresh, Arc::new(source), Arc::new(store), cancel).await)
}

pub async fn run_refresh_from_env(cancel: CancellationToken) -> Result<RunReport> {
    run_refresh_with(&AppConfig::from_env(), cancel).await
}

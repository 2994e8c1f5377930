use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::browser::BrowserLauncher;
use crate::cli::config::{EngineSettings, ScraperConfig};
use crate::crawler::context::{HttpOnly, ModeContext, Session, SessionLauncher};
use crate::crawler::errors::{EngineError, FailurePolicy, ModeError};
use crate::crawler::scheduler::Throttle;
use crate::crawler::task::{RunPhase, RunReport, RunStats, RunStatus};
use crate::modes::{Document, Handler, ModeDescriptor, ModeRegistry, RegistryError, SchemaError};
use crate::net::{ReqwestTransport, RetryClient, RetryPolicy};
use crate::storage::{check_mode_name, JsonFileStore, ModeOutput, Store};

/// Records and errors collected while the handler runs
#[derive(Default)]
struct Execution {
    records: Vec<Document>,
    fatal: Option<String>,
    last_error: Option<String>,
}

/// Runs modes one record at a time and persists their output
pub struct Engine {
    registry: Arc<ModeRegistry>,
    store: Arc<dyn Store>,
    http: RetryClient,
    launcher: Arc<dyn SessionLauncher>,
    throttle_min: Duration,
    throttle_max: Duration,
    dedupe: bool,
    policy: FailurePolicy,
}

impl Engine {
    /// Engine with default settings and no browser backend
    pub fn new(registry: Arc<ModeRegistry>, store: Arc<dyn Store>, http: RetryClient) -> Self {
        let defaults = EngineSettings::default();
        Self {
            registry,
            store,
            http,
            launcher: Arc::new(HttpOnly),
            throttle_min: Duration::from_millis(defaults.throttle_min_ms),
            throttle_max: Duration::from_millis(defaults.throttle_max_ms),
            dedupe: defaults.dedupe,
            policy: FailurePolicy::default(),
        }
    }

    /// Engine wired to JSON files, reqwest and a WebDriver browser
    pub fn from_config(registry: Arc<ModeRegistry>, config: &ScraperConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config.http)?;
        let http = RetryClient::new(Arc::new(transport), RetryPolicy::from_settings(&config.http));
        let store = Arc::new(JsonFileStore::new(config.engine.output_dir.clone()));

        Ok(Self::new(registry, store, http)
            .with_launcher(BrowserLauncher::new(
                config.browser.clone(),
                config.interceptor.clone(),
            ))
            .with_throttle(
                Duration::from_millis(config.engine.throttle_min_ms),
                Duration::from_millis(config.engine.throttle_max_ms),
            )
            .with_dedupe(config.engine.dedupe)
            .with_policy(FailurePolicy::new(config.engine.fatal_errors.iter().copied())))
    }

    pub fn with_launcher(mut self, launcher: impl SessionLauncher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn with_throttle(mut self, min: Duration, max: Duration) -> Self {
        self.throttle_min = min;
        self.throttle_max = max;
        self
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.registry
    }

    /// Run one mode.
    ///
    /// Every run persists `{mode}.json`, failures included. `Err` is only
    /// returned for configuration errors and when the output cannot be written.
    pub async fn run(&self, name: &str, url_override: Option<&str>) -> Result<RunReport, EngineError> {
        let stats = RunStats::start();
        let mut phase = RunPhase::Init;
        info!(
            "[{}] Starting run {}",
            name,
            stats.run_id.as_deref().unwrap_or_default()
        );

        let descriptor = match self.resolve(name) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!("[{}] {}", name, e);
                // A name that would escape the output directory gets no file at all
                if !matches!(e, RegistryError::InvalidName(_)) {
                    if let Err(persist) = self.abort(name, &mut phase, stats, e.to_string()).await {
                        warn!("[{}] {}", name, persist);
                    }
                }
                return Err(EngineError::Config(e));
            }
        };

        self.transition(name, &mut phase, RunPhase::LoadingInput);
        let inputs = if descriptor.is_producer() {
            if let Some(url) = url_override {
                warn!("[{}] Ignoring --url {} for a producer mode", name, url);
            }
            Vec::new()
        } else {
            match self.load_input(descriptor, url_override).await {
                Ok(inputs) => inputs,
                Err(message) => {
                    error!("[{}] {}", name, message);
                    return self.abort(name, &mut phase, stats, message).await;
                }
            }
        };

        self.transition(name, &mut phase, RunPhase::Running);
        let mut session = match self.launcher.launch(descriptor).await {
            Ok(session) => session,
            Err(e) => {
                error!("[{}] Could not start session: {}", name, e);
                return self.abort(name, &mut phase, stats, e.to_string()).await;
            }
        };

        let mut stats = stats;
        let execution = self.execute(descriptor, &session, inputs, &mut stats).await;
        session.close().await;

        let records = if self.dedupe {
            dedupe(execution.records)
        } else {
            execution.records
        };
        stats.finalize(execution.fatal, execution.last_error);

        if let Some(hook) = descriptor.save_hook() {
            if let Err(e) = hook.save(name, &records).await {
                warn!("[{}] Save hook failed: {:#}", name, e);
            }
        }

        self.finish(name, &mut phase, records, stats).await
    }

    /// Run every ancestor of `name` root-first, then `name` itself.
    ///
    /// Stops after the first stage whose status is `failure`.
    pub async fn run_chain(&self, name: &str) -> Result<Vec<RunReport>, EngineError> {
        let stages: Vec<String> = match self.registry.validate_chain(name) {
            Ok(chain) => chain.iter().map(|d| d.name().to_string()).collect(),
            // Let `run` report and persist the configuration error
            Err(_) => return self.run(name, None).await.map(|report| vec![report]),
        };

        let mut reports = Vec::with_capacity(stages.len());
        for stage in &stages {
            let report = self.run(stage, None).await?;
            let failed = report.stats.status == RunStatus::Failure;
            reports.push(report);

            if failed && stage != name {
                warn!("Stopping chain '{}' after failed stage '{}'", name, stage);
                break;
            }
        }
        Ok(reports)
    }

    fn resolve(&self, name: &str) -> Result<&ModeDescriptor, RegistryError> {
        if check_mode_name(name).is_err() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        let descriptor = self.registry.resolve(name)?;
        self.registry.validate_chain(name)?;
        Ok(descriptor)
    }

    fn transition(&self, name: &str, phase: &mut RunPhase, next: RunPhase) {
        debug!("[{}] {} -> {}", name, phase, next);
        *phase = next;
    }

    /// Input records of a transformer, each already checked against its schema
    async fn load_input(
        &self,
        descriptor: &ModeDescriptor,
        url_override: Option<&str>,
    ) -> Result<Vec<Result<Document, SchemaError>>, String> {
        if let Some(url) = url_override {
            info!("[{}] Using {} as the only input record", descriptor.name(), url);
            return Ok(vec![Ok(Document::new(url))]);
        }

        let Some(input_mode) = descriptor.input_mode() else {
            return Ok(Vec::new());
        };

        let stored = self.store.read(input_mode).await.map_err(|e| {
            format!("cannot load input of mode '{}': {}", descriptor.name(), e)
        })?;

        if let Some(upstream) = &stored.run_stats {
            if upstream.status != RunStatus::Success {
                warn!(
                    "[{}] Input mode '{}' finished with status {}",
                    descriptor.name(),
                    input_mode,
                    upstream.status
                );
            }
        }

        debug!(
            "[{}] Loaded {} input records from '{}'",
            descriptor.name(),
            stored.data.len(),
            input_mode
        );

        let schema = descriptor.schema();
        Ok(stored.data.into_iter().map(|value| schema.validate(value)).collect())
    }

    async fn execute(
        &self,
        descriptor: &ModeDescriptor,
        session: &Session,
        inputs: Vec<Result<Document, SchemaError>>,
        stats: &mut RunStats,
    ) -> Execution {
        let name = descriptor.name();
        let mut execution = Execution::default();

        match descriptor.handler() {
            Handler::Producer(handler) => {
                session.reset_capture().await;
                let mut ctx = ModeContext::new(name, session, &self.http);
                let result = guarded(handler.produce(&mut ctx)).await;
                self.settle(name, "producer", result, stats, &mut execution);
            }
            Handler::Transformer(handler) => {
                let mut throttle = Throttle::new(self.throttle_min, self.throttle_max);
                let total = inputs.len();

                for (index, input) in inputs.into_iter().enumerate() {
                    let record = match input {
                        Ok(record) => record,
                        Err(e) => {
                            stats.record_failure();
                            error!(
                                "[{}] Skipping malformed input record {}/{}: {}",
                                name,
                                index + 1,
                                total,
                                e
                            );
                            execution.last_error = Some(e.to_string());
                            continue;
                        }
                    };

                    throttle.pause().await;
                    session.reset_capture().await;

                    debug!("[{}] Record {}/{}: {}", name, index + 1, total, record.link);
                    let link = record.link.clone();
                    let mut ctx = ModeContext::new(name, session, &self.http);
                    let result = guarded(handler.transform(&mut ctx, record)).await;

                    if !self.settle(name, &link, result, stats, &mut execution) {
                        break;
                    }
                }
            }
        }

        execution
    }

    /// Book the outcome of one invocation; `false` means the run must stop
    fn settle(
        &self,
        name: &str,
        subject: &str,
        result: Result<Vec<Document>, ModeError>,
        stats: &mut RunStats,
        execution: &mut Execution,
    ) -> bool {
        match result {
            Ok(records) => {
                stats.record_success();
                debug!("[{}] {} yielded {} records", name, subject, records.len());
                execution.records.extend(records);
                true
            }
            Err(e) if self.policy.is_fatal(&e) => {
                stats.record_failure();
                error!("[{}] Fatal {} error on {}: {}", name, e.kind(), subject, e);
                execution.fatal = Some(e.to_string());
                false
            }
            Err(e) => {
                stats.record_failure();
                error!("[{}] Failed on {}: {}", name, subject, e);
                execution.last_error = Some(e.to_string());
                true
            }
        }
    }

    /// End the run early with a failure and no records
    async fn abort(
        &self,
        name: &str,
        phase: &mut RunPhase,
        mut stats: RunStats,
        message: String,
    ) -> Result<RunReport, EngineError> {
        stats.finalize(Some(message), None);
        self.finish(name, phase, Vec::new(), stats).await
    }

    async fn finish(
        &self,
        name: &str,
        phase: &mut RunPhase,
        records: Vec<Document>,
        stats: RunStats,
    ) -> Result<RunReport, EngineError> {
        self.transition(name, phase, RunPhase::Finalizing);

        let output = ModeOutput {
            data: records,
            run_stats: stats,
        };
        self.store
            .write(name, &output)
            .await
            .map_err(|source| EngineError::Persist {
                mode: name.to_string(),
                source,
            })?;

        let ModeOutput { data, run_stats } = output;
        self.transition(name, phase, RunPhase::Done(run_stats.status));

        let message = run_stats.message.as_deref().unwrap_or("");
        match run_stats.status {
            RunStatus::Success => info!("[{}] Run succeeded with {} records", name, data.len()),
            RunStatus::Partial => warn!("[{}] Run partially succeeded with {} records: {}", name, data.len(), message),
            RunStatus::Failure => error!("[{}] Run failed: {}", name, message),
        }

        Ok(RunReport {
            mode: name.to_string(),
            records: data.len(),
            stats: run_stats,
        })
    }
}

/// Await one handler invocation, turning a panic into an error for that invocation
async fn guarded<F>(invocation: F) -> Result<Vec<Document>, ModeError>
where
    F: Future<Output = Result<Vec<Document>, ModeError>>,
{
    AssertUnwindSafe(invocation)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ModeError::from_panic(panic)))
}

/// Drop repeated records, keeping the first occurrence
fn dedupe(records: Vec<Document>) -> Vec<Document> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| match serde_json::to_string(record) {
            Ok(key) => seen.insert(key),
            Err(_) => true,
        })
        .collect()
}

//! Drives N sequential page generations against one session.
//!
//! Each run owns a private copy of the session on a dedicated worker thread.
//! Pages are committed in order and persisted one at a time; cancellation is
//! observed only between pages.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mangaloom_contracts::{
    EventWriter, HistoryEntry, Page, PersistenceError, Session, SessionConfig, SessionFieldsUpdate,
    SessionStore,
};
use serde_json::json;
use uuid::Uuid;

use crate::config::{ContinuationPolicy, EngineConfig};
use crate::continuation::{ContinuationRequest, DerivedPrompt, PromptContinuationEngine, PromptSource};
use crate::error::{BatchError, GenerationError};
use crate::providers::{ImageProvider, TextProvider};
use crate::references::{reference_sources, ReferenceResolver};
use crate::renderer::PageRenderer;
use crate::similarity::{closest_match, SimilarityGuard};
use crate::support::{truncate_text, RunEvents};

pub const MAX_BATCH_PAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub session_id: String,
    pub original_prompt: String,
    pub total_pages: usize,
    /// Replaces the stored session config for this run.
    pub config: Option<SessionConfig>,
}

impl BatchRequest {
    pub fn new(
        session_id: impl Into<String>,
        original_prompt: impl Into<String>,
        total_pages: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            original_prompt: original_prompt.into(),
            total_pages,
            config: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    fn validate(&self) -> Result<(), BatchError> {
        if self.session_id.trim().is_empty() {
            return Err(BatchError::InvalidRequest {
                reason: "session id is empty".to_string(),
            });
        }
        if self.original_prompt.trim().is_empty() {
            return Err(BatchError::InvalidRequest {
                reason: "prompt is empty".to_string(),
            });
        }
        if self.total_pages == 0 || self.total_pages > MAX_BATCH_PAGES {
            return Err(BatchError::InvalidRequest {
                reason: format!(
                    "page count must be between 1 and {MAX_BATCH_PAGES} (got {})",
                    self.total_pages
                ),
            });
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a run and its callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CreatingPage(usize),
    PageReady(usize),
    Complete,
    Cancelled,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub phase: Phase,
}

impl Progress {
    pub fn label(&self) -> String {
        match self.phase {
            Phase::CreatingPage(page) => format!("creating page {page}"),
            Phase::PageReady(page) => format!("page {page} ready"),
            Phase::Complete => "complete".to_string(),
            Phase::Cancelled => "cancelled".to_string(),
            Phase::Stopped => "stopped".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { page_index: usize },
    Completed,
    Cancelled,
    FailedFirstPage,
    StoppedPartial,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Running { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceFailure {
    pub page_number: usize,
    pub page_id: String,
    pub operation: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub run_id: String,
    pub session_id: String,
    pub total_pages: usize,
    /// Committed pages in page order.
    pub pages: Vec<Page>,
    /// Batch page numbers whose prompt was accepted after similarity retries ran out.
    pub similarity_exhausted_pages: Vec<usize>,
    pub fallback_prompt_pages: Vec<usize>,
    /// Batch page numbers committed with a prompt too close to an earlier one in the run.
    pub repeated_prompt_pages: Vec<usize>,
    pub persistence_failures: Vec<PersistenceFailure>,
}

impl BatchReport {
    fn new(run_id: &str, session_id: &str, total_pages: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
            total_pages,
            pages: Vec::new(),
            similarity_exhausted_pages: Vec::new(),
            fallback_prompt_pages: Vec::new(),
            repeated_prompt_pages: Vec::new(),
            persistence_failures: Vec::new(),
        }
    }

    pub fn pages_committed(&self) -> usize {
        self.pages.len()
    }

    pub fn prompts(&self) -> Vec<&str> {
        self.pages.iter().map(|page| page.prompt.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// 1-based page within the batch that could not be rendered.
    pub page_number: usize,
    pub error: GenerationError,
}

impl BatchFailure {
    pub fn message(&self, pages_committed: usize) -> String {
        format!(
            "page {} failed: {} ({} page{} kept)",
            self.page_number,
            self.error,
            pages_committed,
            if pages_committed == 1 { "" } else { "s" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed { report: BatchReport },
    Cancelled { report: BatchReport },
    /// A later page failed; earlier pages are kept.
    Partial { failure: BatchFailure, report: BatchReport },
    /// The first page failed; nothing was committed.
    Failed { failure: BatchFailure, report: BatchReport },
}

impl BatchOutcome {
    pub fn report(&self) -> &BatchReport {
        match self {
            Self::Completed { report }
            | Self::Cancelled { report }
            | Self::Partial { report, .. }
            | Self::Failed { report, .. } => report,
        }
    }

    pub fn failure(&self) -> Option<&BatchFailure> {
        match self {
            Self::Partial { failure, .. } | Self::Failed { failure, .. } => Some(failure),
            Self::Completed { .. } | Self::Cancelled { .. } => None,
        }
    }

    pub fn pages_committed(&self) -> usize {
        self.report().pages_committed()
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Partial { .. } => "partial",
            Self::Failed { .. } => "failed",
        }
    }

    /// Human-readable failure line, if the run did not finish cleanly.
    pub fn reason(&self) -> Option<String> {
        self.failure()
            .map(|failure| failure.message(self.pages_committed()))
    }

    fn run_state(&self) -> RunState {
        match self {
            Self::Completed { .. } => RunState::Completed,
            Self::Cancelled { .. } => RunState::Cancelled,
            Self::Partial { .. } => RunState::StoppedPartial,
            Self::Failed { .. } => RunState::FailedFirstPage,
        }
    }
}

pub struct RunHandle {
    run_id: String,
    session_id: String,
    total_pages: usize,
    cancel: CancelToken,
    progress: mpsc::Receiver<Progress>,
    state: Arc<Mutex<RunState>>,
    worker: thread::JoinHandle<BatchOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Requests a stop. The page currently rendering still finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> &mpsc::Receiver<Progress> {
        &self.progress
    }

    pub fn state(&self) -> RunState {
        read_state(&self.state)
    }

    /// Blocks until the run ends.
    pub fn wait(self) -> BatchOutcome {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(run_id = %self.run_id, "batch worker panicked");
                BatchOutcome::Failed {
                    failure: BatchFailure {
                        page_number: 0,
                        error: GenerationError::Fatal {
                            reason: "batch worker panicked".to_string(),
                        },
                    },
                    report: BatchReport::new(&self.run_id, &self.session_id, self.total_pages),
                }
            }
        }
    }
}

/// Marks a session busy for as long as it is alive.
struct ActiveRunGuard {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl ActiveRunGuard {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, session_id: &str) -> Result<Self, BatchError> {
        let mut sessions = active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !sessions.insert(session_id.to_string()) {
            return Err(BatchError::AlreadyRunning {
                session_id: session_id.to_string(),
            });
        }
        Ok(Self {
            active: Arc::clone(active),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        let mut sessions = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.remove(&self.session_id);
    }
}

pub struct BatchOrchestrator {
    store: Arc<dyn SessionStore>,
    continuation: Arc<PromptContinuationEngine>,
    renderer: Arc<PageRenderer>,
    resolver: ReferenceResolver,
    guard: SimilarityGuard,
    render_window: usize,
    max_uploaded: usize,
    continuation_policy: ContinuationPolicy,
    event_log: Option<PathBuf>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        continuation: PromptContinuationEngine,
        renderer: PageRenderer,
        resolver: ReferenceResolver,
    ) -> Self {
        let defaults = EngineConfig::default();
        Self {
            store,
            continuation: Arc::new(continuation),
            renderer: Arc::new(renderer),
            resolver,
            guard: SimilarityGuard::new(defaults.similarity.threshold),
            render_window: defaults.references.render_window,
            max_uploaded: defaults.references.max_uploaded,
            continuation_policy: defaults.continuation_policy,
            event_log: None,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Wires the full engine from configuration and two providers.
    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn SessionStore>,
        text: Arc<dyn TextProvider>,
        image: Arc<dyn ImageProvider>,
    ) -> Self {
        let resolver =
            ReferenceResolver::http(Duration::from_secs(config.references.fetch_timeout_s));
        let continuation =
            PromptContinuationEngine::from_config(config, Arc::clone(&text), resolver.clone());
        let mut renderer = PageRenderer::from_config(config, image);
        if config.smart_policy_rewrite {
            renderer = renderer.with_smart_rewriter(text, config.providers.text_model.clone());
        }
        Self::new(store, continuation, renderer, resolver)
            .with_reference_limits(config.references.render_window, config.references.max_uploaded)
            .with_continuation_policy(config.continuation_policy)
            .with_similarity_guard(SimilarityGuard::new(config.similarity.threshold))
    }

    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = Some(path.into());
        self
    }

    pub fn with_continuation_policy(mut self, policy: ContinuationPolicy) -> Self {
        self.continuation_policy = policy;
        self
    }

    /// Guard used to flag committed prompts that repeat an earlier page of the run.
    pub fn with_similarity_guard(mut self, guard: SimilarityGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_reference_limits(mut self, render_window: usize, max_uploaded: usize) -> Self {
        self.render_window = render_window;
        self.max_uploaded = max_uploaded;
        self
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .map(|sessions| sessions.contains(session_id))
            .unwrap_or(false)
    }

    /// Starts a run on its own thread. A second run for a busy session is rejected.
    pub fn start_batch(&self, request: BatchRequest) -> Result<RunHandle, BatchError> {
        request.validate()?;
        let guard = ActiveRunGuard::acquire(&self.active, &request.session_id)?;
        let mut session = self.store.load_session(&request.session_id)?;
        if let Some(config) = request.config.clone() {
            session.config = config;
        }

        let run_id = new_run_id();
        let events = RunEvents::new(self.event_log.as_ref().map(|path| {
            EventWriter::new(path.clone(), run_id.clone()).for_session(request.session_id.clone())
        }));
        let cancel = CancelToken::new();
        let state = Arc::new(Mutex::new(RunState::Idle));
        let (progress_tx, progress_rx) = mpsc::channel();

        let worker = BatchWorker {
            run_id: run_id.clone(),
            request: request.clone(),
            session,
            store: Arc::clone(&self.store),
            continuation: Arc::clone(&self.continuation),
            renderer: Arc::clone(&self.renderer),
            resolver: self.resolver.clone(),
            guard: self.guard,
            render_window: self.render_window,
            max_uploaded: self.max_uploaded,
            continuation_policy: self.continuation_policy,
            events,
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            progress: progress_tx,
            _guard: guard,
        };
        let handle = thread::Builder::new()
            .name(format!("mangaloom-batch-{}", short_label(&request.session_id)))
            .spawn(move || worker.run())
            .map_err(BatchError::Spawn)?;

        tracing::info!(
            %run_id,
            session_id = %request.session_id,
            total_pages = request.total_pages,
            "batch started"
        );
        Ok(RunHandle {
            run_id,
            session_id: request.session_id,
            total_pages: request.total_pages,
            cancel,
            progress: progress_rx,
            state,
            worker: handle,
        })
    }
}

struct BatchWorker {
    run_id: String,
    request: BatchRequest,
    session: Session,
    store: Arc<dyn SessionStore>,
    continuation: Arc<PromptContinuationEngine>,
    renderer: Arc<PageRenderer>,
    resolver: ReferenceResolver,
    guard: SimilarityGuard,
    render_window: usize,
    max_uploaded: usize,
    continuation_policy: ContinuationPolicy,
    events: RunEvents,
    cancel: CancelToken,
    state: Arc<Mutex<RunState>>,
    progress: mpsc::Sender<Progress>,
    _guard: ActiveRunGuard,
}

impl BatchWorker {
    fn run(mut self) -> BatchOutcome {
        let outcome = self.run_pages();
        self.set_state(outcome.run_state());
        let report = outcome.report();
        let phase = match &outcome {
            BatchOutcome::Completed { .. } => Phase::Complete,
            BatchOutcome::Cancelled { .. } => Phase::Cancelled,
            BatchOutcome::Partial { .. } | BatchOutcome::Failed { .. } => Phase::Stopped,
        };
        self.send_progress(report.pages_committed(), phase);
        self.events.emit(
            "batch_finished",
            json!({
                "status": outcome.status(),
                "requested_pages": self.request.total_pages,
                "committed_pages": report.pages_committed(),
                "reason": outcome.reason(),
                "similarity_exhausted_pages": report.similarity_exhausted_pages,
                "fallback_prompt_pages": report.fallback_prompt_pages,
                "repeated_prompt_pages": report.repeated_prompt_pages,
                "persistence_failures": report.persistence_failures.len(),
            }),
        );
        tracing::info!(
            run_id = %self.run_id,
            status = outcome.status(),
            committed = report.pages_committed(),
            "batch finished"
        );
        outcome
    }

    fn run_pages(&mut self) -> BatchOutcome {
        let total_pages = self.request.total_pages;
        let mut report = BatchReport::new(&self.run_id, &self.request.session_id, total_pages);
        let mut prompts_used: Vec<String> = Vec::new();
        let had_history = !self.session.pages.is_empty();

        self.events.emit(
            "batch_started",
            json!({
                "original_prompt": self.request.original_prompt,
                "total_pages": total_pages,
                "existing_pages": self.session.pages.len(),
                "continuation_policy": self.continuation_policy,
            }),
        );

        for page_index in 0..total_pages {
            if self.cancel.is_cancelled() {
                tracing::info!(run_id = %self.run_id, page_index, "batch cancelled");
                return BatchOutcome::Cancelled { report };
            }
            let page_number = page_index + 1;
            self.set_state(RunState::Running { page_index });
            self.send_progress(page_index, Phase::CreatingPage(page_number));

            let derived = if page_index == 0 {
                self.first_prompt(had_history)
            } else {
                let request = ContinuationRequest {
                    session: &self.session,
                    original_intent: &self.request.original_prompt,
                    page_number,
                    total_pages,
                    config: &self.session.config,
                    prompts_used: &prompts_used,
                };
                self.continuation.derive_or_fallback(&request, &self.events)
            };
            self.events.emit(
                "page_prompt_derived",
                json!({
                    "page_number": page_number,
                    "source": derived.source.as_str(),
                    "similarity_retries": derived.similarity_retries,
                    "similarity_exhausted": derived.similarity_exhausted,
                    "prompt": truncate_text(&derived.prompt, 600),
                }),
            );
            if derived.similarity_exhausted {
                report.similarity_exhausted_pages.push(page_number);
            }
            if derived.source == PromptSource::Fallback {
                report.fallback_prompt_pages.push(page_number);
            }

            let sources = reference_sources(&self.session, self.render_window, self.max_uploaded);
            let resolved = self
                .resolver
                .resolve_with_report(&sources, self.render_window + self.max_uploaded);
            resolved.emit_skipped(&self.events, page_number);

            let rendered = self.renderer.render_avoiding(
                &derived.prompt,
                &self.session.config.render,
                &resolved.encoded(),
                &prompts_used,
                page_number,
                &self.events,
            );
            let rendered = match rendered {
                Ok(rendered) => rendered,
                Err(error) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        page_number,
                        ladder = ?error.ladder(),
                        error = %error,
                        "page failed"
                    );
                    self.events.emit(
                        "page_failed",
                        json!({
                            "page_number": page_number,
                            "ladder": error.ladder().map(|ladder| ladder.to_string()),
                            "reason": error.reason(),
                            "committed_pages": report.pages_committed(),
                        }),
                    );
                    let failure = BatchFailure { page_number, error };
                    return if page_index == 0 {
                        BatchOutcome::Failed { failure, report }
                    } else {
                        BatchOutcome::Partial { failure, report }
                    };
                }
            };

            if self.guard.is_too_similar(&rendered.prompt, &prompts_used) {
                self.flag_repeat(page_number, &rendered.prompt, &prompts_used);
                report.repeated_prompt_pages.push(page_number);
            }

            let page = Page::new(
                rendered.prompt.clone(),
                rendered.image.data_url(),
                self.session.config.render.clone(),
            );
            self.session.commit_page(page.clone());
            prompts_used.push(rendered.prompt.clone());
            self.persist(page_number, &page, &mut report);
            self.events.emit(
                "page_committed",
                json!({
                    "page_number": page_number,
                    "page_id": page.id,
                    "session_page_count": self.session.pages.len(),
                    "attempts": rendered.attempts.len(),
                    "policy_rewrites": rendered.policy_rewrites,
                    "prompt": truncate_text(&rendered.prompt, 600),
                }),
            );
            report.pages.push(page);
            self.send_progress(page_number, Phase::PageReady(page_number));
        }
        BatchOutcome::Completed { report }
    }

    fn first_prompt(&self, had_history: bool) -> DerivedPrompt {
        let intent = self.request.original_prompt.trim();
        let continue_story = self
            .continuation_policy
            .should_continue(had_history, self.session.config.auto_continue);
        let prompt = if continue_story {
            continuation_seed(intent, self.session.pages.len())
        } else {
            intent.to_string()
        };
        DerivedPrompt {
            prompt,
            source: PromptSource::Generated,
            similarity_retries: 0,
            similarity_exhausted: false,
        }
    }

    fn flag_repeat(&self, page_number: usize, prompt: &str, prompts_used: &[String]) {
        let closest = closest_match(prompt, prompts_used);
        let closest_page = closest.map(|(idx, _)| idx + 1);
        let score = closest.map(|(_, score)| score).unwrap_or(0.0);
        tracing::warn!(
            run_id = %self.run_id,
            page_number,
            closest_page,
            score,
            "committed prompt repeats an earlier page"
        );
        self.events.emit(
            "prompt_repeated",
            json!({
                "page_number": page_number,
                "closest_page": closest_page,
                "score": score,
                "threshold": self.guard.threshold(),
                "prompt": truncate_text(prompt, 600),
            }),
        );
    }

    /// Persists one committed page. Failures are recorded, never rolled back.
    fn persist(&self, page_number: usize, page: &Page, report: &mut BatchReport) {
        let session_id = &self.request.session_id;
        let appended = self.store.append_page(session_id, page);
        self.record_persistence(page_number, page, "append_page", appended, report);

        let update = SessionFieldsUpdate {
            context: None,
            history: vec![HistoryEntry::system(format!(
                "Batch {}: page {page_number}/{} committed. {}",
                self.run_id,
                self.request.total_pages,
                truncate_text(&page.prompt, 200)
            ))],
        };
        let updated = self.store.update_session_fields(session_id, &update);
        self.record_persistence(page_number, page, "update_session_fields", updated, report);
    }

    fn record_persistence(
        &self,
        page_number: usize,
        page: &Page,
        operation: &'static str,
        result: Result<(), PersistenceError>,
        report: &mut BatchReport,
    ) {
        let Err(err) = result else {
            return;
        };
        tracing::warn!(
            run_id = %self.run_id,
            page_number,
            operation,
            error = %err,
            "failed to persist committed page"
        );
        self.events.emit(
            "persistence_failed",
            json!({
                "page_number": page_number,
                "page_id": page.id,
                "operation": operation,
                "error": err.to_string(),
            }),
        );
        report.persistence_failures.push(PersistenceFailure {
            page_number,
            page_id: page.id.clone(),
            operation,
            error: err.to_string(),
        });
    }

    fn set_state(&self, next: RunState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = next;
    }

    fn send_progress(&self, current: usize, phase: Phase) {
        // nobody listening is fine
        let _ = self.progress.send(Progress {
            current,
            total: self.request.total_pages,
            phase,
        });
    }
}

/// First-page prompt when the batch picks up an existing story.
pub fn continuation_seed(intent: &str, previous_page: usize) -> String {
    format!("Continue the story from page {previous_page}: {}", intent.trim())
}

fn read_state(state: &Mutex<RunState>) -> RunState {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run-{}", &id[..12])
}

fn short_label(session_id: &str) -> String {
    session_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-')
        .take(24)
        .collect()
}

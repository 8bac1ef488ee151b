use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use mangaloom_contracts::{
    write_batch_summary, BatchSummary, FileSessionStore, PersistenceError, Session, SessionStore,
    UploadedReference,
};
use mangaloom_engine::{
    BatchOrchestrator, BatchOutcome, BatchRequest, CancelToken, DryrunImageProvider,
    DryrunTextProvider, EngineConfig, GeminiClient, GeminiImageProvider, GeminiTextProvider,
    ImageProvider, TextProvider, MAX_BATCH_PAGES,
};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mangaloom", version, about = "Batch manga page generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a session file.
    Init(InitArgs),
    /// Generate pages for a session.
    Batch(BatchArgs),
    /// List a session's pages.
    Show(ShowArgs),
}

#[derive(Debug, Parser)]
struct InitArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    session: String,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    context_file: Option<PathBuf>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    layout: Option<String>,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    color_mode: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    direction: Option<String>,
    /// Uploaded reference image (path or URL); repeatable.
    #[arg(long = "reference")]
    references: Vec<String>,
    #[arg(long)]
    no_auto_continue: bool,
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    session: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 3)]
    pages: usize,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    summary: Option<PathBuf>,
    /// Use offline providers instead of Gemini.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    session: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mangaloom error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => run_init(args),
        Command::Batch(args) => run_batch(args),
        Command::Show(args) => run_show(args),
    }
}

fn run_init(args: InitArgs) -> Result<i32> {
    let store = FileSessionStore::new(&args.store);
    match store.load_session(&args.session) {
        Ok(_) if !args.force => bail!(
            "session '{}' already exists in {} (use --force to overwrite)",
            args.session,
            args.store.display()
        ),
        Ok(_) | Err(PersistenceError::NotFound { .. }) => {}
        Err(err) if args.force => {
            tracing::warn!(error = %err, "overwriting unreadable session file");
        }
        Err(err) => return Err(err.into()),
    }
    let session = build_session(&args)?;
    store.save_session(&session)?;
    println!(
        "Created session {} at {}",
        session.id,
        store.session_path(&session.id).display()
    );
    Ok(0)
}

fn build_session(args: &InitArgs) -> Result<Session> {
    let mut session = Session::new(args.session.trim());
    if session.id.is_empty() {
        bail!("session id is empty");
    }
    session.title = args.title.clone();
    session.context = match (&args.context, &args.context_file) {
        (Some(_), Some(_)) => bail!("pass either --context or --context-file, not both"),
        (Some(text), None) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        (None, None) => String::new(),
    };

    let render = &mut session.config.render;
    let overrides = [
        (&mut render.style, &args.style),
        (&mut render.layout, &args.layout),
        (&mut render.language, &args.language),
        (&mut render.color_mode, &args.color_mode),
        (&mut render.aspect_ratio, &args.aspect_ratio),
    ];
    for (field, value) in overrides {
        if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            *field = value.to_string();
        }
    }
    session.config.story_direction = args
        .direction
        .as_deref()
        .map(str::trim)
        .filter(|direction| !direction.is_empty())
        .map(str::to_string);
    session.config.auto_continue = !args.no_auto_continue;
    session.config.reference_images = args
        .references
        .iter()
        .enumerate()
        .map(|(idx, raw)| uploaded_reference(idx, raw))
        .collect();
    Ok(session)
}

fn uploaded_reference(idx: usize, raw: &str) -> UploadedReference {
    let raw = raw.trim();
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(raw)
        .to_string();
    UploadedReference {
        id: format!("ref-{}", idx + 1),
        name,
        url: raw.to_string(),
        enabled: true,
    }
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    if args.pages == 0 || args.pages > MAX_BATCH_PAGES {
        bail!("--pages must be between 1 and {MAX_BATCH_PAGES}");
    }
    let config = EngineConfig::load(args.config.as_deref())?;
    let (text, image) = providers(args.dryrun)?;
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(&args.store));
    let run_dir = args.store.join("runs").join(&args.session);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| run_dir.join("events.jsonl"));
    if let Some(parent) = events_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    let summary_path = args
        .summary
        .clone()
        .unwrap_or_else(|| run_dir.join("batch_summary.json"));

    let orchestrator =
        BatchOrchestrator::from_config(&config, store, text, image).with_event_log(&events_path);
    let started_at = now_utc_iso();
    let handle =
        orchestrator.start_batch(BatchRequest::new(&args.session, &args.prompt, args.pages))?;
    println!(
        "Run {} started for session {} ({} pages). Type /cancel to stop after the current page.",
        handle.run_id(),
        args.session,
        args.pages
    );
    watch_stdin_for_cancel(handle.cancel_token());

    for progress in handle.progress().iter() {
        println!("[{}/{}] {}", progress.current, progress.total, progress.label());
    }
    let outcome = handle.wait();
    print_outcome(&outcome);

    let summary = batch_summary(&outcome, args.pages, started_at, now_utc_iso());
    let mut extra = Map::new();
    extra.insert(
        "events_path".to_string(),
        Value::String(events_path.to_string_lossy().to_string()),
    );
    extra.insert(
        "similarity_exhausted_pages".to_string(),
        json!(outcome.report().similarity_exhausted_pages),
    );
    extra.insert(
        "repeated_prompt_pages".to_string(),
        json!(outcome.report().repeated_prompt_pages),
    );
    extra.insert(
        "persistence_failures".to_string(),
        json!(outcome.report().persistence_failures.len()),
    );
    write_batch_summary(&summary_path, &summary, Some(&extra))?;
    println!("Summary written to {}", summary_path.display());
    Ok(exit_code(&outcome))
}

fn providers(dryrun: bool) -> Result<(Arc<dyn TextProvider>, Arc<dyn ImageProvider>)> {
    if dryrun {
        return Ok((
            Arc::new(DryrunTextProvider::new()),
            Arc::new(DryrunImageProvider::new()),
        ));
    }
    let client = GeminiClient::from_env().context("Gemini provider unavailable (try --dryrun)")?;
    Ok((
        Arc::new(GeminiTextProvider::new(client.clone())),
        Arc::new(GeminiImageProvider::new(client)),
    ))
}

fn watch_stdin_for_cancel(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("mangaloom-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if is_cancel_command(&line) {
                    token.cancel();
                    println!("Cancel requested; finishing the current page.");
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "stdin watcher unavailable; cancellation disabled");
    }
}

fn is_cancel_command(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "/cancel" | "cancel" | "/stop" | "stop"
    )
}

fn print_outcome(outcome: &BatchOutcome) {
    let report = outcome.report();
    println!(
        "Batch {}: {} of {} pages committed.",
        outcome.status(),
        report.pages_committed(),
        report.total_pages
    );
    if let Some(reason) = outcome.reason() {
        println!("Reason: {reason}");
    }
    if !report.similarity_exhausted_pages.is_empty() {
        println!(
            "Pages accepted despite similarity to earlier pages: {:?}",
            report.similarity_exhausted_pages
        );
    }
    if !report.repeated_prompt_pages.is_empty() {
        println!(
            "Pages committed with a prompt repeating an earlier page: {:?}",
            report.repeated_prompt_pages
        );
    }
    for failure in &report.persistence_failures {
        println!(
            "Page {} was generated but {} failed: {}",
            failure.page_number, failure.operation, failure.error
        );
    }
}

fn batch_summary(
    outcome: &BatchOutcome,
    requested_pages: usize,
    started_at: String,
    finished_at: String,
) -> BatchSummary {
    let report = outcome.report();
    BatchSummary {
        run_id: report.run_id.clone(),
        session_id: report.session_id.clone(),
        started_at,
        finished_at,
        requested_pages: requested_pages as u64,
        committed_pages: report.pages_committed() as u64,
        status: outcome.status().to_string(),
        reason: outcome.reason(),
        page_ids: report.pages.iter().map(|page| page.id.clone()).collect(),
    }
}

fn exit_code(outcome: &BatchOutcome) -> i32 {
    match outcome {
        BatchOutcome::Completed { .. } | BatchOutcome::Cancelled { .. } => 0,
        BatchOutcome::Partial { .. } => 2,
        BatchOutcome::Failed { .. } => 1,
    }
}

fn run_show(args: ShowArgs) -> Result<i32> {
    let store = FileSessionStore::new(&args.store);
    let session = store.load_session(&args.session)?;
    print!("{}", describe_session(&session, store.root()));
    Ok(0)
}

fn describe_session(session: &Session, store_root: &Path) -> String {
    let mut out = String::new();
    let title = if session.title.is_empty() {
        "(untitled)"
    } else {
        session.title.as_str()
    };
    out.push_str(&format!(
        "{} {title} [{}] {} page(s), store {}\n",
        session.id,
        session.config.render.style,
        session.pages.len(),
        store_root.display()
    ));
    for (idx, page) in session.pages.iter().enumerate() {
        let marker = if page.marked_for_export { "*" } else { " " };
        out.push_str(&format!(
            "{marker}{:>3}. {} {} {}\n",
            idx + 1,
            page.id.chars().take(8).collect::<String>(),
            page.timestamp,
            one_line(&page.prompt, 96)
        ));
    }
    out
}

fn one_line(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    collapsed.chars().take(max_chars).collect::<String>() + "…"
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mirage_contracts::{
    parse_intent, EventWriter, GenerationMode, RoutedAction, SessionSignal, UploadedFile,
    UserIntent, ViewState, INTENT_HELP,
};
use mirage_engine::{
    timestamp_millis, DryRunBackend, HttpBackend, ImageBackend, Orchestrator, PollOutcome,
    PollStep, Sampler, SchedulerConfig, SessionContext, SessionRefreshScheduler, POLL_INTERVAL,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "mirage", version, about = "Mirage image generation client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive studio: drive the generation session with slash commands
    Studio(StudioArgs),
    /// One-shot generation from the command line
    Generate(GenerateArgs),
    /// Reuse an example image as a starting point
    Recreate(RecreateArgs),
    /// Show an example strip for a mode
    Examples(ExamplesArgs),
    /// List generated artifacts for a mode
    History(HistoryArgs),
    /// Delete a generated artifact
    Delete(DeleteArgs),
    /// Show the current credit balance
    Credits(CreditsArgs),
}

#[derive(Debug, Parser)]
struct BackendArgs {
    /// Backend to talk to: dryrun or http
    #[arg(long, default_value = "dryrun")]
    backend: String,
    /// Starting credit balance for the dry-run backend
    #[arg(long, default_value_t = 100)]
    credits: u64,
    /// Output directory for dry-run artifacts
    #[arg(long, default_value = "mirage-out")]
    out: PathBuf,
    /// Append session events to this JSONL file
    #[arg(long)]
    events: Option<PathBuf>,
    /// Seed for example sampling (deterministic strips)
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Parser)]
struct StudioArgs {
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, default_value = "1:1")]
    ratio: String,
    #[arg(long)]
    public: bool,
    /// Attach an image and generate in image-to-image mode
    #[arg(long)]
    file: Option<PathBuf>,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct RecreateArgs {
    /// Example artifact id
    #[arg(long)]
    example: String,
    #[arg(long, default_value = "text")]
    mode: String,
    /// Submit a job right after preparing the form
    #[arg(long)]
    generate: bool,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct ExamplesArgs {
    #[arg(long, default_value = "text")]
    mode: String,
    #[arg(long, default_value_t = 8)]
    count: usize,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long, default_value = "text")]
    mode: String,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "text")]
    mode: String,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct CreditsArgs {
    #[command(flatten)]
    backend: BackendArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mirage error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Studio(args) => run_studio(args),
        Command::Generate(args) => run_generate(args),
        Command::Recreate(args) => run_recreate(args),
        Command::Examples(args) => run_examples(args),
        Command::History(args) => run_history(args),
        Command::Delete(args) => run_delete(args),
        Command::Credits(args) => run_credits(args),
    }
}

struct Session {
    backend: Arc<dyn ImageBackend>,
    orchestrator: Orchestrator,
    actions: mpsc::Receiver<RoutedAction>,
    events: EventWriter,
    poll_pace: Duration,
}

fn build_session(args: &BackendArgs) -> Result<Session> {
    let session_id = format!("sess-{}", Uuid::new_v4());
    let events = match &args.events {
        Some(path) => EventWriter::new(path, &session_id),
        None => EventWriter::sink(&session_id),
    };

    let (backend, poll_pace): (Arc<dyn ImageBackend>, Duration) =
        match args.backend.trim().to_ascii_lowercase().as_str() {
            "dryrun" => (
                Arc::new(DryRunBackend::new(args.credits).with_out_dir(&args.out)),
                Duration::from_millis(200),
            ),
            "http" => (Arc::new(HttpBackend::from_env()), POLL_INTERVAL),
            other => bail!("unknown backend '{other}' (expected dryrun or http)"),
        };

    let sampler = match args.seed {
        Some(seed) => Sampler::new(seed),
        None => Sampler::from_clock(),
    };
    let ctx = SessionContext::new(events.clone(), sampler);
    let (action_tx, action_rx) = mpsc::channel();
    let mut orchestrator = Orchestrator::new(ctx, action_tx);
    orchestrator.refresh_credits(backend.as_ref());

    Ok(Session {
        backend,
        orchestrator,
        actions: action_rx,
        events,
        poll_pace,
    })
}

fn parse_mode(value: &str) -> Result<GenerationMode> {
    GenerationMode::parse(value)
        .ok_or_else(|| anyhow::anyhow!("unknown mode '{value}' (expected text or image)"))
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut session = build_session(&args.backend)?;
    let backend = Arc::clone(&session.backend);
    let orch = &mut session.orchestrator;

    if let Some(path) = &args.file {
        orch.set_mode(GenerationMode::Image, backend.as_ref());
        orch.set_uploaded_file(Some(read_upload(path)?));
    } else {
        let prompt = args
            .prompt
            .as_deref()
            .context("--prompt is required unless --file is given")?;
        let ratio = mirage_contracts::normalize_ratio(&args.ratio)
            .with_context(|| format!("unsupported ratio '{}'", args.ratio))?;
        orch.set_prompt(prompt);
        orch.set_ratio(ratio);
    }
    orch.set_public(args.public);

    if !orch.generate(backend.as_ref()) {
        drain_actions(&session.actions);
        if let Some(message) = orch.view().error_message {
            eprintln!("{message}");
        }
        return Ok(1);
    }

    let outcome = wait_for_job(orch, backend.as_ref(), session.poll_pace);
    drain_actions(&session.actions);
    match outcome {
        Some(PollOutcome::Completed { .. }) => {
            let view = orch.view();
            if let Some(id) = &view.selected_artifact_id {
                if let Some(artifact) = orch.history(orch.active_mode()).get(id) {
                    println!("done: {}", artifact_row(artifact));
                }
            }
            println!("credits remaining: {}", view.credit_balance);
            Ok(0)
        }
        _ => {
            if let Some(message) = orch.view().error_message {
                eprintln!("{message}");
            }
            Ok(1)
        }
    }
}

fn run_recreate(args: RecreateArgs) -> Result<i32> {
    let mode = parse_mode(&args.mode)?;
    let mut session = build_session(&args.backend)?;
    let backend = Arc::clone(&session.backend);
    let orch = &mut session.orchestrator;

    orch.set_mode(mode, backend.as_ref());
    orch.example_strip(backend.as_ref(), 8);
    orch.recreate_from_example(backend.as_ref(), &args.example);

    let view = orch.view();
    if let Some(message) = &view.error_message {
        eprintln!("{message}");
        return Ok(1);
    }
    match mode {
        GenerationMode::Text => println!("prompt prepared: {}", view.prompt),
        GenerationMode::Image => {
            if let Some(meta) = &view.uploaded_file {
                println!("attached: {} ({} bytes)", meta.name, meta.size_bytes);
            }
        }
    }

    if !args.generate {
        return Ok(0);
    }
    if !orch.generate(backend.as_ref()) {
        drain_actions(&session.actions);
        if let Some(message) = orch.view().error_message {
            eprintln!("{message}");
        }
        return Ok(1);
    }
    let outcome = wait_for_job(orch, backend.as_ref(), session.poll_pace);
    drain_actions(&session.actions);
    match outcome {
        Some(PollOutcome::Completed { .. }) => Ok(0),
        _ => Ok(1),
    }
}

fn run_examples(args: ExamplesArgs) -> Result<i32> {
    let mode = parse_mode(&args.mode)?;
    let mut session = build_session(&args.backend)?;
    let backend = Arc::clone(&session.backend);
    let orch = &mut session.orchestrator;

    orch.set_mode(mode, backend.as_ref());
    let strip = orch.example_strip(backend.as_ref(), args.count);
    if strip.is_empty() {
        println!("no examples available");
        return Ok(0);
    }
    for example in strip {
        println!("{}  {}", example.id, example.descriptor);
    }
    Ok(0)
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let mode = parse_mode(&args.mode)?;
    let mut session = build_session(&args.backend)?;
    let backend = Arc::clone(&session.backend);
    session.orchestrator.refresh_history(backend.as_ref(), mode);

    let history = session.orchestrator.history(mode);
    if history.artifacts().is_empty() {
        println!("no artifacts yet");
        return Ok(0);
    }
    for artifact in history.artifacts() {
        println!("{}", artifact_row(artifact));
    }
    Ok(0)
}

fn run_delete(args: DeleteArgs) -> Result<i32> {
    let mode = parse_mode(&args.mode)?;
    let mut session = build_session(&args.backend)?;
    let backend = Arc::clone(&session.backend);
    let orch = &mut session.orchestrator;

    orch.set_mode(mode, backend.as_ref());
    orch.refresh_history(backend.as_ref(), mode);
    if orch.delete_artifact(backend.as_ref(), &args.id) {
        println!("deleted {}", args.id);
        Ok(0)
    } else {
        match orch.view().error_message {
            Some(message) => eprintln!("{message}"),
            None => eprintln!("no artifact {}", args.id),
        }
        Ok(1)
    }
}

fn run_credits(args: CreditsArgs) -> Result<i32> {
    let session = build_session(&args.backend)?;
    let view = session.orchestrator.view();
    println!(
        "balance: {} credits ({})",
        view.credit_balance,
        if view.can_generate {
            "enough for a generation"
        } else {
            "not enough for a generation"
        }
    );
    Ok(0)
}

fn run_studio(args: StudioArgs) -> Result<i32> {
    let mut session = build_session(&args.backend)?;
    let backend = Arc::clone(&session.backend);
    let (signal_tx, signal_rx) = mpsc::channel();
    let mut scheduler = SessionRefreshScheduler::new(
        SchedulerConfig::default(),
        session.events.clone(),
        signal_tx,
    );
    scheduler.start(
        Arc::clone(&backend),
        timestamp_millis() as i64 + 30 * 60 * 1000,
    );

    println!("mirage studio — /help for commands");
    print_strip(&mut session.orchestrator, backend.as_ref());

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("mirage> ");
        io::stdout().flush().ok();
        let Some(line) = lines.next() else { break };
        let line = line.context("reading stdin")?;

        match parse_intent(&line) {
            UserIntent::Noop => continue,
            UserIntent::Quit => break,
            UserIntent::Help => println!("{INTENT_HELP}"),
            UserIntent::SetMode(mode) => {
                session.orchestrator.set_mode(mode, backend.as_ref());
                session
                    .orchestrator
                    .refresh_history(backend.as_ref(), mode);
                print_strip(&mut session.orchestrator, backend.as_ref());
            }
            UserIntent::SetPrompt(text) => session.orchestrator.set_prompt(text),
            UserIntent::SetRatio(ratio) => session.orchestrator.set_ratio(ratio),
            UserIntent::SetPublic(is_public) => session.orchestrator.set_public(is_public),
            UserIntent::Attach(path) => match read_upload(Path::new(&path)) {
                Ok(file) => {
                    println!("attached {} ({} bytes)", file.name, file.bytes.len());
                    session.orchestrator.set_uploaded_file(Some(file));
                }
                Err(err) => println!("! {err:#}"),
            },
            UserIntent::Generate => {
                if session.orchestrator.generate(backend.as_ref()) {
                    wait_for_job(
                        &mut session.orchestrator,
                        backend.as_ref(),
                        session.poll_pace,
                    );
                }
            }
            UserIntent::Select(id) => session.orchestrator.select_artifact(&id),
            UserIntent::Delete(id) => {
                session.orchestrator.delete_artifact(backend.as_ref(), &id);
            }
            UserIntent::Recreate(id) => {
                session
                    .orchestrator
                    .recreate_from_example(backend.as_ref(), &id);
            }
            UserIntent::RefreshExamples => {
                let strip = session.orchestrator.refresh_examples(backend.as_ref(), 8);
                if strip.is_empty() && session.orchestrator.examples_failed() {
                    println!("no examples available — try /examples again later");
                }
                for example in strip {
                    println!("{}  {}", example.id, example.descriptor);
                }
            }
            UserIntent::ShowHistory => {
                let mode = session.orchestrator.active_mode();
                session.orchestrator.refresh_history(backend.as_ref(), mode);
                for artifact in session.orchestrator.history(mode).artifacts() {
                    println!("{}", artifact_row(artifact));
                }
            }
            UserIntent::ShowView => print_view(&session.orchestrator.view()),
            UserIntent::Unknown { command } => {
                println!("unknown command /{command} — /help lists commands");
            }
            UserIntent::Invalid { message } => println!("! {message}"),
        }

        drain_actions(&session.actions);
        drain_signals(&signal_rx);
        print_status(&session.orchestrator.view());
    }

    scheduler.stop();
    Ok(0)
}

fn wait_for_job(
    orch: &mut Orchestrator,
    backend: &dyn ImageBackend,
    pace: Duration,
) -> Option<PollOutcome> {
    loop {
        match orch.pump(backend)? {
            PollStep::InFlight { status, progress } => {
                println!("  … {} {progress}%", status.as_str());
                thread::sleep(pace);
            }
            PollStep::Done(outcome) => return Some(outcome),
        }
    }
}

fn read_upload(path: &Path) -> Result<UploadedFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload.png")
        .to_string();
    Ok(UploadedFile::new(name, mime_for_path(path), bytes))
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

fn artifact_row(artifact: &mirage_contracts::GeneratedArtifact) -> String {
    format!(
        "{}  {}  {}  {}",
        artifact.id,
        artifact.ratio,
        if artifact.is_public { "public" } else { "private" },
        artifact.prompt.as_deref().unwrap_or("(no prompt)"),
    )
}

fn print_strip(orch: &mut Orchestrator, backend: &dyn ImageBackend) {
    let strip = orch.example_strip(backend, 8);
    if strip.is_empty() {
        if orch.examples_failed() {
            println!("no examples available — /examples retries");
        }
        return;
    }
    println!("inspiration:");
    for example in strip {
        println!("  {}  {}", example.id, example.descriptor);
    }
}

fn print_view(view: &ViewState) {
    println!("mode: {}", view.active_mode.as_str());
    println!("prompt: {}", view.prompt);
    println!("ratio: {}  visibility: {}", view.ratio, if view.is_public { "public" } else { "private" });
    if let Some(meta) = &view.uploaded_file {
        println!("attached: {} ({} bytes)", meta.name, meta.size_bytes);
    }
    if let Some(selected) = &view.selected_artifact_id {
        println!("selected: {selected}");
    }
    if let Some(message) = &view.error_message {
        println!("error: {message}");
    }
    println!(
        "credits: {}  action: {}",
        view.credit_balance,
        view.primary_action.label()
    );
}

fn print_status(view: &ViewState) {
    let mut line = format!(
        "[{} | {} credits",
        view.active_mode.as_str(),
        view.credit_balance
    );
    if view.is_generating {
        line.push_str(&format!(" | generating {}%", view.generation_progress));
    }
    if let Some(message) = &view.error_message {
        line.push_str(&format!(" | error: {message}"));
    }
    line.push(']');
    println!("{line}");
}

fn drain_actions(rx: &mpsc::Receiver<RoutedAction>) {
    while let Ok(action) = rx.try_recv() {
        match action {
            RoutedAction::RequireUpgrade => {
                println!("! not enough credits — the upgrade page has top-ups")
            }
            RoutedAction::RequireLogin => println!("! sign in to generate"),
        }
    }
}

fn drain_signals(rx: &mpsc::Receiver<SessionSignal>) {
    while let Ok(signal) = rx.try_recv() {
        match signal {
            SessionSignal::Renewed { .. } => println!("(session renewed)"),
            SessionSignal::Expired { reason } => {
                println!("! session expired ({reason}) — sign in again")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mirage_contracts::GenerationMode;

    use super::*;

    #[test]
    fn mime_guess_prefers_extension() {
        assert_eq!(mime_for_path(Path::new("cat.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("cat.webp")), "image/webp");
        assert_eq!(mime_for_path(Path::new("cat")), "image/png");
    }

    #[test]
    fn artifact_row_formats_private_artifacts() {
        let artifact = mirage_contracts::GeneratedArtifact {
            id: "art_1".to_string(),
            source_mode: GenerationMode::Text,
            image_url: "u".to_string(),
            thumbnail_url: "t".to_string(),
            prompt: None,
            ratio: "1:1".to_string(),
            is_public: false,
            created_at: String::new(),
        };
        assert_eq!(artifact_row(&artifact), "art_1  1:1  private  (no prompt)");
    }

    #[test]
    fn mode_argument_is_validated() {
        assert!(parse_mode("image").is_ok());
        assert!(parse_mode("sound").is_err());
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use notify::{RecursiveMode, Watcher};
use rand::seq::SliceRandom;
use sidenote_core::{
    Citation, Command, DocumentSource, PageStore, SessionEvent, TutorBackend, ViewerConfig,
    ViewerSession,
};
use sidenote_directives::{inline_page_refs, parse_response};
use sidenote_view::{
    style_page, wrap_text, write_status_line, EventMapper, PageStyles, TextPainter, UiEvent,
};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const ZOOM_MIN: f32 = 0.5;
const ZOOM_MAX: f32 = 3.0;
const ZOOM_STEP: f32 = 0.2;

#[derive(Debug, Parser)]
#[command(
    name = "sidenote",
    version,
    about = "terminal document viewer driven by an AI tutor"
)]
struct Args {
    /// Page to open the document on (0-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// JSON array of raw tutor responses to replay in order
    #[arg(long = "responses")]
    responses: Option<PathBuf>,

    /// Configuration file overriding the default location
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Path to the plain-text document; form feeds separate pages
    #[arg(required = true)]
    document: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

struct TextFileSource;

#[async_trait::async_trait]
impl DocumentSource for TextFileSource {
    async fn load_pages(&self, path: &Path) -> Result<Vec<String>> {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
        Ok(split_pages(&raw))
    }
}

fn split_pages(raw: &str) -> Vec<String> {
    raw.split('\u{0c}')
        .map(|page| page.trim_matches('\n').to_string())
        .collect()
}

/// Replays a recorded transcript of tutor responses; once exhausted it
/// falls back to canned responses exercising each directive kind.
struct ScriptedTutor {
    scripted: Vec<String>,
    cursor: Mutex<usize>,
}

impl ScriptedTutor {
    fn new(scripted: Vec<String>) -> Self {
        Self {
            scripted,
            cursor: Mutex::new(0),
        }
    }

    fn from_transcript(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read transcript {:?}", path))?;
        let scripted: Vec<String> = serde_json::from_str(&raw)
            .with_context(|| format!("transcript {:?} is not a JSON array of strings", path))?;
        Ok(Self::new(scripted))
    }

    fn canned(prompt: &str) -> String {
        let templates = [
            "The document opens with this topic on page[1].\n\ncommands:\n/page/1".to_string(),
            format!(
                "Let me search the document for \"{prompt}\".\n\ncommands:\n/highlight/{prompt}"
            ),
            format!(
                "I've left a note about that on page[1].\n\ncommands:\n/annotate/1/Revisit this section: {prompt}"
            ),
        ];
        templates
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TutorBackend for ScriptedTutor {
    async fn respond(&self, prompt: &str) -> Result<String> {
        let mut cursor = self.cursor.lock().map_err(|_| anyhow!("tutor cursor poisoned"))?;
        if let Some(raw) = self.scripted.get(*cursor) {
            *cursor += 1;
            return Ok(raw.clone());
        }
        Ok(Self::canned(prompt))
    }
}

struct App {
    zoom: f32,
    chips: Vec<Citation>,
    response: String,
    tutor_busy: bool,
}

impl App {
    fn new() -> Self {
        Self {
            zoom: 1.0,
            chips: Vec::new(),
            response: String::new(),
            tutor_busy: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "sidenote", "sidenote")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs, &args.log_level)?;

    let config = ViewerConfig::load_or_default(args.config.as_deref())?;
    let tutor: Arc<dyn TutorBackend> = match &args.responses {
        Some(path) => Arc::new(ScriptedTutor::from_transcript(path)?),
        None => Arc::new(ScriptedTutor::new(Vec::new())),
    };

    let store = Arc::new(PageStore::new());
    let source = TextFileSource;
    reload_document(&source, &store, &args.document).await?;

    let grammar = config.grammar.clone();
    let mut session = ViewerSession::new(Arc::clone(&store), config);
    let events = session.events();
    if let Some(page) = args.page {
        session.apply(Command::GotoPage { page, blink: false }, Instant::now());
    }

    let (watch_tx, watch_rx) = std_mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = watch_tx.send(res);
    })?;
    watcher
        .watch(&args.document, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {:?}", args.document))?;

    let (tutor_tx, mut tutor_rx) = mpsc::unbounded_channel::<String>();

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut painter = TextPainter::new(stdout);
    let mut mapper = EventMapper::new();
    let mut app = App::new();
    let mut dirty = true;

    loop {
        if dirty {
            let pending = mapper.pending_input();
            redraw(&mut painter, &session, &store, &app, pending.as_deref())?;
            dirty = false;
        }

        let mut action = LoopAction::Continue;
        if event::poll(Duration::from_millis(30))? {
            let ui_event = mapper.map_event(event::read()?);
            let now = Instant::now();
            action = handle_event(ui_event, &mut session, &mut app, &tutor, &tutor_tx, now);
        }

        match action {
            LoopAction::Quit => break,
            LoopAction::ContinueRedraw => dirty = true,
            LoopAction::Reload => {
                reload_document(&source, &store, &args.document).await?;
                dirty = true;
            }
            LoopAction::Continue => {}
        }

        let mut reload_needed = false;
        while let Ok(event) = watch_rx.try_recv() {
            match event {
                Ok(_) => reload_needed = true,
                Err(err) => warn!(?err, "document watcher error"),
            }
        }
        if reload_needed {
            if let Err(err) = reload_document(&source, &store, &args.document).await {
                warn!(?err, "failed to reload changed document");
            }
        }

        while let Ok(raw) = tutor_rx.try_recv() {
            app.tutor_busy = false;
            handle_response(&raw, &mut session, &mut app, &grammar, Instant::now());
            dirty = true;
        }

        session.tick(Instant::now());
        let drained = std::mem::take(&mut *events.lock());
        if drained
            .iter()
            .any(|event| matches!(event, SessionEvent::RedrawNeeded))
        {
            dirty = true;
        }
    }

    {
        let writer = painter.writer();
        crossterm::execute!(writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }

    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Reload,
    Quit,
}

fn handle_event(
    event: UiEvent,
    session: &mut ViewerSession,
    app: &mut App,
    tutor: &Arc<dyn TutorBackend>,
    tutor_tx: &mpsc::UnboundedSender<String>,
    now: Instant,
) -> LoopAction {
    match event {
        UiEvent::Command(cmd) => {
            session.apply(cmd, now);
            LoopAction::ContinueRedraw
        }
        UiEvent::BeginSearch | UiEvent::BeginPrompt | UiEvent::PromptChanged { .. } => {
            LoopAction::ContinueRedraw
        }
        UiEvent::SearchQueryChanged { query } | UiEvent::SearchSubmit { query } => {
            session.apply(Command::Search { query }, now);
            LoopAction::ContinueRedraw
        }
        UiEvent::SearchCancel => {
            session.apply(
                Command::Search {
                    query: String::new(),
                },
                now,
            );
            LoopAction::ContinueRedraw
        }
        UiEvent::PromptSubmit { text } => {
            let text = text.trim().to_string();
            if text.is_empty() {
                return LoopAction::ContinueRedraw;
            }
            app.tutor_busy = true;
            let backend = Arc::clone(tutor);
            let tx = tutor_tx.clone();
            tokio::spawn(async move {
                match backend.respond(&text).await {
                    Ok(raw) => {
                        let _ = tx.send(raw);
                    }
                    Err(err) => {
                        warn!(?err, "tutor request failed");
                        let _ = tx.send(String::new());
                    }
                }
            });
            LoopAction::ContinueRedraw
        }
        UiEvent::PromptCancel => LoopAction::ContinueRedraw,
        UiEvent::ActivateCitation { slot } => {
            if let Some(citation) = app.chips.get(slot - 1).cloned() {
                session.apply(
                    Command::ScrollToPosition {
                        page: citation.page,
                        term: citation.term,
                        annotation: citation.annotation,
                    },
                    now,
                );
                LoopAction::ContinueRedraw
            } else {
                LoopAction::Continue
            }
        }
        UiEvent::ZoomIn => {
            app.zoom = (app.zoom + ZOOM_STEP).min(ZOOM_MAX);
            LoopAction::ContinueRedraw
        }
        UiEvent::ZoomOut => {
            app.zoom = (app.zoom - ZOOM_STEP).max(ZOOM_MIN);
            LoopAction::ContinueRedraw
        }
        UiEvent::ZoomReset => {
            app.zoom = 1.0;
            LoopAction::ContinueRedraw
        }
        UiEvent::YankAnnotations => {
            let notes = session.annotations_for(session.current_page()).join("\n");
            if !notes.is_empty() {
                let copied = arboard::Clipboard::new().and_then(|mut clip| clip.set_text(notes));
                if let Err(err) = copied {
                    warn!(?err, "clipboard yank failed");
                }
            }
            LoopAction::Continue
        }
        UiEvent::ReloadDocument => LoopAction::Reload,
        UiEvent::Quit => LoopAction::Quit,
        UiEvent::None => LoopAction::Continue,
    }
}

fn handle_response(
    raw: &str,
    session: &mut ViewerSession,
    app: &mut App,
    grammar: &sidenote_core::Grammar,
    now: Instant,
) {
    let parsed = parse_response(raw, grammar);
    app.chips = build_citation_chips(&parsed);
    app.response = parsed.display_text;
    for directive in parsed.directives {
        session.apply_directive(directive, now);
    }
}

fn build_citation_chips(parsed: &sidenote_directives::ParsedResponse) -> Vec<Citation> {
    use sidenote_core::Directive;

    let mut chips = Vec::new();
    for directive in &parsed.directives {
        match directive {
            Directive::Highlight {
                page: Some(page),
                term,
            } => chips.push(Citation {
                page: *page,
                term: term.clone(),
                annotation: None,
            }),
            Directive::AnnotateMany { notes } => {
                chips.extend(notes.iter().map(|note| Citation {
                    page: note.page,
                    term: String::new(),
                    annotation: Some(note.text.clone()),
                }));
            }
            _ => {}
        }
    }
    for page_ref in inline_page_refs(&parsed.display_text) {
        if !chips.iter().any(|chip| chip.page == page_ref.page) {
            chips.push(Citation {
                page: page_ref.page,
                term: String::new(),
                annotation: None,
            });
        }
    }
    chips.truncate(9);
    chips
}

fn chip_terms_for(chips: &[Citation], page: usize) -> Vec<&str> {
    chips
        .iter()
        .filter(|chip| chip.page == page && !chip.term.is_empty())
        .map(|chip| chip.term.as_str())
        .collect()
}

async fn reload_document(
    source: &TextFileSource,
    store: &Arc<PageStore>,
    path: &Path,
) -> Result<()> {
    let pages = source.load_pages(path).await?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    store.load(&name, pages);
    Ok(())
}

fn redraw(
    painter: &mut TextPainter<io::Stdout>,
    session: &ViewerSession,
    store: &Arc<PageStore>,
    app: &App,
    pending_input: Option<&str>,
) -> Result<()> {
    let (cols, rows) = terminal::size()?;
    let cols = cols.max(20) as usize;
    let width = ((cols.saturating_sub(2)) as f32 / app.zoom).round() as usize;

    painter.begin_sync_update()?;
    painter.clear_all()?;

    let snapshot = store.snapshot();
    let page = session.current_page();
    if let Some(page_text) = snapshot.pages.get(page) {
        painter.paint_header(
            page,
            snapshot.pages.len(),
            session.blinking_page() == Some(page),
        )?;

        let body = wrap_text(&page_text.content, width);
        let chip_terms = chip_terms_for(&app.chips, page);
        let styles = PageStyles {
            active_citation: session
                .active_citation()
                .filter(|state| state.page == page && !state.term.is_empty())
                .map(|state| state.term.as_str()),
            highlight: session.highlight_term(),
            search: Some(session.search())
                .filter(|search| {
                    !search.query.trim().is_empty() && search.matches.contains(&page)
                })
                .map(|search| search.query.as_str()),
            citations: &chip_terms,
        };
        let segments = style_page(&body, styles, session.config().match_mode);
        painter.paint_segments(&segments)?;
        painter.newline()?;

        let typing = session
            .typing()
            .filter(|typing| typing.page == page)
            .map(|typing| typing.revealed_text());
        painter.paint_annotations(session.annotations_for(page), typing)?;
    }

    if !app.response.is_empty() || app.tutor_busy {
        painter.newline()?;
        let writer = painter.writer();
        crossterm::queue!(
            writer,
            SetAttribute(Attribute::Bold),
            Print("Tutor:"),
            SetAttribute(Attribute::NormalIntensity),
            Print("\r\n")
        )?;
        if app.tutor_busy {
            crossterm::queue!(writer, Print("  thinking...\r\n"))?;
        } else {
            for line in wrap_text(&app.response, width).lines() {
                crossterm::queue!(writer, Print("  "), Print(line), Print("\r\n"))?;
            }
            for (idx, chip) in app.chips.iter().enumerate() {
                let label = format_chip(idx, chip);
                crossterm::queue!(writer, Print("  "), Print(&label), Print("\r\n"))?;
            }
        }
    }

    let status = combine_status(
        Some(format_status(session, &snapshot.name, snapshot.pages.len(), app)),
        pending_input,
    );
    if let Some(status) = status {
        let status = truncate_with_ellipsis(status, cols);
        let writer = painter.writer();
        crossterm::queue!(
            writer,
            cursor::MoveTo(0, rows.saturating_sub(1)),
            Clear(ClearType::CurrentLine)
        )?;
        write_status_line(writer, &status)?;
    }

    painter.end_sync_update()?;
    Ok(())
}

fn format_chip(idx: usize, chip: &Citation) -> String {
    let mut label = format!("[{}] p{}", idx + 1, chip.page + 1);
    if !chip.term.is_empty() {
        label.push_str(&format!(" \"{}\"", chip.term));
    }
    if let Some(note) = &chip.annotation {
        label.push_str(&format!(" — {}", note));
    }
    label
}

fn format_status(session: &ViewerSession, name: &str, page_count: usize, app: &App) -> String {
    let mut status = format!(
        "{} — page {}/{} — {:.0}%",
        if name.is_empty() { "<no document>" } else { name },
        session.current_page() + 1,
        page_count.max(1),
        app.zoom * 100.0
    );

    let search = session.search();
    if !search.query.trim().is_empty() {
        status.push_str(" — /");
        status.push_str(&search.query);
        if search.matches.is_empty() {
            status.push_str(" (no matches)");
        } else {
            status.push_str(&format!(
                " ({}/{})",
                search.current + 1,
                search.matches.len()
            ));
        }
    }

    let queued = session.queued() + usize::from(session.typing().is_some());
    if queued > 0 {
        status.push_str(&format!(" — {} note(s) pending", queued));
    }

    status
}

fn combine_status(base: Option<String>, pending_input: Option<&str>) -> Option<String> {
    match (base, pending_input.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(pending)) => {
            base.push_str(" | ");
            base.push_str(pending);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(pending)) => Some(pending.to_string()),
        (None, None) => None,
    }
}

fn truncate_with_ellipsis(mut text: String, width: usize) -> String {
    if text.len() > width {
        if width <= 3 {
            text.truncate(width);
        } else {
            let mut truncated = text.chars().take(width - 3).collect::<String>();
            truncated.push_str("...");
            text = truncated;
        }
    }
    text
}

fn init_logging(project_dirs: &ProjectDirs, default_filter: &str) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "sidenote.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidenote_core::Grammar;

    #[test]
    fn split_pages_on_form_feed() {
        let pages = split_pages("first page\n\u{0c}second page\n\u{0c}\nthird");
        assert_eq!(pages, vec!["first page", "second page", "third"]);

        assert_eq!(split_pages("single"), vec!["single"]);
    }

    #[test]
    fn combine_status_joins_pending_input() {
        assert_eq!(
            combine_status(Some("doc — page 1/3".into()), Some("12")),
            Some("doc — page 1/3 | 12".into())
        );
        assert_eq!(
            combine_status(None, Some("/ash")),
            Some("/ash".into())
        );
        assert_eq!(combine_status(Some("doc".into()), Some("")), Some("doc".into()));
        assert_eq!(combine_status(None, None), None);
    }

    #[test]
    fn truncate_with_ellipsis_caps_width() {
        assert_eq!(truncate_with_ellipsis("short".into(), 20), "short");
        assert_eq!(
            truncate_with_ellipsis("a very long status line".into(), 10),
            "a very ..."
        );
        assert_eq!(truncate_with_ellipsis("abcdef".into(), 3), "abc");
    }

    #[test]
    fn chips_collect_citations_from_a_turn() {
        let parsed = parse_response(
            "The war is covered on page[3] and page[7].\ncommands:\n/highlight/3/\"Kalinga War\"\n/annotate/5/The edicts follow the war",
            &Grammar::default(),
        );
        let chips = build_citation_chips(&parsed);

        // page[3]'s inline marker is folded into the highlight chip;
        // page[7] has no directive and gets a bare chip of its own.
        assert_eq!(chips.len(), 3);
        assert_eq!(chips[0].page, 2);
        assert_eq!(chips[0].term, "Kalinga War");
        assert_eq!(chips[1].page, 4);
        assert_eq!(
            chips[1].annotation.as_deref(),
            Some("The edicts follow the war")
        );
        assert_eq!(chips[2].page, 6);
        assert!(chips[2].term.is_empty());
    }

    #[test]
    fn chip_terms_apply_only_to_their_page() {
        let chips = vec![
            Citation {
                page: 2,
                term: "Kalinga War".into(),
                annotation: None,
            },
            Citation {
                page: 1,
                term: "edicts".into(),
                annotation: None,
            },
            Citation {
                page: 2,
                term: String::new(),
                annotation: Some("a bare page chip".into()),
            },
        ];

        assert_eq!(chip_terms_for(&chips, 2), vec!["Kalinga War"]);
        assert_eq!(chip_terms_for(&chips, 1), vec!["edicts"]);
        assert!(chip_terms_for(&chips, 0).is_empty());
    }

    #[test]
    fn scripted_tutor_replays_then_falls_back() {
        let tutor = ScriptedTutor::new(vec!["first".into(), "second".into()]);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        assert_eq!(rt.block_on(tutor.respond("q")).unwrap(), "first");
        assert_eq!(rt.block_on(tutor.respond("q")).unwrap(), "second");
        let canned = rt.block_on(tutor.respond("ashoka")).unwrap();
        assert!(canned.contains("commands:"));
    }

    #[test]
    fn canned_responses_carry_a_directive() {
        for _ in 0..16 {
            let raw = ScriptedTutor::canned("non-violence");
            let parsed = parse_response(&raw, &Grammar::default());
            assert_eq!(parsed.directives.len(), 1);
            assert!(!parsed.display_text.is_empty());
        }
    }
}

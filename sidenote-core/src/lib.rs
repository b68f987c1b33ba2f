use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

pub type DocumentId = Uuid;

static SIDENOTE_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f1c9d2e-41b7-5c44-9a15-8d2f60c4ab77").expect("valid namespace UUID")
});

pub fn document_id_for_name(name: &str) -> DocumentId {
    Uuid::new_v5(&SIDENOTE_NAMESPACE, name.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub index: usize,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub name: String,
    pub pages: Arc<[PageText]>,
    pub generation: u64,
}

struct StoreInner {
    id: DocumentId,
    name: String,
    pages: Arc<[PageText]>,
    generation: u64,
}

pub struct PageStore {
    inner: RwLock<StoreInner>,
}

static GLOBAL_STORE: Lazy<Arc<PageStore>> = Lazy::new(|| Arc::new(PageStore::new()));

impl PageStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                id: Uuid::nil(),
                name: String::new(),
                pages: Arc::from(Vec::new()),
                generation: 0,
            }),
        }
    }

    pub fn global() -> Arc<PageStore> {
        Arc::clone(&GLOBAL_STORE)
    }

    #[instrument(skip(self, pages), fields(pages = pages.len()))]
    pub fn load(&self, name: &str, pages: Vec<String>) -> DocumentId {
        let id = document_id_for_name(name);
        let pages: Vec<PageText> = pages
            .into_iter()
            .enumerate()
            .map(|(index, content)| PageText { index, content })
            .collect();
        let mut inner = self.inner.write();
        inner.id = id;
        inner.name = name.to_string();
        inner.pages = pages.into();
        inner.generation += 1;
        id
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.id = Uuid::nil();
        inner.name.clear();
        inner.pages = Arc::from(Vec::new());
        inner.generation += 1;
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        let inner = self.inner.read();
        DocumentSnapshot {
            id: inner.id,
            name: inner.name.clone(),
            pages: Arc::clone(&inner.pages),
            generation: inner.generation,
        }
    }

    pub fn page_count(&self) -> usize {
        self.inner.read().pages.len()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}

impl Default for PageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub page: usize,
    pub term: String,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAnnotation {
    pub page: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    PageJump { page: usize },
    Highlight { page: Option<usize>, term: String },
    AnnotateMany { notes: Vec<PendingAnnotation> },
}

#[derive(Debug, Clone)]
pub struct TypingState {
    pub page: usize,
    pub text: String,
    pub revealed: usize,
    deadline: Instant,
}

impl TypingState {
    fn start(page: usize, text: String, now: Instant, tick: Duration) -> Self {
        Self {
            page,
            text,
            revealed: 0,
            deadline: now + tick,
        }
    }

    pub fn revealed_text(&self) -> &str {
        match self.text.char_indices().nth(self.revealed) {
            Some((end, _)) => &self.text[..end],
            None => &self.text,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.revealed >= self.text.chars().count()
    }
}

#[derive(Debug, Clone)]
pub struct HighlightState {
    pub page: usize,
    pub term: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Blink {
    page: usize,
    until: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct SearchState {
    pub query: String,
    pub matches: Vec<usize>,
    pub current: usize,
}

impl SearchState {
    pub fn current_page(&self) -> Option<usize> {
        self.matches.get(self.current).copied()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub type_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub commit_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub blink: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub citation_dwell: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            type_interval: Duration::from_millis(30),
            commit_delay: Duration::from_millis(500),
            blink: Duration::from_millis(2000),
            citation_dwell: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchMode {
    pub case_sensitive: bool,
    pub whole_token: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Grammar {
    pub marker: String,
    pub allow_bare_highlight: bool,
}

impl Default for Grammar {
    fn default() -> Self {
        Self {
            marker: "commands:".to_string(),
            allow_bare_highlight: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub timing: TimingConfig,
    pub match_mode: MatchMode,
    pub grammar: Grammar,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ViewerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "sidenote", "sidenote")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    NextPage {
        count: usize,
    },
    PrevPage {
        count: usize,
    },
    GotoPage {
        page: usize,
        blink: bool,
    },
    Highlight {
        term: String,
        page: Option<usize>,
    },
    Search {
        query: String,
    },
    SearchNext {
        count: usize,
    },
    SearchPrev {
        count: usize,
    },
    ScrollToPosition {
        page: usize,
        term: String,
        annotation: Option<String>,
    },
    ProcessAnnotations {
        citations: Vec<Citation>,
    },
    Annotate {
        notes: Vec<PendingAnnotation>,
    },
    ClearHighlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DocumentLoaded(DocumentId),
    DocumentCleared,
    PageFocused(usize),
    BlinkStarted(usize),
    AnnotationCommitted(usize),
    RedrawNeeded,
}

pub trait ViewCommands {
    fn goto_page(&mut self, page: usize, blink: bool);
    fn highlight(&mut self, term: &str, page: Option<usize>);
    fn scroll_to_position(&mut self, page: usize, term: &str, annotation: Option<&str>);
    fn process_new_annotations(&mut self, citations: &[Citation]);
}

#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load_pages(&self, path: &Path) -> Result<Vec<String>>;
}

#[async_trait::async_trait]
pub trait TutorBackend: Send + Sync {
    async fn respond(&self, prompt: &str) -> Result<String>;
}

pub struct ViewerSession {
    store: Arc<PageStore>,
    config: ViewerConfig,
    generation: u64,
    current_page: usize,
    programmatic_hold: bool,
    blink: Option<Blink>,
    highlight_term: Option<String>,
    active_citation: Option<HighlightState>,
    search: SearchState,
    queue: VecDeque<PendingAnnotation>,
    typing: Option<TypingState>,
    committed: BTreeMap<usize, Vec<String>>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl ViewerSession {
    pub fn new(store: Arc<PageStore>, config: ViewerConfig) -> Self {
        let generation = store.generation();
        Self {
            store,
            config,
            generation,
            current_page: 0,
            programmatic_hold: false,
            blink: None,
            highlight_term: None,
            active_citation: None,
            search: SearchState::default(),
            queue: VecDeque::new(),
            typing: None,
            committed: BTreeMap::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn search(&self) -> &SearchState {
        &self.search
    }

    pub fn typing(&self) -> Option<&TypingState> {
        self.typing.as_ref()
    }

    pub fn highlight_term(&self) -> Option<&str> {
        self.highlight_term.as_deref()
    }

    pub fn active_citation(&self) -> Option<&HighlightState> {
        self.active_citation.as_ref()
    }

    pub fn blinking_page(&self) -> Option<usize> {
        self.blink.as_ref().map(|blink| blink.page)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn annotations_for(&self, page: usize) -> &[String] {
        self.committed.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn apply(&mut self, command: Command, now: Instant) {
        self.sync_document();
        match command {
            Command::NextPage { count } => {
                let next = self.current_page.saturating_add(count);
                self.focus_page(next, false, now);
            }
            Command::PrevPage { count } => {
                let next = self.current_page.saturating_sub(count);
                self.focus_page(next, false, now);
            }
            Command::GotoPage { page, blink } => {
                self.focus_page(page, blink, now);
            }
            Command::Highlight { term, page } => match page {
                Some(page) => {
                    self.highlight_term = Some(term);
                    self.focus_page(page, true, now);
                }
                None => self.run_search(term, now),
            },
            Command::Search { query } => self.run_search(query, now),
            Command::SearchNext { count } => self.cycle_search(count as isize, now),
            Command::SearchPrev { count } => self.cycle_search(-(count as isize), now),
            Command::ScrollToPosition {
                page,
                term,
                annotation,
            } => {
                let count = self.store.page_count();
                if count == 0 {
                    return;
                }
                let page = page.min(count - 1);
                self.focus_page(page, true, now);
                self.active_citation = Some(HighlightState {
                    page,
                    term,
                    expires_at: now + self.config.timing.citation_dwell,
                });
                if let Some(text) = annotation {
                    self.enqueue_annotation(page, &text);
                }
            }
            Command::ProcessAnnotations { citations } => {
                for citation in citations {
                    if let Some(text) = citation.annotation {
                        self.enqueue_annotation(citation.page, &text);
                    }
                }
            }
            Command::Annotate { notes } => {
                for note in notes {
                    self.enqueue_annotation(note.page, &note.text);
                }
            }
            Command::ClearHighlight => {
                if self.highlight_term.is_some() || self.active_citation.is_some() {
                    self.highlight_term = None;
                    self.active_citation = None;
                    self.events.lock().push(SessionEvent::RedrawNeeded);
                }
            }
        }
    }

    pub fn apply_directive(&mut self, directive: Directive, now: Instant) {
        match directive {
            Directive::PageJump { page } => {
                self.apply(Command::GotoPage { page, blink: true }, now)
            }
            Directive::Highlight { page, term } => {
                self.apply(Command::Highlight { term, page }, now)
            }
            Directive::AnnotateMany { notes } => self.apply(Command::Annotate { notes }, now),
        }
    }

    pub fn observe_visible_page(&mut self, page: usize) {
        if self.programmatic_hold || page >= self.store.page_count() {
            return;
        }
        if page != self.current_page {
            self.current_page = page;
            let mut events = self.events.lock();
            events.push(SessionEvent::PageFocused(page));
            events.push(SessionEvent::RedrawNeeded);
        }
    }

    pub fn note_user_scroll(&mut self) {
        self.programmatic_hold = false;
    }

    pub fn tick(&mut self, now: Instant) {
        self.sync_document();
        let mut redraw = false;

        if let Some(blink) = self.blink {
            if now >= blink.until {
                self.blink = None;
                redraw = true;
            }
        }

        if let Some(active) = &self.active_citation {
            if now >= active.expires_at {
                self.active_citation = None;
                redraw = true;
            }
        }

        let mut commit_ready = false;
        if let Some(typing) = self.typing.as_mut() {
            let total = typing.text.chars().count();
            while typing.revealed < total && now >= typing.deadline {
                typing.revealed += 1;
                typing.deadline += if typing.revealed == total {
                    self.config.timing.commit_delay
                } else {
                    self.config.timing.type_interval
                };
                redraw = true;
            }
            if typing.revealed >= total && now >= typing.deadline {
                commit_ready = true;
            }
        }

        if commit_ready {
            if let Some(done) = self.typing.take() {
                let TypingState { page, text, .. } = done;
                let notes = self.committed.entry(page).or_default();
                if !notes.iter().any(|note| note == &text) {
                    notes.push(text);
                }
                self.events
                    .lock()
                    .push(SessionEvent::AnnotationCommitted(page));
                redraw = true;
            }
        }

        if self.typing.is_none() {
            if let Some(next) = self.queue.pop_front() {
                let page = next.page;
                self.typing = Some(TypingState::start(
                    page,
                    next.text,
                    now,
                    self.config.timing.type_interval,
                ));
                self.focus_page(page, true, now);
                redraw = true;
            }
        }

        if redraw {
            self.events.lock().push(SessionEvent::RedrawNeeded);
        }
    }

    fn sync_document(&mut self) {
        let snapshot = self.store.snapshot();
        if snapshot.generation == self.generation {
            return;
        }
        debug!(
            generation = snapshot.generation,
            "document changed, resetting session state"
        );
        self.generation = snapshot.generation;
        self.current_page = 0;
        self.programmatic_hold = false;
        self.blink = None;
        self.highlight_term = None;
        self.active_citation = None;
        self.search = SearchState::default();
        self.queue.clear();
        self.typing = None;
        self.committed.clear();
        let mut events = self.events.lock();
        if snapshot.pages.is_empty() {
            events.push(SessionEvent::DocumentCleared);
        } else {
            events.push(SessionEvent::DocumentLoaded(snapshot.id));
        }
        events.push(SessionEvent::RedrawNeeded);
    }

    fn focus_page(&mut self, page: usize, blink: bool, now: Instant) {
        let count = self.store.page_count();
        if count == 0 {
            return;
        }
        let target = page.min(count - 1);
        let changed = target != self.current_page;
        self.current_page = target;
        self.programmatic_hold = blink;
        if changed {
            self.events.lock().push(SessionEvent::PageFocused(target));
        }
        if blink {
            self.blink = Some(Blink {
                page: target,
                until: now + self.config.timing.blink,
            });
            self.events.lock().push(SessionEvent::BlinkStarted(target));
        }
        if changed || blink {
            self.events.lock().push(SessionEvent::RedrawNeeded);
        }
    }

    fn run_search(&mut self, query: String, now: Instant) {
        self.search.query = query;
        self.search.current = 0;
        self.search.matches.clear();
        if self.search.query.trim().is_empty() {
            self.events.lock().push(SessionEvent::RedrawNeeded);
            return;
        }
        let needle = self.search.query.to_lowercase();
        let snapshot = self.store.snapshot();
        self.search.matches = snapshot
            .pages
            .iter()
            .filter(|page| page.content.to_lowercase().contains(&needle))
            .map(|page| page.index)
            .collect();
        debug!(
            query = %self.search.query,
            matches = self.search.matches.len(),
            "search recomputed"
        );
        match self.search.matches.first().copied() {
            Some(first) => self.focus_page(first, true, now),
            None => self.events.lock().push(SessionEvent::RedrawNeeded),
        }
    }

    fn cycle_search(&mut self, step: isize, now: Instant) {
        let len = self.search.matches.len();
        if len == 0 {
            return;
        }
        let step = step.rem_euclid(len as isize) as usize;
        self.search.current = (self.search.current + step) % len;
        if let Some(page) = self.search.current_page() {
            self.focus_page(page, true, now);
        }
    }

    fn enqueue_annotation(&mut self, page: usize, text: &str) {
        let count = self.store.page_count();
        if count == 0 {
            return;
        }
        let page = page.min(count - 1);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let committed = self
            .committed
            .get(&page)
            .map_or(false, |notes| notes.iter().any(|note| note == text));
        let queued = self
            .queue
            .iter()
            .any(|pending| pending.page == page && pending.text == text);
        let typing = self
            .typing
            .as_ref()
            .map_or(false, |typing| typing.page == page && typing.text == text);
        if committed || queued || typing {
            debug!(page, text, "dropping duplicate annotation");
            return;
        }
        self.queue.push_back(PendingAnnotation {
            page,
            text: text.to_string(),
        });
    }
}

impl ViewCommands for ViewerSession {
    fn goto_page(&mut self, page: usize, blink: bool) {
        self.apply(Command::GotoPage { page, blink }, Instant::now());
    }

    fn highlight(&mut self, term: &str, page: Option<usize>) {
        self.apply(
            Command::Highlight {
                term: term.to_string(),
                page,
            },
            Instant::now(),
        );
    }

    fn scroll_to_position(&mut self, page: usize, term: &str, annotation: Option<&str>) {
        self.apply(
            Command::ScrollToPosition {
                page,
                term: term.to_string(),
                annotation: annotation.map(str::to_string),
            },
            Instant::now(),
        );
    }

    fn process_new_annotations(&mut self, citations: &[Citation]) {
        self.apply(
            Command::ProcessAnnotations {
                citations: citations.to_vec(),
            },
            Instant::now(),
        );
    }
}

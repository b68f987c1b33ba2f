use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    queue,
    style::{
        Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor,
    },
    terminal::{Clear, ClearType},
};
use sidenote_core::{Command, MatchMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleClass {
    Highlight,
    SearchMatch,
    Citation,
    CitationActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub text: &'a str,
    pub style: Option<StyleClass>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageStyles<'a> {
    pub active_citation: Option<&'a str>,
    pub highlight: Option<&'a str>,
    pub search: Option<&'a str>,
    pub citations: &'a [&'a str],
}

#[derive(Debug, Clone, Copy)]
pub struct Theme {
    pub highlight: Color,
    pub search: Color,
    pub citation: Color,
    pub citation_active: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            highlight: Color::Red,
            search: Color::Yellow,
            citation: Color::Blue,
            citation_active: Color::Green,
        }
    }
}

pub struct TextPainter<W: Write> {
    writer: W,
    theme: Theme,
}

impl<W: Write> TextPainter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            theme: Theme::default(),
        }
    }

    pub fn with_theme(writer: W, theme: Theme) -> Self {
        Self { writer, theme }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn paint_header(&mut self, index: usize, total: usize, blink: bool) -> Result<()> {
        let label = format!("[Page {}/{}]", index + 1, total);
        if blink {
            queue!(
                self.writer,
                SetAttribute(Attribute::Reverse),
                Print(&label),
                SetAttribute(Attribute::NoReverse)
            )?;
        } else {
            queue!(
                self.writer,
                SetAttribute(Attribute::Bold),
                Print(&label),
                SetAttribute(Attribute::NormalIntensity)
            )?;
        }
        queue!(self.writer, Print("\r\n"))?;
        Ok(())
    }

    pub fn paint_segments(&mut self, segments: &[Segment<'_>]) -> Result<()> {
        for segment in segments {
            match segment.style {
                None => write_text(&mut self.writer, segment.text)?,
                Some(StyleClass::Highlight) => {
                    queue!(
                        self.writer,
                        SetForegroundColor(self.theme.highlight),
                        SetAttribute(Attribute::Underlined)
                    )?;
                    write_text(&mut self.writer, segment.text)?;
                    queue!(
                        self.writer,
                        SetAttribute(Attribute::NoUnderline),
                        ResetColor
                    )?;
                }
                Some(StyleClass::SearchMatch) => {
                    queue!(
                        self.writer,
                        SetBackgroundColor(self.theme.search),
                        SetForegroundColor(Color::Black)
                    )?;
                    write_text(&mut self.writer, segment.text)?;
                    queue!(self.writer, ResetColor)?;
                }
                Some(StyleClass::Citation) => {
                    queue!(
                        self.writer,
                        SetForegroundColor(self.theme.citation),
                        SetAttribute(Attribute::Underlined)
                    )?;
                    write_text(&mut self.writer, segment.text)?;
                    queue!(
                        self.writer,
                        SetAttribute(Attribute::NoUnderline),
                        ResetColor
                    )?;
                }
                Some(StyleClass::CitationActive) => {
                    queue!(
                        self.writer,
                        SetBackgroundColor(self.theme.citation_active),
                        SetForegroundColor(Color::Black)
                    )?;
                    write_text(&mut self.writer, segment.text)?;
                    queue!(self.writer, ResetColor)?;
                }
            }
        }
        Ok(())
    }

    pub fn paint_annotations(&mut self, committed: &[String], typing: Option<&str>) -> Result<()> {
        if committed.is_empty() && typing.is_none() {
            return Ok(());
        }
        queue!(
            self.writer,
            Print("\r\n"),
            SetAttribute(Attribute::Bold),
            Print("Annotations:"),
            SetAttribute(Attribute::NormalIntensity),
            Print("\r\n")
        )?;
        for note in committed {
            queue!(
                self.writer,
                SetForegroundColor(self.theme.citation),
                Print("  • "),
                ResetColor
            )?;
            write_text(&mut self.writer, note)?;
            queue!(self.writer, Print("\r\n"))?;
        }
        if let Some(partial) = typing {
            queue!(
                self.writer,
                SetForegroundColor(self.theme.citation),
                Print("  • "),
                ResetColor
            )?;
            write_text(&mut self.writer, partial)?;
            queue!(
                self.writer,
                SetAttribute(Attribute::Bold),
                Print("|"),
                SetAttribute(Attribute::NormalIntensity),
                Print("\r\n")
            )?;
        }
        Ok(())
    }

    pub fn newline(&mut self) -> Result<()> {
        queue!(self.writer, Print("\r\n"))?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn write_text<W: Write>(writer: &mut W, text: &str) -> Result<()> {
    let mut first = true;
    for line in text.split('\n') {
        if !first {
            queue!(writer, Print("\r\n"))?;
        }
        queue!(writer, Print(line))?;
        first = false;
    }
    Ok(())
}


#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    BeginSearch,
    SearchQueryChanged { query: String },
    SearchSubmit { query: String },
    SearchCancel,
    BeginPrompt,
    PromptChanged { text: String },
    PromptSubmit { text: String },
    PromptCancel,
    ActivateCitation { slot: usize },
    ZoomIn,
    ZoomOut,
    ZoomReset,
    YankAnnotations,
    ReloadDocument,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Search,
    Respond,
}

impl Default for InputMode {
    fn default() -> Self {
        InputMode::Normal
    }
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    char_stack: String,
    mode: InputMode,
    search_buffer: String,
    prompt_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.reset_char_stack();
            self.search_buffer.clear();
            self.prompt_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Search => self.map_event_search(event),
            InputMode::Respond => self.map_event_respond(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char(c), _) if self.char_stack.as_str() == "c" => {
                    self.reset_char_stack();
                    match c.to_digit(10) {
                        Some(slot) if slot > 0 => UiEvent::ActivateCitation {
                            slot: slot as usize,
                        },
                        _ => UiEvent::None,
                    }
                }
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Char('c'), KeyModifiers::NONE) => {
                    if self.char_stack.is_empty() {
                        self.push_char('c');
                    }
                    UiEvent::None
                }
                (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                    let count = self.take_count();
                    UiEvent::Command(Command::NextPage { count })
                }
                (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                    let count = self.take_count();
                    UiEvent::Command(Command::PrevPage { count })
                }
                (KeyCode::Char('/'), KeyModifiers::NONE) => {
                    self.set_mode(InputMode::Search);
                    UiEvent::BeginSearch
                }
                (KeyCode::Char(':'), _) => {
                    self.set_mode(InputMode::Respond);
                    UiEvent::BeginPrompt
                }
                (KeyCode::Char('n'), KeyModifiers::NONE) => {
                    let count = self.take_count();
                    UiEvent::Command(Command::SearchNext { count })
                }
                (KeyCode::Char('N'), modifiers)
                    if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
                {
                    let count = self.take_count();
                    UiEvent::Command(Command::SearchPrev { count })
                }
                (KeyCode::Char('g'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::GotoPage {
                        page: 0,
                        blink: false,
                    })
                }
                (KeyCode::Char('G'), KeyModifiers::SHIFT) | (KeyCode::End, _) => {
                    self.reset_count();
                    UiEvent::Command(Command::GotoPage {
                        page: usize::MAX,
                        blink: false,
                    })
                }
                (KeyCode::Char('+'), _) => {
                    self.reset_count();
                    UiEvent::ZoomIn
                }
                (KeyCode::Char('-'), _) => {
                    self.reset_count();
                    UiEvent::ZoomOut
                }
                (KeyCode::Char('='), _) => {
                    self.reset_count();
                    self.reset_char_stack();
                    UiEvent::ZoomReset
                }
                (KeyCode::Char('y'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::YankAnnotations
                }
                (KeyCode::Char('r'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::ReloadDocument
                }
                (KeyCode::Esc, _) => {
                    self.reset_count();
                    self.reset_char_stack();
                    UiEvent::Command(Command::ClearHighlight)
                }
                (KeyCode::Char('q'), _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_search(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::SearchCancel
                }
                (KeyCode::Enter, _) => {
                    let query = self.search_buffer.clone();
                    self.set_mode(InputMode::Normal);
                    UiEvent::SearchSubmit { query }
                }
                (KeyCode::Backspace, _) => {
                    self.search_buffer.pop();
                    UiEvent::SearchQueryChanged {
                        query: self.search_buffer.clone(),
                    }
                }
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.search_buffer.push(c);
                    UiEvent::SearchQueryChanged {
                        query: self.search_buffer.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_respond(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::PromptCancel
                }
                (KeyCode::Enter, _) => {
                    let text = self.prompt_buffer.clone();
                    self.set_mode(InputMode::Normal);
                    UiEvent::PromptSubmit { text }
                }
                (KeyCode::Backspace, _) => {
                    self.prompt_buffer.pop();
                    UiEvent::PromptChanged {
                        text: self.prompt_buffer.clone(),
                    }
                }
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.prompt_buffer.push(c);
                    UiEvent::PromptChanged {
                        text: self.prompt_buffer.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    fn push_char(&mut self, char: char) {
        self.char_stack.push(char);
    }

    fn reset_char_stack(&mut self) {
        self.char_stack = String::new();
    }

    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => return Some(format!("/{}", self.search_buffer)),
            InputMode::Respond => return Some(format!(":{}", self.prompt_buffer)),
            InputMode::Normal => {}
        }
        let mut pending = String::new();
        if !self.pending_digits.is_empty() {
            pending.push_str(&self.pending_digits);
        }
        if !self.char_stack.is_empty() {
            pending.push_str(&self.char_stack);
        }
        if pending.is_empty() {
            None
        } else {
            Some(pending)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize,
    end: usize,
    word: bool,
}

fn split_runs(text: &str) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for (idx, ch) in text.char_indices() {
        let word = !ch.is_whitespace();
        match runs.last_mut() {
            Some(run) if run.word == word => run.end = idx + ch.len_utf8(),
            _ => runs.push(Run {
                start: idx,
                end: idx + ch.len_utf8(),
                word,
            }),
        }
    }
    runs
}

/// Splits a page's text into whitespace/word runs and tags each word run
/// with at most one style class, picked by fixed precedence.
pub fn style_page<'a>(text: &'a str, styles: PageStyles<'_>, mode: MatchMode) -> Vec<Segment<'a>> {
    let runs = split_runs(text);
    let mut classes: Vec<Option<StyleClass>> = vec![None; runs.len()];

    let mut sources: Vec<(StyleClass, &str)> = Vec::new();
    if let Some(term) = styles.active_citation {
        sources.push((StyleClass::CitationActive, term));
    }
    if let Some(term) = styles.highlight {
        sources.push((StyleClass::Highlight, term));
    }
    if let Some(term) = styles.search {
        sources.push((StyleClass::SearchMatch, term));
    }
    for term in styles.citations {
        sources.push((StyleClass::Citation, term));
    }

    for (class, term) in sources {
        mark_term(text, &runs, &mut classes, class, term, mode);
    }

    runs.iter()
        .zip(classes)
        .map(|(run, style)| Segment {
            text: &text[run.start..run.end],
            style,
        })
        .collect()
}

fn mark_term(
    text: &str,
    runs: &[Run],
    classes: &mut [Option<StyleClass>],
    class: StyleClass,
    term: &str,
    mode: MatchMode,
) {
    let words: Vec<&str> = term.split_whitespace().collect();
    if words.is_empty() {
        return;
    }
    let word_runs: Vec<usize> = runs
        .iter()
        .enumerate()
        .filter(|(_, run)| run.word)
        .map(|(idx, _)| idx)
        .collect();
    if word_runs.len() < words.len() {
        return;
    }
    for window in word_runs.windows(words.len()) {
        let aligned = window.iter().zip(&words).all(|(&run_idx, word)| {
            let run = runs[run_idx];
            token_matches(&text[run.start..run.end], word, mode)
        });
        if aligned {
            for &run_idx in window {
                if classes[run_idx].is_none() {
                    classes[run_idx] = Some(class);
                }
            }
        }
    }
}

pub fn token_matches(token: &str, term: &str, mode: MatchMode) -> bool {
    if token.is_empty() || term.is_empty() {
        return false;
    }
    if mode.case_sensitive {
        match_in(token, term, mode.whole_token)
    } else {
        match_in(&token.to_lowercase(), &term.to_lowercase(), mode.whole_token)
    }
}

fn match_in(token: &str, term: &str, whole_token: bool) -> bool {
    if !whole_token {
        return token.contains(term);
    }
    let mut start = 0;
    while let Some(at) = token[start..].find(term) {
        let begin = start + at;
        let end = begin + term.len();
        let left_ok = begin == 0 || !is_word_char(token[..begin].chars().next_back());
        let right_ok = end == token.len() || !is_word_char(token[end..].chars().next());
        if left_ok && right_ok {
            return true;
        }
        start = end;
    }
    false
}

fn is_word_char(c: Option<char>) -> bool {
    c.map_or(false, |c| c.is_alphanumeric() || c == '_')
}

pub fn wrap_text(text: &str, width: usize) -> String {
    let width = width.max(8);
    let mut out = String::with_capacity(text.len() + text.len() / width);
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let mut col = 0;
        let mut first_word = true;
        for word in line.split_whitespace() {
            let len = word.chars().count();
            if !first_word && col + 1 + len > width {
                out.push('\n');
                col = 0;
            } else if !first_word {
                out.push(' ');
                col += 1;
            }
            out.push_str(word);
            col += len;
            first_word = false;
        }
    }
    out
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

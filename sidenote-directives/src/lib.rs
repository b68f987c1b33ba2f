use std::ops::Range;

use sidenote_core::{Directive, Grammar, PendingAnnotation};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub display_text: String,
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePageRef {
    pub range: Range<usize>,
    pub page: usize,
}

pub fn parse_response(raw: &str, grammar: &Grammar) -> ParsedResponse {
    let mut display_lines: Vec<&str> = Vec::new();
    let mut directive_lines: Vec<&str> = Vec::new();
    let mut in_commands = false;
    for line in raw.lines() {
        if !in_commands && line.trim().eq_ignore_ascii_case(&grammar.marker) {
            in_commands = true;
            continue;
        }
        if in_commands {
            directive_lines.push(line);
        } else {
            display_lines.push(line);
        }
    }

    let display_text = display_lines.join("\n").trim_end().to_string();
    let mut directives = Vec::new();
    let mut notes: Vec<PendingAnnotation> = Vec::new();

    for line in directive_lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_directive_line(line, grammar) {
            Some(ParsedLine::Jump(page)) => directives.push(Directive::PageJump { page }),
            Some(ParsedLine::Highlight { page, term }) => {
                directives.push(Directive::Highlight { page, term })
            }
            Some(ParsedLine::Note(note)) => notes.push(note),
            None => debug!(line, "ignoring unrecognized directive line"),
        }
    }

    if !notes.is_empty() {
        directives.push(Directive::AnnotateMany { notes });
    }

    ParsedResponse {
        display_text,
        directives,
    }
}

pub fn inline_page_refs(text: &str) -> Vec<InlinePageRef> {
    let bytes = text.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i + 5 <= bytes.len() {
        if !bytes[i..i + 5].eq_ignore_ascii_case(b"page[") {
            i += 1;
            continue;
        }
        let digits_start = i + 5;
        let mut end = digits_start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end > digits_start && end < bytes.len() && bytes[end] == b']' {
            let number: usize = text[digits_start..end].parse().unwrap_or(0);
            if let Some(page) = number.checked_sub(1) {
                refs.push(InlinePageRef {
                    range: i..end + 1,
                    page,
                });
            }
            i = end + 1;
        } else {
            i += 5;
        }
    }
    refs
}

enum ParsedLine {
    Jump(usize),
    Highlight { page: Option<usize>, term: String },
    Note(PendingAnnotation),
}

fn parse_directive_line(line: &str, grammar: &Grammar) -> Option<ParsedLine> {
    if let Some(rest) = line.strip_prefix("/page/") {
        return parse_page_number(rest).map(ParsedLine::Jump);
    }
    if let Some(rest) = line.strip_prefix("/highlight/") {
        return parse_highlight(rest, grammar);
    }
    if let Some(rest) = line.strip_prefix("/annotate/") {
        let (page, text) = rest.split_once('/')?;
        let page = parse_page_number(page)?;
        let text = clean_term(text);
        if text.is_empty() {
            return None;
        }
        return Some(ParsedLine::Note(PendingAnnotation { page, text }));
    }
    None
}

fn parse_highlight(rest: &str, grammar: &Grammar) -> Option<ParsedLine> {
    if let Some((head, tail)) = rest.split_once('/') {
        if let Some(page) = parse_page_number(head) {
            let term = clean_term(tail);
            if term.is_empty() {
                return None;
            }
            return Some(ParsedLine::Highlight {
                page: Some(page),
                term,
            });
        }
    }
    if !grammar.allow_bare_highlight {
        return None;
    }
    let term = clean_term(rest);
    if term.is_empty() {
        return None;
    }
    Some(ParsedLine::Highlight { page: None, term })
}

fn parse_page_number(raw: &str) -> Option<usize> {
    let cleaned = raw.trim().trim_matches('"').trim();
    let one_based: usize = cleaned.parse().ok()?;
    one_based.checked_sub(1)
}

fn clean_term(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_display_text_from_command_block() {
        let raw = "Explained on page[3].\n\ncommands:\n/highlight/3/\"non-violence\"";
        let parsed = parse_response(raw, &Grammar::default());

        assert_eq!(parsed.display_text, "Explained on page[3].");
        assert_eq!(
            parsed.directives,
            vec![Directive::Highlight {
                page: Some(2),
                term: "non-violence".into(),
            }]
        );
    }

    #[test]
    fn page_numbers_are_one_based_in_text() {
        let parsed = parse_response("Go.\ncommands:\n/page/1", &Grammar::default());
        assert_eq!(parsed.directives, vec![Directive::PageJump { page: 0 }]);

        let text = "see page[3], also PAGE[1]";
        let refs = inline_page_refs(text);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].page, 2);
        assert_eq!(&text[refs[0].range.clone()], "page[3]");
        assert_eq!(refs[1].page, 0);
        assert_eq!(&text[refs[1].range.clone()], "PAGE[1]");
    }

    #[test]
    fn directive_and_inline_marker_share_indexing() {
        let parsed = parse_response(
            "The war is described on page[3].\ncommands:\n/highlight/2/\"Kalinga War\"",
            &Grammar::default(),
        );

        assert_eq!(
            parsed.directives,
            vec![Directive::Highlight {
                page: Some(1),
                term: "Kalinga War".into(),
            }]
        );
        let refs = inline_page_refs(&parsed.display_text);
        assert_eq!(refs[0].page, 2);
    }

    #[test]
    fn annotate_lines_aggregate_in_order() {
        let raw = "Notes below.\ncommands:\n/annotate/1/first note\n/annotate/2/second note";
        let parsed = parse_response(raw, &Grammar::default());

        assert_eq!(
            parsed.directives,
            vec![Directive::AnnotateMany {
                notes: vec![
                    PendingAnnotation { page: 0, text: "first note".into() },
                    PendingAnnotation { page: 1, text: "second note".into() },
                ],
            }]
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let raw = "Mixed.\ncommands:\n/page/2\"\n/page/zero\n/highlight/\nnot a directive\n/annotate/1/\n/annotate/3/kept";
        let parsed = parse_response(raw, &Grammar::default());

        assert_eq!(
            parsed.directives,
            vec![
                Directive::PageJump { page: 1 },
                Directive::AnnotateMany {
                    notes: vec![PendingAnnotation { page: 2, text: "kept".into() }],
                },
            ]
        );
    }

    #[test]
    fn accepts_multiple_directive_kinds() {
        let raw = "All.\ncommands:\n/page/4\n/highlight/2/empire\n/annotate/2/note";
        let parsed = parse_response(raw, &Grammar::default());

        assert_eq!(parsed.directives.len(), 3);
        assert!(matches!(parsed.directives[0], Directive::PageJump { page: 3 }));
        assert!(matches!(parsed.directives[2], Directive::AnnotateMany { .. }));
    }

    #[test]
    fn bare_highlight_follows_grammar() {
        let raw = "Look.\ncommands:\n/highlight/non-violence";
        let parsed = parse_response(raw, &Grammar::default());
        assert_eq!(
            parsed.directives,
            vec![Directive::Highlight {
                page: None,
                term: "non-violence".into(),
            }]
        );

        let strict = Grammar {
            allow_bare_highlight: false,
            ..Grammar::default()
        };
        let parsed = parse_response(raw, &strict);
        assert!(parsed.directives.is_empty());
    }

    #[test]
    fn response_without_marker_is_all_display_text() {
        let parsed = parse_response("Just prose with /page/2 inline.", &Grammar::default());
        assert_eq!(parsed.display_text, "Just prose with /page/2 inline.");
        assert!(parsed.directives.is_empty());
    }

    #[test]
    fn marker_is_matched_loosely() {
        let parsed = parse_response("Answer.\n Commands: \n/page/2", &Grammar::default());
        assert_eq!(parsed.display_text, "Answer.");
        assert_eq!(parsed.directives, vec![Directive::PageJump { page: 1 }]);
    }

    #[test]
    fn custom_marker_is_honored() {
        let grammar = Grammar {
            marker: "actions:".to_string(),
            ..Grammar::default()
        };
        let parsed = parse_response("Hi.\nactions:\n/page/2", &grammar);
        assert_eq!(parsed.directives, vec![Directive::PageJump { page: 1 }]);

        let parsed = parse_response("Hi.\ncommands:\n/page/2", &grammar);
        assert!(parsed.directives.is_empty());
        assert_eq!(parsed.display_text, "Hi.\ncommands:\n/page/2");
    }

    #[test]
    fn inline_refs_skip_malformed_markers() {
        assert!(inline_page_refs("page[], page[x], page[0], page[").is_empty());

        let refs = inline_page_refs("wrap page[12]?");
        assert_eq!(refs, vec![InlinePageRef { range: 5..13, page: 11 }]);
    }
}

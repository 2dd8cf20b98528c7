//! Markup to bounded plain text.

use scraper::{Html, Node};

use crate::types::result::RawPage;

/// Elements whose whole subtree is dropped.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "meta", "nav", "header", "footer", "template", "svg", "iframe",
];

/// Default extracted text length, in characters.
pub const DEFAULT_MAX_CHARS: usize = 1500;

/// Pulls readable text out of an HTML page.
///
/// Pure and deterministic: the same page always yields the same text.
#[derive(Debug, Clone)]
pub struct ContentExtractor {
    max_chars: usize,
}

impl Default for ContentExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS)
    }
}

impl ContentExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn extract(&self, page: &RawPage) -> String {
        self.extract_html(&page.body)
    }

    pub fn extract_html(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        let mut raw = String::with_capacity(html.len() / 4);

        for node in document.root_element().descendants() {
            let Node::Text(text) = node.value() else {
                continue;
            };

            let skipped = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| SKIPPED_TAGS.contains(&el.name()))
            });
            if skipped {
                continue;
            }

            raw.push_str(text);
            raw.push(' ');
        }

        truncate(&clean_text(&raw), self.max_chars)
    }
}

/// Replace symbol noise with spaces, drop control characters, and collapse
/// runs of whitespace.
pub fn clean_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for c in raw.chars() {
        let mapped = if c.is_whitespace() {
            ' '
        } else if c.is_control() {
            continue;
        } else if c.is_alphanumeric() || matches!(c, '_' | '.' | ',' | '!' | '?' | '-') {
            c
        } else {
            ' '
        };

        if mapped == ' ' {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(mapped);
        }
    }

    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

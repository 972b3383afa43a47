//! Content normalization for search
//!
//! Node content is free-form markdown. The `content_plain` column stores a
//! normalized projection used by content filters: markup removed, HTML
//! dropped, whitespace collapsed, lowercased.

use pulldown_cmark::{Event, Options, Parser, TagEnd};
use regex::Regex;
use std::sync::LazyLock;

/// Compiled regex for whitespace normalization
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Produce the normalized plain-text projection of `content`.
///
/// # Examples
///
/// ```
/// use semgraph_core::utils::normalize_content;
///
/// assert_eq!(normalize_content("# Hello World"), "hello world");
/// assert_eq!(normalize_content("**Bold** text"), "bold text");
/// assert_eq!(normalize_content("[link](http://example.com)"), "link");
/// ```
pub fn normalize_content(content: &str) -> String {
    let mut text = String::with_capacity(content.len());

    for event in Parser::new_ext(content, Options::ENABLE_STRIKETHROUGH) {
        match event {
            Event::Text(t) | Event::Code(t) => text.push_str(&t),
            Event::SoftBreak | Event::HardBreak | Event::Rule => text.push(' '),
            // Inline containers don't introduce word boundaries
            Event::End(
                TagEnd::Emphasis
                | TagEnd::Strong
                | TagEnd::Strikethrough
                | TagEnd::Link
                | TagEnd::Image,
            ) => {}
            Event::End(_) => text.push(' '),
            _ => {}
        }
    }

    WHITESPACE_RE
        .replace_all(&text, " ")
        .trim()
        .to_lowercase()
}

//! HTML → weighted fingerprint pipeline.
//!
//! Block-page detection runs first and short-circuits: challenge or denial
//! pages produce no fingerprint and never touch the baseline. Real content
//! is reduced to weight-prefixed text runs in document order, passed
//! through the noise filter, and digested into a [`WeightedFingerprint`]
//! stamped with the current algorithm version.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};

use crate::types::WeightedFingerprint;

/// Current fingerprinting algorithm version.
///
/// Bump this whenever extraction, filtering, or hashing changes; the first
/// patrol cycle after a bump silently resets every baseline.
pub const FINGERPRINT_VERSION: &str = "v2.0";

/// Pages with fewer visible characters than this are treated as block pages.
pub const MIN_VISIBLE_TEXT: usize = 100;

/// Default weight for elements with no table entry and no parent.
const DEFAULT_WEIGHT: f64 = 0.5;

/// Body substrings that mark a bot-challenge or denial page.
const BLOCK_MARKERS: &[&str] = &[
    "cloudflare",
    "ddos-guard",
    "captcha",
    "bot detection",
    "access denied",
    "blocked",
    "security check",
    "ray id",
    "cf-ray",
    "please verify you are human",
];

/// Title substrings that mark a block page on their own.
const TITLE_MARKERS: &[&str] = &["access denied", "blocked", "security check", "captcha"];

/// Elements whose subtree carries no user-visible page content.
const SKIPPED_TAGS: &[&str] = &["head", "script", "style", "noscript", "template", "svg"];

/// Elements that end a text run; inline markup inside them merges, block
/// siblings stay on separate lines so diffs track real paragraphs.
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "div", "dl", "fieldset", "figure",
    "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav",
    "ol", "p", "pre", "section", "table", "tbody", "td", "th", "thead", "tr", "ul",
];

static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("static selector"));

static DATE_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("static regex"));
static SESSION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Session ID: \w+").expect("static regex"));
static LAST_UPDATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Last updated: .*").expect("static regex"));

/// Result of running the pipeline over one fetched body.
#[derive(Debug, Clone, PartialEq)]
pub enum Fingerprinted {
    /// Real content, reduced and digested.
    Page(WeightedFingerprint),
    /// A challenge or denial page; counts as a fetch failure upstream.
    BlockPage,
}

/// Run block-page detection and, if the page is real, fingerprint it.
///
/// `selector` optionally scopes extraction to matching subtrees (the
/// user's `custom_selector`); an unmatched or invalid selector falls back
/// to the whole document.
pub fn fingerprint(html: &str, selector: Option<&str>) -> Fingerprinted {
    let doc = Html::parse_document(html);
    // Block detection always sees the whole document; a narrow selector must
    // not make a real page look empty.
    let full = extract(&doc, None);
    if is_block_page(html, &doc, &full) {
        return Fingerprinted::BlockPage;
    }

    let extraction = if selector.is_some() {
        extract(&doc, selector)
    } else {
        full
    };

    let content_text = filtered_text(&extraction);
    let mut hasher = Sha256::new();
    hasher.update(content_text.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Fingerprinted::Page(WeightedFingerprint {
        hash,
        version: FINGERPRINT_VERSION.to_string(),
        content_weights: extraction.weights,
        structure_signature: signature(&extraction.counts),
        content_text,
    })
}

fn is_block_page(html: &str, doc: &Html, extraction: &Extraction) -> bool {
    let lower = html.to_lowercase();
    if BLOCK_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return true;
    }

    if extraction.visible_chars < MIN_VISIBLE_TEXT {
        return true;
    }

    let title = doc
        .select(&TITLE_SELECTOR)
        .next()
        .map(|el| el.text().collect::<String>().to_lowercase())
        .unwrap_or_default();
    TITLE_MARKERS.iter().any(|marker| title.contains(marker))
}

/// Fixed semantic weight table. Unlisted elements inherit their parent's
/// weight.
fn weight_for(el: &scraper::node::Element, parent_weight: f64) -> f64 {
    match el.name() {
        "article" => 1.0,
        "main" => 0.9,
        "h1" | "h2" | "h3" => 0.8,
        "p" => 0.7,
        "div" if has_content_class(el) => 0.8,
        "aside" => 0.3,
        "nav" | "footer" => 0.1,
        _ => parent_weight,
    }
}

/// The structural-region key for signature and weight bookkeeping, when the
/// element is one the weight table names.
fn region_key(el: &scraper::node::Element) -> Option<&'static str> {
    match el.name() {
        "article" => Some("article"),
        "main" => Some("main"),
        "h1" => Some("h1"),
        "h2" => Some("h2"),
        "h3" => Some("h3"),
        "p" => Some("p"),
        "div" if has_content_class(el) => Some("div.content"),
        "aside" => Some("aside"),
        "nav" => Some("nav"),
        "footer" => Some("footer"),
        _ => None,
    }
}

fn has_content_class(el: &scraper::node::Element) -> bool {
    el.attr("class")
        .map(|classes| classes.split_whitespace().any(|c| c == "content"))
        .unwrap_or(false)
}

#[derive(Debug)]
enum Piece {
    Text(f64, String),
    /// A block boundary; text never merges across one.
    Break,
}

#[derive(Debug, Default)]
struct Extraction {
    /// Text pieces and block boundaries in document order.
    pieces: Vec<Piece>,
    /// Merged runs with their effective weights.
    runs: Vec<(f64, String)>,
    /// Occurrences of each structural region.
    counts: BTreeMap<String, u64>,
    /// Weight of each structural region present.
    weights: BTreeMap<String, f64>,
    /// Total visible characters before filtering.
    visible_chars: usize,
}

fn extract(doc: &Html, selector: Option<&str>) -> Extraction {
    let mut extraction = Extraction::default();

    let scoped = selector
        .and_then(|s| Selector::parse(s).ok())
        .map(|sel| doc.select(&sel).collect::<Vec<_>>())
        .filter(|roots| !roots.is_empty());

    match scoped {
        Some(roots) => {
            for root in roots {
                let weight = note_element(&root, DEFAULT_WEIGHT, &mut extraction);
                walk(root, weight, &mut extraction);
                extraction.pieces.push(Piece::Break);
            }
        }
        None => walk(doc.root_element(), DEFAULT_WEIGHT, &mut extraction),
    }

    extraction.runs = merge_pieces(std::mem::take(&mut extraction.pieces));
    extraction
}

fn note_element(el: &ElementRef<'_>, parent_weight: f64, out: &mut Extraction) -> f64 {
    let weight = weight_for(el.value(), parent_weight);
    if let Some(region) = region_key(el.value()) {
        *out.counts.entry(region.to_string()).or_insert(0) += 1;
        out.weights.insert(region.to_string(), weight);
    }
    weight
}

fn walk(el: ElementRef<'_>, weight: f64, out: &mut Extraction) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if SKIPPED_TAGS.contains(&name) {
                continue;
            }
            let is_block = BLOCK_TAGS.contains(&name);
            if is_block {
                out.pieces.push(Piece::Break);
            }
            let child_weight = note_element(&child_el, weight, out);
            walk(child_el, child_weight, out);
            if is_block {
                out.pieces.push(Piece::Break);
            }
        } else if let Some(text) = child.value().as_text() {
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !collapsed.is_empty() {
                out.visible_chars += collapsed.chars().count();
                out.pieces.push(Piece::Text(weight, collapsed));
            }
        }
    }
}

/// Join consecutive equal-weight text pieces so inline markup does not
/// shred sentences; block boundaries keep paragraphs on their own runs.
fn merge_pieces(pieces: Vec<Piece>) -> Vec<(f64, String)> {
    let mut merged: Vec<(f64, String)> = Vec::new();
    let mut at_boundary = true;
    for piece in pieces {
        match piece {
            Piece::Break => at_boundary = true,
            Piece::Text(weight, text) => {
                match merged.last_mut() {
                    Some((last_weight, last_text))
                        if !at_boundary && (*last_weight - weight).abs() < f64::EPSILON =>
                    {
                        last_text.push(' ');
                        last_text.push_str(&text);
                    }
                    _ => merged.push((weight, text)),
                }
                at_boundary = false;
            }
        }
    }
    merged
}

/// The noise filter, applied per run in order: strip date literals, session
/// ids, and `Last updated:` tails; drop advertisement and cookie-notice
/// runs; collapse whitespace. Surviving runs are prefixed with their weight
/// class.
fn filtered_text(extraction: &Extraction) -> String {
    let mut lines = Vec::with_capacity(extraction.runs.len());
    for (weight, text) in &extraction.runs {
        if text.contains("Advertisement") || text.contains("Cookie notice") {
            continue;
        }
        let text = DATE_LITERAL.replace_all(text, "");
        let text = SESSION_ID.replace_all(&text, "");
        let text = LAST_UPDATED.replace_all(&text, "");
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        lines.push(format!("[{weight:.1}] {collapsed}"));
    }
    lines.join("\n")
}

/// Compact `tag:count` summary of the structural containers present.
fn signature(counts: &BTreeMap<String, u64>) -> String {
    counts
        .iter()
        .map(|(tag, count)| format!("{tag}:{count}"))
        .collect::<Vec<_>>()
        .join(",")
}

//! Listing-page parsing shared by the portal adapters and the generic fallback.

use aot_core::{fold_case_and_accents, Category, RawCandidate};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::AdapterError;

pub const MAX_ITEMS_PER_LISTING: usize = 20;
const MAX_NAME_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 600;
const MIN_DESCRIPTION_CHARS: usize = 20;
const MAX_DETAIL_CHARS: usize = 6_000;

/// Keywords that mark a link as a funding posting.
pub const POSTING_KEYWORDS: &[&str] = &[
    "beca",
    "scholarship",
    "convocatoria",
    "movilidad",
    "mobility",
    "pasantia",
    "fellowship",
    "grant",
    "funding",
    "call for",
    "estancia",
    "intercambio",
    "exchange",
    "award",
    "doctorado",
    "doctoral",
    "investigacion",
    "research",
];

const NAVIGATION_PATTERNS: &[&str] = &[
    "menu",
    "nav",
    "footer",
    "header",
    "cookie",
    "privacy",
    "login",
    "registro",
    "sign in",
    "contacto",
    "about",
    "terminos",
    "condiciones",
    "politica",
    "facebook",
    "twitter",
    "linkedin",
    "instagram",
    "youtube",
];

const CONTEXT_CONTAINERS: &[&str] = &["div", "li", "article", "tr", "section"];
const DETAIL_NOISE: &[&str] = &["nav", "header", "footer", "script", "style", "noscript"];

/// How one portal lays out its listing page.
#[derive(Debug, Clone)]
pub struct ListingLayout {
    pub entity: String,
    pub category: Category,
    /// Tried in order; the first selector yielding at least `min_items` wins.
    pub item_selectors: &'static [&'static str],
    pub title_selector: &'static str,
    pub min_items: usize,
    pub min_title_chars: usize,
    /// Status badges such as "cerrada" / "finalizada" are read into `closed_hint`.
    pub read_badges: bool,
    pub detail_pages: bool,
    pub fallback: LinkScan,
}

/// Keyword link scan used when no structured items match.
#[derive(Debug, Clone)]
pub struct LinkScan {
    pub keywords: &'static [&'static str],
    pub min_chars: usize,
    /// Skip navigation/social links and require a keyword in short link texts.
    pub strict: bool,
    pub limit: Option<usize>,
}

impl LinkScan {
    pub fn generic() -> Self {
        Self {
            keywords: POSTING_KEYWORDS,
            min_chars: 10,
            strict: true,
            limit: None,
        }
    }
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Parse(format!("selector `{raw}`: {e}")))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Item text without its title, or `None` when little else is left.
fn description_from(item_text: &str, title: &str) -> Option<String> {
    let rest = match item_text.find(title) {
        Some(pos) => format!("{} {}", &item_text[..pos], &item_text[pos + title.len()..]),
        None => item_text.to_string(),
    };
    let rest = collapse_whitespace(&rest);
    let rest = rest.trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '|' | ':' | '.'));
    (rest.chars().count() >= MIN_DESCRIPTION_CHARS).then(|| truncate_chars(rest, MAX_DESCRIPTION_CHARS))
}

/// Resolve an href against the listing URL; anchors, scripts and mail links are ignored.
pub fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:") {
        return None;
    }
    base.join(href).ok().map(|u| u.to_string())
}

fn parse_base(base_url: &str) -> Result<Url, AdapterError> {
    Url::parse(base_url).map_err(|e| AdapterError::Config(format!("invalid listing url `{base_url}`: {e}")))
}

fn is_closed_badge(text: &str) -> Option<bool> {
    let folded = fold_case_and_accents(text);
    if folded.contains("cerrad") || folded.contains("finaliz") {
        Some(true)
    } else if folded.contains("abiert") {
        Some(false)
    } else {
        None
    }
}

fn item_link(item: ElementRef<'_>, title: ElementRef<'_>, link_sel: &Selector) -> Option<String> {
    if let Some(href) = title.value().attr("href") {
        return Some(href.to_string());
    }
    item.select(link_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .or_else(|| {
            title
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "a")
                .and_then(|a| a.value().attr("href"))
        })
        .map(ToString::to_string)
}

/// Parse a portal listing page into raw candidates.
pub fn parse_listing(
    layout: &ListingLayout,
    source_id: &str,
    html: &str,
    base_url: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let base = parse_base(base_url)?;
    let document = Html::parse_document(html);
    let title_sel = selector(layout.title_selector)?;
    let link_sel = selector("a[href]")?;
    let badge_sel = selector(".badge, .label, .status, .estado")?;

    let mut items: Vec<ElementRef<'_>> = Vec::new();
    for raw in layout.item_selectors {
        let sel = selector(raw)?;
        items = document.select(&sel).collect();
        if items.len() >= layout.min_items.max(1) {
            debug!(source_id, selector = *raw, count = items.len(), "listing items matched");
            break;
        }
    }

    if items.len() < layout.min_items.max(1) {
        debug!(source_id, "no structured items, scanning links");
        return scan_links(
            &document,
            &layout.fallback,
            &base,
            source_id,
            &layout.entity,
            layout.category,
            fetched_at,
        );
    }

    let mut out = Vec::new();
    for item in items.into_iter().take(MAX_ITEMS_PER_LISTING) {
        let Some(title) = item.select(&title_sel).next() else {
            continue;
        };
        let name = element_text(title);
        if name.chars().count() < layout.min_title_chars {
            continue;
        }

        let mut candidate = RawCandidate::new(
            source_id,
            truncate_chars(&name, MAX_NAME_CHARS),
            layout.entity.clone(),
            fetched_at,
        );
        candidate.category = Category::infer(&name, layout.category);
        candidate.source_url = item_link(item, title, &link_sel).and_then(|href| resolve_link(&base, &href));
        candidate.context_text = element_text(item);
        candidate.description = description_from(&candidate.context_text, &name);

        if layout.read_badges {
            for badge in item.select(&badge_sel) {
                if let Some(closed) = is_closed_badge(&element_text(badge)) {
                    candidate.closed_hint = closed;
                }
            }
        }
        out.push(candidate);
    }
    Ok(out)
}

fn is_navigation(folded: &str) -> bool {
    NAVIGATION_PATTERNS.iter().any(|p| folded.contains(p))
}

/// Keyword link scan over the whole page.
pub fn scan_links(
    document: &Html,
    scan: &LinkScan,
    base: &Url,
    source_id: &str,
    entity: &str,
    category: Category,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let link_sel = selector("a[href]")?;
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for link in document.select(&link_sel) {
        let href = link.value().attr("href").unwrap_or_default();
        let text = element_text(link);
        let chars = text.chars().count();
        if text.is_empty() || chars < scan.min_chars {
            continue;
        }
        let folded_text = fold_case_and_accents(&text);
        if scan.strict {
            if is_navigation(&folded_text) {
                continue;
            }
            if chars < 15 && !scan.keywords.iter().any(|k| folded_text.contains(k)) {
                continue;
            }
        }
        let combined = format!("{folded_text} {}", fold_case_and_accents(href));
        if !scan.keywords.iter().any(|k| combined.contains(k)) {
            continue;
        }
        let Some(url) = resolve_link(base, href) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }

        let context = link
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| CONTEXT_CONTAINERS.contains(&el.value().name()))
            .map(element_text)
            .unwrap_or_else(|| text.clone());

        let mut candidate = RawCandidate::new(source_id, truncate_chars(&text, MAX_NAME_CHARS), entity, fetched_at);
        candidate.category = Category::infer(&text, category);
        candidate.source_url = Some(url);
        candidate.description = description_from(&context, &text);
        candidate.context_text = context;
        out.push(candidate);

        if scan.limit.is_some_and(|limit| out.len() >= limit) {
            break;
        }
    }
    Ok(out)
}

/// Parse a page and run the link scan on it.
pub fn scan_page(
    html: &str,
    scan: &LinkScan,
    base_url: &str,
    source_id: &str,
    entity: &str,
    category: Category,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let base = parse_base(base_url)?;
    let document = Html::parse_document(html);
    scan_links(&document, scan, &base, source_id, entity, category, fetched_at)
}

/// Visible text of a detail page without navigation chrome.
pub fn detail_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let in_noise = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| DETAIL_NOISE.contains(&el.name()))
        });
        if !in_noise {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }
    }
    truncate_chars(&collapse_whitespace(&parts.join(" ")), MAX_DETAIL_CHARS)
}

//! Link extraction for pipelines that fan pages out into new jobs.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

static ANCHORS: LazyLock<Option<Selector>> = LazyLock::new(|| Selector::parse("a[href]").ok());

/// Absolute `http(s)` links of `html`, resolved against `base`, with
/// fragments removed. Order of first appearance, duplicates dropped.
///
/// Anchors carrying a `download` attribute are skipped. An unparseable
/// `base` yields only links that are already absolute.
pub fn extract_links(base: &str, html: &str) -> Vec<String> {
    let Some(selector) = ANCHORS.as_ref() else {
        return Vec::new();
    };
    let base = Url::parse(base).ok();
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    document
        .select(selector)
        .filter(|element| element.value().attr("download").is_none())
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| resolve(base.as_ref(), href))
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let mut url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.into())
}

/// True when both URLs parse and share a host.
pub fn same_host(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.host_str().is_some() && a.host_str() == b.host_str(),
        _ => false,
    }
}

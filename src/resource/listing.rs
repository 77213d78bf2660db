//! Directory-index parsers for the HTTP backend.
//!
//! HTTP offers no listing API, so a directory is listed by fetching its
//! index page and recognizing the markup. Each parser knows one dialect and
//! returns `None` for pages it does not recognize; the first parser in the
//! chain that returns `Some` wins. A page nobody recognizes makes the
//! directory non-listable, which is not an error.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::uri::ResourceUri;

/// A fetched index page.
#[derive(Debug, Clone, Copy)]
pub struct IndexPage<'a> {
    pub uri: &'a ResourceUri,
    pub html: &'a str,
}

/// One child entry found on an index page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexItem {
    pub name: String,
    pub is_directory: bool,
}

/// Recognizes one listing dialect.
pub trait DirectoryIndexParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Entries of the page, or `None` when the page is not this dialect.
    fn parse(&self, page: &IndexPage<'_>) -> Option<Vec<IndexItem>>;
}

/// The built-in chain, in priority order.
pub fn default_parsers() -> Vec<Box<dyn DirectoryIndexParser>> {
    vec![Box::new(ApacheIndexParser), Box::new(SvnIndexParser)]
}

/// Run a parser chain; the first parser that recognizes the page wins.
pub fn parse_index(
    parsers: &[Box<dyn DirectoryIndexParser>],
    page: &IndexPage<'_>,
) -> Option<(&'static str, Vec<IndexItem>)> {
    parsers
        .iter()
        .find_map(|parser| parser.parse(page).map(|items| (parser.name(), items)))
}

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title>\s*(.*?)\s*</title>").expect("title regex"));
static HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("href regex")
});
static SVN_REVISION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\brevision\s+\d+\s*:").expect("svn revision regex"));
static SVN_XML_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<svn\b[^>]*>.*?<index\b").expect("svn xml regex"));
static SVN_XML_ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(dir|file)\s[^>]*?href\s*=\s*"([^"]*)""#).expect("svn entry regex")
});

/// Apache httpd `mod_autoindex` pages (`<title>Index of /path</title>`), in
/// any of its `<pre>`, `<table>` or `<ul>` layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApacheIndexParser;

impl DirectoryIndexParser for ApacheIndexParser {
    fn name(&self) -> &'static str {
        "apache"
    }

    fn parse(&self, page: &IndexPage<'_>) -> Option<Vec<IndexItem>> {
        let title = page_title(page.html)?;
        if !title.to_ascii_lowercase().starts_with("index of ") {
            return None;
        }
        Some(collect_links(page.html))
    }
}

/// Subversion repository listings served by `mod_dav_svn`: the HTML form
/// (`<title>repo - Revision 42: /trunk</title>`) and the XML form
/// (`<svn><index>` with `<dir>`/`<file>` elements).
#[derive(Debug, Clone, Copy, Default)]
pub struct SvnIndexParser;

impl DirectoryIndexParser for SvnIndexParser {
    fn name(&self) -> &'static str {
        "svn"
    }

    fn parse(&self, page: &IndexPage<'_>) -> Option<Vec<IndexItem>> {
        if SVN_XML_RE.is_match(page.html) {
            let mut items = BTreeMap::new();
            for caps in SVN_XML_ENTRY_RE.captures_iter(page.html) {
                let is_directory = caps[1].eq_ignore_ascii_case("dir");
                if let Some(item) = to_item(&caps[2]) {
                    items.insert(item.name, is_directory);
                }
            }
            return Some(into_items(items));
        }

        let title = page_title(page.html)?;
        if !SVN_REVISION_RE.is_match(&title) {
            return None;
        }
        Some(collect_links(page.html))
    }
}

fn page_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .map(|caps| unescape_html(caps[1].trim()))
}

/// Relative links of a page, excluding parent, absolute, query and anchor
/// links. Duplicates collapse; a directory flag wins over a file flag.
fn collect_links(html: &str) -> Vec<IndexItem> {
    let mut items = BTreeMap::new();
    for caps in HREF_RE.captures_iter(html) {
        let href = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        if let Some(item) = to_item(href) {
            let entry = items.entry(item.name).or_insert(false);
            *entry |= item.is_directory;
        }
    }
    into_items(items)
}

fn into_items(items: BTreeMap<String, bool>) -> Vec<IndexItem> {
    items
        .into_iter()
        .map(|(name, is_directory)| IndexItem { name, is_directory })
        .collect()
}

/// Turn one href into a child entry, or `None` when it does not name a
/// direct child.
fn to_item(href: &str) -> Option<IndexItem> {
    let href = unescape_html(href.trim());
    if href.is_empty()
        || href.starts_with('?')
        || href.starts_with('#')
        || href.starts_with('/')
        || href.contains("://")
        || href.to_ascii_lowercase().starts_with("mailto:")
        || href.to_ascii_lowercase().starts_with("javascript:")
    {
        return None;
    }

    let href = href.split(['?', '#']).next().unwrap_or("");
    let href = href.strip_prefix("./").unwrap_or(href);
    let is_directory = href.ends_with('/');
    let raw_name = href.trim_end_matches('/');
    if raw_name.is_empty() || raw_name == "." || raw_name == ".." || raw_name.contains('/') {
        return None;
    }

    let name = urlencoding::decode(raw_name)
        .map(|n| n.into_owned())
        .unwrap_or_else(|_| raw_name.to_string());
    Some(IndexItem { name, is_directory })
}

fn unescape_html(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

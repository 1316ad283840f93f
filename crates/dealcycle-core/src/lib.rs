//! Core domain model for the dealcycle pipeline: the link store, the
//! round-robin progress cursor, the affiliate link transformer, and the JSON
//! document contracts shared by the storage and session crates.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealcycle-core";

/// Short-link hosts recognized as product links even without an embedded
/// identifier. Resolution happens in the gateways crate.
pub const SHORT_LINK_DOMAINS: &[&str] = &["amzn.to", "amzn.in", "amzn.eu"];

/// Query parameters stripped before retagging.
const TRACKING_PARAMS: &[&str] = &["tag", "ref", "ref_", "linkCode", "linkId", "psc", "th"];

/// Whether a product record carries real looked-up metadata or synthetic
/// placeholder data. Downstream consumers audit real-vs-synthetic on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoSource {
    Enriched,
    Fallback,
}

/// Display metadata for one product, regenerated on every emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub asin: String,
    pub title: String,
    pub image: String,
    pub price: String,
    pub rating: String,
    pub category: String,
    pub source: InfoSource,
}

/// One entry of the website product feed. Never mutated after creation;
/// replacement happens only through feed truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteProduct {
    pub id: String,
    pub title: String,
    pub image: String,
    pub affiliate_link: String,
    pub price: String,
    pub rating: String,
    pub category: String,
    pub asin: String,
    pub data_source: InfoSource,
    pub posted_date: DateTime<Utc>,
    pub session_type: String,
    pub link_index: usize,
}

impl WebsiteProduct {
    pub fn from_info(
        info: ProductInfo,
        affiliate_link: String,
        posted_date: DateTime<Utc>,
        session_type: &str,
        link_index: usize,
    ) -> Self {
        // The timestamp alone collides for items emitted within one second,
        // so the origin index is part of the id.
        let id = format!(
            "product_{}_{}_{}",
            session_type,
            posted_date.format("%Y%m%d_%H%M%S"),
            link_index
        );
        Self {
            id,
            title: info.title,
            image: info.image,
            affiliate_link,
            price: info.price,
            rating: info.rating,
            category: info.category,
            asin: info.asin,
            data_source: info.source,
            posted_date,
            session_type: session_type.to_string(),
            link_index,
        }
    }
}

/// The website product feed document, most-recent-first and bounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFeed {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_products: usize,
    #[serde(default)]
    pub products: Vec<WebsiteProduct>,
}

impl ProductFeed {
    /// Prepend `new_items` (kept in their emission order) ahead of the
    /// existing entries and truncate to `retention`, dropping the oldest.
    pub fn merge(&mut self, new_items: Vec<WebsiteProduct>, retention: usize, now: DateTime<Utc>) {
        let mut products = new_items;
        products.append(&mut self.products);
        products.truncate(retention);
        self.total_products = products.len();
        self.products = products;
        self.last_updated = Some(now);
    }
}

/// On-disk shape of the link cache. Only `links` is required on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinksDocument {
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scraped: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliate_tag: Option<String>,
}

/// Ordered, deduplicated sequence of candidate source URLs. Insertion order
/// defines the cycle order; individual entries are never deleted, only the
/// whole store is reloaded or replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStore {
    links: Vec<String>,
}

impl LinkStore {
    /// Build a store keeping the first occurrence of each URL.
    pub fn from_links(links: Vec<String>) -> Self {
        let mut store = Self::default();
        store.merge(links);
        store
    }

    /// Append entries not already present, preserving first-seen order.
    /// Returns how many were added.
    pub fn merge(&mut self, extra: impl IntoIterator<Item = String>) -> usize {
        let mut added = 0;
        for link in extra {
            if !self.links.contains(&link) {
                self.links.push(link);
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.links.get(index).map(String::as_str)
    }

    pub fn links(&self) -> &[String] {
        &self.links
    }
}

/// A link pulled from the store together with the store position it came
/// from. The position feeds `WebsiteProduct::link_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakenLink {
    pub index: usize,
    pub url: String,
}

/// Durable offset into the link store. Only mutated by `take`; all cycle
/// metadata is derived, never stored independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCursor {
    pub index: usize,
}

impl ProgressCursor {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    /// Pull `n` links round-robin, wrapping to the front of the store before
    /// each read when the index has run past the end. An empty store yields
    /// an empty selection and leaves the index untouched.
    ///
    /// When `n` exceeds the store length the selection revisits entries
    /// within the same call; callers drawing separate quotas from one cursor
    /// get overlapping items once the store is shorter than the combined
    /// quota. That is accepted behavior, not a defect.
    pub fn take(&mut self, store: &LinkStore, n: usize) -> Vec<TakenLink> {
        if store.is_empty() {
            return Vec::new();
        }
        let mut selected = Vec::with_capacity(n);
        for _ in 0..n {
            if self.index >= store.len() {
                self.index = 0;
            }
            match store.get(self.index) {
                Some(url) => selected.push(TakenLink {
                    index: self.index,
                    url: url.to_string(),
                }),
                None => break,
            }
            self.index += 1;
        }
        selected
    }

    pub fn cycle_number(&self, total: usize) -> usize {
        if total == 0 {
            1
        } else {
            self.index / total + 1
        }
    }

    pub fn position_in_cycle(&self, total: usize) -> usize {
        if total == 0 {
            1
        } else {
            self.index % total + 1
        }
    }
}

/// Serialized progress state, written locally and committed to the remote
/// repository. Derived fields are recomputed from `(index, total)` at
/// capture time so they can never drift from the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current_index: usize,
    pub cycle_number: usize,
    pub position_in_cycle: usize,
    pub total_links: usize,
    pub last_updated: DateTime<Utc>,
    pub session_type: String,
}

impl ProgressSnapshot {
    pub fn capture(
        cursor: ProgressCursor,
        total_links: usize,
        session_type: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            current_index: cursor.index,
            cycle_number: cursor.cycle_number(total_links),
            position_in_cycle: cursor.position_in_cycle(total_links),
            total_links,
            last_updated: now,
            session_type: session_type.to_string(),
        }
    }
}

/// Rewrites raw product URLs into canonical affiliate-tagged URLs.
///
/// Conversion never fails: URLs without a recognizable product identifier
/// degrade to a tag-append passthrough.
#[derive(Debug, Clone)]
pub struct LinkTagger {
    domain: String,
    tag: String,
    dp_path: Regex,
    gp_path: Regex,
    asin_param: Regex,
    marketplace_url: Regex,
}

impl LinkTagger {
    pub fn new(domain: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tag: tag.into(),
            dp_path: Regex::new(r"/dp/([A-Z0-9]{10})").expect("static pattern"),
            gp_path: Regex::new(r"/gp/product/([A-Z0-9]{10})").expect("static pattern"),
            asin_param: Regex::new(r"[?&]asin=([A-Z0-9]{10})").expect("static pattern"),
            marketplace_url: Regex::new(
                r"https?://(?:www\.)?(?:amazon\.[a-z.]{2,8}|amzn\.(?:to|in|eu))/[^\s]+",
            )
            .expect("static pattern"),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Find the 10-character product identifier. The `/dp/`, `/gp/product/`
    /// and `asin=` shapes are tried in that fixed order and the first match
    /// wins, even when a URL carries several conflicting identifiers --
    /// reproducibility over cleverness.
    pub fn extract_identifier(&self, url: &str) -> Option<String> {
        for pattern in [&self.dp_path, &self.gp_path, &self.asin_param] {
            if let Some(caps) = pattern.captures(url) {
                return Some(caps[1].to_string());
            }
        }
        None
    }

    pub fn is_short_link(&self, url: &str) -> bool {
        let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
        let host = rest.split(['/', '?']).next().unwrap_or("");
        let host = host.strip_prefix("www.").unwrap_or(host);
        SHORT_LINK_DOMAINS
            .iter()
            .any(|d| host.eq_ignore_ascii_case(d))
    }

    /// Validity predicate used when loading the link store: either an
    /// identifier is embedded or the host is a recognized short-link domain.
    pub fn is_product_link(&self, url: &str) -> bool {
        self.extract_identifier(url).is_some() || self.is_short_link(url)
    }

    /// Convert a raw URL into its affiliate-tagged form: strip known
    /// tracking parameters, then either emit the canonical
    /// `https://{domain}/dp/{id}?tag={tag}` shape or append the tag to
    /// whatever was left of the input.
    pub fn convert(&self, url: &str) -> String {
        let stripped = strip_tracking_params(url);
        if let Some(asin) = self.extract_identifier(&stripped) {
            return format!("https://{}/dp/{}?tag={}", self.domain, asin, self.tag);
        }
        append_tag(&stripped, &self.tag)
    }

    /// Rewrite every marketplace URL embedded in a free-text message,
    /// returning the rewritten text and the number of conversions.
    pub fn rewrite_message(&self, text: &str) -> (String, usize) {
        let mut conversions = 0;
        let rewritten = self
            .marketplace_url
            .replace_all(text, |caps: &regex::Captures<'_>| {
                conversions += 1;
                self.convert(&caps[0])
            })
            .into_owned();
        (rewritten, conversions)
    }
}

fn strip_tracking_params(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or(pair);
            !TRACKING_PARAMS.contains(&key)
        })
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

fn append_tag(url: &str, tag: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}tag={tag}")
}

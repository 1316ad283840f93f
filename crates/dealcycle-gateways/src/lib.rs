//! External collaborators behind narrow contracts: the chat sink, the
//! product enrichment gateway, and the short-link resolver. Everything here
//! degrades instead of propagating: enrichment always returns a populated
//! record, chat errors are typed so the dispatcher can log and move on.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use dealcycle_core::{InfoSource, LinkTagger, ProductInfo};
use dealcycle_storage::{
    classify_reqwest_error, classify_status, retry_with_backoff, BackoffPolicy, RetryClass,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dealcycle-gateways";

pub const PRICE_PLACEHOLDER: &str = "₹Special Price";
pub const RATING_PLACEHOLDER: &str = "⭐⭐⭐⭐☆";
pub const DEFAULT_CATEGORY: &str = "electronics";

const TITLE_MAX_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Chat sink

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rate limited by chat provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("chat api rejected message (code {code}): {description}")]
    Rejected { code: i64, description: String },
}

pub fn classify_chat_error(err: &ChatError) -> RetryClass {
    match err {
        ChatError::Request(e) => classify_reqwest_error(e),
        ChatError::RateLimited { retry_after } => RetryClass::RateLimited {
            retry_after: *retry_after,
        },
        ChatError::Rejected { code, .. } if *code >= 500 => RetryClass::Retryable,
        ChatError::Rejected { .. } => RetryClass::Fatal,
    }
}

/// Destination for formatted deal messages. The dispatcher only knows this
/// contract; tests substitute a recording implementation.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), ChatError>;
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub token: String,
    pub chat_id: String,
    pub parse_mode: String,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
            parse_mode: "Markdown".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BotApiReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<BotApiParameters>,
}

#[derive(Debug, Deserialize)]
struct BotApiParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Bot-API chat sender. Rate-limit replies surface the provider's
/// `retry_after` hint, which the shared retry loop honors with a longer wait.
pub struct TelegramChat {
    client: reqwest::Client,
    config: TelegramConfig,
    backoff: BackoffPolicy,
}

impl TelegramChat {
    pub fn new(config: TelegramConfig, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building chat client")?;
        Ok(Self {
            client,
            config,
            backoff,
        })
    }

    async fn send_once(&self, text: &str) -> Result<(), ChatError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_base, self.config.token
        );
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": self.config.parse_mode,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let reply = response.json::<BotApiReply>().await.unwrap_or(BotApiReply {
            ok: status.is_success(),
            error_code: None,
            description: None,
            parameters: None,
        });

        if reply.ok {
            return Ok(());
        }
        if reply.error_code == Some(429) || status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = reply
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs);
            return Err(ChatError::RateLimited { retry_after });
        }
        Err(ChatError::Rejected {
            code: reply.error_code.unwrap_or_else(|| i64::from(status.as_u16())),
            description: reply
                .description
                .unwrap_or_else(|| "unknown chat api error".to_string()),
        })
    }
}

#[async_trait]
impl ChatSink for TelegramChat {
    async fn send(&self, text: &str) -> Result<(), ChatError> {
        retry_with_backoff(&self.backoff, classify_chat_error, || self.send_once(text)).await
    }
}

// ---------------------------------------------------------------------------
// Product enrichment

#[derive(Debug, Error)]
enum LookupError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("search api status {0}")]
    Status(u16),
    #[error("malformed search payload: {0}")]
    Payload(String),
}

fn classify_lookup_error(err: &LookupError) -> RetryClass {
    match err {
        LookupError::Request(e) => classify_reqwest_error(e),
        LookupError::Status(s) => {
            classify_status(StatusCode::from_u16(*s).unwrap_or(StatusCode::BAD_GATEWAY))
        }
        LookupError::Payload(_) => RetryClass::Fatal,
    }
}

/// Windowed request budget: the counter resets once the window has elapsed,
/// and an exhausted budget short-circuits callers to the offline fallback
/// instead of queueing.
#[derive(Debug)]
pub struct RequestBudget {
    max_requests: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Clone, Copy)]
struct BudgetState {
    count: u32,
    window_start: Instant,
}

impl RequestBudget {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(BudgetState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Reserve one request slot; `false` means the budget for the current
    /// window is spent.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.window_start.elapsed() >= self.window {
            state.count = 0;
            state.window_start = Instant::now();
        }
        if state.count >= self.max_requests {
            return false;
        }
        state.count += 1;
        true
    }
}

/// One field-extraction strategy over a raw search-result entry.
pub type Strategy = Box<dyn Fn(&JsonValue) -> Option<String> + Send + Sync>;

/// Ordered list of strategies for one display field; evaluated in order,
/// first success wins.
pub struct ExtractChain {
    strategies: Vec<Strategy>,
}

impl ExtractChain {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, raw: &JsonValue) -> Option<String> {
        self.strategies.iter().find_map(|strategy| strategy(raw))
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() > TITLE_MAX_CHARS {
        let cut: String = title.chars().take(TITLE_MAX_CHARS).collect();
        format!("{cut}...")
    } else {
        title.to_string()
    }
}

fn price_from_text(text: &str) -> Option<String> {
    for (i, ch) in text.char_indices() {
        if ch == '₹' || ch == '$' {
            let tail: String = text[i + ch.len_utf8()..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
                .collect();
            if tail.chars().any(|c| c.is_ascii_digit()) {
                return Some(format!("{ch}{}", tail.trim_end_matches(['.', ','])));
            }
        }
    }
    None
}

fn rating_from_text(text: &str) -> Option<String> {
    let idx = text.find(" out of 5")?;
    let digits: String = text[..idx]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let rating: String = digits.chars().rev().collect();
    if rating.chars().any(|c| c.is_ascii_digit()) {
        Some(rating)
    } else {
        None
    }
}

pub fn title_chain() -> ExtractChain {
    ExtractChain::new(vec![
        Box::new(|raw| json_str(raw, &["title"]).map(truncate_title)),
        Box::new(|raw| json_str(raw, &["snippet"]).map(truncate_title)),
    ])
}

pub fn price_chain() -> ExtractChain {
    ExtractChain::new(vec![
        Box::new(|raw| json_str(raw, &["price"]).map(str::to_string)),
        Box::new(|raw| json_str(raw, &["price", "raw"]).map(str::to_string)),
        Box::new(|raw| json_f64(raw, &["extracted_price"]).map(|v| format!("₹{v}"))),
        Box::new(|raw| json_str(raw, &["snippet"]).and_then(price_from_text)),
        Box::new(|raw| json_str(raw, &["title"]).and_then(price_from_text)),
    ])
}

pub fn rating_chain() -> ExtractChain {
    ExtractChain::new(vec![
        Box::new(|raw| json_f64(raw, &["rating"]).map(|v| format!("{v:.1}"))),
        Box::new(|raw| {
            raw.get("rating")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        }),
        Box::new(|raw| json_str(raw, &["snippet"]).and_then(rating_from_text)),
    ])
}

pub fn image_chain() -> ExtractChain {
    ExtractChain::new(vec![
        Box::new(|raw| json_str(raw, &["thumbnail"]).map(str::to_string)),
        Box::new(|raw| json_str(raw, &["image"]).map(str::to_string)),
    ])
}

/// Pick the result to enrich from: exact identifier match first, then a
/// link embedding the identifier, then the first entry.
pub fn choose_result<'a>(results: &'a [JsonValue], asin: &str) -> Option<&'a JsonValue> {
    results
        .iter()
        .find(|r| json_str(r, &["asin"]) == Some(asin))
        .or_else(|| {
            results
                .iter()
                .find(|r| json_str(r, &["link"]).is_some_and(|link| link.contains(asin)))
        })
        .or_else(|| results.first())
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

/// Keyword-to-category table. Best-effort and pluggable by design: the
/// compiled-in table can be replaced wholesale by `rules/categories.yaml`.
#[derive(Debug, Clone)]
pub struct Categorizer {
    rules: Vec<CategoryRule>,
    default_category: String,
}

impl Categorizer {
    pub fn builtin() -> Self {
        let rule = |category: &str, needles: &[&str]| CategoryRule {
            category: category.to_string(),
            contains_any: needles.iter().map(|n| n.to_string()).collect(),
        };
        Self {
            rules: vec![
                rule(
                    "electronics",
                    &[
                        "phone", "laptop", "headphone", "earbud", "tablet", "tv", "camera",
                        "echo", "speaker", "smartwatch", "router", "ipad", "macbook",
                    ],
                ),
                rule(
                    "home-kitchen",
                    &["mixer", "cooker", "vacuum", "purifier", "kettle", "cookware"],
                ),
                rule(
                    "fashion",
                    &["shoe", "sneaker", "t-shirt", "jeans", "jacket", "saree"],
                ),
                rule("books", &["book", "paperback", "hardcover", "novel"]),
                rule("toys-games", &["toy", "lego", "puzzle", "board game"]),
            ],
            default_category: DEFAULT_CATEGORY.to_string(),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: CategoryRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            rules: file.rules,
            default_category: DEFAULT_CATEGORY.to_string(),
        })
    }

    /// Scan the structured category when present, otherwise the title,
    /// against the keyword table; unknown text lands in the default bucket.
    pub fn categorize(&self, title: &str, structured: Option<&str>) -> String {
        let haystack = structured
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(title)
            .to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
            })
            .map(|rule| rule.category.clone())
            .unwrap_or_else(|| self.default_category.clone())
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub marketplace_domain: String,
    pub timeout: Duration,
    pub max_requests: u32,
    pub budget_window: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://serpapi.com/search".to_string(),
            marketplace_domain: "www.amazon.in".to_string(),
            timeout: Duration::from_secs(30),
            max_requests: 25,
            budget_window: Duration::from_secs(3600),
        }
    }
}

/// Deterministic offline product record. The `source` field marks it as
/// synthetic so feed consumers can audit real-vs-fallback data.
pub fn fallback_product_info(asin: Option<&str>) -> ProductInfo {
    match asin {
        Some(asin) if !asin.is_empty() => ProductInfo {
            asin: asin.to_string(),
            title: format!("Amazon Product {asin}"),
            image: format!("https://m.media-amazon.com/images/I/{asin}._AC_SL1500_.jpg"),
            price: PRICE_PLACEHOLDER.to_string(),
            rating: RATING_PLACEHOLDER.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            source: InfoSource::Fallback,
        },
        _ => ProductInfo {
            asin: "UNKNOWN".to_string(),
            title: "Amazon Product".to_string(),
            image: String::new(),
            price: PRICE_PLACEHOLDER.to_string(),
            rating: RATING_PLACEHOLDER.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            source: InfoSource::Fallback,
        },
    }
}

/// Best-effort lookup of display metadata for a product identifier. Never
/// fails: missing credentials, a spent request budget, transport errors and
/// malformed payloads all land on the deterministic fallback.
pub struct EnrichmentGateway {
    client: reqwest::Client,
    config: EnrichmentConfig,
    budget: RequestBudget,
    categorizer: Categorizer,
    title: ExtractChain,
    price: ExtractChain,
    rating: ExtractChain,
    image: ExtractChain,
    backoff: BackoffPolicy,
}

impl EnrichmentGateway {
    pub fn new(config: EnrichmentConfig, categorizer: Categorizer) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building enrichment client")?;
        let budget = RequestBudget::new(config.max_requests, config.budget_window);
        Ok(Self {
            client,
            config,
            budget,
            categorizer,
            title: title_chain(),
            price: price_chain(),
            rating: rating_chain(),
            image: image_chain(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub async fn lookup(&self, identifier: Option<&str>) -> ProductInfo {
        let Some(asin) = identifier.filter(|a| !a.is_empty()) else {
            return fallback_product_info(None);
        };
        let Some(api_key) = self.config.api_key.clone() else {
            debug!(asin, "no search api key configured, using fallback");
            return fallback_product_info(Some(asin));
        };
        if !self.budget.try_acquire().await {
            debug!(asin, "search request budget exhausted, using fallback");
            return fallback_product_info(Some(asin));
        }
        match self.lookup_remote(&api_key, asin).await {
            Ok(info) => info,
            Err(err) => {
                warn!(asin, error = %err, "enrichment lookup failed, using fallback");
                fallback_product_info(Some(asin))
            }
        }
    }

    async fn lookup_remote(&self, api_key: &str, asin: &str) -> Result<ProductInfo, LookupError> {
        let payload = retry_with_backoff(&self.backoff, classify_lookup_error, || {
            self.search_once(api_key, asin)
        })
        .await?;

        let results = payload
            .get("organic_results")
            .and_then(JsonValue::as_array)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        let chosen = choose_result(results, asin)
            .ok_or_else(|| LookupError::Payload("empty organic_results".to_string()))?;
        Ok(self.build_info(asin, chosen))
    }

    async fn search_once(&self, api_key: &str, asin: &str) -> Result<JsonValue, LookupError> {
        let domain = self
            .config
            .marketplace_domain
            .trim_start_matches("www.")
            .to_string();
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("engine", "amazon"),
                ("amazon_domain", domain.as_str()),
                ("k", asin),
                ("api_key", api_key),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }
        response.json().await.map_err(LookupError::Request)
    }

    fn build_info(&self, asin: &str, raw: &JsonValue) -> ProductInfo {
        let title = self
            .title
            .extract(raw)
            .unwrap_or_else(|| format!("Amazon Product {asin}"));
        let category = self
            .categorizer
            .categorize(&title, json_str(raw, &["category"]));
        ProductInfo {
            asin: asin.to_string(),
            title,
            image: self.image.extract(raw).unwrap_or_else(|| {
                format!("https://m.media-amazon.com/images/I/{asin}._AC_SL1500_.jpg")
            }),
            price: self
                .price
                .extract(raw)
                .unwrap_or_else(|| PRICE_PLACEHOLDER.to_string()),
            rating: self
                .rating
                .extract(raw)
                .unwrap_or_else(|| RATING_PLACEHOLDER.to_string()),
            category,
            source: InfoSource::Enriched,
        }
    }
}

// ---------------------------------------------------------------------------
// Short links

/// Resolves recognized short links by following redirects, then converts the
/// resolved URL; any resolution failure falls back to converting the
/// original short URL (tag-append path).
pub struct ShortLinkResolver {
    client: reqwest::Client,
}

impl ShortLinkResolver {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building short-link client")?;
        Ok(Self { client })
    }

    pub async fn resolve_and_convert(&self, tagger: &LinkTagger, url: &str) -> String {
        if !tagger.is_short_link(url) {
            return tagger.convert(url);
        }
        match self.client.get(url).send().await {
            Ok(response) => tagger.convert(response.url().as_str()),
            Err(err) => {
                warn!(url, error = %err, "short-link resolution failed, tagging as-is");
                tagger.convert(url)
            }
        }
    }
}

//! Session configuration and the dispatcher that pulls link batches off the
//! round-robin cursor and fans them out to the chat channel and the website
//! product feed.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dealcycle_core::{
    LinkStore, LinkTagger, LinksDocument, ProductFeed, ProgressCursor, ProgressSnapshot,
    WebsiteProduct,
};
use dealcycle_gateways::{
    Categorizer, ChatSink, EnrichmentConfig, EnrichmentGateway, ShortLinkResolver, TelegramChat,
    TelegramConfig,
};
use dealcycle_storage::{BackoffPolicy, LocalStateStore, RemoteDocStore, RemoteRepoConfig};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealcycle-session";

pub const LINKS_FILE: &str = "amazon_links.json";
pub const PROGRESS_FILE: &str = "progress.json";
pub const PRODUCTS_FILE: &str = "products.json";

const USER_AGENT: &str = "dealcycle/0.1";

/// Remote documents live under the site repository's data directory.
fn remote_doc_path(name: &str) -> String {
    format!("data/{name}")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("chat posting requires {0} to be set")]
    ChatCredentials(&'static str),
}

#[derive(Debug, Clone)]
pub struct ChatCredentials {
    pub token: String,
    pub chat_id: String,
}

/// Everything the pipeline needs, resolved once at startup and passed by
/// reference. No component reads the process environment after this.
#[derive(Debug, Clone)]
pub struct Config {
    pub affiliate_tag: String,
    pub marketplace_domain: String,
    pub session_label: String,
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub chat: Option<ChatCredentials>,
    pub search_api_key: Option<String>,
    pub remote: Option<RemoteRepoConfig>,
    pub retention: usize,
    pub inter_message_delay: Duration,
    pub chat_count_override: Option<usize>,
    pub website_count_override: Option<usize>,
    pub search_budget: u32,
    pub search_budget_window: Duration,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let affiliate_tag = require_var("AMAZON_TAG")?;
        let marketplace_domain =
            optional_var("AMAZON_DOMAIN").unwrap_or_else(|| "www.amazon.in".to_string());
        let session_label = optional_var("SESSION_TYPE").unwrap_or_else(|| "morning".to_string());
        let data_dir = PathBuf::from(optional_var("DATA_DIR").unwrap_or_else(|| "data".to_string()));

        let chat = match (optional_var("BOT_TOKEN"), optional_var("CHANNEL_ID")) {
            (Some(token), Some(chat_id)) => Some(ChatCredentials { token, chat_id }),
            (Some(_), None) => return Err(ConfigError::ChatCredentials("CHANNEL_ID")),
            (None, Some(_)) => return Err(ConfigError::ChatCredentials("BOT_TOKEN")),
            (None, None) => None,
        };

        let http_timeout =
            Duration::from_secs(parse_var::<u64>("HTTP_TIMEOUT_SECS")?.unwrap_or(20));

        // Remote persistence is optional: without a token the pipeline keeps
        // everything in the local data directory only.
        let remote = match (
            optional_var("WEBSITE_REPO"),
            optional_var("PERSONAL_ACCESS_TOKEN"),
        ) {
            (Some(repo), Some(token)) => Some(RemoteRepoConfig {
                api_base: optional_var("GITHUB_API_BASE")
                    .unwrap_or_else(|| "https://api.github.com".to_string()),
                repo,
                branch: optional_var("WEBSITE_BRANCH").unwrap_or_else(|| "main".to_string()),
                token,
                timeout: http_timeout,
                user_agent: USER_AGENT.to_string(),
            }),
            _ => None,
        };

        Ok(Self {
            affiliate_tag,
            marketplace_domain,
            session_label,
            data_dir,
            workspace_root: PathBuf::from("."),
            chat,
            search_api_key: optional_var("SERP_API_KEY"),
            remote,
            retention: parse_var("PRODUCTS_RETENTION")?.unwrap_or(60),
            inter_message_delay: Duration::from_secs(
                parse_var::<u64>("MESSAGE_DELAY_SECS")?.unwrap_or(3),
            ),
            chat_count_override: parse_var("CHAT_PER_RUN")?,
            website_count_override: parse_var("PRODUCTS_PER_RUN")?,
            search_budget: parse_var("SERP_BUDGET")?.unwrap_or(25),
            search_budget_window: Duration::from_secs(
                parse_var::<u64>("SERP_BUDGET_WINDOW_SECS")?.unwrap_or(3600),
            ),
            http_timeout,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    optional_var(name).ok_or(ConfigError::MissingVar(name))
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match optional_var(name) {
        None => Ok(None),
        Some(raw) => match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ConfigError::Invalid { name, value: raw }),
        },
    }
}

/// Per-session item quotas for the two sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionQuota {
    pub chat_count: usize,
    pub website_count: usize,
}

/// Named time-slot quotas; unknown labels fall back to the default entry.
pub fn quotas_for(label: &str) -> SessionQuota {
    match label {
        "morning" => SessionQuota {
            chat_count: 3,
            website_count: 2,
        },
        "afternoon" => SessionQuota {
            chat_count: 2,
            website_count: 2,
        },
        "evening" => SessionQuota {
            chat_count: 4,
            website_count: 3,
        },
        "night" => SessionQuota {
            chat_count: 2,
            website_count: 1,
        },
        _ => SessionQuota {
            chat_count: 2,
            website_count: 2,
        },
    }
}

/// Cooperative cancellation, checked between items so a cancelled session
/// never abandons a half-finished remote write.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn format_deal_message(link: &str) -> String {
    format!("🔥 **Deal Alert!**\n\n{link}\n\n💰 *Grab this deal now!*")
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub run_id: Uuid,
    pub session_label: String,
    pub chat_sent: usize,
    pub chat_failed: usize,
    pub website_posted: usize,
    pub feed_total: usize,
    pub cancelled: bool,
    pub progress: ProgressSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Orchestrates one posting session: two sequential takes off the shared
/// cursor, chat fan-out, enrichment + feed merge, and durable progress.
pub struct SessionDispatcher {
    config: Config,
    tagger: LinkTagger,
    local: LocalStateStore,
    remote: Option<RemoteDocStore>,
    chat: Option<Box<dyn ChatSink>>,
    enrichment: EnrichmentGateway,
    shortlinks: ShortLinkResolver,
    cancel: CancelFlag,
}

impl SessionDispatcher {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let tagger = LinkTagger::new(
            config.marketplace_domain.clone(),
            config.affiliate_tag.clone(),
        );
        let local = LocalStateStore::new(config.data_dir.clone());
        let remote = match config.remote.clone() {
            Some(repo) => Some(RemoteDocStore::new(repo, BackoffPolicy::default())?),
            None => None,
        };
        let chat: Option<Box<dyn ChatSink>> = match &config.chat {
            Some(creds) => {
                let telegram = TelegramConfig {
                    timeout: config.http_timeout,
                    ..TelegramConfig::new(creds.token.clone(), creds.chat_id.clone())
                };
                Some(Box::new(TelegramChat::new(telegram, BackoffPolicy::default())?))
            }
            None => None,
        };

        let rules_path = config.workspace_root.join("rules").join("categories.yaml");
        let categorizer = if rules_path.exists() {
            match Categorizer::from_yaml_file(&rules_path) {
                Ok(categorizer) => categorizer,
                Err(err) => {
                    warn!(error = %err, "category rules unreadable, using builtin table");
                    Categorizer::builtin()
                }
            }
        } else {
            Categorizer::builtin()
        };
        let enrichment = EnrichmentGateway::new(
            EnrichmentConfig {
                api_key: config.search_api_key.clone(),
                marketplace_domain: config.marketplace_domain.clone(),
                timeout: config.http_timeout,
                max_requests: config.search_budget,
                budget_window: config.search_budget_window,
                ..EnrichmentConfig::default()
            },
            categorizer,
        )?;

        let shortlinks = ShortLinkResolver::new(config.http_timeout)?;

        Ok(Self {
            config,
            tagger,
            local,
            remote,
            chat,
            enrichment,
            shortlinks,
            cancel: CancelFlag::new(),
        })
    }

    /// Replace the chat sink; tests use this to record sends.
    pub fn with_chat_sink(mut self, sink: Box<dyn ChatSink>) -> Self {
        self.chat = Some(sink);
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one session. Per-item failures are logged and absorbed; the only
    /// errors surfaced are configuration problems caught before any network
    /// activity.
    pub async fn run(&self, label: &str) -> anyhow::Result<SessionSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut quota = quotas_for(label);
        if let Some(chat_count) = self.config.chat_count_override {
            quota.chat_count = chat_count;
        }
        if let Some(website_count) = self.config.website_count_override {
            quota.website_count = website_count;
        }
        if quota.chat_count > 0 && self.chat.is_none() {
            return Err(ConfigError::ChatCredentials("BOT_TOKEN").into());
        }

        let store = self.load_link_store().await;
        let mut cursor = self.load_cursor().await;
        info!(
            %run_id,
            label,
            links = store.len(),
            start_index = cursor.index,
            "session starting"
        );

        let chat_batch = cursor.take(&store, quota.chat_count);
        let website_batch = cursor.take(&store, quota.website_count);

        // Progress is persisted as soon as the takes are done, so a crash
        // mid-fan-out re-posts at most nothing rather than rewinding the
        // cursor and double-posting a whole session.
        let snapshot = ProgressSnapshot::capture(cursor, store.len(), label, Utc::now());
        if let Err(err) = self.persist_progress(&snapshot).await {
            error!(error = %err, "progress persistence failed");
        }

        let mut chat_sent = 0;
        let mut chat_failed = 0;
        let mut cancelled = false;

        if let Some(chat) = &self.chat {
            for (i, item) in chat_batch.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let link = self
                    .shortlinks
                    .resolve_and_convert(&self.tagger, &item.url)
                    .await;
                let text = format_deal_message(&link);
                match chat.send(&text).await {
                    Ok(()) => {
                        chat_sent += 1;
                        info!(index = item.index, "chat message sent");
                    }
                    Err(err) => {
                        chat_failed += 1;
                        warn!(index = item.index, error = %err, "chat send failed, skipping item");
                    }
                }
                if i + 1 < chat_batch.len() {
                    tokio::time::sleep(self.config.inter_message_delay).await;
                }
            }
        }

        let mut products = Vec::with_capacity(website_batch.len());
        for (i, item) in website_batch.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let link = self
                .shortlinks
                .resolve_and_convert(&self.tagger, &item.url)
                .await;
            let identifier = self.tagger.extract_identifier(&link);
            let info = self.enrichment.lookup(identifier.as_deref()).await;
            products.push(WebsiteProduct::from_info(
                info,
                link,
                Utc::now(),
                label,
                item.index,
            ));
            if i + 1 < website_batch.len() {
                tokio::time::sleep(self.config.inter_message_delay).await;
            }
        }

        let (website_posted, feed_total) = if products.is_empty() {
            (0, 0)
        } else {
            let count = products.len();
            match self.publish_products(products, label).await {
                Ok(total) => (count, total),
                Err(err) => {
                    error!(error = %err, "product feed publish failed");
                    (0, 0)
                }
            }
        };

        let finished_at = Utc::now();
        info!(
            %run_id,
            chat_sent,
            chat_failed,
            website_posted,
            cancelled,
            new_index = snapshot.current_index,
            "session finished"
        );
        Ok(SessionSummary {
            run_id,
            session_label: label.to_string(),
            chat_sent,
            chat_failed,
            website_posted,
            feed_total,
            cancelled,
            progress: snapshot,
            started_at,
            finished_at,
        })
    }

    /// Load the link cache, dropping entries that are not recognizable
    /// product links. A missing or unreadable cache is "nothing to do".
    async fn load_link_store(&self) -> LinkStore {
        let doc = match self.local.read_json::<LinksDocument>(LINKS_FILE).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                warn!("link cache missing, nothing to post");
                return LinkStore::default();
            }
            Err(err) => {
                warn!(error = %err, "link cache unreadable, nothing to post");
                return LinkStore::default();
            }
        };
        let total = doc.links.len();
        let valid: Vec<String> = doc
            .links
            .into_iter()
            .filter(|link| self.tagger.is_product_link(link))
            .collect();
        if valid.len() < total {
            warn!(dropped = total - valid.len(), "dropped unrecognized links");
        }
        LinkStore::from_links(valid)
    }

    /// The remote progress document is authoritative when reachable; the
    /// local copy is the fallback, and a fresh cursor the last resort.
    async fn load_cursor(&self) -> ProgressCursor {
        if let Some(remote) = &self.remote {
            match remote.fetch(&remote_doc_path(PROGRESS_FILE)).await {
                Ok(Some(doc)) => match serde_json::from_slice::<ProgressSnapshot>(&doc.content) {
                    Ok(snapshot) => return ProgressCursor::new(snapshot.current_index),
                    Err(err) => {
                        warn!(error = %err, "remote progress unreadable, falling back to local")
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "remote progress fetch failed, falling back to local")
                }
            }
        }
        match self.local.read_json::<ProgressSnapshot>(PROGRESS_FILE).await {
            Ok(Some(snapshot)) => ProgressCursor::new(snapshot.current_index),
            Ok(None) => ProgressCursor::default(),
            Err(err) => {
                warn!(error = %err, "local progress unreadable, starting from zero");
                ProgressCursor::default()
            }
        }
    }

    /// Local copy first, then the remote commit, awaited here -- the process
    /// must never exit with a progress write still in flight.
    async fn persist_progress(&self, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        self.local
            .write_json(PROGRESS_FILE, snapshot)
            .await
            .context("writing local progress")?;
        if let Some(remote) = &self.remote {
            let bytes = serde_json::to_vec_pretty(snapshot).context("serializing progress")?;
            let message = format!(
                "Auto-update: {} - index {}",
                snapshot.session_type, snapshot.current_index
            );
            remote
                .commit_if_changed(&remote_doc_path(PROGRESS_FILE), &bytes, &message)
                .await
                .context("committing remote progress")?;
        }
        Ok(())
    }

    async fn load_feed(&self) -> anyhow::Result<ProductFeed> {
        if let Some(remote) = &self.remote {
            return match remote.fetch(&remote_doc_path(PRODUCTS_FILE)).await? {
                Some(doc) => match serde_json::from_slice(&doc.content) {
                    Ok(feed) => Ok(feed),
                    Err(err) => {
                        warn!(error = %err, "remote product feed unreadable, starting fresh");
                        Ok(ProductFeed::default())
                    }
                },
                None => Ok(ProductFeed::default()),
            };
        }
        match self.local.read_json::<ProductFeed>(PRODUCTS_FILE).await {
            Ok(Some(feed)) => Ok(feed),
            Ok(None) => Ok(ProductFeed::default()),
            Err(err) => {
                warn!(error = %err, "local product feed unreadable, starting fresh");
                Ok(ProductFeed::default())
            }
        }
    }

    async fn publish_products(
        &self,
        products: Vec<WebsiteProduct>,
        label: &str,
    ) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut feed = self.load_feed().await?;
        feed.merge(products, self.config.retention, now);

        self.local
            .write_json(PRODUCTS_FILE, &feed)
            .await
            .context("writing local product feed")?;
        if let Some(remote) = &self.remote {
            let bytes = serde_json::to_vec_pretty(&feed).context("serializing product feed")?;
            let message = format!("Auto-update: {} - {} products", label, feed.total_products);
            remote
                .commit(&remote_doc_path(PRODUCTS_FILE), &bytes, &message)
                .await
                .context("committing remote product feed")?;
        }
        Ok(feed.total_products)
    }
}

/// Discovery pass: merge freshly found links into the cache, keeping
/// first-seen order and dropping anything that is not a product link.
pub async fn merge_into_link_cache(
    local: &LocalStateStore,
    tagger: &LinkTagger,
    extra: Vec<String>,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let existing = local
        .read_json::<LinksDocument>(LINKS_FILE)
        .await?
        .map(|doc| doc.links)
        .unwrap_or_default();
    let mut store = LinkStore::from_links(existing);
    let added = store.merge(extra.into_iter().filter(|l| tagger.is_product_link(l)));
    let updated = LinksDocument {
        links: store.links().to_vec(),
        total_count: Some(store.len()),
        last_scraped: Some(now),
        affiliate_tag: Some(tagger.tag().to_string()),
    };
    local.write_json(LINKS_FILE, &updated).await?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_table_has_default_entry() {
        assert_eq!(
            quotas_for("morning"),
            SessionQuota {
                chat_count: 3,
                website_count: 2
            }
        );
        assert_eq!(
            quotas_for("night"),
            SessionQuota {
                chat_count: 2,
                website_count: 1
            }
        );
        assert_eq!(quotas_for("brunch"), quotas_for("unknown"));
        assert_eq!(
            quotas_for("unknown"),
            SessionQuota {
                chat_count: 2,
                website_count: 2
            }
        );
    }

    #[test]
    fn deal_message_embeds_the_link() {
        let text = format_deal_message("https://www.amazon.in/dp/B08N5WRWNW?tag=t-21");
        assert!(text.contains("Deal Alert"));
        assert!(text.contains("https://www.amazon.in/dp/B08N5WRWNW?tag=t-21"));
    }

    #[test]
    fn cancel_flag_propagates_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn remote_paths_live_under_data() {
        assert_eq!(remote_doc_path(PROGRESS_FILE), "data/progress.json");
        assert_eq!(remote_doc_path(PRODUCTS_FILE), "data/products.json");
    }
}

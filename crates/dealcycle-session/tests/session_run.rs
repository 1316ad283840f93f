//! End-to-end dispatcher runs against a temp data directory, a recording
//! chat sink, and the offline enrichment fallback (no credentials, no
//! network).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dealcycle_core::{LinksDocument, ProductFeed, ProgressSnapshot};
use dealcycle_gateways::{ChatError, ChatSink};
use dealcycle_session::{
    merge_into_link_cache, Config, ConfigError, SessionDispatcher, LINKS_FILE, PRODUCTS_FILE,
    PROGRESS_FILE,
};
use dealcycle_storage::LocalStateStore;
use tempfile::tempdir;

struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    calls: AtomicUsize,
    fail_first: bool,
}

impl RecordingSink {
    fn new(fail_first: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sent: sent.clone(),
                calls: AtomicUsize::new(0),
                fail_first,
            },
            sent,
        )
    }
}

#[async_trait]
impl ChatSink for RecordingSink {
    async fn send(&self, text: &str) -> Result<(), ChatError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first && call == 0 {
            return Err(ChatError::Rejected {
                code: 400,
                description: "message rejected".to_string(),
            });
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        affiliate_tag: "test-21".to_string(),
        marketplace_domain: "www.amazon.in".to_string(),
        session_label: "morning".to_string(),
        data_dir: root.join("data"),
        workspace_root: root.to_path_buf(),
        chat: None,
        search_api_key: None,
        remote: None,
        retention: 5,
        inter_message_delay: Duration::ZERO,
        chat_count_override: Some(2),
        website_count_override: Some(2),
        search_budget: 25,
        search_budget_window: Duration::from_secs(3600),
        http_timeout: Duration::from_secs(5),
    }
}

async fn write_links(root: &Path, links: &[&str]) {
    let store = LocalStateStore::new(root.join("data"));
    let doc = LinksDocument {
        links: links.iter().map(|l| l.to_string()).collect(),
        total_count: Some(links.len()),
        last_scraped: None,
        affiliate_tag: Some("test-21".to_string()),
    };
    store.write_json(LINKS_FILE, &doc).await.unwrap();
}

const LINK_A: &str = "https://www.amazon.in/dp/B0863TXGM3?tag=old-20";
const LINK_B: &str = "https://www.amazon.in/gp/product/B08CF5PPM3";
const LINK_C: &str = "https://www.amazon.in/dp/B08J5F3G18/ref=sr_1_1";

#[tokio::test]
async fn session_advances_cursor_and_fills_both_sinks() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A, LINK_B, LINK_C]).await;

    let (sink, sent) = RecordingSink::new(false);
    let dispatcher = SessionDispatcher::from_config(test_config(dir.path()))
        .unwrap()
        .with_chat_sink(Box::new(sink));

    let summary = dispatcher.run("morning").await.unwrap();
    assert_eq!(summary.chat_sent, 2);
    assert_eq!(summary.chat_failed, 0);
    assert_eq!(summary.website_posted, 2);
    assert_eq!(summary.feed_total, 2);
    assert!(!summary.cancelled);

    // chat got the first two links, retagged
    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains("https://www.amazon.in/dp/B0863TXGM3?tag=test-21"));
    assert!(sent[1].contains("https://www.amazon.in/dp/B08CF5PPM3?tag=test-21"));

    // website got the third link and the wrapped-around first one
    let local = LocalStateStore::new(dir.path().join("data"));
    let feed: ProductFeed = local.read_json(PRODUCTS_FILE).await.unwrap().unwrap();
    assert_eq!(feed.total_products, 2);
    assert_eq!(feed.products[0].link_index, 2);
    assert_eq!(feed.products[1].link_index, 0);
    assert_eq!(
        feed.products[0].affiliate_link,
        "https://www.amazon.in/dp/B08J5F3G18?tag=test-21"
    );

    // offline enrichment is clearly marked synthetic
    assert_eq!(
        serde_json::to_value(&feed.products[0].data_source).unwrap(),
        serde_json::json!("fallback")
    );
    assert!(feed.products[0].title.contains("B08J5F3G18"));

    // four takes over three links: index 4 mod wrap -> 1, derived fields fresh
    let progress: ProgressSnapshot = local.read_json(PROGRESS_FILE).await.unwrap().unwrap();
    assert_eq!(progress.current_index, 1);
    assert_eq!(progress.total_links, 3);
    assert_eq!(progress.cycle_number, 1);
    assert_eq!(progress.position_in_cycle, 2);
    assert_eq!(progress.session_type, "morning");
    assert_eq!(summary.progress, progress);
}

#[tokio::test]
async fn second_session_resumes_from_persisted_cursor() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A, LINK_B, LINK_C]).await;

    let (first_sink, _) = RecordingSink::new(false);
    let dispatcher = SessionDispatcher::from_config(test_config(dir.path()))
        .unwrap()
        .with_chat_sink(Box::new(first_sink));
    dispatcher.run("morning").await.unwrap();

    let (second_sink, sent) = RecordingSink::new(false);
    let dispatcher = SessionDispatcher::from_config(test_config(dir.path()))
        .unwrap()
        .with_chat_sink(Box::new(second_sink));
    let summary = dispatcher.run("afternoon").await.unwrap();

    // cursor resumed at 1: chat takes indexes 1,2; website wraps to 0,1
    let sent = sent.lock().unwrap().clone();
    assert!(sent[0].contains("B08CF5PPM3"));
    assert!(sent[1].contains("B08J5F3G18"));

    let local = LocalStateStore::new(dir.path().join("data"));
    let feed: ProductFeed = local.read_json(PRODUCTS_FILE).await.unwrap().unwrap();
    assert_eq!(feed.total_products, 4);
    // newest first, emission order preserved within the batch
    assert_eq!(feed.products[0].link_index, 0);
    assert_eq!(feed.products[1].link_index, 1);
    assert_eq!(feed.products[0].session_type, "afternoon");
    assert_eq!(feed.products[2].session_type, "morning");

    assert_eq!(summary.progress.current_index, 2);
}

#[tokio::test]
async fn retention_bound_drops_oldest_entries() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A, LINK_B, LINK_C]).await;

    let mut config = test_config(dir.path());
    config.retention = 3;
    config.chat_count_override = Some(0);

    for _ in 0..3 {
        let dispatcher = SessionDispatcher::from_config(config.clone()).unwrap();
        dispatcher.run("night").await.unwrap();
    }

    let local = LocalStateStore::new(dir.path().join("data"));
    let feed: ProductFeed = local.read_json(PRODUCTS_FILE).await.unwrap().unwrap();
    assert_eq!(feed.total_products, 3);
    assert_eq!(feed.products.len(), 3);
}

#[tokio::test]
async fn empty_store_session_is_a_clean_noop() {
    let dir = tempdir().unwrap();

    let (sink, sent) = RecordingSink::new(false);
    let dispatcher = SessionDispatcher::from_config(test_config(dir.path()))
        .unwrap()
        .with_chat_sink(Box::new(sink));
    let summary = dispatcher.run("morning").await.unwrap();

    assert_eq!(summary.chat_sent, 0);
    assert_eq!(summary.website_posted, 0);
    assert!(sent.lock().unwrap().is_empty());
    assert_eq!(summary.progress.current_index, 0);
    assert_eq!(summary.progress.total_links, 0);
}

#[tokio::test]
async fn chat_quota_without_credentials_is_a_config_error() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A]).await;

    let dispatcher = SessionDispatcher::from_config(test_config(dir.path())).unwrap();
    let err = dispatcher.run("morning").await.unwrap_err();
    assert!(err.downcast_ref::<ConfigError>().is_some());
}

#[tokio::test]
async fn failed_send_skips_the_item_and_continues() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A, LINK_B, LINK_C]).await;

    let (sink, sent) = RecordingSink::new(true);
    let dispatcher = SessionDispatcher::from_config(test_config(dir.path()))
        .unwrap()
        .with_chat_sink(Box::new(sink));
    let summary = dispatcher.run("morning").await.unwrap();

    assert_eq!(summary.chat_sent, 1);
    assert_eq!(summary.chat_failed, 1);
    assert_eq!(sent.lock().unwrap().len(), 1);
    // the cursor still advanced for the failed item
    assert_eq!(summary.progress.current_index, 1);
}

#[tokio::test]
async fn cancelled_session_stops_between_items_but_keeps_progress() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A, LINK_B, LINK_C]).await;

    let (sink, sent) = RecordingSink::new(false);
    let dispatcher = SessionDispatcher::from_config(test_config(dir.path()))
        .unwrap()
        .with_chat_sink(Box::new(sink));
    dispatcher.cancel_flag().cancel();

    let summary = dispatcher.run("morning").await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.chat_sent, 0);
    assert_eq!(summary.website_posted, 0);
    assert!(sent.lock().unwrap().is_empty());

    // takes already happened, so the persisted cursor reflects them
    let local = LocalStateStore::new(dir.path().join("data"));
    let progress: ProgressSnapshot = local.read_json(PROGRESS_FILE).await.unwrap().unwrap();
    assert_eq!(progress.current_index, 1);
}

#[tokio::test]
async fn unrecognized_links_are_dropped_on_load() {
    let dir = tempdir().unwrap();
    write_links(
        dir.path(),
        &[LINK_A, "https://example.com/not-a-product", LINK_B],
    )
    .await;

    let mut config = test_config(dir.path());
    config.chat_count_override = Some(0);
    config.website_count_override = Some(2);
    let dispatcher = SessionDispatcher::from_config(config).unwrap();
    let summary = dispatcher.run("morning").await.unwrap();

    assert_eq!(summary.progress.total_links, 2);
    assert_eq!(summary.website_posted, 2);
}

#[tokio::test]
async fn discovery_merge_extends_the_cache_in_place() {
    let dir = tempdir().unwrap();
    write_links(dir.path(), &[LINK_A]).await;

    let local = LocalStateStore::new(dir.path().join("data"));
    let tagger = dealcycle_core::LinkTagger::new("www.amazon.in", "test-21");
    let added = merge_into_link_cache(
        &local,
        &tagger,
        vec![
            LINK_A.to_string(),
            LINK_B.to_string(),
            "https://example.com/junk".to_string(),
        ],
        chrono::Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(added, 1);
    let doc: LinksDocument = local.read_json(LINKS_FILE).await.unwrap().unwrap();
    assert_eq!(doc.links, vec![LINK_A.to_string(), LINK_B.to_string()]);
    assert_eq!(doc.total_count, Some(2));
    assert_eq!(doc.affiliate_tag.as_deref(), Some("test-21"));
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use crawl_common::channel::{KeyMessage, TopicPublisher};
use crawl_common::dedup::DedupStore;
use crawl_common::health::{ComponentStatus, HealthRegistry};
use crawl_common::keys::EntityKind;
use crawl_common::memory::{MemoryDedupStore, MemoryFetcher, MemoryTopic};
use crawl_common::retry::RetryPolicy;
use crawl_worker::crawler::{CrawlTopics, Crawler, PipelineSettings};
use crawl_worker::error::CrawlError;
use crawl_worker::pipeline::PipelineExit;
use http::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Harness {
    fetcher: Arc<MemoryFetcher>,
    store: Arc<MemoryDedupStore>,
    matches: MemoryTopic,
    players: MemoryTopic,
    matches_dead_letter: MemoryTopic,
    liveness: HealthRegistry,
    crawler: Arc<Crawler>,
}

struct Options {
    retry_policy: RetryPolicy,
    claim_timeout: Duration,
    poll_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::new(1, Duration::from_millis(1), None, 3),
            claim_timeout: Duration::from_secs(300),
            poll_timeout: Duration::from_millis(20),
        }
    }
}

fn harness(fetcher: MemoryFetcher) -> Harness {
    harness_with(fetcher, Options::default())
}

fn harness_with(fetcher: MemoryFetcher, options: Options) -> Harness {
    let fetcher = Arc::new(fetcher);
    let store = Arc::new(MemoryDedupStore::new(options.claim_timeout));
    let matches = MemoryTopic::new("matches");
    let players = MemoryTopic::new("players");
    let matches_dead_letter = MemoryTopic::new("matches_dead_letter");
    let liveness = HealthRegistry::new("liveness");

    let topics = CrawlTopics {
        matches_in: Arc::new(matches.clone()),
        matches_out: Arc::new(matches.clone()),
        matches_dead_letter: Some(Arc::new(matches_dead_letter.clone())),
        players_in: Arc::new(players.clone()),
        players_out: Arc::new(players.clone()),
        players_dead_letter: None,
    };
    let settings = PipelineSettings {
        poll_timeout: options.poll_timeout,
        max_concurrent_jobs: 4,
        retry_policy: options.retry_policy,
    };

    let crawler = Crawler::wire(
        fetcher.clone(),
        store.clone(),
        topics,
        settings,
        &liveness,
    );

    Harness {
        fetcher,
        store,
        matches,
        players,
        matches_dead_letter,
        liveness,
        crawler: Arc::new(crawler),
    }
}

type CrawlResult = Result<(PipelineExit, PipelineExit), CrawlError>;

fn start(
    harness: &Harness,
    seed: Option<&'static str>,
) -> (watch::Sender<bool>, JoinHandle<CrawlResult>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let crawler = harness.crawler.clone();
    let handle = tokio::spawn(async move { crawler.run(seed, shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn stop(
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<CrawlResult>,
) -> (PipelineExit, PipelineExit) {
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("crawler did not stop in time")
        .unwrap()
        .unwrap()
}

fn small_graph() -> MemoryFetcher {
    MemoryFetcher::default()
        .with_account("Cronnay", "P1")
        .with_player("P1", &["M1", "M2"])
        .with_player("P2", &["M1", "M3"])
        .with_player("P3", &[])
        .with_player("P4", &["M3"])
        .with_match("M1", &["P1", "P2", "P3"])
        .with_match("M2", &["P1", "P2"])
        .with_match("M3", &["P2", "P4"])
}

#[tokio::test]
async fn test_crawl_visits_every_reachable_key_once() {
    let h = harness(small_graph());
    let (shutdown_tx, handle) = start(&h, Some("Cronnay"));

    wait_until(|| {
        ["M1", "M2", "M3"]
            .iter()
            .all(|key| h.store.is_completed(EntityKind::Match, key))
            && ["P1", "P2", "P3", "P4"]
                .iter()
                .all(|key| h.store.is_completed(EntityKind::Player, key))
            && h.matches.pending() == 0
            && h.players.pending() == 0
    })
    .await;
    let exits = stop(shutdown_tx, handle).await;

    assert_eq!(exits, (PipelineExit::Shutdown, PipelineExit::Shutdown));
    for key in ["M1", "M2", "M3", "P1", "P2", "P3", "P4"] {
        assert_eq!(h.fetcher.calls(key), 1, "{} was fetched more than once", key);
    }
    for key in ["M1", "M2", "M3"] {
        assert!(h.store.archived(key).is_some());
    }
    assert!(h.matches_dead_letter.published().is_empty());
}

#[tokio::test]
async fn test_seed_player_history_is_published() {
    let h = harness(
        MemoryFetcher::default()
            .with_account("Cronnay", "P1")
            .with_player("P1", &["M1", "M2"]),
    );
    let (shutdown_tx, handle) = start(&h, Some("Cronnay"));

    wait_until(|| h.store.is_completed(EntityKind::Player, "P1")).await;
    stop(shutdown_tx, handle).await;

    assert_eq!(h.players.published_keys(), vec!["P1"]);
    let published: Vec<KeyMessage> = h
        .matches
        .published()
        .into_iter()
        .filter(|message| message.attempt == 0)
        .collect();
    assert_eq!(
        published,
        vec![
            KeyMessage::new("M1").with_origin("P1"),
            KeyMessage::new("M2").with_origin("P1"),
        ]
    );
    assert_eq!(h.store.mark_seen_calls(EntityKind::Player, "P1"), 1);
}

#[tokio::test]
async fn test_match_from_player_history_skips_its_origin() {
    let h = harness(MemoryFetcher::default().with_match("M1", &["P1", "P2", "P3"]));
    // P1 is the player whose history led to M1, and is done already
    h.store.complete(EntityKind::Player, "P1").await.unwrap();
    h.matches
        .publish(&KeyMessage::new("M1").with_origin("P1"))
        .await
        .unwrap();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| h.store.archived("M1").is_some() && h.players.published().len() == 2).await;
    stop(shutdown_tx, handle).await;

    assert_eq!(h.players.published_keys(), vec!["P2", "P3"]);
    assert_eq!(h.store.mark_seen_calls(EntityKind::Match, "M1"), 1);
}

#[tokio::test]
async fn test_redelivered_keys_are_not_fetched_again() {
    let h = harness(
        MemoryFetcher::default()
            .with_player("P2", &["M9"])
            .with_match("M1", &["P5"]),
    );
    h.store.complete(EntityKind::Player, "P2").await.unwrap();
    h.store.complete(EntityKind::Match, "M1").await.unwrap();
    h.players.send_message("P2").await.unwrap();
    h.matches.send_message("M1").await.unwrap();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| h.players.pending() == 0 && h.matches.pending() == 0).await;
    stop(shutdown_tx, handle).await;

    assert_eq!(h.fetcher.calls("P2"), 0);
    assert_eq!(h.fetcher.calls("M1"), 0);
    assert_eq!(h.matches.published_keys(), vec!["M1"]);
    assert_eq!(h.players.published_keys(), vec!["P2"]);
}

#[tokio::test]
async fn test_failed_match_leaves_no_trace_and_loop_continues() {
    let h = harness(
        MemoryFetcher::default()
            .with_match("M3", &["P7"])
            .with_match("M4", &["P8"]),
    );
    h.fetcher.fail_with("M3", StatusCode::BAD_REQUEST);
    h.matches.send_message("M3").await.unwrap();
    h.matches.send_message("M4").await.unwrap();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| {
        h.store.archived("M4").is_some() && h.matches_dead_letter.published().len() == 1
    })
    .await;
    stop(shutdown_tx, handle).await;

    assert!(h.store.archived("M3").is_none());
    assert!(!h.store.exists(EntityKind::Match, "M3").await.unwrap());
    assert_eq!(h.fetcher.calls("M3"), 1);
    assert_eq!(h.players.published_keys(), vec!["P8"]);
    assert_eq!(h.matches_dead_letter.published_keys(), vec!["M3"]);
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_dead_lettered() {
    let h = harness(MemoryFetcher::default().with_match("M1", &["P1"]));
    h.fetcher.fail_with("M1", StatusCode::SERVICE_UNAVAILABLE);
    h.matches.send_message("M1").await.unwrap();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| !h.matches_dead_letter.published().is_empty()).await;
    stop(shutdown_tx, handle).await;

    assert_eq!(h.fetcher.calls("M1"), 3);
    let attempts: Vec<u32> = h
        .matches
        .published()
        .iter()
        .map(|message| message.attempt)
        .collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(h.matches_dead_letter.published()[0].attempt, 2);
    assert!(!h.store.exists(EntityKind::Match, "M1").await.unwrap());
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let h = harness_with(
        MemoryFetcher::default().with_player("P1", &["M1"]),
        Options {
            retry_policy: RetryPolicy::new(1, Duration::from_millis(300), None, 3),
            ..Default::default()
        },
    );
    h.fetcher.fail_with("P1", StatusCode::TOO_MANY_REQUESTS);
    h.players.send_message("P1").await.unwrap();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| h.fetcher.calls("P1") >= 1).await;
    h.fetcher.recover("P1");
    wait_until(|| h.store.is_completed(EntityKind::Player, "P1")).await;
    stop(shutdown_tx, handle).await;

    assert_eq!(h.fetcher.calls("P1"), 2);
    assert_eq!(
        h.players
            .published()
            .iter()
            .map(|message| message.attempt)
            .collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!(h.matches.published_keys().contains(&"M1".to_owned()));
}

#[tokio::test]
async fn test_key_left_claimed_by_a_dead_consumer_is_crawled_once_the_claim_expires() {
    let h = harness_with(
        MemoryFetcher::default().with_match("M1", &["P1", "P2"]),
        Options {
            retry_policy: RetryPolicy::new(1, Duration::from_millis(20), None, 3),
            claim_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    // A consumer claimed M1 and died before archiving it; Kafka hands M1 out again
    h.store.mark_seen(EntityKind::Match, "M1").await.unwrap();
    h.matches.send_message("M1").await.unwrap();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| h.store.archived("M1").is_some()).await;
    stop(shutdown_tx, handle).await;

    assert!(h.store.is_completed(EntityKind::Match, "M1"));
    assert_eq!(h.fetcher.calls("M1"), 1);
    assert_eq!(h.players.published_keys(), vec!["P1", "P2"]);
    assert!(h.matches_dead_letter.published().is_empty());
    // Waiting on the claim never used up an attempt
    assert!(h
        .matches
        .published()
        .iter()
        .all(|message| message.attempt == 0));
}

#[tokio::test]
async fn test_shutdown_stops_both_pipelines_within_a_poll_timeout() {
    let poll_timeout = Duration::from_millis(500);
    let h = harness_with(
        MemoryFetcher::default(),
        Options {
            poll_timeout,
            ..Default::default()
        },
    );
    let (shutdown_tx, handle) = start(&h, None);
    // Both pipelines are idle, in the middle of a poll
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = Instant::now();
    let exits = stop(shutdown_tx, handle).await;

    assert!(
        stopping.elapsed() < poll_timeout,
        "pipelines took {:?} to stop",
        stopping.elapsed()
    );
    assert_eq!(exits, (PipelineExit::Shutdown, PipelineExit::Shutdown));
    assert!(h.matches.is_closed());
    assert!(h.players.is_closed());
}

#[tokio::test]
async fn test_lost_brokers_stop_only_their_pipeline() {
    let h = harness(MemoryFetcher::default().with_match("M1", &["P1"]));
    h.players.fail_brokers();
    let (shutdown_tx, handle) = start(&h, None);

    wait_until(|| h.players.is_closed()).await;
    let status = h.liveness.get_status();
    assert!(!status.healthy);
    assert_eq!(
        status.components["players_pipeline"],
        ComponentStatus::Unhealthy
    );

    // The match pipeline still runs
    h.matches.send_message("M1").await.unwrap();
    wait_until(|| h.store.archived("M1").is_some()).await;
    let exits = stop(shutdown_tx, handle).await;

    assert_eq!(exits, (PipelineExit::Shutdown, PipelineExit::BrokersDown));
}

#[tokio::test]
async fn test_unknown_seed_account_fails_the_run() {
    let h = harness(MemoryFetcher::default());
    let (_shutdown_tx, handle) = start(&h, Some("Nobody"));

    let result = handle.await.unwrap();

    assert!(matches!(result, Err(CrawlError::Seed { .. })));
    assert!(h.players.published().is_empty());
}

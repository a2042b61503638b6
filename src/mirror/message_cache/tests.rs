use tokio_util::sync::CancellationToken;

use super::*;
use crate::mirror::event_store::MemoryEventStore;
use crate::test_utils::{group_event, memory_store_with, stored, text_event};

fn timestamps(messages: &[NormalizedMessage]) -> Vec<i64> {
    messages.iter().map(|m| m.timestamp).collect()
}

struct Fixture {
    store: MemoryEventStore,
    names: NameDirectory,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl Fixture {
    fn new(store: MemoryEventStore) -> Self {
        Self {
            store,
            names: NameDirectory::new(),
            config: SyncConfig {
                scan_batch_size: 2,
                ..SyncConfig::default()
            },
            cancel: CancellationToken::new(),
        }
    }

    fn ctx(&self) -> ScanContext<'_> {
        ScanContext {
            store: &self.store,
            names: &self.names,
            config: &self.config,
            cancel: &self.cancel,
        }
    }
}

async fn five_message_chat() -> Fixture {
    let store = memory_store_with(
        (1..=5).map(|ts| text_event("P", ts % 2 == 0, ts, &format!("message {ts}"))),
    )
    .await;
    Fixture::new(store)
}

#[tokio::test]
async fn test_initial_load_then_older_page() {
    let fixture = five_message_chat().await;
    let mut cache = MessageCache::new(ChatId::from("P"));

    let initial = cache.load_initial(&fixture.ctx(), 2).await.unwrap();
    assert_eq!(timestamps(&initial), vec![4, 5]);
    assert_eq!(cache.state(), CacheState::Ready);
    assert_eq!(cache.oldest_cached_ts(), Some(4));
    assert!(!cache.older_exhausted());

    let page = cache.load_older(&fixture.ctx(), 4, 2).await.unwrap();
    assert_eq!(timestamps(&page.messages), vec![2, 3]);
    assert!(!page.exhausted);
    assert_eq!(timestamps(&cache.messages()), vec![2, 3, 4, 5]);
    assert_eq!(cache.oldest_cached_ts(), Some(2));
}

#[tokio::test]
async fn test_older_pages_become_empty_once_exhausted() {
    let fixture = five_message_chat().await;
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.load_initial(&fixture.ctx(), 2).await.unwrap();
    cache.load_older(&fixture.ctx(), 4, 2).await.unwrap();

    let last = cache.load_older(&fixture.ctx(), 2, 2).await.unwrap();
    assert_eq!(timestamps(&last.messages), vec![1]);
    assert!(last.exhausted);
    assert!(cache.older_exhausted());

    for _ in 0..3 {
        let again = cache.load_older(&fixture.ctx(), 1, 2).await.unwrap();
        assert!(again.messages.is_empty());
        assert!(again.exhausted);
        assert_eq!(cache.oldest_cached_ts(), Some(1));
        assert_eq!(cache.len(), 5);
    }
}

#[tokio::test]
async fn test_poll_appends_exactly_one_new_message() {
    let fixture = five_message_chat().await;
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.load_initial(&fixture.ctx(), 50).await.unwrap();
    assert_eq!(cache.newest_cached_ts(), Some(5));

    fixture
        .store
        .append_at(text_event("P", false, 9, "late arrival"), 9)
        .await;

    let delta = cache.load_newer(&fixture.ctx()).await.unwrap();
    assert_eq!(timestamps(&delta.added), vec![9]);
    assert_eq!(cache.newest_cached_ts(), Some(9));

    let repeat = cache.load_newer(&fixture.ctx()).await.unwrap();
    assert!(repeat.is_empty());
    assert_eq!(cache.len(), 6);
}

#[tokio::test]
async fn test_newer_accepts_uncached_message_sharing_newest_timestamp() {
    let fixture = five_message_chat().await;
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.load_initial(&fixture.ctx(), 50).await.unwrap();

    fixture
        .store
        .append_at(text_event("P", false, 5, "same second"), 5)
        .await;

    let delta = cache.load_newer(&fixture.ctx()).await.unwrap();
    assert_eq!(delta.added.len(), 1);
    assert_eq!(delta.added[0].preview, "same second");
}

#[tokio::test]
async fn test_incremental_loads_converge_with_single_full_load() {
    let store = memory_store_with(vec![
        text_event("P", false, 3, "c"),
        text_event("Q", false, 4, "other chat"),
        text_event("P", true, 1, "a"),
    ])
    .await;
    let fixture = Fixture::new(store);

    let mut incremental = MessageCache::new(ChatId::from("P"));
    incremental.load_initial(&fixture.ctx(), usize::MAX).await.unwrap();

    for (ts, body) in [(5, "e"), (5, "f"), (8, "g")] {
        fixture
            .store
            .append_at(text_event("P", false, ts, body), ts)
            .await;
        incremental.load_newer(&fixture.ctx()).await.unwrap();
    }
    incremental.load_newer(&fixture.ctx()).await.unwrap();

    let mut full = MessageCache::new(ChatId::from("P"));
    full.load_initial(&fixture.ctx(), usize::MAX).await.unwrap();

    assert_eq!(incremental.messages(), full.messages());
    assert_eq!(timestamps(&full.messages()), vec![1, 3, 5, 5, 8]);
}

#[tokio::test]
async fn test_ingest_single_twice_adds_one_message() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    let event = stored(1, text_event("P", false, 10, "hello"));

    let first = cache.ingest_single(&event, DedupKeyPolicy::ContentHash, &names);
    let second = cache.ingest_single(&event, DedupKeyPolicy::ContentHash, &names);

    assert!(matches!(first, IngestOutcome::Inserted(_)));
    assert_eq!(second, IngestOutcome::Duplicate);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_ingest_single_routes_other_chats_and_malformed_events() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));

    let other = cache.ingest_single(
        &stored(1, group_event("G", "S1", 1, "hey")),
        DedupKeyPolicy::ContentHash,
        &names,
    );
    assert_eq!(other, IngestOutcome::OtherChat(ChatId::from("G")));

    let mut broken = text_event("P", false, 2, "hi");
    broken.sender = Default::default();
    let malformed = cache.ingest_single(&stored(2, broken), DedupKeyPolicy::ContentHash, &names);
    assert!(matches!(malformed, IngestOutcome::Malformed(_)));
    assert!(cache.is_empty());
}

#[test]
fn test_redelivered_provider_id_keeps_first_occurrence() {
    let names = NameDirectory::new();
    let mut first = text_event("P", false, 10, "original");
    first.message_id = Some("M1".to_string());
    let mut redelivery = text_event("P", false, 10, "edited");
    redelivery.message_id = Some("M1".to_string());

    // Newest first, as the store returns them.
    let messages = collect_chat_messages(
        vec![stored(2, redelivery), stored(1, first)],
        &ChatId::from("P"),
        DedupKeyPolicy::ContentHash,
        &names,
    );

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].preview, "original");
}

#[test]
fn test_timestamp_sender_policy_coalesces_same_second_messages() {
    let names = NameDirectory::new();
    let events = vec![
        stored(1, text_event("P", false, 10, "one")),
        stored(2, text_event("P", false, 10, "two")),
    ];

    let coalesced = collect_chat_messages(
        events.clone(),
        &ChatId::from("P"),
        DedupKeyPolicy::TimestampSender,
        &names,
    );
    let distinct = collect_chat_messages(
        events,
        &ChatId::from("P"),
        DedupKeyPolicy::ContentHash,
        &names,
    );

    assert_eq!(coalesced.len(), 1);
    assert_eq!(coalesced[0].preview, "one");
    assert_eq!(distinct.len(), 2);
}

#[test]
fn test_initial_merge_keeps_messages_ingested_during_scan() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.begin_initial();

    let pushed = stored(9, text_event("P", false, 9, "pushed mid-scan"));
    cache.ingest_single(&pushed, DedupKeyPolicy::ContentHash, &names);

    let scanned = collect_chat_messages(
        vec![
            stored(1, text_event("P", false, 1, "a")),
            stored(2, text_event("P", false, 2, "b")),
        ],
        &ChatId::from("P"),
        DedupKeyPolicy::ContentHash,
        &names,
    );
    let retained = cache.apply_initial(
        ChatScan {
            messages: scanned,
            exhausted: true,
            cancelled: false,
        },
        2,
    );

    assert_eq!(timestamps(&retained), vec![2, 9]);
    assert_eq!(cache.oldest_cached_ts(), Some(2));
    assert_eq!(cache.newest_cached_ts(), Some(9));
    assert!(!cache.older_exhausted());
}

#[test]
fn test_older_includes_uncached_entries_sharing_the_cursor_timestamp() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    let mut a = text_event("P", false, 4, "a");
    a.message_id = Some("A".to_string());
    let mut b = text_event("P", false, 4, "b");
    b.message_id = Some("B".to_string());
    let events = vec![stored(1, a), stored(2, b)];

    let scan = |names: &NameDirectory| ChatScan {
        messages: collect_chat_messages(
            events.clone(),
            &ChatId::from("P"),
            DedupKeyPolicy::ContentHash,
            names,
        ),
        exhausted: true,
        cancelled: false,
    };

    cache.apply_initial(scan(&names), 1);
    assert_eq!(cache.messages()[0].id, "B");

    let page = cache.apply_older(scan(&names), 4, 10);
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].id, "A");
    assert!(page.exhausted);
}

#[test]
fn test_newer_leaves_trimmed_same_second_entries_to_older_pages() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    let events: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .enumerate()
        .map(|(i, id)| {
            let mut event = text_event("P", false, 5, id);
            event.message_id = Some(id.to_string());
            stored(i as i64 + 1, event)
        })
        .collect();
    let scan = |names: &NameDirectory| ChatScan {
        messages: collect_chat_messages(
            events.clone(),
            &ChatId::from("P"),
            DedupKeyPolicy::ContentHash,
            names,
        ),
        exhausted: true,
        cancelled: false,
    };

    cache.apply_initial(scan(&names), 2);
    let ids: Vec<_> = cache.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec!["B", "C"]);

    let delta = cache.apply_newer(scan(&names));
    assert!(delta.added.is_empty());
    assert_eq!(cache.len(), 2);

    let page = cache.apply_older(scan(&names), 5, 10);
    let ids: Vec<_> = page.messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec!["A"]);
}

#[test]
fn test_echo_is_replaced_by_correlated_confirmation() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.apply_initial(ChatScan::default(), 50);

    let echo = local_echo(ChatId::from("P"), "on my way", "corr-1", 100, false);
    assert!(cache.insert_echo(echo.clone()));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.newest_cached_ts(), None);

    let mut confirmation = text_event("P", true, 101, "on my way");
    confirmation.message_id = Some("PROVIDER-9".to_string());
    confirmation.correlation_id = Some("corr-1".to_string());

    let outcome = cache.ingest_single(
        &stored(1, confirmation),
        DedupKeyPolicy::ContentHash,
        &names,
    );

    match outcome {
        IngestOutcome::Confirmed { temp_id, message } => {
            assert_eq!(temp_id, echo.id);
            assert_eq!(message.id, "PROVIDER-9");
        }
        other => panic!("expected confirmation, got {other:?}"),
    }
    assert_eq!(cache.len(), 1);
    assert!(!cache.contains(&echo.id));
    assert_eq!(cache.pending_echo_count(), 0);
    assert_eq!(cache.newest_cached_ts(), Some(101));
}

#[test]
fn test_echo_is_matched_by_provider_id_from_sender() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.apply_initial(ChatScan::default(), 50);
    cache.insert_echo(local_echo(ChatId::from("P"), "hi", "corr-2", 50, false));

    assert!(cache.register_sent("corr-2", "PROVIDER-2").is_none());

    let mut confirmation = text_event("P", true, 51, "hi");
    confirmation.message_id = Some("PROVIDER-2".to_string());
    let outcome = cache.ingest_single(
        &stored(1, confirmation),
        DedupKeyPolicy::ContentHash,
        &names,
    );

    assert!(matches!(outcome, IngestOutcome::Confirmed { .. }));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_register_sent_after_confirmation_removes_echo() {
    let names = NameDirectory::new();
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.apply_initial(ChatScan::default(), 50);
    cache.insert_echo(local_echo(ChatId::from("P"), "hi", "corr-3", 50, false));

    let mut confirmation = text_event("P", true, 51, "hi");
    confirmation.message_id = Some("PROVIDER-3".to_string());
    cache.ingest_single(&stored(1, confirmation), DedupKeyPolicy::ContentHash, &names);
    assert_eq!(cache.len(), 2);

    let (temp_id, message) = cache.register_sent("corr-3", "PROVIDER-3").unwrap();
    assert_eq!(temp_id, "local:corr-3");
    assert_eq!(message.id, "PROVIDER-3");
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_failed_echo_stays_visible() {
    let mut cache = MessageCache::new(ChatId::from("P"));
    cache.apply_initial(ChatScan::default(), 50);
    cache.insert_echo(local_echo(ChatId::from("P"), "hi", "corr-4", 50, false));

    let failed = cache.mark_echo_failed("corr-4").unwrap();

    assert_eq!(failed.delivery, DeliveryState::Failed);
    assert_eq!(cache.get("local:corr-4").unwrap().delivery, DeliveryState::Failed);
    assert!(cache.mark_echo_failed("unknown").is_none());
}

#[tokio::test]
async fn test_unavailable_store_leaves_cache_unloaded() {
    let fixture = five_message_chat().await;
    fixture.store.set_available(false);
    let mut cache = MessageCache::new(ChatId::from("P"));

    let result = cache.load_initial(&fixture.ctx(), 2).await;

    assert!(matches!(result, Err(StoreError::Unavailable)));
    assert_eq!(cache.state(), CacheState::Unloaded);
}

#[tokio::test]
async fn test_cancelled_scan_does_not_mutate_cache() {
    let fixture = five_message_chat().await;
    fixture.cancel.cancel();
    let mut cache = MessageCache::new(ChatId::from("P"));

    let messages = cache.load_initial(&fixture.ctx(), 2).await.unwrap();

    assert!(messages.is_empty());
    assert_eq!(cache.state(), CacheState::Unloaded);
}

#[tokio::test]
async fn test_older_scan_falls_back_to_whole_log() {
    // Chat P's history sits behind a wall of other-chat traffic.
    let mut events: Vec<_> = (1..=3).map(|ts| text_event("P", false, ts, "old")).collect();
    events.extend((10..40).map(|ts| text_event("Q", false, ts, "noise")));
    events.push(text_event("P", false, 50, "recent"));
    let mut fixture = Fixture::new(memory_store_with(events).await);
    fixture.config.scan_window = 5;
    fixture.config.older_scan_window = 10;

    let mut cache = MessageCache::new(ChatId::from("P"));
    let initial = cache.load_initial(&fixture.ctx(), 50).await.unwrap();
    assert_eq!(timestamps(&initial), vec![50]);

    let page = cache.load_older(&fixture.ctx(), 50, 2).await.unwrap();
    assert_eq!(timestamps(&page.messages), vec![2, 3]);
}

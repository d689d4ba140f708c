use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::gateway::history::Role;
use crate::gateway::now_millis;
use crate::gateway::quota::QuotaWindow;
use crate::gateway::{Clock, SystemClock};

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn redis_url() -> Option<String> {
    env_nonempty("CHATGATE_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_prefix() -> String {
    let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("chatgate_test:{}:{n}", now_millis())
}

fn current_day() -> PeriodKey {
    QuotaWindow::Day.period_at(SystemClock.now_epoch_seconds())
}

#[test]
fn keys_are_namespaced_by_prefix() {
    let store = RedisStore::new("redis://127.0.0.1/")
        .expect("client")
        .with_prefix("tenant-a");
    let period = PeriodKey::new("2023-11-14", 1_700_006_400);
    assert_eq!(store.key_quota("u1", &period), "tenant-a:quota:u1:2023-11-14");
    assert_eq!(store.key_history("u1"), "tenant-a:history:u1");
}

#[tokio::test]
async fn redis_counter_rolls_back_over_limit_and_arms_expiry_once() {
    let Some(url) = redis_url() else {
        return;
    };

    let store = RedisStore::new(url)
        .expect("store")
        .with_prefix(test_prefix());
    store.ping().await.expect("ping");
    let period = current_day();

    let decision = store
        .adjust_counter("u2", &period, 4900, 5000)
        .await
        .expect("seed");
    assert!(decision.allowed);

    let decision = store
        .adjust_counter("u2", &period, 200, 5000)
        .await
        .expect("adjust");
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 100);
    assert_eq!(store.counter_used("u2", &period).await.expect("used"), 4900);

    let mut conn = store.connection().await.expect("conn");
    let ttl: i64 = conn.ttl(store.key_quota("u2", &period)).await.expect("ttl");
    assert!(ttl > 0);

    let decision = store
        .adjust_counter("u2", &period, -9000, 5000)
        .await
        .expect("refund");
    assert_eq!(decision.used, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_concurrent_adjusts_never_overshoot_limit() {
    let Some(url) = redis_url() else {
        return;
    };

    let store = Arc::new(
        RedisStore::new(url)
            .expect("store")
            .with_prefix(test_prefix()),
    );
    let period = current_day();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let store = store.clone();
        let period = period.clone();
        handles.push(tokio::spawn(async move {
            store
                .adjust_counter("shared", &period, 200, 5000)
                .await
                .expect("adjust")
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.expect("join").allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 25);
    assert_eq!(
        store.counter_used("shared", &period).await.expect("used"),
        5000
    );
}

#[tokio::test]
async fn redis_history_list_is_bounded_and_skips_garbage() {
    let Some(url) = redis_url() else {
        return;
    };

    let store = RedisStore::new(url)
        .expect("store")
        .with_prefix(test_prefix());
    let ttl = Duration::from_secs(60);

    for n in 0..6 {
        let turn = ConversationTurn::new(Role::User, format!("turn-{n}"));
        store.push_turn("u1", &turn, 4, ttl).await.expect("push");
    }
    let turns = store.range_turns("u1", 10).await.expect("range");
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[0].text, "turn-5");
    assert_eq!(turns[3].text, "turn-2");

    let mut conn = store.connection().await.expect("conn");
    let _: () = conn
        .lpush(store.key_history("u1"), "not json")
        .await
        .expect("lpush");
    let turns = store.range_turns("u1", 10).await.expect("range");
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[0].text, "turn-5");
}

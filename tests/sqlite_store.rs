#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::setup_store;
use webhook_pipeline::store::{Command, Reply, Store};

#[tokio::test]
async fn values_expire_after_their_ttl() {
    let db = setup_store().await;
    let store = db.guarded();

    store
        .set("short", "1", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    store.set("forever", "2", None).await.unwrap();

    assert_eq!(store.get("short").await.unwrap().as_deref(), Some("1"));
    assert!(store.pttl("short").await.unwrap().is_some());
    assert!(store.pttl("forever").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(store.get("short").await.unwrap(), None);
    assert!(!store.exists("short").await.unwrap());
    assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("2"));
}

#[tokio::test]
async fn set_nx_only_succeeds_once_until_expiry() {
    let db = setup_store().await;
    let store = db.guarded();

    assert!(store.set_nx("lease", "a", Some(Duration::from_millis(50))).await.unwrap());
    assert!(!store.set_nx("lease", "b", None).await.unwrap());
    assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("a"));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(store.set_nx("lease", "c", None).await.unwrap());
    assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("c"));
}

#[tokio::test]
async fn concurrent_set_nx_has_a_single_winner() {
    let db = setup_store().await;
    let store = db.guarded();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .set_nx("contended", &i.to_string(), Some(Duration::from_secs(60)))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn incr_counts_from_zero() {
    let db = setup_store().await;
    let store = db.guarded();

    assert_eq!(store.incr("counter").await.unwrap(), 1);
    assert_eq!(store.incr("counter").await.unwrap(), 2);
    assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("2"));
}

#[tokio::test]
async fn sorted_set_ranges_by_score() {
    let db = setup_store().await;
    let store = db.guarded();

    store.zadd("queue", "late", 300.0).await.unwrap();
    store.zadd("queue", "early", 100.0).await.unwrap();
    store.zadd("queue", "middle", 200.0).await.unwrap();
    store.zadd("queue", "early", 50.0).await.unwrap();

    let ready = store.zrange_by_score("queue", 0.0, 250.0, None).await.unwrap();
    let members: Vec<_> = ready.iter().map(|m| m.member.as_str()).collect();
    assert_eq!(members, vec!["early", "middle"]);

    let limited = store.zrange_by_score("queue", 0.0, 1000.0, Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(store.zscore("queue", "early").await.unwrap(), Some(50.0));
    assert_eq!(store.zcard("queue").await.unwrap(), 3);
    assert_eq!(store.zcount("queue", 150.0, 400.0).await.unwrap(), 2);

    assert!(store.zrem("queue", "middle").await.unwrap());
    assert!(!store.zrem("queue", "middle").await.unwrap());
    let all = store.zrange("queue", 0, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].member, "late");
}

#[tokio::test]
async fn lists_are_newest_first_and_trim_from_the_tail() {
    let db = setup_store().await;
    let store = db.guarded();

    store
        .pipeline(
            (1..=5)
                .map(|i| Command::lpush("list", i.to_string()))
                .collect(),
        )
        .await
        .unwrap();

    assert_eq!(store.llen("list").await.unwrap(), 5);
    assert_eq!(store.lrange("list", 0, 3).await.unwrap(), vec!["5", "4", "3"]);
    assert_eq!(store.lrange("list", 3, 10).await.unwrap(), vec!["2", "1"]);

    store.pipeline(vec![Command::ltrim("list", 2)]).await.unwrap();
    assert_eq!(store.lrange("list", 0, 10).await.unwrap(), vec!["5", "4"]);

    assert_eq!(store.lrem("list", "5").await.unwrap(), 1);
    assert_eq!(store.lrange("list", 0, 10).await.unwrap(), vec!["4"]);
}

#[tokio::test]
async fn sets_track_membership() {
    let db = setup_store().await;
    let store = db.guarded();

    assert!(store.sadd("index", "a").await.unwrap());
    assert!(!store.sadd("index", "a").await.unwrap());
    assert!(store.sadd("index", "b").await.unwrap());

    let mut members = store.smembers("index").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["a", "b"]);

    assert!(store.srem("index", "a").await.unwrap());
    assert_eq!(store.smembers("index").await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn del_removes_any_kind_of_key() {
    let db = setup_store().await;
    let store = db.guarded();

    store.zadd("z", "m", 1.0).await.unwrap();
    store.sadd("s", "m").await.unwrap();
    store.pipeline(vec![Command::lpush("l", "m")]).await.unwrap();

    for key in ["z", "s", "l"] {
        assert!(store.del(key).await.unwrap(), "{key} should be deleted");
    }
    assert_eq!(store.zcard("z").await.unwrap(), 0);
    assert!(store.smembers("s").await.unwrap().is_empty());
    assert_eq!(store.llen("l").await.unwrap(), 0);
}

#[tokio::test]
async fn keys_match_prefix_literally() {
    let db = setup_store().await;
    let store = db.guarded();

    store.set("webhook:a", "1", None).await.unwrap();
    store.set("webhook:b", "1", None).await.unwrap();
    store.set("webhook_c", "1", None).await.unwrap();
    store.set("other", "1", None).await.unwrap();
    store.lpush("webhook:list", "x").await.unwrap();
    store.lpush("webhook:list", "y").await.unwrap();
    store.sadd("webhook:set", "x").await.unwrap();

    let mut keys = store.keys("webhook:").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["webhook:a", "webhook:b", "webhook:list", "webhook:set"]);
}

#[tokio::test]
async fn pipeline_replies_in_command_order() {
    let db = setup_store().await;
    let store: Arc<dyn Store> = db.store.clone();

    let replies = store
        .pipeline(vec![
            Command::set("p", "1", None),
            Command::incr("n"),
            Command::sadd("s", "x"),
        ])
        .await
        .unwrap();
    assert_eq!(replies, vec![Reply::Ok, Reply::Int(1), Reply::Bool(true)]);

    let values = store
        .pipeline(vec![Command::Get { key: "p".to_string() }, Command::incr("n")])
        .await
        .unwrap();
    assert_eq!(values, vec![Reply::Value("1".to_string()), Reply::Int(2)]);

    assert_eq!(store.execute(Command::Ping).await.unwrap(), Reply::Ok);
}

//! End-to-end single-key read scenarios against mock replicas.

use super::{FailMode, MockReplica, RecordingListener, TestBed, ThrottleListener};
use crate::error::Error;
use crate::event::Call;
use crate::latch::Policy;
use crate::pool::Replica;
use crate::metrics::{
    ATTEMPT_INITIAL, ATTEMPT_SECOND, HIT_NO, HIT_YES, REASON_KEY_HASH_COLLISION,
    REASON_NULL_CLIENT, REASON_THROTTLED, RESULT_SUCCESS,
};
use crate::pool::PoolManager;
use crate::value::StringTranscoder;

const TC: StringTranscoder = StringTranscoder;

#[tokio::test]
async fn test_hit_on_primary() {
    let bed = TestBed::new("movies", Some("p"), &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    let listener = RecordingListener::new();
    bed.bus.register(listener.clone());
    bed.replicas[0].seed("p:k", "v");

    let value = bed.client.get("k", &TC).await.unwrap();

    assert_eq!(value.as_deref(), Some("v"));
    assert_eq!(listener.status_attribute().as_deref(), Some("GHIT"));
    assert_eq!(bed.replicas[1].call_count("get"), 0);

    let group = bed.replicas[0].server_group().clone();
    let timer = bed.client.metrics().operation_timer(
        Call::Get,
        Some(HIT_YES),
        RESULT_SUCCESS,
        1,
        Some(&group),
        0,
    );
    assert_eq!(timer.count(), 1);
    assert_eq!(timer.tags().iter().find(|t| t.0 == "attempt").unwrap().1, ATTEMPT_INITIAL);
}

#[tokio::test]
async fn test_primary_miss_fallback_hit() {
    let bed = TestBed::new("movies", Some("p"), &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.replicas[1].seed("p:k", "v");

    let value = bed.client.get("k", &TC).await.unwrap();

    assert_eq!(value.as_deref(), Some("v"));
    assert_eq!(bed.replicas[0].call_count("get"), 1);
    assert_eq!(bed.replicas[1].call_count("get"), 1);

    let group = bed.replicas[1].server_group().clone();
    let timer = bed.client.metrics().operation_timer(
        Call::Get,
        Some(HIT_YES),
        RESULT_SUCCESS,
        2,
        Some(&group),
        0,
    );
    assert_eq!(timer.count(), 1);
    assert_eq!(timer.tags().iter().find(|t| t.0 == "attempt").unwrap().1, ATTEMPT_SECOND);
}

#[tokio::test]
async fn test_full_miss_is_not_an_error() {
    let bed = TestBed::new("movies", Some("p"), &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.props.set("movies.throw.exception", "true");
    let listener = RecordingListener::new();
    bed.bus.register(listener.clone());

    let value = bed.client.get("k", &TC).await.unwrap();

    assert!(value.is_none());
    assert_eq!(listener.status_attribute().as_deref(), Some("GMISS"));
    assert_eq!(listener.errors.load(std::sync::atomic::Ordering::SeqCst), 0);

    let group = bed.replicas[0].server_group().clone();
    let timer = bed.client.metrics().operation_timer(
        Call::Get,
        Some(HIT_NO),
        RESULT_SUCCESS,
        2,
        Some(&group),
        0,
    );
    assert_eq!(timer.count(), 1);
}

#[tokio::test]
async fn test_fallback_stops_at_first_hit() {
    let bed = TestBed::new(
        "movies",
        None,
        &[("movies-a", "zone-a"), ("movies-b", "zone-b"), ("movies-c", "zone-c")],
    );
    bed.replicas[1].seed("k", "from-b");
    bed.replicas[2].seed("k", "from-c");

    let value = bed.client.get("k", &TC).await.unwrap();

    assert_eq!(value.as_deref(), Some("from-b"));
    assert_eq!(bed.replicas[2].call_count("get"), 0);
}

#[tokio::test]
async fn test_full_miss_issues_one_call_per_replica() {
    let bed = TestBed::new(
        "movies",
        None,
        &[("movies-a", "zone-a"), ("movies-b", "zone-b"), ("movies-c", "zone-c")],
    );

    assert!(bed.client.get("k", &TC).await.unwrap().is_none());

    for replica in &bed.replicas {
        assert_eq!(replica.call_count("get"), 1);
    }
}

#[tokio::test]
async fn test_fallback_disabled_by_property() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.props.set("movies.fallback.zone", "false");
    bed.replicas[1].seed("k", "v");

    assert!(bed.client.get("k", &TC).await.unwrap().is_none());
    assert_eq!(bed.replicas[1].call_count("get"), 0);
}

#[tokio::test]
async fn test_primary_error_swallowed_when_fallback_hits() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.props.set("movies.throw.exception", "true");
    bed.replicas[0].fail_with(Some(FailMode::Connect));
    bed.replicas[1].seed("k", "v");

    let value = bed.client.get("k", &TC).await.unwrap();
    assert_eq!(value.as_deref(), Some("v"));
}

#[tokio::test]
async fn test_error_on_last_attempt_honours_throw_flag() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.replicas[0].fail_with(Some(FailMode::Connect));
    bed.replicas[1].fail_with(Some(FailMode::Connect));

    // Swallowed by default.
    assert!(bed.client.get("k", &TC).await.unwrap().is_none());

    // Propagated when throwing.
    bed.props.set("movies.throw.exception", "true");
    let err = bed.client.get("k", &TC).await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
}

#[tokio::test]
async fn test_no_pool_fast_fails() {
    let manager = PoolManager::new();
    let client = crate::client::CacheClient::builder("movies", manager).build().unwrap();

    assert!(client.get("k", &TC).await.unwrap().is_none());
    assert_eq!(
        client.metrics().fast_fail_count(REASON_NULL_CLIENT, Call::Get),
        1
    );
}

#[tokio::test]
async fn test_throttled_read() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);
    bed.replicas[0].seed("k", "v");
    let throttle = ThrottleListener::new();
    bed.bus.register(throttle.clone());
    throttle.reject(true);

    assert!(bed.client.get("k", &TC).await.unwrap().is_none());
    assert_eq!(
        bed.client.metrics().fast_fail_count(REASON_THROTTLED, Call::Get),
        1
    );
    assert_eq!(bed.replicas[0].call_count("get"), 0);

    bed.props.set("movies.throw.exception", "true");
    let err = bed.client.get("k", &TC).await.unwrap_err();
    assert!(matches!(err, Error::Throttled { .. }));

    throttle.reject(false);
    assert_eq!(bed.client.get("k", &TC).await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn test_near_cache_serves_repeat_reads() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);
    bed.props.set("movies.use.inmemory.cache", "true");
    bed.replicas[0].seed("k", "v");

    for _ in 0..3 {
        assert_eq!(bed.client.get("k", &TC).await.unwrap().as_deref(), Some("v"));
    }
    assert_eq!(bed.replicas[0].call_count("get"), 1);
}

#[tokio::test]
async fn test_near_cache_caches_misses() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);
    bed.props.set("movies.use.inmemory.cache", "true");

    for _ in 0..3 {
        assert!(bed.client.get("missing", &TC).await.unwrap().is_none());
    }
    assert_eq!(bed.replicas[0].call_count("get"), 1);
}

#[tokio::test]
async fn test_get_and_touch_refreshes_all_copies() {
    let bed = TestBed::new("movies", Some("p"), &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.seed(&[0, 1], "k", "v");
    let listener = RecordingListener::new();
    bed.bus.register(listener.clone());

    let value = bed.client.get_and_touch("k", 300, &TC).await.unwrap();

    assert_eq!(value.as_deref(), Some("v"));
    assert_eq!(listener.status_attribute().as_deref(), Some("THIT"));
    assert_eq!(bed.replicas[0].stored_ttl("p:k"), Some(300));
    assert_eq!(bed.replicas[1].stored_ttl("p:k"), Some(300));
}

#[tokio::test]
async fn test_get_and_touch_miss() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);
    let listener = RecordingListener::new();
    bed.bus.register(listener.clone());

    assert!(bed.client.get_and_touch("k", 300, &TC).await.unwrap().is_none());
    assert_eq!(listener.status_attribute().as_deref(), Some("TMISS"));
    assert_eq!(bed.replicas[0].call_count("touch"), 0);
}

#[tokio::test]
async fn test_ignore_touch_degrades_to_get() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);
    bed.props.set("movies.ignore.touch", "true");
    bed.replicas[0].seed("k", "v");

    let value = bed.client.get_and_touch("k", 300, &TC).await.unwrap();

    assert_eq!(value.as_deref(), Some("v"));
    assert_eq!(bed.replicas[0].call_count("touch"), 0);
}

#[tokio::test]
async fn test_meta_get_and_meta_debug() {
    let bed = TestBed::new("movies", Some("p"), &[("movies-a", "zone-a"), ("movies-b", "zone-b")]);
    bed.replicas[1].seed("p:k", "v");

    // Fallback applies to meta reads as well.
    let item = bed.client.meta_get("k").await.unwrap().unwrap();
    assert_eq!(item.data.data.as_ref(), b"v");
    assert!(item.metadata.fetched);

    let meta = bed.client.meta_debug("k").await.unwrap().unwrap();
    assert_eq!(meta.size_bytes, Some(1));

    assert!(bed.client.meta_get("absent").await.unwrap().is_none());
    assert!(bed.client.meta_debug("absent").await.unwrap().is_none());
}

#[tokio::test]
async fn test_meta_get_unseals_hashed_values() {
    let bed = TestBed::new("movies", Some("p"), &[("movies-a", "zone-a")]);
    bed.props.set("movies.hash.key", "true");

    let latch = bed
        .client
        .set("k", &"v".to_string(), &TC, None, Some(Policy::All))
        .await
        .unwrap();
    assert!(latch.await_policy(std::time::Duration::from_secs(1)).await);

    let item = bed.client.meta_get("k").await.unwrap().unwrap();
    assert_eq!(item.data.data.as_ref(), b"v");

    // An envelope bound to a different canonical key reads as a miss.
    let stored = bed.replicas[0].stored(&bed.wire_key("k", false)).unwrap();
    bed.replicas[0].seed_data(&bed.wire_key("k2", false), stored);
    assert!(bed.client.meta_get("k2").await.unwrap().is_none());
    assert_eq!(
        bed.client
            .metrics()
            .internal_fail_count(REASON_KEY_HASH_COLLISION, Call::MetaGet),
        1
    );
}

#[tokio::test]
async fn test_duet_replica_gets_unprefixed_key() {
    let normal = MockReplica::new("movies-a", "zone-a");
    let duet = MockReplica::duet("movies-duet", "zone-b");
    let bed = TestBed::with_replicas("movies", Some("p"), vec![normal, duet]);

    // The duet replica stores under the bare application key.
    bed.replicas[1].seed("k", "v");

    let value = bed.client.get("k", &TC).await.unwrap();
    assert_eq!(value.as_deref(), Some("v"));
    assert_eq!(bed.replicas[1].calls(), vec!["get k".to_string()]);
    assert_eq!(bed.replicas[0].calls(), vec!["get p:k".to_string()]);
}

#[tokio::test]
async fn test_alias_repoints_pool() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);
    bed.replicas[0].seed("k", "original");

    let shadow = MockReplica::new("shadow-a", "zone-a");
    shadow.seed("k", "shadow");
    let shadow_pool = super::MockPool::new(vec![shadow]);
    bed.manager.register("movies-shadow", shadow_pool);

    assert_eq!(bed.client.get("k", &TC).await.unwrap().as_deref(), Some("original"));

    bed.props.set("PoolManager.movies.alias", "movies-shadow");
    assert_eq!(bed.client.get("k", &TC).await.unwrap().as_deref(), Some("shadow"));

    bed.props.unset("PoolManager.movies.alias");
    assert_eq!(bed.client.get("k", &TC).await.unwrap().as_deref(), Some("original"));
}

#[tokio::test]
async fn test_invalid_keys_rejected() {
    let bed = TestBed::new("movies", None, &[("movies-a", "zone-a")]);

    assert!(matches!(bed.client.get("", &TC).await, Err(Error::InvalidKey(_))));
    assert!(matches!(bed.client.get("a b", &TC).await, Err(Error::InvalidKey(_))));

    let long = "k".repeat(300);
    assert!(matches!(bed.client.get(&long, &TC).await, Err(Error::InvalidKey(_))));

    // Auto-hash admits over-long keys.
    bed.props.set("movies.auto.hash.keys", "true");
    assert!(bed.client.get(&long, &TC).await.unwrap().is_none());
}

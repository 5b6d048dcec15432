#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use regowall_core::RateLimiter;

#[test]
fn burst_then_one_token_per_interval() {
    // R = 2 tokens/s, B = 3
    let limiter = RateLimiter::new(2.0, 3);
    let t0 = Utc.with_ymd_and_hms(2020, 3, 6, 14, 13, 12).unwrap();

    for i in 0..3 {
        assert!(limiter.is_allowed("1.2.3.4", t0), "call {i} within burst");
    }
    assert!(!limiter.is_allowed("1.2.3.4", t0));

    // 1/R = 500ms later exactly one more
    let t1 = t0 + Duration::milliseconds(500);
    assert!(limiter.is_allowed("1.2.3.4", t1));
    assert!(!limiter.is_allowed("1.2.3.4", t1));
}

#[test]
fn every_matches_interval_semantics() {
    // one token every 2s, burst 1
    let limiter = RateLimiter::every(std::time::Duration::from_secs(2), 1);
    let t0 = Utc.with_ymd_and_hms(2020, 3, 6, 0, 0, 0).unwrap();

    assert!(limiter.is_allowed("k", t0));
    assert!(!limiter.is_allowed("k", t0 + Duration::seconds(1)));
    assert!(limiter.is_allowed("k", t0 + Duration::seconds(2)));
}

#[test]
fn keys_do_not_share_buckets() {
    let limiter = RateLimiter::new(1.0, 1);
    let t = Utc::now();
    assert!(limiter.is_allowed("a", t));
    assert!(!limiter.is_allowed("a", t));
    assert!(limiter.is_allowed("b", t));
    assert_eq!(limiter.tracked_keys(), 2);
}

#[test]
fn replayed_older_events_do_not_mint_tokens() {
    let limiter = RateLimiter::new(1.0, 1);
    let t0 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 10).unwrap();

    assert!(limiter.is_allowed("k", t0));
    // out-of-order event from the past
    assert!(!limiter.is_allowed("k", t0 - Duration::seconds(5)));
    // the clock did not move back: one second after t0 refills exactly one
    assert!(limiter.is_allowed("k", t0 + Duration::seconds(1)));
    assert!(!limiter.is_allowed("k", t0 + Duration::seconds(1)));
}

#[test]
fn refilled_buckets_are_evicted() {
    let limiter = RateLimiter::new(1.0, 2);
    let t0 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();

    assert!(limiter.is_allowed("drained", t0));
    assert!(limiter.is_allowed("drained", t0));
    assert!(limiter.is_allowed("half", t0 + Duration::seconds(1)));

    // at t0+1s: "drained" holds 1 token, "half" holds 1 token
    assert_eq!(limiter.evict_refilled(t0 + Duration::seconds(1)), 0);
    // at t0+3s both are full again
    assert_eq!(limiter.evict_refilled(t0 + Duration::seconds(3)), 2);
    assert_eq!(limiter.tracked_keys(), 0);
}

#[test]
fn same_key_is_serialized_across_threads() {
    let limiter = Arc::new(RateLimiter::new(0.0, 50));
    let t = Utc::now();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || (0..20).filter(|_| limiter.is_allowed("hot", t)).count())
        })
        .collect();

    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(granted, 50);
}

#[test]
fn one_token_after_exactly_one_interval_at_odd_rates() {
    let t0 = Utc.with_ymd_and_hms(2022, 5, 1, 8, 0, 0).unwrap();

    let limiter = RateLimiter::every(std::time::Duration::from_millis(13), 1);
    assert!(limiter.is_allowed("k", t0));
    assert!(!limiter.is_allowed("k", t0));
    let t1 = t0 + Duration::milliseconds(13);
    assert!(limiter.is_allowed("k", t1));
    assert!(!limiter.is_allowed("k", t1));

    // 1/R is not exact in binary floating point
    let limiter = RateLimiter::new(1.0 / 0.021, 1);
    assert_eq!(limiter.interval(), std::time::Duration::from_millis(21));
    assert!(limiter.is_allowed("k", t0));
    assert!(!limiter.is_allowed("k", t0 + Duration::milliseconds(20)));
    assert!(limiter.is_allowed("k", t0 + Duration::milliseconds(21)));
}

#[test]
fn every_interval_up_to_five_seconds_refills_exactly() {
    let t0 = Utc.with_ymd_and_hms(2022, 5, 1, 8, 0, 0).unwrap();
    for ms in (1..=5000u64).step_by(7) {
        let limiter = RateLimiter::new(1000.0 / ms as f64, 2);
        let key = ms.to_string();
        assert!(limiter.is_allowed(&key, t0));
        assert!(limiter.is_allowed(&key, t0));
        assert!(!limiter.is_allowed(&key, t0));
        let t1 = t0 + Duration::milliseconds(ms as i64);
        assert!(limiter.is_allowed(&key, t1), "interval {ms}ms");
        assert!(!limiter.is_allowed(&key, t1), "interval {ms}ms");
    }
}

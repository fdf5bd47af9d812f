use std::time::Duration;

use mochi_sync_core::contract::{Client, MockClient};
use mochi_sync_core::ratelimit::{RateLimit, RateLimited, TokenBucket};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn burst_is_immediate_then_throttled() {
    let bucket = TokenBucket::new(RateLimit {
        per_second: 2.0,
        burst: 3,
    });
    let start = Instant::now();
    for _ in 0..3 {
        bucket.acquire().await;
    }
    assert_eq!(start.elapsed(), Duration::ZERO);

    bucket.acquire().await;
    bucket.acquire().await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1100), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn idle_time_refills_the_bucket() {
    let bucket = TokenBucket::new(RateLimit {
        per_second: 1.0,
        burst: 2,
    });
    bucket.acquire().await;
    bucket.acquire().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let start = Instant::now();
    bucket.acquire().await;
    bucket.acquire().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn wrapped_client_calls_are_throttled() {
    let mut inner = MockClient::new();
    inner.expect_list_templates().times(4).returning(|| Ok(Vec::new()));
    let client = RateLimited::new(
        inner,
        RateLimit {
            per_second: 4.0,
            burst: 1,
        },
    );

    let start = Instant::now();
    for _ in 0..4 {
        client.list_templates().await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_millis(750));
}

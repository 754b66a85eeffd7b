//! `RedisDelayedQueue` against a real Redis started with testcontainers.
//!
//! Docker must be running. Each test gets its own container, so key prefixes
//! never collide.

use std::time::Duration;

use event_booker::config::QueueConfig;
use event_booker::queue::{DelayedQueue, RedisDelayedQueue};
use event_booker::redis_client::RedisClient;
use redis::aio::ConnectionManager;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::{Redis, REDIS_PORT};

struct Setup {
    _container: ContainerAsync<Redis>,
    conn: ConnectionManager,
    queue: RedisDelayedQueue,
}

async fn setup(consumer: &str) -> Setup {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");

    let client = RedisClient::new(&format!("redis://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to redis");
    let queue = RedisDelayedQueue::new(
        &client,
        &QueueConfig {
            prefix: "test:expiry".to_string(),
            consumer: consumer.to_string(),
            poll_interval_ms: 10,
            redelivery_delay_ms: 50,
        },
    );

    Setup {
        _container: container,
        conn: client.conn,
        queue,
    }
}

async fn count(conn: &mut ConnectionManager, command: &str, key: &str) -> usize {
    let n: usize = redis::cmd(command)
        .arg(key)
        .query_async(conn)
        .await
        .unwrap();
    n
}

#[tokio::test]
async fn delayed_messages_wait_until_due() {
    let mut s = setup("worker-a").await;
    let keys = s.queue.keys().clone();

    s.queue.publish("now", Duration::ZERO).await.unwrap();
    s.queue.publish("later", Duration::from_secs(60)).await.unwrap();

    let batch = s.queue.fetch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload(), "now");
    assert_eq!(batch[0].redeliveries(), 0);

    assert_eq!(count(&mut s.conn, "ZCARD", &keys.waiting).await, 1);
    assert_eq!(count(&mut s.conn, "LLEN", &keys.ready).await, 0);
    assert_eq!(count(&mut s.conn, "LLEN", &keys.processing).await, 1);

    for delivery in batch {
        delivery.ack().await.unwrap();
    }
    assert_eq!(count(&mut s.conn, "LLEN", &keys.processing).await, 0);
    assert!(s.queue.fetch(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn nack_requeues_with_count_or_dead_letters() {
    let mut s = setup("worker-a").await;
    let keys = s.queue.keys().clone();

    s.queue.publish("flaky", Duration::ZERO).await.unwrap();
    let first = s.queue.fetch(1).await.unwrap().pop().unwrap();
    let id = first.id();
    first.nack(true).await.unwrap();

    assert_eq!(count(&mut s.conn, "LLEN", &keys.processing).await, 0);
    assert_eq!(count(&mut s.conn, "ZCARD", &keys.waiting).await, 1);
    // Повтор только после задержки повторной доставки
    assert!(s.queue.fetch(1).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let second = s.queue.fetch(1).await.unwrap().pop().unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.payload(), "flaky");
    assert_eq!(second.redeliveries(), 1);

    second.nack(false).await.unwrap();
    assert_eq!(count(&mut s.conn, "LLEN", &keys.processing).await, 0);
    assert_eq!(count(&mut s.conn, "ZCARD", &keys.waiting).await, 0);
    assert_eq!(count(&mut s.conn, "LLEN", &keys.dead).await, 1);
}

#[tokio::test]
async fn recover_returns_abandoned_deliveries() {
    let mut s = setup("worker-a").await;
    let keys = s.queue.keys().clone();

    s.queue.publish("one", Duration::ZERO).await.unwrap();
    s.queue.publish("two", Duration::ZERO).await.unwrap();

    let abandoned = s.queue.fetch(10).await.unwrap();
    let ids: Vec<_> = abandoned.iter().map(|d| d.id()).collect();
    assert_eq!(ids.len(), 2);
    // Обработчик упал, ничего не подтвердив
    drop(abandoned);

    assert_eq!(s.queue.recover().await.unwrap(), 2);
    assert_eq!(count(&mut s.conn, "LLEN", &keys.processing).await, 0);
    assert_eq!(count(&mut s.conn, "LLEN", &keys.ready).await, 2);

    let again = s.queue.fetch(10).await.unwrap();
    let mut payloads: Vec<&str> = again.iter().map(|d| d.payload()).collect();
    payloads.sort_unstable();
    assert_eq!(payloads, ["one", "two"]);
    assert!(again.iter().all(|d| ids.contains(&d.id())));
    assert_eq!(s.queue.recover().await.unwrap(), 2);
}

#[tokio::test]
async fn recover_only_touches_own_processing_list() {
    let s = setup("worker-a").await;
    let other = RedisDelayedQueue::new(
        &RedisClient { conn: s.conn.clone() },
        &QueueConfig {
            prefix: "test:expiry".to_string(),
            consumer: "worker-b".to_string(),
            poll_interval_ms: 10,
            redelivery_delay_ms: 50,
        },
    );

    s.queue.publish("mine", Duration::ZERO).await.unwrap();
    let held = other.fetch(1).await.unwrap();
    assert_eq!(held.len(), 1);

    assert_eq!(s.queue.recover().await.unwrap(), 0);
    assert!(s.queue.fetch(1).await.unwrap().is_empty());
    assert_eq!(other.recover().await.unwrap(), 1);
}

#[tokio::test]
async fn unreadable_envelope_goes_to_dead_list() {
    let mut s = setup("worker-a").await;
    let keys = s.queue.keys().clone();

    let _: () = redis::cmd("RPUSH")
        .arg(&keys.ready)
        .arg("not an envelope")
        .query_async(&mut s.conn)
        .await
        .unwrap();
    s.queue.publish("fine", Duration::ZERO).await.unwrap();

    let batch = s.queue.fetch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload(), "fine");
    assert_eq!(count(&mut s.conn, "LLEN", &keys.dead).await, 1);
    assert_eq!(count(&mut s.conn, "LLEN", &keys.processing).await, 1);
}

use std::time::Duration;

use chrono::{Days, Utc};
use common_kafka::test::create_mock_kafka;
use common_kafka::CRAWL_JOBS_TOPIC;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;
use rdkafka::{ClientConfig, Message};
use sqlx::PgPool;
use topk_core::test_utils::key;
use topk_core::{CounterStore, CrawlJob, PgCounterStore, ScheduleStatus, ScheduleStore};
use topk_scheduler::config::SchedulerSettings;
use topk_scheduler::scheduler::Scheduler;

fn settings(poll_batch_size: i64) -> SchedulerSettings {
    SchedulerSettings {
        jobs_topic: CRAWL_JOBS_TOPIC.to_string(),
        poll_batch_size,
        stale_after: chrono::Duration::hours(1),
        initial_lookback: chrono::Duration::hours(24),
        counter_retention_days: 35,
    }
}

async fn scheduler(
    db: PgPool,
    poll_batch_size: i64,
) -> (
    MockCluster<'static, DefaultProducerContext>,
    Scheduler,
    StreamConsumer,
) {
    let (cluster, kafka_producer) = create_mock_kafka().await;
    cluster
        .create_topic(CRAWL_JOBS_TOPIC, 1, 1)
        .expect("failed to create mock topic");

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", cluster.bootstrap_servers())
        .set("group.id", "scheduler_test")
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .create()
        .expect("failed to create consumer");
    consumer
        .subscribe(&[CRAWL_JOBS_TOPIC])
        .expect("failed to subscribe");

    let scheduler = Scheduler {
        store: ScheduleStore::from_pool(db.clone()),
        counters: PgCounterStore::from_pool(db),
        kafka_producer,
        settings: settings(poll_batch_size),
        metrics_labels: vec![],
    };
    (cluster, scheduler, consumer)
}

async fn next_job(consumer: &StreamConsumer) -> (String, CrawlJob) {
    let message = tokio::time::timeout(Duration::from_secs(10), consumer.recv())
        .await
        .expect("timed out waiting for a crawl job")
        .expect("failed to receive crawl job");
    let key = String::from_utf8(message.key().expect("job has no key").to_vec())
        .expect("key is not utf8");
    let job = serde_json::from_slice(message.payload().expect("job has no payload"))
        .expect("job is not valid json");
    (key, job)
}

#[sqlx::test(migrations = "../topk-core/migrations")]
async fn poll_enqueues_due_schedules(db: PgPool) {
    let (_cluster, scheduler, consumer) = scheduler(db, 500).await;
    let now = Utc::now();
    scheduler.store.register("u1", "spotify", now).await.unwrap();
    scheduler
        .store
        .register("u2", "spotify", now + chrono::Duration::hours(1))
        .await
        .unwrap();

    let result = scheduler.poll().await.unwrap();
    assert_eq!(result.claimed.len(), 1);
    assert_eq!(result.publish_failures, 0);

    let (key, job) = next_job(&consumer).await;
    assert_eq!(key, "u1");
    assert_eq!(job.user_id, "u1");
    assert_eq!(job.provider, "spotify");
    // First crawl goes back by the initial lookback
    let lookback = (job.enqueued_at - chrono::Duration::hours(24)).timestamp();
    assert_eq!(job.since, lookback);

    let u1 = scheduler.store.get("u1", "spotify").await.unwrap().unwrap();
    assert_eq!(u1.status, ScheduleStatus::Enqueued);
    let u2 = scheduler.store.get("u2", "spotify").await.unwrap().unwrap();
    assert_eq!(u2.status, ScheduleStatus::Idle);

    // Nothing is due anymore
    let result = scheduler.poll().await.unwrap();
    assert!(result.claimed.is_empty());
}

#[sqlx::test(migrations = "../topk-core/migrations")]
async fn poll_drains_every_batch(db: PgPool) {
    let (_cluster, scheduler, consumer) = scheduler(db, 2).await;
    let now = Utc::now();
    for user in ["u1", "u2", "u3", "u4", "u5"] {
        scheduler.store.register(user, "spotify", now).await.unwrap();
    }

    let result = scheduler.poll().await.unwrap();
    assert_eq!(result.claimed.len(), 5);

    let mut users = Vec::new();
    for _ in 0..5 {
        let (key, job) = next_job(&consumer).await;
        assert_eq!(key, job.user_id);
        users.push(job.user_id);
    }
    users.sort();
    assert_eq!(users, vec!["u1", "u2", "u3", "u4", "u5"]);
}

#[sqlx::test(migrations = "../topk-core/migrations")]
async fn job_resumes_from_last_success(db: PgPool) {
    let (_cluster, scheduler, consumer) = scheduler(db, 500).await;
    let start = Utc::now() - chrono::Duration::days(2);
    let store = &scheduler.store;
    store.register("u1", "spotify", start).await.unwrap();

    // One full cycle, ending with the row due again right away
    assert_eq!(store.claim_due(start, 10).await.unwrap().len(), 1);
    assert!(store
        .mark_running("u1", "spotify", start)
        .await
        .unwrap()
        .is_some());
    assert!(store
        .complete("u1", "spotify", start, chrono::Duration::hours(24), start)
        .await
        .unwrap());

    let result = scheduler.poll().await.unwrap();
    assert_eq!(result.claimed.len(), 1);
    let (_, job) = next_job(&consumer).await;
    assert_eq!(job.since, start.timestamp());
}

#[sqlx::test(migrations = "../topk-core/migrations")]
async fn reconcile_resets_lost_jobs(db: PgPool) {
    let (_cluster, scheduler, _consumer) = scheduler(db, 500).await;
    let long_ago = Utc::now() - chrono::Duration::hours(3);
    let store = &scheduler.store;
    store.register("lost", "spotify", long_ago).await.unwrap();
    store.register("fresh", "spotify", Utc::now()).await.unwrap();

    // Claimed hours ago and never picked up
    assert_eq!(store.claim_due(long_ago, 10).await.unwrap().len(), 1);
    // Claimed just now, still in flight
    assert_eq!(store.claim_due(Utc::now(), 10).await.unwrap().len(), 1);

    assert_eq!(scheduler.reconcile().await.unwrap(), 1);

    let lost = store.get("lost", "spotify").await.unwrap().unwrap();
    assert_eq!(lost.status, ScheduleStatus::Idle);
    let fresh = store.get("fresh", "spotify").await.unwrap().unwrap();
    assert_eq!(fresh.status, ScheduleStatus::Enqueued);

    // Idempotent
    assert_eq!(scheduler.reconcile().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../topk-core/migrations")]
async fn retention_deletes_old_days_only(db: PgPool) {
    let (_cluster, scheduler, _consumer) = scheduler(db, 500).await;
    let today = Utc::now().date_naive();
    let old = today.checked_sub_days(Days::new(40)).unwrap();
    let kept = today.checked_sub_days(Days::new(30)).unwrap();

    let counters = &scheduler.counters;
    counters.increment(&key("u1", old, "a"), 3).await.unwrap();
    counters.increment(&key("u1", kept, "a"), 2).await.unwrap();
    counters.increment(&key("u1", today, "b"), 1).await.unwrap();

    assert_eq!(scheduler.enforce_retention().await.unwrap(), 1);

    let mut remaining = counters
        .counts_for_days("u1", &[old, kept, today])
        .await
        .unwrap();
    remaining.sort_by_key(|c| c.day);
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].day, kept);
    assert_eq!(remaining[1].day, today);
}

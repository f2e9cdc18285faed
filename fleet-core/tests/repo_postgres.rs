//! Integration tests against a real Postgres container, grounded on the
//! teacher's `golem-registry-service/tests/repo/postgres.rs` harness:
//! `test-r` test dependencies wrapping a `testcontainers` Postgres instance,
//! migrated once per test binary invocation's dependency graph.

use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use fleet_core::config::DbConfig;
use fleet_core::db::postgres::{migrate, PostgresPool};
use fleet_core::db::Pool as _;
use fleet_core::model::{GroupId, ProfileId, RunId};
use fleet_core::repo::{
    ClaimOutcome, DbProfileRepo, DbProxyRepo, DbTaskRepo, ProfileRepo, ProxyRepo, TaskRepo,
};
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Executor};
use test_r::test;
use test_r::test_dep;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

test_r::enable!();

struct PostgresDb {
    _container: ContainerAsync<Postgres>,
    pool: PostgresPool,
}

impl PostgresDb {
    async fn new() -> Self {
        let (config, container) = Self::start_docker_postgres().await;
        Self::wait_for_postgres(&config, Duration::from_secs(30)).await;
        migrate(&config).await.expect("migrations must apply cleanly");
        let pool = PostgresPool::configured(&config)
            .await
            .expect("pool must connect after migration");
        Self {
            _container: container,
            pool,
        }
    }

    async fn start_docker_postgres() -> (DbConfig, ContainerAsync<Postgres>) {
        let container = tryhard::retry_fn(|| Postgres::default().with_tag("16-alpine").start())
            .retries(5)
            .exponential_backoff(Duration::from_millis(10))
            .max_delay(Duration::from_secs(10))
            .await
            .expect("failed to start postgres container");

        let config = DbConfig {
            host: "localhost".to_string(),
            port: container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port"),
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            schema: None,
            max_connections: 10,
        };
        (config, container)
    }

    async fn wait_for_postgres(config: &DbConfig, timeout: Duration) {
        let start = Instant::now();
        loop {
            let options = PgConnectOptions::new()
                .username(&config.username)
                .password(&config.password)
                .database(&config.database)
                .host(&config.host)
                .port(config.port);
            if let Ok(mut conn) = options.connect().await {
                if conn.execute(sqlx::query("SELECT 1")).await.is_ok() {
                    break;
                }
            }
            if start.elapsed() > timeout {
                panic!("postgres did not become ready within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[test_dep]
async fn db() -> PostgresDb {
    PostgresDb::new().await
}

async fn seed_profile(pool: &PostgresPool) -> ProfileId {
    let profile_id = ProfileId(Uuid::new_v4());
    sqlx::query("INSERT INTO profiles (profile_id, name) VALUES ($1, 'test-profile')")
        .bind(profile_id.0)
        .execute(pool.pool())
        .await
        .unwrap();
    profile_id
}

async fn seed_group(pool: &PostgresPool) -> GroupId {
    let group_id = GroupId(Uuid::new_v4());
    sqlx::query("INSERT INTO groups (group_id) VALUES ($1)")
        .bind(group_id.0)
        .execute(pool.pool())
        .await
        .unwrap();
    group_id
}

async fn seed_task(pool: &PostgresPool, group_id: GroupId, chat_ref: &str, total_cycles: i32) -> i64 {
    let row = sqlx::query(
        "INSERT INTO tasks (group_id, chat_ref, total_cycles) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(group_id.0)
    .bind(chat_ref)
    .bind(total_cycles)
    .fetch_one(pool.pool())
    .await
    .unwrap();
    use sqlx::Row;
    row.get::<i64, _>("id")
}

#[test]
async fn claim_next_is_exclusive_under_concurrent_claimers(db: &PostgresDb) {
    let pool = db.pool.clone();
    let group_id = seed_group(&pool).await;
    let profile_a = seed_profile(&pool).await;
    let profile_b = seed_profile(&pool).await;
    seed_task(&pool, group_id, "chat-1", 1).await;

    let repo = DbTaskRepo::new(pool.clone());
    let run_id = RunId::new();

    let (claim_a, claim_b) = tokio::join!(
        repo.claim_next(group_id, profile_a, run_id, 0),
        repo.claim_next(group_id, profile_b, run_id, 0),
    );

    let claims: Vec<_> = [claim_a.unwrap(), claim_b.unwrap()]
        .into_iter()
        .filter(|c| matches!(c, ClaimOutcome::Claimed(_)))
        .collect();
    assert_eq!(claims.len(), 1, "exactly one claimer should win the single task");
}

#[test]
async fn claim_next_respects_hourly_cap(db: &PostgresDb) {
    let pool = db.pool.clone();
    let group_id = seed_group(&pool).await;
    let profile_id = seed_profile(&pool).await;
    for i in 0..5 {
        seed_task(&pool, group_id, &format!("chat-{i}"), 1).await;
    }

    let repo = DbTaskRepo::new(pool.clone());
    let run_id = RunId::new();

    sqlx::query("UPDATE profiles SET messages_sent_current_hour = 2 WHERE profile_id = $1")
        .bind(profile_id.0)
        .execute(pool.pool())
        .await
        .unwrap();

    let outcome = repo.claim_next(group_id, profile_id, run_id, 2).await.unwrap();
    assert!(matches!(outcome, ClaimOutcome::RateLimited));
}

#[test]
async fn fairness_prefers_fewer_completed_cycles(db: &PostgresDb) {
    let pool = db.pool.clone();
    let group_id = seed_group(&pool).await;
    let profile_id = seed_profile(&pool).await;
    let behind_id = seed_task(&pool, group_id, "behind", 5).await;
    let ahead_id = seed_task(&pool, group_id, "ahead", 5).await;
    sqlx::query("UPDATE tasks SET completed_cycles = 3 WHERE id = $1")
        .bind(ahead_id)
        .execute(pool.pool())
        .await
        .unwrap();

    let repo = DbTaskRepo::new(pool.clone());
    let run_id = RunId::new();
    let outcome = repo.claim_next(group_id, profile_id, run_id, 0).await.unwrap();
    match outcome {
        ClaimOutcome::Claimed(task) => assert_eq!(task.id.0, behind_id),
        other => panic!("expected a claim, got {}", debug_claim(&other)),
    }
}

fn debug_claim(outcome: &ClaimOutcome) -> &'static str {
    match outcome {
        ClaimOutcome::Claimed(_) => "Claimed",
        ClaimOutcome::RateLimited => "RateLimited",
        ClaimOutcome::NoTask => "NoTask",
    }
}

#[test]
async fn reset_stale_returns_in_progress_tasks_to_pending(db: &PostgresDb) {
    let pool = db.pool.clone();
    let group_id = seed_group(&pool).await;
    let profile_id = seed_profile(&pool).await;
    let task_id = seed_task(&pool, group_id, "stale-chat", 1).await;

    sqlx::query(
        "UPDATE tasks SET status = 'in_progress', assigned_profile_id = $1, last_attempt_at = now() - interval '1 hour' WHERE id = $2",
    )
    .bind(profile_id.0)
    .bind(task_id)
    .execute(pool.pool())
    .await
    .unwrap();

    let repo = DbTaskRepo::new(pool.clone());
    let reset_once = repo.reset_stale(ChronoDuration::minutes(10)).await.unwrap();
    assert_eq!(reset_once, 1);

    // Invariant 7: running it again is a no-op (idempotent).
    let reset_twice = repo.reset_stale(ChronoDuration::minutes(10)).await.unwrap();
    assert_eq!(reset_twice, 0);
}

#[test]
async fn proxy_assignment_is_exclusive_per_profile(db: &PostgresDb) {
    let pool = db.pool.clone();
    let profile_a = seed_profile(&pool).await;
    let profile_b = seed_profile(&pool).await;
    sqlx::query("INSERT INTO proxy_assignments (proxy_url) VALUES ('proxy://only-one')")
        .execute(pool.pool())
        .await
        .unwrap();

    let repo = DbProxyRepo::new(pool.clone());
    let (claim_a, claim_b) = tokio::join!(
        repo.claim_unassigned(profile_a),
        repo.claim_unassigned(profile_b),
    );
    let claimed = [claim_a.unwrap(), claim_b.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(claimed, 1, "the single proxy must go to exactly one profile");
}

#[test]
async fn profile_block_and_deactivate_sets_both_flags(db: &PostgresDb) {
    let pool = db.pool.clone();
    let profile_id = seed_profile(&pool).await;
    let repo = DbProfileRepo::new(pool.clone());
    repo.block_and_deactivate(profile_id).await.unwrap();
    let profile = repo.get(profile_id).await.unwrap();
    assert!(profile.is_blocked);
    assert!(!profile.is_active);
}

//! Decides which queue-specific worker processes to spawn this cycle.
//! Ported from the three-step planning pass: discover which entrypoints
//! currently have work, fetch their queued/picked counts, then greedily
//! round-robin spawn slots across queues so no single busy queue starves
//! the others out of a cycle's spawn budget.

use std::collections::HashMap;

use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

pub type PlannerResult<T> = std::result::Result<T, PlannerError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub queued: i64,
    pub picked: i64,
}

/// The union of every entrypoint with at least one queued or picked row
/// right now, and `known_keys` (statically known queue keys — the
/// analysis/verdict stage keys, plus any key with an explicit concurrency
/// override — that should be planned over even before any job lands on
/// them). Falls back to `["default"]` if that union is still empty.
pub async fn discover_active_queue_keys(pool: &PgPool, known_keys: &[String]) -> PlannerResult<Vec<String>> {
    let mut keys: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT entrypoint FROM jobq WHERE status IN ('queued', 'picked')",
    )
    .fetch_all(pool)
    .await?;

    keys.extend(known_keys.iter().cloned());
    keys.sort();
    keys.dedup();

    if keys.is_empty() {
        keys.push("default".to_owned());
    }

    Ok(keys)
}

/// Queued/picked counts per entrypoint, for exactly the keys asked for.
pub async fn get_queue_counts(pool: &PgPool, queue_keys: &[String]) -> PlannerResult<HashMap<String, QueueCounts>> {
    let mut counts: HashMap<String, QueueCounts> =
        queue_keys.iter().map(|k| (k.clone(), QueueCounts::default())).collect();

    if queue_keys.is_empty() {
        return Ok(counts);
    }

    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT entrypoint, status::text, COUNT(*)
        FROM jobq
        WHERE entrypoint = ANY($1)
          AND status IN ('queued', 'picked')
        GROUP BY entrypoint, status
        "#,
    )
    .bind(queue_keys)
    .fetch_all(pool)
    .await?;

    for (entrypoint, status, count) in rows {
        if let Some(entry) = counts.get_mut(&entrypoint) {
            match status.as_str() {
                "queued" => entry.queued = count,
                "picked" => entry.picked = count,
                _ => {}
            }
        }
    }

    Ok(counts)
}

/// Greedily spread `max_workers` spawn slots across queues with spare
/// capacity (queued work minus already-picked-and-running work, capped by
/// the queue's concurrency limit), round-robining so one deep queue can't
/// use up the whole cycle's budget by itself.
pub fn build_spawn_plan(
    queue_counts: &HashMap<String, QueueCounts>,
    concurrency_limit: impl Fn(&str) -> i32,
    max_workers: u32,
) -> Vec<String> {
    let mut queue_keys: Vec<&String> = queue_counts.keys().collect();
    queue_keys.sort();

    let mut capacity: HashMap<&str, i64> = HashMap::new();
    for key in &queue_keys {
        let counts = queue_counts[*key];
        let limit = concurrency_limit(key) as i64;
        let slack = (limit - counts.picked).max(0);
        capacity.insert(key.as_str(), counts.queued.min(slack).max(0));
    }

    let total_capacity: i64 = capacity.values().sum();
    if total_capacity <= 0 || max_workers == 0 {
        return Vec::new();
    }

    let workers_to_spawn = (total_capacity as u64).min(max_workers as u64);
    let mut plan = Vec::with_capacity(workers_to_spawn as usize);

    loop {
        if plan.len() as u64 >= workers_to_spawn {
            break;
        }
        let mut progressed = false;
        for key in &queue_keys {
            if plan.len() as u64 >= workers_to_spawn {
                break;
            }
            let slot = capacity.get_mut(key.as_str()).unwrap();
            if *slot > 0 {
                plan.push((*key).clone());
                *slot -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spreads_capacity_round_robin() {
        let mut counts = HashMap::new();
        counts.insert("a".to_owned(), QueueCounts { queued: 10, picked: 0 });
        counts.insert("b".to_owned(), QueueCounts { queued: 1, picked: 0 });

        let plan = build_spawn_plan(&counts, |_| 4, 3);
        assert_eq!(plan, vec!["a".to_owned(), "b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn respects_concurrency_limit() {
        let mut counts = HashMap::new();
        counts.insert("a".to_owned(), QueueCounts { queued: 10, picked: 2 });

        let plan = build_spawn_plan(&counts, |_| 3, 10);
        assert_eq!(plan, vec!["a".to_owned()]);
    }

    #[test]
    fn no_capacity_yields_empty_plan() {
        let mut counts = HashMap::new();
        counts.insert("a".to_owned(), QueueCounts { queued: 0, picked: 0 });

        let plan = build_spawn_plan(&counts, |_| 4, 10);
        assert!(plan.is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn discover_falls_back_to_default_when_nothing_known_or_queued(pool: sqlx::PgPool) {
        let keys = discover_active_queue_keys(&pool, &[]).await.expect("discover should not error");
        assert_eq!(keys, vec!["default".to_owned()]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn discover_includes_known_keys_even_with_no_queued_rows(pool: sqlx::PgPool) {
        let known = vec!["analysis".to_owned(), "verdict".to_owned()];
        let keys = discover_active_queue_keys(&pool, &known).await.expect("discover should not error");
        assert_eq!(keys, vec!["analysis".to_owned(), "verdict".to_owned()]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn discover_unions_queued_entrypoints_with_known_keys(pool: sqlx::PgPool) {
        sqlx::query("INSERT INTO jobq (entrypoint, payload, status) VALUES ('anthropic/claude-3-5-sonnet', '{}'::jsonb, 'queued')")
            .execute(&pool)
            .await
            .expect("seed job");

        let known = vec!["analysis".to_owned()];
        let keys = discover_active_queue_keys(&pool, &known).await.expect("discover should not error");
        assert_eq!(keys, vec!["analysis".to_owned(), "anthropic/claude-3-5-sonnet".to_owned()]);
    }
}

//! Postgres-backed safety store
//!
//! Records and counters live in `safety_records`, keyed by the four key
//! columns (absent resource and window are stored as empty strings so the
//! primary key stays total). Logs keep a header row in `safety_records` that
//! carries the expiry, with entries in `safety_log_entries`. The stop index
//! lives in `safety_index_entries`.
//!
//! Expiry is evaluated against the injected clock, not the database clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::clock::Clock;
use super::store::{RecordKind, SafetyStore, StoreError, StoreKey};

pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

/// Key columns in bind order: kind, user_id, resource, win
struct KeyCols<'a> {
    kind: &'static str,
    user_id: &'a str,
    resource: &'a str,
    win: &'a str,
}

impl<'a> From<&'a StoreKey> for KeyCols<'a> {
    fn from(key: &'a StoreKey) -> Self {
        Self {
            kind: key.kind.as_str(),
            user_id: &key.user,
            resource: key.resource.as_deref().unwrap_or(""),
            win: key.window.as_deref().unwrap_or(""),
        }
    }
}

/// Key columns of many keys as parallel arrays, for `UNNEST`
fn key_arrays(keys: &[StoreKey]) -> (Vec<String>, Vec<String>, Vec<String>, Vec<String>) {
    let mut kinds = Vec::with_capacity(keys.len());
    let mut users = Vec::with_capacity(keys.len());
    let mut resources = Vec::with_capacity(keys.len());
    let mut windows = Vec::with_capacity(keys.len());
    for key in keys {
        let cols = KeyCols::from(key);
        kinds.push(cols.kind.to_string());
        users.push(cols.user_id.to_string());
        resources.push(cols.resource.to_string());
        windows.push(cols.win.to_string());
    }
    (kinds, users, resources, windows)
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

impl PostgresStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drop entries of a log whose header has expired
    async fn reset_expired_log(
        tx: &mut Transaction<'_, Postgres>,
        cols: &KeyCols<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM safety_log_entries e
            USING safety_records r
            WHERE e.kind = $1 AND e.user_id = $2 AND e.resource = $3 AND e.win = $4
              AND r.kind = e.kind AND r.user_id = e.user_id AND r.resource = e.resource AND r.win = e.win
              AND r.expires_at IS NOT NULL AND r.expires_at <= $5
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SafetyStore for PostgresStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let cols = KeyCols::from(key);
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM safety_records
            WHERE kind = $1 AND user_id = $2 AND resource = $3 AND win = $4
              AND value IS NOT NULL
              AND (expires_at IS NULL OR expires_at > $5)
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[StoreKey]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (kinds, users, resources, windows) = key_arrays(keys);

        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT k.ord, r.value
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
                 WITH ORDINALITY AS k(kind, user_id, resource, win, ord)
            LEFT JOIN safety_records r
              ON r.kind = k.kind AND r.user_id = k.user_id
             AND r.resource = k.resource AND r.win = k.win
             AND (r.expires_at IS NULL OR r.expires_at > $5)
            ORDER BY k.ord
            "#,
        )
        .bind(&kinds)
        .bind(&users)
        .bind(&resources)
        .bind(&windows)
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;

        let mut values = vec![None; keys.len()];
        for (ord, value) in rows {
            if let Some(slot) = usize::try_from(ord - 1).ok().and_then(|i| values.get_mut(i)) {
                *slot = value;
            }
        }
        Ok(values)
    }

    async fn set(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let cols = KeyCols::from(key);
        sqlx::query(
            r#"
            INSERT INTO safety_records (kind, user_id, resource, win, value, counter, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7)
            ON CONFLICT (kind, user_id, resource, win) DO UPDATE
            SET value = EXCLUDED.value,
                counter = NULL,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(&value)
        .bind(expires_at)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &StoreKey,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let cols = KeyCols::from(key);
        // An expired row counts as absent
        let result = sqlx::query(
            r#"
            INSERT INTO safety_records (kind, user_id, resource, win, value, counter, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7)
            ON CONFLICT (kind, user_id, resource, win) DO UPDATE
            SET value = EXCLUDED.value,
                counter = NULL,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            WHERE safety_records.expires_at IS NOT NULL AND safety_records.expires_at <= $7
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(&value)
        .bind(expires_at)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: &str,
        value: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let cols = KeyCols::from(key);
        let result = sqlx::query(
            r#"
            UPDATE safety_records
            SET value = $6, expires_at = $7, updated_at = $8
            WHERE kind = $1 AND user_id = $2 AND resource = $3 AND win = $4
              AND value = $5
              AND (expires_at IS NULL OR expires_at > $8)
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(expected)
        .bind(&value)
        .bind(expires_at)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let cols = KeyCols::from(key);
        let live: Option<bool> = sqlx::query_scalar(
            r#"
            DELETE FROM safety_records
            WHERE kind = $1 AND user_id = $2 AND resource = $3 AND win = $4
            RETURNING (expires_at IS NULL OR expires_at > $5)
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(live.unwrap_or(false))
    }

    async fn delete_if_equals(&self, key: &StoreKey, expected: &str) -> Result<bool, StoreError> {
        let cols = KeyCols::from(key);
        let result = sqlx::query(
            r#"
            DELETE FROM safety_records
            WHERE kind = $1 AND user_id = $2 AND resource = $3 AND win = $4
              AND value = $5
              AND (expires_at IS NULL OR expires_at > $6)
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(expected)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_all(
        &self,
        counters: &[(StoreKey, DateTime<Utc>)],
    ) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut counts = Vec::with_capacity(counters.len());

        for (key, expires_at) in counters {
            let cols = KeyCols::from(key);
            // An expired counter restarts at 1 with the new window's expiry
            let count: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO safety_records (kind, user_id, resource, win, value, counter, expires_at, updated_at)
                VALUES ($1, $2, $3, $4, NULL, 1, $5, $6)
                ON CONFLICT (kind, user_id, resource, win) DO UPDATE
                SET counter = CASE
                        WHEN safety_records.expires_at IS NOT NULL AND safety_records.expires_at <= $6 THEN 1
                        ELSE COALESCE(safety_records.counter, 0) + 1
                    END,
                    expires_at = CASE
                        WHEN safety_records.expires_at IS NOT NULL AND safety_records.expires_at <= $6
                            THEN EXCLUDED.expires_at
                        ELSE safety_records.expires_at
                    END,
                    value = NULL,
                    updated_at = $6
                RETURNING counter
                "#,
            )
            .bind(cols.kind)
            .bind(cols.user_id)
            .bind(cols.resource)
            .bind(cols.win)
            .bind(expires_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            counts.push(count.max(0) as u64);
        }

        tx.commit().await?;
        Ok(counts)
    }

    async fn get_counts(&self, keys: &[StoreKey]) -> Result<Vec<u64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (kinds, users, resources, windows) = key_arrays(keys);

        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT k.ord, COALESCE(r.counter, 0)
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
                 WITH ORDINALITY AS k(kind, user_id, resource, win, ord)
            LEFT JOIN safety_records r
              ON r.kind = k.kind AND r.user_id = k.user_id
             AND r.resource = k.resource AND r.win = k.win
             AND (r.expires_at IS NULL OR r.expires_at > $5)
            ORDER BY k.ord
            "#,
        )
        .bind(&kinds)
        .bind(&users)
        .bind(&resources)
        .bind(&windows)
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = vec![0; keys.len()];
        for (ord, count) in rows {
            if let Some(slot) = usize::try_from(ord - 1).ok().and_then(|i| counts.get_mut(i)) {
                *slot = count.max(0) as u64;
            }
        }
        Ok(counts)
    }

    async fn push_bounded(
        &self,
        key: &StoreKey,
        value: String,
        max_len: usize,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let cols = KeyCols::from(key);
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        Self::reset_expired_log(&mut tx, &cols, now).await?;

        sqlx::query(
            r#"
            INSERT INTO safety_records (kind, user_id, resource, win, value, counter, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, NULL, NULL, $5, $6)
            ON CONFLICT (kind, user_id, resource, win) DO UPDATE
            SET expires_at = EXCLUDED.expires_at, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO safety_log_entries (kind, user_id, resource, win, value, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(&value)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM safety_log_entries
            WHERE kind = $1 AND user_id = $2 AND resource = $3 AND win = $4
              AND entry_id NOT IN (
                  SELECT entry_id FROM safety_log_entries
                  WHERE kind = $1 AND user_id = $2 AND resource = $3 AND win = $4
                  ORDER BY entry_id DESC
                  LIMIT $5
              )
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(max_len as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError> {
        let cols = KeyCols::from(key);
        let values: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT e.value
            FROM safety_log_entries e
            JOIN safety_records r
              ON r.kind = e.kind AND r.user_id = e.user_id
             AND r.resource = e.resource AND r.win = e.win
            WHERE e.kind = $1 AND e.user_id = $2 AND e.resource = $3 AND e.win = $4
              AND (r.expires_at IS NULL OR r.expires_at > $5)
            ORDER BY e.entry_id DESC
            LIMIT $6
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(cols.resource)
        .bind(cols.win)
        .bind(self.clock.now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(values)
    }

    async fn index_add(&self, key: &StoreKey, score: i64, member: String) -> Result<(), StoreError> {
        let cols = KeyCols::from(key);
        sqlx::query(
            r#"
            INSERT INTO safety_index_entries (kind, user_id, member, score)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, user_id, member) DO UPDATE SET score = EXCLUDED.score
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(&member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn index_recent(&self, key: &StoreKey, limit: usize) -> Result<Vec<String>, StoreError> {
        let cols = KeyCols::from(key);
        let members: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT member FROM safety_index_entries
            WHERE kind = $1 AND user_id = $2
            ORDER BY score DESC, member DESC
            LIMIT $3
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn index_remove_below(&self, key: &StoreKey, min_score: i64) -> Result<u64, StoreError> {
        let cols = KeyCols::from(key);
        let result = sqlx::query(
            r#"
            DELETE FROM safety_index_entries
            WHERE kind = $1 AND user_id = $2 AND score < $3
            "#,
        )
        .bind(cols.kind)
        .bind(cols.user_id)
        .bind(min_score)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn keys(&self, kind: RecordKind) -> Result<Vec<StoreKey>, StoreError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT user_id, resource, win FROM safety_records
            WHERE kind = $1 AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY user_id, resource, win
            "#,
        )
        .bind(kind.as_str())
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user, resource, window)| StoreKey {
                kind,
                user,
                resource: non_empty(resource),
                window: non_empty(window),
            })
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM safety_log_entries e
            USING safety_records r
            WHERE r.kind = e.kind AND r.user_id = e.user_id AND r.resource = e.resource AND r.win = e.win
              AND r.expires_at IS NOT NULL AND r.expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM safety_records
            WHERE expires_at IS NOT NULL AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_key_parts_map_to_empty_columns() {
        let key = StoreKey::emergency_stop("u1");
        let cols = KeyCols::from(&key);
        assert_eq!(cols.kind, "emergency_stop");
        assert_eq!(cols.user_id, "u1");
        assert_eq!(cols.resource, "");
        assert_eq!(cols.win, "");

        let counter = StoreKey::counter("u1", Some("message"), "h2026101509");
        let cols = KeyCols::from(&counter);
        assert_eq!(cols.resource, "message");
        assert_eq!(cols.win, "h2026101509");
    }

    #[test]
    fn test_key_arrays_are_parallel() {
        let keys = vec![
            StoreKey::counter("u1", None, "d20261015"),
            StoreKey::breaker("u2", "messaging"),
        ];
        let (kinds, users, resources, windows) = key_arrays(&keys);
        assert_eq!(kinds, vec!["counter", "breaker"]);
        assert_eq!(users, vec!["u1", "u2"]);
        assert_eq!(resources, vec!["", "messaging"]);
        assert_eq!(windows, vec!["d20261015", ""]);
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(String::new()), None);
        assert_eq!(non_empty("x".to_string()), Some("x".to_string()));
    }
}

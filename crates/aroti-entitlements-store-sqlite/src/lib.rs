#![allow(clippy::missing_errors_doc)]

//! SQLite persistence for the entitlement engine.
//!
//! One connection behind a mutex. Every write is a single statement or a
//! single `IMMEDIATE` transaction, and every overwrite is conditional on the
//! row still holding the state the caller read.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use aroti_entitlements_core::{
    format_date, format_rfc3339, now_utc, parse_date, parse_rfc3339_utc, truncate_to_seconds,
    ActivityEntry, ContentRef, ContentType, EntitlementError, EntitlementPolicy,
    EntitlementStore, NewActivity, NewTransaction, PointsBalance, QuotaKey, QuotaRecord,
    Transaction, UnlockRecord, UnlockResult, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

const ENTITLEMENTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_ENTITLEMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS policy_sets (
  policy_version INTEGER PRIMARY KEY,
  policy_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_quotas (
  user_id TEXT NOT NULL,
  quota_key TEXT NOT NULL,
  used_count INTEGER NOT NULL CHECK (used_count >= 0),
  window_date TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, quota_key)
);

CREATE TRIGGER IF NOT EXISTS trg_feature_quotas_no_delete
BEFORE DELETE ON feature_quotas
BEGIN
  SELECT RAISE(FAIL, 'feature_quotas rows are never destroyed');
END;

CREATE TABLE IF NOT EXISTS points_ledger (
  user_id TEXT PRIMARY KEY,
  balance INTEGER NOT NULL CHECK (balance >= 0),
  lifetime INTEGER NOT NULL CHECK (lifetime >= 0),
  updated_at TEXT NOT NULL,
  CHECK (balance <= lifetime)
);

CREATE TRIGGER IF NOT EXISTS trg_points_ledger_lifetime_monotonic
BEFORE UPDATE OF lifetime ON points_ledger
WHEN NEW.lifetime < OLD.lifetime
BEGIN
  SELECT RAISE(FAIL, 'points_ledger lifetime is monotonic');
END;

CREATE TRIGGER IF NOT EXISTS trg_points_ledger_no_delete
BEFORE DELETE ON points_ledger
BEGIN
  SELECT RAISE(FAIL, 'points_ledger rows are never destroyed');
END;

CREATE TABLE IF NOT EXISTS points_transactions (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  transaction_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  event TEXT NOT NULL CHECK (length(trim(event)) > 0),
  delta INTEGER NOT NULL CHECK (delta != 0),
  occurred_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_points_transactions_no_update
BEFORE UPDATE ON points_transactions
BEGIN
  SELECT RAISE(FAIL, 'points_transactions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_points_transactions_no_delete
BEFORE DELETE ON points_transactions
BEGIN
  SELECT RAISE(FAIL, 'points_transactions is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_points_transactions_user_seq
  ON points_transactions(user_id, seq);

CREATE TABLE IF NOT EXISTS content_unlocks (
  user_id TEXT NOT NULL,
  content_type TEXT NOT NULL,
  content_id TEXT NOT NULL,
  permanent INTEGER NOT NULL CHECK (permanent = 1),
  unlocked_at TEXT NOT NULL,
  PRIMARY KEY (user_id, content_type, content_id)
);

CREATE TRIGGER IF NOT EXISTS trg_content_unlocks_no_update
BEFORE UPDATE ON content_unlocks
BEGIN
  SELECT RAISE(FAIL, 'content_unlocks are permanent');
END;

CREATE TRIGGER IF NOT EXISTS trg_content_unlocks_no_delete
BEFORE DELETE ON content_unlocks
BEGIN
  SELECT RAISE(FAIL, 'content_unlocks are permanent');
END;

CREATE INDEX IF NOT EXISTS idx_content_unlocks_user_time
  ON content_unlocks(user_id, unlocked_at);

CREATE TABLE IF NOT EXISTS activity_entries (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  activity_type TEXT NOT NULL CHECK (length(trim(activity_type)) > 0),
  points INTEGER NOT NULL CHECK (points >= 0),
  occurred_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_activity_entries_no_update
BEFORE UPDATE ON activity_entries
BEGIN
  SELECT RAISE(FAIL, 'activity_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_activity_entries_user_time
  ON activity_entries(user_id, occurred_at, seq);
";

pub struct SqliteEntitlementStore {
    conn: Mutex<Connection>,
}

impl SqliteEntitlementStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_ENTITLEMENTS_V1)
            .context("failed to apply entitlements schema")?;

        let now = sql_timestamp(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![ENTITLEMENTS_MIGRATION_VERSION, now],
        )
        .context("failed to register entitlements schema migration")?;

        let v1 = EntitlementPolicy::v1();
        let payload = serde_json::to_string(&v1).context("failed to serialize policy")?;
        conn.execute(
            "INSERT OR IGNORE INTO policy_sets(policy_version, policy_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![i64::from(v1.policy_version), payload, now],
        )
        .context("failed to seed default policy")?;

        debug!(version = ENTITLEMENTS_MIGRATION_VERSION, "migrated entitlements schema");
        Ok(())
    }

    pub fn upsert_policy(&self, policy: &EntitlementPolicy) -> Result<()> {
        policy
            .validate()
            .map_err(|err| anyhow!("invalid policy configuration: {err}"))?;

        let payload = serde_json::to_string(policy).context("failed to serialize policy")?;
        let now = sql_timestamp(now_utc())?;

        self.conn()?
            .execute(
                "INSERT INTO policy_sets(policy_version, policy_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(policy_version) DO UPDATE SET
                   policy_json = excluded.policy_json,
                   created_at = excluded.created_at",
                params![i64::from(policy.policy_version), payload, now],
            )
            .context("failed to upsert policy")?;

        Ok(())
    }

    pub fn policies(&self) -> Result<BTreeMap<u32, EntitlementPolicy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT policy_version, policy_json FROM policy_sets ORDER BY policy_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid policy_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            map.insert(version, decode_policy(version, &json)?);
        }

        Ok(map)
    }

    pub fn latest_policy(&self) -> Result<EntitlementPolicy> {
        let conn = self.conn()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT policy_version, policy_json FROM policy_sets
                 ORDER BY policy_version DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read latest policy")?;

        let Some((version, json)) = row else {
            return Err(anyhow!("no policy stored; run migrate first"));
        };
        let version =
            u32::try_from(version).with_context(|| format!("invalid policy_version: {version}"))?;
        decode_policy(version, &json)
    }

    pub fn get_quota(&self, user: &UserId, key: &QuotaKey) -> Result<Option<QuotaRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT quota_key, used_count, window_date, updated_at
             FROM feature_quotas
             WHERE user_id = ?1 AND quota_key = ?2",
            params![user.as_str(), key.to_string()],
            parse_quota_row,
        )
        .optional()
        .with_context(|| format!("failed to read quota {key}"))
    }

    /// Returns `false` when the stored row no longer matches `expected`.
    pub fn put_quota_if_unchanged(
        &self,
        user: &UserId,
        expected: Option<&QuotaRecord>,
        next: &QuotaRecord,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let key = next.key.to_string();
        let window_date = format_date(next.window_date);
        let updated_at = sql_timestamp(next.updated_at)?;

        let changed = match expected {
            None => conn
                .execute(
                    "INSERT INTO feature_quotas(
                       user_id, quota_key, used_count, window_date, updated_at
                     )
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(user_id, quota_key) DO NOTHING",
                    params![
                        user.as_str(),
                        key,
                        i64::from(next.used_count),
                        window_date,
                        updated_at
                    ],
                )
                .context("failed to insert quota")?,
            Some(expected) => conn
                .execute(
                    "UPDATE feature_quotas
                     SET used_count = ?3, window_date = ?4, updated_at = ?5
                     WHERE user_id = ?1 AND quota_key = ?2
                       AND used_count = ?6 AND window_date = ?7",
                    params![
                        user.as_str(),
                        key,
                        i64::from(next.used_count),
                        window_date,
                        updated_at,
                        i64::from(expected.used_count),
                        format_date(expected.window_date)
                    ],
                )
                .context("failed to update quota")?,
        };

        Ok(changed == 1)
    }

    pub fn get_balance(&self, user: &UserId) -> Result<PointsBalance> {
        let conn = self.conn()?;
        read_balance(&conn, user)
    }

    /// Moves the ledger from `expected` to `next` and appends `tx` in one
    /// transaction. Returns `None` when the stored balance moved.
    pub fn commit_ledger_if_unchanged(
        &self,
        user: &UserId,
        expected: PointsBalance,
        next: PointsBalance,
        new_tx: &NewTransaction,
    ) -> Result<Option<Transaction>> {
        let occurred_at = truncate_to_seconds(new_tx.occurred_at);
        let occurred_at_text = sql_timestamp(occurred_at)?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start ledger transaction")?;

        let mut changed = tx
            .execute(
                "UPDATE points_ledger
                 SET balance = ?2, lifetime = ?3, updated_at = ?4
                 WHERE user_id = ?1 AND balance = ?5 AND lifetime = ?6",
                params![
                    user.as_str(),
                    sql_points(next.balance)?,
                    sql_points(next.lifetime)?,
                    occurred_at_text,
                    sql_points(expected.balance)?,
                    sql_points(expected.lifetime)?
                ],
            )
            .context("failed to update points ledger")?;

        if changed == 0 && expected == PointsBalance::default() {
            changed = tx
                .execute(
                    "INSERT INTO points_ledger(user_id, balance, lifetime, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO NOTHING",
                    params![
                        user.as_str(),
                        sql_points(next.balance)?,
                        sql_points(next.lifetime)?,
                        occurred_at_text
                    ],
                )
                .context("failed to create points ledger")?;
        }

        if changed == 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO points_transactions(transaction_id, user_id, event, delta, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new_tx.transaction_id.to_string(),
                user.as_str(),
                new_tx.event,
                new_tx.delta,
                occurred_at_text
            ],
        )
        .context("failed to append points transaction")?;

        let seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit ledger transaction")?;

        Ok(Some(Transaction {
            seq,
            transaction_id: new_tx.transaction_id,
            event: new_tx.event.clone(),
            delta: new_tx.delta,
            occurred_at,
        }))
    }

    pub fn list_transactions(&self, user: &UserId, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, transaction_id, event, delta, occurred_at
             FROM points_transactions
             WHERE user_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(
            params![user.as_str(), sql_limit(limit)],
            parse_transaction_row,
        )?;
        collect_rows(rows)
    }

    pub fn insert_unlock(
        &self,
        user: &UserId,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult> {
        let unlocked_at = truncate_to_seconds(at);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start unlock transaction")?;

        let inserted = tx
            .execute(
                "INSERT INTO content_unlocks(
                   user_id, content_type, content_id, permanent, unlocked_at
                 )
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(user_id, content_type, content_id) DO NOTHING",
                params![
                    user.as_str(),
                    content.content_type.as_str(),
                    content.content_id,
                    sql_timestamp(unlocked_at)?
                ],
            )
            .context("failed to insert content unlock")?;

        let record = read_unlock(&tx, user, content)?
            .ok_or_else(|| anyhow!("unlock for {content} missing after insert"))?;
        tx.commit().context("failed to commit unlock transaction")?;

        Ok(UnlockResult {
            record,
            newly_unlocked: inserted == 1,
        })
    }

    pub fn get_unlock(&self, user: &UserId, content: &ContentRef) -> Result<Option<UnlockRecord>> {
        let conn = self.conn()?;
        read_unlock(&conn, user, content)
    }

    pub fn list_unlocks(&self, user: &UserId, limit: usize) -> Result<Vec<UnlockRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT content_type, content_id, permanent, unlocked_at
             FROM content_unlocks
             WHERE user_id = ?1
             ORDER BY unlocked_at DESC, content_type ASC, content_id ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![user.as_str(), sql_limit(limit)], parse_unlock_row)?;
        collect_rows(rows)
    }

    pub fn insert_activity(&self, user: &UserId, activity: &NewActivity) -> Result<ActivityEntry> {
        let occurred_at = truncate_to_seconds(activity.occurred_at);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO activity_entries(user_id, activity_type, points, occurred_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user.as_str(),
                activity.activity_type,
                i64::from(activity.points),
                sql_timestamp(occurred_at)?
            ],
        )
        .context("failed to append activity entry")?;

        Ok(ActivityEntry {
            seq: conn.last_insert_rowid(),
            activity_type: activity.activity_type.clone(),
            points: activity.points,
            occurred_at,
        })
    }

    pub fn list_activity_since(
        &self,
        user: &UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<ActivityEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, activity_type, points, occurred_at
             FROM activity_entries
             WHERE user_id = ?1 AND occurred_at >= ?2
             ORDER BY occurred_at ASC, seq ASC",
        )?;

        let rows = stmt.query_map(
            params![user.as_str(), sql_timestamp(truncate_to_seconds(since))?],
            parse_activity_row,
        )?;
        collect_rows(rows)
    }

    pub fn delete_activity_before(&self, user: &UserId, before: OffsetDateTime) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM activity_entries WHERE user_id = ?1 AND occurred_at < ?2",
            params![user.as_str(), sql_timestamp(truncate_to_seconds(before))?],
        )
        .context("failed to prune activity entries")
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: anyhow::Error) -> EntitlementError {
    EntitlementError::Store(format!("{err:#}"))
}

impl EntitlementStore for SqliteEntitlementStore {
    fn quota(
        &self,
        user: &UserId,
        key: &QuotaKey,
    ) -> Result<Option<QuotaRecord>, EntitlementError> {
        self.get_quota(user, key).map_err(store_error)
    }

    fn put_quota(
        &self,
        user: &UserId,
        expected: Option<&QuotaRecord>,
        next: &QuotaRecord,
    ) -> Result<(), EntitlementError> {
        if self
            .put_quota_if_unchanged(user, expected, next)
            .map_err(store_error)?
        {
            return Ok(());
        }

        warn!(user_id = %user, quota = %next.key, "quota write lost a race");
        Err(EntitlementError::Conflict(format!(
            "quota {} changed for user {user}",
            next.key
        )))
    }

    fn balance(&self, user: &UserId) -> Result<PointsBalance, EntitlementError> {
        self.get_balance(user).map_err(store_error)
    }

    fn commit_ledger(
        &self,
        user: &UserId,
        expected: PointsBalance,
        next: PointsBalance,
        tx: &NewTransaction,
    ) -> Result<Transaction, EntitlementError> {
        match self
            .commit_ledger_if_unchanged(user, expected, next, tx)
            .map_err(store_error)?
        {
            Some(transaction) => Ok(transaction),
            None => {
                warn!(user_id = %user, event = %tx.event, "ledger write lost a race");
                Err(EntitlementError::Conflict(format!(
                    "points ledger changed for user {user}"
                )))
            }
        }
    }

    fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, EntitlementError> {
        self.list_transactions(user, limit).map_err(store_error)
    }

    fn unlock(
        &self,
        user: &UserId,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult, EntitlementError> {
        self.insert_unlock(user, content, at).map_err(store_error)
    }

    fn unlock_record(
        &self,
        user: &UserId,
        content: &ContentRef,
    ) -> Result<Option<UnlockRecord>, EntitlementError> {
        self.get_unlock(user, content).map_err(store_error)
    }

    fn recent_unlocks(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<UnlockRecord>, EntitlementError> {
        self.list_unlocks(user, limit).map_err(store_error)
    }

    fn append_activity(
        &self,
        user: &UserId,
        activity: &NewActivity,
    ) -> Result<ActivityEntry, EntitlementError> {
        self.insert_activity(user, activity).map_err(store_error)
    }

    fn activity_since(
        &self,
        user: &UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<ActivityEntry>, EntitlementError> {
        self.list_activity_since(user, since).map_err(store_error)
    }

    fn prune_activity(
        &self,
        user: &UserId,
        before: OffsetDateTime,
    ) -> Result<usize, EntitlementError> {
        self.delete_activity_before(user, before)
            .map_err(store_error)
    }
}

fn decode_policy(version: u32, json: &str) -> Result<EntitlementPolicy> {
    let value: Value = serde_json::from_str(json).context("invalid stored policy JSON")?;
    let policy = EntitlementPolicy::from_json(&value)
        .map_err(|err| anyhow!("failed to parse policy {version}: {err}"))?;
    if policy.policy_version != version {
        return Err(anyhow!(
            "policy row {version} carries policy_version {}",
            policy.policy_version
        ));
    }
    Ok(policy)
}

fn read_balance(conn: &Connection, user: &UserId) -> Result<PointsBalance> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT balance, lifetime FROM points_ledger WHERE user_id = ?1",
            params![user.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to read points ledger for {user}"))?;

    let Some((balance, lifetime)) = row else {
        return Ok(PointsBalance::default());
    };

    Ok(PointsBalance {
        balance: u64::try_from(balance).with_context(|| format!("invalid balance: {balance}"))?,
        lifetime: u64::try_from(lifetime)
            .with_context(|| format!("invalid lifetime: {lifetime}"))?,
    })
}

fn read_unlock(
    conn: &Connection,
    user: &UserId,
    content: &ContentRef,
) -> Result<Option<UnlockRecord>> {
    conn.query_row(
        "SELECT content_type, content_id, permanent, unlocked_at
         FROM content_unlocks
         WHERE user_id = ?1 AND content_type = ?2 AND content_id = ?3",
        params![
            user.as_str(),
            content.content_type.as_str(),
            content.content_id
        ],
        parse_unlock_row,
    )
    .optional()
    .with_context(|| format!("failed to read unlock {content}"))
}

fn parse_quota_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuotaRecord> {
    let key_raw: String = row.get(0)?;
    let used_count_i64: i64 = row.get(1)?;
    let window_date_raw: String = row.get(2)?;
    let updated_at_raw: String = row.get(3)?;

    let key = QuotaKey::parse(&key_raw)
        .map_err(|err| invalid_column(0, rusqlite::types::Type::Text, err.to_string()))?;
    let used_count = u32::try_from(used_count_i64).map_err(|_| {
        invalid_column(
            1,
            rusqlite::types::Type::Integer,
            format!("invalid used_count: {used_count_i64}"),
        )
    })?;
    let window_date = parse_date(&window_date_raw)
        .map_err(|err| invalid_column(2, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(QuotaRecord {
        key,
        used_count,
        window_date,
        updated_at: parse_timestamp(3, &updated_at_raw)?,
    })
}

fn parse_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let transaction_id_raw: String = row.get(1)?;
    let occurred_at_raw: String = row.get(4)?;

    let transaction_id = Ulid::from_string(&transaction_id_raw).map_err(|err| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid transaction_id {transaction_id_raw}: {err}"),
        )
    })?;

    Ok(Transaction {
        seq: row.get(0)?,
        transaction_id,
        event: row.get(2)?,
        delta: row.get(3)?,
        occurred_at: parse_timestamp(4, &occurred_at_raw)?,
    })
}

fn parse_unlock_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnlockRecord> {
    let content_type_raw: String = row.get(0)?;
    let content_id: String = row.get(1)?;
    let permanent: i64 = row.get(2)?;
    let unlocked_at_raw: String = row.get(3)?;

    let content_type = ContentType::parse(&content_type_raw).ok_or_else(|| {
        invalid_column(
            0,
            rusqlite::types::Type::Text,
            format!("invalid content_type: {content_type_raw}"),
        )
    })?;
    let content = ContentRef::new(content_type, &content_id)
        .map_err(|err| invalid_column(1, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(UnlockRecord {
        content,
        permanent: permanent == 1,
        unlocked_at: parse_timestamp(3, &unlocked_at_raw)?,
    })
}

fn parse_activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityEntry> {
    let points_i64: i64 = row.get(2)?;
    let occurred_at_raw: String = row.get(3)?;

    let points = u32::try_from(points_i64).map_err(|_| {
        invalid_column(
            2,
            rusqlite::types::Type::Integer,
            format!("invalid points: {points_i64}"),
        )
    })?;

    Ok(ActivityEntry {
        seq: row.get(0)?,
        activity_type: row.get(1)?,
        points,
        occurred_at: parse_timestamp(3, &occurred_at_raw)?,
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| invalid_column(column, rusqlite::types::Type::Text, err.to_string()))
}

fn invalid_column(column: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(truncate_to_seconds(value)).map_err(|err| anyhow!(err.to_string()))
}

fn sql_points(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("points value out of range: {value}"))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aroti_entitlements_core::{
        AccessContext, DayBoundary, EntitlementEngine, FeatureKey, QuotaWindow, UnlockSpendStatus,
    };
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_store() -> SqliteEntitlementStore {
        let store = must(SqliteEntitlementStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn user() -> UserId {
        must_ok(UserId::parse("user-1"))
    }

    fn at(raw: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(raw))
    }

    fn temp_db_path(prefix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        let conn = store.connection();

        let table_count = match conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='table'
               AND name IN ('policy_sets', 'feature_quotas', 'points_ledger',
                            'points_transactions', 'content_unlocks', 'activity_entries')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query table contract: {err}"),
        };
        assert_eq!(table_count, 6);

        let trigger_count = match conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger'
               AND name IN ('trg_points_transactions_no_update',
                            'trg_points_transactions_no_delete',
                            'trg_content_unlocks_no_update',
                            'trg_content_unlocks_no_delete',
                            'trg_points_ledger_lifetime_monotonic')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 5);
    }

    #[test]
    fn migration_is_idempotent_and_seeds_v1_policy() {
        let store = fixture_store();
        must(store.migrate());
        assert_eq!(must(store.latest_policy()), EntitlementPolicy::v1());
        assert_eq!(must(store.policies()).len(), 1);
    }

    #[test]
    fn newer_policy_version_becomes_latest() {
        let store = fixture_store();
        let mut policy = EntitlementPolicy::v1();
        policy.policy_version = 2;
        policy.activity_retention_days = 45;
        must(store.upsert_policy(&policy));

        let latest = must(store.latest_policy());
        assert_eq!(latest.policy_version, 2);
        assert_eq!(latest.activity_retention_days, 45);

        policy.streak_cap_days = 0;
        assert!(store.upsert_policy(&policy).is_err());
    }

    #[test]
    fn transaction_log_is_append_only() {
        let store = fixture_store();
        let tx = must_ok(NewTransaction::earn("complete_quiz", 10, at("2026-02-07T10:00:00Z")));
        let committed = match must(store.commit_ledger_if_unchanged(
            &user(),
            PointsBalance::default(),
            PointsBalance {
                balance: 10,
                lifetime: 10,
            },
            &tx,
        )) {
            Some(value) => value,
            None => panic!("expected first ledger commit to apply"),
        };

        let conn = store.connection();
        assert!(conn
            .execute(
                "UPDATE points_transactions SET delta = 999 WHERE seq = ?1",
                params![committed.seq],
            )
            .is_err());
        assert!(conn
            .execute(
                "DELETE FROM points_transactions WHERE seq = ?1",
                params![committed.seq],
            )
            .is_err());
    }

    #[test]
    fn ledger_constraints_block_negative_balance_and_lifetime_decrease() {
        let store = fixture_store();
        let tx = must_ok(NewTransaction::earn("seed", 50, at("2026-02-07T10:00:00Z")));
        let _ = must(store.commit_ledger_if_unchanged(
            &user(),
            PointsBalance::default(),
            PointsBalance {
                balance: 50,
                lifetime: 50,
            },
            &tx,
        ));

        let conn = store.connection();
        assert!(conn
            .execute(
                "UPDATE points_ledger SET balance = -1 WHERE user_id = ?1",
                params![user().as_str()],
            )
            .is_err());
        assert!(conn
            .execute(
                "UPDATE points_ledger SET lifetime = 10, balance = 10 WHERE user_id = ?1",
                params![user().as_str()],
            )
            .is_err());
    }

    #[test]
    fn stale_ledger_commit_is_a_conflict_across_connections() {
        let db_path = temp_db_path("aroti-ledger-race");
        let first = must(SqliteEntitlementStore::open(&db_path));
        must(first.migrate());
        let second = must(SqliteEntitlementStore::open(&db_path));

        let seeded = PointsBalance {
            balance: 100,
            lifetime: 100,
        };
        let now = at("2026-02-07T10:00:00Z");
        must_ok(first.commit_ledger(
            &user(),
            PointsBalance::default(),
            seeded,
            &must_ok(NewTransaction::earn("seed", 100, now)),
        ));

        let after_spend = PointsBalance {
            balance: 40,
            lifetime: 100,
        };
        let spend = must_ok(NewTransaction::spend("compatibility_check", 60, now));
        must_ok(first.commit_ledger(&user(), seeded, after_spend, &spend));

        let raced = must_ok(NewTransaction::spend("compatibility_check", 60, now));
        assert!(matches!(
            second.commit_ledger(&user(), seeded, after_spend, &raced),
            Err(EntitlementError::Conflict(_))
        ));
        assert_eq!(must_ok(second.balance(&user())).balance, 40);
        assert_eq!(must_ok(second.transactions(&user(), 10)).len(), 2);

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn quota_rows_round_trip_and_reject_stale_writes() {
        let store = fixture_store();
        let now = at("2026-02-07T10:00:00Z");
        let window = QuotaWindow::for_instant(now, DayBoundary::utc());
        let key = QuotaKey::usage(&must_ok(FeatureKey::parse("ai-chat")));

        let first = must_ok(window.advance(&key, None, now));
        must_ok(store.put_quota(&user(), None, &first));
        assert_eq!(must_ok(store.quota(&user(), &key)), Some(first.clone()));

        assert!(matches!(
            store.put_quota(&user(), None, &first),
            Err(EntitlementError::Conflict(_))
        ));

        let second = must_ok(window.advance(&key, Some(&first), now));
        must_ok(store.put_quota(&user(), Some(&first), &second));
        assert!(matches!(
            store.put_quota(&user(), Some(&first), &second),
            Err(EntitlementError::Conflict(_))
        ));
    }

    #[test]
    fn unlocks_are_permanent_and_keep_first_timestamp() {
        let store = fixture_store();
        let content = must_ok(ContentRef::parse("tarotSpread:celtic-cross"));
        let first_at = at("2026-02-07T10:00:00Z");

        assert!(must_ok(store.unlock(&user(), &content, first_at)).newly_unlocked);
        let again = must_ok(store.unlock(&user(), &content, at("2026-02-09T10:00:00Z")));
        assert!(!again.newly_unlocked);
        assert_eq!(again.record.unlocked_at, first_at);

        let conn = store.connection();
        assert!(conn
            .execute("DELETE FROM content_unlocks WHERE user_id = ?1", params![user().as_str()])
            .is_err());
        assert!(conn
            .execute(
                "UPDATE content_unlocks SET permanent = 0 WHERE user_id = ?1",
                params![user().as_str()],
            )
            .is_err());
    }

    #[test]
    fn activity_pruning_respects_cutoff() {
        let store = fixture_store();
        let old = must_ok(NewActivity::new("spread", 10, at("2026-01-01T10:00:00Z")));
        let recent = must_ok(NewActivity::new("quiz", 10, at("2026-02-07T10:00:00Z")));
        must_ok(store.append_activity(&user(), &old));
        must_ok(store.append_activity(&user(), &recent));

        assert_eq!(
            must_ok(store.prune_activity(&user(), at("2026-01-08T10:00:00Z"))),
            1
        );
        let remaining = must_ok(store.activity_since(&user(), OffsetDateTime::UNIX_EPOCH));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].activity_type, "quiz");

        let conn = store.connection();
        assert!(conn
            .execute("UPDATE activity_entries SET points = 99", [])
            .is_err());
    }

    #[test]
    fn engine_over_sqlite_unlocks_with_points() {
        let store = fixture_store();
        let policy = must(store.latest_policy());
        let engine = must_ok(EntitlementEngine::new(store, &policy));
        let handle = engine.user(user());
        let ctx = AccessContext::free_at(at("2026-02-07T10:00:00Z"));

        must_ok(handle.earn_points("complete_tarot_spread", 160, ctx.as_of));
        let paid = must_ok(handle.spend_for_unlock("celtic", &ctx));
        assert_eq!(paid.status, UnlockSpendStatus::Unlocked);
        assert!(must_ok(handle.check_access("spread.celtic-cross", &ctx)).allowed);
        assert_eq!(must_ok(handle.balance()).balance, 10);
        assert_eq!(must_ok(handle.level_info()).level_name, "Seeker");
    }

    #[test]
    fn sqlite_busy_timeout_allows_write_after_lock_release() {
        let db_path = temp_db_path("aroti-lock-test");
        let setup = must(SqliteEntitlementStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let writer_path = db_path.clone();
        let writer = std::thread::spawn(move || {
            let store = match SqliteEntitlementStore::open(&writer_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open writer store: {err}"),
            };
            let tx = match NewTransaction::earn("seed", 5, OffsetDateTime::UNIX_EPOCH) {
                Ok(value) => value,
                Err(err) => panic!("failed to build transaction: {err}"),
            };
            store.commit_ledger_if_unchanged(
                &user(),
                PointsBalance::default(),
                PointsBalance {
                    balance: 5,
                    lifetime: 5,
                },
                &tx,
            )
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let result = match writer.join() {
            Ok(result) => result,
            Err(err) => panic!("writer thread join failed: {err:?}"),
        };
        assert!(
            matches!(result, Ok(Some(_))),
            "write should succeed after lock release: {:?}",
            result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[derive(Debug, Clone)]
    enum LedgerOp {
        Earn(u32),
        Spend(u32),
    }

    fn ledger_op() -> impl Strategy<Value = LedgerOp> {
        prop_oneof![
            (1_u32..200).prop_map(LedgerOp::Earn),
            (1_u32..200).prop_map(LedgerOp::Spend),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sqlite_ledger_matches_in_memory(ops in prop::collection::vec(ledger_op(), 1..30)) {
            let policy = EntitlementPolicy::v1();
            let sqlite = must_ok(EntitlementEngine::new(fixture_store(), &policy));
            let memory = must_ok(EntitlementEngine::new(
                aroti_entitlements_core::InMemoryStore::new(),
                &policy,
            ));
            let now = at("2026-02-07T10:00:00Z");

            for op in &ops {
                let (lhs, rhs) = match op {
                    LedgerOp::Earn(amount) => (
                        must_ok(sqlite.user(user()).earn_points("earn", *amount, now)).success,
                        must_ok(memory.user(user()).earn_points("earn", *amount, now)).success,
                    ),
                    LedgerOp::Spend(cost) => (
                        must_ok(sqlite.user(user()).spend_points("spend", *cost, now)).success,
                        must_ok(memory.user(user()).spend_points("spend", *cost, now)).success,
                    ),
                };
                prop_assert_eq!(lhs, rhs);
            }

            prop_assert_eq!(
                must_ok(sqlite.user(user()).balance()),
                must_ok(memory.user(user()).balance())
            );
            let sqlite_deltas: Vec<i64> = must_ok(sqlite.user(user()).transactions(100))
                .into_iter()
                .map(|tx| tx.delta)
                .collect();
            let memory_deltas: Vec<i64> = must_ok(memory.user(user()).transactions(100))
                .into_iter()
                .map(|tx| tx.delta)
                .collect();
            prop_assert_eq!(sqlite_deltas, memory_deltas);
        }
    }
}

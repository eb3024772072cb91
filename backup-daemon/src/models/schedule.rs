use crate::error::DaemonError;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// ── Schedule ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub volume_name: String,
    pub interval_hours: i64,
    pub keep_count: i64,
    pub enabled: bool,
    pub created_at: String,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
}

/// Upper bound on `interval_hours` (ten years).
pub const MAX_INTERVAL_HOURS: i64 = 87_600;

impl Schedule {
    /// Timer period: `interval_hours` multiples of `unit` (an hour in production).
    /// `None` when the product does not fit.
    pub fn interval(&self, unit: std::time::Duration) -> Option<std::time::Duration> {
        let hours = u32::try_from(self.interval_hours.max(1)).ok()?;
        unit.checked_mul(hours)
    }

    /// Whether the persisted next run lies before `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .is_some_and(|next| next.with_timezone(&Utc) <= now)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertScheduleRequest {
    pub volume_name: String,
    pub interval_hours: i64,
    #[serde(default = "default_keep_count")]
    pub keep_count: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_keep_count() -> i64 { 7 }
fn default_enabled() -> bool { true }

impl UpsertScheduleRequest {
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.volume_name.trim().is_empty() {
            return Err(DaemonError::BadRequest("volume name is required".into()));
        }
        backup_engine::executor::manifest::validate_name("volume", &self.volume_name)?;
        if !(1..=MAX_INTERVAL_HOURS).contains(&self.interval_hours) {
            return Err(DaemonError::BadRequest(format!(
                "intervalHours must be between 1 and {MAX_INTERVAL_HOURS}"
            )));
        }
        if self.keep_count < 1 {
            return Err(DaemonError::BadRequest("keepCount must be at least 1".into()));
        }
        Ok(())
    }
}

/// `None` when the result is out of chrono's range.
pub fn next_run_after(from: DateTime<Utc>, interval_hours: i64) -> Option<String> {
    let step = Duration::try_hours(interval_hours.max(1))?;
    from.checked_add_signed(step).map(|t| t.to_rfc3339())
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        volume_name: row.get("volume_name")?,
        interval_hours: row.get("interval_hours")?,
        keep_count: row.get("keep_count")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        created_at: row.get("created_at")?,
        last_run_at: row.get("last_run_at")?,
        next_run_at: row.get("next_run_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Schedule>> {
    let mut stmt = conn.prepare("SELECT * FROM schedules ORDER BY volume_name")?;
    let rows = stmt.query_map([], |row| row_to_schedule(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_enabled(conn: &Connection) -> anyhow::Result<Vec<Schedule>> {
    let mut stmt = conn.prepare("SELECT * FROM schedules WHERE enabled = 1 ORDER BY volume_name")?;
    let rows = stmt.query_map([], |row| row_to_schedule(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_volume(conn: &Connection, volume_name: &str) -> anyhow::Result<Option<Schedule>> {
    let schedule = conn
        .query_row(
            "SELECT * FROM schedules WHERE volume_name = ?",
            params![volume_name],
            |row| row_to_schedule(row),
        )
        .optional()?;
    Ok(schedule)
}

/// Insert or replace the schedule of a volume. `created_at` and `last_run_at`
/// survive a replace; `next_run_at` is recomputed from now.
pub fn upsert(conn: &Connection, data: &UpsertScheduleRequest) -> anyhow::Result<Schedule> {
    let now = Utc::now();
    let next_run = data
        .enabled
        .then(|| next_run_after(now, data.interval_hours))
        .flatten();
    conn.execute(
        "INSERT INTO schedules (volume_name, interval_hours, keep_count, enabled, created_at, next_run_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(volume_name) DO UPDATE SET
           interval_hours = excluded.interval_hours,
           keep_count = excluded.keep_count,
           enabled = excluded.enabled,
           next_run_at = excluded.next_run_at",
        params![
            data.volume_name,
            data.interval_hours,
            data.keep_count,
            data.enabled as i64,
            now.to_rfc3339(),
            next_run,
        ],
    )?;
    find_by_volume(conn, &data.volume_name)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve saved schedule"))
}

pub fn record_run(conn: &Connection, volume_name: &str, ran_at: DateTime<Utc>) -> anyhow::Result<()> {
    let Some(schedule) = find_by_volume(conn, volume_name)? else {
        return Ok(());
    };
    let next_run = schedule
        .enabled
        .then(|| next_run_after(ran_at, schedule.interval_hours))
        .flatten();
    conn.execute(
        "UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE volume_name = ?",
        params![ran_at.to_rfc3339(), next_run, volume_name],
    )?;
    Ok(())
}

/// Move the next run of a volume to one interval after `from`.
pub fn reset_next_run(conn: &Connection, volume_name: &str, from: DateTime<Utc>) -> anyhow::Result<()> {
    let Some(schedule) = find_by_volume(conn, volume_name)? else {
        return Ok(());
    };
    let next_run = schedule
        .enabled
        .then(|| next_run_after(from, schedule.interval_hours))
        .flatten();
    conn.execute(
        "UPDATE schedules SET next_run_at = ? WHERE volume_name = ?",
        params![next_run, volume_name],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, volume_name: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM schedules WHERE volume_name = ?", params![volume_name])?;
    Ok(changes > 0)
}

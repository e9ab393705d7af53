//! Aggregate views over `notification_metrics`.
//!
//! Every query filters with `julianday()` so rows stored as RFC3339 and rows
//! stored as `YYYY-MM-DD HH:MM:SS` fall into the same window.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::notifications::types::NotifyType;
use crate::storage::time::{format_timestamp, parse_timestamp};
use crate::storage::{SqliteStore, StoreResult};

const WINDOW: &str = "julianday(timestamp) >= julianday(?1) AND julianday(timestamp) < julianday(?2)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Percentage, 0.0 to 100.0.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub services: Vec<ServiceBreakdown>,
    pub types: Vec<TypeCount>,
    pub hourly: Vec<HourlyBucket>,
    pub top_errors: Vec<ErrorCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceBreakdown {
    pub service_id: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    pub notify_type: NotifyType,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub total: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

fn rate(succeeded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (succeeded as f64 / total as f64) * 100.0
}

#[derive(Debug, Clone)]
pub struct MetricsReporter {
    store: SqliteStore,
}

impl MetricsReporter {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Summarise metrics with `start <= timestamp < end`, keeping the
    /// `top_n` most frequent error messages.
    pub fn report(&self, start: DateTime<Utc>, end: DateTime<Utc>, top_n: usize) -> StoreResult<MetricsReport> {
        let window = (format_timestamp(start), format_timestamp(end));
        self.store.with_connection(|conn| {
            let (total, succeeded, average_duration_ms) = totals(conn, &window)?;
            Ok(MetricsReport {
                start,
                end,
                total,
                succeeded,
                failed: total - succeeded,
                success_rate: rate(succeeded, total),
                average_duration_ms,
                services: services(conn, &window)?,
                types: types(conn, &window)?,
                hourly: hourly(conn, &window)?,
                top_errors: top_errors(conn, &window, top_n)?,
            })
        })
    }
}

type Window = (String, String);

fn totals(conn: &Connection, window: &Window) -> StoreResult<(u64, u64, f64)> {
    let sql = format!(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(duration_ms), 0.0)
         FROM notification_metrics WHERE {WINDOW}"
    );
    let row = conn.query_row(&sql, params![window.0, window.1], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
    })?;
    Ok((row.0.max(0) as u64, row.1.max(0) as u64, row.2))
}

fn services(conn: &Connection, window: &Window) -> StoreResult<Vec<ServiceBreakdown>> {
    let sql = format!(
        "SELECT service_id,
                COUNT(*),
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                AVG(duration_ms)
         FROM notification_metrics WHERE {WINDOW}
         GROUP BY service_id
         ORDER BY COUNT(*) DESC, service_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![window.0, window.1], |row| {
        let total = row.get::<_, i64>(1)?.max(0) as u64;
        let succeeded = row.get::<_, i64>(2)?.max(0) as u64;
        Ok(ServiceBreakdown {
            service_id: row.get(0)?,
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: rate(succeeded, total),
            average_duration_ms: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn types(conn: &Connection, window: &Window) -> StoreResult<Vec<TypeCount>> {
    let sql = format!(
        "SELECT notification_type, COUNT(*)
         FROM notification_metrics WHERE {WINDOW}
         GROUP BY notification_type
         ORDER BY notification_type ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![window.0, window.1], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut counts = Vec::new();
    for row in rows {
        let (code, count) = row?;
        match NotifyType::from_code(code) {
            Some(notify_type) => counts.push(TypeCount {
                notify_type,
                count: count.max(0) as u64,
            }),
            None => tracing::warn!(event = "unknown_notification_type", code, "skipping metrics with unknown type"),
        }
    }
    Ok(counts)
}

fn hourly(conn: &Connection, window: &Window) -> StoreResult<Vec<HourlyBucket>> {
    let sql = format!(
        "SELECT strftime('%Y-%m-%d %H:00', timestamp) AS hour,
                COUNT(*),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
         FROM notification_metrics WHERE {WINDOW}
         GROUP BY hour
         ORDER BY hour ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![window.0, window.1], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    let mut buckets = Vec::new();
    for row in rows {
        let (hour, total, failed) = row?;
        let Some(hour) = hour else { continue };
        buckets.push(HourlyBucket {
            hour: parse_timestamp(&hour),
            total: total.max(0) as u64,
            failed: failed.max(0) as u64,
        });
    }
    Ok(buckets)
}

fn top_errors(conn: &Connection, window: &Window, top_n: usize) -> StoreResult<Vec<ErrorCount>> {
    if top_n == 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT error_message,
                COUNT(*),
                strftime('%Y-%m-%dT%H:%M:%fZ', MAX(julianday(timestamp)))
         FROM notification_metrics
         WHERE {WINDOW} AND status = 'failed' AND error_message IS NOT NULL
         GROUP BY error_message
         ORDER BY COUNT(*) DESC, MAX(julianday(timestamp)) DESC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![window.0, window.1, top_n as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut errors = Vec::new();
    for row in rows {
        let (message, count, last_seen) = row?;
        errors.push(ErrorCount {
            message,
            count: count.max(0) as u64,
            last_seen: parse_timestamp(&last_seen),
        });
    }
    Ok(errors)
}

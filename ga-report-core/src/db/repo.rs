//! Statistics repository layer
//!
//! Every row is keyed by (entity, period) and written with overwrite
//! semantics, so re-running a fetch for a period converges on the same state.
//! Writes for one period go through a [`StatWriter`] inside a single
//! transaction.

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Fixed-width UTC timestamp; lexicographic order matches write order.
fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub url_stats: i64,
    pub keyed_stats: i64,
    pub referral_stats: i64,
}

/// Database handle (single connection)
pub struct StatStore {
    conn: Mutex<Connection>,
}

impl StatStore {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets report readers run while a period is being written
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::StorePoisoned)
    }

    /// Run `f` inside one transaction; nothing is visible to other
    /// connections unless it returns `Ok`.
    pub fn write_period<T>(&self, f: impl FnOnce(&StatWriter<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let value = f(&StatWriter { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }

    // ============================================
    // Single-row writes (autocommit)
    // ============================================

    /// Insert or overwrite the counts for (url, period).
    pub fn upsert_url_stat(&self, stat: &UrlStat) -> Result<()> {
        let conn = self.connection()?;
        StatWriter { conn: &conn }.upsert_url_stat(stat)
    }

    /// Insert or overwrite the value for (key, stat_name, period).
    pub fn upsert_keyed_stat(
        &self,
        key: &str,
        stat_name: &str,
        period_name: &str,
        value: i64,
    ) -> Result<()> {
        let conn = self.connection()?;
        StatWriter { conn: &conn }.upsert_keyed_stat(key, stat_name, period_name, value)
    }

    /// Insert or overwrite the referred visit count for (url, period).
    pub fn upsert_referral_stat(&self, url: &str, period_name: &str, count: i64) -> Result<()> {
        let conn = self.connection()?;
        StatWriter { conn: &conn }.upsert_referral_stat(url, period_name, count)
    }

    /// Delete every row of `kind` stored for `period`.
    ///
    /// Deleting url rows recomputes the "All" row of every affected URL in
    /// the same transaction.
    pub fn replace_period(&self, period: &PeriodName, kind: StatKind) -> Result<usize> {
        self.write_period(|w| {
            let touched = match kind {
                StatKind::Url if !period.is_all() => w.urls_in_period(&period.to_string())?,
                _ => Vec::new(),
            };
            let deleted = w.replace_period(period, kind)?;
            for url in &touched {
                crate::rollup::recompute_all_in(w, url)?;
            }
            Ok(deleted)
        })
    }

    /// Resolve a URL to the name of the catalog entity owning it.
    ///
    /// A package already recorded on a stored row wins; otherwise the
    /// catalog is asked. `None` means no entity matches.
    pub fn find_url_by_package(&self, url: &str, catalog: &dyn Catalog) -> Result<Option<String>> {
        let stored: Option<String> = {
            let conn = self.connection()?;
            conn.query_row(
                "SELECT MAX(package_id) FROM ga_url WHERE url = ? AND package_id IS NOT NULL",
                [url],
                |r| r.get(0),
            )?
        };
        if stored.is_some() {
            return Ok(stored);
        }
        Ok(catalog.find_by_url(url)?.map(|entity| entity.name))
    }

    // ============================================
    // Reads
    // ============================================

    /// Stored counts for (url, period).
    pub fn url_stat(&self, url: &str, period_name: &str) -> Result<Option<UrlStat>> {
        let conn = self.connection()?;
        StatWriter { conn: &conn }.url_stat(url, period_name)
    }

    /// Every stored row for `url`, "All" included, ordered by period name.
    pub fn url_stats_for(&self, url: &str) -> Result<Vec<UrlStat>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM ga_url WHERE url = ? ORDER BY period_name",
        )?;
        let rows = stmt.query_map([url], row_to_url_stat)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Stored value for (key, stat_name, period).
    pub fn keyed_stat(&self, key: &str, stat_name: &str, period_name: &str) -> Result<Option<i64>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT value FROM ga_stat WHERE stat_name = ? AND key = ? AND period_name = ?",
            params![stat_name, key, period_name],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Stored referred visits for (url, period).
    pub fn referral_stat(&self, url: &str, period_name: &str) -> Result<Option<i64>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT count FROM ga_referrer WHERE url = ? AND period_name = ?",
            [url, period_name],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Total downloads recorded for a dataset.
    ///
    /// The stored "All" row wins when present; otherwise the per-period rows
    /// are summed.
    pub fn downloads_total(&self, key: &str) -> Result<i64> {
        if let Some(all) = self.keyed_stat(key, DOWNLOADS_STAT, ALL_PERIOD)? {
            return Ok(all);
        }
        let conn = self.connection()?;
        let total: i64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(value), 0) FROM ga_stat
            WHERE stat_name = ? AND key = ? AND period_name != ?
            "#,
            [DOWNLOADS_STAT, key, ALL_PERIOD],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// "All" rows for URLs starting with `prefix`, most viewed first.
    pub fn rollups_with_prefix(&self, prefix: &str) -> Result<Vec<UrlStat>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM ga_url
            WHERE period_name = ?1 AND substr(url, 1, length(?2)) = ?2
            ORDER BY pageviews DESC, url ASC
            "#,
        )?;
        let rows = stmt.query_map(params![ALL_PERIOD, prefix], row_to_url_stat)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Referral counts summed per URL, largest first.
    ///
    /// `period` of `None` sums across every stored period.
    pub fn referral_totals(&self, prefix: &str, period: Option<&str>) -> Result<Vec<(String, i64)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT url, SUM(count) AS total FROM ga_referrer
            WHERE substr(url, 1, length(?1)) = ?1
              AND (?2 IS NULL OR period_name = ?2)
            GROUP BY url
            ORDER BY total DESC, url ASC
            "#,
        )?;
        let rows = stmt.query_map(params![prefix, period], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Distinct referral period names, ascending.
    pub fn referral_periods(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT period_name FROM ga_referrer ORDER BY period_name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// URLs whose "All" row is missing, older than a constituent row, or
    /// left without any constituent rows.
    pub fn stale_rollup_urls(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.url
            FROM ga_url p
            LEFT JOIN ga_url a ON a.url = p.url AND a.period_name = ?1
            WHERE p.period_name != ?1
            GROUP BY p.url
            HAVING MAX(a.updated_at) IS NULL OR MAX(a.updated_at) < MAX(p.updated_at)
            UNION
            SELECT a.url
            FROM ga_url a
            WHERE a.period_name = ?1
              AND NOT EXISTS (
                  SELECT 1 FROM ga_url p WHERE p.url = a.url AND p.period_name != ?1
              )
            ORDER BY 1
            "#,
        )?;
        let rows = stmt.query_map([ALL_PERIOD], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Number of rows in each statistics table.
    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.connection()?;
        conn.query_row(
            r#"
            SELECT
                (SELECT COUNT(*) FROM ga_url),
                (SELECT COUNT(*) FROM ga_stat),
                (SELECT COUNT(*) FROM ga_referrer)
            "#,
            [],
            |r| {
                Ok(StoreCounts {
                    url_stats: r.get(0)?,
                    keyed_stats: r.get(1)?,
                    referral_stats: r.get(2)?,
                })
            },
        )
        .map_err(Error::from)
    }
}

/// Name of the keyed statistic holding resource download counts.
pub const DOWNLOADS_STAT: &str = "Downloads";

fn row_to_url_stat(row: &Row) -> rusqlite::Result<UrlStat> {
    Ok(UrlStat {
        url: row.get("url")?,
        period_name: row.get("period_name")?,
        pageviews: row.get("pageviews")?,
        visits: row.get("visits")?,
        package_id: row.get("package_id")?,
    })
}

/// Write access for one period, bound to an open transaction.
pub struct StatWriter<'c> {
    conn: &'c Connection,
}

impl StatWriter<'_> {
    /// Insert or overwrite the counts for (url, period).
    ///
    /// "All" rows are derived and can only be written by the rollup.
    pub fn upsert_url_stat(&self, stat: &UrlStat) -> Result<()> {
        if stat.period_name == ALL_PERIOD {
            return Err(Error::InvalidPeriod(
                "\"All\" url rows are derived from the other periods".to_string(),
            ));
        }
        self.write_url_row(stat, false)
    }

    /// Upsert without the "All" guard. An unchanged row keeps its
    /// `updated_at` unless `touch` is set.
    pub(crate) fn write_url_row(&self, stat: &UrlStat, touch: bool) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO ga_url (url, period_name, pageviews, visits, package_id, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(url, period_name) DO UPDATE SET
                pageviews = excluded.pageviews,
                visits = excluded.visits,
                package_id = COALESCE(excluded.package_id, ga_url.package_id),
                updated_at = CASE
                    WHEN ?7 = 0
                     AND ga_url.pageviews = excluded.pageviews
                     AND ga_url.visits = excluded.visits
                     AND ga_url.package_id IS COALESCE(excluded.package_id, ga_url.package_id)
                    THEN ga_url.updated_at
                    ELSE excluded.updated_at
                END
            "#,
            params![
                stat.url,
                stat.period_name,
                stat.pageviews,
                stat.visits,
                stat.package_id,
                now_stamp(),
                touch,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn delete_url_row(&self, url: &str, period_name: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM ga_url WHERE url = ? AND period_name = ?",
            [url, period_name],
        )?;
        Ok(deleted > 0)
    }

    /// Insert or overwrite the value for (key, stat_name, period).
    pub fn upsert_keyed_stat(
        &self,
        key: &str,
        stat_name: &str,
        period_name: &str,
        value: i64,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO ga_stat (stat_name, key, period_name, value, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(stat_name, key, period_name) DO UPDATE SET
                value = excluded.value,
                updated_at = CASE WHEN ga_stat.value = excluded.value
                    THEN ga_stat.updated_at ELSE excluded.updated_at END
            "#,
            params![stat_name, key, period_name, value, now_stamp()],
        )?;
        Ok(())
    }

    /// Insert or overwrite the referred visit count for (url, period).
    pub fn upsert_referral_stat(&self, url: &str, period_name: &str, count: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO ga_referrer (url, period_name, count, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(url, period_name) DO UPDATE SET
                count = excluded.count,
                updated_at = CASE WHEN ga_referrer.count = excluded.count
                    THEN ga_referrer.updated_at ELSE excluded.updated_at END
            "#,
            params![url, period_name, count, now_stamp()],
        )?;
        Ok(())
    }

    /// Delete every row of `kind` stored for `period`, returning the count.
    ///
    /// The "All" period cannot be replaced; its rows are derived.
    pub fn replace_period(&self, period: &PeriodName, kind: StatKind) -> Result<usize> {
        if period.is_all() {
            return Err(Error::InvalidPeriod(
                "the \"All\" period cannot be replaced".to_string(),
            ));
        }
        let sql = format!("DELETE FROM {} WHERE period_name = ?", kind.table());
        let deleted = self.conn.execute(&sql, [period.to_string()])?;
        tracing::debug!(period = %period, table = kind.table(), deleted, "Replaced period");
        Ok(deleted)
    }

    /// URLs that have a row stored for `period`.
    pub fn urls_in_period(&self, period_name: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT url FROM ga_url WHERE period_name = ? ORDER BY url")?;
        let rows = stmt.query_map([period_name], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Stored counts for (url, period).
    pub fn url_stat(&self, url: &str, period_name: &str) -> Result<Option<UrlStat>> {
        self.conn
            .query_row(
                "SELECT * FROM ga_url WHERE url = ? AND period_name = ?",
                [url, period_name],
                row_to_url_stat,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Every non-"All" row stored for `url`.
    pub fn period_rows(&self, url: &str) -> Result<Vec<UrlStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM ga_url WHERE url = ? AND period_name != ? ORDER BY period_name",
        )?;
        let rows = stmt.query_map([url, ALL_PERIOD], row_to_url_stat)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

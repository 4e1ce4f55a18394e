//! Durable per-day ledger of water used and rainfall observed, backed by
//! SQLite.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use time::macros::format_description;
use time::{Date, Duration};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One calendar day's aggregate. Days without activity are synthesized with
/// zero values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryDay {
    #[serde(skip)]
    pub date: Date,
    pub day: String, // YYYY-MM-DD
    pub water_used_l: f64,
    pub rainfall_mm: f64,
}

/// Value side of the persisted history mapping (date -> entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub water_used_l: f64,
    pub rainfall_mm: f64,
}

/// Entry shape of the legacy `history.json` file written by older
/// controllers.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    water_used: f64,
    #[serde(default)]
    rainfall: f64,
}

pub fn day_key(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month() as u8, date.day())
}

pub fn parse_day_key(s: &str) -> Option<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).ok()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Mutations (each commits before returning)
    // ----------------------------

    /// Add `liters` to the day's water total, creating the row if needed.
    pub async fn add_water(&self, day: Date, liters: f64) -> Result<()> {
        ensure!(
            liters.is_finite() && liters >= 0.0,
            "water amount must be a non-negative number, got {liters}"
        );
        let key = day_key(day);
        sqlx::query(
            r#"
            INSERT INTO history_days (day, water_used_l, rainfall_mm)
            VALUES (?, ?, 0)
            ON CONFLICT(day) DO UPDATE SET
              water_used_l = water_used_l + excluded.water_used_l
            "#,
        )
        .bind(&key)
        .bind(liters)
        .execute(&self.pool)
        .await
        .context("add_water failed")?;
        Ok(())
    }

    /// Overwrite the day's rainfall with the latest reading.
    pub async fn set_rainfall(&self, day: Date, mm: f64) -> Result<()> {
        ensure!(
            mm.is_finite() && mm >= 0.0,
            "rainfall must be a non-negative number, got {mm}"
        );
        let key = day_key(day);
        sqlx::query(
            r#"
            INSERT INTO history_days (day, water_used_l, rainfall_mm)
            VALUES (?, 0, ?)
            ON CONFLICT(day) DO UPDATE SET
              rainfall_mm = excluded.rainfall_mm
            "#,
        )
        .bind(&key)
        .bind(mm)
        .execute(&self.pool)
        .await
        .context("set_rainfall failed")?;
        Ok(())
    }

    // ----------------------------
    // Queries
    // ----------------------------

    #[cfg(test)]
    pub async fn get_day(&self, day: Date) -> Result<HistoryDay> {
        let key = day_key(day);
        let row: Option<(f64, f64)> = sqlx::query_as(
            r#"
            SELECT water_used_l, rainfall_mm
            FROM history_days
            WHERE day = ?
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .context("get_day failed")?;

        let (water_used_l, rainfall_mm) = row.unwrap_or((0.0, 0.0));
        Ok(HistoryDay {
            date: day,
            day: key,
            water_used_l,
            rainfall_mm,
        })
    }

    /// The `n` days ending at `today`, oldest first. Missing days are zero.
    pub async fn last_n_days(&self, today: Date, n: u32) -> Result<Vec<HistoryDay>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = today - Duration::days(i64::from(n) - 1);

        let rows: Vec<(String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT day, water_used_l, rainfall_mm
            FROM history_days
            WHERE day >= ? AND day <= ?
            "#,
        )
        .bind(day_key(start))
        .bind(day_key(today))
        .fetch_all(&self.pool)
        .await
        .context("last_n_days failed")?;

        let recorded: HashMap<String, (f64, f64)> = rows
            .into_iter()
            .map(|(day, water, rain)| (day, (water, rain)))
            .collect();

        Ok((0..i64::from(n))
            .map(|offset| {
                let date = start + Duration::days(offset);
                let key = day_key(date);
                let (water_used_l, rainfall_mm) =
                    recorded.get(&key).copied().unwrap_or((0.0, 0.0));
                HistoryDay {
                    date,
                    day: key,
                    water_used_l,
                    rainfall_mm,
                }
            })
            .collect())
    }

    /// Full persisted mapping, keyed by ISO date.
    pub async fn export(&self) -> Result<BTreeMap<String, HistoryEntry>> {
        let rows: Vec<(String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT day, water_used_l, rainfall_mm
            FROM history_days
            ORDER BY day
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("export failed")?;

        Ok(rows
            .into_iter()
            .map(|(day, water_used_l, rainfall_mm)| {
                (
                    day,
                    HistoryEntry {
                        water_used_l,
                        rainfall_mm,
                    },
                )
            })
            .collect())
    }

    /// Seed days from a legacy `history.json` mapping. Days already present
    /// in the database are left untouched. Returns the number of rows added.
    pub async fn import_legacy_json(&self, json: &str) -> Result<u64> {
        let legacy: BTreeMap<String, LegacyEntry> =
            serde_json::from_str(json).context("legacy history is not a date -> entry map")?;

        let mut inserted = 0;
        for (day, entry) in &legacy {
            if parse_day_key(day).is_none() {
                tracing::warn!(day = %day, "legacy history: skipping malformed date");
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT INTO history_days (day, water_used_l, rainfall_mm)
                VALUES (?, ?, ?)
                ON CONFLICT(day) DO NOTHING
                "#,
            )
            .bind(day)
            .bind(entry.water_used.max(0.0))
            .bind(entry.rainfall.max(0.0))
            .execute(&self.pool)
            .await
            .with_context(|| format!("legacy history import failed at {day}"))?;
            inserted += result.rows_affected();
        }

        tracing::info!(days = legacy.len(), inserted, "legacy history imported");
        Ok(inserted)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_db;
    use time::macros::date;

    // -- day keys -----------------------------------------------------------

    #[test]
    fn day_key_is_zero_padded_iso() {
        assert_eq!(day_key(date!(2024-03-07)), "2024-03-07");
    }

    #[test]
    fn parse_day_key_round_trips() {
        assert_eq!(parse_day_key("2024-03-07"), Some(date!(2024-03-07)));
        assert_eq!(parse_day_key("2024-13-01"), None);
        assert_eq!(parse_day_key("yesterday"), None);
    }

    // -- add_water ------------------------------------------------------------

    #[tokio::test]
    async fn add_water_is_additive() {
        let db = memory_db().await;
        let today = date!(2024-05-01);
        db.add_water(today, 50.0).await.unwrap();
        db.add_water(today, 50.0).await.unwrap();

        let day = db.get_day(today).await.unwrap();
        assert_eq!(day.water_used_l, 100.0);
        assert_eq!(day.rainfall_mm, 0.0);
    }

    #[tokio::test]
    async fn add_water_rejects_negative() {
        let db = memory_db().await;
        let today = date!(2024-05-01);
        assert!(db.add_water(today, -1.0).await.is_err());
        assert!(db.add_water(today, f64::NAN).await.is_err());
        assert_eq!(db.get_day(today).await.unwrap().water_used_l, 0.0);
    }

    #[tokio::test]
    async fn add_water_keeps_rainfall() {
        let db = memory_db().await;
        let today = date!(2024-05-01);
        db.set_rainfall(today, 4.0).await.unwrap();
        db.add_water(today, 15.0).await.unwrap();

        let day = db.get_day(today).await.unwrap();
        assert_eq!(day.water_used_l, 15.0);
        assert_eq!(day.rainfall_mm, 4.0);
    }

    // -- set_rainfall ---------------------------------------------------------

    #[tokio::test]
    async fn set_rainfall_overwrites() {
        let db = memory_db().await;
        let today = date!(2024-05-01);
        db.set_rainfall(today, 3.0).await.unwrap();
        db.set_rainfall(today, 5.0).await.unwrap();

        assert_eq!(db.get_day(today).await.unwrap().rainfall_mm, 5.0);
    }

    #[tokio::test]
    async fn set_rainfall_keeps_water() {
        let db = memory_db().await;
        let today = date!(2024-05-01);
        db.add_water(today, 30.0).await.unwrap();
        db.set_rainfall(today, 2.0).await.unwrap();

        assert_eq!(db.get_day(today).await.unwrap().water_used_l, 30.0);
    }

    // -- last_n_days ------------------------------------------------------------

    #[tokio::test]
    async fn last_seven_days_on_empty_store() {
        let db = memory_db().await;
        let today = date!(2024-03-02);
        let days = db.last_n_days(today, 7).await.unwrap();

        assert_eq!(days.len(), 7);
        let keys: Vec<&str> = days.iter().map(|d| d.day.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "2024-02-25",
                "2024-02-26",
                "2024-02-27",
                "2024-02-28",
                "2024-02-29",
                "2024-03-01",
                "2024-03-02",
            ]
        );
        assert!(days
            .iter()
            .all(|d| d.water_used_l == 0.0 && d.rainfall_mm == 0.0));
    }

    #[tokio::test]
    async fn last_n_days_fills_recorded_values() {
        let db = memory_db().await;
        let today = date!(2024-05-10);
        db.add_water(date!(2024-05-08), 45.0).await.unwrap();
        db.set_rainfall(today, 1.5).await.unwrap();
        // Outside the window.
        db.add_water(date!(2024-05-01), 99.0).await.unwrap();

        let days = db.last_n_days(today, 3).await.unwrap();
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].day, "2024-05-08");
        assert_eq!(days[0].water_used_l, 45.0);
        assert_eq!(days[1].water_used_l, 0.0);
        assert_eq!(days[2].rainfall_mm, 1.5);
    }

    #[tokio::test]
    async fn last_zero_days_is_empty() {
        let db = memory_db().await;
        assert!(db
            .last_n_days(date!(2024-05-10), 0)
            .await
            .unwrap()
            .is_empty());
    }

    // -- export / legacy import --------------------------------------------------

    #[tokio::test]
    async fn export_lists_recorded_days_in_order() {
        let db = memory_db().await;
        db.add_water(date!(2024-05-02), 10.0).await.unwrap();
        db.set_rainfall(date!(2024-05-01), 2.0).await.unwrap();

        let map = db.export().await.unwrap();
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["2024-05-01", "2024-05-02"]);
        assert_eq!(
            map["2024-05-01"],
            HistoryEntry {
                water_used_l: 0.0,
                rainfall_mm: 2.0
            }
        );
    }

    #[tokio::test]
    async fn legacy_import_skips_existing_and_malformed_days() {
        let db = memory_db().await;
        db.add_water(date!(2024-05-02), 10.0).await.unwrap();

        let json = r#"{
            "2024-05-01": {"water_used": 30, "rainfall": 2.5},
            "2024-05-02": {"water_used": 999, "rainfall": 9},
            "not-a-date": {"water_used": 1}
        }"#;
        let inserted = db.import_legacy_json(json).await.unwrap();
        assert_eq!(inserted, 1);

        let first = db.get_day(date!(2024-05-01)).await.unwrap();
        assert_eq!(first.water_used_l, 30.0);
        assert_eq!(first.rainfall_mm, 2.5);
        let second = db.get_day(date!(2024-05-02)).await.unwrap();
        assert_eq!(second.water_used_l, 10.0);
    }

    #[tokio::test]
    async fn legacy_import_rejects_non_map() {
        let db = memory_db().await;
        assert!(db.import_legacy_json("[1, 2, 3]").await.is_err());
    }
}

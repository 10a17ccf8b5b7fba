//! Origin-side persistence: station metadata, recent picks, origin upsert.
//!
//! Origins are keyed by `association_key`, so re-solving the same event
//! updates the existing row instead of duplicating it. Arrivals are
//! replaced wholesale (DELETE then INSERT) on every upsert. Writes are not
//! wrapped in a transaction; readers key by association_key and re-observe.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::warn;

use seis_types::{OriginEstimate, Phase, Pick, Station, StationKey};

/// Locator-owned tables, plus the externally-populated `stations`.
/// The pick tables are bootstrapped by the detector.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        net     TEXT NOT NULL,
        sta     TEXT NOT NULL,
        loc     TEXT NOT NULL DEFAULT '',
        lat     DOUBLE PRECISION NOT NULL,
        lon     DOUBLE PRECISION NOT NULL,
        elev_m  DOUBLE PRECISION NOT NULL DEFAULT 0,
        PRIMARY KEY (net, sta, loc)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS origins (
        id               BIGSERIAL PRIMARY KEY,
        association_key  TEXT NOT NULL UNIQUE,
        origin_ts        TIMESTAMPTZ NOT NULL,
        lat              DOUBLE PRECISION NOT NULL,
        lon              DOUBLE PRECISION NOT NULL,
        depth_km         DOUBLE PRECISION NOT NULL,
        rms_seconds      DOUBLE PRECISION NOT NULL,
        azimuthal_gap_deg DOUBLE PRECISION NOT NULL,
        used_stations    INTEGER NOT NULL,
        status           TEXT NOT NULL DEFAULT 'preliminary',
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS origin_arrivals (
        id                    BIGSERIAL PRIMARY KEY,
        origin_id             BIGINT NOT NULL REFERENCES origins (id) ON DELETE CASCADE,
        pick_id               BIGINT NOT NULL,
        ts                    TIMESTAMPTZ NOT NULL,
        phase                 TEXT NOT NULL,
        net                   TEXT NOT NULL,
        sta                   TEXT NOT NULL,
        loc                   TEXT NOT NULL DEFAULT '',
        chan                  TEXT NOT NULL,
        distance_km           DOUBLE PRECISION NOT NULL,
        azimuth_deg           DOUBLE PRECISION NOT NULL,
        predicted_tt_seconds  DOUBLE PRECISION NOT NULL,
        residual_seconds      DOUBLE PRECISION NOT NULL
    )
    "#,
];

pub struct OriginStore {
    pool: PgPool,
}

impl OriginStore {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(1).connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn fetch_stations(&self) -> Result<HashMap<StationKey, Station>, sqlx::Error> {
        let rows = sqlx::query("SELECT net, sta, loc, lat, lon, elev_m FROM stations")
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let station = Station {
                net: row.get("net"),
                sta: row.get("sta"),
                loc: row.get("loc"),
                lat: row.get("lat"),
                lon: row.get("lon"),
                elev_m: row.get("elev_m"),
            };
            out.insert(station.station_key(), station);
        }
        Ok(out)
    }

    /// P picks from the last `lookback_seconds`, ascending by time.
    pub async fn fetch_recent_picks(
        &self,
        lookback_seconds: i64,
    ) -> Result<Vec<Pick>, sqlx::Error> {
        let start_ts = Utc::now() - Duration::seconds(lookback_seconds);
        let rows = sqlx::query(
            "SELECT p.id, p.ts, p.phase, p.net, p.sta, p.loc, p.chan, p.score \
             FROM phase_picks p \
             WHERE p.ts >= $1 AND UPPER(p.phase) = 'P' \
             ORDER BY p.ts ASC",
        )
        .bind(start_ts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows_to_picks(rows))
    }

    /// P picks strictly after `since_ts`, ascending by time.
    pub async fn fetch_picks_since(
        &self,
        since_ts: DateTime<Utc>,
    ) -> Result<Vec<Pick>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT p.id, p.ts, p.phase, p.net, p.sta, p.loc, p.chan, p.score \
             FROM phase_picks p \
             WHERE p.ts > $1 AND UPPER(p.phase) = 'P' \
             ORDER BY p.ts ASC",
        )
        .bind(since_ts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows_to_picks(rows))
    }

    /// Insert or refresh the origin row for this association key.
    /// Returns the origin id.
    pub async fn upsert_origin(&self, estimate: &OriginEstimate) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "INSERT INTO origins \
                (association_key, origin_ts, lat, lon, depth_km, rms_seconds, \
                 azimuthal_gap_deg, used_stations, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'preliminary') \
             ON CONFLICT (association_key) DO UPDATE SET \
                origin_ts = EXCLUDED.origin_ts, \
                lat = EXCLUDED.lat, \
                lon = EXCLUDED.lon, \
                depth_km = EXCLUDED.depth_km, \
                rms_seconds = EXCLUDED.rms_seconds, \
                azimuthal_gap_deg = EXCLUDED.azimuthal_gap_deg, \
                used_stations = EXCLUDED.used_stations, \
                updated_at = now() \
             RETURNING id",
        )
        .bind(&estimate.association_key)
        .bind(estimate.origin_ts)
        .bind(estimate.lat)
        .bind(estimate.lon)
        .bind(estimate.depth_km)
        .bind(estimate.rms_seconds)
        .bind(estimate.azimuthal_gap_deg)
        .bind(estimate.used_stations as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Replace the arrival set for `origin_id` with the estimate's arrivals.
    pub async fn replace_origin_arrivals(
        &self,
        origin_id: i64,
        estimate: &OriginEstimate,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM origin_arrivals WHERE origin_id = $1")
            .bind(origin_id)
            .execute(&self.pool)
            .await?;

        if estimate.arrivals.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO origin_arrivals \
                (origin_id, pick_id, ts, phase, net, sta, loc, chan, \
                 distance_km, azimuth_deg, predicted_tt_seconds, residual_seconds) ",
        );
        qb.push_values(estimate.arrivals.iter(), |mut b, arrival| {
            b.push_bind(origin_id)
                .push_bind(arrival.pick.id)
                .push_bind(arrival.pick.ts)
                .push_bind(arrival.pick.phase.as_str())
                .push_bind(&arrival.pick.net)
                .push_bind(&arrival.pick.sta)
                .push_bind(&arrival.pick.loc)
                .push_bind(&arrival.pick.chan)
                .push_bind(arrival.distance_km)
                .push_bind(arrival.azimuth_deg)
                .push_bind(arrival.predicted_tt_seconds)
                .push_bind(arrival.residual_seconds);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

fn rows_to_picks(rows: Vec<sqlx::postgres::PgRow>) -> Vec<Pick> {
    rows.into_iter()
        .filter_map(|row| {
            let phase_label: String = row.get("phase");
            let Some(phase) = Phase::from_label(&phase_label) else {
                warn!(
                    "Skipping pick id={} with unknown phase '{phase_label}'",
                    row.get::<i64, _>("id")
                );
                return None;
            };
            Some(Pick {
                id: row.get("id"),
                ts: row.get("ts"),
                phase,
                net: row.get("net"),
                sta: row.get("sta"),
                loc: row.get("loc"),
                chan: row.get("chan"),
                score: row.get("score"),
            })
        })
        .collect()
}

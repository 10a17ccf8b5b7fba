//! Pick persistence.
//!
//! All inserts are idempotent (`ON CONFLICT DO NOTHING`) so re-detection of
//! the same onset after a restart never duplicates rows. Failed inserts are
//! the caller's problem to log — the consumer keeps running either way.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use tracing::{debug, warn};

use seis_types::{epoch_to_utc, SourceId};

use crate::picker::{PhasePick, RawDetection};
use crate::trigger::TriggerWindow;

/// Detector-owned tables. `stations` and the origin tables belong to the
/// locator side.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS picks (
        id      BIGSERIAL PRIMARY KEY,
        ts_on   TIMESTAMPTZ NOT NULL,
        ts_off  TIMESTAMPTZ NOT NULL,
        net     TEXT NOT NULL,
        sta     TEXT NOT NULL,
        loc     TEXT NOT NULL DEFAULT '',
        chan    TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (ts_on, net, sta, loc, chan)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS phase_picks (
        id      BIGSERIAL PRIMARY KEY,
        ts      TIMESTAMPTZ NOT NULL,
        phase   TEXT NOT NULL,
        score   DOUBLE PRECISION,
        net     TEXT NOT NULL,
        sta     TEXT NOT NULL,
        loc     TEXT NOT NULL DEFAULT '',
        chan    TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (ts, net, sta, loc, chan, phase)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_detections (
        id      BIGSERIAL PRIMARY KEY,
        ts_on   TIMESTAMPTZ NOT NULL,
        ts_off  TIMESTAMPTZ NOT NULL,
        net     TEXT NOT NULL,
        sta     TEXT NOT NULL,
        loc     TEXT NOT NULL DEFAULT '',
        chan    TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (ts_on, net, sta, loc, chan)
    )
    "#,
];

pub struct PickStore {
    pool: PgPool,
}

impl PickStore {
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

    /// STA/LTA output: `(ts_on, ts_off)` windows into the legacy `picks`
    /// table.
    pub async fn insert_trigger_picks(
        &self,
        sid: &str,
        picks: &[TriggerWindow],
    ) -> Result<(), sqlx::Error> {
        let Some(parsed) = SourceId::parse(sid) else {
            warn!("Unable to parse source id for picks: {sid}");
            return Ok(());
        };

        let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = picks
            .iter()
            .filter_map(|p| Some((epoch_to_utc(p.t_on)?, epoch_to_utc(p.t_off)?)))
            .collect();
        if rows.is_empty() {
            debug!("No picks to be inserted into DB.");
            return Ok(());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO picks (ts_on, ts_off, net, sta, loc, chan) ");
        qb.push_values(rows.iter(), |mut b, (ts_on, ts_off)| {
            b.push_bind(ts_on)
                .push_bind(ts_off)
                .push_bind(&parsed.net)
                .push_bind(&parsed.sta)
                .push_bind(&parsed.loc)
                .push_bind(&parsed.chan);
        });
        qb.push(" ON CONFLICT DO NOTHING");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Picker output: `(ts, phase, score)` rows into `phase_picks`.
    pub async fn insert_phase_picks(
        &self,
        sid: &str,
        picks: &[PhasePick],
    ) -> Result<(), sqlx::Error> {
        let Some(parsed) = SourceId::parse(sid) else {
            warn!("Unable to parse source id for phase picks: {sid}");
            return Ok(());
        };

        let rows: Vec<(DateTime<Utc>, &PhasePick)> = picks
            .iter()
            .filter_map(|p| Some((epoch_to_utc(p.t)?, p)))
            .collect();
        if rows.is_empty() {
            debug!("No phase picks to be inserted into DB.");
            return Ok(());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO phase_picks (ts, phase, score, net, sta, loc, chan) ",
        );
        qb.push_values(rows.iter(), |mut b, (ts, pick)| {
            b.push_bind(ts)
                .push_bind(pick.phase.as_str())
                .push_bind(pick.score)
                .push_bind(&parsed.net)
                .push_bind(&parsed.sta)
                .push_bind(&parsed.loc)
                .push_bind(&parsed.chan);
        });
        qb.push(" ON CONFLICT DO NOTHING");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Event-window detections from the picker.
    pub async fn insert_event_detections(
        &self,
        sid: &str,
        detections: &[RawDetection],
    ) -> Result<(), sqlx::Error> {
        let Some(parsed) = SourceId::parse(sid) else {
            warn!("Unable to parse source id for event detections: {sid}");
            return Ok(());
        };

        let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = detections
            .iter()
            .filter_map(|d| Some((epoch_to_utc(d.start_time)?, epoch_to_utc(d.end_time)?)))
            .collect();
        if rows.is_empty() {
            debug!("No event detections to be inserted into DB.");
            return Ok(());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO event_detections (ts_on, ts_off, net, sta, loc, chan) ",
        );
        qb.push_values(rows.iter(), |mut b, (ts_on, ts_off)| {
            b.push_bind(ts_on)
                .push_bind(ts_off)
                .push_bind(&parsed.net)
                .push_bind(&parsed.sta)
                .push_bind(&parsed.loc)
                .push_bind(&parsed.chan);
        });
        qb.push(" ON CONFLICT DO NOTHING");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

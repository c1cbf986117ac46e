use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use anyhow::Result;

/// One crashed round, as persisted and as broadcast in `GameCrashed` /
/// `RecentGameList` payloads.
#[derive(Debug, Clone)]
pub(crate) struct RoundRecord {
    pub(crate) id: Uuid,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) duration_ms: i64,
    pub(crate) multiplier: Decimal,
    pub(crate) players: i32,
    pub(crate) winners: i32,
}

impl RoundRecord {
    pub(crate) fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::milliseconds(self.duration_ms)
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "startTime": self.start_time.timestamp_millis(),
            "duration": self.duration_ms,
            "multiplier": format!(
                "{:.2}",
                self.multiplier
                    .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            ),
            "players": self.players,
            "winners": self.winners,
        })
    }
}

#[async_trait]
pub(crate) trait GameStore: Send + Sync {
    async fn save_round(&self, record: &RoundRecord) -> Result<()>;

    /// Most recent rounds, start time descending.
    async fn recent_rounds(&self, limit: i64) -> Result<Vec<RoundRecord>>;
}

pub(crate) struct SqlStore {
    db: Pool<Postgres>,
}

impl SqlStore {
    pub(crate) fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GameStore for SqlStore {
    async fn save_round(&self, record: &RoundRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO games
            (id, start_time, end_time, multiplier, player_count, winner_count)
            VALUES
            ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.start_time)
        .bind(record.end_time())
        .bind(record.multiplier)
        .bind(record.players)
        .bind(record.winners)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn recent_rounds(&self, limit: i64) -> Result<Vec<RoundRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, start_time, end_time, multiplier, player_count, winner_count
            FROM games
            ORDER BY start_time DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let start_time: DateTime<Utc> = row.get("start_time");
            let end_time: DateTime<Utc> = row.get("end_time");
            records.push(RoundRecord {
                id: row.get("id"),
                start_time,
                duration_ms: (end_time - start_time).num_milliseconds(),
                multiplier: row.get("multiplier"),
                players: row.get("player_count"),
                winners: row.get("winner_count"),
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn record_json_shape() {
        let start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let record = RoundRecord {
            id: Uuid::nil(),
            start_time: start,
            duration_ms: 16_615,
            multiplier: Decimal::from_str("2.71").unwrap(),
            players: 3,
            winners: 1,
        };

        let v = record.to_json();
        assert_eq!(v["startTime"], 1_700_000_000_000i64);
        assert_eq!(v["duration"], 16_615);
        assert_eq!(v["multiplier"], "2.71");
        assert_eq!(v["players"], 3);
        assert_eq!(v["winners"], 1);
        assert_eq!(record.end_time().timestamp_millis(), 1_700_000_016_615);
    }
}

//! Message activity: raw records in the monthly message shards, daily
//! per-user summaries in `summary.db`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Datelike, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use ember_core::{timestamp_from_unix, EmberResult, Timestamp, ValidationError, WritePolicy};

use crate::ops::messages::{self, MessageRecord};
use crate::ops::summary::{self, SummaryRecord, HOURS_PER_DAY};
use crate::persistence::Stores;
use crate::writers::Writers;

/// One leaderboard line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankItem {
    pub user_id: String,
    pub msg_count: i64,
    /// 1-based.
    pub current_rank: usize,
    /// Places gained since the previous day (negative when dropped).
    /// `None` when the user was not ranked the previous day.
    pub trend: Option<i64>,
}

#[derive(Debug)]
pub struct MessageLogRepository {
    stores: Stores,
    writers: Arc<Writers>,
    utc_offset: FixedOffset,
}

/// `YYYYMMDD` key used by the summary table.
pub fn record_date(day: NaiveDate) -> i64 {
    i64::from(day.year()) * 10_000 + i64::from(day.month()) * 100 + i64::from(day.day())
}

impl MessageLogRepository {
    pub fn new(stores: Stores, writers: Arc<Writers>, utc_offset: FixedOffset) -> Self {
        Self {
            stores,
            writers,
            utc_offset,
        }
    }

    /// Record one message. The shard is chosen by `created_at`.
    pub async fn save_message(
        &self,
        group_id: &str,
        user_id: &str,
        created_at: Timestamp,
        policy: WritePolicy,
    ) -> EmberResult<()> {
        let record = MessageRecord {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            created_at: created_at.timestamp(),
        };
        match policy {
            WritePolicy::Deferred => self.writers.message_log.add(record),
            WritePolicy::Immediate => self
                .stores
                .messages
                .session(Some(created_at), true, move |tx| {
                    messages::bulk_insert(tx, std::slice::from_ref(&record)).map(|_| ())
                })
                .await,
        }
    }

    pub async fn save_summary_batch(&self, records: Vec<SummaryRecord>) -> EmberResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.stores
            .summary
            .session(true, move |tx| summary::bulk_upsert(tx, &records))
            .await
    }

    /// Most active users of a group over `[start, end]`, across shards.
    pub async fn top_users(
        &self,
        group_id: &str,
        start: Timestamp,
        end: Timestamp,
        limit: usize,
    ) -> EmberResult<Vec<(String, i64)>> {
        let group = group_id.to_string();
        let (from, to) = (start.timestamp(), end.timestamp());
        let per_shard = self
            .stores
            .messages
            .map_reduce(start, end, move |tx| {
                messages::top_users(tx, &group, from, to, usize::MAX)
            })
            .await?;

        let mut totals: HashMap<String, i64> = HashMap::new();
        for (_, rows) in per_shard {
            for (user_id, count) in rows {
                *totals.entry(user_id).or_default() += count;
            }
        }
        let mut ranked: Vec<_> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Messages of a group over `[start, end]`, summed across shards.
    pub async fn message_count(
        &self,
        group_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> EmberResult<i64> {
        let group = group_id.to_string();
        let (from, to) = (start.timestamp(), end.timestamp());
        let per_shard = self
            .stores
            .messages
            .map_reduce(start, end, move |tx| {
                messages::count_for_group(tx, &group, from, to)
            })
            .await?;
        Ok(per_shard.into_iter().map(|(_, count)| count).sum())
    }

    /// Messages per local hour of the day for each of `user_ids`.
    pub async fn hourly_distribution(
        &self,
        group_id: &str,
        user_ids: &[String],
        start: Timestamp,
        end: Timestamp,
    ) -> EmberResult<BTreeMap<String, Vec<u32>>> {
        let group = group_id.to_string();
        let users = user_ids.to_vec();
        let (from, to) = (start.timestamp(), end.timestamp());
        let per_shard = self
            .stores
            .messages
            .map_reduce(start, end, move |tx| {
                messages::user_timestamps(tx, &group, &users, from, to)
            })
            .await?;

        let mut hours: BTreeMap<String, Vec<u32>> = user_ids
            .iter()
            .map(|id| (id.clone(), vec![0; HOURS_PER_DAY]))
            .collect();
        for (user_id, at) in per_shard.into_iter().flat_map(|(_, rows)| rows) {
            let hour = timestamp_from_unix(at).with_timezone(&self.utc_offset).hour() as usize;
            if let Some(slots) = hours.get_mut(&user_id) {
                slots[hour] += 1;
            }
        }
        Ok(hours)
    }

    /// Rebuild the summaries of every active user of `group_id` on `day`.
    pub async fn summarize_day(&self, group_id: &str, day: NaiveDate) -> EmberResult<usize> {
        let (start, end) = self.day_bounds(day)?;
        let counts = self.top_users(group_id, start, end, usize::MAX).await?;
        let user_ids: Vec<String> = counts.iter().map(|(id, _)| id.clone()).collect();
        let mut hours = self.hourly_distribution(group_id, &user_ids, start, end).await?;

        let date = record_date(day);
        let records = counts
            .into_iter()
            .map(|(user_id, msg_count)| SummaryRecord {
                group_id: group_id.to_string(),
                hourly_counts: hours
                    .remove(&user_id)
                    .unwrap_or_else(|| vec![0; HOURS_PER_DAY]),
                user_id,
                record_date: date,
                msg_count,
            })
            .collect();
        let written = self.save_summary_batch(records).await?;

        tracing::debug!(group_id, record_date = date, users = written, "Daily summary written");
        Ok(written)
    }

    /// Top `limit` users of `day` with their movement since the day before.
    pub async fn leaderboard(
        &self,
        group_id: &str,
        day: NaiveDate,
        limit: usize,
    ) -> EmberResult<Vec<RankItem>> {
        let (start, end) = self.day_bounds(day)?;
        let top = self.top_users(group_id, start, end, limit).await?;

        let previous = match day.checked_sub_days(Days::new(1)) {
            Some(prev) => {
                let (group, date) = (group_id.to_string(), record_date(prev));
                self.stores
                    .summary
                    .session(false, move |tx| summary::ranks_by_date(tx, &group, date))
                    .await?
            }
            None => HashMap::new(),
        };

        Ok(top
            .into_iter()
            .enumerate()
            .map(|(idx, (user_id, msg_count))| {
                let current_rank = idx + 1;
                let trend = previous
                    .get(&user_id)
                    .map(|prev| *prev as i64 - current_rank as i64);
                RankItem {
                    user_id,
                    msg_count,
                    current_rank,
                    trend,
                }
            })
            .collect())
    }

    /// First and last second of `day` in the configured offset.
    pub fn day_bounds(&self, day: NaiveDate) -> EmberResult<(Timestamp, Timestamp)> {
        let start = self
            .utc_offset
            .from_local_datetime(&day.and_time(NaiveTime::MIN))
            .single()
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "day".to_string(),
                reason: format!("{day} has no start in {}", self.utc_offset),
            })?
            .with_timezone(&Utc);
        let end = start + chrono::Duration::days(1) - chrono::Duration::seconds(1);
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support::Harness;
    use ember_test_utils::fixtures::ts;

    fn message_repo(h: &Harness) -> MessageLogRepository {
        MessageLogRepository::new(h.stores.clone(), Arc::clone(&h.writers), h.config.utc_offset())
    }

    async fn seed(repo: &MessageLogRepository, at: Timestamp, user: &str, count: usize) {
        for _ in 0..count {
            repo.save_message("g1", user, at, WritePolicy::Immediate)
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_record_date() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(record_date(day), 20240305);
    }

    #[tokio::test]
    async fn test_counts_span_shards() {
        let h = Harness::new().await;
        let repo = message_repo(&h);
        seed(&repo, ts(2024, 1, 20), "alice", 2).await;
        seed(&repo, ts(2024, 2, 10), "alice", 1).await;
        seed(&repo, ts(2024, 2, 11), "bob", 4).await;

        let (start, end) = (ts(2024, 1, 1), ts(2024, 2, 28));
        assert_eq!(repo.message_count("g1", start, end).await.unwrap(), 7);
        assert_eq!(
            repo.top_users("g1", start, end, 10).await.unwrap(),
            vec![("bob".to_string(), 4), ("alice".to_string(), 3)]
        );
        assert_eq!(repo.message_count("g2", start, end).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leaderboard_trend() {
        let h = Harness::new().await;
        let repo = message_repo(&h);
        let yesterday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

        seed(&repo, ts(2024, 3, 4), "alice", 5).await;
        seed(&repo, ts(2024, 3, 4), "bob", 2).await;
        assert_eq!(repo.summarize_day("g1", yesterday).await.unwrap(), 2);

        seed(&repo, ts(2024, 3, 5), "bob", 6).await;
        seed(&repo, ts(2024, 3, 5), "alice", 1).await;
        seed(&repo, ts(2024, 3, 5), "carol", 3).await;

        let board = repo.leaderboard("g1", today, 10).await.unwrap();
        let summary: Vec<_> = board
            .iter()
            .map(|r| (r.user_id.as_str(), r.current_rank, r.trend))
            .collect();
        assert_eq!(
            summary,
            vec![("bob", 1, Some(1)), ("carol", 2, None), ("alice", 3, Some(-2))]
        );
    }

    #[tokio::test]
    async fn test_summary_histogram_uses_local_hour() {
        let h = Harness::new().await;
        let repo = message_repo(&h);
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        seed(&repo, ts(2024, 3, 5), "alice", 3).await;
        repo.summarize_day("g1", day).await.unwrap();

        let stored = h
            .stores
            .summary
            .session(false, |tx| summary::get(tx, "g1", "alice", 20240305))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.msg_count, 3);
        assert_eq!(stored.hourly_counts[12], 3);
    }

    #[tokio::test]
    async fn test_deferred_messages_flush() {
        let h = Harness::new().await;
        let repo = message_repo(&h);
        let at = chrono::Utc::now();
        repo.save_message("g1", "alice", at, WritePolicy::Deferred)
            .await
            .unwrap();

        h.writers.message_log.shutdown().await;
        let count = repo
            .message_count("g1", at - chrono::Duration::hours(1), at)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}

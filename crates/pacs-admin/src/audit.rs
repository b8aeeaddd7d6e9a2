//! 审计轨迹
//!
//! 内存中的有界审计缓存，支持按条件查询和统计；以及把一条记录分发给多个汇的扇出汇。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacs_core::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 10_000;

/// 时间范围（闭区间）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// 排序方式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// 时间升序
    Ascending,
    /// 时间降序
    #[default]
    Descending,
}

/// 审计查询过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub time_range: Option<TimeRange>,
    pub actions: Option<Vec<AuditAction>>,
    pub outcomes: Option<Vec<AuditOutcome>>,
    pub ae_title: Option<String>,
    /// 描述匹配（正则表达式）
    pub description_pattern: Option<String>,
    pub limit: Option<usize>,
    pub sort_order: SortOrder,
}

/// 审计统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_records: u64,
    pub by_action: HashMap<AuditAction, u64>,
    pub by_outcome: HashMap<AuditOutcome, u64>,
    pub failures: u64,
    /// 最近的失败记录，新的在前
    pub recent_failures: Vec<AuditRecord>,
}

/// 有界审计轨迹，超出容量时丢弃最旧的记录
#[derive(Debug)]
pub struct AuditTrail {
    records: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// 查询审计记录；正则表达式无效时返回错误
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let pattern = match &filter.description_pattern {
            Some(pattern) => Some(
                Regex::new(pattern).with_context(|| format!("Invalid regex pattern: {}", pattern))?,
            ),
            None => None,
        };

        let records = self.records.read().await;
        let mut results: Vec<AuditRecord> = records
            .iter()
            .filter(|record| matches_filter(record, filter, pattern.as_ref()))
            .cloned()
            .collect();

        match filter.sort_order {
            SortOrder::Ascending => results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
            SortOrder::Descending => results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        }
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    pub async fn stats(&self, recent_failure_limit: usize) -> AuditStats {
        let records = self.records.read().await;
        let mut stats = AuditStats {
            total_records: records.len() as u64,
            ..Default::default()
        };
        for record in records.iter() {
            *stats.by_action.entry(record.action).or_insert(0) += 1;
            *stats.by_outcome.entry(record.outcome).or_insert(0) += 1;
            if record.outcome == AuditOutcome::Failure {
                stats.failures += 1;
            }
        }
        stats.recent_failures = records
            .iter()
            .rev()
            .filter(|record| record.outcome == AuditOutcome::Failure)
            .take(recent_failure_limit)
            .cloned()
            .collect();
        stats
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn matches_filter(record: &AuditRecord, filter: &AuditFilter, pattern: Option<&Regex>) -> bool {
    if let Some(range) = &filter.time_range {
        if record.timestamp < range.start || record.timestamp > range.end {
            return false;
        }
    }
    if let Some(actions) = &filter.actions {
        if !actions.contains(&record.action) {
            return false;
        }
    }
    if let Some(outcomes) = &filter.outcomes {
        if !outcomes.contains(&record.outcome) {
            return false;
        }
    }
    if let Some(ae_title) = &filter.ae_title {
        if &record.ae_title != ae_title {
            return false;
        }
    }
    pattern.map_or(true, |regex| regex.is_match(&record.description))
}

#[async_trait]
impl AuditSink for AuditTrail {
    async fn record(&self, record: AuditRecord) -> pacs_core::Result<()> {
        let mut records = self.records.write().await;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}

/// 把每条记录写入所有下游汇；任一下游失败时其余照常写入，返回第一个错误
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, record: AuditRecord) -> pacs_core::Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(record.clone()).await {
                warn!(audit_id = %record.id, error = %e, "审计下游写入失败");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::PacsError;

    fn record(action: AuditAction, outcome: AuditOutcome, description: &str) -> AuditRecord {
        AuditRecord::new(action, outcome, description, "PACS_GATEWAY", "PACS@localhost:11112")
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _record: AuditRecord) -> pacs_core::Result<()> {
            Err(PacsError::Internal("down".into()))
        }
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let trail = AuditTrail::new(2);
        for description in ["first", "second", "third"] {
            trail
                .record(record(AuditAction::Echo, AuditOutcome::Success, description))
                .await
                .unwrap();
        }
        let all = trail
            .query(&AuditFilter {
                sort_order: SortOrder::Ascending,
                ..Default::default()
            })
            .await
            .unwrap();
        let descriptions: Vec<_> = all.iter().map(|r| r.description.as_str()).collect();
        assert_eq!(descriptions, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let trail = AuditTrail::default();
        trail
            .record(record(AuditAction::Echo, AuditOutcome::Failure, "PACS连接验证失败"))
            .await
            .unwrap();
        trail
            .record(record(AuditAction::QueryStudies, AuditOutcome::Success, "检查查询返回 3 条"))
            .await
            .unwrap();
        trail
            .record(record(AuditAction::QueryStudies, AuditOutcome::Failure, "检查查询失败"))
            .await
            .unwrap();

        let found = trail
            .query(&AuditFilter {
                actions: Some(vec![AuditAction::QueryStudies]),
                outcomes: Some(vec![AuditOutcome::Failure]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].description, "检查查询失败");

        let found = trail
            .query(&AuditFilter {
                description_pattern: Some("返回 \\d+ 条".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let bad = AuditFilter {
            description_pattern: Some("(".into()),
            ..Default::default()
        };
        assert!(trail.query(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let trail = AuditTrail::default();
        trail.record(record(AuditAction::Echo, AuditOutcome::Success, "ok")).await.unwrap();
        trail.record(record(AuditAction::Echo, AuditOutcome::Failure, "down")).await.unwrap();
        trail
            .record(record(AuditAction::StoreSend, AuditOutcome::Partial, "2/3"))
            .await
            .unwrap();

        let stats = trail.stats(5).await;
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.by_action[&AuditAction::Echo], 2);
        assert_eq!(stats.by_outcome[&AuditOutcome::Partial], 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.recent_failures[0].description, "down");
    }

    #[tokio::test]
    async fn test_fanout_writes_all_and_reports_failure() {
        let trail = Arc::new(AuditTrail::default());
        let fanout = FanoutAuditSink::new(vec![Arc::new(BrokenSink), trail.clone()]);

        let result = fanout
            .record(record(AuditAction::Echo, AuditOutcome::Success, "ok"))
            .await;
        assert!(result.is_err());
        assert_eq!(trail.len().await, 1);
    }
}

//! 审计发射器
//!
//! 每个网关操作在返回前发出且只发出一条审计记录。审计汇失败或超时只记录告警，
//! 不影响操作本身。

use std::sync::Arc;
use std::time::Duration;

use pacs_core::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
use serde_json::{Map, Value};
use tracing::warn;

/// 单条审计记录写入的等待上限
pub const AUDIT_RECORD_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
    ae_title: String,
    peer_host: String,
    record_timeout: Duration,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>, ae_title: impl Into<String>, peer_host: impl Into<String>) -> Self {
        Self {
            sink,
            ae_title: ae_title.into(),
            peer_host: peer_host.into(),
            record_timeout: AUDIT_RECORD_TIMEOUT,
        }
    }

    pub fn with_record_timeout(mut self, record_timeout: Duration) -> Self {
        self.record_timeout = record_timeout;
        self
    }

    pub async fn emit(
        &self,
        action: AuditAction,
        outcome: AuditOutcome,
        description: impl Into<String>,
        details: Map<String, Value>,
    ) {
        self.emit_as(action, outcome, description, details, &self.ae_title, &self.peer_host)
            .await
    }

    /// 以指定的AE标题和对端主机发出（入站C-STORE使用发送方信息）
    pub async fn emit_as(
        &self,
        action: AuditAction,
        outcome: AuditOutcome,
        description: impl Into<String>,
        details: Map<String, Value>,
        ae_title: &str,
        peer_host: &str,
    ) {
        let mut record = AuditRecord::new(action, outcome, description, ae_title, peer_host);
        record.details = details;
        let id = record.id;
        match tokio::time::timeout(self.record_timeout, self.sink.record(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%action, audit_id = %id, error = %e, "审计记录写入失败"),
            Err(_) => warn!(
                %action,
                audit_id = %id,
                timeout_ms = self.record_timeout.as_millis() as u64,
                "审计记录写入超时，已放弃"
            ),
        }
    }
}

/// 把 `json!({...})` 对象转为审计细节
pub fn details(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use pacs_core::{PacsError, Result};
    use std::sync::Mutex;

    /// 记录全部审计条目的测试汇
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub records: Mutex<Vec<AuditRecord>>,
    }

    impl CollectingSink {
        pub(crate) fn records(&self) -> Vec<AuditRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditSink for CollectingSink {
        async fn record(&self, record: AuditRecord) -> Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    pub(crate) struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _record: AuditRecord) -> Result<()> {
            Err(PacsError::Internal("audit backend down".into()))
        }
    }

    #[tokio::test]
    async fn test_emit_carries_identity_and_details() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = AuditEmitter::new(sink.clone(), "PACS_GATEWAY", "pacs.local:11112");

        emitter
            .emit(
                AuditAction::QueryStudies,
                AuditOutcome::Success,
                "query",
                details(serde_json::json!({ "localCount": 2, "remoteCount": 1 })),
            )
            .await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ae_title, "PACS_GATEWAY");
        assert_eq!(records[0].peer_host, "pacs.local:11112");
        assert_eq!(records[0].details["remoteCount"], 1);
    }

    /// 永不返回的审计汇
    pub(crate) struct StalledSink;

    #[async_trait]
    impl AuditSink for StalledSink {
        async fn record(&self, _record: AuditRecord) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_gives_up_after_timeout() {
        let emitter = AuditEmitter::new(Arc::new(StalledSink), "GW", "peer")
            .with_record_timeout(Duration::from_millis(500));
        let started = tokio::time::Instant::now();
        emitter
            .emit(AuditAction::Echo, AuditOutcome::Success, "echo", Map::new())
            .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let emitter = AuditEmitter::new(Arc::new(FailingSink), "GW", "peer");
        emitter
            .emit(AuditAction::Echo, AuditOutcome::Failure, "echo", Map::new())
            .await;
    }
}

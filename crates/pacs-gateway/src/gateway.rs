//! PACS集成网关
//!
//! 所有操作遵循同一流程：确保连接（惰性连接，失败降级为仅本地模式）→ 本地库读写 →
//! （对端已验证时）远端交换 → 合并 → 审计 → 返回。

use std::sync::Arc;

use pacs_core::{AuditAction, AuditOutcome, AuditSink};
use pacs_database::Store;
use pacs_dicom::{AssociationManager, DicomScu, InstanceSink};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::arrivals::ArrivalNotifier;
use crate::audit::{details, AuditEmitter};
use crate::ingest::GatewayInstanceSink;
use crate::retrieve::RetrievePolicy;

/// C-ECHO验证结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EchoResult {
    pub success: bool,
    pub latency_ms: u64,
    pub association_id: Option<String>,
}

/// PACS网关
pub struct PacsGateway {
    pub(crate) manager: Arc<AssociationManager>,
    pub(crate) scu: DicomScu,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) audit: AuditEmitter,
    pub(crate) arrivals: ArrivalNotifier,
    pub(crate) retrieve_policy: RetrievePolicy,
}

impl PacsGateway {
    pub fn new(
        manager: Arc<AssociationManager>,
        store: Arc<dyn Store>,
        audit_sink: Arc<dyn AuditSink>,
        arrivals: ArrivalNotifier,
        retrieve_policy: RetrievePolicy,
    ) -> Self {
        let config = manager.config();
        let audit = AuditEmitter::new(audit_sink, config.calling_ae_title.clone(), config.peer_label());
        Self {
            scu: DicomScu::new(manager.clone()),
            manager,
            store,
            audit,
            arrivals,
            retrieve_policy,
        }
    }

    pub fn manager(&self) -> &Arc<AssociationManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn arrivals(&self) -> &ArrivalNotifier {
        &self.arrivals
    }

    /// 供入站存储SCP使用的实例接收器
    pub fn instance_sink(&self) -> Arc<dyn InstanceSink> {
        Arc::new(GatewayInstanceSink::new(
            self.store.clone(),
            self.audit.clone(),
            self.arrivals.clone(),
        ))
    }

    /// 连接对端并执行C-ECHO
    ///
    /// 只有传输连接成功且C-ECHO往返成功时 `success` 才为真。
    pub async fn verify_connection(&self) -> EchoResult {
        let outcome = self.manager.connect().await;
        let result = EchoResult {
            success: outcome.echo_verified,
            latency_ms: outcome.latency.as_millis() as u64,
            association_id: outcome.association_id,
        };

        let (audit_outcome, description) = if result.success {
            (AuditOutcome::Success, "PACS连接验证成功")
        } else {
            (AuditOutcome::Failure, "PACS连接验证失败，使用仅本地数据库模式")
        };
        self.audit
            .emit(
                AuditAction::Echo,
                audit_outcome,
                description,
                details(json!({
                    "success": result.success,
                    "latencyMs": result.latency_ms,
                    "associationId": result.association_id,
                })),
            )
            .await;

        info!(success = result.success, latency_ms = result.latency_ms, "C-ECHO验证完成");
        result
    }

    /// 释放关联
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    /// 惰性连接后判断对端是否可用
    pub(crate) async fn remote_available(&self) -> bool {
        self.manager.ensure_connected().await.is_echo_verified()
    }
}

//! 审计记录
//!
//! 所有涉及患者信息(PHI)的网关操作都会生成一条审计记录，写入外部审计汇。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::Result;

/// 审计操作类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuditAction {
    #[serde(rename = "C-ECHO")]
    Echo,
    #[serde(rename = "C-FIND-STUDY")]
    QueryStudies,
    #[serde(rename = "C-MOVE-STUDY")]
    RetrieveStudy,
    #[serde(rename = "C-STORE-SEND")]
    StoreSend,
    #[serde(rename = "C-STORE-RECEIVE")]
    StoreReceive,
    #[serde(rename = "MWL-QUERY")]
    WorklistQuery,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Echo => "C-ECHO",
            AuditAction::QueryStudies => "C-FIND-STUDY",
            AuditAction::RetrieveStudy => "C-MOVE-STUDY",
            AuditAction::StoreSend => "C-STORE-SEND",
            AuditAction::StoreReceive => "C-STORE-RECEIVE",
            AuditAction::WorklistQuery => "MWL-QUERY",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Partial,
}

/// 审计记录，一经写入不可修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub description: String,
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub ae_title: String,
    pub peer_host: String,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        outcome: AuditOutcome,
        description: impl Into<String>,
        ae_title: impl Into<String>,
        peer_host: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            outcome,
            description: description.into(),
            details: Map::new(),
            timestamp: Utc::now(),
            ae_title: ae_title.into(),
            peer_host: peer_host.into(),
        }
    }

    /// 附加结构化细节字段
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// 外部审计汇
///
/// 网关对审计是"发出即忘"：实现方负责持久性，返回错误只会被记录为告警。
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

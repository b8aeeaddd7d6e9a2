//! 日志初始化与基于 `tracing` 的审计汇

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pacs_core::{AuditOutcome, AuditRecord, AuditSink};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// 审计事件使用的 `tracing` target
pub const AUDIT_TARGET: &str = "audit";

/// 构造过滤器：`RUST_LOG` 优先，否则使用配置中的级别
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("无效的日志级别 {:?}: {}", config.level, e)),
    }
}

/// 安装全局fmt订阅者，重复调用时返回错误
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("日志初始化失败: {}", e))
}

/// 把审计记录写成 `audit` target上的结构化事件
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> pacs_core::Result<()> {
        let details = Value::Object(record.details);
        match record.outcome {
            AuditOutcome::Failure => warn!(
                target: AUDIT_TARGET,
                audit_id = %record.id,
                action = %record.action,
                outcome = ?record.outcome,
                ae_title = %record.ae_title,
                peer_host = %record.peer_host,
                details = %details,
                "{}",
                record.description
            ),
            _ => info!(
                target: AUDIT_TARGET,
                audit_id = %record.id,
                action = %record.action,
                outcome = ?record.outcome,
                ae_title = %record.ae_title,
                peer_host = %record.peer_host,
                details = %details,
                "{}",
                record.description
            ),
        }
        Ok(())
    }
}

//! # PACS管理模块
//!
//! 网关的运维支撑：配置加载与验证、日志初始化、审计汇。

pub mod audit;
pub mod config;
pub mod logging;

pub use audit::{AuditFilter, AuditStats, AuditTrail, FanoutAuditSink};
pub use config::{ConfigManager, ConfigValidator, DatabaseBackend, GatewayConfig};
pub use logging::{init_tracing, TracingAuditSink};

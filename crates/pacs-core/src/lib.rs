//! # PACS Core
//!
//! PACS网关的核心模块，提供基础数据结构、错误定义、审计记录和通用工具。

pub mod audit;
pub mod error;
pub mod models;
pub mod utils;

pub use audit::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
pub use error::{PacsError, Result};
pub use models::*;
pub use utils::DateRange;

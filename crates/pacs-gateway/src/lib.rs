//! # PACS Gateway
//!
//! 面向内部影像平台的PACS集成网关：连接验证、检查查询、检索、存储与工作列表。
//! 对端不可用时自动降级为仅本地数据库模式。

pub mod arrivals;
pub mod audit;
pub mod gateway;
pub mod ingest;
pub mod merge;
pub mod query;
pub mod retrieve;
pub mod worklist;

pub use arrivals::ArrivalNotifier;
pub use audit::AuditEmitter;
pub use gateway::{EchoResult, PacsGateway};
pub use ingest::{GatewayInstanceSink, StoreFailure, StoreSummary};
pub use query::{StudyFilter, MAX_RESULTS};
pub use retrieve::{RetrieveOutcome, RetrievePolicy};
pub use worklist::WorklistFilter;

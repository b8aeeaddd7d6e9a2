//! # PACS数据库模块
//!
//! 网关的本地数据存储：`Store` 能力接口，以及内存和PostgreSQL两种实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::InMemoryStore;
pub use queries::PgStore;
pub use store::Store;

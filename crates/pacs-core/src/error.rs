//! 错误定义模块

use thiserror::Error;

/// PACS网关统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    /// PDU/命令集编码失败（例如AE标题超长），属于调用方错误，不应重试
    #[error("编码错误: {0}")]
    Encoding(String),

    /// TCP连接失败或超时
    #[error("远端不可达: {0}")]
    TransportUnavailable(String),

    /// 对端返回A-ASSOCIATE-RJ
    #[error("关联被拒绝: {0}")]
    AssociationRejected(String),

    /// 对端在交换过程中发送A-ABORT
    #[error("关联被中止: {0}")]
    AssociationAborted(String),

    /// 批量存储中所有文件均失败
    #[error("存储失败: {failed} 个文件全部失败")]
    StorageFailure { failed: usize },

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("操作已取消: {0}")]
    Cancelled(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),
}

impl PacsError {
    /// 是否为可降级处理的连通性错误（切换为仅本地数据库模式）
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            PacsError::TransportUnavailable(_)
                | PacsError::AssociationRejected(_)
                | PacsError::AssociationAborted(_)
                | PacsError::Network(_)
                | PacsError::Timeout(_)
        )
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PacsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PacsError::NotFound(err.to_string()),
            other => PacsError::Database(other.to_string()),
        }
    }
}

/// PACS网关统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;

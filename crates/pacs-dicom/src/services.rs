//! DICOM服务实现（SCP端）

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pacs_core::Result;
use tracing::{debug, info, warn};

use crate::dataset;
use crate::dimse::{CommandField, CommandSet, DimseMessage, DimseStatus};
use crate::parser::{DicomParser, ParsedDicomObject};

/// 入站DIMSE请求及其关联上下文
#[derive(Debug, Clone)]
pub struct ScpRequest {
    pub calling_ae_title: String,
    pub peer: SocketAddr,
    pub transfer_syntax_uid: String,
    pub message: DimseMessage,
}

/// DICOM服务特征
#[async_trait]
pub trait DicomService: Send + Sync {
    /// 返回响应命令；错误由ServiceManager映射为失败状态
    async fn handle_request(&self, request: &ScpRequest) -> Result<CommandSet>;
}

/// 通过C-STORE收到并已落盘的实例
#[derive(Debug, Clone)]
pub struct ReceivedInstance {
    pub parsed: ParsedDicomObject,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub file_path: PathBuf,
    pub byte_size: u64,
    pub calling_ae_title: String,
    pub peer: SocketAddr,
}

/// 入站实例的去向（网关在此登记影像并唤醒等待中的检索）
#[async_trait]
pub trait InstanceSink: Send + Sync {
    async fn accept_instance(&self, instance: ReceivedInstance) -> Result<()>;
}

/// C-ECHO服务
pub struct CEchoService;

#[async_trait]
impl DicomService for CEchoService {
    async fn handle_request(&self, request: &ScpRequest) -> Result<CommandSet> {
        debug!(calling_ae = %request.calling_ae_title, "处理C-ECHO请求");
        Ok(CommandSet::response_to(&request.message.command, DimseStatus::SUCCESS))
    }
}

/// C-STORE服务：写Part-10文件后交给InstanceSink
pub struct CStoreService {
    storage_dir: PathBuf,
    sink: Arc<dyn InstanceSink>,
}

impl CStoreService {
    pub fn new(storage_dir: impl Into<PathBuf>, sink: Arc<dyn InstanceSink>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            sink,
        }
    }

    /// `<storage_dir>/<study_uid>/<sop_instance_uid>.dcm`
    fn file_path(&self, study_instance_uid: Option<&str>, sop_instance_uid: &str) -> PathBuf {
        self.storage_dir
            .join(path_component(study_instance_uid.unwrap_or("unknown")))
            .join(format!("{}.dcm", path_component(sop_instance_uid)))
    }
}

/// UID只允许数字和点，防止路径穿越
fn path_component(uid: &str) -> String {
    let cleaned: String = uid.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

#[async_trait]
impl DicomService for CStoreService {
    async fn handle_request(&self, request: &ScpRequest) -> Result<CommandSet> {
        let command = &request.message.command;
        let Some(data) = request.message.data.as_ref() else {
            warn!("C-STORE请求缺少数据集");
            return Ok(CommandSet::response_to(command, DimseStatus::CANNOT_UNDERSTAND)
                .with_error_comment("missing data set"));
        };

        let object = match dataset::decode(data, &request.transfer_syntax_uid) {
            Ok(object) => object,
            Err(e) => {
                warn!(error = %e, "C-STORE数据集无法解析");
                return Ok(CommandSet::response_to(command, DimseStatus::CANNOT_UNDERSTAND)
                    .with_error_comment("unparseable data set"));
            }
        };
        let parsed = ParsedDicomObject::from_dataset(&object, &request.transfer_syntax_uid);

        let sop_class_uid = command
            .affected_sop_class_uid
            .clone()
            .or_else(|| parsed.sop_class_uid.clone());
        let sop_instance_uid = command
            .affected_sop_instance_uid
            .clone()
            .or_else(|| parsed.sop_instance_uid.clone());
        let (Some(sop_class_uid), Some(sop_instance_uid)) = (sop_class_uid, sop_instance_uid) else {
            warn!("C-STORE缺少SOP Class/Instance UID");
            return Ok(CommandSet::response_to(command, DimseStatus::CANNOT_UNDERSTAND)
                .with_error_comment("missing SOP Class/Instance UID"));
        };

        let file = DicomParser::write_part10(
            object,
            &sop_class_uid,
            &sop_instance_uid,
            &request.transfer_syntax_uid,
        )?;
        let file_path = self.file_path(parsed.study_instance_uid.as_deref(), &sop_instance_uid);
        write_file(&file_path, &file).await?;
        debug!(path = ?file_path, bytes = file.len(), "DICOM文件已存储");

        self.sink
            .accept_instance(ReceivedInstance {
                parsed,
                sop_class_uid,
                sop_instance_uid: sop_instance_uid.clone(),
                file_path,
                byte_size: file.len() as u64,
                calling_ae_title: request.calling_ae_title.clone(),
                peer: request.peer,
            })
            .await?;

        info!(sop_instance_uid = %sop_instance_uid, calling_ae = %request.calling_ae_title, "C-STORE接收完成");
        Ok(CommandSet::response_to(command, DimseStatus::SUCCESS))
    }
}

/// DICOM服务管理器，按命令字段分派
pub struct ServiceManager {
    services: HashMap<CommandField, Arc<dyn DicomService>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let mut services: HashMap<CommandField, Arc<dyn DicomService>> = HashMap::new();
        services.insert(CommandField::CEchoRq, Arc::new(CEchoService));
        Self { services }
    }

    /// 带存储服务的管理器
    pub fn with_storage(storage_dir: impl Into<PathBuf>, sink: Arc<dyn InstanceSink>) -> Self {
        let mut manager = Self::new();
        manager.register_service(CommandField::CStoreRq, Arc::new(CStoreService::new(storage_dir, sink)));
        manager
    }

    pub fn register_service(&mut self, command_field: CommandField, service: Arc<dyn DicomService>) {
        self.services.insert(command_field, service);
    }

    /// 分派请求；总是返回一个响应命令
    pub async fn handle_request(&self, request: &ScpRequest) -> CommandSet {
        let command = &request.message.command;
        match self.services.get(&command.command_field) {
            Some(service) => match service.handle_request(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(command = ?command.command_field, error = %e, "DIMSE服务处理失败");
                    CommandSet::response_to(command, DimseStatus::OUT_OF_RESOURCES)
                        .with_error_comment("processing failure")
                }
            },
            None => {
                warn!(command = ?command.command_field, "不支持的DIMSE命令");
                CommandSet::response_to(command, DimseStatus::UNRECOGNIZED_OPERATION)
            }
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

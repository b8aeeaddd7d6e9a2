//! 影像入库：出站批量存储与入站C-STORE登记

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pacs_core::{
    AuditAction, AuditOutcome, ImageRecord, PacsError, RecordOrigin, Result, StudyRecord,
};
use pacs_database::Store;
use pacs_dicom::{DicomParser, InstanceSink, ParsedDicomObject, ReceivedInstance};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::arrivals::ArrivalNotifier;
use crate::audit::{details, AuditEmitter};
use crate::gateway::PacsGateway;
use crate::query::optional_date;

/// 单个文件的失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// 批量存储汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub success_count: usize,
    pub failure_count: usize,
    /// 成功文件中经C-STORE送达PACS的数量，其余保存在本地
    pub sent_to_peer: usize,
    pub failures: Vec<StoreFailure>,
}

enum Placement {
    Peer,
    Local,
}

impl PacsGateway {
    /// 存储一个检查的文件
    ///
    /// 单个文件失败不中断批次；全部失败时返回 `StorageFailure`。
    pub async fn store_study(&self, study_instance_uid: &str, paths: &[PathBuf]) -> Result<StoreSummary> {
        let result = self.run_store(study_instance_uid, paths).await;
        let (outcome, description) = match &result {
            Ok(summary) if summary.failure_count == 0 => (AuditOutcome::Success, "检查存储完成"),
            Ok(_) => (AuditOutcome::Partial, "检查存储部分成功"),
            Err(_) => (AuditOutcome::Failure, "检查存储失败"),
        };
        let mut fields = details(json!({
            "studyInstanceUid": study_instance_uid,
            "fileCount": paths.len(),
        }));
        match &result {
            Ok(summary) => {
                fields.insert("successCount".into(), json!(summary.success_count));
                fields.insert("failureCount".into(), json!(summary.failure_count));
                fields.insert("sentToPeer".into(), json!(summary.sent_to_peer));
            }
            Err(e) => {
                fields.insert("error".into(), json!(e.to_string()));
            }
        }
        self.audit
            .emit(AuditAction::StoreSend, outcome, description, fields)
            .await;
        result
    }

    async fn run_store(&self, study_instance_uid: &str, paths: &[PathBuf]) -> Result<StoreSummary> {
        if paths.is_empty() {
            return Err(PacsError::Validation("没有需要存储的文件".to_string()));
        }
        self.remote_available().await;

        let mut summary = StoreSummary::default();
        for path in paths {
            match self.store_file(study_instance_uid, path).await {
                Ok(Placement::Peer) => {
                    summary.success_count += 1;
                    summary.sent_to_peer += 1;
                }
                Ok(Placement::Local) => summary.success_count += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "文件存储失败");
                    summary.failures.push(StoreFailure {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        summary.failure_count = summary.failures.len();

        let (series, instances) = self.store.recompute_study_counts(study_instance_uid).await?;
        info!(
            study_instance_uid,
            success = summary.success_count,
            failure = summary.failure_count,
            series,
            instances,
            "检查存储批次完成"
        );

        if summary.success_count == 0 {
            return Err(PacsError::StorageFailure {
                failed: summary.failure_count,
            });
        }
        Ok(summary)
    }

    async fn store_file(&self, study_instance_uid: &str, path: &Path) -> Result<Placement> {
        if !tokio::fs::try_exists(path).await? {
            return Err(PacsError::NotFound(format!("文件不存在: {}", path.display())));
        }
        let bytes = tokio::fs::read(path).await?;
        let parsed = DicomParser::parse_bytes(&bytes)?;
        let (sop_class_uid, sop_instance_uid) = required_uids(&parsed)?;

        if let Some(uid) = &parsed.study_instance_uid {
            if uid != study_instance_uid {
                return Err(PacsError::Validation(format!(
                    "文件属于检查 {}，不是 {}",
                    uid, study_instance_uid
                )));
            }
        }

        // 对端可能在批次中途断开，逐个文件判断
        if self.manager.is_echo_verified() {
            match self
                .scu
                .store(
                    sop_class_uid,
                    sop_instance_uid,
                    &parsed.transfer_syntax_uid,
                    parsed.dataset_bytes(&bytes),
                )
                .await
            {
                Ok(_) => return Ok(Placement::Peer),
                Err(e) => warn!(sop_instance_uid, error = %e, "C-STORE失败，改为本地保存"),
            }
        }

        self.store
            .upsert_study(&study_record_from(study_instance_uid, &parsed))
            .await?;
        let image = image_record_from(
            study_instance_uid,
            &parsed,
            path.display().to_string(),
            bytes.len() as i64,
        );
        if !self.store.create_image(&image).await? {
            debug!(sop_instance_uid, "影像已登记，跳过");
        }
        Ok(Placement::Local)
    }
}

fn required_uids(parsed: &ParsedDicomObject) -> Result<(&str, &str)> {
    match (parsed.sop_class_uid.as_deref(), parsed.sop_instance_uid.as_deref()) {
        (Some(class), Some(instance)) if !class.is_empty() && !instance.is_empty() => Ok((class, instance)),
        _ => Err(PacsError::DicomParseError(
            "缺少SOP Class UID或SOP Instance UID".to_string(),
        )),
    }
}

/// 由文件元数据构造检查记录（计数由影像行重新计算）
pub fn study_record_from(study_instance_uid: &str, parsed: &ParsedDicomObject) -> StudyRecord {
    StudyRecord {
        accession_number: parsed.accession_number.clone().unwrap_or_default(),
        patient_id: parsed.patient_id.clone().unwrap_or_default(),
        patient_name: parsed.patient_name.clone().unwrap_or_default(),
        study_date: optional_date(parsed.study_date.clone()),
        modality: parsed.modality.clone().unwrap_or_default(),
        referring_physician: parsed.referring_physician_name.clone(),
        institution: parsed.institution_name.clone(),
        origin: RecordOrigin::Local,
        ..StudyRecord::new(study_instance_uid)
    }
}

pub fn image_record_from(
    study_instance_uid: &str,
    parsed: &ParsedDicomObject,
    storage_location: String,
    byte_size: i64,
) -> ImageRecord {
    ImageRecord {
        study_instance_uid: study_instance_uid.to_string(),
        series_instance_uid: parsed.series_instance_uid.clone().unwrap_or_default(),
        sop_instance_uid: parsed.sop_instance_uid.clone().unwrap_or_default(),
        sop_class_uid: parsed.sop_class_uid.clone().unwrap_or_default(),
        instance_number: parsed.instance_number,
        series_number: parsed.series_number,
        storage_location,
        byte_size,
        created_at: Utc::now(),
    }
}

/// 入站C-STORE的落库处理
pub struct GatewayInstanceSink {
    store: Arc<dyn Store>,
    audit: AuditEmitter,
    arrivals: ArrivalNotifier,
}

impl GatewayInstanceSink {
    pub fn new(store: Arc<dyn Store>, audit: AuditEmitter, arrivals: ArrivalNotifier) -> Self {
        Self { store, audit, arrivals }
    }

    async fn register(&self, study_instance_uid: &str, instance: &ReceivedInstance) -> Result<(i32, i32)> {
        self.store
            .upsert_study(&study_record_from(study_instance_uid, &instance.parsed))
            .await?;
        let image = image_record_from(
            study_instance_uid,
            &instance.parsed,
            instance.file_path.display().to_string(),
            instance.byte_size as i64,
        );
        self.store.create_image(&image).await?;
        self.store.recompute_study_counts(study_instance_uid).await
    }
}

#[async_trait]
impl InstanceSink for GatewayInstanceSink {
    async fn accept_instance(&self, instance: ReceivedInstance) -> Result<()> {
        let study_instance_uid = instance
            .parsed
            .study_instance_uid
            .clone()
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| PacsError::Validation("入站实例缺少Study Instance UID".to_string()))?;

        let result = self.register(&study_instance_uid, &instance).await;
        let peer = instance.peer.to_string();
        let mut fields = details(json!({
            "studyInstanceUid": study_instance_uid,
            "sopInstanceUid": instance.sop_instance_uid,
            "sopClassUid": instance.sop_class_uid,
            "byteSize": instance.byte_size,
        }));

        match &result {
            Ok((series, instances)) => {
                fields.insert("seriesCount".into(), json!(series));
                fields.insert("instanceCount".into(), json!(instances));
                self.audit
                    .emit_as(
                        AuditAction::StoreReceive,
                        AuditOutcome::Success,
                        "接收影像",
                        fields,
                        &instance.calling_ae_title,
                        &peer,
                    )
                    .await;
                self.arrivals.notify(&study_instance_uid);
            }
            Err(e) => {
                fields.insert("error".into(), json!(e.to_string()));
                self.audit
                    .emit_as(
                        AuditAction::StoreReceive,
                        AuditOutcome::Failure,
                        "接收影像登记失败",
                        fields,
                        &instance.calling_ae_title,
                        &peer,
                    )
                    .await;
            }
        }
        result.map(|_| ())
    }
}

//! 出站DIMSE操作（SCU端）
//!
//! 在 [`AssociationManager`] 之上封装C-FIND、C-MOVE和C-STORE。
//! C-ECHO由 `AssociationManager::connect` 完成。

use std::sync::Arc;

use bytes::Bytes;
use dicom_core::VR;
use dicom_dictionary_std::tags;
use pacs_core::{PacsError, Result};
use tracing::{debug, info, warn};

use crate::association::{AssociationManager, DimseRequest};
use crate::dataset::{self, Dataset, DatasetExt};
use crate::dimse::{CommandSet, DimseMessage, DimseStatus};
use crate::transfer_syntax::transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN;
use crate::uids;

/// C-MOVE的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub status: DimseStatus,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// DIMSE服务类用户
#[derive(Clone)]
pub struct DicomScu {
    manager: Arc<AssociationManager>,
}

impl DicomScu {
    pub fn new(manager: Arc<AssociationManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<AssociationManager> {
        &self.manager
    }

    /// 发送C-FIND，返回全部Pending响应携带的匹配数据集
    pub async fn find(&self, information_model: &str, identifier: &Dataset) -> Result<Vec<Dataset>> {
        info!(
            "发送C-FIND到 {} (模型: {})",
            self.manager.config().peer_label(),
            information_model
        );
        let request = DimseRequest::new(
            information_model,
            CommandSet::find_request(0, information_model),
        )
        .with_data(dataset::encode(identifier, IMPLICIT_VR_LITTLE_ENDIAN)?);

        let responses = self.manager.exchange(request).await?;
        let status = final_status(&responses)?;
        if !status.is_success() {
            return Err(PacsError::Dicom(format!("C-FIND返回状态 {}", status)));
        }

        let mut matches = Vec::new();
        for response in responses.iter().filter(|r| r.command.status().is_pending()) {
            let Some(data) = response.data.as_ref() else {
                continue;
            };
            match dataset::decode(data, IMPLICIT_VR_LITTLE_ENDIAN) {
                Ok(dataset) => matches.push(dataset),
                Err(e) => warn!(error = %e, "忽略无法解析的C-FIND匹配项"),
            }
        }
        debug!("C-FIND完成，匹配 {} 条", matches.len());
        Ok(matches)
    }

    /// 在检查级别发起C-MOVE，影像发往 `destination`
    pub async fn move_study(&self, study_instance_uid: &str, destination: &str) -> Result<MoveOutcome> {
        info!(
            "发送C-MOVE到 {} (检查: {}, 目的AE: {})",
            self.manager.config().peer_label(),
            study_instance_uid,
            destination
        );
        let mut identifier = Dataset::new_empty();
        identifier
            .put_text(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY")
            .put_text(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);

        let request = DimseRequest::new(
            uids::STUDY_ROOT_MOVE,
            CommandSet::move_request(0, uids::STUDY_ROOT_MOVE, destination),
        )
        .with_data(dataset::encode(&identifier, IMPLICIT_VR_LITTLE_ENDIAN)?);

        let responses = self.manager.exchange(request).await?;
        let last = responses
            .last()
            .map(|response| &response.command)
            .ok_or_else(|| PacsError::Dicom("没有收到DIMSE响应".to_string()))?;
        let status = last.status();
        let outcome = MoveOutcome {
            status,
            completed: last.completed_sub_operations.unwrap_or(0),
            failed: last.failed_sub_operations.unwrap_or(0),
            warning: last.warning_sub_operations.unwrap_or(0),
        };
        if !status.is_success() {
            return Err(PacsError::Dicom(format!("C-MOVE返回状态 {}", status)));
        }
        debug!(?outcome, "C-MOVE完成");
        Ok(outcome)
    }

    /// 以原传输语法发送一个数据集
    pub async fn store(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
        dataset: &[u8],
    ) -> Result<DimseStatus> {
        debug!("发送C-STORE: {} ({} bytes)", sop_instance_uid, dataset.len());
        let request = DimseRequest::new(
            sop_class_uid,
            CommandSet::store_request(0, sop_class_uid, sop_instance_uid),
        )
        .with_transfer_syntax(transfer_syntax_uid)
        .with_data(Bytes::copy_from_slice(dataset));

        let responses = self.manager.exchange(request).await?;
        let status = final_status(&responses)?;
        if !status.is_success() {
            return Err(PacsError::Dicom(format!("C-STORE返回状态 {}", status)));
        }
        Ok(status)
    }
}

fn final_status(responses: &[DimseMessage]) -> Result<DimseStatus> {
    responses
        .last()
        .map(|response| response.command.status())
        .ok_or_else(|| PacsError::Dicom("没有收到DIMSE响应".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::CommandField;
    use crate::parser::tests::{sample_dataset, CT_IMAGE_STORAGE};
    use crate::testing::{FakePacs, Reply};
    use crate::transfer_syntax::transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN;

    fn study_match(uid: &str) -> Vec<u8> {
        let mut matched = Dataset::new_empty();
        matched
            .put_text(tags::STUDY_INSTANCE_UID, VR::UI, uid)
            .put_text(tags::PATIENT_ID, VR::LO, "PID001");
        dataset::encode(&matched, IMPLICIT_VR_LITTLE_ENDIAN).unwrap()
    }

    async fn connected(fake: &FakePacs) -> DicomScu {
        let manager = Arc::new(AssociationManager::new(fake.peer_config()));
        assert!(manager.connect().await.echo_verified);
        DicomScu::new(manager)
    }

    #[tokio::test]
    async fn test_find_collects_pending_matches() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CFindRq => vec![
                    Reply::pending(study_match("1.1")),
                    Reply::pending(study_match("1.2")),
                    Reply::success(),
                ],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let scu = connected(&fake).await;

        let mut identifier = Dataset::new_empty();
        identifier.put_text(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
        let matches = scu.find(uids::STUDY_ROOT_FIND, &identifier).await.unwrap();

        let found: Vec<_> = matches
            .iter()
            .filter_map(|m| m.text(tags::STUDY_INSTANCE_UID))
            .collect();
        assert_eq!(found, vec!["1.1", "1.2"]);
    }

    #[tokio::test]
    async fn test_find_failure_status_is_error() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CFindRq => vec![Reply::status(0xA900)],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let scu = connected(&fake).await;

        let err = scu.find(uids::STUDY_ROOT_FIND, &Dataset::new_empty()).await.unwrap_err();
        assert!(matches!(err, PacsError::Dicom(_)));
        // DIMSE层面的失败不影响关联
        assert!(scu.manager().is_echo_verified());
    }

    #[tokio::test]
    async fn test_move_sends_destination_and_identifier() {
        let fake = FakePacs::start().await;
        let scu = connected(&fake).await;

        let outcome = scu.move_study("1.2.3", "GATEWAY_SCP").await.unwrap();
        assert_eq!(outcome.status, DimseStatus::Success);

        let received = fake.received();
        let request = received.last().unwrap();
        assert_eq!(request.command.command_field, CommandField::CMoveRq);
        assert_eq!(request.command.move_destination.as_deref(), Some("GATEWAY_SCP"));
        let identifier = dataset::decode(request.data.as_ref().unwrap(), IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(identifier.text(tags::STUDY_INSTANCE_UID).as_deref(), Some("1.2.3"));
        assert_eq!(identifier.text(tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("STUDY"));
    }

    #[tokio::test]
    async fn test_store_uses_requested_transfer_syntax() {
        let fake = FakePacs::start().await;
        let scu = connected(&fake).await;
        let dataset = sample_dataset("1.2.3", "1.2.3.1");

        let status = scu
            .store(CT_IMAGE_STORAGE, "1.2.3.1", EXPLICIT_VR_LITTLE_ENDIAN, &dataset)
            .await
            .unwrap();
        assert_eq!(status, DimseStatus::Success);

        let received = fake.received();
        let request = received.last().unwrap();
        assert_eq!(request.command.affected_sop_instance_uid.as_deref(), Some("1.2.3.1"));
        assert_eq!(request.data.as_deref(), Some(dataset.as_slice()));
    }
}

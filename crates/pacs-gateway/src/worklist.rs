//! 设备工作列表：本地待执行申请，加上对端MWL C-FIND结果

use std::cmp::Ordering;

use chrono::{NaiveDateTime, NaiveTime};
use dicom_core::VR;
use dicom_dictionary_std::tags;
use pacs_core::{
    AuditAction, AuditOutcome, DateRange, OrderQuery, RecordOrigin, Result, WorklistEntry,
};
use pacs_dicom::{uids, Dataset, DatasetExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::details;
use crate::gateway::PacsGateway;
use crate::merge::merge_by_key;
use crate::query::{non_empty, optional_date, MAX_RESULTS};

/// 工作列表过滤条件，`scheduled_date` 与检查查询的日期格式相同
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorklistFilter {
    pub scheduled_date: Option<String>,
    pub modality: Option<String>,
    pub station: Option<String>,
}

impl WorklistFilter {
    pub fn to_query(&self) -> Result<OrderQuery> {
        let scheduled = match non_empty(&self.scheduled_date) {
            Some(value) => Some(DateRange::parse_dicom(value)?),
            None => None,
        };
        Ok(OrderQuery {
            scheduled,
            modality: non_empty(&self.modality).map(str::to_string),
            station_ae: non_empty(&self.station).map(str::to_string),
            limit: MAX_RESULTS,
        })
    }
}

impl PacsGateway {
    /// 获取工作列表
    pub async fn get_worklist(&self, filter: &WorklistFilter) -> Result<Vec<WorklistEntry>> {
        let result = self.run_worklist_query(filter).await;
        match &result {
            Ok((entries, local_count, remote_count)) => {
                self.audit
                    .emit(
                        AuditAction::WorklistQuery,
                        AuditOutcome::Success,
                        format!("工作列表返回 {} 条", entries.len()),
                        details(json!({
                            "filter": filter,
                            "localCount": local_count,
                            "remoteCount": remote_count,
                            "returned": entries.len(),
                        })),
                    )
                    .await;
            }
            Err(e) => {
                self.audit
                    .emit(
                        AuditAction::WorklistQuery,
                        AuditOutcome::Failure,
                        "工作列表查询失败",
                        details(json!({ "filter": filter, "error": e.to_string() })),
                    )
                    .await;
            }
        }
        result.map(|(entries, _, _)| entries)
    }

    async fn run_worklist_query(
        &self,
        filter: &WorklistFilter,
    ) -> Result<(Vec<WorklistEntry>, usize, usize)> {
        let query = filter.to_query()?;
        let remote_available = self.remote_available().await;

        let local: Vec<WorklistEntry> = self
            .store
            .list_pending_orders(&query)
            .await?
            .iter()
            .map(WorklistEntry::from)
            .collect();
        let local_count = local.len();
        debug!("本地待执行申请 {} 条", local_count);

        let remote = if remote_available {
            match self.find_remote_worklist(&query).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(error = %e, "MWL C-FIND失败，仅返回本地工作列表");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let remote_count = remote.len();

        let mut entries = merge_by_key(local, remote, |entry| entry.accession_number.clone());
        entries.sort_by(by_scheduled_time);
        entries.truncate(MAX_RESULTS);

        info!(
            local = local_count,
            remote = remote_count,
            returned = entries.len(),
            "工作列表查询完成"
        );
        Ok((entries, local_count, remote_count))
    }

    async fn find_remote_worklist(&self, query: &OrderQuery) -> Result<Vec<WorklistEntry>> {
        let identifier = worklist_identifier(query);
        let matches = self.scu.find(uids::MODALITY_WORKLIST_FIND, &identifier).await?;
        Ok(matches
            .iter()
            .filter_map(entry_from_match)
            .filter(|entry| match (&query.scheduled, entry.scheduled_at) {
                (None, _) => true,
                (Some(range), Some(at)) => range.contains(at.date()),
                (Some(_), None) => false,
            })
            .collect())
    }
}

/// MWL查询标识，预约条件放在Scheduled Procedure Step序列的唯一条目中
pub(crate) fn worklist_identifier(query: &OrderQuery) -> Dataset {
    let mut step = Dataset::new_empty();
    step.put_text(tags::MODALITY, VR::CS, query.modality.as_deref().unwrap_or_default())
        .put_text(
            tags::SCHEDULED_STATION_AE_TITLE,
            VR::AE,
            query.station_ae.as_deref().unwrap_or_default(),
        )
        .put_text(
            tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
            VR::DA,
            &query.scheduled.map(|range| range.to_dicom()).unwrap_or_default(),
        )
        .put_empty(tags::SCHEDULED_PROCEDURE_STEP_START_TIME, VR::TM)
        .put_empty(tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO);

    let mut identifier = Dataset::new_empty();
    identifier
        .put_empty(tags::ACCESSION_NUMBER, VR::SH)
        .put_empty(tags::PATIENT_NAME, VR::PN)
        .put_empty(tags::PATIENT_ID, VR::LO)
        .put_empty(tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO)
        .put_sequence(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, vec![step]);
    identifier
}

/// 没有检查号的条目无法合并，直接丢弃
fn entry_from_match(dataset: &Dataset) -> Option<WorklistEntry> {
    let accession_number = dataset.text(tags::ACCESSION_NUMBER)?;
    let step = dataset
        .sequence_items(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
        .and_then(|items| items.first());

    let scheduled_at = step.and_then(|step| {
        let date = optional_date(step.text(tags::SCHEDULED_PROCEDURE_STEP_START_DATE))?;
        let time = step
            .text(tags::SCHEDULED_PROCEDURE_STEP_START_TIME)
            .and_then(|t| parse_dicom_time(&t))
            .unwrap_or_default();
        Some(NaiveDateTime::new(date, time))
    });

    Some(WorklistEntry {
        accession_number,
        patient_id: dataset.text(tags::PATIENT_ID).unwrap_or_default(),
        patient_name: dataset.text(tags::PATIENT_NAME).unwrap_or_default(),
        modality: step
            .and_then(|step| step.text(tags::MODALITY))
            .unwrap_or_default(),
        scheduled_at,
        scheduled_station_ae: step.and_then(|step| step.text(tags::SCHEDULED_STATION_AE_TITLE)),
        requested_procedure_description: dataset
            .text(tags::REQUESTED_PROCEDURE_DESCRIPTION)
            .or_else(|| step.and_then(|step| step.text(tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION))),
        origin: RecordOrigin::Remote,
    })
}

/// 解析DICOM TM：`HH`、`HHMM`、`HHMMSS`，小数秒忽略
fn parse_dicom_time(value: &str) -> Option<NaiveTime> {
    let digits = value.trim().split('.').next()?;
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| digits.get(range).and_then(|s| s.parse::<u32>().ok());
    match digits.len() {
        2 => NaiveTime::from_hms_opt(field(0..2)?, 0, 0),
        4 => NaiveTime::from_hms_opt(field(0..2)?, field(2..4)?, 0),
        6 => NaiveTime::from_hms_opt(field(0..2)?, field(2..4)?, field(4..6)?),
        _ => None,
    }
}

/// 预约时间升序，未预约的排在最后
fn by_scheduled_time(a: &WorklistEntry, b: &WorklistEntry) -> Ordering {
    match (a.scheduled_at, b.scheduled_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{harness, unreachable_config};
    use chrono::NaiveDate;
    use pacs_core::{OrderRecord, OrderStatus, PacsError};
    use pacs_dicom::testing::{FakePacs, Reply};
    use pacs_dicom::dataset;
    use pacs_dicom::transfer_syntax::transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN;
    use pacs_dicom::CommandField;
    use uuid::Uuid;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap()
    }

    fn order(accession: &str, status: OrderStatus, scheduled_at: NaiveDateTime) -> OrderRecord {
        OrderRecord {
            id: Uuid::new_v4(),
            accession_number: accession.into(),
            patient_id: "PID001".into(),
            patient_name: "DOE^JANE".into(),
            modality: "CT".into(),
            status,
            scheduled_at: Some(scheduled_at),
            scheduled_station_ae: Some("CT01".into()),
            requested_procedure_description: Some("CT HEAD".into()),
        }
    }

    fn remote_entry(accession: Option<&str>, date: &str, time: &str) -> Vec<u8> {
        let mut step = Dataset::new_empty();
        step.put_text(tags::MODALITY, VR::CS, "CT")
            .put_text(tags::SCHEDULED_STATION_AE_TITLE, VR::AE, "CT01")
            .put_text(tags::SCHEDULED_PROCEDURE_STEP_START_DATE, VR::DA, date)
            .put_text(tags::SCHEDULED_PROCEDURE_STEP_START_TIME, VR::TM, time)
            .put_text(tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO, "CT CHEST");

        let mut entry = Dataset::new_empty();
        if let Some(accession) = accession {
            entry.put_text(tags::ACCESSION_NUMBER, VR::SH, accession);
        }
        entry
            .put_text(tags::PATIENT_ID, VR::LO, "PID002")
            .put_text(tags::PATIENT_NAME, VR::PN, "ROE^RICHARD")
            .put_sequence(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, vec![step]);
        dataset::encode(&entry, IMPLICIT_VR_LITTLE_ENDIAN).unwrap()
    }

    fn accessions(entries: &[WorklistEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.accession_number.as_str()).collect()
    }

    #[test]
    fn test_parse_dicom_time() {
        assert_eq!(parse_dicom_time("0930"), NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(parse_dicom_time("093015.123"), NaiveTime::from_hms_opt(9, 30, 15));
        assert_eq!(parse_dicom_time("14"), NaiveTime::from_hms_opt(14, 0, 0));
        assert_eq!(parse_dicom_time("2561"), None);
        assert_eq!(parse_dicom_time("9:30"), None);
    }

    #[test]
    fn test_identifier_nests_step_attributes() {
        let query = WorklistFilter {
            scheduled_date: Some("20240110".into()),
            modality: Some("MR".into()),
            station: None,
        }
        .to_query()
        .unwrap();
        let identifier = worklist_identifier(&query);
        let step = &identifier
            .sequence_items(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
            .unwrap()[0];
        assert_eq!(step.text(tags::MODALITY).as_deref(), Some("MR"));
        assert_eq!(
            step.text(tags::SCHEDULED_PROCEDURE_STEP_START_DATE).as_deref(),
            Some("20240110")
        );
        assert!(step.has(tags::SCHEDULED_PROCEDURE_STEP_START_TIME));
        assert!(identifier.has(tags::ACCESSION_NUMBER));
    }

    #[tokio::test]
    async fn test_local_worklist_ordering_and_status() {
        let h = harness(unreachable_config().await);
        h.store.insert_order(order("A2", OrderStatus::Scheduled, at(10, 14))).await;
        h.store.insert_order(order("A1", OrderStatus::Pending, at(10, 9))).await;
        h.store.insert_order(order("A3", OrderStatus::Completed, at(10, 8))).await;

        let entries = h.gateway.get_worklist(&WorklistFilter::default()).await.unwrap();
        assert_eq!(accessions(&entries), vec!["A1", "A2"]);
        assert!(entries.iter().all(|e| e.origin == RecordOrigin::Local));
    }

    #[tokio::test]
    async fn test_scheduled_date_filter() {
        let h = harness(unreachable_config().await);
        h.store.insert_order(order("A1", OrderStatus::Pending, at(10, 9))).await;
        h.store.insert_order(order("A2", OrderStatus::Pending, at(11, 9))).await;

        let filter = WorklistFilter {
            scheduled_date: Some("20240111".into()),
            ..Default::default()
        };
        let entries = h.gateway.get_worklist(&filter).await.unwrap();
        assert_eq!(accessions(&entries), vec!["A2"]);

        let bad = WorklistFilter {
            scheduled_date: Some("tomorrow".into()),
            ..Default::default()
        };
        assert!(matches!(
            h.gateway.get_worklist(&bad).await.unwrap_err(),
            PacsError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_remote_entries_merged_by_accession() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CFindRq => vec![
                    Reply::pending(remote_entry(Some("A1"), "20240110", "0700")),
                    Reply::pending(remote_entry(Some("R1"), "20240110", "113000")),
                    Reply::pending(remote_entry(None, "20240110", "0800")),
                    Reply::success(),
                ],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let h = harness(fake.peer_config());
        h.store.insert_order(order("A1", OrderStatus::Scheduled, at(10, 9))).await;

        let entries = h.gateway.get_worklist(&WorklistFilter::default()).await.unwrap();
        assert_eq!(accessions(&entries), vec!["A1", "R1"]);
        assert_eq!(entries[0].origin, RecordOrigin::Local);
        assert_eq!(entries[0].scheduled_at, Some(at(10, 9)));
        assert_eq!(entries[1].origin, RecordOrigin::Remote);
        assert_eq!(
            entries[1].scheduled_at,
            NaiveDate::from_ymd_opt(2024, 1, 10).and_then(|d| d.and_hms_opt(11, 30, 0))
        );
        assert_eq!(entries[1].requested_procedure_description.as_deref(), Some("CT CHEST"));

        let request = fake
            .received()
            .into_iter()
            .find(|m| m.command.command_field == CommandField::CFindRq)
            .unwrap();
        assert_eq!(
            request.command.affected_sop_class_uid.as_deref(),
            Some(uids::MODALITY_WORKLIST_FIND)
        );
        let identifier =
            dataset::decode(request.data.as_ref().unwrap(), IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert!(identifier.sequence_items(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE).is_some());

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::WorklistQuery);
        assert_eq!(records[0].details["remoteCount"], 2);
    }
}

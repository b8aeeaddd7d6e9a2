//! 检查查询：本地库优先，对端可用时追加Study Root C-FIND结果

use std::cmp::Ordering;

use chrono::NaiveDate;
use dicom_core::VR;
use dicom_dictionary_std::tags;
use pacs_core::utils::parse_dicom_date;
use pacs_core::{AuditAction, AuditOutcome, DateRange, RecordOrigin, Result, StudyQuery, StudyRecord};
use pacs_dicom::{uids, Dataset, DatasetExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::details;
use crate::gateway::PacsGateway;
use crate::merge::merge_by_key;

/// 单次查询最多返回的行数
pub const MAX_RESULTS: usize = 100;

/// 检查查询条件
///
/// `study_date` 为DICOM DA查询值：`YYYYMMDD`、`YYYYMMDD-YYYYMMDD`、`YYYYMMDD-` 或 `-YYYYMMDD`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyFilter {
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
    pub study_date: Option<String>,
    pub modality: Option<String>,
}

impl StudyFilter {
    /// 转为本地库查询条件；日期格式错误返回 `Validation`
    pub fn to_query(&self) -> Result<StudyQuery> {
        let study_date = match non_empty(&self.study_date) {
            Some(value) => Some(DateRange::parse_dicom(value)?),
            None => None,
        };
        Ok(StudyQuery {
            patient_id: non_empty(&self.patient_id).map(str::to_string),
            accession_number: non_empty(&self.accession_number).map(str::to_string),
            study_date,
            modality: non_empty(&self.modality).map(str::to_string),
            limit: MAX_RESULTS,
        })
    }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

struct QueryOutcome {
    studies: Vec<StudyRecord>,
    local_count: usize,
    remote_count: usize,
    remote_error: Option<String>,
}

impl PacsGateway {
    /// 查询检查
    pub async fn query_studies(&self, filter: &StudyFilter) -> Result<Vec<StudyRecord>> {
        let result = self.run_study_query(filter).await;
        match &result {
            Ok(outcome) => {
                self.audit
                    .emit(
                        AuditAction::QueryStudies,
                        AuditOutcome::Success,
                        format!("检查查询返回 {} 条", outcome.studies.len()),
                        details(json!({
                            "filter": filter,
                            "localCount": outcome.local_count,
                            "remoteCount": outcome.remote_count,
                            "returned": outcome.studies.len(),
                            "remoteError": outcome.remote_error,
                        })),
                    )
                    .await;
            }
            Err(e) => {
                self.audit
                    .emit(
                        AuditAction::QueryStudies,
                        AuditOutcome::Failure,
                        "检查查询失败",
                        details(json!({ "filter": filter, "error": e.to_string() })),
                    )
                    .await;
            }
        }
        result.map(|outcome| outcome.studies)
    }

    async fn run_study_query(&self, filter: &StudyFilter) -> Result<QueryOutcome> {
        let query = filter.to_query()?;
        let remote_available = self.remote_available().await;

        let local = self.store.find_studies(&query).await?;
        let local_count = local.len();
        debug!("本地检查查询命中 {} 条", local_count);

        let (remote, remote_error) = if remote_available {
            match self.find_remote_studies(&query).await {
                Ok(remote) => (remote, None),
                Err(e) => {
                    warn!(error = %e, "远端C-FIND失败，仅返回本地结果");
                    (Vec::new(), Some(e.to_string()))
                }
            }
        } else {
            (Vec::new(), None)
        };
        let remote_count = remote.len();

        let mut studies = merge_by_key(local, remote, |study| study.study_instance_uid.clone());
        studies.sort_by(by_study_date_desc);
        studies.truncate(MAX_RESULTS);

        info!(
            local = local_count,
            remote = remote_count,
            returned = studies.len(),
            "检查查询完成"
        );
        Ok(QueryOutcome {
            studies,
            local_count,
            remote_count,
            remote_error,
        })
    }

    async fn find_remote_studies(&self, query: &StudyQuery) -> Result<Vec<StudyRecord>> {
        let identifier = study_identifier(query);
        let matches = self.scu.find(uids::STUDY_ROOT_FIND, &identifier).await?;

        // 对端的匹配可能比本地宽松，多值的ModalitiesInStudy交给对端判断
        let check = StudyQuery {
            modality: None,
            ..query.clone()
        };
        Ok(matches
            .iter()
            .filter_map(|dataset| study_from_match(dataset, query.modality.as_deref()))
            .filter(|study| check.matches(study))
            .collect())
    }
}

/// 构造Study Root检查级别的查询标识
pub(crate) fn study_identifier(query: &StudyQuery) -> Dataset {
    let mut identifier = Dataset::new_empty();
    identifier
        .put_text(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY")
        .put_empty(tags::STUDY_INSTANCE_UID, VR::UI)
        .put_text(
            tags::STUDY_DATE,
            VR::DA,
            &query.study_date.map(|range| range.to_dicom()).unwrap_or_default(),
        )
        .put_text(
            tags::ACCESSION_NUMBER,
            VR::SH,
            query.accession_number.as_deref().unwrap_or_default(),
        )
        .put_text(
            tags::MODALITIES_IN_STUDY,
            VR::CS,
            query.modality.as_deref().unwrap_or_default(),
        )
        .put_empty(tags::REFERRING_PHYSICIAN_NAME, VR::PN)
        .put_empty(tags::INSTITUTION_NAME, VR::LO)
        .put_empty(tags::PATIENT_NAME, VR::PN)
        .put_text(tags::PATIENT_ID, VR::LO, query.patient_id.as_deref().unwrap_or_default())
        .put_empty(tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS)
        .put_empty(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS);
    identifier
}

/// 把C-FIND匹配项转为检查记录；缺少Study Instance UID的匹配项丢弃
fn study_from_match(dataset: &Dataset, requested_modality: Option<&str>) -> Option<StudyRecord> {
    let uid = dataset.text(tags::STUDY_INSTANCE_UID)?;
    let modalities = dataset.text(tags::MODALITIES_IN_STUDY).unwrap_or_default();
    let modality = match requested_modality {
        Some(wanted) if modalities.split('\\').any(|m| m.trim() == wanted) => wanted.to_string(),
        _ => modalities,
    };
    Some(StudyRecord {
        accession_number: dataset.text(tags::ACCESSION_NUMBER).unwrap_or_default(),
        patient_id: dataset.text(tags::PATIENT_ID).unwrap_or_default(),
        patient_name: dataset.text(tags::PATIENT_NAME).unwrap_or_default(),
        study_date: optional_date(dataset.text(tags::STUDY_DATE)),
        modality,
        series_count: dataset.int(tags::NUMBER_OF_STUDY_RELATED_SERIES).unwrap_or(0),
        instance_count: dataset.int(tags::NUMBER_OF_STUDY_RELATED_INSTANCES).unwrap_or(0),
        referring_physician: dataset.text(tags::REFERRING_PHYSICIAN_NAME),
        institution: dataset.text(tags::INSTITUTION_NAME),
        origin: RecordOrigin::Remote,
        ..StudyRecord::new(uid)
    })
}

/// 对端返回的日期格式不对时按缺失处理
pub(crate) fn optional_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|v| parse_dicom_date(&v).ok())
}

/// 检查日期降序，无日期的排在最后
fn by_study_date_desc(a: &StudyRecord, b: &StudyRecord) -> Ordering {
    match (a.study_date, b.study_date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{harness, unreachable_config};
    use pacs_core::PacsError;
    use pacs_database::Store;
    use pacs_dicom::testing::{FakePacs, Reply};
    use pacs_dicom::dataset;
    use pacs_dicom::transfer_syntax::transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN;
    use pacs_dicom::CommandField;

    fn study(uid: &str, date: (i32, u32, u32)) -> StudyRecord {
        StudyRecord {
            patient_id: "PID001".into(),
            accession_number: format!("ACC-{}", uid),
            modality: "CT".into(),
            study_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            ..StudyRecord::new(uid)
        }
    }

    fn remote_match(uid: &str, date: &str, patient_name: &str) -> Vec<u8> {
        let mut matched = Dataset::new_empty();
        matched
            .put_text(tags::STUDY_INSTANCE_UID, VR::UI, uid)
            .put_text(tags::STUDY_DATE, VR::DA, date)
            .put_text(tags::PATIENT_ID, VR::LO, "PID001")
            .put_text(tags::PATIENT_NAME, VR::PN, patient_name)
            .put_text(tags::MODALITIES_IN_STUDY, VR::CS, "CT\\SR")
            .put_text(tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS, "2")
            .put_text(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, "40");
        dataset::encode(&matched, IMPLICIT_VR_LITTLE_ENDIAN).unwrap()
    }

    fn date_filter(value: &str) -> StudyFilter {
        StudyFilter {
            study_date: Some(value.into()),
            ..Default::default()
        }
    }

    fn uids_of(studies: &[StudyRecord]) -> Vec<&str> {
        studies.iter().map(|s| s.study_instance_uid.as_str()).collect()
    }

    #[test]
    fn test_filter_rejects_malformed_date() {
        let err = date_filter("2024-01-01").to_query().unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));
    }

    #[test]
    fn test_blank_filter_values_are_ignored() {
        let filter = StudyFilter {
            patient_id: Some("  ".into()),
            ..Default::default()
        };
        let query = filter.to_query().unwrap();
        assert_eq!(query.patient_id, None);
        assert_eq!(query.limit, MAX_RESULTS);
    }

    #[test]
    fn test_identifier_carries_filters_and_return_keys() {
        let query = StudyFilter {
            patient_id: Some("PID001".into()),
            study_date: Some("20240101-20240105".into()),
            ..Default::default()
        }
        .to_query()
        .unwrap();
        let identifier = study_identifier(&query);
        assert_eq!(identifier.text(tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("STUDY"));
        assert_eq!(identifier.text(tags::PATIENT_ID).as_deref(), Some("PID001"));
        assert_eq!(
            identifier.text(tags::STUDY_DATE).as_deref(),
            Some("20240101-20240105")
        );
        assert!(identifier.has(tags::NUMBER_OF_STUDY_RELATED_INSTANCES));
        assert!(identifier.has(tags::STUDY_INSTANCE_UID));
        assert_eq!(identifier.text(tags::STUDY_INSTANCE_UID), None);
    }

    #[tokio::test]
    async fn test_date_range_is_inclusive_when_offline() {
        let h = harness(unreachable_config().await);
        for (uid, day) in [("1.1", 1), ("1.2", 5), ("1.3", 6), ("1.4", 15)] {
            h.store.upsert_study(&study(uid, (2024, 1, day))).await.unwrap();
        }
        h.store.upsert_study(&study("1.0", (2023, 12, 31))).await.unwrap();

        let found = h.gateway.query_studies(&date_filter("20240101-20240105")).await.unwrap();
        assert_eq!(uids_of(&found), vec!["1.2", "1.1"]);

        let found = h.gateway.query_studies(&date_filter("20240101")).await.unwrap();
        assert_eq!(uids_of(&found), vec!["1.1"]);
    }

    #[tokio::test]
    async fn test_malformed_date_is_audited_failure() {
        let h = harness(unreachable_config().await);
        let err = h.gateway.query_studies(&date_filter("2024")).await.unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Failure);
    }

    #[tokio::test]
    async fn test_merge_keeps_local_and_appends_remote() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CFindRq => vec![
                    Reply::pending(remote_match("1.1", "20240110", "REMOTE^COPY")),
                    Reply::pending(remote_match("2.1", "20240120", "DOE^JOHN")),
                    Reply::success(),
                ],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let h = harness(fake.peer_config());
        let mut local = study("1.1", (2024, 1, 10));
        local.patient_name = "LOCAL^COPY".into();
        h.store.upsert_study(&local).await.unwrap();

        let found = h.gateway.query_studies(&StudyFilter::default()).await.unwrap();
        assert_eq!(uids_of(&found), vec!["2.1", "1.1"]);
        assert_eq!(found[0].origin, RecordOrigin::Remote);
        assert_eq!(found[0].instance_count, 40);
        assert_eq!(found[1].origin, RecordOrigin::Local);
        assert_eq!(found[1].patient_name, "LOCAL^COPY");

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].details["localCount"], 1);
        assert_eq!(records[0].details["remoteCount"], 2);
        assert_eq!(records[0].details["returned"], 2);
    }

    #[tokio::test]
    async fn test_remote_hits_outside_range_are_dropped() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CFindRq => vec![
                    Reply::pending(remote_match("2.1", "20240103", "IN^RANGE")),
                    Reply::pending(remote_match("2.2", "20240301", "OUT^OF^RANGE")),
                    Reply::success(),
                ],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let h = harness(fake.peer_config());

        let found = h.gateway.query_studies(&date_filter("20240101-20240105")).await.unwrap();
        assert_eq!(uids_of(&found), vec!["2.1"]);

        let request = fake
            .received()
            .into_iter()
            .find(|m| m.command.command_field == CommandField::CFindRq)
            .unwrap();
        let identifier =
            dataset::decode(request.data.as_ref().unwrap(), IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(
            identifier.text(tags::STUDY_DATE).as_deref(),
            Some("20240101-20240105")
        );
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_local() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CFindRq => vec![Reply::status(0xA700)],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let h = harness(fake.peer_config());
        h.store.upsert_study(&study("1.1", (2024, 1, 10))).await.unwrap();

        let found = h.gateway.query_studies(&StudyFilter::default()).await.unwrap();
        assert_eq!(uids_of(&found), vec!["1.1"]);
        assert!(h.audit.records()[0].details["remoteError"].is_string());
    }

    #[tokio::test]
    async fn test_results_are_capped() {
        let h = harness(unreachable_config().await);
        for i in 0..120u32 {
            let date = NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|d| d.checked_add_days(chrono::Days::new(i as u64)))
                .unwrap();
            let mut record = StudyRecord::new(format!("1.{}", i));
            record.study_date = Some(date);
            h.store.upsert_study(&record).await.unwrap();
        }
        let found = h.gateway.query_studies(&StudyFilter::default()).await.unwrap();
        assert_eq!(found.len(), MAX_RESULTS);
        assert_eq!(found[0].study_instance_uid, "1.119");
    }
}

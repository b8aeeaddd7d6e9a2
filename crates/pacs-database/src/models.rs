//! 数据库模型

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pacs_core::models::*;
use sqlx::FromRow;
use tracing::warn;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库检查表
#[derive(Debug, FromRow)]
pub struct DbStudy {
    pub study_instance_uid: String,
    pub accession_number: String,
    pub patient_id: String,
    pub patient_name: String,
    pub study_date: Option<NaiveDate>,
    pub modality: String,
    pub series_count: i32,
    pub instance_count: i32,
    pub referring_physician: Option<String>,
    pub institution: Option<String>,
}

impl From<DbStudy> for StudyRecord {
    fn from(db_study: DbStudy) -> Self {
        StudyRecord {
            study_instance_uid: db_study.study_instance_uid,
            accession_number: db_study.accession_number,
            patient_id: db_study.patient_id,
            patient_name: db_study.patient_name,
            study_date: db_study.study_date,
            modality: db_study.modality,
            series_count: db_study.series_count,
            instance_count: db_study.instance_count,
            referring_physician: db_study.referring_physician,
            institution: db_study.institution,
            origin: RecordOrigin::Local,
        }
    }
}

/// 数据库影像表
#[derive(Debug, FromRow)]
pub struct DbImage {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub instance_number: Option<i32>,
    pub series_number: Option<i32>,
    pub storage_location: String,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

impl From<DbImage> for ImageRecord {
    fn from(db_image: DbImage) -> Self {
        ImageRecord {
            study_instance_uid: db_image.study_instance_uid,
            series_instance_uid: db_image.series_instance_uid,
            sop_instance_uid: db_image.sop_instance_uid,
            sop_class_uid: db_image.sop_class_uid,
            instance_number: db_image.instance_number,
            series_number: db_image.series_number,
            storage_location: db_image.storage_location,
            byte_size: db_image.byte_size,
            created_at: db_image.created_at,
        }
    }
}

/// 数据库检查申请表
#[derive(Debug, FromRow)]
pub struct DbOrder {
    pub id: Uuid,
    pub accession_number: String,
    pub patient_id: String,
    pub patient_name: String,
    pub modality: String,
    pub status: String, // 存储为字符串，转换为OrderStatus枚举
    pub scheduled_at: Option<NaiveDateTime>,
    pub scheduled_station_ae: Option<String>,
    pub requested_procedure_description: Option<String>,
}

impl From<DbOrder> for OrderRecord {
    fn from(db_order: DbOrder) -> Self {
        let status = OrderStatus::parse(&db_order.status).unwrap_or_else(|| {
            warn!(status = %db_order.status, accession = %db_order.accession_number, "未知的申请状态");
            OrderStatus::Pending
        });
        OrderRecord {
            id: db_order.id,
            accession_number: db_order.accession_number,
            patient_id: db_order.patient_id,
            patient_name: db_order.patient_name,
            modality: db_order.modality,
            status,
            scheduled_at: db_order.scheduled_at,
            scheduled_station_ae: db_order.scheduled_station_ae,
            requested_procedure_description: db_order.requested_procedure_description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_study_is_local() {
        let record = StudyRecord::from(DbStudy {
            study_instance_uid: "1.2.3".into(),
            accession_number: "ACC1".into(),
            patient_id: "PID".into(),
            patient_name: "DOE^JOHN".into(),
            study_date: None,
            modality: "MR".into(),
            series_count: 2,
            instance_count: 40,
            referring_physician: None,
            institution: None,
        });
        assert_eq!(record.origin, RecordOrigin::Local);
        assert_eq!(record.instance_count, 40);
    }

    #[test]
    fn test_unknown_order_status_defaults_to_pending() {
        let order = OrderRecord::from(DbOrder {
            id: Uuid::new_v4(),
            accession_number: "ACC1".into(),
            patient_id: "PID".into(),
            patient_name: "DOE^JOHN".into(),
            modality: "CT".into(),
            status: "ON_HOLD".into(),
            scheduled_at: None,
            scheduled_station_ae: None,
            requested_procedure_description: None,
        });
        assert_eq!(order.status, OrderStatus::Pending);
    }
}

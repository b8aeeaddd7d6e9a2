//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::DateRange;

/// 记录来源：本地数据库或远端PACS
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrigin {
    Local,
    Remote,
}

/// 检查信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyRecord {
    pub study_instance_uid: String, // DICOM Study Instance UID，唯一
    pub accession_number: String,   // 检查号，唯一
    pub patient_id: String,
    pub patient_name: String,
    pub study_date: Option<NaiveDate>,
    pub modality: String, // 检查设备类型 (CT, MR, DR等)
    pub series_count: i32,
    pub instance_count: i32,
    pub referring_physician: Option<String>,
    pub institution: Option<String>,
    pub origin: RecordOrigin,
}

impl StudyRecord {
    /// 创建只包含UID的本地检查记录，其余字段由调用方补充
    pub fn new(study_instance_uid: impl Into<String>) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            accession_number: String::new(),
            patient_id: String::new(),
            patient_name: String::new(),
            study_date: None,
            modality: String::new(),
            series_count: 0,
            instance_count: 0,
            referring_physician: None,
            institution: None,
            origin: RecordOrigin::Local,
        }
    }
}

/// 影像实例信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String, // 检查内唯一
    pub sop_class_uid: String,
    pub instance_number: Option<i32>,
    pub series_number: Option<i32>,
    pub storage_location: String,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

/// 检查申请状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,    // 待预约
    Scheduled,  // 已预约
    InProgress, // 检查中
    Completed,  // 已完成
    Cancelled,  // 已取消
}

impl OrderStatus {
    /// 是否应出现在模态工作列表中
    pub fn is_worklist_visible(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Scheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Scheduled => "SCHEDULED",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OrderStatus::Pending),
            "SCHEDULED" => Some(OrderStatus::Scheduled),
            "IN_PROGRESS" => Some(OrderStatus::InProgress),
            "COMPLETED" => Some(OrderStatus::Completed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// 检查申请（由CRUD层维护，网关只读）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub id: Uuid,
    pub accession_number: String,
    pub patient_id: String,
    pub patient_name: String,
    pub modality: String,
    pub status: OrderStatus,
    pub scheduled_at: Option<NaiveDateTime>,
    pub scheduled_station_ae: Option<String>,
    pub requested_procedure_description: Option<String>,
}

/// 模态工作列表条目，按需从检查申请派生，网关不持久化
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorklistEntry {
    pub accession_number: String,
    pub patient_id: String,
    pub patient_name: String,
    pub modality: String,
    pub scheduled_at: Option<NaiveDateTime>,
    pub scheduled_station_ae: Option<String>,
    pub requested_procedure_description: Option<String>,
    pub origin: RecordOrigin,
}

impl From<&OrderRecord> for WorklistEntry {
    fn from(order: &OrderRecord) -> Self {
        Self {
            accession_number: order.accession_number.clone(),
            patient_id: order.patient_id.clone(),
            patient_name: order.patient_name.clone(),
            modality: order.modality.clone(),
            scheduled_at: order.scheduled_at,
            scheduled_station_ae: order.scheduled_station_ae.clone(),
            requested_procedure_description: order.requested_procedure_description.clone(),
            origin: RecordOrigin::Local,
        }
    }
}

/// 本地检查查询条件（精确匹配）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyQuery {
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
    pub study_date: Option<DateRange>,
    pub modality: Option<String>,
    pub limit: usize,
}

/// 本地待执行申请查询条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderQuery {
    pub scheduled: Option<DateRange>,
    pub modality: Option<String>,
    pub station_ae: Option<String>,
    pub limit: usize,
}

impl StudyQuery {
    /// 判断检查记录是否满足条件
    pub fn matches(&self, study: &StudyRecord) -> bool {
        if let Some(patient_id) = &self.patient_id {
            if &study.patient_id != patient_id {
                return false;
            }
        }
        if let Some(accession) = &self.accession_number {
            if &study.accession_number != accession {
                return false;
            }
        }
        if let Some(modality) = &self.modality {
            if &study.modality != modality {
                return false;
            }
        }
        if let Some(range) = &self.study_date {
            match study.study_date {
                Some(date) if range.contains(date) => {}
                _ => return false,
            }
        }
        true
    }
}

impl OrderQuery {
    /// 判断申请是否满足条件（仅待预约/已预约的申请可见）
    pub fn matches(&self, order: &OrderRecord) -> bool {
        if !order.status.is_worklist_visible() {
            return false;
        }
        if let Some(modality) = &self.modality {
            if &order.modality != modality {
                return false;
            }
        }
        if let Some(station) = &self.station_ae {
            if order.scheduled_station_ae.as_deref() != Some(station.as_str()) {
                return false;
            }
        }
        if let Some(range) = &self.scheduled {
            match order.scheduled_at {
                Some(at) if range.contains(at.date()) => {}
                _ => return false,
            }
        }
        true
    }
}

//! 内存存储，用于测试和无数据库的独立运行

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use pacs_core::{ImageRecord, OrderQuery, OrderRecord, RecordOrigin, Result, StudyQuery, StudyRecord};
use tokio::sync::RwLock;

use crate::store::{fill_missing, Store};

#[derive(Default)]
struct Tables {
    studies: HashMap<String, StudyRecord>,
    images: Vec<ImageRecord>,
    orders: Vec<OrderRecord>,
}

/// 基于 `RwLock` 的内存存储
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入检查申请（申请由外部CRUD层维护，这里只为测试和演示提供入口）
    pub async fn insert_order(&self, order: OrderRecord) {
        self.tables.write().await.orders.push(order);
    }
}

/// 日期为空的排在最后
fn by_study_date_desc(a: &StudyRecord, b: &StudyRecord) -> Ordering {
    match (a.study_date, b.study_date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.study_instance_uid.cmp(&b.study_instance_uid))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_studies(&self, query: &StudyQuery) -> Result<Vec<StudyRecord>> {
        let tables = self.tables.read().await;
        let mut studies: Vec<StudyRecord> = tables
            .studies
            .values()
            .filter(|study| query.matches(study))
            .cloned()
            .collect();
        studies.sort_by(by_study_date_desc);
        studies.truncate(query.limit);
        Ok(studies)
    }

    async fn find_study_by_uid(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>> {
        Ok(self.tables.read().await.studies.get(study_instance_uid).cloned())
    }

    async fn upsert_study(&self, study: &StudyRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.studies.get_mut(&study.study_instance_uid) {
            Some(existing) => fill_missing(existing, study),
            None => {
                let mut record = study.clone();
                record.origin = RecordOrigin::Local;
                tables.studies.insert(record.study_instance_uid.clone(), record);
            }
        }
        Ok(())
    }

    async fn update_study_counts(
        &self,
        study_instance_uid: &str,
        series_count: i32,
        instance_count: i32,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(study) = tables.studies.get_mut(study_instance_uid) {
            study.series_count = series_count;
            study.instance_count = instance_count;
        }
        Ok(())
    }

    async fn list_images(&self, study_instance_uid: &str) -> Result<Vec<ImageRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .images
            .iter()
            .filter(|image| image.study_instance_uid == study_instance_uid)
            .cloned()
            .collect())
    }

    async fn create_image(&self, image: &ImageRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.images.iter().any(|existing| {
            existing.study_instance_uid == image.study_instance_uid
                && existing.sop_instance_uid == image.sop_instance_uid
        });
        if duplicate {
            return Ok(false);
        }
        tables.images.push(image.clone());
        Ok(true)
    }

    async fn list_pending_orders(&self, query: &OrderQuery) -> Result<Vec<OrderRecord>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<OrderRecord> = tables
            .orders
            .iter()
            .filter(|order| query.matches(order))
            .cloned()
            .collect();
        // 未预约时间的排在最后
        orders.sort_by(|a, b| match (a.scheduled_at, b.scheduled_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        orders.truncate(query.limit);
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use pacs_core::{DateRange, OrderStatus};
    use uuid::Uuid;

    fn study(uid: &str, date: Option<NaiveDate>) -> StudyRecord {
        StudyRecord {
            patient_id: "PID001".into(),
            modality: "CT".into(),
            study_date: date,
            ..StudyRecord::new(uid)
        }
    }

    fn image(study_uid: &str, series_uid: &str, sop_uid: &str) -> ImageRecord {
        ImageRecord {
            study_instance_uid: study_uid.into(),
            series_instance_uid: series_uid.into(),
            sop_instance_uid: sop_uid.into(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            instance_number: None,
            series_number: None,
            storage_location: format!("/data/{}.dcm", sop_uid),
            byte_size: 1024,
            created_at: Utc::now(),
        }
    }

    fn order(accession: &str, status: OrderStatus, day: u32) -> OrderRecord {
        OrderRecord {
            id: Uuid::new_v4(),
            accession_number: accession.into(),
            patient_id: "PID001".into(),
            patient_name: "DOE^JANE".into(),
            modality: "CT".into(),
            status,
            scheduled_at: NaiveDate::from_ymd_opt(2024, 1, day).and_then(|d| d.and_hms_opt(9, 0, 0)),
            scheduled_station_ae: Some("CT01".into()),
            requested_procedure_description: None,
        }
    }

    #[tokio::test]
    async fn test_find_studies_orders_and_limits() {
        let store = InMemoryStore::new();
        store.upsert_study(&study("1.1", NaiveDate::from_ymd_opt(2024, 1, 10))).await.unwrap();
        store.upsert_study(&study("1.2", NaiveDate::from_ymd_opt(2024, 3, 1))).await.unwrap();
        store.upsert_study(&study("1.3", None)).await.unwrap();

        let query = StudyQuery {
            limit: 2,
            ..Default::default()
        };
        let found = store.find_studies(&query).await.unwrap();
        let uids: Vec<_> = found.iter().map(|s| s.study_instance_uid.as_str()).collect();
        assert_eq!(uids, vec!["1.2", "1.1"]);
    }

    #[tokio::test]
    async fn test_find_studies_by_date_range() {
        let store = InMemoryStore::new();
        store.upsert_study(&study("1.1", NaiveDate::from_ymd_opt(2024, 1, 15))).await.unwrap();
        store.upsert_study(&study("1.2", NaiveDate::from_ymd_opt(2024, 1, 16))).await.unwrap();

        let query = StudyQuery {
            study_date: Some(DateRange::parse_dicom("20240115").unwrap()),
            limit: 100,
            ..Default::default()
        };
        let found = store.find_studies(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].study_instance_uid, "1.1");
    }

    #[tokio::test]
    async fn test_upsert_keeps_existing_values() {
        let store = InMemoryStore::new();
        store.upsert_study(&study("1.1", NaiveDate::from_ymd_opt(2024, 1, 10))).await.unwrap();

        let mut incoming = StudyRecord::new("1.1");
        incoming.patient_id = "OTHER".into();
        incoming.accession_number = "ACC9".into();
        store.upsert_study(&incoming).await.unwrap();

        let stored = store.find_study_by_uid("1.1").await.unwrap().unwrap();
        assert_eq!(stored.patient_id, "PID001");
        assert_eq!(stored.accession_number, "ACC9");
        assert_eq!(stored.study_date, NaiveDate::from_ymd_opt(2024, 1, 10));
    }

    #[tokio::test]
    async fn test_recompute_counts() {
        let store = InMemoryStore::new();
        store.upsert_study(&study("1.1", None)).await.unwrap();
        assert!(store.create_image(&image("1.1", "1.1.1", "1.1.1.1")).await.unwrap());
        assert!(store.create_image(&image("1.1", "1.1.1", "1.1.1.2")).await.unwrap());
        assert!(store.create_image(&image("1.1", "1.1.2", "1.1.2.1")).await.unwrap());
        assert!(!store.create_image(&image("1.1", "1.1.2", "1.1.2.1")).await.unwrap());

        let counts = store.recompute_study_counts("1.1").await.unwrap();
        assert_eq!(counts, (2, 3));
        let stored = store.find_study_by_uid("1.1").await.unwrap().unwrap();
        assert_eq!((stored.series_count, stored.instance_count), (2, 3));
    }

    #[tokio::test]
    async fn test_pending_orders_only_visible_statuses() {
        let store = InMemoryStore::new();
        store.insert_order(order("A3", OrderStatus::Scheduled, 12)).await;
        store.insert_order(order("A1", OrderStatus::Pending, 10)).await;
        store.insert_order(order("A2", OrderStatus::Completed, 11)).await;
        store.insert_order(order("A4", OrderStatus::Cancelled, 9)).await;

        let query = OrderQuery {
            limit: 100,
            ..Default::default()
        };
        let orders = store.list_pending_orders(&query).await.unwrap();
        let accessions: Vec<_> = orders.iter().map(|o| o.accession_number.as_str()).collect();
        assert_eq!(accessions, vec!["A1", "A3"]);
    }
}

//! PostgreSQL存储实现

use async_trait::async_trait;
use pacs_core::{ImageRecord, OrderQuery, OrderRecord, Result, StudyQuery, StudyRecord};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::connection::DatabasePool;
use crate::models::{DbImage, DbOrder, DbStudy};
use crate::store::Store;

const STUDY_COLUMNS: &str = "study_instance_uid, accession_number, patient_id, patient_name, \
     study_date, modality, series_count, instance_count, referring_physician, institution";

const IMAGE_COLUMNS: &str = "study_instance_uid, series_instance_uid, sop_instance_uid, \
     sop_class_uid, instance_number, series_number, storage_location, byte_size, created_at";

const ORDER_COLUMNS: &str = "id, accession_number, patient_id, patient_name, modality, status, \
     scheduled_at, scheduled_station_ae, requested_procedure_description";

/// PostgreSQL上的 [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: DatabasePool,
}

impl PgStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 连接并确保表结构存在
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let store = Self::new(DatabasePool::connect(database_url, max_connections).await?);
        store.create_tables().await?;
        Ok(store)
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 检查表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS studies (
                study_instance_uid VARCHAR(64) PRIMARY KEY,
                accession_number VARCHAR(64) NOT NULL DEFAULT '',
                patient_id VARCHAR(64) NOT NULL DEFAULT '',
                patient_name VARCHAR(255) NOT NULL DEFAULT '',
                study_date DATE,
                modality VARCHAR(16) NOT NULL DEFAULT '',
                series_count INTEGER NOT NULL DEFAULT 0,
                instance_count INTEGER NOT NULL DEFAULT 0,
                referring_physician VARCHAR(255),
                institution VARCHAR(255),
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 影像表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                study_instance_uid VARCHAR(64) NOT NULL REFERENCES studies(study_instance_uid),
                series_instance_uid VARCHAR(64) NOT NULL,
                sop_instance_uid VARCHAR(64) NOT NULL,
                sop_class_uid VARCHAR(64) NOT NULL,
                instance_number INTEGER,
                series_number INTEGER,
                storage_location VARCHAR(512) NOT NULL,
                byte_size BIGINT NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (study_instance_uid, sop_instance_uid)
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 检查申请表（由外部CRUD层写入）
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                accession_number VARCHAR(64) UNIQUE NOT NULL,
                patient_id VARCHAR(64) NOT NULL,
                patient_name VARCHAR(255) NOT NULL,
                modality VARCHAR(16) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
                scheduled_at TIMESTAMP,
                scheduled_station_ae VARCHAR(16),
                requested_procedure_description TEXT
            )
        "#,
        )
        .execute(pool)
        .await?;

        self.create_indexes().await?;

        info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_studies_accession_number ON studies(accession_number)",
            "CREATE INDEX IF NOT EXISTS idx_studies_study_date ON studies(study_date)",
            "CREATE INDEX IF NOT EXISTS idx_images_series ON images(series_instance_uid)",
            "CREATE INDEX IF NOT EXISTS idx_orders_scheduled_at ON orders(scheduled_at)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }
        Ok(())
    }
}

/// 按查询条件拼接检查查询语句
fn build_study_query(query: &StudyQuery) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {} FROM studies WHERE TRUE", STUDY_COLUMNS));
    if let Some(patient_id) = &query.patient_id {
        builder.push(" AND patient_id = ").push_bind(patient_id);
    }
    if let Some(accession_number) = &query.accession_number {
        builder.push(" AND accession_number = ").push_bind(accession_number);
    }
    if let Some(modality) = &query.modality {
        builder.push(" AND modality = ").push_bind(modality);
    }
    if let Some(range) = &query.study_date {
        if let Some(start) = range.start {
            builder.push(" AND study_date >= ").push_bind(start);
        }
        if let Some(end) = range.end_exclusive {
            builder.push(" AND study_date < ").push_bind(end);
        }
    }
    builder
        .push(" ORDER BY study_date DESC NULLS LAST, study_instance_uid LIMIT ")
        .push_bind(query.limit as i64);
    builder
}

fn build_order_query(query: &OrderQuery) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM orders WHERE status IN ('PENDING', 'SCHEDULED')",
        ORDER_COLUMNS
    ));
    if let Some(modality) = &query.modality {
        builder.push(" AND modality = ").push_bind(modality);
    }
    if let Some(station) = &query.station_ae {
        builder.push(" AND scheduled_station_ae = ").push_bind(station);
    }
    if let Some(range) = &query.scheduled {
        if let Some(start) = range.start.and_then(|d| d.and_hms_opt(0, 0, 0)) {
            builder.push(" AND scheduled_at >= ").push_bind(start);
        }
        if let Some(end) = range.end_exclusive.and_then(|d| d.and_hms_opt(0, 0, 0)) {
            builder.push(" AND scheduled_at < ").push_bind(end);
        }
    }
    builder
        .push(" ORDER BY scheduled_at ASC NULLS LAST LIMIT ")
        .push_bind(query.limit as i64);
    builder
}

#[async_trait]
impl Store for PgStore {
    async fn find_studies(&self, query: &StudyQuery) -> Result<Vec<StudyRecord>> {
        let mut builder = build_study_query(query);
        debug!(sql = builder.sql(), "查询本地检查");
        let rows = builder
            .build_query_as::<DbStudy>()
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rows.into_iter().map(StudyRecord::from).collect())
    }

    async fn find_study_by_uid(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>> {
        let row = sqlx::query_as::<_, DbStudy>(&format!(
            "SELECT {} FROM studies WHERE study_instance_uid = $1",
            STUDY_COLUMNS
        ))
        .bind(study_instance_uid)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.map(StudyRecord::from))
    }

    async fn upsert_study(&self, study: &StudyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO studies (study_instance_uid, accession_number, patient_id, patient_name,
                                 study_date, modality, referring_physician, institution)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (study_instance_uid) DO UPDATE SET
                accession_number = COALESCE(NULLIF(studies.accession_number, ''), EXCLUDED.accession_number),
                patient_id = COALESCE(NULLIF(studies.patient_id, ''), EXCLUDED.patient_id),
                patient_name = COALESCE(NULLIF(studies.patient_name, ''), EXCLUDED.patient_name),
                study_date = COALESCE(studies.study_date, EXCLUDED.study_date),
                modality = COALESCE(NULLIF(studies.modality, ''), EXCLUDED.modality),
                referring_physician = COALESCE(studies.referring_physician, EXCLUDED.referring_physician),
                institution = COALESCE(studies.institution, EXCLUDED.institution)
        "#,
        )
        .bind(&study.study_instance_uid)
        .bind(&study.accession_number)
        .bind(&study.patient_id)
        .bind(&study.patient_name)
        .bind(study.study_date)
        .bind(&study.modality)
        .bind(&study.referring_physician)
        .bind(&study.institution)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn update_study_counts(
        &self,
        study_instance_uid: &str,
        series_count: i32,
        instance_count: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE studies SET series_count = $1, instance_count = $2 WHERE study_instance_uid = $3",
        )
        .bind(series_count)
        .bind(instance_count)
        .bind(study_instance_uid)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn list_images(&self, study_instance_uid: &str) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query_as::<_, DbImage>(&format!(
            "SELECT {} FROM images WHERE study_instance_uid = $1 ORDER BY series_number, instance_number",
            IMAGE_COLUMNS
        ))
        .bind(study_instance_uid)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(ImageRecord::from).collect())
    }

    async fn create_image(&self, image: &ImageRecord) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO images ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (study_instance_uid, sop_instance_uid) DO NOTHING",
            IMAGE_COLUMNS
        ))
        .bind(&image.study_instance_uid)
        .bind(&image.series_instance_uid)
        .bind(&image.sop_instance_uid)
        .bind(&image.sop_class_uid)
        .bind(image.instance_number)
        .bind(image.series_number)
        .bind(&image.storage_location)
        .bind(image.byte_size)
        .bind(image.created_at)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_pending_orders(&self, query: &OrderQuery) -> Result<Vec<OrderRecord>> {
        let mut builder = build_order_query(query);
        let rows = builder
            .build_query_as::<DbOrder>()
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rows.into_iter().map(OrderRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::DateRange;

    #[test]
    fn test_study_query_binds_filters() {
        let query = StudyQuery {
            patient_id: Some("PID001".into()),
            study_date: Some(DateRange::parse_dicom("20240101-20240131").unwrap()),
            limit: 100,
            ..Default::default()
        };
        let builder = build_study_query(&query);
        let sql = builder.sql();
        assert!(sql.contains("patient_id = $1"));
        assert!(sql.contains("study_date >= $2"));
        assert!(sql.contains("study_date < $3"));
        assert!(sql.ends_with("LIMIT $4"));
        assert!(!sql.contains("modality ="));
    }

    #[test]
    fn test_order_query_filters_visible_statuses() {
        let query = OrderQuery {
            modality: Some("CT".into()),
            limit: 100,
            ..Default::default()
        };
        let builder = build_order_query(&query);
        let sql = builder.sql();
        assert!(sql.contains("status IN ('PENDING', 'SCHEDULED')"));
        assert!(sql.contains("modality = $1"));
        assert!(sql.contains("ORDER BY scheduled_at ASC"));
    }
}

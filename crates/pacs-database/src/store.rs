//! 网关使用的数据存储能力

use std::collections::HashSet;

use async_trait::async_trait;
use pacs_core::{ImageRecord, OrderQuery, OrderRecord, Result, StudyQuery, StudyRecord};

/// 检查、影像与检查申请的存储
///
/// 实现必须可并发使用。计数字段总是从影像行重新计算，不做缓存。
#[async_trait]
pub trait Store: Send + Sync {
    /// 精确匹配查询，按检查日期降序，最多 `query.limit` 条
    async fn find_studies(&self, query: &StudyQuery) -> Result<Vec<StudyRecord>>;

    async fn find_study_by_uid(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>>;

    /// 不存在则插入；已存在时只补全空的描述字段，不修改计数
    async fn upsert_study(&self, study: &StudyRecord) -> Result<()>;

    async fn update_study_counts(
        &self,
        study_instance_uid: &str,
        series_count: i32,
        instance_count: i32,
    ) -> Result<()>;

    async fn list_images(&self, study_instance_uid: &str) -> Result<Vec<ImageRecord>>;

    /// 插入影像；同一检查内SOP Instance UID重复时返回 `false`
    async fn create_image(&self, image: &ImageRecord) -> Result<bool>;

    /// 待预约/已预约的申请，按预约时间升序
    async fn list_pending_orders(&self, query: &OrderQuery) -> Result<Vec<OrderRecord>>;

    /// 按影像行重新计算并写回检查的序列数与实例数
    async fn recompute_study_counts(&self, study_instance_uid: &str) -> Result<(i32, i32)> {
        let images = self.list_images(study_instance_uid).await?;
        let (series, instances) = count_images(&images);
        self.update_study_counts(study_instance_uid, series, instances).await?;
        Ok((series, instances))
    }
}

/// 不同序列UID个数与影像行数
pub fn count_images(images: &[ImageRecord]) -> (i32, i32) {
    let series: HashSet<&str> = images
        .iter()
        .map(|image| image.series_instance_uid.as_str())
        .collect();
    (series.len() as i32, images.len() as i32)
}

/// 用新记录补全已有记录中为空的描述字段
pub fn fill_missing(existing: &mut StudyRecord, incoming: &StudyRecord) {
    fn fill(target: &mut String, source: &str) {
        if target.is_empty() && !source.is_empty() {
            *target = source.to_string();
        }
    }
    fill(&mut existing.accession_number, &incoming.accession_number);
    fill(&mut existing.patient_id, &incoming.patient_id);
    fill(&mut existing.patient_name, &incoming.patient_name);
    fill(&mut existing.modality, &incoming.modality);
    if existing.study_date.is_none() {
        existing.study_date = incoming.study_date;
    }
    if existing.referring_physician.is_none() {
        existing.referring_physician = incoming.referring_physician.clone();
    }
    if existing.institution.is_none() {
        existing.institution = incoming.institution.clone();
    }
}

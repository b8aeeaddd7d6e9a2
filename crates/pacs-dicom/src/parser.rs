//! DICOM数据解析器
//!
//! 解析Part-10文件（128字节前导 + "DICM" + 文件元信息组 + 数据集），
//! 并为C-STORE收到的裸数据集补上文件元信息写成Part-10文件。

use dicom::object::meta::FileMetaTableBuilder;
use dicom::object::{DefaultDicomObject, OpenFileOptions};
use dicom_dictionary_std::tags;
use pacs_core::{PacsError, Result};
use serde::Serialize;
use tracing::debug;

use crate::dataset::{Dataset, DatasetExt};
use crate::transfer_syntax::trim_uid;
use crate::uids;

pub const PREAMBLE_LEN: usize = 128;
pub const DICM_MAGIC: &[u8; 4] = b"DICM";
/// 前导 + 魔数
pub const PART10_HEADER_LEN: usize = PREAMBLE_LEN + 4;
/// (0002,0000) 组长度元素：标签4 + VR 2 + 长度2 + 值4
const GROUP_LENGTH_ELEMENT_LEN: usize = 12;

/// DICOM数据解析器
pub struct DicomParser;

impl DicomParser {
    /// 偏移128处是否为"DICM"
    pub fn has_dicm_marker(bytes: &[u8]) -> bool {
        bytes.len() >= PART10_HEADER_LEN && &bytes[PREAMBLE_LEN..PART10_HEADER_LEN] == DICM_MAGIC
    }

    /// 解析Part-10字节数据
    pub fn parse_bytes(bytes: &[u8]) -> Result<ParsedDicomObject> {
        if !Self::has_dicm_marker(bytes) {
            return Err(PacsError::DicomParseError("缺少DICM前缀，不是Part-10文件".to_string()));
        }

        let object = OpenFileOptions::new()
            .from_reader(&bytes[PREAMBLE_LEN..])
            .map_err(|e| PacsError::DicomParseError(format!("无法解析DICOM文件: {}", e)))?;
        let meta = object.meta();

        let mut parsed = ParsedDicomObject::from_dataset(&object, &meta.transfer_syntax);
        parsed.dataset_offset =
            PART10_HEADER_LEN + GROUP_LENGTH_ELEMENT_LEN + meta.information_group_length as usize;
        parsed.media_storage_sop_class_uid = non_empty_uid(&meta.media_storage_sop_class_uid);
        parsed.media_storage_sop_instance_uid = non_empty_uid(&meta.media_storage_sop_instance_uid);
        parsed.implementation_class_uid = non_empty_uid(&meta.implementation_class_uid);

        if parsed.sop_class_uid.is_none() {
            parsed.sop_class_uid = parsed.media_storage_sop_class_uid.clone();
        }
        if parsed.sop_instance_uid.is_none() {
            parsed.sop_instance_uid = parsed.media_storage_sop_instance_uid.clone();
        }

        debug!(
            "提取DICOM元数据，患者ID: {:?}, 检查UID: {:?}",
            parsed.patient_id, parsed.study_instance_uid
        );
        Ok(parsed)
    }

    /// 为数据集补上文件元信息
    pub fn to_part10(
        dataset: Dataset,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
    ) -> Result<DefaultDicomObject> {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(trim_uid(sop_class_uid))
            .media_storage_sop_instance_uid(trim_uid(sop_instance_uid))
            .transfer_syntax(trim_uid(transfer_syntax_uid))
            .implementation_class_uid(uids::IMPLEMENTATION_CLASS_UID)
            .implementation_version_name(uids::IMPLEMENTATION_VERSION_NAME)
            .build()
            .map_err(|e| PacsError::Encoding(format!("文件元信息构造失败: {}", e)))?;
        Ok(dataset.with_exact_meta(meta))
    }

    /// 生成完整的Part-10文件内容
    pub fn write_part10(
        dataset: Dataset,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
    ) -> Result<Vec<u8>> {
        let file = Self::to_part10(dataset, sop_class_uid, sop_instance_uid, transfer_syntax_uid)?;
        let mut bytes = Vec::new();
        file.write_all(&mut bytes)
            .map_err(|e| PacsError::Encoding(format!("Part-10文件写入失败: {}", e)))?;
        Ok(bytes)
    }
}

fn non_empty_uid(uid: &str) -> Option<String> {
    let uid = trim_uid(uid);
    (!uid.is_empty()).then(|| uid.to_string())
}

/// 解析后的DICOM对象
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedDicomObject {
    pub transfer_syntax_uid: String,
    pub media_storage_sop_class_uid: Option<String>,
    pub media_storage_sop_instance_uid: Option<String>,
    pub implementation_class_uid: Option<String>,

    pub sop_class_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub series_number: Option<i32>,
    pub instance_number: Option<i32>,

    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub modality: Option<String>,
    pub referring_physician_name: Option<String>,
    pub institution_name: Option<String>,

    pub has_pixel_data: bool,
    /// Part-10文件中数据集的起始偏移；裸数据集为0
    pub dataset_offset: usize,
}

impl ParsedDicomObject {
    /// 从数据集提取网关关心的属性
    pub fn from_dataset(dataset: &Dataset, transfer_syntax_uid: &str) -> Self {
        Self {
            transfer_syntax_uid: trim_uid(transfer_syntax_uid).to_string(),
            sop_class_uid: dataset.text(tags::SOP_CLASS_UID),
            sop_instance_uid: dataset.text(tags::SOP_INSTANCE_UID),
            study_instance_uid: dataset.text(tags::STUDY_INSTANCE_UID),
            series_instance_uid: dataset.text(tags::SERIES_INSTANCE_UID),
            series_number: dataset.int(tags::SERIES_NUMBER),
            instance_number: dataset.int(tags::INSTANCE_NUMBER),
            patient_id: dataset.text(tags::PATIENT_ID),
            patient_name: dataset.text(tags::PATIENT_NAME),
            study_date: dataset.text(tags::STUDY_DATE),
            study_description: dataset.text(tags::STUDY_DESCRIPTION),
            accession_number: dataset.text(tags::ACCESSION_NUMBER),
            modality: dataset.text(tags::MODALITY),
            referring_physician_name: dataset.text(tags::REFERRING_PHYSICIAN_NAME),
            institution_name: dataset.text(tags::INSTITUTION_NAME),
            has_pixel_data: dataset.has(tags::PIXEL_DATA),
            ..Self::default()
        }
    }

    /// 数据集字节（跳过前导与元信息组）
    pub fn dataset_bytes<'a>(&self, file: &'a [u8]) -> &'a [u8] {
        file.get(self.dataset_offset..).unwrap_or(&[])
    }
}

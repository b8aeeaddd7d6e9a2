//! 查询标识符与匹配结果的数据集
//!
//! 数据集即 `dicom-object` 的 [`InMemDicomObject`]；这里补充网关常用的读写方式，
//! 以及按传输语法UID做的编解码。

use dicom::object::InMemDicomObject;
use dicom_core::header::{DataElement, Tag};
use dicom_core::value::{DataSetSequence, PrimitiveValue};
use dicom_core::VR;
use pacs_core::{PacsError, Result};

use crate::transfer_syntax;

pub type Dataset = InMemDicomObject;

/// 网关对数据集的常用读写
pub trait DatasetExt {
    /// 写入文本或UID值
    fn put_text(&mut self, tag: Tag, vr: VR, value: &str) -> &mut Self;

    /// 写入空值，作为查询的返回键
    fn put_empty(&mut self, tag: Tag, vr: VR) -> &mut Self;

    fn put_sequence(&mut self, tag: Tag, items: Vec<Dataset>) -> &mut Self;

    /// 读取文本值，去除填充；多值以 `\` 连接；缺失或空值返回None
    fn text(&self, tag: Tag) -> Option<String>;

    /// 读取IS类型整数
    fn int(&self, tag: Tag) -> Option<i32>;

    fn sequence_items(&self, tag: Tag) -> Option<&[Dataset]>;

    fn has(&self, tag: Tag) -> bool;
}

impl DatasetExt for InMemDicomObject {
    fn put_text(&mut self, tag: Tag, vr: VR, value: &str) -> &mut Self {
        self.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        self
    }

    fn put_empty(&mut self, tag: Tag, vr: VR) -> &mut Self {
        self.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
        self
    }

    fn put_sequence(&mut self, tag: Tag, items: Vec<Dataset>) -> &mut Self {
        self.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
        self
    }

    fn text(&self, tag: Tag) -> Option<String> {
        let value = self.element(tag).ok()?.to_str().ok()?;
        let trimmed = value
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .trim_start();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn int(&self, tag: Tag) -> Option<i32> {
        self.text(tag)?.trim().parse().ok()
    }

    fn sequence_items(&self, tag: Tag) -> Option<&[Dataset]> {
        self.element(tag).ok()?.items()
    }

    fn has(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}

/// 按传输语法编码数据集（不含文件元信息）
pub fn encode(dataset: &Dataset, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    let ts = transfer_syntax::lookup(transfer_syntax_uid)?;
    let mut buf = Vec::new();
    dataset
        .write_dataset_with_ts(&mut buf, ts)
        .map_err(|e| PacsError::Encoding(format!("数据集编码失败: {}", e)))?;
    Ok(buf)
}

/// 按传输语法解码数据集
pub fn decode(bytes: &[u8], transfer_syntax_uid: &str) -> Result<Dataset> {
    let ts = transfer_syntax::lookup(transfer_syntax_uid)?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(|e| PacsError::DicomParseError(format!("数据集解析失败: {}", e)))
}

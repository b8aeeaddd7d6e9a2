//! DICOM传输语法支持模块
//!
//! 入站SCP只接受小端序数据集：隐式VR小端、显式VR小端，以及封装(压缩)格式；
//! 编解码实现由 `dicom-transfer-syntax-registry` 提供。

/// 常用的传输语法UID常量
pub mod transfer_syntax_uids {
    /// 隐式VR Little Endian (默认传输语法)
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

    /// 显式VR Little Endian
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

    /// 显式VR Big Endian
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

    /// Deflated Explicit VR Little Endian
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";

    /// JPEG Baseline (Process 1)
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    /// JPEG Extended (Process 2 & 4)
    pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";

    /// JPEG Lossless (Process 14)
    pub const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.57";

    /// JPEG Lossless, Non-Hierarchical, First-Order Prediction
    pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";

    /// JPEG-LS Lossless
    pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";

    /// JPEG-LS Near Lossless
    pub const JPEG_LS_NEAR_LOSSLESS: &str = "1.2.840.10008.1.2.4.81";

    /// JPEG 2000 Image Compression (Lossless Only)
    pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";

    /// JPEG 2000 Image Compression
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";

    /// RLE Lossless
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

use dicom_encoding::{TransferSyntax, TransferSyntaxIndex};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use pacs_core::{PacsError, Result};
use transfer_syntax_uids::*;

const ENCAPSULATED: [&str; 9] = [
    JPEG_BASELINE,
    JPEG_EXTENDED,
    JPEG_LOSSLESS,
    JPEG_LOSSLESS_SV1,
    JPEG_LS_LOSSLESS,
    JPEG_LS_NEAR_LOSSLESS,
    JPEG_2000_LOSSLESS,
    JPEG_2000,
    RLE_LOSSLESS,
];

/// 去掉UID值末尾的NUL/空格填充
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c == '\0' || c == ' ')
}

/// 在注册表中查找传输语法
pub fn lookup(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = trim_uid(uid);
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| PacsError::DicomParseError(format!("不支持的传输语法: {}", uid)))
}

/// DICOM传输语法管理器
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferSyntaxManager;

impl TransferSyntaxManager {
    /// 创建新的传输语法管理器
    pub fn new() -> Self {
        Self
    }

    /// 检查传输语法是否支持（可解析并原样存储）
    pub fn is_supported(&self, uid: &str) -> bool {
        let uid = trim_uid(uid);
        let accepted = uid == IMPLICIT_VR_LITTLE_ENDIAN
            || uid == EXPLICIT_VR_LITTLE_ENDIAN
            || self.is_compressed(uid);
        accepted && TransferSyntaxRegistry.get(uid).is_some()
    }

    /// 检查传输语法是否为封装(压缩)格式
    pub fn is_compressed(&self, uid: &str) -> bool {
        ENCAPSULATED.contains(&trim_uid(uid))
    }

    /// 从提议列表中选择第一个支持的传输语法
    pub fn select<'a>(&self, proposed: &'a [String]) -> Option<&'a String> {
        proposed.iter().find(|uid| self.is_supported(uid))
    }
}

//! DICOM上层协议PDU编解码
//!
//! PDU头部的长度字段一律为大端序；P-DATA-TF内部承载的DIMSE命令集为小端序（见`dimse`模块）。
//! 本模块只做纯字节变换，不涉及任何IO。

use bytes::{BufMut, Bytes, BytesMut};
use pacs_core::{PacsError, Result};
use tokio_util::codec::{Decoder, Encoder};

use crate::dimse::CommandSet;
use crate::transfer_syntax::transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN;
use crate::uids;

pub const PDU_ASSOCIATE_RQ: u8 = 0x01;
pub const PDU_ASSOCIATE_AC: u8 = 0x02;
pub const PDU_ASSOCIATE_RJ: u8 = 0x03;
pub const PDU_P_DATA_TF: u8 = 0x04;
pub const PDU_RELEASE_RQ: u8 = 0x05;
pub const PDU_RELEASE_RP: u8 = 0x06;
pub const PDU_ABORT: u8 = 0x07;

/// PDU头部：类型(1) + 保留(1) + 长度(4)
pub const PDU_HEADER_LEN: usize = 6;
/// 最短的合法PDU（释放/中止/拒绝）长度
pub const MIN_PDU_LEN: usize = 10;
/// AE标题字段固定长度
pub const AE_TITLE_LEN: usize = 16;
/// 默认最大PDU长度
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16384;
/// 单个PDU的硬上限，防止恶意长度导致内存耗尽
pub const MAX_FRAME_LENGTH: usize = 32 * 1024 * 1024;
/// SCU端使用的唯一表示上下文ID
pub const PRESENTATION_CONTEXT_ID: u8 = 1;

const PROTOCOL_VERSION: u16 = 0x0001;
/// 协议版本(2) + 保留(2) + 被叫AE(16) + 主叫AE(16) + 保留(32)
const ASSOCIATE_FIXED_LEN: usize = 68;

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const SUB_ITEM_MAX_LENGTH: u8 = 0x51;
const SUB_ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const SUB_ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

/// 根据首字节对收到的PDU分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduKind {
    AssociateAccept,
    AssociateReject,
    DataTransfer,
    ReleaseRequest,
    ReleaseResponse,
    Abort,
    Malformed,
}

/// 对任意字节序列分类（全函数，不会失败）
pub fn classify(bytes: &[u8]) -> PduKind {
    if bytes.len() < MIN_PDU_LEN {
        return PduKind::Malformed;
    }
    match bytes[0] {
        PDU_ASSOCIATE_AC => PduKind::AssociateAccept,
        PDU_ASSOCIATE_RJ => PduKind::AssociateReject,
        PDU_P_DATA_TF => PduKind::DataTransfer,
        PDU_RELEASE_RQ => PduKind::ReleaseRequest,
        PDU_RELEASE_RP => PduKind::ReleaseResponse,
        PDU_ABORT => PduKind::Abort,
        _ => PduKind::Malformed,
    }
}

/// 表示上下文结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResult {
    pub fn code(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            3 => Self::AbstractSyntaxNotSupported,
            4 => Self::TransferSyntaxesNotSupported,
            _ => Self::NoReason,
        }
    }
}

/// 关联请求中提议的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposal {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// 关联响应中对表示上下文的答复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextAnswer {
    pub id: u8,
    pub result: PresentationContextResult,
    pub transfer_syntax: Option<String>,
}

/// A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRequest {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub presentation_contexts: Vec<PresentationContextProposal>,
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
}

impl AssociateRequest {
    /// 单一表示上下文、隐式VR小端传输语法的关联请求
    pub fn new(calling_ae_title: &str, called_ae_title: &str, abstract_syntax: &str) -> Self {
        Self {
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            presentation_contexts: vec![PresentationContextProposal {
                id: PRESENTATION_CONTEXT_ID,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
            }],
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: Some(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
        }
    }

    /// 替换唯一表示上下文的传输语法列表
    pub fn with_transfer_syntaxes(mut self, transfer_syntaxes: Vec<String>) -> Self {
        if let Some(context) = self.presentation_contexts.first_mut() {
            context.transfer_syntaxes = transfer_syntaxes;
        }
        self
    }

    pub fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut items = BytesMut::new();
        put_item(&mut items, ITEM_APPLICATION_CONTEXT, uids::APPLICATION_CONTEXT_NAME.as_bytes())?;

        for context in &self.presentation_contexts {
            let mut body = BytesMut::new();
            body.put_u8(context.id);
            body.put_bytes(0, 3);
            put_item(&mut body, ITEM_ABSTRACT_SYNTAX, context.abstract_syntax.as_bytes())?;
            for transfer_syntax in &context.transfer_syntaxes {
                put_item(&mut body, ITEM_TRANSFER_SYNTAX, transfer_syntax.as_bytes())?;
            }
            put_item(&mut items, ITEM_PRESENTATION_CONTEXT_RQ, &body)?;
        }

        put_user_information(
            &mut items,
            self.max_pdu_length,
            &self.implementation_class_uid,
            self.implementation_version_name.as_deref(),
        )?;

        encode_associate(
            PDU_ASSOCIATE_RQ,
            &self.called_ae_title,
            &self.calling_ae_title,
            &items,
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let fixed = AssociateFixed::parse(bytes, PDU_ASSOCIATE_RQ)?;
        let mut request = Self {
            calling_ae_title: fixed.calling_ae_title,
            called_ae_title: fixed.called_ae_title,
            presentation_contexts: Vec::new(),
            max_pdu_length: 0,
            implementation_class_uid: String::new(),
            implementation_version_name: None,
        };

        for (item_type, value) in ItemIter::new(fixed.items) {
            let value = value?;
            match item_type {
                ITEM_PRESENTATION_CONTEXT_RQ => {
                    if value.len() < 4 {
                        return Err(malformed("表示上下文项过短"));
                    }
                    let mut proposal = PresentationContextProposal {
                        id: value[0],
                        abstract_syntax: String::new(),
                        transfer_syntaxes: Vec::new(),
                    };
                    for (sub_type, sub_value) in ItemIter::new(&value[4..]) {
                        let sub_value = sub_value?;
                        match sub_type {
                            ITEM_ABSTRACT_SYNTAX => proposal.abstract_syntax = uid_string(sub_value),
                            ITEM_TRANSFER_SYNTAX => proposal.transfer_syntaxes.push(uid_string(sub_value)),
                            _ => {}
                        }
                    }
                    request.presentation_contexts.push(proposal);
                }
                ITEM_USER_INFORMATION => {
                    let info = UserInformation::parse(value)?;
                    request.max_pdu_length = info.max_pdu_length;
                    request.implementation_class_uid = info.implementation_class_uid;
                    request.implementation_version_name = info.implementation_version_name;
                }
                _ => {}
            }
        }
        Ok(request)
    }
}

/// 编码A-ASSOCIATE-RQ（单一抽象语法）
pub fn encode_associate_request(calling_ae: &str, called_ae: &str, abstract_syntax: &str) -> Result<Bytes> {
    AssociateRequest::new(calling_ae, called_ae, abstract_syntax).encode()
}

/// 解码A-ASSOCIATE-RQ，AE标题去除尾部填充
pub fn decode_associate_request(bytes: &[u8]) -> Result<AssociateRequest> {
    AssociateRequest::decode(bytes)
}

/// A-ASSOCIATE-AC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAccept {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub presentation_contexts: Vec<PresentationContextAnswer>,
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
}

impl AssociateAccept {
    pub fn encode(&self) -> Result<Bytes> {
        let mut items = BytesMut::new();
        put_item(&mut items, ITEM_APPLICATION_CONTEXT, uids::APPLICATION_CONTEXT_NAME.as_bytes())?;

        for answer in &self.presentation_contexts {
            let mut body = BytesMut::new();
            body.put_u8(answer.id);
            body.put_u8(0);
            body.put_u8(answer.result.code());
            body.put_u8(0);
            // 未接受时传输语法子项无意义，但标准要求存在
            let transfer_syntax = answer.transfer_syntax.as_deref().unwrap_or(IMPLICIT_VR_LITTLE_ENDIAN);
            put_item(&mut body, ITEM_TRANSFER_SYNTAX, transfer_syntax.as_bytes())?;
            put_item(&mut items, ITEM_PRESENTATION_CONTEXT_AC, &body)?;
        }

        put_user_information(
            &mut items,
            self.max_pdu_length,
            &self.implementation_class_uid,
            Some(uids::IMPLEMENTATION_VERSION_NAME),
        )?;

        encode_associate(
            PDU_ASSOCIATE_AC,
            &self.called_ae_title,
            &self.calling_ae_title,
            &items,
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let fixed = AssociateFixed::parse(bytes, PDU_ASSOCIATE_AC)?;
        let mut accept = Self {
            calling_ae_title: fixed.calling_ae_title,
            called_ae_title: fixed.called_ae_title,
            presentation_contexts: Vec::new(),
            max_pdu_length: 0,
            implementation_class_uid: String::new(),
        };

        for (item_type, value) in ItemIter::new(fixed.items) {
            let value = value?;
            match item_type {
                ITEM_PRESENTATION_CONTEXT_AC => {
                    if value.len() < 4 {
                        return Err(malformed("表示上下文应答项过短"));
                    }
                    let mut transfer_syntax = None;
                    for (sub_type, sub_value) in ItemIter::new(&value[4..]) {
                        let sub_value = sub_value?;
                        if sub_type == ITEM_TRANSFER_SYNTAX {
                            transfer_syntax = Some(uid_string(sub_value));
                        }
                    }
                    accept.presentation_contexts.push(PresentationContextAnswer {
                        id: value[0],
                        result: PresentationContextResult::from_code(value[2]),
                        transfer_syntax,
                    });
                }
                ITEM_USER_INFORMATION => {
                    let info = UserInformation::parse(value)?;
                    accept.max_pdu_length = info.max_pdu_length;
                    accept.implementation_class_uid = info.implementation_class_uid;
                }
                _ => {}
            }
        }
        Ok(accept)
    }

    /// 查找指定ID的表示上下文答复
    pub fn context(&self, id: u8) -> Option<&PresentationContextAnswer> {
        self.presentation_contexts.iter().find(|c| c.id == id)
    }
}

/// 编码A-ASSOCIATE-AC（SCP端使用）
pub fn encode_associate_accept(accept: &AssociateAccept) -> Result<Bytes> {
    accept.encode()
}

/// 解码对端的A-ASSOCIATE-AC
pub fn decode_associate_accept(bytes: &[u8]) -> Result<AssociateAccept> {
    AssociateAccept::decode(bytes)
}

/// A-ASSOCIATE-RJ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateReject {
    /// 1 = 永久拒绝, 2 = 临时拒绝
    pub result: u8,
    /// 1 = 服务用户, 2 = 服务提供者(ACSE), 3 = 服务提供者(表示层)
    pub source: u8,
    pub reason: u8,
}

impl AssociateReject {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_PDU_LEN);
        buf.put_u8(PDU_ASSOCIATE_RJ);
        buf.put_u8(0);
        buf.put_u32(4);
        buf.put_u8(0);
        buf.put_u8(self.result);
        buf.put_u8(self.source);
        buf.put_u8(self.reason);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = pdu_body(bytes, PDU_ASSOCIATE_RJ)?;
        if body.len() < 4 {
            return Err(malformed("A-ASSOCIATE-RJ过短"));
        }
        Ok(Self {
            result: body[1],
            source: body[2],
            reason: body[3],
        })
    }
}

impl std::fmt::Display for AssociateReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = if self.result == 1 { "permanent" } else { "transient" };
        let reason = match (self.source, self.reason) {
            (1, 2) => "application context name not supported",
            (1, 3) => "calling AE title not recognized",
            (1, 7) => "called AE title not recognized",
            (2, 2) => "protocol version not supported",
            (3, 1) => "temporary congestion",
            (3, 2) => "local limit exceeded",
            _ => "no reason given",
        };
        write!(f, "{} rejection (source {}, reason {}: {})", result, self.source, self.reason, reason)
    }
}

/// 编码A-ASSOCIATE-RJ（SCP端使用）
pub fn encode_associate_reject(result: u8, source: u8, reason: u8) -> Bytes {
    AssociateReject { result, source, reason }.encode()
}

/// 解码对端的A-ASSOCIATE-RJ
pub fn decode_associate_reject(bytes: &[u8]) -> Result<AssociateReject> {
    AssociateReject::decode(bytes)
}

/// A-ABORT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPdu {
    /// 0 = 服务用户, 2 = 服务提供者
    pub source: u8,
    pub reason: u8,
}

impl AbortPdu {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = pdu_body(bytes, PDU_ABORT)?;
        if body.len() < 4 {
            return Err(malformed("A-ABORT过短"));
        }
        Ok(Self {
            source: body[2],
            reason: body[3],
        })
    }
}

/// 解码A-ABORT
pub fn decode_abort(bytes: &[u8]) -> Result<AbortPdu> {
    AbortPdu::decode(bytes)
}

/// 编码A-ABORT
pub fn encode_abort(source: u8, reason: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_PDU_LEN);
    buf.put_u8(PDU_ABORT);
    buf.put_u8(0);
    buf.put_u32(4);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(source);
    buf.put_u8(reason);
    buf.freeze()
}

/// 编码A-RELEASE-RQ：固定10字节
pub fn encode_release_request() -> Bytes {
    fixed_release(PDU_RELEASE_RQ)
}

/// 编码A-RELEASE-RP：固定10字节
pub fn encode_release_response() -> Bytes {
    fixed_release(PDU_RELEASE_RP)
}

fn fixed_release(pdu_type: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_PDU_LEN);
    buf.put_u8(pdu_type);
    buf.put_u8(0);
    buf.put_u32(4);
    buf.put_u32(0);
    buf.freeze()
}

/// 表示数据值(PDV)项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdv {
    pub context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Bytes,
}

impl Pdv {
    fn control_header(&self) -> u8 {
        (self.is_command as u8) | ((self.is_last as u8) << 1)
    }
}

/// 将若干PDV封装为一个P-DATA-TF
pub fn encode_pdata(pdvs: &[Pdv]) -> Bytes {
    let body_len: usize = pdvs.iter().map(|p| 6 + p.data.len()).sum();
    let mut buf = BytesMut::with_capacity(PDU_HEADER_LEN + body_len);
    buf.put_u8(PDU_P_DATA_TF);
    buf.put_u8(0);
    buf.put_u32(body_len as u32);
    for pdv in pdvs {
        // 项长度包含上下文ID与控制头两个字节
        buf.put_u32((pdv.data.len() + 2) as u32);
        buf.put_u8(pdv.context_id);
        buf.put_u8(pdv.control_header());
        buf.put_slice(&pdv.data);
    }
    buf.freeze()
}

/// 解析P-DATA-TF中的全部PDV
pub fn decode_pdata(bytes: &[u8]) -> Result<Vec<Pdv>> {
    let mut body = pdu_body(bytes, PDU_P_DATA_TF)?;
    let mut pdvs = Vec::new();
    while !body.is_empty() {
        if body.len() < 6 {
            return Err(malformed("PDV项头部被截断"));
        }
        let item_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if item_len < 2 || body.len() < 4 + item_len {
            return Err(malformed("PDV项长度无效"));
        }
        let context_id = body[4];
        let control = body[5];
        pdvs.push(Pdv {
            context_id,
            is_command: control & 0x01 != 0,
            is_last: control & 0x02 != 0,
            data: Bytes::copy_from_slice(&body[6..4 + item_len]),
        });
        body = &body[4 + item_len..];
    }
    Ok(pdvs)
}

/// 将DIMSE命令集封装为单个P-DATA-TF（命令集始终很小，不分片）
pub fn encode_command(context_id: u8, command: &CommandSet) -> Result<Bytes> {
    let encoded = command.encode()?;
    Ok(encode_pdata(&[Pdv {
        context_id,
        is_command: true,
        is_last: true,
        data: Bytes::from(encoded),
    }]))
}

/// 按对端最大PDU长度对数据集分片
pub fn encode_data(context_id: u8, payload: &[u8], max_pdu_length: u32) -> Vec<Bytes> {
    let max_pdu_length = if max_pdu_length == 0 {
        DEFAULT_MAX_PDU_LENGTH
    } else {
        max_pdu_length
    } as usize;
    // 每个PDU只放一个PDV：4字节项长度 + 上下文ID + 控制头
    let chunk_size = max_pdu_length.saturating_sub(6).max(1);

    if payload.is_empty() {
        return vec![encode_pdata(&[Pdv {
            context_id,
            is_command: false,
            is_last: true,
            data: Bytes::new(),
        }])];
    }

    let chunks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            encode_pdata(&[Pdv {
                context_id,
                is_command: false,
                is_last: index + 1 == count,
                data: Bytes::copy_from_slice(chunk),
            }])
        })
        .collect()
}

/// 从字节流中切分完整PDU的编解码器
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_frame_length: usize,
}

impl PduCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}

impl Decoder for PduCodec {
    type Item = Bytes;
    type Error = PacsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let pdu_length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if pdu_length > self.max_frame_length {
            return Err(PacsError::Dicom(format!(
                "PDU长度 {} 超过上限 {}",
                pdu_length, self.max_frame_length
            )));
        }

        let total_length = PDU_HEADER_LEN + pdu_length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total_length).freeze()))
    }
}

impl Encoder<Bytes> for PduCodec {
    type Error = PacsError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

// ---------- 内部工具 ----------

fn malformed(message: &str) -> PacsError {
    PacsError::Dicom(format!("PDU格式错误: {}", message))
}

/// 校验PDU类型与长度，返回可变长度部分
fn pdu_body(bytes: &[u8], expected_type: u8) -> Result<&[u8]> {
    if bytes.len() < PDU_HEADER_LEN {
        return Err(malformed("缓冲区短于PDU头部"));
    }
    if bytes[0] != expected_type {
        return Err(malformed(&format!(
            "期望PDU类型 0x{:02X}，实际为 0x{:02X}",
            expected_type, bytes[0]
        )));
    }
    let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    bytes
        .get(PDU_HEADER_LEN..PDU_HEADER_LEN + length)
        .ok_or_else(|| malformed("PDU长度字段超出缓冲区"))
}

/// 校验并填充AE标题为16字节
fn ae_title_field(ae_title: &str) -> Result<[u8; AE_TITLE_LEN]> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty() {
        return Err(PacsError::Encoding("AE标题不能为空".to_string()));
    }
    if ae_title.len() > AE_TITLE_LEN {
        return Err(PacsError::Encoding(format!(
            "AE标题 {:?} 超过{}个字符",
            ae_title, AE_TITLE_LEN
        )));
    }
    if !ae_title.bytes().all(|b| (0x20..0x7F).contains(&b) && b != b'\\') {
        return Err(PacsError::Encoding(format!("AE标题 {:?} 含非法字符", ae_title)));
    }
    let mut field = [b' '; AE_TITLE_LEN];
    field[..ae_title.len()].copy_from_slice(ae_title.as_bytes());
    Ok(field)
}

fn ae_title_string(field: &[u8]) -> String {
    String::from_utf8_lossy(field).trim().to_string()
}

fn uid_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

fn put_item(buf: &mut BytesMut, item_type: u8, value: &[u8]) -> Result<()> {
    let length = u16::try_from(value.len())
        .map_err(|_| PacsError::Encoding(format!("PDU项 0x{:02X} 超过65535字节", item_type)))?;
    buf.put_u8(item_type);
    buf.put_u8(0);
    buf.put_u16(length);
    buf.put_slice(value);
    Ok(())
}

fn put_user_information(
    buf: &mut BytesMut,
    max_pdu_length: u32,
    implementation_class_uid: &str,
    implementation_version_name: Option<&str>,
) -> Result<()> {
    let mut body = BytesMut::new();
    put_item(&mut body, SUB_ITEM_MAX_LENGTH, &max_pdu_length.to_be_bytes())?;
    put_item(&mut body, SUB_ITEM_IMPLEMENTATION_CLASS_UID, implementation_class_uid.as_bytes())?;
    if let Some(name) = implementation_version_name {
        put_item(&mut body, SUB_ITEM_IMPLEMENTATION_VERSION_NAME, name.as_bytes())?;
    }
    put_item(buf, ITEM_USER_INFORMATION, &body)
}

fn encode_associate(pdu_type: u8, called_ae: &str, calling_ae: &str, items: &[u8]) -> Result<Bytes> {
    let called = ae_title_field(called_ae)?;
    let calling = ae_title_field(calling_ae)?;
    let length = ASSOCIATE_FIXED_LEN + items.len();

    let mut buf = BytesMut::with_capacity(PDU_HEADER_LEN + length);
    buf.put_u8(pdu_type);
    buf.put_u8(0);
    buf.put_u32(length as u32);
    buf.put_u16(PROTOCOL_VERSION);
    buf.put_u16(0);
    buf.put_slice(&called);
    buf.put_slice(&calling);
    buf.put_bytes(0, 32);
    buf.put_slice(items);
    Ok(buf.freeze())
}

struct AssociateFixed<'a> {
    called_ae_title: String,
    calling_ae_title: String,
    items: &'a [u8],
}

impl<'a> AssociateFixed<'a> {
    fn parse(bytes: &'a [u8], expected_type: u8) -> Result<Self> {
        let body = pdu_body(bytes, expected_type)?;
        if body.len() < ASSOCIATE_FIXED_LEN {
            return Err(malformed("关联PDU固定字段被截断"));
        }
        Ok(Self {
            called_ae_title: ae_title_string(&body[4..20]),
            calling_ae_title: ae_title_string(&body[20..36]),
            items: &body[ASSOCIATE_FIXED_LEN..],
        })
    }
}

struct UserInformation {
    max_pdu_length: u32,
    implementation_class_uid: String,
    implementation_version_name: Option<String>,
}

impl UserInformation {
    fn parse(value: &[u8]) -> Result<Self> {
        let mut info = Self {
            max_pdu_length: 0,
            implementation_class_uid: String::new(),
            implementation_version_name: None,
        };
        for (sub_type, sub_value) in ItemIter::new(value) {
            let sub_value = sub_value?;
            match sub_type {
                SUB_ITEM_MAX_LENGTH if sub_value.len() == 4 => {
                    info.max_pdu_length =
                        u32::from_be_bytes([sub_value[0], sub_value[1], sub_value[2], sub_value[3]]);
                }
                SUB_ITEM_IMPLEMENTATION_CLASS_UID => {
                    info.implementation_class_uid = uid_string(sub_value);
                }
                SUB_ITEM_IMPLEMENTATION_VERSION_NAME => {
                    info.implementation_version_name = Some(ae_title_string(sub_value));
                }
                _ => {}
            }
        }
        Ok(info)
    }
}

/// 遍历 `类型(1) 保留(1) 长度(2, 大端) 值` 结构的变长项
struct ItemIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> ItemIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = (u8, Result<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < 4 {
            self.failed = true;
            return Some((0, Err(malformed("变长项头部被截断"))));
        }
        let item_type = self.buf[0];
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + length {
            self.failed = true;
            return Some((item_type, Err(malformed("变长项长度超出缓冲区"))));
        }
        let value = &self.buf[4..4 + length];
        self.buf = &self.buf[4 + length..];
        Some((item_type, Ok(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{CommandField, CommandSet};
    use crate::transfer_syntax::transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN;

    #[test]
    fn test_associate_request_layout() {
        let pdu = encode_associate_request("GATEWAY", "PACS", uids::VERIFICATION).unwrap();

        assert_eq!(pdu[0], PDU_ASSOCIATE_RQ);
        let length = u32::from_be_bytes([pdu[2], pdu[3], pdu[4], pdu[5]]) as usize;
        assert_eq!(length + PDU_HEADER_LEN, pdu.len());
        assert_eq!(&pdu[6..8], &[0x00, 0x01]);
        // 被叫AE在前，主叫AE在后，均以空格填充到16字节
        assert_eq!(&pdu[10..26], b"PACS            ");
        assert_eq!(&pdu[26..42], b"GATEWAY         ");
        assert!(pdu[42..74].iter().all(|b| *b == 0));
        assert_eq!(pdu[74], ITEM_APPLICATION_CONTEXT);
    }

    #[test]
    fn test_associate_request_round_trip() {
        for (calling, called) in [("A", "B"), ("SIXTEEN_CHARS_AE", "PACS_ARCHIVE_01"), ("GW 1", "X")] {
            let pdu = encode_associate_request(calling, called, uids::STUDY_ROOT_FIND).unwrap();
            let decoded = decode_associate_request(&pdu).unwrap();
            assert_eq!(decoded.calling_ae_title, calling);
            assert_eq!(decoded.called_ae_title, called);
            assert_eq!(decoded.presentation_contexts.len(), 1);
            assert_eq!(decoded.presentation_contexts[0].abstract_syntax, uids::STUDY_ROOT_FIND);
            assert_eq!(
                decoded.presentation_contexts[0].transfer_syntaxes,
                vec![IMPLICIT_VR_LITTLE_ENDIAN.to_string()]
            );
            assert_eq!(decoded.max_pdu_length, DEFAULT_MAX_PDU_LENGTH);
            assert_eq!(decoded.implementation_class_uid, uids::IMPLEMENTATION_CLASS_UID);
        }
    }

    #[test]
    fn test_oversized_ae_title_is_encoding_error() {
        let err = encode_associate_request("THIS_AE_IS_TOO_LONG", "PACS", uids::VERIFICATION).unwrap_err();
        assert!(matches!(err, PacsError::Encoding(_)));
        let err = encode_associate_request("GW", "", uids::VERIFICATION).unwrap_err();
        assert!(matches!(err, PacsError::Encoding(_)));
    }

    #[test]
    fn test_associate_accept_round_trip() {
        let accept = AssociateAccept {
            calling_ae_title: "GATEWAY".into(),
            called_ae_title: "PACS".into(),
            presentation_contexts: vec![
                PresentationContextAnswer {
                    id: 1,
                    result: PresentationContextResult::Acceptance,
                    transfer_syntax: Some(EXPLICIT_VR_LITTLE_ENDIAN.into()),
                },
                PresentationContextAnswer {
                    id: 3,
                    result: PresentationContextResult::AbstractSyntaxNotSupported,
                    transfer_syntax: None,
                },
            ],
            max_pdu_length: 32768,
            implementation_class_uid: "1.2.3.4".into(),
        };
        let pdu = accept.encode().unwrap();
        assert_eq!(classify(&pdu), PduKind::AssociateAccept);

        let decoded = AssociateAccept::decode(&pdu).unwrap();
        assert_eq!(decoded.max_pdu_length, 32768);
        assert_eq!(decoded.context(1).unwrap().result, PresentationContextResult::Acceptance);
        assert_eq!(
            decoded.context(1).unwrap().transfer_syntax.as_deref(),
            Some(EXPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(
            decoded.context(3).unwrap().result,
            PresentationContextResult::AbstractSyntaxNotSupported
        );
    }

    #[test]
    fn test_classify_is_total() {
        assert_eq!(classify(&[]), PduKind::Malformed);
        assert_eq!(classify(&[0x02; 9]), PduKind::Malformed);
        assert_eq!(classify(&[0x01; 10]), PduKind::Malformed);
        assert_eq!(classify(&[0xFF; 64]), PduKind::Malformed);

        let expected = [
            (0x02, PduKind::AssociateAccept),
            (0x03, PduKind::AssociateReject),
            (0x04, PduKind::DataTransfer),
            (0x05, PduKind::ReleaseRequest),
            (0x06, PduKind::ReleaseResponse),
            (0x07, PduKind::Abort),
        ];
        for (byte, kind) in expected {
            let mut buf = vec![0u8; 10];
            buf[0] = byte;
            assert_eq!(classify(&buf), kind);
        }

        for first in 0u8..=255 {
            let kind = classify(&[first; 12]);
            let known = (0x02..=0x07).contains(&first);
            assert_eq!(kind == PduKind::Malformed, !known);
        }
    }

    #[test]
    fn test_release_request_is_fixed_ten_bytes() {
        let pdu = encode_release_request();
        assert_eq!(&pdu[..], &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(classify(&encode_release_response()), PduKind::ReleaseResponse);
    }

    #[test]
    fn test_reject_and_abort_decoding() {
        let reject = AssociateReject { result: 1, source: 1, reason: 7 };
        let pdu = reject.encode();
        assert_eq!(classify(&pdu), PduKind::AssociateReject);
        assert_eq!(AssociateReject::decode(&pdu).unwrap(), reject);
        assert!(reject.to_string().contains("called AE title not recognized"));

        let abort = encode_abort(2, 6);
        assert_eq!(AbortPdu::decode(&abort).unwrap(), AbortPdu { source: 2, reason: 6 });
    }

    #[test]
    fn test_command_pdu_mixes_endianness() {
        let command = CommandSet::new(CommandField::CEchoRq, 7, false)
            .with_affected_sop_class(uids::VERIFICATION);
        let pdu = encode_command(PRESENTATION_CONTEXT_ID, &command).unwrap();

        assert_eq!(pdu[0], PDU_P_DATA_TF);
        // PDU长度：大端
        let pdu_len = u32::from_be_bytes([pdu[2], pdu[3], pdu[4], pdu[5]]) as usize;
        assert_eq!(pdu_len + PDU_HEADER_LEN, pdu.len());
        // PDV项长度：大端；控制头：命令+最后分片
        let item_len = u32::from_be_bytes([pdu[6], pdu[7], pdu[8], pdu[9]]) as usize;
        assert_eq!(item_len, pdu_len - 4);
        assert_eq!(pdu[10], PRESENTATION_CONTEXT_ID);
        assert_eq!(pdu[11], 0x03);
        // 命令集第一个元素(0000,0000)：小端
        assert_eq!(&pdu[12..16], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&pdu[16..20], &[0x04, 0x00, 0x00, 0x00]);

        let pdvs = decode_pdata(&pdu).unwrap();
        let decoded = CommandSet::decode(&pdvs[0].data).unwrap();
        assert_eq!(decoded.command_field, CommandField::CEchoRq);
        assert_eq!(decoded.message_id, Some(7));
        assert!(!decoded.has_data_set());
    }

    #[test]
    fn test_data_fragmentation() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let pdus = encode_data(1, &payload, 256);
        assert_eq!(pdus.len(), 4); // 每片250字节

        let mut reassembled = Vec::new();
        for (index, pdu) in pdus.iter().enumerate() {
            assert!(pdu.len() - PDU_HEADER_LEN <= 256);
            let pdvs = decode_pdata(pdu).unwrap();
            assert_eq!(pdvs.len(), 1);
            assert!(!pdvs[0].is_command);
            assert_eq!(pdvs[0].is_last, index == pdus.len() - 1);
            reassembled.extend_from_slice(&pdvs[0].data);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_codec_framing() {
        let mut codec = PduCodec::default();
        let release = encode_release_request();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&release[..4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&release[4..]);
        buf.extend_from_slice(&encode_release_response());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), release);
        assert_eq!(classify(&codec.decode(&mut buf).unwrap().unwrap()), PduKind::ReleaseResponse);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_frames() {
        let mut codec = PduCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x04, 0x00, 0x00, 0x01, 0x00, 0x00]);
        assert!(codec.decode(&mut buf).is_err());
    }
}

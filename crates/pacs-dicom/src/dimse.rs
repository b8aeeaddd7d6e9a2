//! DIMSE消息处理
//!
//! 命令集固定使用隐式VR小端编码，全部元素位于0000组，并以(0000,0000)组长度开头。

use bytes::{BufMut, Bytes, BytesMut};
use pacs_core::{PacsError, Result};

use crate::pdu::Pdv;

// 命令组元素号（组号恒为0x0000）
const COMMAND_GROUP_LENGTH: u16 = 0x0000;
const AFFECTED_SOP_CLASS_UID: u16 = 0x0002;
const COMMAND_FIELD: u16 = 0x0100;
const MESSAGE_ID: u16 = 0x0110;
const MESSAGE_ID_BEING_RESPONDED_TO: u16 = 0x0120;
const MOVE_DESTINATION: u16 = 0x0600;
const PRIORITY: u16 = 0x0700;
const COMMAND_DATA_SET_TYPE: u16 = 0x0800;
const STATUS: u16 = 0x0900;
const ERROR_COMMENT: u16 = 0x0902;
const AFFECTED_SOP_INSTANCE_UID: u16 = 0x1000;
const REMAINING_SUB_OPERATIONS: u16 = 0x1020;
const COMPLETED_SUB_OPERATIONS: u16 = 0x1021;
const FAILED_SUB_OPERATIONS: u16 = 0x1022;
const WARNING_SUB_OPERATIONS: u16 = 0x1023;

/// 命令数据集类型：无数据集
pub const DATA_SET_ABSENT: u16 = 0x0101;
/// 命令数据集类型：有数据集（0x0101以外的任意值）
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// DICOM命令字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
    Unknown(u16),
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::CCancelRq => 0x0FFF,
            CommandField::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            other => CommandField::Unknown(other),
        }
    }

    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// 请求对应的响应命令
    pub fn response(self) -> Self {
        Self::from_code(self.code() | 0x8000)
    }
}

/// 请求优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Medium,
    High,
    Low,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }
}

/// DIMSE状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    Success,
    Pending(u16),
    Cancel,
    Warning(u16),
    Failure(u16),
}

impl DimseStatus {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const CANCEL: u16 = 0xFE00;
    /// 无法识别的操作
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    /// 存储空间不足
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    /// 数据集与SOP类不匹配
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending(code),
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            other => DimseStatus::Failure(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            DimseStatus::Success => Self::SUCCESS,
            DimseStatus::Cancel => Self::CANCEL,
            DimseStatus::Pending(code) | DimseStatus::Warning(code) | DimseStatus::Failure(code) => code,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, DimseStatus::Pending(_))
    }

    /// 成功或警告都视为操作完成
    pub fn is_success(self) -> bool {
        matches!(self, DimseStatus::Success | DimseStatus::Warning(_))
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseStatus::Success => write!(f, "Success"),
            DimseStatus::Pending(code) => write!(f, "Pending (0x{:04X})", code),
            DimseStatus::Cancel => write!(f, "Cancel"),
            DimseStatus::Warning(code) => write!(f, "Warning (0x{:04X})", code),
            DimseStatus::Failure(code) => write!(f, "Failure (0x{:04X})", code),
        }
    }
}

/// DICOM命令集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub move_destination: Option<String>,
    pub priority: Option<u16>,
    pub data_set_type: u16,
    pub status: Option<u16>,
    pub error_comment: Option<String>,
    pub remaining_sub_operations: Option<u16>,
    pub completed_sub_operations: Option<u16>,
    pub failed_sub_operations: Option<u16>,
    pub warning_sub_operations: Option<u16>,
}

impl CommandSet {
    pub fn new(command_field: CommandField, message_id: u16, has_data_set: bool) -> Self {
        Self {
            command_field,
            message_id: Some(message_id),
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            move_destination: None,
            priority: if command_field.is_response() {
                None
            } else {
                Some(Priority::Medium.code())
            },
            data_set_type: if has_data_set { DATA_SET_PRESENT } else { DATA_SET_ABSENT },
            status: None,
            error_comment: None,
            remaining_sub_operations: None,
            completed_sub_operations: None,
            failed_sub_operations: None,
            warning_sub_operations: None,
        }
    }

    /// C-ECHO-RQ
    pub fn echo_request(message_id: u16) -> Self {
        Self::new(CommandField::CEchoRq, message_id, false)
            .with_affected_sop_class(crate::uids::VERIFICATION)
    }

    /// C-FIND-RQ，标识符数据集随后发送
    pub fn find_request(message_id: u16, sop_class_uid: &str) -> Self {
        Self::new(CommandField::CFindRq, message_id, true).with_affected_sop_class(sop_class_uid)
    }

    /// C-MOVE-RQ
    pub fn move_request(message_id: u16, sop_class_uid: &str, destination: &str) -> Self {
        let mut command =
            Self::new(CommandField::CMoveRq, message_id, true).with_affected_sop_class(sop_class_uid);
        command.move_destination = Some(destination.to_string());
        command
    }

    /// C-STORE-RQ
    pub fn store_request(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut command =
            Self::new(CommandField::CStoreRq, message_id, true).with_affected_sop_class(sop_class_uid);
        command.affected_sop_instance_uid = Some(sop_instance_uid.to_string());
        command
    }

    /// 针对请求构造响应命令（无数据集）
    pub fn response_to(request: &CommandSet, status: u16) -> Self {
        Self {
            command_field: request.command_field.response(),
            message_id: None,
            message_id_being_responded_to: request.message_id,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
            move_destination: None,
            priority: None,
            data_set_type: DATA_SET_ABSENT,
            status: Some(status),
            error_comment: None,
            remaining_sub_operations: None,
            completed_sub_operations: None,
            failed_sub_operations: None,
            warning_sub_operations: None,
        }
    }

    pub fn with_affected_sop_class(mut self, sop_class_uid: &str) -> Self {
        self.affected_sop_class_uid = Some(sop_class_uid.to_string());
        self
    }

    pub fn with_error_comment(mut self, comment: &str) -> Self {
        self.error_comment = Some(comment.to_string());
        self
    }

    pub fn has_data_set(&self) -> bool {
        self.data_set_type != DATA_SET_ABSENT
    }

    /// 响应状态，缺少状态元素时按失败处理
    pub fn status(&self) -> DimseStatus {
        match self.status {
            Some(code) => DimseStatus::from_code(code),
            None => DimseStatus::Failure(0xFFFF),
        }
    }

    /// 编码为隐式VR小端字节序列
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = BytesMut::new();

        if let Some(uid) = &self.affected_sop_class_uid {
            put_uid(&mut body, AFFECTED_SOP_CLASS_UID, uid);
        }
        put_us(&mut body, COMMAND_FIELD, self.command_field.code());
        if let Some(id) = self.message_id {
            put_us(&mut body, MESSAGE_ID, id);
        }
        if let Some(id) = self.message_id_being_responded_to {
            put_us(&mut body, MESSAGE_ID_BEING_RESPONDED_TO, id);
        }
        if let Some(destination) = &self.move_destination {
            if destination.is_empty() || destination.len() > 16 {
                return Err(PacsError::Encoding(format!(
                    "移动目标AE标题 {:?} 长度必须为1-16",
                    destination
                )));
            }
            put_text(&mut body, MOVE_DESTINATION, destination, b' ');
        }
        if let Some(priority) = self.priority {
            put_us(&mut body, PRIORITY, priority);
        }
        put_us(&mut body, COMMAND_DATA_SET_TYPE, self.data_set_type);
        if let Some(status) = self.status {
            put_us(&mut body, STATUS, status);
        }
        if let Some(comment) = &self.error_comment {
            put_text(&mut body, ERROR_COMMENT, comment, b' ');
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            put_uid(&mut body, AFFECTED_SOP_INSTANCE_UID, uid);
        }
        for (element, value) in [
            (REMAINING_SUB_OPERATIONS, self.remaining_sub_operations),
            (COMPLETED_SUB_OPERATIONS, self.completed_sub_operations),
            (FAILED_SUB_OPERATIONS, self.failed_sub_operations),
            (WARNING_SUB_OPERATIONS, self.warning_sub_operations),
        ] {
            if let Some(value) = value {
                put_us(&mut body, element, value);
            }
        }

        let mut buf = Vec::with_capacity(12 + body.len());
        put_header(&mut buf, COMMAND_GROUP_LENGTH, 4);
        buf.put_u32_le(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// 从隐式VR小端字节序列解码
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut command = Self::new(CommandField::Unknown(0), 0, false);
        command.message_id = None;
        command.priority = None;
        let mut saw_command_field = false;

        let mut rest = bytes;
        while !rest.is_empty() {
            if rest.len() < 8 {
                return Err(PacsError::Dicom("命令集元素头部被截断".to_string()));
            }
            let group = u16::from_le_bytes([rest[0], rest[1]]);
            let element = u16::from_le_bytes([rest[2], rest[3]]);
            let length = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            let value = rest
                .get(8..8 + length)
                .ok_or_else(|| PacsError::Dicom(format!("命令元素 ({:04X},{:04X}) 长度越界", group, element)))?;
            rest = &rest[8 + length..];

            if group != 0x0000 {
                continue;
            }
            match element {
                AFFECTED_SOP_CLASS_UID => command.affected_sop_class_uid = Some(text(value)),
                COMMAND_FIELD => {
                    command.command_field = CommandField::from_code(us(value)?);
                    saw_command_field = true;
                }
                MESSAGE_ID => command.message_id = Some(us(value)?),
                MESSAGE_ID_BEING_RESPONDED_TO => command.message_id_being_responded_to = Some(us(value)?),
                MOVE_DESTINATION => command.move_destination = Some(text(value)),
                PRIORITY => command.priority = Some(us(value)?),
                COMMAND_DATA_SET_TYPE => command.data_set_type = us(value)?,
                STATUS => command.status = Some(us(value)?),
                ERROR_COMMENT => command.error_comment = Some(text(value)),
                AFFECTED_SOP_INSTANCE_UID => command.affected_sop_instance_uid = Some(text(value)),
                REMAINING_SUB_OPERATIONS => command.remaining_sub_operations = Some(us(value)?),
                COMPLETED_SUB_OPERATIONS => command.completed_sub_operations = Some(us(value)?),
                FAILED_SUB_OPERATIONS => command.failed_sub_operations = Some(us(value)?),
                WARNING_SUB_OPERATIONS => command.warning_sub_operations = Some(us(value)?),
                _ => {}
            }
        }

        if !saw_command_field {
            return Err(PacsError::Dicom("命令集缺少Command Field".to_string()));
        }
        Ok(command)
    }
}

/// 完整的DIMSE消息：命令集加可选数据集
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub context_id: u8,
    pub command: CommandSet,
    pub data: Option<Bytes>,
}

/// 将PDV片段重组为DIMSE消息
#[derive(Debug, Default)]
pub struct DimseAssembler {
    context_id: u8,
    command_buf: BytesMut,
    data_buf: BytesMut,
    pending_command: Option<CommandSet>,
}

impl DimseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送入一个PDV；消息完整时返回
    pub fn push(&mut self, pdv: Pdv) -> Result<Option<DimseMessage>> {
        if pdv.is_command {
            if self.pending_command.is_some() {
                return Err(PacsError::Dicom("数据集未接收完毕时收到新的命令片段".to_string()));
            }
            self.context_id = pdv.context_id;
            self.command_buf.extend_from_slice(&pdv.data);
            if !pdv.is_last {
                return Ok(None);
            }

            let command = CommandSet::decode(&self.command_buf.split())?;
            if command.has_data_set() {
                self.pending_command = Some(command);
                return Ok(None);
            }
            return Ok(Some(DimseMessage {
                context_id: self.context_id,
                command,
                data: None,
            }));
        }

        if self.pending_command.is_none() {
            return Err(PacsError::Dicom("收到数据片段但没有对应的命令".to_string()));
        }
        self.data_buf.extend_from_slice(&pdv.data);
        if !pdv.is_last {
            return Ok(None);
        }

        let command = self
            .pending_command
            .take()
            .ok_or_else(|| PacsError::Internal("命令状态丢失".to_string()))?;
        Ok(Some(DimseMessage {
            context_id: self.context_id,
            command,
            data: Some(self.data_buf.split().freeze()),
        }))
    }
}

fn put_header(buf: &mut impl BufMut, element: u16, length: u32) {
    buf.put_u16_le(0x0000);
    buf.put_u16_le(element);
    buf.put_u32_le(length);
}

fn put_us(buf: &mut impl BufMut, element: u16, value: u16) {
    put_header(buf, element, 2);
    buf.put_u16_le(value);
}

fn put_uid(buf: &mut impl BufMut, element: u16, uid: &str) {
    put_text(buf, element, uid, 0);
}

/// 字符串值补齐到偶数长度
fn put_text(buf: &mut impl BufMut, element: u16, value: &str, padding: u8) {
    let padded = value.len() + value.len() % 2;
    put_header(buf, element, padded as u32);
    buf.put_slice(value.as_bytes());
    if padded > value.len() {
        buf.put_u8(padding);
    }
}

fn us(value: &[u8]) -> Result<u16> {
    if value.len() < 2 {
        return Err(PacsError::Dicom("US元素长度不足2字节".to_string()));
    }
    Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .trim_start()
        .to_string()
}

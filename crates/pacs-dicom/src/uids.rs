//! SOP类与应用上下文UID

/// DICOM应用上下文名称
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// 本实现的Implementation Class UID（UUID派生根）
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.205914387133958312430174251063416807041";

/// 本实现的版本名称（最长16字符）
pub const IMPLEMENTATION_VERSION_NAME: &str = "PACS_GW_010";

/// Verification SOP Class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

/// Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

/// Modality Worklist Information Model - FIND
pub const MODALITY_WORKLIST_FIND: &str = "1.2.840.10008.5.1.4.31";

/// 所有存储类SOP Class的公共前缀
pub const STORAGE_SOP_CLASS_PREFIX: &str = "1.2.840.10008.5.1.4.1.1.";

/// 是否为存储类SOP Class（CT、MR、CR、DX、US、二次采集等）
pub fn is_storage_sop_class(uid: &str) -> bool {
    uid.starts_with(STORAGE_SOP_CLASS_PREFIX)
}

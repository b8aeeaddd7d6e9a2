//! # DICOM服务模块
//!
//! 提供DICOM上层协议的实现：PDU编解码、DIMSE命令集、关联管理、
//! 出站C-FIND/C-MOVE/C-STORE，以及接收C-STORE的入站存储SCP。

pub mod association;
pub mod dataset;
pub mod dimse;
pub mod parser;
pub mod pdu;
pub mod scu;
pub mod server;
pub mod services;
pub mod transfer_syntax;
pub mod transport;
pub mod uids;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use association::{AssociationManager, AssociationState, ConnectOutcome, DimseRequest, PeerConfig};
pub use dataset::{Dataset, DatasetExt};
pub use dimse::{CommandField, CommandSet, DimseMessage, DimseStatus};
pub use parser::{DicomParser, ParsedDicomObject};
pub use scu::{DicomScu, MoveOutcome};
pub use server::{DicomServer, DicomServerConfig};
pub use services::{InstanceSink, ReceivedInstance, ServiceManager};
pub use transfer_syntax::TransferSyntaxManager;

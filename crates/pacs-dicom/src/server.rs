//! DICOM服务器实现（入站存储SCP）
//!
//! 接受Verification和存储类SOP的关联，把C-ECHO/C-STORE交给 [`ServiceManager`]。
//! 远端PACS执行C-MOVE时，影像就是通过这里回到网关的。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pacs_core::{PacsError, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dimse::DimseAssembler;
use crate::pdu::{
    self, AssociateAccept, AssociateRequest, PduCodec, PduKind, PresentationContextAnswer,
    PresentationContextResult,
};
use crate::services::{ScpRequest, ServiceManager};
use crate::transfer_syntax::TransferSyntaxManager;
use crate::uids;

/// DICOM服务器配置
#[derive(Debug, Clone)]
pub struct DicomServerConfig {
    pub ae_title: String,      // 应用实体标题
    pub bind_addr: String,     // 监听地址
    pub port: u16,             // 监听端口
    pub max_associations: u32, // 最大并发关联数
    pub storage_dir: PathBuf,  // 存储目录
    pub idle_timeout: Duration,
}

impl Default for DicomServerConfig {
    fn default() -> Self {
        Self {
            ae_title: "PACS_GATEWAY".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: 11113,
            max_associations: 16,
            storage_dir: PathBuf::from("./data/dicom"),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// DICOM服务器
pub struct DicomServer {
    config: DicomServerConfig,
    service_manager: ServiceManager,
    transfer_syntaxes: TransferSyntaxManager,
    limiter: Arc<Semaphore>,
}

impl DicomServer {
    /// 创建新的DICOM服务器
    pub async fn new(config: DicomServerConfig, service_manager: ServiceManager) -> Result<Self> {
        // 确保存储目录存在
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        let limiter = Arc::new(Semaphore::new(config.max_associations.max(1) as usize));
        Ok(Self {
            config,
            service_manager,
            transfer_syntaxes: TransferSyntaxManager::new(),
            limiter,
        })
    }

    pub fn config(&self) -> &DicomServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("DICOM服务器启动: AE={}, 地址={}", self.config.ae_title, listener.local_addr()?);
        Ok(listener)
    }

    /// 绑定端口并运行直到取消
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上接受连接
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DICOM服务器停止");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("接受连接: {}", remote_addr);
                        let permit = self.limiter.clone().try_acquire_owned().ok();
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, remote_addr, permit).await {
                                error!("处理连接失败: {}, 错误: {}", remote_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                    }
                }
            }
        }
    }

    /// 处理一条入站关联
    async fn handle_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, PduCodec::default());

        let Some(first) = self.next_frame(&mut framed).await? else {
            return Ok(());
        };
        if first.first() != Some(&pdu::PDU_ASSOCIATE_RQ) {
            framed.send(pdu::encode_abort(2, 2)).await?;
            return Err(PacsError::Dicom("期望A-ASSOCIATE-RQ".to_string()));
        }
        let request = pdu::decode_associate_request(&first)?;

        if permit.is_none() {
            warn!(remote = %remote_addr, limit = self.config.max_associations, "并发关联数已满，拒绝");
            framed.send(pdu::encode_associate_reject(2, 3, 2)).await?;
            return Ok(());
        }
        if request.called_ae_title != self.config.ae_title {
            warn!(called_ae = %request.called_ae_title, remote = %remote_addr, "被叫AE标题不匹配，拒绝");
            framed.send(pdu::encode_associate_reject(1, 1, 7)).await?;
            return Ok(());
        }

        let (accept, contexts) = self.negotiate(&request);
        if contexts.is_empty() {
            warn!(calling_ae = %request.calling_ae_title, "没有可接受的表示上下文");
        }
        framed.send(accept.encode()?).await?;
        info!(
            calling_ae = %request.calling_ae_title,
            remote = %remote_addr,
            accepted_contexts = contexts.len(),
            "接受入站关联"
        );

        let mut assembler = DimseAssembler::new();
        while let Some(frame) = self.next_frame(&mut framed).await? {
            match pdu::classify(&frame) {
                PduKind::DataTransfer => {
                    for pdv in pdu::decode_pdata(&frame)? {
                        let Some(message) = assembler.push(pdv)? else {
                            continue;
                        };
                        let Some(transfer_syntax_uid) = contexts.get(&message.context_id) else {
                            warn!(context_id = message.context_id, "收到未协商表示上下文上的消息，中止关联");
                            framed.send(pdu::encode_abort(2, 6)).await?;
                            return Ok(());
                        };

                        let context_id = message.context_id;
                        let scp_request = ScpRequest {
                            calling_ae_title: request.calling_ae_title.clone(),
                            peer: remote_addr,
                            transfer_syntax_uid: transfer_syntax_uid.clone(),
                            message,
                        };
                        let response = self.service_manager.handle_request(&scp_request).await;
                        framed.send(pdu::encode_command(context_id, &response)?).await?;
                    }
                }
                PduKind::ReleaseRequest => {
                    framed.send(pdu::encode_release_response()).await?;
                    debug!("关联已释放: {}", remote_addr);
                    break;
                }
                PduKind::Abort => {
                    debug!("对端中止关联: {}", remote_addr);
                    break;
                }
                other => {
                    warn!(pdu = ?other, "关联期间收到意外的PDU，中止");
                    framed.send(pdu::encode_abort(2, 2)).await?;
                    break;
                }
            }
        }

        drop(permit);
        Ok(())
    }

    /// 空闲超时内读取下一个PDU；连接关闭或超时返回None
    async fn next_frame(&self, framed: &mut Framed<TcpStream, PduCodec>) -> Result<Option<bytes::Bytes>> {
        match tokio::time::timeout(self.config.idle_timeout, framed.next()).await {
            Ok(Some(frame)) => frame.map(Some),
            Ok(None) => Ok(None),
            Err(_) => {
                warn!(timeout_ms = self.config.idle_timeout.as_millis() as u64, "入站关联空闲超时");
                let _ = framed.send(pdu::encode_abort(2, 0)).await;
                Ok(None)
            }
        }
    }

    /// 逐个表示上下文给出协商结果，返回已接受上下文的传输语法
    fn negotiate(&self, request: &AssociateRequest) -> (AssociateAccept, HashMap<u8, String>) {
        let mut accepted = HashMap::new();
        let answers = request
            .presentation_contexts
            .iter()
            .map(|context| {
                let supported = context.abstract_syntax == uids::VERIFICATION
                    || uids::is_storage_sop_class(&context.abstract_syntax);
                if !supported {
                    return PresentationContextAnswer {
                        id: context.id,
                        result: PresentationContextResult::AbstractSyntaxNotSupported,
                        transfer_syntax: None,
                    };
                }
                match self.transfer_syntaxes.select(&context.transfer_syntaxes) {
                    Some(transfer_syntax) => {
                        accepted.insert(context.id, transfer_syntax.clone());
                        PresentationContextAnswer {
                            id: context.id,
                            result: PresentationContextResult::Acceptance,
                            transfer_syntax: Some(transfer_syntax.clone()),
                        }
                    }
                    None => PresentationContextAnswer {
                        id: context.id,
                        result: PresentationContextResult::TransferSyntaxesNotSupported,
                        transfer_syntax: None,
                    },
                }
            })
            .collect();

        let accept = AssociateAccept {
            calling_ae_title: request.calling_ae_title.clone(),
            called_ae_title: request.called_ae_title.clone(),
            presentation_contexts: answers,
            max_pdu_length: pdu::DEFAULT_MAX_PDU_LENGTH,
            implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.to_string(),
        };
        (accept, accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationManager, DimseRequest, PeerConfig};
    use crate::dimse::{CommandSet, DimseStatus};
    use crate::parser::tests::{sample_dataset, CT_IMAGE_STORAGE};
    use crate::parser::DicomParser;
    use crate::services::{InstanceSink, ReceivedInstance};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        instances: Mutex<Vec<ReceivedInstance>>,
    }

    #[async_trait]
    impl InstanceSink for RecordingSink {
        async fn accept_instance(&self, instance: ReceivedInstance) -> Result<()> {
            self.instances.lock().await.push(instance);
            Ok(())
        }
    }

    struct Running {
        port: u16,
        shutdown: CancellationToken,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start_server(max_associations: u32) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let config = DicomServerConfig {
            ae_title: "GW_SCP".into(),
            bind_addr: "127.0.0.1".into(),
            port: 0,
            max_associations,
            storage_dir: dir.path().to_path_buf(),
            idle_timeout: Duration::from_secs(5),
        };
        let services = ServiceManager::with_storage(dir.path(), sink.clone());
        let server = Arc::new(DicomServer::new(config, services).await.unwrap());
        let listener = server.bind().await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));
        Running {
            port,
            shutdown,
            sink,
            _dir: dir,
        }
    }

    fn client_config(port: u16, called_ae_title: &str) -> PeerConfig {
        PeerConfig {
            calling_ae_title: "REMOTE_PACS".into(),
            called_ae_title: called_ae_title.into(),
            host: "127.0.0.1".into(),
            port,
            timeout_ms: 5_000,
            negotiation_timeout_ms: 2_000,
            release_timeout_ms: 1_000,
            ..PeerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_echo_against_server() {
        let server = start_server(4).await;
        let client = AssociationManager::new(client_config(server.port, "GW_SCP"));
        assert!(client.connect().await.echo_verified);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_store_reaches_sink() {
        let server = start_server(4).await;
        let client = AssociationManager::new(client_config(server.port, "GW_SCP"));
        assert!(client.connect().await.echo_verified);

        let request = DimseRequest::new(
            CT_IMAGE_STORAGE,
            CommandSet::store_request(0, CT_IMAGE_STORAGE, "1.2.3.4.5"),
        )
        .with_data(sample_dataset("1.2.3.4", "1.2.3.4.5"));
        let responses = client.exchange(request).await.unwrap();
        assert_eq!(responses.last().unwrap().command.status(), DimseStatus::Success);
        client.disconnect().await;

        let instances = server.sink.instances.lock().await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].calling_ae_title, "REMOTE_PACS");
        let file = tokio::fs::read(&instances[0].file_path).await.unwrap();
        let parsed = DicomParser::parse_bytes(&file).unwrap();
        assert_eq!(parsed.sop_instance_uid.as_deref(), Some("1.2.3.4.5"));
    }

    #[tokio::test]
    async fn test_unsupported_command_gets_unrecognized_status() {
        let server = start_server(4).await;
        let client = AssociationManager::new(client_config(server.port, "GW_SCP"));
        assert!(client.connect().await.echo_verified);

        // 在存储上下文上发送C-FIND
        let request = DimseRequest::new(CT_IMAGE_STORAGE, CommandSet::find_request(0, CT_IMAGE_STORAGE))
            .with_data(sample_dataset("1.2.3.4", "1.2.3.4.5"));
        let responses = client.exchange(request).await.unwrap();
        assert_eq!(responses.last().unwrap().command.status(), DimseStatus::Failure(0x0211));
    }

    #[tokio::test]
    async fn test_unknown_called_ae_is_rejected() {
        let server = start_server(4).await;
        let client = AssociationManager::new(client_config(server.port, "SOMEONE_ELSE"));
        let outcome = client.connect().await;
        assert!(!outcome.echo_verified);
    }

    #[tokio::test]
    async fn test_association_limit() {
        let server = start_server(1).await;
        let first = AssociationManager::new(client_config(server.port, "GW_SCP"));
        assert!(first.connect().await.echo_verified);

        let second = AssociationManager::new(client_config(server.port, "GW_SCP"));
        assert!(!second.connect().await.echo_verified);

        first.disconnect().await;
    }

    #[test]
    fn test_negotiate_rejects_query_models() {
        let server = DicomServer {
            config: DicomServerConfig::default(),
            service_manager: ServiceManager::new(),
            transfer_syntaxes: TransferSyntaxManager::new(),
            limiter: Arc::new(Semaphore::new(1)),
        };
        let request = AssociateRequest::new("REMOTE", "PACS_GATEWAY", uids::STUDY_ROOT_FIND);
        let (accept, contexts) = server.negotiate(&request);
        assert!(contexts.is_empty());
        assert_eq!(
            accept.presentation_contexts[0].result,
            PresentationContextResult::AbstractSyntaxNotSupported
        );
    }
}

//! 测试用的脚本化PACS对端
//!
//! 在 `127.0.0.1:0` 上监听，按预设的握手行为应答关联请求，并通过回调为每个
//! DIMSE请求生成响应序列。同时记录收到的全部请求供断言使用。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pacs_core::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::association::PeerConfig;
use crate::dimse::{CommandSet, DimseAssembler, DimseMessage, DATA_SET_PRESENT};
use crate::pdu::{
    self, AssociateAccept, PduCodec, PduKind, PresentationContextAnswer, PresentationContextResult,
};
use crate::uids;

/// 关联请求的应答方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    Reject,
    Abort,
    /// 收下请求但永不应答
    Silent,
    /// 只接受Verification，其余抽象语法一律拒绝
    AcceptVerificationOnly,
}

/// 对一个DIMSE请求的单条应答
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub data: Option<Vec<u8>>,
    pub delay: Duration,
    pub abort: bool,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            data: None,
            delay: Duration::ZERO,
            abort: false,
        }
    }

    pub fn success() -> Self {
        Self::status(0x0000)
    }

    /// 带标识符数据集的Pending响应
    pub fn pending(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            ..Self::status(0xFF00)
        }
    }

    /// 发送A-ABORT代替响应
    pub fn abort() -> Self {
        Self {
            abort: true,
            ..Self::status(0x0000)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Arc<dyn Fn(&DimseMessage) -> Vec<Reply> + Send + Sync>;

struct Shared {
    handshake: Handshake,
    answer_release: bool,
    responder: Responder,
    received: Mutex<Vec<DimseMessage>>,
    connections: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub struct FakePacsBuilder {
    handshake: Handshake,
    answer_release: bool,
    responder: Responder,
}

impl FakePacsBuilder {
    pub fn handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&DimseMessage) -> Vec<Reply> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// 收到A-RELEASE-RQ后不应答
    pub fn ignore_release(mut self) -> Self {
        self.answer_release = false;
        self
    }

    pub async fn start(self) -> FakePacs {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake PACS listener");
        let addr = listener.local_addr().expect("fake PACS address");
        let shared = Arc::new(Shared {
            handshake: self.handshake,
            answer_release: self.answer_release,
            responder: self.responder,
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, shared).await;
                });
            }
        });

        FakePacs { addr, shared, handle }
    }
}

/// 脚本化的远端PACS
pub struct FakePacs {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl FakePacs {
    pub fn builder() -> FakePacsBuilder {
        FakePacsBuilder {
            handshake: Handshake::Accept,
            answer_release: true,
            responder: Arc::new(|_| vec![Reply::success()]),
        }
    }

    /// 接受一切关联、所有请求均返回成功
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// 指向本对端、超时较短的连接配置
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            host: "127.0.0.1".to_string(),
            port: self.port(),
            timeout_ms: 5_000,
            negotiation_timeout_ms: 2_000,
            release_timeout_ms: 1_000,
            ..PeerConfig::default()
        }
    }

    /// 收到的全部DIMSE请求（按到达顺序）
    pub fn received(&self) -> Vec<DimseMessage> {
        self.shared
            .received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 已接受的TCP连接数
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// 同时处理中的请求数峰值
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for FakePacs {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let mut framed = Framed::new(stream, PduCodec::default());
    let first = match framed.next().await {
        Some(frame) => frame?,
        None => return Ok(()),
    };
    let request = pdu::decode_associate_request(&first)?;
    let proposes_verification = request
        .presentation_contexts
        .iter()
        .all(|context| context.abstract_syntax == uids::VERIFICATION);

    match shared.handshake {
        Handshake::Reject => {
            framed.send(pdu::encode_associate_reject(1, 1, 7)).await?;
            return Ok(());
        }
        Handshake::Abort => {
            framed.send(pdu::encode_abort(2, 0)).await?;
            return Ok(());
        }
        Handshake::Silent => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }
        Handshake::AcceptVerificationOnly if !proposes_verification => {
            framed.send(pdu::encode_associate_reject(1, 1, 2)).await?;
            return Ok(());
        }
        _ => {}
    }

    let accept = AssociateAccept {
        calling_ae_title: request.calling_ae_title.clone(),
        called_ae_title: request.called_ae_title.clone(),
        presentation_contexts: request
            .presentation_contexts
            .iter()
            .map(|context| PresentationContextAnswer {
                id: context.id,
                result: PresentationContextResult::Acceptance,
                transfer_syntax: context.transfer_syntaxes.first().cloned(),
            })
            .collect(),
        max_pdu_length: pdu::DEFAULT_MAX_PDU_LENGTH,
        implementation_class_uid: "1.2.826.0.1.3680043.2.1143".to_string(),
    };
    framed.send(accept.encode()?).await?;

    let mut assembler = DimseAssembler::new();
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        match pdu::classify(&frame) {
            PduKind::DataTransfer => {
                for pdv in pdu::decode_pdata(&frame)? {
                    let Some(message) = assembler.push(pdv)? else {
                        continue;
                    };
                    let in_flight = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    shared.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
                    shared
                        .received
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(message.clone());

                    let replies = (shared.responder)(&message);
                    for reply in replies {
                        if !reply.delay.is_zero() {
                            tokio::time::sleep(reply.delay).await;
                        }
                        if reply.abort {
                            framed.send(pdu::encode_abort(2, 0)).await?;
                            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                            return Ok(());
                        }
                        let mut command = CommandSet::response_to(&message.command, reply.status);
                        if reply.data.is_some() {
                            command.data_set_type = DATA_SET_PRESENT;
                        }
                        framed.send(pdu::encode_command(message.context_id, &command)?).await?;
                        if let Some(data) = reply.data {
                            for fragment in
                                pdu::encode_data(message.context_id, &data, pdu::DEFAULT_MAX_PDU_LENGTH)
                            {
                                framed.send(fragment).await?;
                            }
                        }
                    }
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
            PduKind::ReleaseRequest => {
                if shared.answer_release {
                    framed.send(pdu::encode_release_response()).await?;
                } else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                return Ok(());
            }
            _ => return Ok(()),
        }
    }
    Ok(())
}

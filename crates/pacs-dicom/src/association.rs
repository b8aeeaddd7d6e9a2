//! DICOM关联管理
//!
//! 管理器独占到远端PACS的唯一物理连接及其状态机。所有DIMSE交换都在同一把
//! 异步互斥锁内完成，同一时刻最多只有一个请求在途，响应读取也只在本次调用内有效。

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pacs_core::utils::mint_association_id;
use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::dimse::{CommandSet, DimseAssembler, DimseMessage};
use crate::pdu::{
    self, AssociateRequest, PduCodec, PduKind, PresentationContextResult, DEFAULT_MAX_PDU_LENGTH,
    PRESENTATION_CONTEXT_ID,
};
use crate::transfer_syntax::transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN;
use crate::transport::{self, PeerStream};
use crate::uids;

/// 远端PACS连接配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// 本端(主叫)AE标题
    #[serde(default = "default_calling_ae_title")]
    pub calling_ae_title: String,

    /// 远端(被叫)AE标题
    #[serde(default = "default_called_ae_title")]
    pub called_ae_title: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP连接与DIMSE响应等待超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub use_tls: bool,

    /// TLS信任的CA证书(PEM)
    #[serde(default)]
    pub tls_ca_path: Option<PathBuf>,

    /// 等待A-ASSOCIATE-AC/RJ的超时（毫秒）
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// 等待A-RELEASE-RP的超时（毫秒）
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,

    /// 向对端声明的最大PDU长度
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,
}

fn default_calling_ae_title() -> String {
    "PACS_GATEWAY".to_string()
}

fn default_called_ae_title() -> String {
    "PACS".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    11112
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_negotiation_timeout_ms() -> u64 {
    10_000
}

fn default_release_timeout_ms() -> u64 {
    5_000
}

fn default_max_pdu_length() -> u32 {
    DEFAULT_MAX_PDU_LENGTH
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            calling_ae_title: default_calling_ae_title(),
            called_ae_title: default_called_ae_title(),
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            use_tls: false,
            tls_ca_path: None,
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            release_timeout_ms: default_release_timeout_ms(),
            max_pdu_length: default_max_pdu_length(),
        }
    }
}

impl PeerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    /// 日志中使用的对端标识
    pub fn peer_label(&self) -> String {
        format!("{}@{}:{}", self.called_ae_title, self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, ae_title) in [
            ("calling_ae_title", &self.calling_ae_title),
            ("called_ae_title", &self.called_ae_title),
        ] {
            if ae_title.trim().is_empty() || ae_title.len() > 16 {
                return Err(PacsError::Config(format!(
                    "{} 必须为1-16个字符，当前为 {:?}",
                    field, ae_title
                )));
            }
        }
        if self.host.trim().is_empty() {
            return Err(PacsError::Config("peer.host 不能为空".to_string()));
        }
        if self.port == 0 {
            return Err(PacsError::Config("peer.port 不能为0".to_string()));
        }
        if self.timeout_ms == 0 || self.negotiation_timeout_ms == 0 || self.release_timeout_ms == 0 {
            return Err(PacsError::Config("超时时间必须大于0".to_string()));
        }
        if self.max_pdu_length < 1024 {
            return Err(PacsError::Config(format!(
                "max_pdu_length {} 过小",
                self.max_pdu_length
            )));
        }
        if self.use_tls && self.tls_ca_path.is_none() {
            return Err(PacsError::Config("启用TLS时必须配置 tls_ca_path".to_string()));
        }
        Ok(())
    }
}

/// 关联状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssociationState {
    Disconnected,
    ConnectingTransport,
    NegotiatingAssociation,
    /// `echo_verified == false` 表示仅本地数据库模式
    Associated { echo_verified: bool },
    Releasing,
    Aborted,
}

impl AssociationState {
    pub fn is_echo_verified(&self) -> bool {
        matches!(self, AssociationState::Associated { echo_verified: true })
    }

    /// 是否需要重新走完整的连接流程
    pub fn needs_connect(&self) -> bool {
        matches!(self, AssociationState::Disconnected | AssociationState::Aborted)
    }
}

/// `connect()` 的结果；连接失败不是错误，而是降级
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub echo_verified: bool,
    pub latency: Duration,
    pub association_id: Option<String>,
}

/// 一次DIMSE交换请求
#[derive(Debug, Clone)]
pub struct DimseRequest {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
    /// 消息ID由管理器分配
    pub command: CommandSet,
    pub data: Option<Bytes>,
}

impl DimseRequest {
    pub fn new(abstract_syntax: &str, command: CommandSet) -> Self {
        Self {
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
            command,
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// 按给定传输语法协商（C-STORE按文件原有语法发送）
    pub fn with_transfer_syntax(mut self, transfer_syntax: &str) -> Self {
        self.transfer_syntaxes = vec![transfer_syntax.to_string()];
        self
    }
}

struct Session {
    framed: Framed<PeerStream, PduCodec>,
    abstract_syntax: String,
    transfer_syntax: String,
    peer_max_pdu: u32,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    message_id: u16,
}

impl Inner {
    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.checked_add(1).unwrap_or(1);
        self.message_id
    }
}

/// DICOM关联管理器
pub struct AssociationManager {
    config: PeerConfig,
    inner: Mutex<Inner>,
    state: watch::Sender<AssociationState>,
    association_id: watch::Sender<Option<String>>,
}

impl AssociationManager {
    pub fn new(config: PeerConfig) -> Self {
        let (state, _) = watch::channel(AssociationState::Disconnected);
        let (association_id, _) = watch::channel(None);
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            state,
            association_id,
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// 当前状态快照
    pub fn state(&self) -> AssociationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AssociationState> {
        self.state.subscribe()
    }

    pub fn is_echo_verified(&self) -> bool {
        self.state().is_echo_verified()
    }

    /// 已验证关联的ID
    pub fn association_id(&self) -> Option<String> {
        self.association_id.borrow().clone()
    }

    fn set_state(&self, next: AssociationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "关联状态变更");
        }
    }

    fn reset(&self, next: AssociationState) {
        self.association_id.send_replace(None);
        self.set_state(next);
    }

    /// 建立传输连接、协商Verification关联并执行C-ECHO
    ///
    /// 任何失败都降级为 `Associated { echo_verified: false }`，不向调用方返回错误。
    pub async fn connect(&self) -> ConnectOutcome {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    /// 惰性连接：仅在 Disconnected / Aborted 时重新走连接流程
    pub async fn ensure_connected(&self) -> AssociationState {
        let mut inner = self.inner.lock().await;
        if self.state().needs_connect() {
            self.connect_locked(&mut inner).await;
        }
        self.state()
    }

    async fn connect_locked(&self, inner: &mut Inner) -> ConnectOutcome {
        let started = Instant::now();
        if let Some(previous) = inner.session.take() {
            self.release_session(previous).await;
        }
        self.association_id.send_replace(None);
        self.set_state(AssociationState::ConnectingTransport);

        let stream = match transport::open(&self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %self.config.peer_label(), error = %e, "PACS不可达，切换为仅本地数据库模式");
                return self.fall_back(started);
            }
        };

        self.set_state(AssociationState::NegotiatingAssociation);
        let message_id = inner.next_message_id();
        let verified = match tokio::time::timeout(
            self.config.negotiation_timeout(),
            self.verify(stream, message_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PacsError::Timeout(format!(
                "关联协商超过 {}ms",
                self.config.negotiation_timeout_ms
            ))),
        };

        match verified {
            Ok(session) => {
                inner.session = Some(session);
                let association_id = mint_association_id();
                self.association_id.send_replace(Some(association_id.clone()));
                self.set_state(AssociationState::Associated { echo_verified: true });

                let latency = started.elapsed();
                info!(
                    association_id = %association_id,
                    peer = %self.config.peer_label(),
                    latency_ms = latency.as_millis() as u64,
                    "PACS关联已建立，C-ECHO验证成功"
                );
                ConnectOutcome {
                    echo_verified: true,
                    latency,
                    association_id: Some(association_id),
                }
            }
            Err(e) => {
                warn!(peer = %self.config.peer_label(), error = %e, "PACS关联验证失败，切换为仅本地数据库模式");
                self.fall_back(started)
            }
        }
    }

    fn fall_back(&self, started: Instant) -> ConnectOutcome {
        self.reset(AssociationState::Associated { echo_verified: false });
        ConnectOutcome {
            echo_verified: false,
            latency: started.elapsed(),
            association_id: None,
        }
    }

    /// 协商Verification关联并执行一次C-ECHO
    async fn verify(&self, stream: PeerStream, message_id: u16) -> Result<Session> {
        let mut session = self
            .negotiate(stream, uids::VERIFICATION, &[IMPLICIT_VR_LITTLE_ENDIAN.to_string()])
            .await?;

        let responses = self
            .run_exchange(&mut session, CommandSet::echo_request(message_id), None)
            .await?;
        let status = responses
            .last()
            .map(|response| response.command.status())
            .ok_or_else(|| PacsError::Dicom("C-ECHO没有响应".to_string()))?;

        if !status.is_success() {
            let _ = session.framed.send(pdu::encode_abort(0, 0)).await;
            return Err(PacsError::Dicom(format!("C-ECHO返回状态 {}", status)));
        }
        Ok(session)
    }

    async fn negotiate(
        &self,
        stream: PeerStream,
        abstract_syntax: &str,
        transfer_syntaxes: &[String],
    ) -> Result<Session> {
        let request = AssociateRequest::new(
            &self.config.calling_ae_title,
            &self.config.called_ae_title,
            abstract_syntax,
        )
        .with_transfer_syntaxes(transfer_syntaxes.to_vec())
        .with_max_pdu_length(self.config.max_pdu_length);

        let mut framed = Framed::new(stream, PduCodec::default());
        framed.send(request.encode()?).await?;
        debug!(abstract_syntax, "已发送A-ASSOCIATE-RQ");

        let reply = next_pdu(&mut framed).await?;
        match pdu::classify(&reply) {
            PduKind::AssociateAccept => {
                let accept = pdu::decode_associate_accept(&reply)?;
                let context = accept.context(PRESENTATION_CONTEXT_ID).ok_or_else(|| {
                    PacsError::AssociationRejected("A-ASSOCIATE-AC缺少表示上下文".to_string())
                })?;
                if context.result != PresentationContextResult::Acceptance {
                    return Err(PacsError::AssociationRejected(format!(
                        "表示上下文 {} 未被接受: {:?}",
                        abstract_syntax, context.result
                    )));
                }

                let transfer_syntax = context
                    .transfer_syntax
                    .clone()
                    .or_else(|| transfer_syntaxes.first().cloned())
                    .unwrap_or_else(|| IMPLICIT_VR_LITTLE_ENDIAN.to_string());
                debug!(abstract_syntax, transfer_syntax = %transfer_syntax, peer_max_pdu = accept.max_pdu_length, "关联已接受");

                Ok(Session {
                    framed,
                    abstract_syntax: abstract_syntax.to_string(),
                    transfer_syntax,
                    peer_max_pdu: accept.max_pdu_length,
                })
            }
            PduKind::AssociateReject => {
                let reject = pdu::decode_associate_reject(&reply)?;
                Err(PacsError::AssociationRejected(reject.to_string()))
            }
            PduKind::Abort => Err(PacsError::AssociationAborted(
                "协商期间对端发送A-ABORT".to_string(),
            )),
            other => Err(PacsError::Dicom(format!(
                "协商期间收到意外的PDU: {:?}",
                other
            ))),
        }
    }

    async fn open_session(&self, abstract_syntax: &str, transfer_syntaxes: &[String]) -> Result<Session> {
        let stream = transport::open(&self.config).await?;
        tokio::time::timeout(
            self.config.negotiation_timeout(),
            self.negotiate(stream, abstract_syntax, transfer_syntaxes),
        )
        .await
        .map_err(|_| {
            PacsError::Timeout(format!(
                "关联协商超过 {}ms",
                self.config.negotiation_timeout_ms
            ))
        })?
    }

    /// 执行一次DIMSE请求/响应周期，收集全部Pending响应直到最终状态
    ///
    /// 仅在 `Associated { echo_verified: true }` 时可用。
    pub async fn exchange(&self, request: DimseRequest) -> Result<Vec<DimseMessage>> {
        let mut inner = self.inner.lock().await;

        let state = self.state();
        if !state.is_echo_verified() {
            return Err(PacsError::TransportUnavailable(format!(
                "PACS未通过验证，当前状态: {:?}",
                state
            )));
        }

        let reusable = inner.session.as_ref().map_or(false, |session| {
            session.abstract_syntax == request.abstract_syntax
                && request.transfer_syntaxes.contains(&session.transfer_syntax)
        });
        if !reusable {
            if let Some(previous) = inner.session.take() {
                self.release_session(previous).await;
            }
            match self.open_session(&request.abstract_syntax, &request.transfer_syntaxes).await {
                Ok(session) => inner.session = Some(session),
                Err(e) => {
                    warn!(abstract_syntax = %request.abstract_syntax, error = %e, "无法为DIMSE交换建立关联");
                    if !matches!(e, PacsError::AssociationRejected(_)) {
                        self.reset(AssociationState::Disconnected);
                    }
                    return Err(e);
                }
            }
        }

        let mut command = request.command;
        command.message_id = Some(inner.next_message_id());

        let outcome = match inner.session.as_mut() {
            Some(session) => self.run_exchange(session, command, request.data).await,
            None => Err(PacsError::Internal("关联会话缺失".to_string())),
        };

        if let Err(e) = &outcome {
            match e {
                // 编码失败发生在写socket之前，连接仍然可用
                PacsError::Encoding(_) => {}
                PacsError::AssociationAborted(_) => {
                    warn!(error = %e, "DIMSE交换期间关联被对端中止");
                    inner.session = None;
                    self.reset(AssociationState::Aborted);
                }
                _ => {
                    error!(error = %e, "DIMSE交换期间连接异常，关联已复位");
                    inner.session = None;
                    self.reset(AssociationState::Disconnected);
                }
            }
        }
        outcome
    }

    async fn run_exchange(
        &self,
        session: &mut Session,
        command: CommandSet,
        data: Option<Bytes>,
    ) -> Result<Vec<DimseMessage>> {
        let message_id = command.message_id.unwrap_or_default();
        let command_pdu = pdu::encode_command(PRESENTATION_CONTEXT_ID, &command)?;

        session.framed.send(command_pdu).await?;
        if let Some(data) = data {
            for fragment in pdu::encode_data(PRESENTATION_CONTEXT_ID, &data, session.peer_max_pdu) {
                session.framed.send(fragment).await?;
            }
        }
        debug!(command = ?command.command_field, message_id, "已发送DIMSE请求");

        let mut assembler = DimseAssembler::new();
        let mut responses = Vec::new();
        loop {
            let reply = tokio::time::timeout(self.config.response_timeout(), next_pdu(&mut session.framed))
                .await
                .map_err(|_| {
                    PacsError::Timeout(format!("等待DIMSE响应超过 {}ms", self.config.timeout_ms))
                })??;

            match pdu::classify(&reply) {
                PduKind::DataTransfer => {
                    for pdv in pdu::decode_pdata(&reply)? {
                        let Some(message) = assembler.push(pdv)? else {
                            continue;
                        };
                        if message.command.message_id_being_responded_to != Some(message_id) {
                            warn!(
                                expected = message_id,
                                actual = ?message.command.message_id_being_responded_to,
                                "忽略不匹配的DIMSE响应"
                            );
                            continue;
                        }
                        let status = message.command.status();
                        debug!(command = ?message.command.command_field, %status, "收到DIMSE响应");
                        responses.push(message);
                        if !status.is_pending() {
                            return Ok(responses);
                        }
                    }
                }
                PduKind::Abort => {
                    let detail = pdu::decode_abort(&reply)
                        .map(|abort| format!("source {}, reason {}", abort.source, abort.reason))
                        .unwrap_or_else(|_| "unknown".to_string());
                    return Err(PacsError::AssociationAborted(detail));
                }
                PduKind::ReleaseRequest => {
                    let _ = session.framed.send(pdu::encode_release_response()).await;
                    return Err(PacsError::Network(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "对端在交换期间释放了关联",
                    )));
                }
                other => {
                    return Err(PacsError::Dicom(format!(
                        "交换期间收到意外的PDU: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// 释放关联：Releasing → 发送A-RELEASE-RQ → 等待RP（有超时）→ Disconnected
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.take() {
            self.set_state(AssociationState::Releasing);
            self.release_session(session).await;
            info!(peer = %self.config.peer_label(), "PACS关联已释放");
        }
        self.reset(AssociationState::Disconnected);
    }

    async fn release_session(&self, mut session: Session) {
        match tokio::time::timeout(self.config.release_timeout(), release(&mut session.framed)).await {
            Ok(Ok(())) => debug!(abstract_syntax = %session.abstract_syntax, "收到A-RELEASE-RP"),
            Ok(Err(e)) => warn!(error = %e, "关联释放未正常完成"),
            Err(_) => warn!(
                timeout_ms = self.config.release_timeout_ms,
                "等待A-RELEASE-RP超时，直接关闭连接"
            ),
        }
        let mut stream = session.framed.into_inner();
        let _ = stream.shutdown().await;
    }
}

async fn next_pdu(framed: &mut Framed<PeerStream, PduCodec>) -> Result<Bytes> {
    match framed.next().await {
        Some(frame) => frame,
        None => Err(PacsError::Network(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "对端关闭了连接",
        ))),
    }
}

async fn release(framed: &mut Framed<PeerStream, PduCodec>) -> Result<()> {
    framed.send(pdu::encode_release_request()).await?;
    loop {
        let reply = next_pdu(framed).await?;
        match pdu::classify(&reply) {
            PduKind::ReleaseResponse => return Ok(()),
            PduKind::Abort => {
                return Err(PacsError::AssociationAborted("释放期间对端中止".to_string()))
            }
            other => debug!(?other, "释放期间忽略PDU"),
        }
    }
}

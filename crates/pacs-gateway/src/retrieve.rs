//! 检查检索
//!
//! 本地已有影像时直接返回；否则发起C-MOVE，影像经入站存储SCP异步到达，
//! 这里轮询本地库等待，并在收到到达通知时提前复查。

use std::time::Duration;

use pacs_core::{AuditAction, AuditOutcome, PacsError, Result};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::details;
use crate::gateway::PacsGateway;

/// 检索等待策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievePolicy {
    /// C-MOVE目的AE，即本网关存储SCP的AE标题
    pub move_destination: String,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl RetrievePolicy {
    pub fn new(move_destination: impl Into<String>) -> Self {
        Self {
            move_destination: move_destination.into(),
            poll_interval: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RetrieveOutcome {
    /// 本地已有影像，未访问PACS
    AlreadyLocal { image_count: usize },
    /// C-MOVE后影像已到达本地
    Retrieved { image_count: usize },
    /// 等待超时，影像可能仍在传输，调用方可稍后重试
    Pending,
}

impl PacsGateway {
    /// 检索检查到本地
    pub async fn retrieve_study(
        &self,
        study_instance_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrieveOutcome> {
        let result = self.run_retrieve(study_instance_uid, cancel).await;
        let (outcome, description) = match &result {
            Ok(RetrieveOutcome::AlreadyLocal { .. }) => (AuditOutcome::Success, "检查已在本地"),
            Ok(RetrieveOutcome::Retrieved { .. }) => (AuditOutcome::Success, "检查检索完成"),
            Ok(RetrieveOutcome::Pending) => (AuditOutcome::Partial, "C-MOVE已发起，等待影像超时"),
            Err(_) => (AuditOutcome::Failure, "检查检索失败"),
        };
        let mut fields = details(json!({ "studyInstanceUid": study_instance_uid }));
        match &result {
            Ok(retrieved) => {
                fields.insert("result".into(), json!(retrieved));
            }
            Err(e) => {
                fields.insert("error".into(), json!(e.to_string()));
            }
        }
        self.audit
            .emit(AuditAction::RetrieveStudy, outcome, description, fields)
            .await;
        result
    }

    async fn run_retrieve(
        &self,
        study_instance_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrieveOutcome> {
        let images = self.store.list_images(study_instance_uid).await?;
        if !images.is_empty() {
            debug!(study_instance_uid, count = images.len(), "检查已在本地");
            return Ok(RetrieveOutcome::AlreadyLocal {
                image_count: images.len(),
            });
        }

        if !self.remote_available().await {
            return Err(PacsError::NotFound(format!(
                "检查 {} 不在本地且PACS不可用",
                study_instance_uid
            )));
        }

        // 先订阅再发C-MOVE，避免错过早到的影像
        let mut arrivals = self.arrivals.subscribe();
        let destination = &self.retrieve_policy.move_destination;
        match self.scu.move_study(study_instance_uid, destination).await {
            Ok(outcome) => info!(
                study_instance_uid,
                destination = %destination,
                completed = outcome.completed,
                failed = outcome.failed,
                "C-MOVE已完成，等待影像到达"
            ),
            Err(e) => {
                warn!(study_instance_uid, error = %e, "C-MOVE失败");
                return Err(PacsError::NotFound(format!(
                    "检查 {} 不在本地且C-MOVE失败: {}",
                    study_instance_uid, e
                )));
            }
        }

        let deadline = Instant::now() + self.retrieve_policy.wait_timeout;
        let mut poll = interval(self.retrieve_policy.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;

        loop {
            let count = self.store.list_images(study_instance_uid).await?.len();
            if count > 0 {
                return Ok(RetrieveOutcome::Retrieved { image_count: count });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PacsError::Cancelled(format!("检查 {} 的检索已取消", study_instance_uid)));
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        study_instance_uid,
                        timeout = ?self.retrieve_policy.wait_timeout,
                        "等待影像到达超时"
                    );
                    return Ok(RetrieveOutcome::Pending);
                }
                _ = poll.tick() => {}
                arrival = arrivals.recv(), if listening => match arrival {
                    Ok(uid) if uid != study_instance_uid => {}
                    Ok(_) | Err(RecvError::Lagged(_)) => debug!(study_instance_uid, "收到影像到达通知"),
                    Err(RecvError::Closed) => listening = false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{harness, unreachable_config};
    use chrono::Utc;
    use pacs_core::{ImageRecord, StudyRecord};
    use pacs_database::Store;
    use pacs_dicom::testing::{FakePacs, Reply};
    use pacs_dicom::CommandField;
    use std::sync::Arc;

    fn image(study_uid: &str, sop_uid: &str) -> ImageRecord {
        ImageRecord {
            study_instance_uid: study_uid.into(),
            series_instance_uid: format!("{}.1", study_uid),
            sop_instance_uid: sop_uid.into(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            instance_number: Some(1),
            series_number: Some(1),
            storage_location: format!("/data/{}.dcm", sop_uid),
            byte_size: 2048,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unverified_without_images_is_not_found() {
        let h = harness(unreachable_config().await);
        h.store.upsert_study(&StudyRecord::new("1.2.3")).await.unwrap();

        let err = h
            .gateway
            .retrieve_study("1.2.3", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::NotFound(_)));

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::RetrieveStudy);
        assert_eq!(records[0].outcome, AuditOutcome::Failure);
    }

    #[tokio::test]
    async fn test_local_images_short_circuit() {
        let fake = FakePacs::start().await;
        let h = harness(fake.peer_config());
        h.store.upsert_study(&StudyRecord::new("1.2.3")).await.unwrap();
        h.store.create_image(&image("1.2.3", "1.2.3.1")).await.unwrap();

        let outcome = h
            .gateway
            .retrieve_study("1.2.3", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RetrieveOutcome::AlreadyLocal { image_count: 1 });
        assert_eq!(fake.connections(), 0);
        assert_eq!(h.audit.records()[0].outcome, AuditOutcome::Success);
    }

    #[tokio::test]
    async fn test_move_then_arrival_completes() {
        let fake = FakePacs::start().await;
        let h = harness(fake.peer_config());

        let store = h.store.clone();
        let arrivals = h.gateway.arrivals().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.upsert_study(&StudyRecord::new("1.2.3")).await.unwrap();
            store.create_image(&image("1.2.3", "1.2.3.1")).await.unwrap();
            arrivals.notify("1.2.3");
        });

        let outcome = h
            .gateway
            .retrieve_study("1.2.3", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RetrieveOutcome::Retrieved { image_count: 1 });

        let moves: Vec<_> = fake
            .received()
            .into_iter()
            .filter(|m| m.command.command_field == CommandField::CMoveRq)
            .collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].command.move_destination.as_deref(), Some("GW_SCP"));
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_pending() {
        let fake = FakePacs::start().await;
        let h = harness(fake.peer_config());

        let outcome = h
            .gateway
            .retrieve_study("1.2.3", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RetrieveOutcome::Pending);
        assert_eq!(h.audit.records()[0].outcome, AuditOutcome::Partial);
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let fake = FakePacs::start().await;
        let h = harness(fake.peer_config());
        let gateway = Arc::new(h.gateway);
        let cancel = CancellationToken::new();

        let task = {
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gateway.retrieve_study("1.2.3", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PacsError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_failed_move_is_not_found() {
        let fake = FakePacs::builder()
            .responder(|message| match message.command.command_field {
                CommandField::CMoveRq => vec![Reply::status(0xA801)],
                _ => vec![Reply::success()],
            })
            .start()
            .await;
        let h = harness(fake.peer_config());

        let err = h
            .gateway
            .retrieve_study("1.2.3", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::NotFound(_)));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetrievePolicy::new("GW_SCP");
        assert_eq!(policy.poll_interval, Duration::from_secs(2));
        assert_eq!(policy.wait_timeout, Duration::from_secs(60));
    }
}

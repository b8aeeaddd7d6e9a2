//! PACS网关主程序

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pacs_admin::config::{DatabaseBackend, GatewayConfig};
use pacs_admin::{init_tracing, AuditTrail, ConfigManager, FanoutAuditSink, TracingAuditSink};
use pacs_core::AuditSink;
use pacs_database::{InMemoryStore, PgStore, Store};
use pacs_dicom::{AssociationManager, DicomServer, ServiceManager};
use pacs_gateway::{ArrivalNotifier, PacsGateway, RetrievePolicy, StudyFilter, WorklistFilter};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// PACS集成网关命令行
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "PACS集成网关：连接验证、检查查询、检索、存储与工作列表")]
struct Cli {
    /// 配置文件路径 (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行入站存储SCP，直到收到Ctrl-C
    Serve,
    /// 对远端PACS执行C-ECHO
    Echo,
    /// 查询检查
    Query {
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        accession_number: Option<String>,
        /// `YYYYMMDD` 或 `YYYYMMDD-YYYYMMDD`
        #[arg(long)]
        study_date: Option<String>,
        #[arg(long)]
        modality: Option<String>,
    },
    /// 检索检查到本地
    Retrieve { study_instance_uid: String },
    /// 存储检查文件
    Store {
        study_instance_uid: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// 查询工作列表
    Worklist {
        #[arg(long)]
        scheduled_date: Option<String>,
        #[arg(long)]
        modality: Option<String>,
        #[arg(long)]
        station: Option<String>,
    },
    /// 打印生效配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let manager = ConfigManager::load(cli.config.as_deref())?;

    if let Command::Config = cli.command {
        print!("{}", manager.to_toml()?);
        return Ok(());
    }

    let config = manager.config().clone();
    init_tracing(&config.logging)?;
    info!("PACS网关启动，对端: {}", config.peer.peer_label());

    let trail = Arc::new(AuditTrail::default());
    let gateway = Arc::new(build_gateway(&config, trail.clone()).await?);
    let shutdown = CancellationToken::new();
    let result = run(cli.command, &config, &gateway, &shutdown).await;

    shutdown.cancel();
    gateway.disconnect().await;

    let stats = trail.stats(5).await;
    info!(
        total = stats.total_records,
        failures = stats.failures,
        "本次运行审计汇总"
    );
    for failure in &stats.recent_failures {
        warn!(action = %failure.action, "审计失败记录: {}", failure.description);
    }
    result
}

async fn build_gateway(config: &GatewayConfig, trail: Arc<AuditTrail>) -> Result<PacsGateway> {
    let store: Arc<dyn Store> = match config.database.backend {
        DatabaseBackend::Memory => {
            warn!("使用内存存储，进程退出后数据丢失");
            Arc::new(InMemoryStore::new())
        }
        DatabaseBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("postgres backend requires database.url")?;
            Arc::new(PgStore::connect(url, config.database.max_connections).await?)
        }
    };
    let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink), trail];
    let audit_sink: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(sinks));

    let policy = RetrievePolicy {
        move_destination: config.peer.calling_ae_title.clone(),
        poll_interval: config.retrieve.poll_interval(),
        wait_timeout: config.retrieve.wait_timeout(),
    };
    Ok(PacsGateway::new(
        Arc::new(AssociationManager::new(config.peer.clone())),
        store,
        audit_sink,
        ArrivalNotifier::new(),
        policy,
    ))
}

/// 启动入站存储SCP（配置关闭时返回None）
async fn start_scp(
    config: &GatewayConfig,
    gateway: &PacsGateway,
    shutdown: &CancellationToken,
) -> Result<Option<JoinHandle<pacs_core::Result<()>>>> {
    if !config.scp.enabled {
        return Ok(None);
    }
    let server_config = config.scp.to_server_config(&config.peer.calling_ae_title);
    let services = ServiceManager::with_storage(server_config.storage_dir.clone(), gateway.instance_sink());
    let server = Arc::new(DicomServer::new(server_config, services).await?);
    let listener = server.bind().await?;
    Ok(Some(tokio::spawn(server.serve(listener, shutdown.clone()))))
}

async fn run(
    command: Command,
    config: &GatewayConfig,
    gateway: &Arc<PacsGateway>,
    shutdown: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Serve => {
            let Some(handle) = start_scp(config, gateway, shutdown).await? else {
                bail!("scp.enabled = false，没有可运行的服务");
            };
            let echo = gateway.verify_connection().await;
            info!(success = echo.success, "启动时连接验证完成");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("收到退出信号"),
                joined = handle => match joined {
                    Ok(Ok(())) => info!("存储SCP已退出"),
                    Ok(Err(e)) => {
                        error!("存储SCP异常退出: {}", e);
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                },
            }
            Ok(())
        }
        Command::Echo => {
            let result = gateway.verify_connection().await;
            print_json(&result)?;
            if !result.success {
                bail!("C-ECHO失败: {}", config.peer.peer_label());
            }
            Ok(())
        }
        Command::Query {
            patient_id,
            accession_number,
            study_date,
            modality,
        } => {
            let filter = StudyFilter {
                patient_id,
                accession_number,
                study_date,
                modality,
            };
            print_json(&gateway.query_studies(&filter).await?)
        }
        Command::Retrieve { study_instance_uid } => {
            // C-MOVE的影像经本端存储SCP到达
            start_scp(config, gateway, shutdown).await?;
            let cancel = shutdown.child_token();
            let waiter = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                })
            };
            let outcome = gateway.retrieve_study(&study_instance_uid, &cancel).await;
            waiter.abort();
            print_json(&outcome?)
        }
        Command::Store {
            study_instance_uid,
            files,
        } => print_json(&gateway.store_study(&study_instance_uid, &files).await?),
        Command::Worklist {
            scheduled_date,
            modality,
            station,
        } => {
            let filter = WorklistFilter {
                scheduled_date,
                modality,
                station,
            };
            print_json(&gateway.get_worklist(&filter).await?)
        }
        Command::Config => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_store() {
        let cli = Cli::try_parse_from(["pacs-server", "store", "1.2.3", "a.dcm", "b.dcm"]).unwrap();
        match cli.command {
            Command::Store {
                study_instance_uid,
                files,
            } => {
                assert_eq!(study_instance_uid, "1.2.3");
                assert_eq!(files.len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_store_requires_files() {
        assert!(Cli::try_parse_from(["pacs-server", "store", "1.2.3"]).is_err());
    }

    #[test]
    fn test_cli_global_config_flag() {
        let cli = Cli::try_parse_from([
            "pacs-server",
            "query",
            "--study-date",
            "20240101-20240105",
            "--config",
            "gateway.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gateway.toml")));
        assert!(matches!(
            cli.command,
            Command::Query { study_date: Some(ref d), .. } if d == "20240101-20240105"
        ));
    }
}

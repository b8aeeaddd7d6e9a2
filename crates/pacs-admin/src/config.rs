//! 配置管理
//!
//! 启动时加载一次，之后不可变。优先级从低到高：默认值、TOML文件、
//! `PACS__<SECTION>__<KEY>` 环境变量、扁平的旧式变量（`PACS_HOST` 等）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use pacs_dicom::{DicomServerConfig, PeerConfig};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// 旧式扁平环境变量到配置键的映射
const LEGACY_VARIABLES: &[(&str, &str)] = &[
    ("PACS_AE_TITLE", "peer.calling_ae_title"),
    ("PACS_CALLED_AE_TITLE", "peer.called_ae_title"),
    ("PACS_HOST", "peer.host"),
    ("PACS_PORT", "peer.port"),
    ("PACS_TIMEOUT", "peer.timeout_ms"),
    ("PACS_USE_TLS", "peer.use_tls"),
];

/// 网关完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 远端PACS
    pub peer: PeerConfig,
    /// 入站存储SCP
    pub scp: ScpConfig,
    pub database: DatabaseConfig,
    pub retrieve: RetrieveConfig,
    pub logging: LoggingConfig,
}

/// 入站存储SCP配置，AE标题沿用 `peer.calling_ae_title`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub port: u16,
    pub max_associations: u32,
    pub storage_dir: PathBuf,
    /// 关联空闲超时（秒）
    pub idle_timeout_secs: u64,
}

impl ScpConfig {
    pub fn to_server_config(&self, ae_title: &str) -> DicomServerConfig {
        DicomServerConfig {
            ae_title: ae_title.to_string(),
            bind_addr: self.bind_addr.clone(),
            port: self.port,
            max_associations: self.max_associations,
            storage_dir: self.storage_dir.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Default for ScpConfig {
    fn default() -> Self {
        let server = DicomServerConfig::default();
        Self {
            enabled: true,
            bind_addr: server.bind_addr,
            port: server.port,
            max_associations: server.max_associations,
            storage_dir: server.storage_dir,
            idle_timeout_secs: server.idle_timeout.as_secs(),
        }
    }
}

/// 本地库后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// PostgreSQL连接串
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            url: None,
            max_connections: 10,
        }
    }
}

/// C-MOVE之后等待影像到达的策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    pub poll_interval_ms: u64,
    pub wait_timeout_ms: u64,
}

impl RetrieveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            wait_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` 指令，`RUST_LOG` 存在时优先
    pub level: String,
    /// 输出JSON格式
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: GatewayConfig,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// 从可选的配置文件和进程环境变量加载
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(config_path, std::env::vars().collect())
    }

    /// 使用给定的环境变量集合加载
    pub fn load_with_env(config_path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let config = Self::load_config(config_path, &env)?;
        ConfigValidator::new().validate(&config)?;
        Ok(Self {
            config,
            source: config_path.map(Path::to_path_buf),
        })
    }

    fn load_config(config_path: Option<&Path>, env: &HashMap<String, String>) -> Result<GatewayConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let prefixed: config::Map<String, String> = env
            .iter()
            .filter(|(key, _)| key.starts_with("PACS__"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        builder = builder.add_source(
            Environment::with_prefix("PACS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(Some(prefixed)),
        );

        for (variable, key) in LEGACY_VARIABLES {
            builder = builder
                .set_override_option(*key, env.get(*variable).cloned())
                .with_context(|| format!("无法应用环境变量 {}", variable))?;
        }

        let config: GatewayConfig = builder
            .build()?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("配置已加载: {}", path.display()),
            None => info!("未指定配置文件，使用默认值与环境变量"),
        }
        Ok(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// 生效配置的TOML表示
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("Failed to serialize configuration")
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&GatewayConfig) -> Result<()>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "peer",
                validator: |config| config.peer.validate().map_err(|e| anyhow!(e)),
            },
            ValidationRule {
                field_path: "scp.port",
                validator: |config| {
                    if config.scp.enabled && config.scp.port == 0 {
                        Err(anyhow!("SCP port cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "scp.max_associations",
                validator: |config| {
                    if config.scp.enabled && config.scp.max_associations == 0 {
                        Err(anyhow!("SCP max associations cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "database.url",
                validator: |config| match (config.database.backend, &config.database.url) {
                    (DatabaseBackend::Postgres, None) => {
                        Err(anyhow!("postgres backend requires database.url"))
                    }
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    if config.database.max_connections == 0 {
                        Err(anyhow!("Database max connections cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "retrieve",
                validator: |config| {
                    let retrieve = &config.retrieve;
                    if retrieve.poll_interval_ms == 0 || retrieve.wait_timeout_ms < retrieve.poll_interval_ms {
                        Err(anyhow!("wait_timeout_ms must be at least poll_interval_ms (> 0)"))
                    } else {
                        Ok(())
                    }
                },
            },
        ];

        Self { validation_rules }
    }

    pub fn validate(&self, config: &GatewayConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow!("Invalid {}: {}", rule.field_path, e));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

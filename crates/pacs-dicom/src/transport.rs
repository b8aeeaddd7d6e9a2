//! 到远端PACS的传输层连接（TCP，可选TLS）

use std::time::Duration;

use pacs_core::{PacsError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::association::PeerConfig;

/// 可承载DICOM上层协议的字节流
pub trait PeerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerIo for T {}

pub type PeerStream = Box<dyn PeerIo>;

/// 在连接超时内打开到对端的传输连接
pub async fn open(config: &PeerConfig) -> Result<PeerStream> {
    let address = format!("{}:{}", config.host, config.port);
    let tcp = connect_tcp(&address, config.connect_timeout()).await?;

    if config.use_tls {
        return wrap_tls(tcp, config).await;
    }
    Ok(Box::new(tcp))
}

async fn connect_tcp(address: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            PacsError::TransportUnavailable(format!("连接 {} 超时 ({}ms)", address, timeout.as_millis()))
        })?
        .map_err(|e| PacsError::TransportUnavailable(format!("连接 {} 失败: {}", address, e)))?;

    stream.set_nodelay(true)?;
    debug!("TCP连接已建立: {}", address);
    Ok(stream)
}

#[cfg(feature = "tls")]
async fn wrap_tls(tcp: TcpStream, config: &PeerConfig) -> Result<PeerStream> {
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let ca_path = config
        .tls_ca_path
        .as_ref()
        .ok_or_else(|| PacsError::Config("启用TLS时必须配置 tls_ca_path".to_string()))?;
    let pem = tokio::fs::read(ca_path).await?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        roots
            .add(cert?)
            .map_err(|e| PacsError::Config(format!("无效的CA证书 {:?}: {}", ca_path, e)))?;
    }

    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| PacsError::Config(format!("无效的TLS主机名 {}: {}", config.host, e)))?;

    let stream = tokio::time::timeout(
        config.connect_timeout(),
        TlsConnector::from(Arc::new(client)).connect(server_name, tcp),
    )
    .await
    .map_err(|_| PacsError::TransportUnavailable(format!("TLS握手超时: {}", config.host)))?
    .map_err(|e| PacsError::TransportUnavailable(format!("TLS握手失败: {}", e)))?;

    debug!("TLS会话已建立: {}", config.host);
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(_tcp: TcpStream, _config: &PeerConfig) -> Result<PeerStream> {
    Err(PacsError::Config(
        "配置启用了TLS，但编译时未开启tls特性".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // 绑定后立即释放，得到一个大概率无人监听的端口
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = PeerConfig {
            host: "127.0.0.1".into(),
            port,
            timeout_ms: 2_000,
            ..PeerConfig::default()
        };
        let err = open(&config).await.err().unwrap();
        assert!(matches!(err, PacsError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_open_plain_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = PeerConfig {
            host: "127.0.0.1".into(),
            port,
            ..PeerConfig::default()
        };

        let (client, accepted) = tokio::join!(open(&config), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }
}

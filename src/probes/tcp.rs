use serde::Deserialize;
use tokio::net::TcpStream;

use super::ProbeError;

#[derive(Debug, Clone, Deserialize)]
pub struct TcpProbeConfig {
    pub host: String,
    pub port: u16,
}

/// Succeeds once the three-way handshake completes; the connection is dropped immediately.
pub(crate) async fn check(config: &TcpProbeConfig) -> Result<(), ProbeError> {
    TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map(drop)
        .map_err(|e| ProbeError::Network(e.to_string()))
}

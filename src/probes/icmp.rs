use rand::random;
use serde::Deserialize;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};
use tokio::sync::OnceCell;

use super::ProbeError;

static V4_CLIENT: OnceCell<Client> = OnceCell::const_new();
static V6_CLIENT: OnceCell<Client> = OnceCell::const_new();

#[derive(Debug, Clone, Deserialize)]
pub struct IcmpProbeConfig {
    pub host: String,
    /// Echo requests per check; any reply counts as success.
    #[serde(default = "default_count")]
    pub count: u16,
    /// Report success when raw sockets are not permitted instead of failing.
    #[serde(default)]
    pub ignore_privilege: bool,
}

fn default_count() -> u16 {
    1
}

async fn client_for(addr: IpAddr) -> io::Result<&'static Client> {
    match addr {
        IpAddr::V4(_) => {
            V4_CLIENT
                .get_or_try_init(|| async { Client::new(&Config::default()) })
                .await
        }
        IpAddr::V6(_) => {
            V6_CLIENT
                .get_or_try_init(|| async { Client::new(&Config::builder().kind(ICMP::V6).build()) })
                .await
        }
    }
}

async fn resolve(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::InvalidTarget(format!("{host}: {e}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeError::InvalidTarget(format!("{host}: no addresses")))
}

pub(crate) async fn check(config: &IcmpProbeConfig, timeout: Duration) -> Result<(), ProbeError> {
    let addr = resolve(&config.host).await?;
    let client = match client_for(addr).await {
        Ok(client) => client,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            if config.ignore_privilege {
                return Ok(());
            }
            return Err(ProbeError::Privilege(e.to_string()));
        }
        Err(e) => return Err(ProbeError::Network(e.to_string())),
    };

    let mut pinger = client.pinger(addr, PingIdentifier(random())).await;
    pinger.timeout(timeout);
    let payload = [0u8; 56];
    let mut last = ProbeError::Timeout(timeout);
    for seq in 0..config.count.max(1) {
        match pinger.ping(PingSequence(seq), &payload).await {
            Ok(_) => return Ok(()),
            Err(surge_ping::SurgeError::Timeout { .. }) => last = ProbeError::Timeout(timeout),
            Err(e) => last = ProbeError::Network(e.to_string()),
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_dns() {
        assert_eq!(resolve("127.0.0.1").await.unwrap(), IpAddr::from([127, 0, 0, 1]));
        assert!(resolve("::1").await.unwrap().is_ipv6());
    }

    #[test]
    fn count_defaults_to_one() {
        let cfg: IcmpProbeConfig = serde_json::from_str(r#"{"host": "10.0.0.1"}"#).unwrap();
        assert_eq!(cfg.count, 1);
        assert!(!cfg.ignore_privilege);
    }
}

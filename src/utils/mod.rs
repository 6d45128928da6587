//! 工具函数模块

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{FlareError, Result};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// 部署环境注入的本机地址
pub const HOST_MACHINE_IP_ENV: &str = "HOST_MACHINE_IP";

const LOOPBACK: &str = "127.0.0.1";

/// 注册到注册中心的本机地址
///
/// 优先使用 `HOST_MACHINE_IP`（容器场景下宿主机地址），
/// 其次探测默认路由出口网卡的地址，都失败时退回 `127.0.0.1`。
pub fn host_ip() -> String {
    if let Ok(ip) = std::env::var(HOST_MACHINE_IP_ENV) {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    match detect_local_ip() {
        Some(ip) => ip.to_string(),
        None => {
            warn!("Failed to detect local ip, falling back to {}", LOOPBACK);
            LOOPBACK.to_string()
        }
    }
}

/// 通过 UDP "连接" 公网地址获取出口网卡地址，不会真正发送数据
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// 生成请求 ID（32 位十六进制）
pub fn generate_request_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// 监听地址对应的本机可连接地址（`0.0.0.0` 换成回环地址）
pub fn connectable_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let ip = match addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, addr.port())
    } else {
        addr
    }
}

/// 等待服务启动就绪（通过 TCP 连接重试）
///
/// 使用指数退避策略重试连接，直到服务真正可以接受连接，
/// 服务注册应在此之后进行，避免客户端解析到尚未监听的地址。
pub async fn wait_for_server_ready(address: SocketAddr) -> Result<()> {
    const MAX_RETRIES: usize = 30;
    const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

    let address = connectable_addr(address);
    let policy =
        ExponentialBackoffPolicy::new(MAX_RETRIES, Duration::from_millis(50), Duration::from_millis(500));
    let start = Instant::now();

    for attempt in 1..=MAX_RETRIES {
        if start.elapsed() > TOTAL_TIMEOUT {
            return Err(FlareError::connection_failed(format!(
                "Server readiness check timeout after {:?}",
                TOTAL_TIMEOUT
            )));
        }

        match timeout(Duration::from_millis(100), TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Server is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(address = %address, attempt, error = %e, "Connection attempt failed, retrying...");
            }
            Err(_) => {
                debug!(address = %address, attempt, "Connection attempt timed out, retrying...");
            }
        }

        sleep(policy.backoff_duration(attempt)).await;
    }

    Err(FlareError::connection_failed(format!(
        "Server readiness check failed after {} attempts",
        MAX_RETRIES
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_connectable_addr() {
        let addr: SocketAddr = "0.0.0.0:9090".parse().unwrap();
        assert_eq!(connectable_addr(addr), "127.0.0.1:9090".parse().unwrap());

        let addr: SocketAddr = "10.1.2.3:9090".parse().unwrap();
        assert_eq!(connectable_addr(addr), addr);
    }

    #[test]
    fn test_host_ip_is_never_empty() {
        assert!(!host_ip().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_server_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        wait_for_server_ready(addr).await.unwrap();
    }
}

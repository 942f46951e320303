use crate::error::RESOLVE;
use spark_rpc_transport::{
    Endpoint, EndpointInfo, IpEndpoint, OperationKind, TransportError, TransportErrorKind,
    map_io_error, timeout_error,
};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// 在保留超时语义的前提下执行 IO Future。
pub(crate) async fn run_with_timeout<F, T>(
    kind: OperationKind,
    timeout: Option<Duration>,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::pin!(future);
    match timeout {
        Some(limit) => {
            let sleep = tokio::time::sleep(limit);
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                result = &mut future => result.map_err(|err| map_io_error(kind, err)),
                _ = &mut sleep => Err(timeout_error(kind)),
            }
        }
        None => future.await.map_err(|err| map_io_error(kind, err)),
    }
}

/// 取出 TCP 端点的 IP 字段；其他协议返回参数错误。
pub(crate) fn tcp_fields(endpoint: &Endpoint) -> Result<&IpEndpoint, TransportError> {
    match endpoint.info() {
        EndpointInfo::Tcp(ip) => Ok(ip),
        _ => Err(TransportError::new(
            RESOLVE.code,
            TransportErrorKind::InvalidEndpoint,
            format!("tcp resolve: `{endpoint}` 不是 TCP 端点"),
        )),
    }
}

/// 将端点主机解析为套接字地址。
///
/// 空主机在监听时表示所有接口，在建连时表示本机回环。
pub(crate) async fn resolve(ip: &IpEndpoint, listening: bool) -> Result<SocketAddr, TransportError> {
    if ip.host.is_empty() {
        let addr = if listening {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        };
        return Ok(SocketAddr::from((addr, ip.port)));
    }
    let mut addrs = tokio::net::lookup_host((ip.host.as_str(), ip.port))
        .await
        .map_err(|err| map_io_error(RESOLVE, err))?;
    addrs.next().ok_or_else(|| {
        TransportError::new(
            RESOLVE.code,
            TransportErrorKind::InvalidEndpoint,
            format!("tcp resolve: 主机 `{}` 没有可用地址", ip.host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_rpc_transport::Endpoint;

    #[tokio::test]
    async fn empty_host_depends_on_direction() {
        let ip = IpEndpoint::new("", 4061);
        assert_eq!(
            resolve(&ip, true).await.expect("监听地址"),
            "0.0.0.0:4061".parse::<SocketAddr>().expect("合法地址")
        );
        assert_eq!(
            resolve(&ip, false).await.expect("建连地址"),
            "127.0.0.1:4061".parse::<SocketAddr>().expect("合法地址")
        );
    }

    #[tokio::test]
    async fn timeout_is_reported_with_shared_code() {
        let err = run_with_timeout(RESOLVE, Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, io::Error>(())
        })
        .await
        .expect_err("超时");
        assert_eq!(err.kind(), TransportErrorKind::Timeout);
    }

    #[test]
    fn non_tcp_endpoints_are_rejected() {
        let err = tcp_fields(&Endpoint::memory("x")).expect_err("非 TCP 端点");
        assert_eq!(err.kind(), TransportErrorKind::InvalidEndpoint);
    }
}

//! `tcp_loopback` 集成测试：经由传输工厂在本机回环上建立会话。
//!
//! # 测试总览（Why）
//! - 锁定全双工语义：读任务阻塞期间仍可写出；
//! - `close` 发送 FIN，对端读到 EOF；
//! - 无人监听的端口返回拒绝类错误，而不是挂起。

use std::{sync::Arc, time::Duration};

use spark_rpc_transport::{Endpoint, TransportErrorKind, TransportFactory, TransportRegistry};
use spark_rpc_transport_tcp::{TcpSocketConfig, TcpTransport};

#[tokio::test(flavor = "multi_thread")]
async fn full_duplex_exchange_over_loopback() {
    let registry = TransportRegistry::new();
    registry
        .register(Arc::new(TcpTransport::new()))
        .expect("注册 tcp");
    let acceptor = registry
        .listen(&Endpoint::tcp("127.0.0.1", 0))
        .await
        .expect("监听");
    let endpoint = acceptor.endpoint();
    assert_ne!(endpoint.info().ip().map(|ip| ip.port), Some(0));

    let server = tokio::spawn(async move {
        let session = acceptor.accept().await.expect("接受");
        assert!(session.info().incoming);
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            let n = session.read(&mut buf[read..]).await.expect("读取");
            assert_ne!(n, 0, "客户端提前关闭");
            read += n;
        }
        session.write(&buf).await.expect("回写");
        session.close().await.expect("关闭");
    });

    let client = registry.connect(&endpoint).await.expect("建连");
    let reader = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let mut read = 0;
            while read < buf.len() {
                let n = client.read(&mut buf[read..]).await.expect("读取");
                assert_ne!(n, 0, "对端提前关闭");
                read += n;
            }
            let mut tail = [0u8; 1];
            assert_eq!(client.read(&mut tail).await.expect("EOF"), 0);
            buf
        })
    };
    // 读任务已经阻塞在 read 上，写方向不受影响。
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.write(b"ping").await.expect("写入");
    assert_eq!(&reader.await.expect("读任务"), b"ping");
    server.await.expect("服务端任务");
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_is_classified() {
    let transport = TcpTransport::with_socket_config(TcpSocketConfig::new().with_nodelay(false));
    assert!(!transport.socket_config().nodelay());
    // 先绑定再释放，拿到一个当前无人监听的端口。
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("绑定临时端口");
        listener.local_addr().expect("本地地址").port()
    };
    let endpoint = Endpoint::tcp("127.0.0.1", port).with_timeout(Some(Duration::from_secs(2)));
    let err = transport.connect(&endpoint).await.err().expect("无人监听");
    assert!(
        matches!(
            err.kind(),
            TransportErrorKind::Refused | TransportErrorKind::Timeout
        ),
        "unexpected {err:?}"
    );
    assert!(err.code().starts_with("spark.rpc.transport"));
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_endpoints_are_rejected_by_tcp() {
    let transport = TcpTransport::new();
    let err = transport
        .listen(&Endpoint::memory("x"))
        .await
        .err()
        .expect("协议不符");
    assert_eq!(err.kind(), TransportErrorKind::InvalidEndpoint);
}

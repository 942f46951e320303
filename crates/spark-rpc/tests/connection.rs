//! `connection` 集成测试：在内存会话对上直接驱动连接状态机。
//!
//! # 测试总览（Why）
//! - ACM 的两条关键路径：空闲时发送关闭通知，以及存在未决调用但对端沉默时强制关闭；
//! - 三种手动关闭模式的原因保存、回调恰好一次与 `GracefullyWithWait` 的阻塞语义；
//! - 心跳回调与消息大小上限。
//!
//! 对端沉默的场景用裸 [`MemoryTransceiver`] 扮演，只手工写出握手与回复帧。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_rpc::protocol::{
    MessageType, Reply, ReplyBody, Request, finish_message, header_only, read_frame,
    start_message,
};
use spark_rpc::transport::{Endpoint, MemoryTransceiver, Transceiver};
use spark_rpc::wire::{ENCODING_1_1, InputStream, OutputStream};
use spark_rpc::{
    AcmClose, AcmConfig, AcmHeartbeat, AcmMonitor, CloseMode, CloseReason, Connection,
    ConnectionSettings, ConnectionState, Context, Identity, OperationMode, RpcError,
};

const MAX: usize = 1024 * 1024;

fn settings(acm: AcmConfig) -> ConnectionSettings {
    ConnectionSettings {
        acm,
        ..ConnectionSettings::default()
    }
}

fn request(operation: &str) -> Request {
    let mut out = OutputStream::new();
    out.write_empty_encapsulation(ENCODING_1_1);
    Request {
        request_id: 0,
        identity: Identity::new("target", ""),
        facet: String::new(),
        operation: operation.to_owned(),
        mode: OperationMode::Normal,
        context: Context::new(),
        params: out.into_bytes(),
    }
}

async fn pair(client: ConnectionSettings, server: ConnectionSettings) -> (Connection, Connection) {
    let (outgoing, incoming) = MemoryTransceiver::pair();
    let endpoint = Endpoint::memory("pair");
    let (client, server) = tokio::join!(
        Connection::establish(Arc::new(outgoing), endpoint.clone(), client, None),
        Connection::establish(Arc::new(incoming), endpoint, server, None),
    );
    (client.expect("客户端握手"), server.expect("服务端握手"))
}

/// 客户端连接对面是一个只完成握手、之后全凭测试手工收发的裸会话。
async fn raw_peer(client: ConnectionSettings) -> (Connection, Arc<MemoryTransceiver>) {
    let (outgoing, incoming) = MemoryTransceiver::pair();
    let peer = Arc::new(incoming);
    peer.write(&header_only(MessageType::ValidateConnection).expect("握手帧"))
        .await
        .expect("写出握手");
    let client = Connection::establish(Arc::new(outgoing), Endpoint::memory("raw"), client, None)
        .await
        .expect("客户端握手");
    (client, peer)
}

#[tokio::test(start_paused = true)]
async fn close_on_idle_emits_close_connection() {
    let idle = AcmConfig::new(Duration::from_secs(2), AcmClose::OnIdle, AcmHeartbeat::Off);
    let (client, server) = pair(settings(idle), settings(AcmConfig::disabled())).await;
    let monitor = AcmMonitor::new();
    monitor.add(&client);

    let reason = tokio::time::timeout(Duration::from_secs(30), client.closed())
        .await
        .expect("空闲超时后关闭");
    assert!(matches!(reason, CloseReason::IdleTimeout), "{reason:?}");

    // 对端收到的是关闭通知而非传输中断。
    let reason = tokio::time::timeout(Duration::from_secs(30), server.closed())
        .await
        .expect("对端随之关闭");
    assert!(matches!(reason, CloseReason::PeerClosed), "{reason:?}");
    monitor.destroy();
}

#[tokio::test(start_paused = true)]
async fn close_on_invocation_force_closes_unresponsive_peer() {
    let acm = AcmConfig::new(
        Duration::from_secs(1),
        AcmClose::OnInvocation,
        AcmHeartbeat::Off,
    );
    let (client, _peer) = raw_peer(settings(acm)).await;
    let monitor = AcmMonitor::new();
    monitor.add(&client);

    let err = tokio::time::timeout(Duration::from_secs(30), client.invoke(request("op"), false))
        .await
        .expect("ACM 应在超时后终止调用")
        .expect_err("对端从不回复");
    assert!(
        matches!(err, RpcError::ConnectionClosed(CloseReason::PeerUnresponsive)),
        "{err:?}"
    );
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_count(), 0);
    monitor.destroy();
}

#[tokio::test(start_paused = true)]
async fn close_on_invocation_leaves_idle_connection_open() {
    let acm = AcmConfig::new(
        Duration::from_secs(1),
        AcmClose::OnInvocation,
        AcmHeartbeat::Off,
    );
    let (client, _server) = pair(settings(acm), settings(AcmConfig::disabled())).await;
    let monitor = AcmMonitor::new();
    monitor.add(&client);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.state(), ConnectionState::Active);
    monitor.destroy();
}

#[tokio::test]
async fn forceful_close_fires_callback_once() {
    let off = settings(AcmConfig::disabled());
    let (client, server) = pair(off.clone(), off).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));
    {
        let fired = Arc::clone(&fired);
        let seen = Arc::clone(&seen);
        client.set_close_callback(move |_, reason| {
            fired.fetch_add(1, Ordering::SeqCst);
            *seen.lock() = Some(reason.clone());
        });
    }

    client.close(CloseMode::Forcefully).await;
    client.close(CloseMode::Forcefully).await;
    client.close(CloseMode::Gracefully).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(matches!(
        seen.lock().clone(),
        Some(CloseReason::ApplicationClosed { graceful: false })
    ));

    // 之后的使用都看到同一个原因。
    let err = client
        .invoke(request("op"), false)
        .await
        .expect_err("连接已关闭");
    assert!(matches!(
        err.close_reason(),
        Some(CloseReason::ApplicationClosed { graceful: false })
    ));

    // 关闭后登记的回调立即执行。
    let late = Arc::new(AtomicUsize::new(0));
    {
        let late = Arc::clone(&late);
        client.set_close_callback(move |_, _| {
            late.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(late.load(Ordering::SeqCst), 1);

    // 强制关闭不通知对端，对端看到的是传输中断。
    let reason = server.closed().await;
    assert!(matches!(reason, CloseReason::TransportAborted { .. }), "{reason:?}");
}

#[tokio::test]
async fn graceful_close_notifies_peer() {
    let off = settings(AcmConfig::disabled());
    let (client, server) = pair(off.clone(), off).await;
    client.close(CloseMode::Gracefully).await;
    assert_ne!(client.state(), ConnectionState::Active);

    let reason = server.closed().await;
    assert!(matches!(reason, CloseReason::PeerClosed), "{reason:?}");
    let reason = client.closed().await;
    assert!(
        matches!(reason, CloseReason::ApplicationClosed { graceful: true }),
        "{reason:?}"
    );
}

#[tokio::test]
async fn graceful_close_with_wait_blocks_until_pending_complete() {
    let (client, peer) = raw_peer(settings(AcmConfig::disabled())).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.invoke(request("slow"), false).await }
    });
    let frame = read_frame(peer.as_ref(), MAX)
        .await
        .expect("读取请求")
        .expect("请求帧");
    assert_eq!(frame.kind, MessageType::Request);
    let received = Request::read(&mut InputStream::new(&frame.body), true).expect("解析请求");
    assert_eq!(received.operation, "slow");

    let closing = tokio::spawn({
        let client = client.clone();
        async move { client.close(CloseMode::GracefullyWithWait).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished(), "未决调用完成前不应返回");
    assert_eq!(client.state(), ConnectionState::Closing);
    assert!(client.invoke(request("late"), false).await.is_err());

    let mut out = start_message(MessageType::Reply);
    Reply {
        request_id: received.request_id,
        body: ReplyBody::Ok(Bytes::from_static(&[6, 0, 0, 0, 1, 1])),
    }
    .write(&mut out);
    peer.write(&finish_message(out, false).expect("编码回复"))
        .await
        .expect("写出回复");

    let reply = call.await.expect("调用任务").expect("调用成功");
    assert!(matches!(reply, ReplyBody::Ok(_)));
    closing.await.expect("关闭任务");

    let close = read_frame(peer.as_ref(), MAX)
        .await
        .expect("读取关闭通知")
        .expect("关闭帧");
    assert_eq!(close.kind, MessageType::CloseConnection);
    peer.close().await.expect("对端断开");
    let reason = client.closed().await;
    assert!(
        matches!(reason, CloseReason::ApplicationClosed { graceful: true }),
        "{reason:?}"
    );
}

#[tokio::test]
async fn heartbeat_reaches_peer_callback() {
    let off = settings(AcmConfig::disabled());
    let (client, server) = pair(off.clone(), off).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.set_heartbeat_callback(move |connection| {
        let _ = tx.send(connection.id());
    });

    client.heartbeat().await.expect("发送心跳");
    let id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("心跳及时到达")
        .expect("回调执行");
    assert_eq!(id, server.id());
    assert_eq!(server.state(), ConnectionState::Active);
}

#[tokio::test]
async fn oversized_requests_are_rejected_locally() {
    let small = ConnectionSettings {
        message_size_max: 64,
        acm: AcmConfig::disabled(),
        ..ConnectionSettings::default()
    };
    let (client, _server) = pair(small, settings(AcmConfig::disabled())).await;
    let mut big = request("big");
    let mut out = OutputStream::new();
    out.start_encapsulation();
    out.write_byte_seq(&[7u8; 256]);
    out.end_encapsulation().expect("结束封装");
    big.params = out.into_bytes();

    let err = client.invoke(big, false).await.expect_err("超过上限");
    assert!(matches!(err, RpcError::MessageTooLarge { max: 64, .. }), "{err:?}");
    // 本地拒绝不影响连接。
    assert_eq!(client.state(), ConnectionState::Active);
}

#[tokio::test]
async fn requests_without_adapter_get_object_not_exist() {
    let off = settings(AcmConfig::disabled());
    let (client, _server) = pair(off.clone(), off).await;
    let reply = client.invoke(request("op"), false).await.expect("收到回复");
    let err = reply.into_result().expect_err("没有适配器");
    assert!(matches!(err, RpcError::ObjectNotExist { .. }), "{err:?}");
}

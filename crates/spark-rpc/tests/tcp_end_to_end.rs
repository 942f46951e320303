//! `tcp_end_to_end` 集成测试：默认装配的 TCP 传输上跑通完整调用。
//!
//! # 测试总览（Why）
//! - 端口 0 监听后发布的端点带有实际端口，代理字符串可以跨通信器传递；
//! - 大参数在启用压缩时仍能正确往返；
//! - 两端销毁后连接全部关闭。

use std::sync::Arc;

use bytes::Bytes;
use spark_rpc::transport::Endpoint;
use spark_rpc::{Communicator, Current, DispatchError, FnServant, Identity, OperationMode, RpcError};

#[tokio::test(flavor = "multi_thread")]
async fn ping_and_compressed_echo_over_loopback() {
    let server = Communicator::new().expect("服务端通信器");
    let client = Communicator::new().expect("客户端通信器");
    let adapter = server
        .create_object_adapter("tcp", &[Endpoint::tcp("127.0.0.1", 0)])
        .await
        .expect("监听回环");
    let published = adapter.published_endpoints();
    assert_eq!(published.len(), 1);
    assert_ne!(published[0].info().ip().map(|ip| ip.port), Some(0));
    adapter.activate().expect("激活");

    let servant = FnServant::new(|current: Current, params: Bytes| async move {
        match current.operation.as_str() {
            "reverse" => {
                let mut data = current
                    .read_params(&params, |input| input.read_byte_seq().map(<[u8]>::to_vec))?;
                data.reverse();
                current.write_result(|out| {
                    out.write_byte_seq(&data);
                    Ok(())
                })
            }
            _ => Err(DispatchError::OperationNotExist),
        }
    });
    let proxy = adapter
        .add(Arc::new(servant), Identity::new("reverser", ""))
        .expect("注册服务对象");
    let proxy = client
        .string_to_proxy(&proxy.to_string())
        .expect("解析代理字符串");
    proxy.ping().await.expect("ping");

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
    let compressed = proxy.with_compress(Some(true));
    let params = compressed
        .encode_params(|out| {
            out.write_byte_seq(&payload);
            Ok::<_, RpcError>(())
        })
        .expect("编码参数");
    let result = compressed
        .invoke("reverse", OperationMode::Normal, params)
        .await
        .expect("压缩调用");
    let reversed = compressed
        .decode_result(&result, |input| input.read_byte_seq().map(<[u8]>::to_vec))
        .expect("解码结果");
    let mut expected = payload.clone();
    expected.reverse();
    assert_eq!(reversed, expected);

    let connection = proxy.connection().await.expect("连接");
    assert_eq!(connection.endpoint().protocol(), "tcp");
    client.destroy().await;
    assert!(connection.state().is_closed());
    server.destroy().await;
    assert!(adapter.is_deactivated());
}

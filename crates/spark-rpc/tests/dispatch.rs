//! `dispatch` 集成测试：两个通信器经内存网络互联，走完代理 → 连接 → 适配器 → 服务对象的全链路。
//!
//! # 测试总览（Why）
//! - 内建操作、三张注册表的解析顺序以及“对象不存在”与“切面不存在”的区分；
//! - 服务对象定位器的 `finished` 在成功、失败与 panic 时都恰好执行一次；
//! - 适配器 `hold`/`activate`/`deactivate`/`destroy` 的生命周期语义；
//! - 批量单向调用在冲刷前不送达且保持顺序；
//! - 经远程定位器解析间接代理、经远程路由器登记代理，二者都只在首次解析时访问远端。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use spark_rpc::transport::{Endpoint, MemoryNetwork};
use spark_rpc::wire::{InputStream, OptionalFormat, OutputStream};
use spark_rpc::{
    AdapterState, Communicator, Cookie, Current, DispatchError, ErrorCategory, FnServant,
    Identity, ObjectAdapter, OperationMode, Proxy, Reference, RpcConfig, RpcError, Servant,
    ServantLocator,
};
use tokio::sync::{Notify, mpsc};

struct Env {
    server: Communicator,
    client: Communicator,
    adapter: ObjectAdapter,
}

impl Env {
    async fn new() -> Self {
        Self::with_config(RpcConfig::default()).await
    }

    async fn with_config(config: RpcConfig) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let build = |network: MemoryNetwork| {
            Communicator::builder()
                .with_config(config.clone())
                .without_tcp()
                .with_memory_network(network)
                .build()
                .expect("构造通信器")
        };
        let server = build(network.clone());
        let client = build(network);
        let adapter = server
            .create_object_adapter("server", &[Endpoint::memory("server")])
            .await
            .expect("创建适配器");
        adapter.activate().expect("激活适配器");
        Self {
            server,
            client,
            adapter,
        }
    }

    /// 把服务端代理转成字符串再在客户端解析，模拟跨进程传递。
    fn client_proxy(&self, proxy: &Proxy) -> Proxy {
        self.client
            .string_to_proxy(&proxy.to_string())
            .expect("解析代理字符串")
    }

    async fn shutdown(self) {
        self.client.destroy().await;
        self.server.destroy().await;
    }
}

/// `RUST_LOG=spark_rpc=debug` 时把运行时日志输出到测试捕获区。
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn echo_servant() -> Arc<dyn Servant> {
    Arc::new(
        FnServant::new(|current: Current, params: Bytes| async move {
            match current.operation.as_str() {
                "echo" => {
                    let text = current.read_params(&params, |input| input.read_string())?;
                    current.write_result(|out| {
                        out.write_string(&text.to_uppercase());
                        Ok(())
                    })
                }
                _ => Err(DispatchError::OperationNotExist),
            }
        })
        .with_type_ids(["::Demo::Echo"]),
    )
}

fn tagged(type_id: &'static str) -> Arc<dyn Servant> {
    Arc::new(
        FnServant::new(|_: Current, _: Bytes| async {
            Err::<Bytes, _>(DispatchError::OperationNotExist)
        })
        .with_type_ids([type_id]),
    )
}

async fn echo(proxy: &Proxy, text: &str) -> Result<String, RpcError> {
    let params = proxy.encode_params(|out| {
        out.write_string(text);
        Ok::<_, RpcError>(())
    })?;
    let result = proxy.invoke("echo", OperationMode::Normal, params).await?;
    proxy.decode_result(&result, |input| input.read_string())
}

fn string_params(proxy: &Proxy, text: &str) -> Bytes {
    proxy
        .encode_params(|out| {
            out.write_string(text);
            Ok::<_, RpcError>(())
        })
        .expect("编码参数")
}

#[tokio::test]
async fn builtin_operations_and_echo() {
    let env = Env::new().await;
    let proxy = env
        .adapter
        .add(echo_servant(), Identity::new("echo", ""))
        .expect("注册服务对象");
    let proxy = env.client_proxy(&proxy);

    proxy.ping().await.expect("ping");
    assert!(proxy.is_a("::Demo::Echo").await.expect("ice_isA"));
    assert!(!proxy.is_a("::Demo::Other").await.expect("ice_isA"));
    assert_eq!(
        proxy.ids().await.expect("ice_ids"),
        vec!["::Demo::Echo".to_owned(), "::Ice::Object".to_owned()]
    );
    assert_eq!(proxy.id().await.expect("ice_id"), "::Demo::Echo");
    assert_eq!(echo(&proxy, "hello").await.expect("echo"), "HELLO");

    let err = proxy
        .invoke("missing", OperationMode::Normal, proxy.empty_params())
        .await
        .expect_err("操作不存在");
    assert!(matches!(err, RpcError::OperationNotExist { .. }), "{err:?}");

    // 内建类型查询要求双向代理。
    let err = proxy.oneway().ids().await.expect_err("单向代理");
    assert!(matches!(err, RpcError::FeatureNotSupported(_)), "{err:?}");

    // 两次调用复用同一条连接。
    assert_eq!(env.client.connections().len(), 1);
    env.shutdown().await;
}

#[tokio::test]
async fn missing_object_and_missing_facet_are_distinguished() {
    let env = Env::new().await;
    let proxy = env
        .adapter
        .add(echo_servant(), Identity::new("echo", ""))
        .expect("注册服务对象");
    let proxy = env.client_proxy(&proxy);

    let err = proxy
        .with_identity(Identity::new("ghost", ""))
        .ping()
        .await
        .expect_err("对象不存在");
    assert!(matches!(err, RpcError::ObjectNotExist { .. }), "{err:?}");
    assert_eq!(err.category(), ErrorCategory::DispatchNotFound);

    let err = proxy
        .with_facet("admin")
        .ping()
        .await
        .expect_err("切面不存在");
    assert!(
        matches!(&err, RpcError::FacetNotExist { facet, .. } if facet == "admin"),
        "{err:?}"
    );
    env.shutdown().await;
}

#[tokio::test]
async fn resolution_prefers_exact_then_default_then_locator() {
    struct Fallback;

    #[async_trait]
    impl ServantLocator for Fallback {
        async fn locate(
            &self,
            _: &Current,
        ) -> Result<Option<(Arc<dyn Servant>, Cookie)>, DispatchError> {
            Ok(Some((tagged("::Located"), None)))
        }

        fn finished(&self, _: &Current, _: &Arc<dyn Servant>, _: Cookie) -> Result<(), DispatchError> {
            Ok(())
        }

        fn deactivate(&self, _: &str) {}
    }

    let env = Env::new().await;
    let adapter = &env.adapter;
    adapter
        .add(tagged("::Exact"), Identity::new("exact", "cat"))
        .expect("注册精确对象");
    adapter
        .add_default_servant(tagged("::Default"), "cat")
        .expect("注册默认服务对象");
    adapter
        .add_servant_locator(Arc::new(Fallback), "cat")
        .expect("注册定位器");

    let base = env.client_proxy(
        &adapter
            .create_proxy(Identity::new("exact", "cat"))
            .expect("创建代理"),
    );
    let other = base.with_identity(Identity::new("other", "cat"));
    assert_eq!(base.id().await.expect("精确匹配"), "::Exact");
    assert_eq!(other.id().await.expect("默认服务对象"), "::Default");

    adapter.remove_default_servant("cat").expect("注销默认服务对象");
    assert_eq!(other.id().await.expect("定位器"), "::Located");

    adapter.remove_servant_locator("cat").expect("注销定位器");
    let err = other.ping().await.expect_err("全部注销后不存在");
    assert!(matches!(err, RpcError::ObjectNotExist { .. }), "{err:?}");
    env.shutdown().await;
}

#[derive(Default)]
struct CountingLocator {
    located: AtomicUsize,
    finished: AtomicUsize,
    deactivated: Mutex<Vec<String>>,
}

#[async_trait]
impl ServantLocator for CountingLocator {
    async fn locate(
        &self,
        current: &Current,
    ) -> Result<Option<(Arc<dyn Servant>, Cookie)>, DispatchError> {
        if current.identity.name == "absent" {
            return Ok(None);
        }
        let ticket = self.located.fetch_add(1, Ordering::SeqCst);
        let servant: Arc<dyn Servant> = Arc::new(FnServant::new(
            |current: Current, _: Bytes| async move {
                match current.operation.as_str() {
                    "ok" | "fail_in_finished" => Ok(current.empty_result()),
                    "fail" => Err(DispatchError::UnknownUser("业务失败".into())),
                    "panic" => panic!("服务对象崩溃"),
                    _ => Err(DispatchError::OperationNotExist),
                }
            },
        ));
        let cookie: Cookie = Some(Arc::new(ticket));
        Ok(Some((servant, cookie)))
    }

    fn finished(
        &self,
        current: &Current,
        _: &Arc<dyn Servant>,
        cookie: Cookie,
    ) -> Result<(), DispatchError> {
        let ticket = cookie
            .and_then(|cookie| cookie.downcast::<usize>().ok())
            .map(|ticket| *ticket);
        assert!(ticket.is_some(), "cookie 应原样交回");
        self.finished.fetch_add(1, Ordering::SeqCst);
        if current.operation == "fail_in_finished" {
            return Err(DispatchError::UnknownLocal("finished 拒绝".into()));
        }
        Ok(())
    }

    fn deactivate(&self, category: &str) {
        self.deactivated.lock().push(category.to_owned());
    }
}

#[tokio::test]
async fn locator_finished_runs_exactly_once_per_located_dispatch() {
    let env = Env::new().await;
    let locator = Arc::new(CountingLocator::default());
    env.adapter
        .add_servant_locator(locator.clone(), "lazy")
        .expect("注册定位器");
    let proxy = env.client_proxy(
        &env.adapter
            .create_proxy(Identity::new("item", "lazy"))
            .expect("创建代理"),
    );
    let call = |operation: &'static str| {
        let proxy = proxy.clone();
        async move {
            proxy
                .invoke(operation, OperationMode::Normal, proxy.empty_params())
                .await
        }
    };

    call("ok").await.expect("成功分发");
    assert_eq!(locator.finished.load(Ordering::SeqCst), 1);

    let err = call("fail").await.expect_err("服务对象失败");
    assert!(matches!(err, RpcError::UnknownUser(_)), "{err:?}");
    assert_eq!(locator.finished.load(Ordering::SeqCst), 2);

    let err = call("panic").await.expect_err("服务对象 panic");
    assert!(matches!(err, RpcError::Unknown(_)), "{err:?}");
    assert_eq!(locator.finished.load(Ordering::SeqCst), 3);

    // finished 的错误替换分发结果。
    let err = call("fail_in_finished").await.expect_err("finished 失败");
    assert!(
        matches!(&err, RpcError::UnknownLocal(text) if text.contains("finished 拒绝")),
        "{err:?}"
    );
    assert_eq!(locator.finished.load(Ordering::SeqCst), 4);

    // 内建操作同样经过定位器。
    proxy.ping().await.expect("ping");
    assert_eq!(locator.located.load(Ordering::SeqCst), 5);
    assert_eq!(locator.finished.load(Ordering::SeqCst), 5);

    // locate 返回 None 时不调用 finished。
    let err = proxy
        .with_identity(Identity::new("absent", "lazy"))
        .ping()
        .await
        .expect_err("定位器找不到");
    assert!(matches!(err, RpcError::ObjectNotExist { .. }), "{err:?}");
    assert_eq!(locator.finished.load(Ordering::SeqCst), 5);

    env.adapter.destroy().await;
    assert_eq!(*locator.deactivated.lock(), vec!["lazy".to_owned()]);
    env.shutdown().await;
}

#[tokio::test]
async fn holding_adapter_queues_requests_until_activated() {
    let config = RpcConfig::default().with_invocation_timeout(Some(Duration::from_secs(2)));
    let env = Env::with_config(config).await;
    let proxy = env.client_proxy(
        &env.adapter
            .add(echo_servant(), Identity::new("echo", ""))
            .expect("注册服务对象"),
    );
    proxy.ping().await.expect("建立连接");

    env.adapter.hold().expect("挂起");
    assert_eq!(env.adapter.state(), AdapterState::Holding);
    env.adapter.wait_for_hold().await;
    let err = proxy
        .with_invocation_timeout(Some(Duration::from_millis(100)))
        .ping()
        .await
        .expect_err("挂起期间不分发");
    assert!(matches!(err, RpcError::InvocationTimeout), "{err:?}");

    // 代理未设置超时时沿用通信器配置。
    let err = proxy.ping().await.expect_err("配置超时");
    assert!(matches!(err, RpcError::InvocationTimeout), "{err:?}");

    env.adapter.activate().expect("重新激活");
    assert_eq!(echo(&proxy, "again").await.expect("激活后分发"), "AGAIN");
    env.shutdown().await;
}

#[tokio::test]
async fn deactivate_waits_for_in_flight_dispatches() {
    let env = Env::new().await;
    let release = Arc::new(Notify::new());
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let servant = {
        let release = Arc::clone(&release);
        FnServant::new(move |current: Current, _: Bytes| {
            let release = Arc::clone(&release);
            let entered_tx = entered_tx.clone();
            async move {
                let _ = entered_tx.send(());
                release.notified().await;
                Ok(current.empty_result())
            }
        })
    };
    let proxy = env.client_proxy(
        &env.adapter
            .add(Arc::new(servant), Identity::new("slow", ""))
            .expect("注册服务对象"),
    );

    let call = tokio::spawn({
        let proxy = proxy.clone();
        async move {
            proxy
                .invoke("block", OperationMode::Normal, proxy.empty_params())
                .await
        }
    });
    entered_rx.recv().await.expect("分发已开始");
    assert_eq!(env.adapter.in_flight(), 1);

    env.adapter.deactivate().await;
    assert_eq!(env.adapter.state(), AdapterState::Deactivating);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), env.adapter.wait_for_deactivate())
            .await
            .is_err(),
        "分发未结束前不应完成停用"
    );

    release.notify_one();
    env.adapter.wait_for_deactivate().await;
    assert!(env.adapter.is_deactivated());
    call.await
        .expect("调用任务")
        .expect("进行中的分发照常回复");

    env.adapter.destroy().await;
    assert_eq!(env.adapter.state(), AdapterState::Destroyed);
    assert!(env.server.find_object_adapter("server").is_none());
    let err = env
        .adapter
        .add(echo_servant(), Identity::new("late", ""))
        .expect_err("销毁后不能注册");
    assert!(matches!(err, RpcError::AdapterDeactivated(_)), "{err:?}");
    env.adapter.destroy().await;
    env.shutdown().await;
}

#[tokio::test]
async fn batch_requests_wait_for_flush_and_keep_order() {
    let env = Env::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let servant = FnServant::new(move |current: Current, params: Bytes| {
        let tx = tx.clone();
        async move {
            let text = current.read_params(&params, |input| input.read_string())?;
            let _ = tx.send((text, current.is_oneway()));
            Ok(current.empty_result())
        }
    });
    let proxy = env.client_proxy(
        &env.adapter
            .add(Arc::new(servant), Identity::new("sink", ""))
            .expect("注册服务对象"),
    );
    let batch = proxy.batch_oneway();
    for i in 0..5 {
        let result = batch
            .invoke("record", OperationMode::Normal, string_params(&batch, &i.to_string()))
            .await
            .expect("加入批量队列");
        assert!(result.is_empty());
    }
    let connection = batch.connection().await.expect("批量连接");
    assert_eq!(connection.batch_request_count(), 5);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "冲刷前不应送达");

    batch.flush_batch_requests().await.expect("冲刷");
    assert_eq!(connection.batch_request_count(), 0);
    let mut received = Vec::new();
    for _ in 0..5 {
        let (text, oneway) = rx.recv().await.expect("收到批量请求");
        assert!(oneway);
        received.push(text);
    }
    assert_eq!(received, ["0", "1", "2", "3", "4"]);

    // 单向调用写出即返回，随后送达。
    proxy
        .oneway()
        .invoke("record", OperationMode::Normal, string_params(&proxy, "solo"))
        .await
        .expect("单向调用");
    let (text, oneway) = rx.recv().await.expect("收到单向请求");
    assert_eq!(text, "solo");
    assert!(oneway);
    env.shutdown().await;
}

#[tokio::test]
async fn registry_and_adapter_names_reject_duplicates() {
    let env = Env::new().await;
    let identity = Identity::new("dup", "");
    env.adapter
        .add(echo_servant(), identity.clone())
        .expect("首次注册");
    let err = env
        .adapter
        .add(echo_servant(), identity.clone())
        .expect_err("重复注册");
    assert!(matches!(err, RpcError::AlreadyRegistered { .. }), "{err:?}");
    assert_eq!(err.code(), "spark.rpc.registry.already_registered");

    env.adapter
        .add_facet(echo_servant(), identity.clone(), "admin")
        .expect("注册切面");
    assert_eq!(env.adapter.find_all_facets(&identity).len(), 2);
    env.adapter.remove(&identity).expect("注销默认切面");
    assert!(env.adapter.has_servant(&identity));
    let err = env.adapter.remove(&identity).err().expect("重复注销");
    assert!(matches!(err, RpcError::NotRegistered { .. }), "{err:?}");

    let generated = env
        .adapter
        .add_with_uuid(echo_servant())
        .expect("UUID 身份");
    assert!(!generated.identity().name.is_empty());
    env.client_proxy(&generated).ping().await.expect("UUID 对象可达");

    let err = env
        .server
        .create_object_adapter("server", &[Endpoint::memory("other")])
        .await
        .expect_err("适配器名称冲突");
    assert!(matches!(err, RpcError::AlreadyRegistered { .. }), "{err:?}");
    let err = env
        .adapter
        .create_proxy(Identity::new("", "cat"))
        .expect_err("空名称身份");
    assert!(matches!(err, RpcError::IllegalIdentity(_)), "{err:?}");
    env.shutdown().await;
}

/// 编码单个代理作为返回值封装。
fn proxy_result(current: &Current, reference: Option<&Reference>) -> Result<Bytes, DispatchError> {
    let mut out = OutputStream::with_encoding(current.encoding);
    out.start_encapsulation();
    match reference {
        Some(reference) => reference.write(&mut out)?,
        None => Reference::write_null(&mut out),
    }
    out.end_encapsulation()?;
    Ok(out.into_bytes())
}

#[tokio::test]
async fn remote_locator_resolves_and_caches_indirect_proxies() {
    let env = Env::new().await;
    env.adapter
        .add(echo_servant(), Identity::new("echo", ""))
        .expect("注册 echo");
    env.adapter
        .add(echo_servant(), Identity::new("printer", ""))
        .expect("注册知名对象");
    let published = env.adapter.published_endpoints();
    let lookups = Arc::new(AtomicUsize::new(0));
    let locator = {
        let lookups = Arc::clone(&lookups);
        FnServant::new(move |current: Current, params: Bytes| {
            let lookups = Arc::clone(&lookups);
            let published = published.clone();
            async move {
                lookups.fetch_add(1, Ordering::SeqCst);
                match current.operation.as_str() {
                    "findAdapterById" => {
                        let id = current.read_params(&params, |input| input.read_string())?;
                        if id != "hello" {
                            // 以用户异常表示未注册。
                            return Err(DispatchError::UserException(current.empty_result()));
                        }
                        let direct = Reference::direct(Identity::new("dummy", ""), published);
                        proxy_result(&current, Some(&direct))
                    }
                    "findObjectById" => {
                        let identity = current.read_params(&params, Identity::read)?;
                        if identity.name != "printer" {
                            return Err(DispatchError::UserException(current.empty_result()));
                        }
                        let indirect = Reference::indirect(identity, "hello");
                        proxy_result(&current, Some(&indirect))
                    }
                    _ => Err(DispatchError::OperationNotExist),
                }
            }
        })
    };
    let locator = env.client_proxy(
        &env.adapter
            .add(Arc::new(locator), Identity::new("Locator", "IceGrid"))
            .expect("注册定位器"),
    );
    env.client.set_default_locator(Some(&locator));

    let target = env.client.string_to_proxy("echo @ hello").expect("间接代理");
    assert!(target.locator().is_some());
    assert_eq!(echo(&target, "via").await.expect("经定位器调用"), "VIA");
    target.ping().await.expect("缓存命中");
    assert_eq!(lookups.load(Ordering::SeqCst), 1);

    // 知名对象先查对象，再按结果中的适配器标识解析。
    let printer = env.client.string_to_proxy("printer").expect("知名代理");
    printer.ping().await.expect("知名对象可达");
    assert_eq!(lookups.load(Ordering::SeqCst), 2);

    let err = env
        .client
        .string_to_proxy("echo @ nowhere")
        .expect("间接代理")
        .ping()
        .await
        .expect_err("未注册的适配器");
    assert!(matches!(err, RpcError::NotRegistered { .. }), "{err:?}");

    // 显式取消定位器后间接代理无从解析。
    let err = target.with_locator(None).ping().await.expect_err("无定位器");
    assert!(matches!(err, RpcError::NoEndpoint(_)), "{err:?}");
    env.shutdown().await;
}

#[tokio::test]
async fn remote_router_registers_each_proxy_once() {
    let env = Env::new().await;
    let direct = env
        .adapter
        .add(echo_servant(), Identity::new("echo", ""))
        .expect("注册 echo");
    let client_proxy_calls = Arc::new(AtomicUsize::new(0));
    let added = Arc::new(Mutex::new(Vec::<Identity>::new()));
    let router = {
        let client_proxy_calls = Arc::clone(&client_proxy_calls);
        let added = Arc::clone(&added);
        FnServant::new(move |current: Current, params: Bytes| {
            let client_proxy_calls = Arc::clone(&client_proxy_calls);
            let added = Arc::clone(&added);
            async move {
                match current.operation.as_str() {
                    "getClientProxy" => {
                        client_proxy_calls.fetch_add(1, Ordering::SeqCst);
                        current.write_result(|out| {
                            Reference::write_null(out);
                            if out.write_optional(1, OptionalFormat::F1)? {
                                out.write_bool(true);
                            }
                            Ok(())
                        })
                    }
                    "getServerProxy" => proxy_result(&current, None),
                    "addProxies" => {
                        let mut input = InputStream::new(&params);
                        input.start_encapsulation()?;
                        let count = input.read_size()?;
                        for _ in 0..count {
                            if let Some(reference) = Reference::read(&mut input)? {
                                added.lock().push(reference.identity);
                            }
                        }
                        input.end_encapsulation()?;
                        current.write_result(|out| {
                            out.write_size(0);
                            Ok(())
                        })
                    }
                    _ => Err(DispatchError::OperationNotExist),
                }
            }
        })
    };
    let router = env.client_proxy(
        &env.adapter
            .add(Arc::new(router), Identity::new("router", "Glacier2"))
            .expect("注册路由器"),
    );

    let routed = env.client_proxy(&direct).with_router(Some(&router));
    assert!(routed.router().is_some());
    assert_eq!(echo(&routed, "one").await.expect("经路由器调用"), "ONE");
    routed.ping().await.expect("再次调用");
    assert_eq!(client_proxy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*added.lock(), vec![Identity::new("echo", "")]);
    assert!(
        routed
            .router()
            .expect("路由信息")
            .is_registered(&Identity::new("echo", ""))
    );
    env.shutdown().await;
}

#[tokio::test]
async fn communicator_destroy_closes_connections_and_rejects_calls() {
    let env = Env::new().await;
    let proxy = env.client_proxy(
        &env.adapter
            .add(echo_servant(), Identity::new("echo", ""))
            .expect("注册服务对象"),
    );
    proxy.ping().await.expect("建立连接");
    let connection = proxy.connection().await.expect("获取连接");

    env.client.destroy().await;
    assert!(env.client.is_destroyed());
    assert!(connection.state().is_closed());
    let err = proxy.ping().await.expect_err("通信器已销毁");
    assert!(matches!(err, RpcError::CommunicatorDestroyed), "{err:?}");

    env.server.destroy().await;
    assert_eq!(env.adapter.state(), AdapterState::Destroyed);
}

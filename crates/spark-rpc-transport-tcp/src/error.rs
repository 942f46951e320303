//! TCP 操作的稳定错误码。

use spark_rpc_transport::OperationKind;

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.resolve_failed",
    message: "tcp resolve",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.rpc.transport.tcp.configure_failed",
    message: "tcp configure",
};

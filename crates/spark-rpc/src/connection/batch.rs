//! 批量请求队列。

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::CompressBatch;
use crate::error::RpcResult;
use crate::protocol::{HEADER_SIZE, MessageType, finish_message, start_message};

/// 按入队顺序累积已编码（不含请求编号）的请求。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `push`：追加一条请求，`compress` 记录该请求的代理是否要求压缩；
/// - `would_overflow`：追加 `len` 字节后整帧是否超过 `limit`（`limit = 0` 表示不限）；
/// - `take`：取走全部请求并生成一帧 `BatchRequest`，队列为空时返回 `None`。
#[derive(Debug, Default)]
pub(crate) struct BatchQueue {
    body: BytesMut,
    count: usize,
    compress: bool,
}

impl BatchQueue {
    pub(crate) fn push(&mut self, encoded: &[u8], compress: bool) {
        self.body.put_slice(encoded);
        self.count += 1;
        self.compress |= compress;
    }

    pub(crate) fn would_overflow(&self, len: usize, limit: usize) -> bool {
        limit > 0 && self.count > 0 && HEADER_SIZE + 4 + self.body.len() + len > limit
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn take(&mut self, policy: CompressBatch) -> RpcResult<Option<(usize, Bytes)>> {
        if self.count == 0 {
            return Ok(None);
        }
        let body = std::mem::take(&mut self.body);
        let count = std::mem::take(&mut self.count);
        let requested = std::mem::take(&mut self.compress);
        let compress = match policy {
            CompressBatch::Yes => true,
            CompressBatch::No => false,
            CompressBatch::BasedOnProxy => requested,
        };
        let mut out = start_message(MessageType::BatchRequest);
        out.write_i32(i32::try_from(count).unwrap_or(i32::MAX));
        out.write_raw(&body);
        Ok(Some((count, finish_message(out, compress)?)))
    }

    pub(crate) fn clear(&mut self) {
        self.body.clear();
        self.count = 0;
        self.compress = false;
    }
}

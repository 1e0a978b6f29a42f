//! Progressive Collapsed Forwarding
//!
//! When several clients concurrently request the same non-cacheable
//! object, a single upstream fetch feeds all of them. The producer task
//! appends immutable 32 KiB blocks to an append-only vector and publishes
//! its progress over a watch channel; each consumer streams blocks from
//! index zero at its own pace and parks on the channel when it catches up
//! to the producer head. Consumers therefore observe byte-for-byte the
//! upstream order, regardless of when they subscribed.

use super::Body;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Upstream reads are republished in blocks of this size
pub const HTTP_BLOCK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcfState {
    Open,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    blocks: usize,
    state: PcfState,
}

/// Single-producer, many-consumer byte pump for one in-flight fetch
pub struct ProgressiveCollapseForwarder {
    status: StatusCode,
    headers: HeaderMap,
    content_length: u64,
    blocks: RwLock<Vec<Bytes>>,
    progress: watch::Sender<Progress>,
}

impl ProgressiveCollapseForwarder {
    /// Create a forwarder for a response whose length is known. The
    /// status and headers captured here are what every consumer observes.
    pub fn new(status: StatusCode, headers: HeaderMap, content_length: u64) -> Arc<Self> {
        let (progress, _) = watch::channel(Progress {
            blocks: 0,
            state: PcfState::Open,
        });
        Arc::new(ProgressiveCollapseForwarder {
            status,
            headers,
            content_length,
            blocks: RwLock::new(Vec::new()),
            progress,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Append upstream bytes, re-chunked to the block size, and wake
    /// waiting consumers.
    pub fn append(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let block_count = {
            let mut blocks = self.blocks.write().unwrap();
            let mut rest = data;
            while rest.len() > HTTP_BLOCK_SIZE {
                blocks.push(rest.split_to(HTTP_BLOCK_SIZE));
            }
            blocks.push(rest);
            blocks.len()
        };
        self.progress.send_replace(Progress {
            blocks: block_count,
            state: PcfState::Open,
        });
    }

    /// Mark the upstream fetch complete
    pub fn close(&self) {
        let block_count = self.blocks.read().unwrap().len();
        self.progress.send_replace(Progress {
            blocks: block_count,
            state: PcfState::Done,
        });
    }

    /// Mark the upstream fetch failed. Consumers receive the bytes read
    /// so far and then a truncated end of body.
    pub fn fail(&self) {
        let block_count = self.blocks.read().unwrap().len();
        self.progress.send_replace(Progress {
            blocks: block_count,
            state: PcfState::Failed,
        });
    }

    /// Subscribe a downstream writer. Returns a streaming body that
    /// replays every block from the beginning and then follows the
    /// producer until it closes.
    pub fn add_client(self: &Arc<Self>) -> Body {
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
        let pcf = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx_progress = pcf.progress.subscribe();
            let mut next_block = 0usize;
            loop {
                let progress = *rx_progress.borrow_and_update();
                while next_block < progress.blocks {
                    let block = {
                        let blocks = pcf.blocks.read().unwrap();
                        blocks[next_block].clone()
                    };
                    if tx.send(Ok(Frame::data(block))).await.is_err() {
                        // downstream went away; the producer carries on
                        // for the remaining consumers
                        debug!("collapsed forwarding consumer detached");
                        return;
                    }
                    next_block += 1;
                }
                match progress.state {
                    PcfState::Done if next_block >= progress.blocks => return,
                    PcfState::Failed => return,
                    _ => {
                        if rx_progress.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        StreamBody::new(ReceiverStream::new(rx)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn collect_body(body: Body) -> Bytes {
        body.collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_single_consumer_receives_all_bytes() {
        let pcf = ProgressiveCollapseForwarder::new(StatusCode::OK, HeaderMap::new(), 10);
        let body = pcf.add_client();
        pcf.append(Bytes::from_static(b"hello "));
        pcf.append(Bytes::from_static(b"world"));
        pcf.close();
        assert_eq!(collect_body(body).await, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_from_start() {
        let pcf = ProgressiveCollapseForwarder::new(StatusCode::OK, HeaderMap::new(), 10);
        pcf.append(Bytes::from_static(b"abc"));
        pcf.append(Bytes::from_static(b"def"));
        // subscribe after bytes already flowed
        let body = pcf.add_client();
        pcf.append(Bytes::from_static(b"ghi"));
        pcf.close();
        assert_eq!(collect_body(body).await, Bytes::from_static(b"abcdefghi"));
    }

    #[tokio::test]
    async fn test_all_consumers_receive_identical_bytes() {
        let pcf = ProgressiveCollapseForwarder::new(StatusCode::OK, HeaderMap::new(), 0);
        let bodies: Vec<Body> = (0..8).map(|_| pcf.add_client()).collect();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(70_000) {
            pcf.append(Bytes::copy_from_slice(chunk));
        }
        pcf.close();
        for body in bodies {
            assert_eq!(collect_body(body).await, Bytes::from(payload.clone()));
        }
    }

    #[tokio::test]
    async fn test_large_appends_are_rechunked() {
        let pcf = ProgressiveCollapseForwarder::new(StatusCode::OK, HeaderMap::new(), 0);
        pcf.append(Bytes::from(vec![1u8; HTTP_BLOCK_SIZE * 3 + 17]));
        assert_eq!(pcf.blocks.read().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_producer_failure_truncates_consumers() {
        let pcf = ProgressiveCollapseForwarder::new(StatusCode::OK, HeaderMap::new(), 100);
        let body = pcf.add_client();
        pcf.append(Bytes::from_static(b"partial"));
        pcf.fail();
        // consumer receives what was read before the failure, then EOF
        assert_eq!(collect_body(body).await, Bytes::from_static(b"partial"));
    }

    #[tokio::test]
    async fn test_dropped_consumer_does_not_block_producer() {
        let pcf = ProgressiveCollapseForwarder::new(StatusCode::OK, HeaderMap::new(), 0);
        let dropped = pcf.add_client();
        let kept = pcf.add_client();
        drop(dropped);
        // more than the channel buffer's worth of blocks
        for _ in 0..64 {
            pcf.append(Bytes::from(vec![9u8; HTTP_BLOCK_SIZE]));
        }
        pcf.close();
        let collected = collect_body(kept).await;
        assert_eq!(collected.len(), 64 * HTTP_BLOCK_SIZE);
    }
}

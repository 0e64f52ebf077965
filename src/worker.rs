//! The per-worker data plane (spec.md §4.I): a single-threaded async loop
//! that serves HTTP connections, streams payloads to/from the data file,
//! and exchanges fixed-size messages with the controller through its two
//! mailboxes. Everything here lives on one `tokio::task::LocalSet` — no
//! locks, no cross-worker sharing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use buddy_core::{next_power_of_two, offset as block_offset, BlockMetadata, SizeClass};
use buddy_mailbox::{PoolSet, Receiver, Sender};
use buddy_proto::{ErrorCode, PendingEntry, PendingTable, Reply, Request, RequestHeader, RequestKind};
use tokio::sync::oneshot;
use tracing::warn;

/// Maximum payload accepted by `PUT /block` (spec.md §1, §6).
pub const MAX_PAYLOAD_BYTES: u64 = 512 * 1024;

struct WorkerCore {
    id: u16,
    to_controller: Sender<Request>,
    from_controller: Receiver<Reply>,
    pools: PoolSet,
    pending: PendingTable,
    completions: HashMap<u64, oneshot::Sender<Reply>>,
    refill_in_flight: HashMap<u64, SizeClass>,
}

impl WorkerCore {
    /// Pushes to the controller's inbox, retrying briefly if the ring is
    /// momentarily full. The ring is sized generously (default 4096) relative
    /// to one worker's in-flight request count, so this should not spin long.
    fn send(&self, request: Request) {
        let mut request = request;
        loop {
            match self.to_controller.try_push(request) {
                Ok(()) => return,
                Err(rejected) => {
                    request = rejected;
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// A cheap, cloneable handle to a worker's shared state. Connection tasks
/// hold a clone; the pump task holds the canonical reference.
#[derive(Clone)]
pub struct WorkerHandle {
    core: Rc<RefCell<WorkerCore>>,
}

impl WorkerHandle {
    pub fn new(
        id: u16,
        to_controller: Sender<Request>,
        from_controller: Receiver<Reply>,
        pool_target_free: [usize; SizeClass::POOLABLE.len()],
    ) -> Self {
        Self {
            core: Rc::new(RefCell::new(WorkerCore {
                id,
                to_controller,
                from_controller,
                pools: PoolSet::new(pool_target_free),
                pending: PendingTable::new(),
                completions: HashMap::new(),
                refill_in_flight: HashMap::new(),
            })),
        }
    }

    /// Sends a request to the controller and awaits the matching reply.
    pub async fn call(&self, client_id: u64, hash: Option<[u8; 32]>, build: impl FnOnce(RequestHeader) -> Request) -> Reply {
        let (tx, rx) = oneshot::channel();
        {
            let mut core = self.core.borrow_mut();
            let request_id = core.pending.next_id();
            let header = RequestHeader {
                worker_id: core.id,
                request_id,
            };
            let request = build(header);
            let kind = request.kind();
            core.pending.insert(
                request_id,
                PendingEntry {
                    client_id,
                    kind,
                    hash,
                    reserved_block: None,
                },
            );
            core.completions.insert(request_id, tx);
            core.send(request);
        }
        rx.await.expect("controller reply sender dropped before replying")
    }

    /// Pops a pre-reserved block for `class` from the local pool, if any
    /// (spec.md §4.H, §4.I.1 step 3).
    pub fn acquire_pooled(&self, class: SizeClass) -> Option<BlockMetadata> {
        self.core.borrow_mut().pools.pool_mut(class).acquire()
    }

    /// Runs forever: replenishes pools, then drains controller replies. Must
    /// be spawned once per worker alongside the HTTP accept loop.
    pub async fn run_pump(&self, poll_sleep: Duration) {
        loop {
            self.replenish_pools();
            self.drain_replies();
            tokio::time::sleep(poll_sleep).await;
        }
    }

    fn replenish_pools(&self) {
        let mut core = self.core.borrow_mut();
        let classes: Vec<SizeClass> = core.pools.classes_needing_refill().collect();
        for class in classes {
            let request_id = core.pending.next_id();
            let header = RequestHeader {
                worker_id: core.id,
                request_id,
            };
            core.pending.insert(
                request_id,
                PendingEntry {
                    client_id: 0,
                    kind: RequestKind::Allocate,
                    hash: None,
                    reserved_block: None,
                },
            );
            core.refill_in_flight.insert(request_id, class);
            core.send(Request::AllocateBlock { header, class });
        }
    }

    fn drain_replies(&self) {
        let mut core = self.core.borrow_mut();
        let replies = core.from_controller.try_pop_batch();
        for reply in replies {
            let request_id = reply.header().request_id;

            if let Some(class) = core.refill_in_flight.remove(&request_id) {
                core.pending.take(request_id);
                match reply {
                    Reply::AllocateResult { class: got, block_num, .. } => {
                        let meta = BlockMetadata {
                            size_class: got,
                            block_num,
                            buddy_num: buddy_core::size_class::buddy_of(block_num),
                            data_size: 0,
                        };
                        core.pools.pool_mut(class).release(meta);
                    }
                    Reply::ErrorResult { code, .. } => {
                        warn!(?code, ?class, "pool replenishment allocate_block failed");
                    }
                    other => {
                        warn!(?other, "unexpected reply kind for pool replenishment");
                    }
                }
                continue;
            }

            match core.completions.remove(&request_id) {
                Some(tx) => {
                    core.pending.take(request_id);
                    let _ = tx.send(reply);
                }
                None => {
                    warn!(request_id, "discarding reply for unknown or already-completed request");
                }
            }
        }
    }
}

/// Resolves the destination class and offset for a PUT of `content_length`
/// bytes, acquiring a pooled block or falling back to a direct allocate
/// call (spec.md §4.I.1 step 2-3).
pub async fn reserve_block_for_put(handle: &WorkerHandle, client_id: u64, content_length: u64) -> Result<BlockMetadata, ErrorCode> {
    let class = next_power_of_two(content_length).ok_or(ErrorCode::InvalidSize)?;
    if let Some(meta) = handle.acquire_pooled(class) {
        return Ok(meta);
    }
    let reply = handle
        .call(client_id, None, |header| Request::AllocateBlock { header, class })
        .await;
    match reply {
        Reply::AllocateResult { class, block_num, .. } => Ok(BlockMetadata {
            size_class: class,
            block_num,
            buddy_num: buddy_core::size_class::buddy_of(block_num),
            data_size: 0,
        }),
        Reply::ErrorResult { code, .. } => Err(code),
        _ => Err(ErrorCode::Internal),
    }
}

pub fn offset_of(meta: &BlockMetadata) -> u64 {
    block_offset(meta.size_class, meta.block_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailboxes() -> ((Sender<Request>, Receiver<Request>), (Sender<Reply>, Receiver<Reply>)) {
        (buddy_mailbox::mailbox(8).unwrap(), buddy_mailbox::mailbox(8).unwrap())
    }

    #[test]
    fn pool_replenishment_feeds_pool_from_allocate_result() {
        let ((to_controller, from_worker), (to_worker, from_controller)) = mailboxes();
        let handle = WorkerHandle::new(0, to_controller, from_controller, [1; SizeClass::POOLABLE.len()]);

        handle.replenish_pools();

        let req = from_worker.try_pop().expect("replenishment should have sent a request");
        let Request::AllocateBlock { header, class } = req else {
            panic!("expected AllocateBlock");
        };
        assert_eq!(class, SizeClass::K4);

        to_worker
            .try_push(Reply::AllocateResult {
                header,
                offset: 0,
                class,
                block_num: 0,
            })
            .unwrap();

        handle.drain_replies();
        assert!(handle.acquire_pooled(SizeClass::K4).is_some());
    }
}

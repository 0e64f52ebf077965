//! The batch controller (spec.md §4.F): the single writer against the
//! metadata store. Owns one inbox/outbox pair per worker, drains them every
//! cycle, groups by request kind in the fixed execution order, and commits
//! one metadata transaction per cycle.

use std::time::{Duration, Instant};

use buddy_core::{allocator, AllocatorError, DataFile, MetadataStore};
use buddy_mailbox::{Receiver, Sender};
use buddy_proto::{ErrorCode, Reply, Request, RequestKind};
use tracing::{error, warn};

pub struct ControllerConfig {
    pub idle_interval: Duration,
    pub idempotent_duplicate_hash: bool,
}

pub struct Controller<S: MetadataStore> {
    store: S,
    data_file: Box<dyn DataFile>,
    inboxes: Vec<Receiver<Request>>,
    outboxes: Vec<Sender<Reply>>,
    config: ControllerConfig,
}

impl<S: MetadataStore> Controller<S> {
    pub fn new(
        store: S,
        data_file: Box<dyn DataFile>,
        inboxes: Vec<Receiver<Request>>,
        outboxes: Vec<Sender<Reply>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            data_file,
            inboxes,
            outboxes,
            config,
        }
    }

    /// Runs `recover_temp` once. Must complete before any worker accepts
    /// connections (spec.md §4.D.4).
    pub fn recover(&self) -> Result<(), AllocatorError> {
        let mut txn = self.store.begin().map_err(|source| AllocatorError::Store { source })?;
        allocator::recover_temp(txn.as_mut())?;
        txn.commit().map_err(|source| AllocatorError::Store { source })?;
        Ok(())
    }

    /// Validates invariant 5 and tallies free/temp/occupied blocks per
    /// class. Must run after `recover` and before any worker accepts
    /// connections.
    pub fn self_check(&self) -> Result<allocator::ClassCounts, AllocatorError> {
        let mut txn = self.store.begin_read().map_err(|source| AllocatorError::Store { source })?;
        let counts = allocator::startup_self_check(txn.as_mut(), self.data_file.as_ref())?;
        txn.abort().map_err(|source| AllocatorError::Store { source })?;
        Ok(counts)
    }

    /// Runs the cycle loop until `running` is cleared. `running` is checked
    /// once per cycle, after the adaptive pause, so a shutdown signal is
    /// observed promptly but never mid-transaction. Once the loop exits, one
    /// last cycle drains whatever arrived in the inboxes since the final
    /// check, so no worker is left waiting on a reply that never comes.
    pub fn run(&mut self, running: &std::sync::atomic::AtomicBool) {
        let mut before_run = Instant::now();
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            let elapsed = before_run.elapsed();
            if elapsed < self.config.idle_interval {
                std::thread::sleep(self.config.idle_interval - elapsed);
            }
            before_run = Instant::now();

            self.run_cycle();
        }
        self.run_cycle();
    }

    fn run_cycle(&mut self) {
        let mut batches: [Vec<Request>; 5] = [Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        for inbox in &self.inboxes {
            for req in inbox.try_pop_batch() {
                let idx = kind_index(req.kind());
                batches[idx].push(req);
            }
        }

        let batch_size: usize = batches.iter().map(Vec::len).sum();
        if batch_size == 0 {
            return;
        }
        metrics::histogram!("buddy_blocks_controller_batch_size").record(batch_size as f64);
        let cycle_start = Instant::now();

        let mut replies = Vec::new();
        let txn = self.store.begin();
        let mut txn = match txn {
            Ok(txn) => txn,
            Err(source) => {
                error!(error = %source, "failed to open controller transaction");
                self.fan_out_errors(&batches, ErrorCode::Internal);
                return;
            }
        };

        for kind in RequestKind::EXECUTION_ORDER {
            let batch = std::mem::take(&mut batches[kind_index(kind)]);
            for req in batch {
                match handle_request(txn.as_mut(), self.data_file.as_ref(), &req, self.config.idempotent_duplicate_hash) {
                    Ok(reply) => {
                        if matches!(kind, RequestKind::GetAddress) {
                            self.dispatch(reply);
                        } else {
                            replies.push(reply);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, kind = ?kind, "controller handler error");
                        let reply = Reply::ErrorResult {
                            header: req.header(),
                            code: ErrorCode::from_allocator_code(err.code()),
                        };
                        if matches!(kind, RequestKind::GetAddress) {
                            self.dispatch(reply);
                        } else {
                            replies.push(reply);
                        }
                    }
                }
            }
        }

        if let Err(source) = txn.commit() {
            error!(error = %source, "controller transaction commit failed");
            for reply in replies {
                self.dispatch(Reply::ErrorResult {
                    header: reply.header(),
                    code: ErrorCode::Internal,
                });
            }
            return;
        }
        metrics::histogram!("buddy_blocks_controller_cycle_seconds").record(cycle_start.elapsed().as_secs_f64());

        for reply in replies {
            self.dispatch(reply);
        }
    }

    fn fan_out_errors(&self, batches: &[Vec<Request>; 5], code: ErrorCode) {
        for batch in batches {
            for req in batch {
                self.dispatch(Reply::ErrorResult {
                    header: req.header(),
                    code,
                });
            }
        }
    }

    /// Pushes to the worker's outbox, retrying with a bounded pause if the
    /// ring is momentarily full (spec.md §4.F "Backpressure on outboxes").
    fn dispatch(&self, reply: Reply) {
        let worker_id = reply.header().worker_id as usize;
        let Some(outbox) = self.outboxes.get(worker_id) else {
            warn!(worker_id, "dropping reply for unknown worker id");
            return;
        };
        let mut reply = reply;
        loop {
            match outbox.try_push(reply) {
                Ok(()) => return,
                Err(rejected) => {
                    reply = rejected;
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }
}

fn kind_index(kind: RequestKind) -> usize {
    match kind {
        RequestKind::GetAddress => 0,
        RequestKind::Release => 1,
        RequestKind::Allocate => 2,
        RequestKind::Occupy => 3,
        RequestKind::HasBlock => 4,
    }
}

fn handle_request(
    txn: &mut dyn buddy_core::Transaction,
    data_file: &dyn DataFile,
    req: &Request,
    idempotent_duplicate_hash: bool,
) -> Result<Reply, AllocatorError> {
    let header = req.header();
    match *req {
        Request::AllocateBlock { class, .. } => {
            let meta = allocator::allocate_to_temp(txn, data_file, class)?;
            Ok(Reply::AllocateResult {
                header,
                offset: meta.offset(),
                class: meta.size_class,
                block_num: meta.block_num,
            })
        }
        Request::OccupyBlock {
            hash,
            class,
            block_num,
            data_size,
            ..
        } => {
            let meta = buddy_core::BlockMetadata {
                size_class: class,
                block_num,
                buddy_num: buddy_core::size_class::buddy_of(block_num),
                data_size,
            };
            let result = allocator::occupy_from_temp(txn, &hash, meta);
            let meta = match result {
                Ok(()) => meta,
                Err(AllocatorError::BlockAlreadyExists) if idempotent_duplicate_hash => {
                    allocator::get(txn, &hash)?
                }
                Err(err) => return Err(err),
            };
            Ok(Reply::OccupyResult {
                header,
                offset: meta.offset(),
                data_size: meta.data_size,
            })
        }
        Request::ReleaseBlock { hash, .. } => {
            allocator::release(txn, &hash)?;
            Ok(Reply::ReleaseResult { header })
        }
        Request::GetAddress { hash, .. } => {
            let meta = allocator::get(txn, &hash)?;
            Ok(Reply::GetAddressResult {
                header,
                offset: meta.offset(),
                data_size: meta.data_size,
            })
        }
        Request::HasBlock { hash, .. } => {
            let exists = allocator::has(txn, &hash)?;
            Ok(Reply::HasBlockResult { header, exists })
        }
    }
}

//! Accelerator batching seam. The fluid kernels operate on fixed-size
//! rectangular tiles, so offload targets only need paired host buffers per
//! sandglass and a small pool of asynchronous queues. The in-tree executor
//! runs the CPU kernels on such a queue pool and stands in for a device; a
//! real device backend implements `FluidOffload` outside the crate.

use core_affinity::{get_core_ids, set_for_current};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::solvers::{FluidKernel, FluxPlanes, KernelParams};
use crate::{Real, PS2};

/// One batch of patch-group work: the padded input tiles (host-side
/// buffers) and the group base indices they came from.
pub struct FluidBatch {
    pub params: KernelParams,
    pub bases: Vec<usize>,
    pub tiles: Vec<Vec<Real>>,
}

/// What comes back from a completed batch, in the order of `bases`.
pub struct BatchResult {
    pub bases: Vec<usize>,
    pub outputs: Vec<Vec<Real>>,
    pub planes: Vec<FluxPlanes>,
}

/// Opaque completion token for an enqueued batch.
pub struct CompletionToken {
    receiver: Receiver<BatchResult>,
}

impl CompletionToken {
    /// Block until the batch has been executed.
    pub fn wait(self) -> BatchResult {
        self.receiver
            .recv()
            .expect("offload executor dropped a batch")
    }
}

/// The contract the driver consumes: enqueue a batch, receive a token, and
/// collect the result at the next synchronization point.
pub trait FluidOffload {
    /// Largest number of patch groups per batch the target's buffers hold.
    fn batch_capacity(&self) -> usize;

    fn enqueue(&self, batch: FluidBatch) -> CompletionToken;
}

/// Per-batch work item on a queue: the batch plus the channel its result
/// goes back on.
type BatchJob = (FluidBatch, Sender<BatchResult>);

/// How many batches one queue holds before `enqueue` blocks: one being
/// solved plus one staged, mirroring the paired host buffers per sandglass.
const QUEUE_DEPTH: usize = 2;

struct Queue {
    sender: Option<Sender<BatchJob>>,
    handle: Option<thread::JoinHandle<()>>,
    backlog: Arc<AtomicUsize>,
}

impl Drop for Queue {
    fn drop(&mut self) {
        // closing the channel drains the worker loop
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            handle.join().expect("offload queue worker panicked");
        }
    }
}

/// A small pool of asynchronous batch queues. Each queue is serviced by one
/// worker pinned to a core, holds at most `QUEUE_DEPTH` staged batches, and
/// runs the fluid kernel over every tile of a batch before reporting it
/// complete. Submission picks the queue with the smallest backlog.
pub struct QueuePool {
    queues: Vec<Queue>,
}

impl QueuePool {
    pub fn new(kernel: FluidKernel, num_queues: usize) -> Self {
        let cores = get_core_ids().unwrap_or_default();

        let queues = (0..num_queues.max(1))
            .map(|q| {
                let core = if cores.is_empty() {
                    None
                } else {
                    Some(cores[q % cores.len()])
                };
                let (sender, receiver): (Sender<BatchJob>, Receiver<BatchJob>) =
                    bounded(QUEUE_DEPTH);
                let backlog = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&backlog);

                let handle = thread::spawn(move || {
                    if let Some(core) = core {
                        set_for_current(core);
                    }
                    for (batch, done) in receiver {
                        let result = execute_batch(kernel, batch);
                        counter.fetch_sub(1, Ordering::Release);
                        // the waiter may have given up; that is its business
                        let _ = done.send(result);
                    }
                });

                Queue {
                    sender: Some(sender),
                    handle: Some(handle),
                    backlog,
                }
            })
            .collect();

        QueuePool { queues }
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Submit a batch to the queue with the smallest backlog, blocking when
    /// every queue already holds its full depth of staged batches.
    fn submit(&self, job: BatchJob) {
        let queue = self
            .queues
            .iter()
            .min_by_key(|q| q.backlog.load(Ordering::Acquire))
            .expect("queue pool has at least one queue");
        queue.backlog.fetch_add(1, Ordering::Release);
        queue
            .sender
            .as_ref()
            .unwrap()
            .send(job)
            .expect("offload queue worker is gone");
    }
}

/// Run the kernel over every tile of a batch.
fn execute_batch(kernel: FluidKernel, batch: FluidBatch) -> BatchResult {
    let FluidBatch {
        params,
        bases,
        mut tiles,
    } = batch;
    let n3 = PS2 * PS2 * PS2;
    let mut outputs = Vec::with_capacity(tiles.len());
    let mut planes = Vec::with_capacity(tiles.len());

    for tile in tiles.iter_mut() {
        let mut out = vec![0.0; 5 * n3];
        let mut fp = FluxPlanes::new();
        kernel(&params, tile, &mut out, &mut fp);
        outputs.push(out);
        planes.push(fp);
    }

    BatchResult {
        bases,
        outputs,
        planes,
    }
}

/// Host-side executor: the queue pool running the configured kernel on the
/// CPU.
pub struct HostExecutor {
    pool: QueuePool,
    capacity: usize,
}

impl HostExecutor {
    pub fn new(kernel: FluidKernel, num_queues: usize, capacity: usize) -> Self {
        Self {
            pool: QueuePool::new(kernel, num_queues),
            capacity: capacity.max(1),
        }
    }
}

impl FluidOffload for HostExecutor {
    fn batch_capacity(&self) -> usize {
        self.capacity
    }

    fn enqueue(&self, batch: FluidBatch) -> CompletionToken {
        let (sender, receiver) = bounded(1);
        self.pool.submit((batch, sender));
        CompletionToken { receiver }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hydro::pri_to_con;
    use crate::hydro::reconstruct::ReconScheme;
    use crate::solvers::{fluid_kernel, ghost_width, FluScheme};

    #[test]
    fn host_executor_round_trips_a_batch() {
        let scheme = FluScheme::MhmRp;
        let params = crate::solvers::test_support::params(scheme, 0.0, 0.1);
        let executor = HostExecutor::new(fluid_kernel(scheme), 2, 4);

        let nxt = PS2 + 2 * ghost_width(scheme, ReconScheme::Plm);
        let nxt3 = nxt * nxt * nxt;
        let u = pri_to_con(&[1.0, 0.2, 0.0, 0.0, 1.0], 1.4);
        let mut tile = vec![0.0; 5 * nxt3];
        for v in 0..5 {
            for c in 0..nxt3 {
                tile[v * nxt3 + c] = u[v];
            }
        }

        let token = executor.enqueue(FluidBatch {
            params,
            bases: vec![0],
            tiles: vec![tile],
        });
        let result = token.wait();
        assert_eq!(result.bases, vec![0]);
        assert_eq!(result.outputs.len(), 1);

        let n3 = PS2 * PS2 * PS2;
        for v in 0..5 {
            assert!((result.outputs[0][v * n3] - u[v]).abs() < 1e-12);
        }
    }

    #[test]
    fn submissions_spread_over_the_least_loaded_queues() {
        let scheme = FluScheme::Mhm;
        let params = crate::solvers::test_support::params(scheme, 0.0, 0.1);
        let executor = HostExecutor::new(fluid_kernel(scheme), 2, 1);
        assert_eq!(executor.pool.num_queues(), 2);

        let nxt = PS2 + 2 * ghost_width(scheme, ReconScheme::Plm);
        let nxt3 = nxt * nxt * nxt;
        let u = pri_to_con(&[1.0, 0.0, 0.0, 0.0, 1.0], 1.4);

        // more batches than total queue depth: submission must not deadlock
        // and every batch must come back
        let tokens: Vec<_> = (0..6)
            .map(|b| {
                let mut tile = vec![0.0; 5 * nxt3];
                for v in 0..5 {
                    for c in 0..nxt3 {
                        tile[v * nxt3 + c] = u[v];
                    }
                }
                executor.enqueue(FluidBatch {
                    params,
                    bases: vec![b],
                    tiles: vec![tile],
                })
            })
            .collect();

        for (b, token) in tokens.into_iter().enumerate() {
            assert_eq!(token.wait().bases, vec![b]);
        }
    }
}

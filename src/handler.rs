//! Bounded worker pool. Every worker owns one node connection for its whole
//! life, pulls jobs from a shared queue and hands results to a single
//! collector over a channel.

use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::{IngestError, IngestResult},
    node::{ConnectionProvider, NodeConnection},
};

type JobQueue<J> = Arc<Mutex<VecDeque<(usize, J)>>>;

/// Handle on a running set of workers.
///
/// Jobs not yet picked up when the pool is cancelled are never run; jobs
/// already in flight are allowed to finish and their results are still
/// delivered.
pub struct WorkerPool<R> {
    rx: UnboundedReceiver<(usize, R)>,
    total: usize,
    cancel: CancellationToken,
}

/// Starts `worker_count` workers (capped at the number of jobs) over `jobs`.
///
/// All connections are opened before any job runs, so a provider that cannot
/// hand out connections fails the call instead of leaving jobs stranded.
pub fn spawn<J, R, F, Fut>(
    provider: &dyn ConnectionProvider,
    jobs: Vec<J>,
    worker_count: usize,
    cancel: &CancellationToken,
    work: F,
) -> IngestResult<WorkerPool<R>>
where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(Arc<dyn NodeConnection>, J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    if worker_count == 0 {
        return Err(IngestError::config("worker count must be positive"));
    }

    let total = jobs.len();
    let workers = worker_count.min(total);
    let connections = (0..workers)
        .map(|_| provider.new_connection())
        .collect::<IngestResult<Vec<_>>>()?;

    let queue: JobQueue<J> = Arc::new(Mutex::new(jobs.into_iter().enumerate().collect()));
    let cancel = cancel.child_token();
    let work = Arc::new(work);
    let (tx, rx) = unbounded_channel();

    debug!(target: "vault_ingest::handler", workers, jobs = total, "starting worker pool");

    for (id, conn) in connections.into_iter().enumerate() {
        tokio::spawn(run_worker(
            id,
            conn,
            queue.clone(),
            cancel.clone(),
            work.clone(),
            tx.clone(),
        ));
    }

    Ok(WorkerPool { rx, total, cancel })
}

async fn run_worker<J, R, F, Fut>(
    id: usize,
    conn: Arc<dyn NodeConnection>,
    queue: JobQueue<J>,
    cancel: CancellationToken,
    work: Arc<F>,
    tx: UnboundedSender<(usize, R)>,
) where
    F: Fn(Arc<dyn NodeConnection>, J) -> Fut,
    Fut: Future<Output = R>,
{
    loop {
        if cancel.is_cancelled() {
            trace!(target: "vault_ingest::handler", id, "worker stopping on cancellation");
            break;
        }

        let next = match queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        let Some((index, job)) = next else { break };

        let result = work(conn.clone(), job).await;
        if tx.send((index, result)).is_err() {
            // collector is gone
            break;
        }
    }
}

impl<R> WorkerPool<R> {
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Stops handing out new jobs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Re-sequences results into job order.
    pub fn ordered(self) -> Ordered<R> {
        Ordered {
            rx: self.rx,
            pending: BTreeMap::new(),
            next: 0,
            total: self.total,
            closed: false,
            cancel: self.cancel,
        }
    }

    /// Waits for every worker and returns one slot per job, `None` for jobs
    /// that never ran.
    pub async fn collect_indexed(self) -> Vec<Option<R>> {
        self.ordered().map(|(_, result)| result).collect().await
    }
}

/// Stream of `(job index, result)` in ascending job index, exactly one item
/// per job. Results arriving early are buffered until their predecessors
/// land; a `None` result marks a job that was never run.
pub struct Ordered<R> {
    rx: UnboundedReceiver<(usize, R)>,
    pending: BTreeMap<usize, R>,
    next: usize,
    total: usize,
    closed: bool,
    cancel: CancellationToken,
}

impl<R> Unpin for Ordered<R> {}

impl<R> Ordered<R> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<R> Stream for Ordered<R> {
    type Item = (usize, Option<R>);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.next >= this.total {
                return Poll::Ready(None);
            }

            if let Some(result) = this.pending.remove(&this.next) {
                let index = this.next;
                this.next += 1;
                return Poll::Ready(Some((index, Some(result))));
            }

            if this.closed {
                let index = this.next;
                this.next += 1;
                return Poll::Ready(Some((index, None)));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some((index, result))) => {
                    this.pending.insert(index, result);
                }
                Poll::Ready(None) => this.closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

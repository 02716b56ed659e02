//! Persistence hooks: lead checkpoints and historical points.

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc::UnboundedReceiver,
};
use tracing::{debug, error, info};

use crate::{
    classify::ClassificationReport,
    error::{IngestError, IngestResult},
    history::HistoricalPoint,
    leads::Checkpoint,
    types::VaultId,
};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const FEATURES_FILE: &str = "features.json";
const POINTS_FILE: &str = "points.jsonl";

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Stored checkpoint, keeping only leads last seen at or after `since`.
    /// An empty checkpoint when nothing was saved yet.
    async fn load(&self, since: Option<u64>) -> IngestResult<Checkpoint>;

    async fn save(&self, checkpoint: &Checkpoint) -> IngestResult<()>;
}

#[async_trait]
pub trait PointSink: Send + Sync {
    async fn save(&self, records: &[PointRecord]) -> IngestResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointRecord {
    pub vault: VaultId,
    pub point: HistoricalPoint,
}

/// Everything as JSON files in one directory: the checkpoint and feature
/// sets as whole documents, points as JSON lines.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> IngestResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save_features(&self, report: &ClassificationReport) -> IngestResult<()> {
        write_atomic(&self.dir.join(FEATURES_FILE), &serde_json::to_vec_pretty(report)?).await
    }

    pub async fn load_features(&self) -> IngestResult<ClassificationReport> {
        match fs::read(self.dir.join(FEATURES_FILE)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IngestError::Persistence(
                format!("no classification saved in {}", self.dir.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load_points(&self) -> IngestResult<Vec<PointRecord>> {
        let raw = match fs::read_to_string(self.dir.join(POINTS_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(IngestError::from))
            .collect()
    }
}

/// Writes to a sibling temp file first so a crash never leaves half a document.
async fn write_atomic(path: &Path, contents: &[u8]) -> IngestResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl LeadStore for JsonFileStore {
    async fn load(&self, since: Option<u64>) -> IngestResult<Checkpoint> {
        let mut checkpoint: Checkpoint = match fs::read(self.dir.join(CHECKPOINT_FILE)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
            Err(e) => return Err(e.into()),
        };

        if let Some(since) = since {
            checkpoint
                .leads
                .retain(|_, lead| lead.last_seen_at_block >= since);
        }

        debug!(
            target: "vault_ingest::db",
            leads = checkpoint.leads.len(),
            last_scanned = ?checkpoint.last_scanned_block,
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> IngestResult<()> {
        write_atomic(
            &self.dir.join(CHECKPOINT_FILE),
            &serde_json::to_vec_pretty(checkpoint)?,
        )
        .await?;
        debug!(target: "vault_ingest::db", leads = checkpoint.leads.len(), "saved checkpoint");
        Ok(())
    }
}

#[async_trait]
impl PointSink for JsonFileStore {
    async fn save(&self, records: &[PointRecord]) -> IngestResult<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(POINTS_FILE))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

type InsertFuture = Pin<Box<dyn Future<Output = IngestResult<()>> + Send>>;

/// Drains point batches from a channel into a [`PointSink`], writing at most
/// one batch of `insert_size` or more at a time. A failed write is retried
/// with the same records up to `max_retries` times before the writer gives
/// up. Resolves to the number of records written once the channel closes
/// and everything is flushed.
pub struct BufferedPointWriter {
    sink: Arc<dyn PointSink>,
    rx: UnboundedReceiver<Vec<PointRecord>>,
    fut: Option<InsertFuture>,
    queue: Vec<PointRecord>,
    inserting: Vec<PointRecord>,
    insert_size: usize,
    max_retries: usize,
    failures: usize,
    written: usize,
    closed: bool,
}

impl BufferedPointWriter {
    pub fn new(
        sink: Arc<dyn PointSink>,
        rx: UnboundedReceiver<Vec<PointRecord>>,
        insert_size: usize,
    ) -> Self {
        Self {
            sink,
            rx,
            fut: None,
            queue: Vec::new(),
            inserting: Vec::new(),
            insert_size: insert_size.max(1),
            max_retries: 3,
            failures: 0,
            written: 0,
            closed: false,
        }
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    async fn insert(sink: Arc<dyn PointSink>, vals: Vec<PointRecord>) -> IngestResult<()> {
        sink.save(&vals).await
    }

    fn start_insert(&mut self) {
        self.fut = Some(Box::pin(Self::insert(
            self.sink.clone(),
            self.inserting.clone(),
        )));
    }
}

impl Future for BufferedPointWriter {
    type Output = IngestResult<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            while !this.closed {
                match this.rx.poll_recv(cx) {
                    Poll::Ready(Some(vals)) => this.queue.extend(vals),
                    Poll::Ready(None) => this.closed = true,
                    Poll::Pending => break,
                }
            }

            if let Some(fut) = this.fut.as_mut() {
                match fut.poll_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => {
                        debug!(target: "vault_ingest::db", "wrote {} points", this.inserting.len());
                        this.written += this.inserting.len();
                        this.inserting.clear();
                        this.failures = 0;
                        this.fut = None;
                    }
                    Poll::Ready(Err(e)) => {
                        this.failures += 1;
                        if this.failures > this.max_retries {
                            error!(
                                target: "vault_ingest::db",
                                "giving up on {} points after {} attempts - {e}",
                                this.inserting.len(),
                                this.failures
                            );
                            return Poll::Ready(Err(e));
                        }
                        error!(target: "vault_ingest::db", "error writing points, RETRYING - {e}");
                        this.start_insert();
                        continue
                    }
                }
            }

            if this.queue.len() >= this.insert_size || (this.closed && !this.queue.is_empty()) {
                this.inserting = std::mem::take(&mut this.queue);
                this.start_insert();
                continue
            }

            if this.closed {
                info!(target: "vault_ingest::db", written = this.written, "point writer finished");
                return Poll::Ready(Ok(this.written));
            }

            return Poll::Pending;
        }
    }
}

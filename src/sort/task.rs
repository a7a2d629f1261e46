//! Sort subtasks
//!
//! A subtask is a worker thread with its own job queue and its own output
//! temp file; no two subtasks ever touch the same file, and a file changes
//! hands only when a merge job consumes spans another task produced. Work
//! arrives as tagged messages carrying owned data: either an accumulated
//! record list to sort and spill, or a group of PMAs to merge. The first
//! failing job latches the subtask's error; later jobs fail immediately
//! and the latched code is returned at join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::Vfs;
use crate::sort::merge::merge_group;
use crate::sort::pma::{PmaSpan, PmaWriter, TempFile};
use crate::sort::{MemoryList, SortKey};

/// Tagged unit of work handed to a subtask.
pub(crate) enum SortJob {
    /// Sort the accumulated list and spill it as one PMA. `seq` is the
    /// global acceptance sequence of the flush.
    Spill { list: MemoryList, seq: u64 },
    /// Merge a group of contiguous-sequence PMAs into one.
    Merge { spans: Vec<PmaSpan> },
    Stop,
}

pub(crate) type JobResult = std::result::Result<PmaSpan, ErrorCode>;

#[derive(Clone, Copy)]
pub(crate) struct TaskConfig {
    /// Write/read buffer size; the temp file's page size.
    pub(crate) n_buf: usize,
    pub(crate) mmap_limit: i64,
}

// ============================================================================
// Output state
// ============================================================================

/// A subtask's owned output: one temp file that successive PMAs append to.
pub(crate) struct TaskOutput {
    file: Option<Arc<TempFile>>,
    end: u64,
}

impl TaskOutput {
    pub(crate) fn new() -> Self {
        Self { file: None, end: 0 }
    }

    fn file(&mut self, vfs: &Arc<dyn Vfs>) -> Result<Arc<TempFile>> {
        if self.file.is_none() {
            self.file = Some(TempFile::create(vfs)?);
        }
        match &self.file {
            Some(file) => Ok(Arc::clone(file)),
            None => Err(Error::new(ErrorCode::Internal)),
        }
    }
}

/// Execute one job against an output state. `Stop` produces no span.
pub(crate) fn run_job(
    vfs: &Arc<dyn Vfs>,
    out: &mut TaskOutput,
    key: &Arc<SortKey>,
    cfg: TaskConfig,
    job: SortJob,
) -> Result<Option<PmaSpan>> {
    match job {
        SortJob::Spill { mut list, seq } => {
            list.sort(key);
            let span = write_pma(vfs, out, cfg, &list, seq)?;
            Ok(Some(span))
        }
        SortJob::Merge { spans } => {
            let file = out.file(vfs)?;
            let span = merge_group(&spans, file, out.end, key, cfg.n_buf, cfg.mmap_limit)?;
            out.end = span.end;
            Ok(Some(span))
        }
        SortJob::Stop => Ok(None),
    }
}

/// Serialise a sorted list as one PMA at the output's tail.
fn write_pma(
    vfs: &Arc<dyn Vfs>,
    out: &mut TaskOutput,
    cfg: TaskConfig,
    list: &MemoryList,
    seq: u64,
) -> Result<PmaSpan> {
    let file = out.file(vfs)?;
    let content = list.encoded_size() as u64;
    let start = out.end;
    let mut writer = PmaWriter::new(Arc::clone(&file), cfg.n_buf, start);
    writer.write_varint(content);
    for record in list.iter_sorted() {
        writer.write_varint(record.len() as u64);
        writer.write(record);
    }
    let end = writer.finish()?;
    out.end = end;
    trace!("sorter: spilled pma seq {seq}, {content} content bytes");
    Ok(PmaSpan {
        file,
        start,
        end,
        content,
        seq,
    })
}

// ============================================================================
// Worker threads
// ============================================================================

/// A background subtask.
pub(crate) struct SortTask {
    sender: Sender<SortJob>,
    busy: Arc<AtomicBool>,
    handle: JoinHandle<Option<ErrorCode>>,
}

impl SortTask {
    pub(crate) fn spawn(
        vfs: Arc<dyn Vfs>,
        key: Arc<SortKey>,
        cfg: TaskConfig,
        results: Sender<JobResult>,
    ) -> Result<Self> {
        let (sender, receiver) = channel();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = Arc::clone(&busy);
        let handle = std::thread::Builder::new()
            .name("oakdb-sort".into())
            .spawn(move || worker_main(receiver, vfs, key, cfg, results, worker_busy))
            .map_err(|_| Error::new(ErrorCode::NoMem))?;
        Ok(Self {
            sender,
            busy,
            handle,
        })
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    /// Queue a job on a task the caller observed idle.
    pub(crate) fn send(&self, job: SortJob) -> Result<()> {
        self.busy.store(true, Ordering::Release);
        self.sender
            .send(job)
            .map_err(|_| Error::new(ErrorCode::Internal))
    }

    /// Stop the worker and collect its latched error, if any.
    pub(crate) fn join(self) -> Option<ErrorCode> {
        let _ = self.sender.send(SortJob::Stop);
        self.handle.join().unwrap_or(Some(ErrorCode::Internal))
    }
}

fn worker_main(
    receiver: Receiver<SortJob>,
    vfs: Arc<dyn Vfs>,
    key: Arc<SortKey>,
    cfg: TaskConfig,
    results: Sender<JobResult>,
    busy: Arc<AtomicBool>,
) -> Option<ErrorCode> {
    let mut out = TaskOutput::new();
    let mut latched: Option<ErrorCode> = None;
    while let Ok(job) = receiver.recv() {
        if matches!(job, SortJob::Stop) {
            break;
        }
        let result = match latched {
            Some(code) => Err(code),
            None => match run_job(&vfs, &mut out, &key, cfg, job) {
                Ok(Some(span)) => Ok(span),
                Ok(None) => break,
                Err(err) => {
                    latched = Some(err.code());
                    Err(err.code())
                }
            },
        };
        let _ = results.send(result);
        busy.store(false, Ordering::Release);
    }
    busy.store(false, Ordering::Release);
    latched
}

//! Copy progress and the submission policy.
//!
//! The scheduler opens both files and sizes the source in one batch. Once all
//! three answers are in, it checks that the destination is a different file
//! and truncates it, then keeps the ring busy: pending writes first, then
//! reads for as long as buffers and submission entries last. Running out of
//! either just ends the round; the next completion starts another.

use crate::buffer_pool::BufferPool;
use crate::config::{EngineConfig, STARTUP_REQUESTS};
use crate::error::{EngineError, EngineResult};
use crate::facility::{FileIdentity, IoFacility, Request};
use crate::op_table::{Extent, Operation, OperationId, OperationTable};
use nix::fcntl::OFlag;
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Paths and open parameters for one copy.
#[derive(Debug, Clone)]
pub struct CopyJob {
    source: CString,
    destination: CString,
    source_path: PathBuf,
    destination_path: PathBuf,
    destination_mode: u32,
    truncate: bool,
}

impl CopyJob {
    pub fn new(source: &Path, destination: &Path, config: &EngineConfig) -> EngineResult<Self> {
        Ok(Self {
            source: c_path(source)?,
            destination: c_path(destination)?,
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            destination_mode: config.destination_mode,
            truncate: config.truncate_destination,
        })
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    fn source_flags(&self) -> OFlag {
        OFlag::O_RDONLY | OFlag::O_CLOEXEC
    }

    // Never O_TRUNC: the destination may turn out to be the source.
    fn destination_flags(&self) -> OFlag {
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_CLOEXEC
    }
}

fn c_path(path: &Path) -> EngineResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| EngineError::InvalidPath {
        path: path.to_path_buf(),
    })
}

/// Progress of one copy.
///
/// Once the size is known, `bytes_written + pending + bytes_in_flight +
/// bytes_remaining` always equals the file size.
#[derive(Debug, Default)]
pub struct TransferState {
    source: Option<OwnedFd>,
    destination: Option<OwnedFd>,
    total_size: Option<u64>,
    bytes_remaining: u64,
    pending_writes: VecDeque<Extent>,
    bytes_in_flight: u64,
    reads_in_flight: usize,
    writes_in_flight: usize,
    bytes_read: u64,
    bytes_written: u64,
    read_ops: u64,
    write_ops: u64,
}

impl TransferState {
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Bytes not yet covered by a read submission.
    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    /// Reads that completed but whose write has not been submitted yet.
    pub fn pending_writes(&self) -> impl Iterator<Item = &Extent> {
        self.pending_writes.iter()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_writes.iter().map(|e| u64::from(e.len)).sum()
    }

    /// Bytes covered by submitted reads and writes not yet completed.
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn reads_in_flight(&self) -> usize {
        self.reads_in_flight
    }

    pub fn writes_in_flight(&self) -> usize {
        self.writes_in_flight
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn read_ops(&self) -> u64 {
        self.read_ops
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops
    }
}

pub struct Scheduler {
    job: CopyJob,
    // Boxed so the kernel can fill it in while the scheduler moves.
    statx: Box<libc::statx>,
    state: TransferState,
    started: bool,
    destination_checked: bool,
}

impl Scheduler {
    pub fn new(job: CopyJob) -> Self {
        Self {
            job,
            // SAFETY: statx is plain old data; all-zero is a valid value.
            statx: Box::new(unsafe { std::mem::zeroed() }),
            state: TransferState::default(),
            started: false,
            destination_checked: false,
        }
    }

    pub fn job(&self) -> &CopyJob {
        &self.job
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Submit open-source, statx and open-destination as one batch.
    pub fn start<F: IoFacility>(
        &mut self,
        table: &mut OperationTable,
        facility: &mut F,
    ) -> EngineResult<()> {
        assert!(!self.started, "copy already started");
        if facility.submission_slots() < STARTUP_REQUESTS as usize {
            return Err(EngineError::SubmissionQueueFull);
        }

        let open_source = Request::Open {
            path: self.job.source.as_ptr(),
            flags: self.job.source_flags().bits(),
            mode: 0,
        };
        let stat = Request::StatSize {
            path: self.job.source.as_ptr(),
            statx: &mut *self.statx,
        };
        let open_destination = Request::Open {
            path: self.job.destination.as_ptr(),
            flags: self.job.destination_flags().bits(),
            mode: self.job.destination_mode,
        };

        // SAFETY: the paths and the statx record are owned by self.job and
        // self.statx, which live as long as the scheduler. The engine reaps
        // every outstanding completion before the scheduler is dropped.
        unsafe {
            issue(table, facility, Operation::OpenSource, open_source)?;
            issue(table, facility, Operation::StatSize, stat)?;
            issue(table, facility, Operation::OpenDestination, open_destination)?;
        }
        facility.submit()?;
        self.started = true;

        debug!(
            "Submitted startup batch for {:?} -> {:?}",
            self.job.source_path, self.job.destination_path
        );
        Ok(())
    }

    /// Source handle, destination handle and size are all known.
    pub fn is_ready(&self) -> bool {
        self.state.source.is_some()
            && self.state.destination.is_some()
            && self.state.total_size.is_some()
    }

    /// Every byte has been read and written back out.
    pub fn is_complete(&self) -> bool {
        self.is_ready()
            && self.state.bytes_remaining == 0
            && self.state.pending_writes.is_empty()
            && self.state.reads_in_flight == 0
            && self.state.writes_in_flight == 0
    }

    /// Apply a successful completion. `result` is the non-negative value the
    /// facility reported: a descriptor for opens, a byte count for I/O.
    pub fn complete(
        &mut self,
        operation: Operation,
        result: u32,
        pool: &mut BufferPool,
    ) -> EngineResult<()> {
        let was_ready = self.is_ready();

        match operation {
            Operation::OpenSource => {
                // SAFETY: a successful openat returns a new descriptor that
                // nothing else owns.
                self.state.source = Some(unsafe { OwnedFd::from_raw_fd(result as RawFd) });
            }
            Operation::OpenDestination => {
                // SAFETY: as above.
                self.state.destination = Some(unsafe { OwnedFd::from_raw_fd(result as RawFd) });
            }
            Operation::StatSize => {
                let size = self.statx.stx_size;
                self.state.total_size = Some(size);
                self.state.bytes_remaining = size;
                debug!("Source size: {} bytes", size);
            }
            Operation::Read(extent) => {
                check_length(operation, extent, result)?;
                self.state.reads_in_flight -= 1;
                self.state.bytes_in_flight -= u64::from(extent.len);
                self.state.bytes_read += u64::from(extent.len);
                self.state.read_ops += 1;
                // The slot stays held: it now belongs to the pending write.
                self.state.pending_writes.push_back(extent);
            }
            Operation::Write(extent) => {
                check_length(operation, extent, result)?;
                self.state.writes_in_flight -= 1;
                self.state.bytes_in_flight -= u64::from(extent.len);
                self.state.bytes_written += u64::from(extent.len);
                self.state.write_ops += 1;
                pool.release(extent.slot);
            }
        }

        if !was_ready && self.is_ready() {
            info!(
                "Transfer ready: {} bytes from {:?}",
                self.state.total_size.unwrap_or_default(),
                self.job.source_path
            );
        }
        Ok(())
    }

    /// Submit whatever the current state allows. Returns the number of
    /// requests queued this round.
    pub fn schedule<F: IoFacility>(
        &mut self,
        pool: &mut BufferPool,
        table: &mut OperationTable,
        facility: &mut F,
    ) -> EngineResult<usize> {
        let (Some(source), Some(destination), Some(total_size)) = (
            self.source_fd(),
            self.destination_fd(),
            self.state.total_size,
        ) else {
            return Ok(0);
        };

        if !self.destination_checked {
            self.prepare_destination(facility, destination)?;
        }

        let mut issued = 0;

        while let Some(&extent) = self.state.pending_writes.front() {
            if facility.submission_slots() == 0 {
                break;
            }
            let request = Request::WriteFixed {
                fd: destination,
                buf: pool.as_ptr(extent.slot),
                len: extent.len,
                offset: extent.offset,
                slot: extent.slot.index(),
            };
            // SAFETY: the slot has been held since its read was issued and is
            // only released when this write's completion is processed.
            unsafe { issue(table, facility, Operation::Write(extent), request)? };
            self.state.pending_writes.pop_front();
            self.state.writes_in_flight += 1;
            self.state.bytes_in_flight += u64::from(extent.len);
            issued += 1;
        }

        while self.state.bytes_remaining > 0 && facility.submission_slots() > 0 {
            let Some(slot) = pool.acquire() else {
                break;
            };
            let len = self.state.bytes_remaining.min(u64::from(pool.capacity())) as u32;
            let extent = Extent {
                offset: total_size - self.state.bytes_remaining,
                len,
                slot,
            };
            let request = Request::ReadFixed {
                fd: source,
                buf: pool.as_mut_ptr(slot),
                len,
                offset: extent.offset,
                slot: slot.index(),
            };
            // SAFETY: the slot was just taken from the free list and stays
            // held through the read and the write that follows it.
            if let Err(e) = unsafe { issue(table, facility, Operation::Read(extent), request) } {
                pool.release(slot);
                return Err(e);
            }
            self.state.bytes_remaining -= u64::from(len);
            self.state.reads_in_flight += 1;
            self.state.bytes_in_flight += u64::from(len);
            issued += 1;
        }

        if issued > 0 {
            facility.submit()?;
        }
        Ok(issued)
    }

    /// Refuse to copy a file onto itself, then drop any stale destination
    /// contents. Runs once, before the first data request.
    fn prepare_destination<F: IoFacility>(
        &mut self,
        facility: &mut F,
        destination: RawFd,
    ) -> EngineResult<()> {
        let source = FileIdentity::of_statx(&self.statx);
        if facility.identify(destination)? == source {
            return Err(EngineError::SameFile {
                path: self.job.destination_path.clone(),
            });
        }
        if self.job.truncate {
            facility.truncate(destination, 0)?;
        }
        self.destination_checked = true;
        Ok(())
    }

    /// Close both descriptors.
    pub fn close_handles(&mut self) {
        self.state.source.take();
        self.state.destination.take();
    }

    fn source_fd(&self) -> Option<RawFd> {
        self.state.source.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn destination_fd(&self) -> Option<RawFd> {
        self.state.destination.as_ref().map(AsRawFd::as_raw_fd)
    }
}

/// Record `operation` in the table and queue it on the facility.
///
/// # Safety
///
/// Same contract as [`IoFacility::push`].
unsafe fn issue<F: IoFacility>(
    table: &mut OperationTable,
    facility: &mut F,
    operation: Operation,
    request: Request,
) -> EngineResult<OperationId> {
    let id = table.register(operation);
    if let Err(e) = facility.push(id, request) {
        table.take(id)?;
        return Err(e);
    }
    trace!("Queued {} as {}", operation, id);
    Ok(id)
}

fn check_length(operation: Operation, extent: Extent, result: u32) -> EngineResult<()> {
    if result != extent.len {
        return Err(EngineError::ShortTransfer {
            operation: operation.name(),
            offset: extent.offset,
            expected: extent.len,
            actual: result,
        });
    }
    Ok(())
}

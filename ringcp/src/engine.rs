use crate::buffer_pool::BufferPool;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::facility::IoFacility;
use crate::op_table::{Operation, OperationTable};
use crate::scheduler::{CopyJob, Scheduler};
use crate::uring::UringFacility;
use crate::utils::format_bytes;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyStats {
    pub file_size: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub peak_in_flight: usize,
    pub elapsed: Duration,
}

impl CopyStats {
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_written as f64 / secs / 1024.0 / 1024.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for CopyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CopyStats {{ size: {}, read: {} bytes ({} ops), write: {} bytes ({} ops), peak in flight: {}, {:.2}s ({:.2} MB/s) }}",
            format_bytes(self.file_size),
            self.bytes_read,
            self.read_ops,
            self.bytes_written,
            self.write_ops,
            self.peak_in_flight,
            self.elapsed.as_secs_f64(),
            self.throughput_mbps()
        )
    }
}

/// Copy `source` to `destination` through a fresh io_uring instance.
pub fn copy_file(
    source: &Path,
    destination: &Path,
    config: &EngineConfig,
) -> EngineResult<CopyStats> {
    config.validate()?;
    let facility = UringFacility::new(config)?;
    debug!("Kernel submission polling: {}", facility.uses_sqpoll());
    let job = CopyJob::new(source, destination, config)?;
    CopyEngine::new(facility, job, config)?.run()
}

/// Owns everything one copy needs and drives it from completions.
pub struct CopyEngine<F: IoFacility> {
    // Declared first so it is dropped first: the facility must stop using
    // the registered buffers before their memory is freed.
    facility: F,
    table: OperationTable,
    scheduler: Scheduler,
    pool: BufferPool,
    registered: bool,
    peak_in_flight: usize,
}

impl<F: IoFacility> CopyEngine<F> {
    pub fn new(mut facility: F, job: CopyJob, config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let pool = BufferPool::new(config.buffer_count, config.buffer_size)?;

        // SAFETY: the pool lives in the engine next to the facility, and the
        // facility is dropped before it. Outstanding fixed reads and writes
        // are reaped before the engine is dropped, even on failure.
        unsafe { facility.register_buffers(&pool.iovecs())? };
        debug!(
            "Registered {} buffers of {}",
            pool.len(),
            format_bytes(u64::from(pool.capacity()))
        );

        Ok(Self {
            facility,
            table: OperationTable::new(),
            scheduler: Scheduler::new(job),
            pool,
            registered: true,
            peak_in_flight: 0,
        })
    }

    /// Run the copy to completion. Any error is terminal.
    ///
    /// On failure every request already handed to the facility is reaped
    /// before the engine is dropped, and the first error is returned.
    pub fn run(mut self) -> EngineResult<CopyStats> {
        let start_time = Instant::now();
        info!(
            "Starting io_uring copy: {:?} -> {:?}",
            self.scheduler.job().source_path(),
            self.scheduler.job().destination_path()
        );

        if let Err(e) = self.drive() {
            if !self.drain() {
                // Requests may still be in flight: leak their memory rather
                // than free it under the kernel.
                std::mem::forget(self);
            }
            return Err(e);
        }
        self.finish(start_time.elapsed())
    }

    fn drive(&mut self) -> EngineResult<()> {
        self.start()?;
        while !self.is_finished() {
            self.dispatch_next()?;
        }
        Ok(())
    }

    /// Wait out every outstanding request, discarding results. Returns false
    /// if the facility stopped answering first.
    pub(crate) fn drain(&mut self) -> bool {
        while !self.table.is_empty() {
            let completion = match self.facility.wait_for_completion() {
                Ok(completion) => completion,
                Err(e) => {
                    error!(
                        "Abandoning {} outstanding operations: {}",
                        self.table.len(),
                        e
                    );
                    return false;
                }
            };
            let Ok(operation) = self.table.take(completion.id) else {
                continue;
            };
            debug!(
                "Discarded completion {}: {} -> {}",
                completion.id, operation, completion.result
            );
            if matches!(
                operation,
                Operation::OpenSource | Operation::OpenDestination
            ) && completion.result >= 0
            {
                // SAFETY: a descriptor from a successful open that was never
                // handed to the scheduler.
                drop(unsafe { OwnedFd::from_raw_fd(completion.result) });
            }
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.table.is_empty() && self.scheduler.is_complete()
    }

    pub(crate) fn start(&mut self) -> EngineResult<()> {
        self.scheduler.start(&mut self.table, &mut self.facility)?;
        self.peak_in_flight = self.table.len();
        Ok(())
    }

    /// Wait for one completion and act on it.
    pub(crate) fn dispatch_next(&mut self) -> EngineResult<()> {
        if self.table.is_empty() {
            let state = self.scheduler.state();
            return Err(EngineError::Stalled {
                bytes_remaining: state.bytes_remaining(),
                pending_writes: state.pending_writes().count(),
            });
        }

        let completion = self.facility.wait_for_completion()?;
        let operation = self.table.take(completion.id)?;
        debug!(
            "Completion {}: {} -> {}",
            completion.id, operation, completion.result
        );

        let Ok(result) = u32::try_from(completion.result) else {
            return Err(EngineError::operation_failed(
                operation.name(),
                completion.result,
            ));
        };
        self.scheduler.complete(operation, result, &mut self.pool)?;
        self.scheduler
            .schedule(&mut self.pool, &mut self.table, &mut self.facility)?;

        self.peak_in_flight = self.peak_in_flight.max(self.table.len());
        Ok(())
    }

    fn finish(&mut self, elapsed: Duration) -> EngineResult<CopyStats> {
        if self.registered {
            self.facility.unregister_buffers()?;
            self.registered = false;
        }
        self.scheduler.close_handles();

        let state = self.scheduler.state();
        let stats = CopyStats {
            file_size: state.total_size().unwrap_or_default(),
            bytes_read: state.bytes_read(),
            bytes_written: state.bytes_written(),
            read_ops: state.read_ops(),
            write_ops: state.write_ops(),
            peak_in_flight: self.peak_in_flight,
            elapsed,
        };

        info!(
            "io_uring copy completed: {} bytes in {:.2}s ({:.2} MB/s)",
            stats.bytes_written,
            elapsed.as_secs_f64(),
            stats.throughput_mbps()
        );
        Ok(stats)
    }
}

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::facility::{Completion, FileIdentity, IoFacility, Request};
use crate::op_table::OperationId;
use io_uring::{opcode, squeue, types, IoUring};
use nix::sys::stat::{fstat, major, minor};
use nix::unistd::ftruncate;
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use tracing::{info, warn};

/// [`IoFacility`] backed by a kernel io_uring instance.
pub struct UringFacility {
    ring: IoUring,
    sqpoll: bool,
}

impl UringFacility {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        if config.sqpoll {
            let built = IoUring::builder()
                .setup_sqpoll(config.sqpoll_idle_ms)
                .setup_cqsize(config.cq_entries())
                .build(config.queue_depth);
            match built {
                Ok(ring) => {
                    info!(
                        "Created io_uring with kernel submission thread, queue depth: {}",
                        config.queue_depth
                    );
                    return Ok(Self { ring, sqpoll: true });
                }
                Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                    warn!("Kernel submission thread not permitted, falling back to a plain ring");
                }
                Err(e) => return Err(EngineError::RingSetup { source: e }),
            }
        }

        let ring = IoUring::builder()
            .setup_cqsize(config.cq_entries())
            .build(config.queue_depth)
            .map_err(|e| EngineError::RingSetup { source: e })?;

        info!("Created io_uring with queue depth: {}", config.queue_depth);

        Ok(Self {
            ring,
            sqpoll: false,
        })
    }

    pub fn is_io_uring_available() -> bool {
        // Try to create a minimal io_uring to test availability
        IoUring::new(4).is_ok()
    }

    pub fn uses_sqpoll(&self) -> bool {
        self.sqpoll
    }

    fn build_entry(request: Request) -> squeue::Entry {
        let cwd = types::Fd(libc::AT_FDCWD);
        match request {
            Request::Open { path, flags, mode } => opcode::OpenAt::new(cwd, path)
                .flags(flags)
                .mode(mode)
                .build(),
            Request::StatSize { path, statx } => {
                opcode::Statx::new(cwd, path, statx.cast::<types::statx>())
                    .mask(libc::STATX_SIZE | libc::STATX_INO)
                    .build()
            }
            Request::ReadFixed {
                fd,
                buf,
                len,
                offset,
                slot,
            } => opcode::ReadFixed::new(types::Fd(fd), buf, len, slot)
                .offset(offset)
                .build(),
            Request::WriteFixed {
                fd,
                buf,
                len,
                offset,
                slot,
            } => opcode::WriteFixed::new(types::Fd(fd), buf, len, slot)
                .offset(offset)
                .build(),
        }
    }
}

impl IoFacility for UringFacility {
    unsafe fn register_buffers(&mut self, buffers: &[libc::iovec]) -> EngineResult<()> {
        self.ring
            .submitter()
            .register_buffers(buffers)
            .map_err(|e| EngineError::BufferRegistration { source: e })
    }

    fn unregister_buffers(&mut self) -> EngineResult<()> {
        self.ring
            .submitter()
            .unregister_buffers()
            .map_err(|e| EngineError::BufferRegistration { source: e })
    }

    fn submission_slots(&mut self) -> usize {
        let sq = self.ring.submission();
        sq.capacity() - sq.len()
    }

    unsafe fn push(&mut self, id: OperationId, request: Request) -> EngineResult<()> {
        let entry = Self::build_entry(request).user_data(id.0);
        self.ring
            .submission()
            .push(&entry)
            .map_err(|_| EngineError::SubmissionQueueFull)
    }

    fn submit(&mut self) -> EngineResult<usize> {
        self.ring
            .submit()
            .map_err(|e| EngineError::Submit { source: e })
    }

    fn wait_for_completion(&mut self) -> EngineResult<Completion> {
        loop {
            // Dropping the completion queue handle advances the head, which
            // returns the entry's slot to the kernel.
            if let Some(cqe) = self.ring.completion().next() {
                return Ok(Completion {
                    id: OperationId(cqe.user_data()),
                    result: cqe.result(),
                });
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(EngineError::Wait { source: e }),
            }
        }
    }

    fn identify(&mut self, fd: RawFd) -> EngineResult<FileIdentity> {
        let stat = fstat(fd).map_err(|errno| EngineError::OperationFailed {
            operation: "fstat",
            errno,
        })?;
        Ok(FileIdentity {
            dev_major: u64::from(major(stat.st_dev)),
            dev_minor: u64::from(minor(stat.st_dev)),
            ino: stat.st_ino as u64,
        })
    }

    fn truncate(&mut self, fd: RawFd, len: u64) -> EngineResult<()> {
        let len = libc::off_t::try_from(len).map_err(|_| EngineError::OperationFailed {
            operation: "ftruncate",
            errno: nix::errno::Errno::EFBIG,
        })?;
        // SAFETY: the caller owns `fd` and keeps it open for the duration of this call.
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        ftruncate(fd, len).map_err(|errno| EngineError::OperationFailed {
            operation: "ftruncate",
            errno,
        })
    }
}

//! Boundary between the engine and the asynchronous I/O facility.
//!
//! The engine hands the facility tagged requests and later receives
//! `(id, result)` pairs back, in whatever order the facility completes them.
//! Results follow the kernel convention: non-negative is success (a byte
//! count, or a new descriptor for opens), negative is `-errno`.

use crate::error::EngineResult;
use crate::op_table::OperationId;
use std::os::unix::io::RawFd;

/// A request as handed to the facility.
///
/// Pointers must stay valid until the matching completion has been taken.
#[derive(Debug, Clone, Copy)]
pub enum Request {
    /// `openat(AT_FDCWD, path, flags, mode)`.
    Open {
        path: *const libc::c_char,
        flags: i32,
        mode: u32,
    },
    /// `statx(AT_FDCWD, path, 0, STATX_SIZE | STATX_INO, statx)`.
    StatSize {
        path: *const libc::c_char,
        statx: *mut libc::statx,
    },
    /// Read into registered buffer `slot`.
    ReadFixed {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        slot: u16,
    },
    /// Write from registered buffer `slot`.
    WriteFixed {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
        slot: u16,
    },
}

/// A completion as reported by the facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: OperationId,
    pub result: i32,
}

/// Device and inode pair naming one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev_major: u64,
    pub dev_minor: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn of_statx(statx: &libc::statx) -> Self {
        Self {
            dev_major: u64::from(statx.stx_dev_major),
            dev_minor: u64::from(statx.stx_dev_minor),
            ino: statx.stx_ino,
        }
    }
}

pub trait IoFacility {
    /// Register the buffer table used by fixed reads and writes.
    ///
    /// # Safety
    ///
    /// The memory described by `buffers` must remain valid until
    /// [`IoFacility::unregister_buffers`] is called or the facility is
    /// dropped.
    unsafe fn register_buffers(&mut self, buffers: &[libc::iovec]) -> EngineResult<()>;

    fn unregister_buffers(&mut self) -> EngineResult<()>;

    /// Free submission queue entries.
    fn submission_slots(&mut self) -> usize;

    /// Queue a request tagged with `id`. Fails with
    /// [`EngineError::SubmissionQueueFull`](crate::EngineError::SubmissionQueueFull)
    /// when no entry is free.
    ///
    /// # Safety
    ///
    /// Every pointer inside `request` must stay valid, and buffers must not be
    /// touched by the caller, until the completion for `id` is returned by
    /// [`IoFacility::wait_for_completion`].
    unsafe fn push(&mut self, id: OperationId, request: Request) -> EngineResult<()>;

    /// Hand everything queued so far to the facility.
    fn submit(&mut self) -> EngineResult<usize>;

    /// Block until a completion is available and retire it from the
    /// completion queue.
    fn wait_for_completion(&mut self) -> EngineResult<Completion>;

    /// Identify the file behind an open descriptor. Synchronous.
    fn identify(&mut self, fd: RawFd) -> EngineResult<FileIdentity>;

    /// Set the length of an open descriptor. Synchronous.
    fn truncate(&mut self, fd: RawFd, len: u64) -> EngineResult<()>;
}

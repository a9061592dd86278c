//! In-memory [`IoFacility`] for unit tests.
//!
//! Requests are executed when their completion is reaped, against an
//! in-memory source and destination, so a buffer handed back to the pool too
//! early shows up as corrupted output. Completion order is selectable.

use crate::error::{EngineError, EngineResult};
use crate::facility::{Completion, FileIdentity, IoFacility, Request};
use crate::op_table::OperationId;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::{IntoRawFd, RawFd};

/// Identity reported by statx for the source.
pub(crate) const SOURCE_IDENTITY: FileIdentity = FileIdentity {
    dev_major: 8,
    dev_minor: 1,
    ino: 1000,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
    Fifo,
    Lifo,
    /// Pseudo-random pick driven by the seed.
    Scrambled(u64),
}

/// What a pushed request asked for, without its pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Issued {
    Open { flags: i32, mode: u32 },
    StatSize,
    Read { offset: u64, len: u32, slot: u16 },
    Write { offset: u64, len: u32, slot: u16 },
}

impl Issued {
    fn of(request: &Request) -> Self {
        match *request {
            Request::Open { flags, mode, .. } => Issued::Open { flags, mode },
            Request::StatSize { .. } => Issued::StatSize,
            Request::ReadFixed {
                offset, len, slot, ..
            } => Issued::Read { offset, len, slot },
            Request::WriteFixed {
                offset, len, slot, ..
            } => Issued::Write { offset, len, slot },
        }
    }
}

pub(crate) struct SimFacility {
    pub source: Vec<u8>,
    pub destination: Vec<u8>,
    /// Open of the source fails with this errno.
    pub source_open_errno: Option<i32>,
    /// A read at this offset completes with half the requested bytes.
    pub short_read_at: Option<u64>,
    /// A write at this offset completes with half the requested bytes.
    pub short_write_at: Option<u64>,
    /// Every read fails with this errno.
    pub read_errno: Option<i32>,
    /// Every write fails with this errno.
    pub write_errno: Option<i32>,
    /// The destination descriptor resolves to the source file.
    pub destination_is_source: bool,
    sq_capacity: usize,
    hold: bool,
    order: Order,
    rng: u64,
    queued: Vec<(OperationId, Request)>,
    in_flight: Vec<(OperationId, Request)>,
    injected: VecDeque<Completion>,
    issued: Vec<(OperationId, Issued)>,
    registered: Vec<(usize, usize)>,
    unregister_calls: usize,
    submit_calls: usize,
}

impl SimFacility {
    pub fn new(source: Vec<u8>, sq_capacity: usize) -> Self {
        Self {
            source,
            destination: Vec::new(),
            source_open_errno: None,
            short_read_at: None,
            short_write_at: None,
            read_errno: None,
            write_errno: None,
            destination_is_source: false,
            sq_capacity,
            hold: false,
            order: Order::Fifo,
            rng: 0,
            queued: Vec::new(),
            in_flight: Vec::new(),
            injected: VecDeque::new(),
            issued: Vec::new(),
            registered: Vec::new(),
            unregister_calls: 0,
            submit_calls: 0,
        }
    }

    pub fn with_order(mut self, order: Order) -> Self {
        if let Order::Scrambled(seed) = order {
            self.rng = seed | 1;
        }
        self.order = order;
        self
    }

    /// While held, `submit` leaves queued entries in the submission queue.
    pub fn hold_submissions(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Return `completion` from the next wait, ahead of real work.
    pub fn inject(&mut self, completion: Completion) {
        self.injected.push_back(completion);
    }

    pub fn issued(&self) -> &[(OperationId, Issued)] {
        &self.issued
    }

    pub fn registered_buffers(&self) -> usize {
        self.registered.len()
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls
    }

    /// Requests pushed whose completion has not been reaped.
    pub fn outstanding(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    fn next_index(&mut self) -> usize {
        let len = self.in_flight.len();
        match self.order {
            Order::Fifo => 0,
            Order::Lifo => len - 1,
            Order::Scrambled(_) => {
                // xorshift64
                self.rng ^= self.rng << 13;
                self.rng ^= self.rng >> 7;
                self.rng ^= self.rng << 17;
                (self.rng % len as u64) as usize
            }
        }
    }

    fn check_buffer(&self, buf: usize, slot: u16, len: u32) {
        let (base, size) = self.registered[slot as usize];
        assert_eq!(buf, base, "request for slot {} uses a foreign pointer", slot);
        assert!(len as usize <= size, "request overruns slot {}", slot);
    }

    fn execute(&mut self, request: Request) -> i32 {
        match request {
            Request::Open { flags, .. } => {
                if flags & libc::O_CREAT == 0 {
                    if let Some(errno) = self.source_open_errno {
                        return -errno;
                    }
                }
                match File::open("/dev/null") {
                    Ok(file) => file.into_raw_fd(),
                    Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
                }
            }
            Request::StatSize { statx, .. } => {
                // SAFETY: the caller keeps the statx record alive until the
                // completion is reaped.
                unsafe {
                    (*statx).stx_size = self.source.len() as u64;
                    (*statx).stx_dev_major = SOURCE_IDENTITY.dev_major as u32;
                    (*statx).stx_dev_minor = SOURCE_IDENTITY.dev_minor as u32;
                    (*statx).stx_ino = SOURCE_IDENTITY.ino;
                }
                0
            }
            Request::ReadFixed {
                buf,
                len,
                offset,
                slot,
                ..
            } => {
                self.check_buffer(buf as usize, slot, len);
                if let Some(errno) = self.read_errno {
                    return -errno;
                }
                let start = (offset as usize).min(self.source.len());
                let mut n = (len as usize).min(self.source.len() - start);
                if self.short_read_at == Some(offset) {
                    n /= 2;
                }
                // SAFETY: buf is a registered region of at least len bytes
                // that the caller does not touch while the read is in flight.
                unsafe { std::ptr::copy_nonoverlapping(self.source[start..].as_ptr(), buf, n) };
                n as i32
            }
            Request::WriteFixed {
                buf,
                len,
                offset,
                slot,
                ..
            } => {
                self.check_buffer(buf as usize, slot, len);
                if let Some(errno) = self.write_errno {
                    return -errno;
                }
                let len = if self.short_write_at == Some(offset) {
                    len / 2
                } else {
                    len
                };
                let end = offset as usize + len as usize;
                if self.destination.len() < end {
                    self.destination.resize(end, 0);
                }
                // SAFETY: as for reads.
                let data = unsafe { std::slice::from_raw_parts(buf, len as usize) };
                self.destination[offset as usize..end].copy_from_slice(data);
                len as i32
            }
        }
    }
}

impl IoFacility for SimFacility {
    unsafe fn register_buffers(&mut self, buffers: &[libc::iovec]) -> EngineResult<()> {
        self.registered = buffers
            .iter()
            .map(|iov| (iov.iov_base as usize, iov.iov_len))
            .collect();
        Ok(())
    }

    fn unregister_buffers(&mut self) -> EngineResult<()> {
        self.registered.clear();
        self.unregister_calls += 1;
        Ok(())
    }

    fn submission_slots(&mut self) -> usize {
        self.sq_capacity - self.queued.len()
    }

    unsafe fn push(&mut self, id: OperationId, request: Request) -> EngineResult<()> {
        if self.queued.len() >= self.sq_capacity {
            return Err(EngineError::SubmissionQueueFull);
        }
        self.issued.push((id, Issued::of(&request)));
        self.queued.push((id, request));
        Ok(())
    }

    fn submit(&mut self) -> EngineResult<usize> {
        self.submit_calls += 1;
        if self.hold {
            return Ok(0);
        }
        let count = self.queued.len();
        self.in_flight.append(&mut self.queued);
        Ok(count)
    }

    fn wait_for_completion(&mut self) -> EngineResult<Completion> {
        if let Some(completion) = self.injected.pop_front() {
            return Ok(completion);
        }
        if self.in_flight.is_empty() {
            self.in_flight.append(&mut self.queued);
        }
        if self.in_flight.is_empty() {
            return Err(EngineError::Wait {
                source: std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "nothing in flight",
                ),
            });
        }

        let index = self.next_index();
        let (id, request) = self.in_flight.remove(index);
        let result = self.execute(request);
        Ok(Completion { id, result })
    }

    fn identify(&mut self, _fd: RawFd) -> EngineResult<FileIdentity> {
        if self.destination_is_source {
            Ok(SOURCE_IDENTITY)
        } else {
            Ok(FileIdentity {
                ino: SOURCE_IDENTITY.ino + 1,
                ..SOURCE_IDENTITY
            })
        }
    }

    fn truncate(&mut self, _fd: RawFd, len: u64) -> EngineResult<()> {
        self.destination.resize(len as usize, 0);
        Ok(())
    }
}

//! SPSC message queue (A7): a pollable pipe carrying fixed-size messages,
//! with a single atomic counter standing in for the original's
//! spinlock-protected counter. Grounded in `testclient/message_queue.c`'s
//! `libtrace_message_queue_*` family -- used there to hand results from a
//! worker thread to a consumer that also wants to `select`/`poll` on other
//! fds; kept here as the same kind of cross-thread handoff primitive.

use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read, write};

use crate::error::{Error, Result};

/// A fixed-size message queue over a pipe. `T` must be `Copy` and no larger
/// than `PIPE_BUF` (the kernel's atomic pipe-write guarantee on Linux,
/// 4096 bytes) or concurrent writers could interleave partial messages --
/// this crate only ever has one writer per queue, but the limit is kept as
/// a loud assertion rather than silently relying on single-writer safety.
pub struct MessageQueue<T: Copy> {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    count: Arc<AtomicIsize>,
    _marker: PhantomData<T>,
}

const PIPE_BUF: usize = 4096;

impl<T: Copy> MessageQueue<T> {
    pub fn new() -> Result<Self> {
        let message_len = std::mem::size_of::<T>();
        assert!(message_len > 0, "message type must not be zero-sized");
        if message_len > PIPE_BUF {
            log::warn!(
                "message queue type is {} bytes, exceeding PIPE_BUF({}); writes are no longer atomic",
                message_len,
                PIPE_BUF
            );
        }

        let (read_fd, write_fd) = pipe().map_err(|e| Error::ConfigInvalid {
            reason: format!("failed to create message queue pipe: {}", e),
        })?;

        Ok(MessageQueue {
            read_fd,
            write_fd,
            count: Arc::new(AtomicIsize::new(0)),
            _marker: PhantomData,
        })
    }

    /// Blocks if the pipe buffer is full. Returns the queue depth observed
    /// just after the write, including this message.
    pub fn put(&self, message: &T) -> Result<isize> {
        let bytes = unsafe {
            std::slice::from_raw_parts(message as *const T as *const u8, std::mem::size_of::<T>())
        };
        write(&self.write_fd, bytes).map_err(|e| Error::ConfigInvalid {
            reason: format!("message queue write failed: {}", e),
        })?;
        Ok(self.count.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Blocks until a message is available.
    pub fn get(&self) -> Result<T> {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.read_one()
    }

    /// Non-blocking variant of [`Self::get`]. Returns `Ok(None)` rather than
    /// blocking when the queue is empty.
    pub fn try_get(&self) -> Result<Option<T>> {
        if self.count.load(Ordering::SeqCst) <= 0 {
            return Ok(None);
        }
        self.count.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(self.read_one()?))
    }

    fn read_one(&self) -> Result<T> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        read(self.read_fd.as_raw_fd(), &mut buf).map_err(|e| Error::ConfigInvalid {
            reason: format!("message queue read failed: {}", e),
        })?;
        Ok(unsafe { std::ptr::read(buf.as_ptr() as *const T) })
    }

    /// May read negative when readers are blocked waiting ahead of any
    /// pending write -- this mirrors the original's deliberately racy
    /// counter, which is advisory rather than authoritative.
    pub fn count(&self) -> isize {
        self.count.load(Ordering::SeqCst)
    }

    /// The read side's fd, usable with `poll`/`select` alongside other fds.
    pub fn as_raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    pub fn set_nonblocking(&self) -> Result<()> {
        fcntl(
            self.read_fd.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::O_NONBLOCK),
        )
        .map_err(|e| Error::ConfigInvalid {
            reason: format!("failed to set queue non-blocking: {}", e),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn put_then_get_round_trips() {
        let mq: MessageQueue<u64> = MessageQueue::new().unwrap();
        mq.put(&42).unwrap();
        assert_eq!(mq.get().unwrap(), 42);
    }

    #[test]
    fn try_get_on_empty_queue_returns_none() {
        let mq: MessageQueue<u32> = MessageQueue::new().unwrap();
        assert_eq!(mq.try_get().unwrap(), None);
    }

    #[test]
    fn count_tracks_pending_messages() {
        let mq: MessageQueue<u8> = MessageQueue::new().unwrap();
        assert_eq!(mq.count(), 0);
        mq.put(&1).unwrap();
        mq.put(&2).unwrap();
        assert_eq!(mq.count(), 2);
        mq.try_get().unwrap();
        assert_eq!(mq.count(), 1);
    }

    #[test]
    fn preserves_fifo_order_across_threads() {
        let mq = Arc::new(MessageQueue::<u32>::new().unwrap());
        let producer = {
            let mq = mq.clone();
            std::thread::spawn(move || {
                for i in 0..10u32 {
                    mq.put(&i).unwrap();
                }
            })
        };
        producer.join().unwrap();

        let mut got = Vec::new();
        for _ in 0..10 {
            got.push(mq.get().unwrap());
        }
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }
}

//! epoll and self-pipe plumbing
//!
//! The poller owns the epoll instance and the wakeup pipe. Registrations are
//! edge-triggered; the pipe's read end is registered up front and must be
//! fully drained on every wake.

use std::io;
use std::os::fd::RawFd;

/// Readiness batch size per wait.
pub(crate) const MAX_EVENTS: usize = 256;

pub(crate) struct Poller {
    epfd: RawFd,
    pipe_read: RawFd,
    pipe_write: RawFd,
}

fn cvt(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let mut fds = [0 as RawFd; 2];
        // Both ends nonblocking: the drain loop must not block, and a full
        // pipe already means a wakeup is pending.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let poller = Poller {
            epfd,
            pipe_read: fds[0],
            pipe_write: fds[1],
        };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.pipe_read,
            libc::EPOLLIN as u32 | libc::EPOLLET as u32,
        )?;
        Ok(poller)
    }

    /// The fd that readiness events report for self-pipe wakeups.
    pub(crate) fn wakeup_fd(&self) -> RawFd {
        self.pipe_read
    }

    /// epoll_ctl wrapper; `interest` is ignored by the kernel for DEL.
    pub(crate) fn ctl(&self, op: i32, fd: RawFd, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) }).map(drop)
    }

    /// Block for readiness up to `timeout_ms` (-1 blocks indefinitely).
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let n = cvt(unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        })?;
        Ok(n as usize)
    }

    /// Wake a blocked `wait` by writing one byte to the self-pipe.
    pub(crate) fn notify(&self) {
        let ret = unsafe { libc::write(self.pipe_write, b"T".as_ptr() as *const libc::c_void, 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A full pipe means the wakeup is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "self-pipe write failed");
            }
        }
    }

    /// Drain every pending wakeup byte (the registration is edge-triggered).
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.pipe_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_then_drain() {
        let poller = Poller::new().unwrap();
        poller.notify();
        poller.notify();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].u64 as RawFd, poller.wakeup_fd());
        poller.drain();

        // edge-triggered: nothing new without another notify
        let n = poller.wait(&mut events, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_wait_times_out_empty() {
        let poller = Poller::new().unwrap();
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);
    }
}

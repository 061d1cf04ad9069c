//! Sample driver: fibers, timers and fd readiness on one IoManager.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use strand_runtime::{Event, Fiber, IoManager, Schedule};

fn pipe_nonblock() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        bail!("pipe2 failed: {}", std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let io = IoManager::new(2, true, "demo");

    io.schedule(|| {
        tracing::info!(fiber = ?Fiber::current_id(), "hello from a fiber");
    });

    let ticks = Arc::new(AtomicUsize::new(0));
    let recurring = {
        let ticks = ticks.clone();
        io.add_timer(
            50,
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            },
            true,
        )
    };
    io.add_timer(200, || tracing::info!("one-shot timer fired"), false);

    let (read_fd, write_fd) = pipe_nonblock()?;
    io.add_event(
        read_fd,
        Event::READ,
        Some(Box::new(move || {
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            tracing::info!(bytes = n, "pipe became readable");
        })),
    )?;

    // a detached producer makes the pipe readable shortly
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
            libc::close(write_fd);
        }
    });

    thread::sleep(Duration::from_millis(400));
    recurring.cancel();
    tracing::info!(ticks = ticks.load(Ordering::SeqCst), "recurring timer cancelled");

    io.stop();
    unsafe {
        libc::close(read_fd);
    }
    Ok(())
}

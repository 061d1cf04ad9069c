//! End-to-end IoManager scenarios: readiness, timers, cancellation.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use strand_runtime::{Event, Fiber, IoManager, Schedule};

fn new_io(threads: usize, name: &str) -> Arc<IoManager> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    IoManager::new(threads, false, name)
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn pipe_nonblock() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn socketpair_nonblock() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let ret = unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(ret, 1);
}

fn read_all(fd: RawFd) {
    let mut buf = [0u8; 64];
    while unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
}

fn close_pair(a: RawFd, b: RawFd) {
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

/// Readiness fires a registered callback exactly once, and a fresh
/// registration re-arms the fd.
#[test]
fn readiness_callback_fires_once_and_rearms() {
    let io = new_io(2, "readiness");
    let (read_fd, write_fd) = pipe_nonblock();

    let fired = Arc::new(AtomicUsize::new(0));
    let register = |io: &Arc<IoManager>| {
        let fired = fired.clone();
        io.add_event(
            read_fd,
            Event::READ,
            Some(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    };

    register(&io);
    assert_eq!(io.pending_events(), 1);

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        write_byte(write_fd);
    });
    assert!(wait_until(Duration::from_secs(5), || fired
        .load(Ordering::SeqCst)
        == 1));
    writer.join().unwrap();

    // one-shot: no second invocation without a new registration
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_events(), 0);

    // drain, re-arm, fire again
    read_all(read_fd);
    register(&io);
    write_byte(write_fd);
    assert!(wait_until(Duration::from_secs(5), || fired
        .load(Ordering::SeqCst)
        == 2));

    io.stop();
    close_pair(read_fd, write_fd);
}

/// A fiber that registers without a callback parks on the fd and is resumed
/// by readiness.
#[test]
fn parked_fiber_resumes_on_readiness() {
    let io = new_io(2, "parked");
    let (read_fd, write_fd) = pipe_nonblock();

    let got = Arc::new(AtomicUsize::new(0));
    {
        let io2 = io.clone();
        let got = got.clone();
        io.schedule(move || {
            io2.add_event(read_fd, Event::READ, None).unwrap();
            Fiber::yield_current();
            // resumed by the readiness event
            let mut buf = [0u8; 8];
            let n =
                unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            assert_eq!(n, 1);
            got.fetch_add(1, Ordering::SeqCst);
        });
    }

    thread::sleep(Duration::from_millis(50));
    write_byte(write_fd);
    assert!(wait_until(Duration::from_secs(5), || got.load(Ordering::SeqCst) == 1));

    io.stop();
    close_pair(read_fd, write_fd);
}

/// Timers fire in deadline order regardless of insertion order.
#[test]
fn timers_fire_in_deadline_order() {
    let io = new_io(1, "timer-order");
    let order = Arc::new(Mutex::new(Vec::new()));
    for (ms, tag) in [(300, 'a'), (100, 'b'), (200, 'c')] {
        let order = order.clone();
        io.add_timer(ms, move || order.lock().unwrap().push(tag), false);
    }

    assert!(wait_until(Duration::from_secs(5), || order
        .lock()
        .unwrap()
        .len()
        == 3));
    assert_eq!(*order.lock().unwrap(), vec!['b', 'c', 'a']);
    io.stop();
}

/// A recurring timer keeps firing until cancelled, and never after.
#[test]
fn recurring_timer_ticks_until_cancelled() {
    let io = new_io(1, "recurring");
    let ticks = Arc::new(AtomicUsize::new(0));
    let timer = {
        let ticks = ticks.clone();
        io.add_timer(
            50,
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            },
            true,
        )
    };

    thread::sleep(Duration::from_millis(520));
    assert!(timer.cancel());
    let at_cancel = ticks.load(Ordering::SeqCst);
    // nominally 10 ticks; allow slack for a loaded machine
    assert!(
        (6..=12).contains(&at_cancel),
        "unexpected tick count {at_cancel}"
    );

    // at most one already-dispatched tick may still land
    thread::sleep(Duration::from_millis(200));
    let settled = ticks.load(Ordering::SeqCst);
    assert!(settled - at_cancel <= 1);

    io.stop();
    assert_eq!(ticks.load(Ordering::SeqCst), settled);
}

/// cancel_all fires both pending directions exactly once and clears the
/// registration.
#[test]
fn cancel_all_fires_both_directions() {
    let io = new_io(1, "cancel-all");
    let (fd, peer) = socketpair_nonblock();

    // make fd non-writable so WRITE readiness cannot fire on its own
    let junk = [0u8; 65536];
    while unsafe { libc::write(fd, junk.as_ptr() as *const libc::c_void, junk.len()) } > 0 {}

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    {
        let reads = reads.clone();
        io.add_event(
            fd,
            Event::READ,
            Some(Box::new(move || {
                reads.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    {
        let writes = writes.clone();
        io.add_event(
            fd,
            Event::WRITE,
            Some(Box::new(move || {
                writes.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    assert_eq!(io.pending_events(), 2);

    assert!(io.cancel_all(fd));
    assert_eq!(io.pending_events(), 0);
    assert!(wait_until(Duration::from_secs(5), || {
        reads.load(Ordering::SeqCst) == 1 && writes.load(Ordering::SeqCst) == 1
    }));

    // nothing re-fires, and a second cancel_all finds nothing
    thread::sleep(Duration::from_millis(100));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert!(!io.cancel_all(fd));

    io.stop();
    close_pair(fd, peer);
}

/// del_event removes silently: the stored callback never runs.
#[test]
fn del_event_removes_without_firing() {
    let io = new_io(1, "del");
    let (read_fd, write_fd) = pipe_nonblock();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        io.add_event(
            read_fd,
            Event::READ,
            Some(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    assert!(io.del_event(read_fd, Event::READ));
    assert_eq!(io.pending_events(), 0);

    write_byte(write_fd);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    io.stop();
    close_pair(read_fd, write_fd);
}

/// A condition timer whose condition has been dropped skips its callback.
#[test]
fn condition_timer_skips_dead_condition() {
    let io = new_io(1, "condition");
    let fired = Arc::new(AtomicUsize::new(0));

    let cond = Arc::new(());
    {
        let fired = fired.clone();
        io.add_condition_timer(
            30,
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            &cond,
            false,
        );
    }
    drop(cond);

    thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    io.stop();
}

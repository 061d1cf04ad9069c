//! Fiber stack allocation
//!
//! Stacks are mmap'd with a PROT_NONE guard page at the low end, so an
//! overflow faults instead of silently corrupting adjacent memory.

use strand_core::error::{RuntimeError, RuntimeResult};

/// Default usable stack size per fiber (128 KiB)
pub(crate) const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const PAGE_SIZE: usize = 4096;
const GUARD_SIZE: usize = PAGE_SIZE;

/// An owned, guard-paged fiber stack.
pub(crate) struct Stack {
    base: *mut u8,
    total: usize,
}

// Safety: `base` is a private anonymous mapping owned exclusively by this
// Stack; the type exposes only the top-of-stack address.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with `size` usable bytes (rounded up to whole pages)
    /// below a guard page.
    pub(crate) fn new(size: usize) -> RuntimeResult<Stack> {
        let usable = round_up_to_page(if size == 0 { DEFAULT_STACK_SIZE } else { size });
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::last_os("mmap"));
        }

        // Guard page at the low end; growth runs downward into it
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = RuntimeError::last_os("mprotect");
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the mapping; the initial stack pointer starts here.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excludes the guard page).
    pub(crate) fn len(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if ret != 0 {
            tracing::warn!("munmap of fiber stack failed");
        }
    }
}

fn round_up_to_page(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_size() {
        let s = Stack::new(0).unwrap();
        assert_eq!(s.len(), DEFAULT_STACK_SIZE);
        assert!(!s.top().is_null());
    }

    #[test]
    fn test_rounds_to_page() {
        let s = Stack::new(1).unwrap();
        assert_eq!(s.len(), PAGE_SIZE);
    }

    #[test]
    fn test_stack_is_writable() {
        let s = Stack::new(PAGE_SIZE).unwrap();
        unsafe {
            let p = s.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }
}

use std::io;
use std::ptr;

/// An mmap'd fiber stack with a `PROT_NONE` guard page below its lowest usable address.
pub(crate) struct Stack {
    /// Start of the mapping, guard page included.
    base: *mut u8,
    /// Mapping length, guard page included.
    len: usize,
}

// The mapping is plain memory; only the thread running the owning fiber touches it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let stack = Self {
            base: base.cast(),
            len,
        };
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            // `stack` unmaps on drop.
            return Err(io::Error::last_os_error());
        }
        Ok(stack)
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(page_size()) }
    }

    /// One past the highest usable address; stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    pub fn size(&self) -> usize {
        self.len - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_pages() {
        let stack = Stack::new(10_000).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 10_000);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        unsafe {
            stack.bottom().write(0xAB);
            stack.top().sub(1).write(0xCD);
            assert_eq!(stack.bottom().read(), 0xAB);
        }
    }
}

//! OS adapter: guard regions and console interrupt wiring
//!
//! Everything platform-specific about interrupt delivery lives here. The
//! rest of the runtime only sees a [`GuardedRegion`] of writable memory and
//! an optional SIGINT route into one context's pending word.

use super::{InterruptHandle, USER_BIT};
use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

const REGION_ALIGN: usize = 16;

enum Backing {
    /// Anonymous mapping with a no-access page after the body
    #[cfg(unix)]
    Mapped { map_len: usize },
    /// Plain allocation, no protection
    Heap { layout: Layout },
}

/// Writable memory with an optional no-access page past its end
pub struct GuardedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// The region is plain memory owned by one stack; moving it between threads
// before use is fine.
unsafe impl Send for GuardedRegion {}

impl GuardedRegion {
    /// Allocate `len` zeroed bytes, protected past the end when `protect` is
    /// set and the platform supports it
    pub fn new(len: usize, protect: bool) -> io::Result<Self> {
        #[cfg(unix)]
        if protect {
            return Self::mapped(len);
        }
        let _ = protect;
        Self::heap(len)
    }

    #[cfg(unix)]
    fn mapped(len: usize) -> io::Result<Self> {
        let page = page_size()?;
        let body = ((len + page - 1) / page).max(1) * page;
        let map_len = body + page;
        // SAFETY: fresh anonymous mapping; the tail page is ours to protect.
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let tail = (ptr as *mut u8).add(body) as *mut libc::c_void;
            if libc::mprotect(tail, page, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(ptr, map_len);
                return Err(err);
            }
            Ok(Self {
                ptr: NonNull::new_unchecked(ptr as *mut u8),
                len,
                backing: Backing::Mapped { map_len },
            })
        }
    }

    fn heap(len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len.max(1), REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has nonzero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self {
            ptr,
            len,
            backing: Backing::Heap { layout },
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if accesses past the end fault
    pub fn is_protected(&self) -> bool {
        match self.backing {
            #[cfg(unix)]
            Backing::Mapped { .. } => true,
            Backing::Heap { .. } => false,
        }
    }
}

impl Drop for GuardedRegion {
    fn drop(&mut self) {
        match self.backing {
            #[cfg(unix)]
            Backing::Mapped { map_len } => unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, map_len);
            },
            Backing::Heap { layout } => unsafe {
                alloc::dealloc(self.ptr.as_ptr(), layout);
            },
        }
    }
}

#[cfg(unix)]
fn page_size() -> io::Result<usize> {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(page as usize)
}

#[cfg(unix)]
mod signals {
    use super::*;
    use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
    use std::sync::Arc;

    static SIGNAL_TARGET: AtomicPtr<AtomicU32> = AtomicPtr::new(std::ptr::null_mut());

    extern "C" fn on_sigint(_signal: libc::c_int) {
        let target = SIGNAL_TARGET.load(Ordering::Acquire);
        if !target.is_null() {
            // SAFETY: the target stays alive until the registration is dropped,
            // which first restores the previous handler.
            unsafe { (*target).fetch_or(USER_BIT, Ordering::AcqRel) };
        }
    }

    /// Installed SIGINT route; dropping it restores the previous handler
    pub struct SignalRegistration {
        previous: libc::sigaction,
        target: *const AtomicU32,
    }

    unsafe impl Send for SignalRegistration {}
    unsafe impl Sync for SignalRegistration {}

    pub fn install_interrupt_signal(handle: &InterruptHandle) -> io::Result<SignalRegistration> {
        let target = Arc::into_raw(Arc::clone(handle.pending_word()));
        if SIGNAL_TARGET
            .compare_exchange(
                std::ptr::null_mut(),
                target as *mut AtomicU32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // SAFETY: `target` came from Arc::into_raw above and was not published.
            unsafe { drop(Arc::from_raw(target)) };
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "interrupt signal already routed",
            ));
        }

        // SAFETY: sigaction structs are plain data; the handler only touches
        // an atomic.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGINT, &action, &mut previous) != 0 {
                let err = io::Error::last_os_error();
                SIGNAL_TARGET.store(std::ptr::null_mut(), Ordering::Release);
                drop(Arc::from_raw(target));
                return Err(err);
            }
            Ok(SignalRegistration { previous, target })
        }
    }

    impl SignalRegistration {
        /// Route SIGINT to `handle` instead, keeping the handler installed
        pub fn retarget(&mut self, handle: &InterruptHandle) {
            let target = Arc::into_raw(Arc::clone(handle.pending_word()));
            SIGNAL_TARGET.store(target as *mut AtomicU32, Ordering::Release);
            // SAFETY: the old target came from Arc::into_raw at install or
            // the previous retarget, and is no longer published.
            unsafe { drop(Arc::from_raw(self.target)) };
            self.target = target;
        }
    }

    impl Drop for SignalRegistration {
        fn drop(&mut self) {
            // SAFETY: restoring the handler we replaced, then releasing the
            // target reference taken at install time.
            unsafe {
                libc::sigaction(libc::SIGINT, &self.previous, std::ptr::null_mut());
                SIGNAL_TARGET.store(std::ptr::null_mut(), Ordering::Release);
                drop(Arc::from_raw(self.target));
            }
        }
    }
}

#[cfg(unix)]
pub use signals::{install_interrupt_signal, SignalRegistration};

/// Placeholder registration on platforms without POSIX signals
#[cfg(not(unix))]
pub struct SignalRegistration;

#[cfg(not(unix))]
impl SignalRegistration {
    pub fn retarget(&mut self, _handle: &InterruptHandle) {}
}

#[cfg(not(unix))]
pub fn install_interrupt_signal(_handle: &InterruptHandle) -> io::Result<SignalRegistration> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "console interrupts are not routed on this platform",
    ))
}

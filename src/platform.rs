//! OS memory interface.
//!
//! The page heap only talks to the OS through [`SystemMemory`]. [`OsMemory`]
//! is the platform backend: `mmap`/`madvise`/`munmap` on Unix,
//! `VirtualAlloc`/`VirtualFree` on Windows.

use core::ptr::NonNull;
use std::io;

/// Reserve, commit, decommit and release address space.
///
/// `reserve` returns memory that is already committed. `decommit` may drop
/// the contents of the range; `commit` makes a decommitted range usable
/// again.
pub trait SystemMemory: Send + Sync {
    /// Map `size` bytes aligned to `align` (a power of two, multiple of the
    /// OS page size).
    fn reserve(&self, size: usize, align: usize) -> io::Result<NonNull<u8>>;

    fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()>;

    fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()>;

    /// Unmap a range previously returned by `reserve`, in full.
    fn release(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()>;
}

/// The platform's virtual memory API.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMemory;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn os_page_size() -> usize {
            // SAFETY: sysconf has no preconditions.
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if page <= 0 { 4096 } else { page as usize }
        }

        impl SystemMemory for OsMemory {
            fn reserve(&self, size: usize, align: usize) -> io::Result<NonNull<u8>> {
                let os_page = os_page_size();
                let extra = if align > os_page { align } else { 0 };
                let len = size
                    .checked_add(extra)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

                // SAFETY: anonymous private mapping, no existing memory touched.
                let raw = unsafe {
                    libc::mmap(
                        core::ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if raw == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }

                let addr = raw as usize;
                let aligned = (addr + align - 1) & !(align - 1);
                let lead = aligned - addr;
                let trail = len - lead - size;
                // Trim the slack so that `release` can unmap exactly `size`.
                // SAFETY: both ranges lie inside the mapping created above.
                unsafe {
                    if lead > 0 {
                        libc::munmap(raw, lead);
                    }
                    if trail > 0 {
                        libc::munmap((aligned + size) as *mut libc::c_void, trail);
                    }
                }

                NonNull::new(aligned as *mut u8)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
            }

            fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
                // Pages dropped with MADV_DONTNEED fault back in on first touch.
                Ok(())
            }

            fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
                // SAFETY: the caller owns the range; DONTNEED only drops contents.
                let rc = unsafe {
                    libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED)
                };
                if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
            }

            fn release(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
                // SAFETY: the caller passes a range obtained from `reserve`.
                let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
                if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
            }
        }
    } else if #[cfg(windows)] {
        use core::ffi::c_void;

        const MEM_COMMIT: u32 = 0x0000_1000;
        const MEM_RESERVE: u32 = 0x0000_2000;
        const MEM_DECOMMIT: u32 = 0x0000_4000;
        const MEM_RELEASE: u32 = 0x0000_8000;
        const PAGE_READWRITE: u32 = 0x04;

        #[link(name = "kernel32")]
        unsafe extern "system" {
            fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
            fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
        }

        impl SystemMemory for OsMemory {
            fn reserve(&self, size: usize, align: usize) -> io::Result<NonNull<u8>> {
                // SAFETY: fresh reservation at a system-chosen address.
                let raw = unsafe {
                    VirtualAlloc(core::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
                };
                let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(io::Error::last_os_error)?;
                // Allocation granularity is 64 KiB, which covers every page-heap alignment.
                debug_assert_eq!(ptr.as_ptr() as usize % align, 0);
                Ok(ptr)
            }

            fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
                // SAFETY: the range lies inside a reservation we own.
                let raw = unsafe { VirtualAlloc(ptr.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
                if raw.is_null() { Err(io::Error::last_os_error()) } else { Ok(()) }
            }

            fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
                // SAFETY: the range lies inside a reservation we own.
                let ok = unsafe { VirtualFree(ptr.as_ptr().cast(), size, MEM_DECOMMIT) };
                if ok != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
            }

            fn release(&self, ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
                // SAFETY: `ptr` is the base of a reservation from `reserve`.
                let ok = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
                if ok != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
            }
        }
    } else {
        compile_error!("tcalloc supports only unix and windows targets");
    }
}

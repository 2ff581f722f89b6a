//! Executable memory: anonymous mappings that go writable → executable
//! exactly once and are unmapped on drop.

use kestrel_environ::CompileError;

/// A page-aligned mapping for compiled code. Created writable, sealed to
/// read+execute with [`CodeMemory::publish`]; the mapping is released when
/// the owning value drops, never by a finalizer.
pub struct CodeMemory {
    ptr: *mut u8,
    len: usize,
    published: bool,
}

// The mapping is plain memory owned by this value; the raw pointer does not
// alias anything another thread mutates after publication.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl CodeMemory {
    /// Allocate a writable mapping with room for `size` bytes, rounded up to
    /// whole pages. A zero-sized request still produces one page so callers
    /// always hold a valid base address.
    pub fn with_capacity(size: usize) -> Result<CodeMemory, CompileError> {
        let page = page_size();
        let len = ((size.max(1)) + page - 1) & !(page - 1);
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                core::ptr::null_mut(),
                len,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )
            .map_err(|e| CompileError::Memory(format!("mmap of {len} bytes failed: {e}")))?
        };
        Ok(CodeMemory {
            ptr: ptr as *mut u8,
            len,
            published: false,
        })
    }

    /// The writable view. Only valid before [`CodeMemory::publish`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.published, "code memory already published");
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn base(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` points into this mapping.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr as usize;
        addr >= base && addr < base + self.len
    }

    /// Flip the mapping to read+execute and synchronize the instruction
    /// cache.
    pub fn publish(&mut self) -> Result<(), CompileError> {
        debug_assert!(!self.published);
        icache_flush(self.ptr, self.len);
        unsafe {
            rustix::mm::mprotect(
                self.ptr as *mut _,
                self.len,
                rustix::mm::MprotectFlags::READ | rustix::mm::MprotectFlags::EXEC,
            )
            .map_err(|e| CompileError::Memory(format!("mprotect(rx) failed: {e}")))?;
        }
        self.published = true;
        Ok(())
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr as *mut _, self.len);
        }
    }
}

fn page_size() -> usize {
    rustix::param::page_size()
}

/// Bring the data writes up to the instruction fetchers. On aarch64 the
/// D-side and I-side are not coherent, so every cache line gets a clean and
/// an invalidate, followed by the barriers the architecture requires.
#[cfg(target_arch = "aarch64")]
fn icache_flush(ptr: *mut u8, len: usize) {
    const LINE: usize = 64;
    unsafe {
        let start = ptr as usize & !(LINE - 1);
        let end = ptr as usize + len;
        let mut addr = start;
        while addr < end {
            core::arch::asm!("dc cvau, {x}", x = in(reg) addr, options(nostack, preserves_flags));
            addr += LINE;
        }
        core::arch::asm!("dsb ish", options(nostack, preserves_flags));
        let mut addr = start;
        while addr < end {
            core::arch::asm!("ic ivau, {x}", x = in(reg) addr, options(nostack, preserves_flags));
            addr += LINE;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn icache_flush(_ptr: *mut u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_round_trip() {
        let mut mem = CodeMemory::with_capacity(100).unwrap();
        assert!(mem.len() >= 100);
        assert_eq!(mem.base() as usize % page_size(), 0);
        mem.as_mut_slice()[0] = 0xAB;
        mem.publish().unwrap();
        let byte = unsafe { *mem.base() };
        assert_eq!(byte, 0xAB);
        assert!(mem.contains(mem.base() as usize));
        assert!(mem.contains(mem.base() as usize + mem.len() - 1));
        assert!(!mem.contains(mem.base() as usize + mem.len()));
    }
}

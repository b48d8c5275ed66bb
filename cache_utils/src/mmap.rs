use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::slice::from_raw_parts;
use log::debug;
use nix::sys::mman;

/* from linux kernel headers.
#define HUGETLB_FLAG_ENCODE_SHIFT       26
#define HUGETLB_FLAG_ENCODE_2MB         (21 << HUGETLB_FLAG_ENCODE_SHIFT)
*/

/// Private anonymous mapping, page aligned, used as calibration scratch space.
pub struct MMappedMemory {
    pointer: NonNull<c_void>,
    size: usize,
}

impl MMappedMemory {
    /// Maps `size` bytes, trying huge pages first when `huge` is set and
    /// falling back to regular pages.
    pub fn new(size: usize, huge: bool) -> nix::Result<MMappedMemory> {
        let length = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        let prot = mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE;
        let flags = mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS;
        let mapped = if huge {
            match unsafe {
                mman::mmap_anonymous(None, length, prot, flags | mman::MapFlags::MAP_HUGETLB)
            } {
                Ok(p) => Ok(p),
                Err(e) => {
                    debug!("huge page mapping failed ({}), using regular pages", e);
                    unsafe { mman::mmap_anonymous(None, length, prot, flags) }
                }
            }
        } else {
            unsafe { mman::mmap_anonymous(None, length, prot, flags) }
        }?;
        let memory = MMappedMemory {
            pointer: mapped,
            size,
        };
        // Touch every page so the mapping is backed before timing anything.
        for offset in (0..size).step_by(4096) {
            unsafe { mapped.cast::<u8>().as_ptr().add(offset).write_volatile(1) };
        }
        Ok(memory)
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.cast::<u8>().as_ptr(), self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.pointer, self.size) } {
            debug!("munmap failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_read() {
        let m = MMappedMemory::new(1 << 16, false).unwrap();
        assert_eq!(m.len(), 1 << 16);
        assert_eq!(m.slice()[0], 1);
        assert_eq!(m.slice()[4096], 1);
        assert_eq!(m.slice()[1], 0);
        assert_eq!(m.slice().as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(MMappedMemory::new(0, false).is_err());
    }
}

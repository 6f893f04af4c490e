use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::{
    GuestMemory, GuestMemoryError, GuestMemoryResult, MMIO_GAP_END, MMIO_GAP_START, PAGE_SIZE,
};

/// A raw span of host memory backing one of the guest's GPA ranges.
///
/// Passed to the hypervisor binding for GPA mapping; valid as long as the
/// owning [`GuestRam`] is alive.
#[derive(Debug, Clone, Copy)]
pub struct HostSpan {
    pub ptr: *mut u8,
    pub len: u64,
}

/// Guest RAM: a single page-aligned, zero-initialised host allocation.
///
/// The allocation is presented to the guest as two GPA ranges:
///
/// - low:  `[0, low_size)`
/// - high: `[MMIO_GAP_END, MMIO_GAP_END + high_size)` (only when the VM has
///   more RAM than fits below [`MMIO_GAP_START`])
///
/// The union of the two ranges is contiguous in host memory, so `gpa -> hva`
/// translation is a bounds check plus one offset per range.
pub struct GuestRam {
    base: NonNull<u8>,
    layout: Layout,
    alloc_size: u64,
    low_size: u64,
    high_size: u64,
}

// The allocation is plain bytes; sharing between threads is part of the
// guest-memory contract (see `GuestMemory`).
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Allocates `size_bytes` of guest RAM, rounded up to a whole page.
    pub fn new(size_bytes: u64) -> GuestMemoryResult<Self> {
        let alloc_size = size_bytes
            .checked_add(PAGE_SIZE - 1)
            .ok_or(GuestMemoryError::AllocationFailed { size: size_bytes })?
            & !(PAGE_SIZE - 1);
        if alloc_size == 0 {
            return Err(GuestMemoryError::AllocationFailed { size: size_bytes });
        }
        let size = usize::try_from(alloc_size)
            .map_err(|_| GuestMemoryError::AllocationFailed { size: alloc_size })?;
        let layout = Layout::from_size_align(size, PAGE_SIZE as usize)
            .map_err(|_| GuestMemoryError::AllocationFailed { size: alloc_size })?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(GuestMemoryError::AllocationFailed { size: alloc_size })?;

        let low_size = alloc_size.min(MMIO_GAP_START);
        let high_size = alloc_size - low_size;
        Ok(Self { base, layout, alloc_size, low_size, high_size })
    }

    /// Total committed bytes.
    pub fn alloc_size(&self) -> u64 {
        self.alloc_size
    }

    /// Bytes mapped below the MMIO gap.
    pub fn low_size(&self) -> u64 {
        self.low_size
    }

    /// Bytes mapped at and above 4 GiB.
    pub fn high_size(&self) -> u64 {
        self.high_size
    }

    /// Base GPA of the high range, or 0 when there is no high range.
    pub fn high_gpa_base(&self) -> u64 {
        if self.high_size > 0 {
            MMIO_GAP_END
        } else {
            0
        }
    }

    /// Host span backing the low GPA range.
    pub fn low_span(&self) -> HostSpan {
        HostSpan { ptr: self.base.as_ptr(), len: self.low_size }
    }

    /// Host span backing the high GPA range; `None` when the VM has no RAM
    /// above the gap.
    pub fn high_span(&self) -> Option<HostSpan> {
        if self.high_size == 0 {
            return None;
        }
        let ptr = unsafe { self.base.as_ptr().add(self.low_size as usize) };
        Some(HostSpan { ptr, len: self.high_size })
    }

    /// Translates `[gpa, gpa + len)` to an offset into the host allocation.
    ///
    /// Returns `None` for ranges outside the two valid GPA ranges, including
    /// ranges that straddle the MMIO gap or the end of either range.
    pub fn translate(&self, gpa: u64, len: usize) -> Option<u64> {
        let len = len as u64;
        let end = gpa.checked_add(len)?;
        if end <= self.low_size {
            return Some(gpa);
        }
        if self.high_size > 0 && gpa >= MMIO_GAP_END {
            let off = gpa - MMIO_GAP_END;
            if off.checked_add(len)? <= self.high_size {
                return Some(self.low_size + off);
            }
        }
        None
    }

    fn host_range(&self, gpa: u64, len: usize) -> GuestMemoryResult<*mut u8> {
        let offset =
            self.translate(gpa, len).ok_or(GuestMemoryError::OutOfBounds { gpa, len })?;
        Ok(unsafe { self.base.as_ptr().add(offset as usize) })
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.alloc_size
    }

    fn read_into(&self, gpa: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let src = self.host_range(gpa, dst.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn write_from(&self, gpa: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let dst = self.host_range(gpa, src.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    fn get_slice(&self, gpa: u64, len: usize) -> GuestMemoryResult<&[u8]> {
        let ptr = self.host_range(gpa, len)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    fn get_slice_mut(&self, gpa: u64, len: usize) -> GuestMemoryResult<&mut [u8]> {
        let ptr = self.host_range(gpa, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }
}

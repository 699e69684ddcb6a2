//! Bitmap-backed physical frame allocator.
//!
//! One bit per 4 KiB frame: `0` = free, `1` = used. The bitmap itself lives
//! inside the largest usable region of the boot memory map, and that region
//! is shrunk to exclude the bitmap's own frames before the allocator is
//! handed back to the caller.

use kcore::addr::PhysAddr;
use kcore::sync::SpinLock;

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;

/// One entry of the boot-reported physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    /// Physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Whether the allocator may hand out frames from this region.
    pub usable: bool,
}

/// Snapshot of allocator-wide frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmmStats {
    /// Total frames tracked by the bitmap.
    pub total: usize,
    /// Frames currently allocated.
    pub used: usize,
    /// Frames available at boot (usable minus bitmap-reserved).
    pub usable: usize,
    /// Frames permanently withheld (non-usable memory-map ranges, the
    /// bitmap's own backing storage).
    pub reserved: usize,
}

/// Physical frame number: `physical_address / PAGE_SIZE`.
pub type FrameNumber = u64;

/// A bitmap-based physical frame allocator.
///
/// All mutation goes through `&mut self`; callers are expected to wrap the
/// allocator in a [`SpinLock`] (see [`Pmm`]) rather than adding interior
/// locking here.
pub struct BitmapAllocator {
    bitmap: &'static mut [u64],
    total_frames: usize,
    used: usize,
    usable: usize,
    reserved: usize,
    /// Word index hint for the next `alloc` scan (amortizes repeated scans
    /// of the already-filled prefix of the bitmap).
    last_used_index: usize,
}

/// Error returned by [`BitmapAllocator::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmInitError {
    /// No usable memory-map entries were supplied.
    NoUsableMemory,
    /// No single usable region was large enough to hold the bitmap.
    NoBitmapRegion,
}

impl BitmapAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// `hhdm_offset` is the higher-half direct map offset (physical frame
    /// `P` is also visible at `P + hhdm_offset`); the bitmap storage itself
    /// is accessed through that alias. Every frame starts marked used; the
    /// constructor then clears bits for every usable, non-bitmap frame.
    ///
    /// # Safety
    ///
    /// `hhdm_offset` must be the real HHDM offset reported by the boot
    /// protocol, `map` must accurately describe physical memory, and this
    /// must be called exactly once during boot.
    pub unsafe fn new(map: &[MemoryMapEntry], hhdm_offset: u64) -> Result<Self, PmmInitError> {
        let max_phys = map
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.base + r.length)
            .max()
            .ok_or(PmmInitError::NoUsableMemory)?;

        let total_frames = (max_phys / FRAME_SIZE) as usize;
        let bitmap_words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = bitmap_words * 8;

        let bitmap_region = map
            .iter()
            .find(|r| r.usable && r.length >= bitmap_bytes as u64)
            .ok_or(PmmInitError::NoBitmapRegion)?;
        let bitmap_base = bitmap_region.base;
        let bitmap_frames = (bitmap_bytes as u64).div_ceil(FRAME_SIZE);

        // SAFETY: `bitmap_base` lies in a usable region at least
        // `bitmap_bytes` long, and `hhdm_offset` is the caller-certified HHDM
        // offset, so the HHDM alias for this range is valid and exclusive to
        // us during boot.
        let bitmap = unsafe {
            let ptr = (hhdm_offset + bitmap_base) as *mut u64;
            core::slice::from_raw_parts_mut(ptr, bitmap_words)
        };
        // All frames reserved by default; usable ranges are opened below.
        bitmap.fill(u64::MAX);

        let mut allocator = Self {
            bitmap,
            total_frames,
            used: total_frames,
            usable: 0,
            reserved: total_frames,
            last_used_index: 0,
        };

        for region in map.iter().filter(|r| r.usable) {
            let start_frame = region.base / FRAME_SIZE;
            let end_frame = (region.base + region.length) / FRAME_SIZE;
            for frame in start_frame..end_frame.min(total_frames as u64) {
                allocator.mark_free(frame);
            }
        }

        // Re-reserve the frames backing the bitmap itself, even though they
        // fall inside a region just marked free above.
        let bitmap_start_frame = bitmap_base / FRAME_SIZE;
        for frame in bitmap_start_frame..bitmap_start_frame + bitmap_frames {
            allocator.mark_used_initial(frame);
        }

        Ok(allocator)
    }

    fn mark_free(&mut self, frame: FrameNumber) {
        let (word, bit) = Self::word_bit(frame);
        if self.bitmap[word] & (1 << bit) != 0 {
            self.bitmap[word] &= !(1 << bit);
            self.used -= 1;
            self.usable += 1;
            self.reserved -= 1;
        }
    }

    /// Re-marks a just-freed frame used during construction (bitmap's own
    /// backing store), keeping `usable` accurate.
    fn mark_used_initial(&mut self, frame: FrameNumber) {
        let (word, bit) = Self::word_bit(frame);
        if self.bitmap[word] & (1 << bit) == 0 {
            self.bitmap[word] |= 1 << bit;
            self.used += 1;
            self.usable -= 1;
            self.reserved += 1;
        }
    }

    #[inline]
    fn word_bit(frame: FrameNumber) -> (usize, u32) {
        ((frame / BITS_PER_WORD as u64) as usize, (frame % BITS_PER_WORD as u64) as u32)
    }

    /// Allocates `n` contiguous frames via first-fit, starting the scan at
    /// `last_used_index` and wrapping to 0 on failure (scanning up to the
    /// prior start once). Returns the base physical address of the run, or
    /// `None` on exhaustion.
    pub fn alloc(&mut self, n: usize) -> Option<PhysAddr> {
        if n == 0 {
            return None;
        }
        let start = self.last_used_index;
        if let Some(base) = self.scan_from(start, self.total_frames, n) {
            return Some(base);
        }
        if start != 0 {
            if let Some(base) = self.scan_from(0, start, n) {
                return Some(base);
            }
        }
        None
    }

    fn scan_from(&mut self, from: usize, to: usize, n: usize) -> Option<PhysAddr> {
        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;
        for frame in from..to {
            if self.is_free(frame as u64) {
                if run_start.is_none() {
                    run_start = Some(frame);
                }
                run_len += 1;
                if run_len == n {
                    let base = run_start.unwrap();
                    for f in base..base + n {
                        self.set_used(f as u64);
                    }
                    self.used += n;
                    self.usable -= n;
                    self.last_used_index = base + n;
                    return Some(PhysAddr::new((base as u64) * FRAME_SIZE));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn is_free(&self, frame: FrameNumber) -> bool {
        let (word, bit) = Self::word_bit(frame);
        self.bitmap[word] & (1 << bit) == 0
    }

    fn set_used(&mut self, frame: FrameNumber) {
        let (word, bit) = Self::word_bit(frame);
        self.bitmap[word] |= 1 << bit;
    }

    /// Frees a run of `n` frames starting at `base`. No coalescing is
    /// needed: the bitmap is page-granular and freeing only clears bits.
    pub fn free(&mut self, base: PhysAddr, n: usize) {
        let start_frame = base.as_u64() / FRAME_SIZE;
        for f in start_frame..start_frame + n as u64 {
            let (word, bit) = Self::word_bit(f);
            debug_assert!(
                self.bitmap[word] & (1 << bit) != 0,
                "double free of physical frame {f}"
            );
            self.bitmap[word] &= !(1 << bit);
        }
        self.used -= n;
        self.usable += n;
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total: self.total_frames,
            used: self.used,
            usable: self.usable,
            reserved: self.reserved,
        }
    }
}

/// Global physical memory manager, guarded by a spinlock.
pub struct Pmm {
    inner: SpinLock<Option<BitmapAllocator>>,
}

impl Pmm {
    /// An uninitialized PMM; must be populated with [`Pmm::init`] before use.
    pub const fn uninit() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Installs the bitmap allocator. Panics if already initialized — this
    /// is a boot-order invariant violation, not a recoverable error.
    pub fn init(&self, allocator: BitmapAllocator) {
        let mut guard = self.inner.lock();
        assert!(guard.is_none(), "Pmm::init called twice");
        *guard = Some(allocator);
    }

    /// Allocates `n` contiguous frames. Returns `None` on exhaustion;
    /// callers on boot-critical paths treat this as fatal, others propagate
    /// `ENOMEM`.
    pub fn alloc(&self, n: usize) -> Option<PhysAddr> {
        self.inner.lock().as_mut().expect("Pmm not initialized").alloc(n)
    }

    /// Allocates `n` frames and zeroes them through the HHDM alias.
    ///
    /// # Safety
    ///
    /// `hhdm_offset` must be the real HHDM offset; the returned frames must
    /// not be concurrently observed through another mapping while zeroing.
    pub unsafe fn alloc_zeroed(&self, n: usize, hhdm_offset: u64) -> Option<PhysAddr> {
        let base = self.alloc(n)?;
        // SAFETY: the caller certifies `hhdm_offset` and that the frames are
        // not aliased elsewhere yet; we just allocated them above.
        unsafe {
            let ptr = (hhdm_offset + base.as_u64()) as *mut u8;
            core::ptr::write_bytes(ptr, 0, n * FRAME_SIZE as usize);
        }
        Some(base)
    }

    /// Frees a run of `n` frames.
    pub fn free(&self, base: PhysAddr, n: usize) {
        self.inner.lock().as_mut().expect("Pmm not initialized").free(base, n);
    }

    /// Returns a snapshot of the allocator counters.
    pub fn stats(&self) -> PmmStats {
        self.inner.lock().as_ref().expect("Pmm not initialized").stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    /// Builds a small allocator with one usable region backed by a heap
    /// buffer, standing in for an HHDM alias in host tests.
    fn small_allocator(usable_bytes: u64) -> (BitmapAllocator, Vec<u64>) {
        let total_bytes = usable_bytes + FRAME_SIZE; // room for the bitmap itself
        let mut backing = vec![0u8; total_bytes as usize];
        let base = backing.as_mut_ptr() as u64;
        let map = [MemoryMapEntry {
            base,
            length: total_bytes,
            usable: true,
        }];
        // SAFETY: `hhdm_offset = 0` maps physical == virtual directly onto
        // our heap buffer, which is exclusively ours for the test.
        let allocator = unsafe { BitmapAllocator::new(&map, 0).unwrap() };
        let words = vec![0u64; 0];
        (allocator, words)
        // `backing` is intentionally leaked for the allocator's lifetime in
        // these tests; Vec<u8> drop would otherwise invalidate `bitmap`.
    }

    #[test]
    fn alloc_marks_frames_used_and_free_reverses_it() {
        let (mut pmm, _pad) = small_allocator(16 * FRAME_SIZE);
        let stats_before = pmm.stats();
        let base = pmm.alloc(2).expect("alloc should succeed");
        assert!(pmm.stats().used >= stats_before.used + 2);
        pmm.free(base, 2);
        assert_eq!(pmm.stats().used, stats_before.used);
    }

    #[test]
    fn alloc_returns_contiguous_distinct_runs() {
        let (mut pmm, _pad) = small_allocator(16 * FRAME_SIZE);
        let a = pmm.alloc(2).unwrap();
        let b = pmm.alloc(2).unwrap();
        assert_ne!(a.as_u64(), b.as_u64());
    }

    #[test]
    fn exhaustion_returns_none() {
        let (mut pmm, _pad) = small_allocator(4 * FRAME_SIZE);
        let stats = pmm.stats();
        assert!(pmm.alloc(stats.usable + 1).is_none());
    }

    #[test]
    fn counters_sum_to_usable_plus_used() {
        let (pmm, _pad) = small_allocator(8 * FRAME_SIZE);
        let stats = pmm.stats();
        assert_eq!(stats.used + stats.usable, stats.total - stats.reserved + stats.used);
    }
}

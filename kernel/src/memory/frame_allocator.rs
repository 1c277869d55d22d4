//! Physical frame allocation sourced from the boot handoff's memory map.
//!
//! A simple bump allocator over the usable regions, backed by a free list
//! for frames released by `deallocate_frame` (used to return AHCI DMA
//! buffers on port teardown).

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

/// Maximum number of usable memory regions tracked at once.
const MAX_REGIONS: usize = 128;

/// Never allocate frames below 1 MiB: avoids frame 0 (null-pointer
/// confusion) and legacy BIOS/VGA reserved ranges.
const LOW_MEMORY_FLOOR: u64 = 0x100000;

#[derive(Debug, Clone, Copy)]
struct UsableRegion {
    start: u64,
    end: u64,
}

struct MemoryInfo {
    regions: [Option<UsableRegion>; MAX_REGIONS],
    region_count: usize,
}

static MEMORY_INFO: Mutex<Option<MemoryInfo>> = Mutex::new(None);
static NEXT_FREE_FRAME: AtomicUsize = AtomicUsize::new(0);

static FREE_FRAMES: Mutex<Vec<PhysFrame>> = Mutex::new(Vec::new());

/// Sequential allocator over the regions extracted at `init()`.
pub struct BootInfoFrameAllocator;

impl BootInfoFrameAllocator {
    pub fn new() -> Self {
        Self
    }

    fn get_usable_frame(n: usize) -> Option<PhysFrame> {
        let info = MEMORY_INFO.lock();
        let info = info.as_ref()?;

        let mut count = 0;
        for i in 0..info.region_count {
            if let Some(region) = info.regions[i] {
                let region_frames = ((region.end - region.start) / 4096) as usize;
                if count + region_frames > n {
                    let frame_offset = n - count;
                    let frame_addr = region.start + (frame_offset as u64 * 4096);
                    if frame_addr < LOW_MEMORY_FLOOR {
                        return None;
                    }
                    return Some(PhysFrame::containing_address(PhysAddr::new(frame_addr)));
                }
                count += region_frames;
            }
        }
        None
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        loop {
            let current = NEXT_FREE_FRAME.load(Ordering::SeqCst);
            let frame = Self::get_usable_frame(current);
            if frame.is_none() {
                return None;
            }
            match NEXT_FREE_FRAME.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return frame,
                Err(_) => continue,
            }
        }
    }
}

/// Extract usable regions from the boot handoff's memory map. Each item is
/// `(start, end)` in bytes for a region the loader marked `Available`.
pub fn init(usable_regions: impl Iterator<Item = (u64, u64)>) {
    let mut regions = [None; MAX_REGIONS];
    let mut region_count = 0;
    let mut total_memory = 0u64;
    let mut ignored_regions = 0;

    for (start, end) in usable_regions {
        if end <= LOW_MEMORY_FLOOR {
            ignored_regions += 1;
            continue;
        }
        let adjusted_start = start.max(LOW_MEMORY_FLOOR);
        if region_count < MAX_REGIONS {
            regions[region_count] = Some(UsableRegion {
                start: adjusted_start,
                end,
            });
            region_count += 1;
            total_memory += end - adjusted_start;
        } else {
            ignored_regions += 1;
        }
    }

    *MEMORY_INFO.lock() = Some(MemoryInfo {
        regions,
        region_count,
    });

    log::info!(
        "frame allocator: {} MiB usable across {} regions (floor={:#x})",
        total_memory / (1024 * 1024),
        region_count,
        LOW_MEMORY_FLOOR
    );
    if ignored_regions > 0 {
        log::warn!("frame allocator: ignored {} regions (below floor or over capacity)", ignored_regions);
    }
}

/// Allocate a single physical frame, reusing the free list first.
pub fn allocate_frame() -> Option<PhysFrame> {
    if let Some(mut free_list) = FREE_FRAMES.try_lock() {
        if let Some(frame) = free_list.pop() {
            return Some(frame);
        }
    }
    let mut allocator = BootInfoFrameAllocator::new();
    allocator.allocate_frame()
}

/// Allocate `count` frames that are physically contiguous, for DMA buffers
/// that must be addressed by a single base address (e.g. an AHCI PRDT
/// entry). Best-effort: retries a bounded number of times against the
/// sequential allocator, since consecutive calls normally return
/// consecutive frames absent an intervening free-list reuse or region
/// boundary. Non-contiguous runs are not returned to the free list, since
/// by construction they were never handed to a caller that could free them.
pub fn allocate_contiguous_frames(count: usize) -> Option<PhysFrame> {
    const ATTEMPTS: usize = 8;
    for _ in 0..ATTEMPTS {
        let first = allocate_frame()?;
        let mut expected = first.start_address().as_u64() + 4096;
        let mut ok = true;
        for _ in 1..count {
            match allocate_frame() {
                Some(f) if f.start_address().as_u64() == expected => expected += 4096,
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            return Some(first);
        }
    }
    None
}

/// Return a frame to the free list for reuse.
pub fn deallocate_frame(frame: PhysFrame) {
    if frame.start_address().as_u64() < LOW_MEMORY_FLOOR {
        return;
    }
    if let Some(mut free_list) = FREE_FRAMES.try_lock() {
        free_list.push(frame);
    } else {
        log::warn!(
            "frame allocator: could not deallocate frame {:#x}, lock contention",
            frame.start_address().as_u64()
        );
    }
}

pub struct MemoryStats {
    pub total_bytes: u64,
    pub allocated_frames: usize,
    pub free_list_frames: usize,
}

pub fn memory_stats() -> MemoryStats {
    let total_bytes = MEMORY_INFO
        .try_lock()
        .and_then(|guard| {
            guard.as_ref().map(|info| {
                (0..info.region_count)
                    .filter_map(|i| info.regions[i])
                    .map(|r| r.end - r.start)
                    .sum()
            })
        })
        .unwrap_or(0);

    let allocated_frames = NEXT_FREE_FRAME.load(Ordering::Relaxed);
    let free_list_frames = FREE_FRAMES.try_lock().map(|l| l.len()).unwrap_or(0);

    MemoryStats {
        total_bytes,
        allocated_frames,
        free_list_frames,
    }
}

/// Adapts the free-standing allocator functions to the `x86_64` crate's
/// `FrameAllocator` trait for use with an `OffsetPageTable` mapper.
pub struct GlobalFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        allocate_frame()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn init_skips_regions_entirely_below_floor() {
        init([(0, 0x1000), (0x10_0000, 0x20_0000)].into_iter());
        let stats = memory_stats();
        assert_eq!(stats.total_bytes, 0x10_0000);
    }

    #[test]
    fn init_clamps_region_start_to_floor() {
        init([(0, 0x20_0000)].into_iter());
        let stats = memory_stats();
        assert_eq!(stats.total_bytes, 0x20_0000 - LOW_MEMORY_FLOOR);
    }
}

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{Mapper, OffsetPageTable, Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

pub const HEAP_START: u64 = 0x_4444_4444_0000;

/// Heap size: 32 MiB, sized for the kernel's own allocations and AHCI DMA
/// scratch buffers (no userspace or filesystem cache competes for it in
/// this core).
pub const HEAP_SIZE: u64 = 32 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Map the heap's page range and hand the backing memory to the global
/// allocator.
pub fn init(mapper: &mut OffsetPageTable<'static>) -> Result<(), &'static str> {
    let heap_start = VirtAddr::new(HEAP_START);
    let heap_end = heap_start + HEAP_SIZE;

    let heap_start_page = Page::<Size4KiB>::containing_address(heap_start);
    let heap_end_page = Page::<Size4KiB>::containing_address(heap_end - 1u64);

    log::info!("mapping heap pages from {:?} to {:?}", heap_start_page, heap_end_page);

    for page in Page::range_inclusive(heap_start_page, heap_end_page) {
        let frame = crate::memory::frame_allocator::allocate_frame().ok_or("out of memory")?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        unsafe {
            mapper
                .map_to(page, frame, flags, &mut crate::memory::frame_allocator::GlobalFrameAllocator)
                .map_err(|_| "failed to map heap page")?
                .flush();
        }
    }

    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }

    log::info!("heap initialized at {:#x} with size {} KiB", HEAP_START, HEAP_SIZE / 1024);
    Ok(())
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}

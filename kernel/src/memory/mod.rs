pub mod frame_allocator;
pub mod heap;
pub mod paging;

use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{Mapper, Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

/// Base of the MMIO virtual address window, bump-allocated by `map_mmio`.
const MMIO_BASE: u64 = 0xFFFF_A000_0000_0000;

static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();
static MMIO_NEXT_ADDR: Mutex<u64> = Mutex::new(MMIO_BASE);

/// Bring up frame allocation, paging, and the kernel heap.
///
/// `usable_regions` is the set of `Available` ranges drawn from
/// `boot::BootHandoff::memory_map()`.
pub fn init(physical_memory_offset: VirtAddr, usable_regions: impl Iterator<Item = (u64, u64)>) {
    log::info!("initializing memory management, physical offset {:?}", physical_memory_offset);

    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);

    frame_allocator::init(usable_regions);

    let mut mapper = unsafe { paging::init(physical_memory_offset) };
    unsafe {
        paging::enable_global_pages();
    }

    heap::init(&mut mapper).expect("heap initialization failed");

    log::info!("memory management initialized");
}

/// Get the physical memory offset established at `init()`.
pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET.get().expect("physical memory offset not initialized")
}

/// Convert a physical address to a virtual address through the offset map.
pub fn phys_to_virt(phys: PhysAddr, offset: VirtAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + offset.as_u64())
}

/// Map a physical MMIO region (e.g. an AHCI BAR) into kernel virtual
/// address space with caching disabled. Returns the virtual base address.
pub fn map_mmio(phys_addr: u64, size: usize) -> Result<usize, &'static str> {
    let phys_offset = physical_memory_offset();

    let size_aligned = (size + 0xFFF) & !0xFFF;
    let num_pages = size_aligned / 4096;

    let virt_addr = {
        let mut next = MMIO_NEXT_ADDR.lock();
        let addr = *next;
        *next += size_aligned as u64;
        addr
    };

    log::info!("mmio: mapping {:#x} -> {:#x} ({} pages)", phys_addr, virt_addr, num_pages);

    let mut mapper = unsafe { paging::get_mapper_with_offset(phys_offset) };

    for i in 0..num_pages {
        let page_phys = phys_addr + (i * 4096) as u64;
        let page_virt = virt_addr + (i * 4096) as u64;

        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(page_virt));
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(page_phys));

        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::NO_CACHE
            | PageTableFlags::WRITE_THROUGH;

        unsafe {
            mapper
                .map_to(page, frame, flags, &mut frame_allocator::GlobalFrameAllocator)
                .map_err(|_| "failed to map MMIO page")?
                .flush();
        }
    }

    Ok(virt_addr as usize)
}

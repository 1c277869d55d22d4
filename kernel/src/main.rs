#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;
use x86_64::VirtAddr;

use kernel::acpi::{AcpiWalker, TABLE_HEADER_SIZE};
use kernel::boot::record::{
    BootRecordHeader, LoadedFileEntry, MemoryKind, MemoryMapEntry, BOOT_RECORD_MAGIC,
    FLAG_ACPI, FLAG_FRAMEBUFFER, FLAG_SERIAL, MIN_VERSION,
};
use kernel::boot::BootHandoff;
use kernel::error::ProtonError;
use kernel::topology::cpu::CpuTopology;
use kernel::topology::numa::NumaTopology;
use kernel::{drivers, hlt_loop, memory, serial};

entry_point!(kernel_main);

/// Backing storage for the translated memory map. The loader's own UEFI
/// memory map rarely exceeds a few hundred descriptors; this is generous
/// headroom without resorting to a heap that doesn't exist yet.
const MAX_MEMORY_MAP_ENTRIES: usize = 256;

static mut MEMORY_MAP_STATIC: [MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES] = [MemoryMapEntry {
    phys_start: 0,
    phys_end: 0,
    kind: 0,
    flags: 0,
}; MAX_MEMORY_MAP_ENTRIES];

/// No loader-provided file table exists on this path; `BootHandoff::find_file`
/// simply finds nothing against an empty table.
static LOADED_FILES_STATIC: [LoadedFileEntry; 0] = [];

/// Translate the loader's own memory map into the wire-format table
/// `BootHandoff` expects, writing into `MEMORY_MAP_STATIC`.
///
/// # Safety
/// Must only be called once, before any other code reads `MEMORY_MAP_STATIC`.
unsafe fn build_memory_map(regions: &MemoryRegions) -> u32 {
    let mut count = 0usize;
    for region in regions.iter() {
        if count >= MAX_MEMORY_MAP_ENTRIES {
            log::warn!(
                "memory map: dropping regions beyond static capacity {}",
                MAX_MEMORY_MAP_ENTRIES
            );
            break;
        }
        let kind = match region.kind {
            MemoryRegionKind::Usable => MemoryKind::Available,
            MemoryRegionKind::Bootloader => MemoryKind::Kernel,
            _ => MemoryKind::Reserved,
        };
        #[allow(static_mut_refs)]
        {
            MEMORY_MAP_STATIC[count] = MemoryMapEntry {
                phys_start: region.start,
                phys_end: region.end,
                kind: kind as u32,
                flags: 0,
            };
        }
        count += 1;
    }
    count as u32
}

/// The MADT's fixed `Local Interrupt Controller Address` field sits
/// immediately after the common table header, ahead of the variable-length
/// entry list `topology::cpu` walks.
fn madt_local_apic_address(table_bytes: &[u8]) -> Option<u32> {
    if table_bytes.len() < TABLE_HEADER_SIZE + 4 {
        return None;
    }
    let start = TABLE_HEADER_SIZE;
    Some(u32::from_le_bytes(
        table_bytes[start..start + 4].try_into().ok()?,
    ))
}

/// Read the running CPU's local APIC ID out of the xAPIC MMIO ID register
/// (offset 0x20, ID in bits 24..31). The physical memory mapping the loader
/// establishes is still live at this point, so `phys_offset` reaches it
/// directly without going through `memory::map_mmio`.
fn read_bsp_apic_id(local_apic_phys: u32, phys_offset: u64) -> u32 {
    let reg = (local_apic_phys as u64 + phys_offset) as *const u32;
    let id_reg = unsafe { core::ptr::read_volatile(reg.wrapping_byte_add(0x20)) };
    id_reg >> 24
}

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init(serial::DEFAULT_PORT_BASE);
    serial::init_logger();
    log::info!("ProtonOS kernel starting");

    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("loader did not report a physical memory offset");

    let entries_count = unsafe { build_memory_map(&boot_info.memory_regions) };

    let mut flags = FLAG_SERIAL;
    let mut acpi_rsdp = 0u64;
    if let Some(rsdp) = boot_info.rsdp_addr.into_option() {
        flags |= FLAG_ACPI;
        acpi_rsdp = rsdp;
    } else {
        log::warn!("loader did not report an ACPI RSDP");
    }

    let mut framebuffer_phys = 0u64;
    let mut width = 0u32;
    let mut height = 0u32;
    let mut pitch = 0u32;
    let mut bpp = 0u32;
    if let Some(fb) = boot_info.framebuffer.as_mut() {
        let info = fb.info();
        framebuffer_phys = fb.buffer_mut().as_mut_ptr() as u64;
        width = info.width as u32;
        height = info.height as u32;
        pitch = (info.stride * info.bytes_per_pixel) as u32;
        bpp = (info.bytes_per_pixel * 8) as u32;
        flags |= FLAG_FRAMEBUFFER;
    }

    #[allow(static_mut_refs)]
    let memory_map_phys = unsafe { MEMORY_MAP_STATIC.as_ptr() as u64 };

    let header = BootRecordHeader {
        magic: BOOT_RECORD_MAGIC,
        version: MIN_VERSION,
        flags,
        memory_map_phys,
        entries_count,
        entry_size: core::mem::size_of::<MemoryMapEntry>() as u32,
        kernel_phys_base: boot_info.kernel_addr,
        kernel_virt_base: 0,
        kernel_size: boot_info.kernel_len,
        kernel_entry_offset: 0,
        loaded_files_phys: LOADED_FILES_STATIC.as_ptr() as u64,
        loaded_files_count: 0,
        reserved0: 0,
        acpi_rsdp,
        framebuffer_phys,
        width,
        height,
        pitch,
        bpp,
        serial_port: serial::DEFAULT_PORT_BASE as u32,
        reserved: [0; 8],
    };

    let handoff = match unsafe { BootHandoff::new(&header as *const BootRecordHeader) } {
        Ok(handoff) => handoff,
        Err(e) => {
            log::error!("boot handoff rejected: {}", ProtonError::from(e));
            hlt_loop();
        }
    };

    let usable_regions = handoff
        .memory_map()
        .filter(|entry| entry.kind() == Some(MemoryKind::Available))
        .map(|entry| (entry.phys_start, entry.phys_end));
    memory::init(VirtAddr::new(phys_offset), usable_regions);

    let mut numa_topology = NumaTopology::single_node();
    let mut cpu_topology: Option<CpuTopology> = None;

    if let Some(rsdp) = handoff.rsdp() {
        match AcpiWalker::new(rsdp, phys_offset) {
            Ok(walker) => {
                if let Some(madt_phys) = walker.find_table(b"APIC") {
                    let madt_bytes = unsafe { walker.read_table_bytes(madt_phys) };
                    let bsp_apic_id = madt_local_apic_address(madt_bytes)
                        .map(|lapic_phys| read_bsp_apic_id(lapic_phys, phys_offset))
                        .unwrap_or(0);
                    let topo = CpuTopology::parse(madt_bytes, bsp_apic_id);
                    log::info!(
                        "cpu topology: {} cpu(s), {} ioapic(s)",
                        topo.cpu_count(),
                        topo.ioapics().count()
                    );
                    cpu_topology = Some(topo);
                } else {
                    log::warn!("no MADT present, single-CPU assumption in effect");
                }

                if let Some(srat_phys) = walker.find_table(b"SRAT") {
                    let srat_bytes = unsafe { walker.read_table_bytes(srat_phys) };
                    let mut numa = NumaTopology::parse_srat(srat_bytes);
                    if let Some(slit_phys) = walker.find_table(b"SLIT") {
                        let slit_bytes = unsafe { walker.read_table_bytes(slit_phys) };
                        numa.apply_slit(slit_bytes);
                    }
                    numa_topology = numa;
                } else {
                    log::info!("no SRAT present, assuming a single NUMA node");
                }
            }
            Err(e) => log::warn!("ACPI unavailable: {}", ProtonError::from(e)),
        }
    }

    if let Some(topo) = cpu_topology.as_mut() {
        topo.assign_numa_nodes(&numa_topology);
    }

    log::info!("numa topology: {} node(s)", numa_topology.node_count());

    let (pci_count, _hba, block_devices) = drivers::init(phys_offset);
    log::info!(
        "pci devices discovered: {}, block devices ready: {}",
        pci_count,
        block_devices.len()
    );

    log::info!("ProtonOS boot sequence complete");
    hlt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("panic: {}", info);
    hlt_loop()
}

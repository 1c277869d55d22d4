//! Wire layout of the `BootRecord` handed off by the loader.
//!
//! This is the canonical byte layout (spec section 6): a fixed header
//! followed by a memory-map table and a loaded-files table, both reached
//! through physical pointers embedded in the header. The struct definitions
//! below mirror the firmware/loader interface exactly; `kernel/src/boot/mod.rs`
//! builds the validated, higher-level `BootHandoff` view on top of them.

/// Fixed magic tag identifying a valid boot record.
pub const BOOT_RECORD_MAGIC: u64 = 0x50524F544F4E4F53;

/// Minimum supported `BootRecordHeader::version`.
pub const MIN_VERSION: u32 = 2;

pub const FLAG_FRAMEBUFFER: u32 = 1 << 0;
pub const FLAG_ACPI: u32 = 1 << 1;
pub const FLAG_SERIAL: u32 = 1 << 2;

/// Kind of a memory-map region, matching the loader's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryKind {
    Available = 0,
    Reserved = 1,
    AcpiReclaim = 2,
    AcpiNvs = 3,
    Kernel = 4,
    LoadedFile = 5,
    BootInfo = 6,
    PageTables = 7,
    Stack = 8,
}

impl MemoryKind {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Available,
            1 => Self::Reserved,
            2 => Self::AcpiReclaim,
            3 => Self::AcpiNvs,
            4 => Self::Kernel,
            5 => Self::LoadedFile,
            6 => Self::BootInfo,
            7 => Self::Stack,
            8 => Self::PageTables,
            _ => return None,
        })
    }
}

/// The fixed-size header at the front of the boot record.
///
/// Field order and widths are the canonical wire layout; do not reorder.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootRecordHeader {
    pub magic: u64,
    pub version: u32,
    pub flags: u32,
    pub memory_map_phys: u64,
    pub entries_count: u32,
    pub entry_size: u32,
    pub kernel_phys_base: u64,
    pub kernel_virt_base: u64,
    pub kernel_size: u64,
    pub kernel_entry_offset: u64,
    pub loaded_files_phys: u64,
    pub loaded_files_count: u32,
    pub reserved0: u32,
    pub acpi_rsdp: u64,
    pub framebuffer_phys: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub serial_port: u32,
    pub reserved: [u32; 8],
}

pub const HEADER_SIZE: usize = core::mem::size_of::<BootRecordHeader>();

/// One entry of the memory map table (24 bytes, the canonical on-wire size).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub phys_start: u64,
    pub phys_end: u64,
    pub kind: u32,
    pub flags: u32,
}

pub const MEMORY_MAP_ENTRY_SIZE: usize = core::mem::size_of::<MemoryMapEntry>();

impl MemoryMapEntry {
    pub fn kind(&self) -> Option<MemoryKind> {
        MemoryKind::from_u32(self.kind)
    }
}

/// One entry of the loaded-files table (88 bytes: 8 + 8 + 64 + 4 + 4).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LoadedFileEntry {
    pub phys_addr: u64,
    pub size: u64,
    pub name: [u8; 64],
    pub flags: u32,
    pub reserved: u32,
}

pub const LOADED_FILE_ENTRY_SIZE: usize = core::mem::size_of::<LoadedFileEntry>();

impl LoadedFileEntry {
    /// The file name, NUL-trimmed. Invalid UTF-8 yields an empty string
    /// rather than panicking — the boot record is adversarial input.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Pure byte-offset decoders for the header, kept alongside the `#[repr(C)]`
/// struct and verified equal to it by unit test (spec design note: "treat
/// these offsets as the canonical wire layout").
pub mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 8;
    pub const FLAGS: usize = 12;
    pub const MEMORY_MAP_PHYS: usize = 16;
    pub const ENTRIES_COUNT: usize = 24;
    pub const ENTRY_SIZE: usize = 28;
    pub const KERNEL_PHYS_BASE: usize = 32;
    pub const KERNEL_VIRT_BASE: usize = 40;
    pub const KERNEL_SIZE: usize = 48;
    pub const KERNEL_ENTRY_OFFSET: usize = 56;
    pub const LOADED_FILES_PHYS: usize = 64;
    pub const LOADED_FILES_COUNT: usize = 72;
    pub const ACPI_RSDP: usize = 80;
    pub const FRAMEBUFFER_PHYS: usize = 88;
    pub const WIDTH: usize = 96;
    pub const HEIGHT: usize = 100;
    pub const PITCH: usize = 104;
    pub const BPP: usize = 108;
    pub const SERIAL_PORT: usize = 112;

    pub fn read_u64(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    pub fn read_u32(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn header_offsets_match_struct_layout() {
        let mut header = BootRecordHeader {
            magic: BOOT_RECORD_MAGIC,
            version: 3,
            flags: FLAG_SERIAL,
            memory_map_phys: 0x1000,
            entries_count: 7,
            entry_size: MEMORY_MAP_ENTRY_SIZE as u32,
            kernel_phys_base: 0x20_0000,
            kernel_virt_base: 0xFFFF_8000_0020_0000,
            kernel_size: 0x8000,
            kernel_entry_offset: 0x40,
            loaded_files_phys: 0x3000,
            loaded_files_count: 2,
            reserved0: 0,
            acpi_rsdp: 0x7_FE00,
            framebuffer_phys: 0xE000_0000,
            width: 1920,
            height: 1080,
            pitch: 1920 * 4,
            bpp: 32,
            serial_port: 0x3F8,
            reserved: [0; 8],
        };
        let bytes = unsafe {
            core::slice::from_raw_parts(
                &mut header as *const _ as *const u8,
                HEADER_SIZE,
            )
        };

        assert_eq!(offsets::read_u64(bytes, offsets::MAGIC), header.magic);
        assert_eq!(offsets::read_u32(bytes, offsets::VERSION), header.version);
        assert_eq!(offsets::read_u32(bytes, offsets::FLAGS), header.flags);
        assert_eq!(
            offsets::read_u64(bytes, offsets::MEMORY_MAP_PHYS),
            header.memory_map_phys
        );
        assert_eq!(
            offsets::read_u32(bytes, offsets::ENTRIES_COUNT),
            header.entries_count
        );
        assert_eq!(
            offsets::read_u64(bytes, offsets::KERNEL_PHYS_BASE),
            header.kernel_phys_base
        );
        assert_eq!(
            offsets::read_u64(bytes, offsets::ACPI_RSDP),
            header.acpi_rsdp
        );
        assert_eq!(
            offsets::read_u32(bytes, offsets::SERIAL_PORT),
            header.serial_port
        );
    }

    #[test]
    fn loaded_file_name_is_nul_trimmed() {
        let mut name = [0u8; 64];
        name[..6].copy_from_slice(b"KERNEL");
        let entry = LoadedFileEntry {
            phys_addr: 0,
            size: 0,
            name,
            flags: 0,
            reserved: 0,
        };
        assert_eq!(entry.name_str(), "KERNEL");
    }

    #[test]
    fn sizes_match_spec_section_6() {
        assert_eq!(MEMORY_MAP_ENTRY_SIZE, 24);
        assert_eq!(LOADED_FILE_ENTRY_SIZE, 88);
    }
}

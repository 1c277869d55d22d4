//! AhciHba / AhciPort: SATA storage over the AHCI programming model.
//!
//! The HBA maps BAR5 of a PCI device matching class 0x01 / subclass 0x06 /
//! prog-if 0x01, enables AHCI mode, and instantiates one `AhciPort` per bit
//! set in the Ports-Implemented register. Each port owns three DMA-coherent
//! buffers (command list, received-FIS, command table) plus a data buffer
//! sized for the largest single command this core issues (256 sectors).
//! Exactly one command is outstanding per port at a time, always in slot 0.

pub mod fis;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use crate::drivers::pci;
use crate::memory::frame_allocator;

const HBA_CAP: usize = 0x00;
const HBA_GHC: usize = 0x04;
const HBA_PI: usize = 0x0C;
const HBA_VS: usize = 0x10;
const HBA_CAP2: usize = 0x24;

const GHC_AE: u32 = 1 << 31;
const CAP_SAM: u32 = 1 << 18;
const CAP_S64A: u32 = 1 << 31;

const PORT_REG_SIZE: u64 = 0x80;
const PORT_BASE_OFFSET: u64 = 0x100;

const PORT_CLB: usize = 0x00;
const PORT_CLBU: usize = 0x04;
const PORT_FB: usize = 0x08;
const PORT_FBU: usize = 0x0C;
const PORT_IS: usize = 0x10;
const PORT_CMD: usize = 0x18;
const PORT_TFD: usize = 0x20;
const PORT_SIG: usize = 0x24;
const PORT_SSTS: usize = 0x28;
const PORT_SERR: usize = 0x30;
const PORT_CI: usize = 0x38;

const PORT_CMD_ST: u32 = 1 << 0;
const PORT_CMD_FRE: u32 = 1 << 4;
const PORT_CMD_FR: u32 = 1 << 14;
const PORT_CMD_CR: u32 = 1 << 15;

const PORT_TFD_ERR: u32 = 1 << 0;

const SSTS_DET_MASK: u32 = 0x0F;
const SSTS_DET_PRESENT: u32 = 0x03;
const SSTS_IPM_MASK: u32 = 0x0F00;
const SSTS_IPM_ACTIVE: u32 = 0x0100;

const SIG_ATA: u32 = 0x0000_0101;
const SIG_ATAPI: u32 = 0xEB14_0101;

/// Bounded busy-poll ceilings (spec section 5: reset ~1e6, command ~5e6).
const RESET_ITER_CEILING: u32 = 1_000_000;
const COMMAND_ITER_CEILING: u32 = 5_000_000;

pub const SECTOR_SIZE: usize = 512;
/// Hard contract: at most 256 sectors (128 KiB) per AHCI command. Chunking
/// above this belongs to the block-device façade, not this port.
pub const MAX_SECTORS_PER_COMMAND: u32 = 256;

const ATA_CMD_READ_DMA: u8 = 0xC8;
const ATA_CMD_WRITE_DMA: u8 = 0xCA;
const ATA_CMD_FLUSH_CACHE: u8 = 0xE7;
const DEVICE_LBA_MODE: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    DmaAllocFailed,
    CommandTimeout,
    CommandError,
    FatalHostError,
    OutOfRange,
    NotReady,
}

impl core::fmt::Display for AhciError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AhciError::DmaAllocFailed => write!(f, "DMA allocation failed"),
            AhciError::CommandTimeout => write!(f, "command timed out"),
            AhciError::CommandError => write!(f, "command completed with error"),
            AhciError::FatalHostError => write!(f, "fatal host-bus error"),
            AhciError::OutOfRange => write!(f, "LBA/count out of device range"),
            AhciError::NotReady => write!(f, "port is not in the Ready state"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Uninitialized,
    NoDevice,
    DevicePresent,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Ata,
    Atapi,
    Unknown,
}

/// Decoded subset of the IDENTIFY DEVICE response, trimmed to printable
/// strings. Byte pairs in model/serial/firmware were swapped by `fis::parse_identify`.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub sector_count: u64,
    pub sector_size: usize,
    pub lba48_supported: bool,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

fn trim_ata_string(raw: &[u8]) -> String {
    let text = core::str::from_utf8(raw).unwrap_or("");
    String::from(text.trim_end_matches(['\0', ' ']))
}

/// A physically-contiguous, identity-accessible DMA region. `virt` is reached
/// through the kernel's physical-memory offset mapping, never independently
/// mapped; `frames` is kept only so `free()` can return the same run.
struct DmaRegion {
    phys: u64,
    virt: u64,
    frame_count: usize,
}

/// Addressing ceiling a `DmaRegion` must respect, per the HBA's CAP.S64A bit:
/// controllers that don't advertise 64-bit DMA addressing can only reach the
/// low 4 GiB of physical memory with PORT_CLBU/PORT_FBU/PRDT upper dwords
/// left at zero.
const LOW_4GIB: u64 = 1 << 32;

impl DmaRegion {
    fn alloc(byte_len: usize, phys_offset: u64, supports_64bit: bool) -> Result<Self, AhciError> {
        let frame_count = byte_len.div_ceil(4096).max(1);
        let first = frame_allocator::allocate_contiguous_frames(frame_count)
            .ok_or(AhciError::DmaAllocFailed)?;
        let phys = first.start_address().as_u64();
        let end = phys + (frame_count * 4096) as u64;
        if !supports_64bit && end > LOW_4GIB {
            use x86_64::structures::paging::PhysFrame;
            use x86_64::PhysAddr;
            for i in 0..frame_count {
                let frame = PhysFrame::containing_address(PhysAddr::new(phys + (i * 4096) as u64));
                frame_allocator::deallocate_frame(frame);
            }
            log::error!(
                "ahci: DMA region at {:#x} exceeds 4 GiB but controller lacks CAP.S64A",
                phys
            );
            return Err(AhciError::DmaAllocFailed);
        }
        let virt = phys_offset + phys;
        unsafe {
            core::ptr::write_bytes(virt as *mut u8, 0, frame_count * 4096);
        }
        Ok(DmaRegion {
            phys,
            virt,
            frame_count,
        })
    }

    fn free(&self) {
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;
        for i in 0..self.frame_count {
            let frame = PhysFrame::containing_address(PhysAddr::new(self.phys + (i * 4096) as u64));
            frame_allocator::deallocate_frame(frame);
        }
    }

    fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt as *mut u8, len) }
    }

    fn as_slice(&self, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt as *const u8, len) }
    }
}

#[inline]
fn mmio_read(base: u64, offset: usize) -> u32 {
    unsafe { core::ptr::read_volatile((base + offset as u64) as *const u32) }
}

#[inline]
fn mmio_write(base: u64, offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile((base + offset as u64) as *mut u32, value) }
}

/// Per-port command engine: command list, received-FIS, command table, a
/// reusable data buffer sized for one 256-sector transfer, and identity.
pub struct AhciPort {
    port_num: usize,
    port_base: u64,
    state: PortState,
    phys_offset: u64,
    supports_64bit_dma: bool,
    cmd_list: Option<DmaRegion>,
    received_fis: Option<DmaRegion>,
    cmd_table: Option<DmaRegion>,
    data_buf: Option<DmaRegion>,
    kind: DeviceKind,
    identity: Option<DeviceIdentity>,
}

impl AhciPort {
    fn new(hba_virt: u64, port_num: usize, phys_offset: u64, supports_64bit_dma: bool) -> Self {
        AhciPort {
            port_num,
            port_base: hba_virt + PORT_BASE_OFFSET + port_num as u64 * PORT_REG_SIZE,
            state: PortState::Uninitialized,
            phys_offset,
            supports_64bit_dma,
            cmd_list: None,
            received_fis: None,
            cmd_table: None,
            data_buf: None,
            kind: DeviceKind::Unknown,
            identity: None,
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn port_num(&self) -> usize {
        self.port_num
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    fn reg(&self, offset: usize) -> u32 {
        mmio_read(self.port_base, offset)
    }

    fn set_reg(&self, offset: usize, value: u32) {
        mmio_write(self.port_base, offset, value)
    }

    fn stop_engine(&self) {
        let mut cmd = self.reg(PORT_CMD);
        cmd &= !PORT_CMD_ST;
        self.set_reg(PORT_CMD, cmd);

        for _ in 0..RESET_ITER_CEILING {
            if self.reg(PORT_CMD) & PORT_CMD_CR == 0 {
                break;
            }
            core::hint::spin_loop();
        }

        cmd = self.reg(PORT_CMD);
        cmd &= !PORT_CMD_FRE;
        self.set_reg(PORT_CMD, cmd);

        for _ in 0..RESET_ITER_CEILING {
            if self.reg(PORT_CMD) & PORT_CMD_FR == 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }

    fn start_engine(&self) -> Result<(), AhciError> {
        for _ in 0..RESET_ITER_CEILING {
            if self.reg(PORT_CMD) & PORT_CMD_CR == 0 {
                let mut cmd = self.reg(PORT_CMD);
                cmd |= PORT_CMD_FRE;
                self.set_reg(PORT_CMD, cmd);
                cmd |= PORT_CMD_ST;
                self.set_reg(PORT_CMD, cmd);
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AhciError::CommandTimeout)
    }

    /// Steps 1-9 of the initialization algorithm. A missing device is not an
    /// error: the port transitions to `NoDevice` and this returns `Ok(())`.
    pub fn initialize(&mut self) -> Result<(), AhciError> {
        self.stop_engine();

        let cmd_list = DmaRegion::alloc(fis::CMD_HEADER_SIZE * 32, self.phys_offset, self.supports_64bit_dma)?;
        let received_fis = DmaRegion::alloc(256, self.phys_offset, self.supports_64bit_dma)?;
        let cmd_table = DmaRegion::alloc(256, self.phys_offset, self.supports_64bit_dma)?;
        let data_buf = DmaRegion::alloc(
            MAX_SECTORS_PER_COMMAND as usize * SECTOR_SIZE,
            self.phys_offset,
            self.supports_64bit_dma,
        )?;

        self.set_reg(PORT_CLB, cmd_list.phys as u32);
        self.set_reg(PORT_CLBU, (cmd_list.phys >> 32) as u32);
        self.set_reg(PORT_FB, received_fis.phys as u32);
        self.set_reg(PORT_FBU, (received_fis.phys >> 32) as u32);

        self.set_reg(PORT_IS, 0xFFFF_FFFF);
        self.set_reg(PORT_SERR, 0xFFFF_FFFF);

        self.cmd_list = Some(cmd_list);
        self.received_fis = Some(received_fis);
        self.cmd_table = Some(cmd_table);
        self.data_buf = Some(data_buf);

        self.start_engine()?;

        let ssts = self.reg(PORT_SSTS);
        let present = (ssts & SSTS_DET_MASK) == SSTS_DET_PRESENT
            && (ssts & SSTS_IPM_MASK) == SSTS_IPM_ACTIVE;
        if !present {
            self.state = PortState::NoDevice;
            return Ok(());
        }
        self.state = PortState::DevicePresent;

        let sig = self.reg(PORT_SIG);
        self.kind = match sig {
            SIG_ATA => DeviceKind::Ata,
            SIG_ATAPI => DeviceKind::Atapi,
            _ => DeviceKind::Unknown,
        };

        if self.kind == DeviceKind::Ata {
            self.run_identify()?;
            self.state = PortState::Ready;
        }

        Ok(())
    }

    fn write_cmd_header(&mut self, dw0: u32) {
        let cmd_table_phys = self.cmd_table.as_ref().unwrap().phys;
        let list = self.cmd_list.as_mut().unwrap().as_mut_slice(fis::CMD_HEADER_SIZE);
        list[0..4].copy_from_slice(&dw0.to_le_bytes());
        list[4..8].copy_from_slice(&0u32.to_le_bytes()); // PRDBC, device clears on completion
        list[8..12].copy_from_slice(&(cmd_table_phys as u32).to_le_bytes());
        list[12..16].copy_from_slice(&((cmd_table_phys >> 32) as u32).to_le_bytes());
    }

    fn write_cfis(&mut self, h2d: &[u8; fis::H2D_FIS_SIZE]) {
        let table = self.cmd_table.as_mut().unwrap().as_mut_slice(256);
        table[0..fis::H2D_FIS_SIZE].copy_from_slice(h2d);
    }

    fn write_prdt(&mut self, data_phys: u64, byte_count: u32) {
        let table = self.cmd_table.as_mut().unwrap().as_mut_slice(256);
        let prdt_off = 128; // command table layout: 64 CFIS + 16 ACMD + 48 reserved
        table[prdt_off..prdt_off + 4].copy_from_slice(&(data_phys as u32).to_le_bytes());
        table[prdt_off + 4..prdt_off + 8].copy_from_slice(&((data_phys >> 32) as u32).to_le_bytes());
        table[prdt_off + 8..prdt_off + 12].copy_from_slice(&0u32.to_le_bytes());
        let dbc = fis::build_prdt_dbc(byte_count, true);
        table[prdt_off + 12..prdt_off + 16].copy_from_slice(&dbc.to_le_bytes());
    }

    /// Clear PxIS, issue slot 0, and poll for completion or error.
    fn issue_and_wait(&mut self) -> Result<(), AhciError> {
        self.set_reg(PORT_IS, 0xFFFF_FFFF);
        fence(Ordering::SeqCst);
        self.set_reg(PORT_CI, 1);

        for _ in 0..COMMAND_ITER_CEILING {
            let is = self.reg(PORT_IS);
            if is & fis::PORT_IS_ERROR_MASK != 0 {
                let tfd = self.reg(PORT_TFD);
                log::error!(
                    "ahci: port {} command error, PxIS={:#010x} PxTFD={:#010x}",
                    self.port_num,
                    is,
                    tfd
                );
                if is & (fis::PORT_IS_HBFS | fis::PORT_IS_IFS) != 0 {
                    self.state = PortState::Error;
                    return Err(AhciError::FatalHostError);
                }
                return Err(AhciError::CommandError);
            }
            if self.reg(PORT_CI) & 1 == 0 {
                let tfd = self.reg(PORT_TFD);
                if tfd & PORT_TFD_ERR != 0 {
                    log::error!("ahci: port {} task file error, PxTFD={:#010x}", self.port_num, tfd);
                    return Err(AhciError::CommandError);
                }
                return Ok(());
            }
            core::hint::spin_loop();
        }

        log::error!("ahci: port {} command timed out", self.port_num);
        Err(AhciError::CommandTimeout)
    }

    fn run_identify(&mut self) -> Result<(), AhciError> {
        let h2d = fis::build_h2d_fis(fis::ATA_CMD_IDENTIFY, 0, 0);
        self.write_cfis(&h2d);
        let data_phys = self.data_buf.as_ref().unwrap().phys;
        self.write_prdt(data_phys, SECTOR_SIZE as u32);
        let dw0 = fis::build_cmd_header_dw0(false, 1);
        self.write_cmd_header(dw0);

        self.issue_and_wait()?;

        let mut buf = [0u8; 512];
        buf.copy_from_slice(self.data_buf.as_ref().unwrap().as_slice(512));
        let parsed = fis::parse_identify(&buf);

        self.identity = Some(DeviceIdentity {
            sector_count: parsed.sectors,
            sector_size: SECTOR_SIZE,
            lba48_supported: parsed.lba48_supported,
            model: trim_ata_string(&parsed.model),
            serial: trim_ata_string(&parsed.serial),
            firmware: trim_ata_string(&parsed.firmware),
        });
        Ok(())
    }

    fn require_ready(&self) -> Result<(), AhciError> {
        if self.state != PortState::Ready {
            return Err(AhciError::NotReady);
        }
        Ok(())
    }

    fn lba48(&self) -> bool {
        self.identity.as_ref().map(|id| id.lba48_supported).unwrap_or(false)
    }

    /// Read `count` sectors (1..=256) starting at `lba` into `dst`.
    pub fn read_sectors(&mut self, lba: u64, count: u32, dst: &mut [u8]) -> Result<(), AhciError> {
        self.require_ready()?;
        if count == 0 || count > MAX_SECTORS_PER_COMMAND || dst.len() < count as usize * SECTOR_SIZE {
            return Err(AhciError::OutOfRange);
        }

        let command = if self.lba48() { fis::ATA_CMD_READ_DMA_EXT } else { ATA_CMD_READ_DMA };
        let mut h2d = fis::build_h2d_fis(command, lba, count as u16);
        h2d[7] = DEVICE_LBA_MODE;
        self.write_cfis(&h2d);

        let total_bytes = count as usize * SECTOR_SIZE;
        let data_phys = self.data_buf.as_ref().unwrap().phys;
        self.write_prdt(data_phys, total_bytes as u32);
        let dw0 = fis::build_cmd_header_dw0(false, 1);
        self.write_cmd_header(dw0);

        self.issue_and_wait()?;

        dst[..total_bytes].copy_from_slice(self.data_buf.as_ref().unwrap().as_slice(total_bytes));
        Ok(())
    }

    /// Write `count` sectors (1..=256) starting at `lba` from `src`.
    pub fn write_sectors(&mut self, lba: u64, count: u32, src: &[u8]) -> Result<(), AhciError> {
        self.require_ready()?;
        if count == 0 || count > MAX_SECTORS_PER_COMMAND || src.len() < count as usize * SECTOR_SIZE {
            return Err(AhciError::OutOfRange);
        }

        let total_bytes = count as usize * SECTOR_SIZE;
        self.data_buf.as_mut().unwrap().as_mut_slice(total_bytes).copy_from_slice(&src[..total_bytes]);

        let command = if self.lba48() { fis::ATA_CMD_WRITE_DMA_EXT } else { ATA_CMD_WRITE_DMA };
        let mut h2d = fis::build_h2d_fis(command, lba, count as u16);
        h2d[7] = DEVICE_LBA_MODE;
        self.write_cfis(&h2d);

        let data_phys = self.data_buf.as_ref().unwrap().phys;
        self.write_prdt(data_phys, total_bytes as u32);
        let dw0 = fis::build_cmd_header_dw0(true, 1);
        self.write_cmd_header(dw0);

        self.issue_and_wait()
    }

    pub fn flush(&mut self) -> Result<(), AhciError> {
        self.require_ready()?;
        let command = if self.lba48() { fis::ATA_CMD_FLUSH_CACHE_EXT } else { ATA_CMD_FLUSH_CACHE };
        let mut h2d = fis::build_h2d_fis(command, 0, 0);
        h2d[7] = DEVICE_LBA_MODE;
        self.write_cfis(&h2d);
        let dw0 = fis::build_cmd_header_dw0(false, 0);
        self.write_cmd_header(dw0);
        self.issue_and_wait()
    }

    /// Stop the engine and release DMA buffers in reverse allocation order.
    pub fn dispose(&mut self) {
        self.stop_engine();
        for region in [
            self.data_buf.take(),
            self.cmd_table.take(),
            self.received_fis.take(),
            self.cmd_list.take(),
        ] {
            if let Some(region) = region {
                region.free();
            }
        }
        self.identity = None;
        self.state = PortState::Uninitialized;
    }

    pub fn is_ata(&self) -> bool {
        self.kind == DeviceKind::Ata
    }
}

/// The AHCI host bus adapter: BAR5-mapped registers plus up to 32 ports.
pub struct AhciHba {
    ports: Vec<AhciPort>,
}

impl AhciHba {
    /// Map BAR5, enable AHCI mode, and bring up every port implemented by
    /// the controller.
    pub fn init(dev: &pci::Device, phys_offset: u64) -> Result<Self, AhciError> {
        let bar5 = &dev.bars[5];
        if !bar5.is_valid() || bar5.is_io {
            return Err(AhciError::DmaAllocFailed);
        }

        dev.enable_bus_master();
        dev.enable_memory_space();

        let map_size = (PORT_BASE_OFFSET + 32 * PORT_REG_SIZE) as usize;
        let abar_virt = crate::memory::map_mmio(bar5.address, map_size)
            .map_err(|_| AhciError::DmaAllocFailed)? as u64;

        let cap = mmio_read(abar_virt, HBA_CAP);
        if cap & CAP_SAM == 0 {
            let ghc = mmio_read(abar_virt, HBA_GHC);
            mmio_write(abar_virt, HBA_GHC, ghc | GHC_AE);
            if mmio_read(abar_virt, HBA_GHC) & GHC_AE == 0 {
                return Err(AhciError::FatalHostError);
            }
        }

        let port_count = (cap & 0x1F) + 1;
        let cmd_slots = ((cap >> 8) & 0x1F) + 1;
        let supports_64bit_dma = cap & CAP_S64A != 0;
        let pi = mmio_read(abar_virt, HBA_PI);
        let vs = mmio_read(abar_virt, HBA_VS);
        let cap2 = mmio_read(abar_virt, HBA_CAP2);
        log::info!(
            "ahci: version {}.{}, {} ports advertised, {} cmd slots, PI={:#010x}, CAP2={:#010x}, S64A={}",
            vs >> 16,
            vs & 0xFFFF,
            port_count,
            cmd_slots,
            pi,
            cap2,
            supports_64bit_dma,
        );

        let mut ports = Vec::new();
        for port_num in 0..32usize {
            if pi & (1 << port_num) == 0 {
                continue;
            }
            let mut port = AhciPort::new(abar_virt, port_num, phys_offset, supports_64bit_dma);
            match port.initialize() {
                Ok(()) => {
                    log::info!("ahci: port {} -> {:?}", port_num, port.state());
                    if let Some(identity) = port.identity() {
                        log::info!(
                            "ahci: port {} model=\"{}\" sectors={} lba48={}",
                            port_num,
                            identity.model,
                            identity.sector_count,
                            identity.lba48_supported
                        );
                    }
                    ports.push(port);
                }
                Err(e) => {
                    log::warn!("ahci: port {} initialization failed: {}", port_num, e);
                }
            }
        }

        Ok(AhciHba { ports })
    }

    pub fn ports_mut(&mut self) -> &mut [AhciPort] {
        &mut self.ports
    }

    pub fn port_by_num(&mut self, port_num: usize) -> Option<&mut AhciPort> {
        self.ports.iter_mut().find(|p| p.port_num() == port_num)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn trims_trailing_spaces_and_nuls() {
        let mut raw = [b' '; 40];
        raw[0] = b'Q';
        raw[1] = b'E';
        raw[2] = b'M';
        raw[3] = b'U';
        assert_eq!(trim_ata_string(&raw), "QEMU");
    }

    #[test]
    fn max_sectors_per_command_matches_hard_contract() {
        assert_eq!(MAX_SECTORS_PER_COMMAND, 256);
        assert_eq!(MAX_SECTORS_PER_COMMAND as usize * SECTOR_SIZE, 128 * 1024);
    }

    #[test]
    fn cap_s64a_is_bit_31() {
        assert_eq!(CAP_S64A, 1 << 31);
        assert_eq!(LOW_4GIB, 0x1_0000_0000);
    }
}

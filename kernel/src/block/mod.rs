//! BlockDevice: naming, capability, and lifecycle façade over an `AhciPort`.
//!
//! There is exactly one kind of block device this core produces (an
//! AHCI-backed SATA disk), so this is a concrete struct rather than a
//! trait object — a vtable buys nothing with a single implementer.

use alloc::format;
use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::drivers::ahci::{AhciError, AhciHba, DeviceIdentity, MAX_SECTORS_PER_COMMAND};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    IoError,
    OutOfBounds,
    DeviceNotReady,
    Timeout,
    InvalidParameter,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoError => write!(f, "I/O error"),
            BlockError::OutOfBounds => write!(f, "block range out of bounds"),
            BlockError::DeviceNotReady => write!(f, "device not ready"),
            BlockError::Timeout => write!(f, "operation timed out"),
            BlockError::InvalidParameter => write!(f, "invalid parameter"),
        }
    }
}

impl From<AhciError> for BlockError {
    fn from(e: AhciError) -> Self {
        match e {
            AhciError::CommandTimeout => BlockError::Timeout,
            AhciError::NotReady => BlockError::DeviceNotReady,
            AhciError::OutOfRange => BlockError::OutOfBounds,
            AhciError::CommandError | AhciError::FatalHostError | AhciError::DmaAllocFailed => {
                BlockError::IoError
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub flush: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Loaded,
    Initializing,
    Running,
    Suspended,
    Stopping,
    Stopped,
    Failed,
}

static NEXT_SATA_ID: AtomicUsize = AtomicUsize::new(0);

/// One SATA disk, addressed through its owning `AhciHba` by port number.
pub struct BlockDevice {
    name: String,
    port_num: usize,
    block_size: usize,
    block_count: u64,
    capabilities: Capabilities,
    state: DeviceState,
}

impl BlockDevice {
    /// Wrap a ready AHCI port. The device starts `Loaded`; callers bring it
    /// to `Running` with `start()` once it's safe to issue I/O.
    pub fn new(port_num: usize, identity: &DeviceIdentity) -> Self {
        let id = NEXT_SATA_ID.fetch_add(1, Ordering::Relaxed);
        BlockDevice {
            name: format!("sata{id}"),
            port_num,
            block_size: identity.sector_size,
            block_count: identity.sector_count,
            capabilities: Capabilities { read: true, write: true, flush: true },
            state: DeviceState::Loaded,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Loaded -> Running. Idempotent once Running.
    pub fn start(&mut self) {
        if self.state == DeviceState::Loaded || self.state == DeviceState::Stopped {
            self.state = DeviceState::Initializing;
            self.state = DeviceState::Running;
        }
    }

    pub fn stop(&mut self, hba: &mut AhciHba) {
        self.state = DeviceState::Stopping;
        if let Some(port) = hba.port_by_num(self.port_num) {
            port.dispose();
        }
        self.state = DeviceState::Stopped;
    }

    fn validate(&self, start: u64, count: u64) -> Result<(), BlockError> {
        if self.state != DeviceState::Running {
            return Err(BlockError::DeviceNotReady);
        }
        if count == 0 {
            return Err(BlockError::InvalidParameter);
        }
        match start.checked_add(count) {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(BlockError::InvalidParameter),
        }
    }

    /// Read `count` blocks starting at `start` into `buf`, chunking into
    /// `<= MAX_SECTORS_PER_COMMAND`-sized AHCI commands. On a chunk failure
    /// the blocks already read are left in `buf`; the error is propagated.
    pub fn read(&mut self, hba: &mut AhciHba, start: u64, count: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.validate(start, count)?;
        if !self.capabilities.read {
            return Err(BlockError::IoError);
        }
        if buf.len() < count as usize * self.block_size {
            return Err(BlockError::InvalidParameter);
        }
        let port = hba.port_by_num(self.port_num).ok_or(BlockError::DeviceNotReady)?;

        let mut lba = start;
        let mut remaining = count;
        let mut offset = 0usize;
        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS_PER_COMMAND as u64) as u32;
            let bytes = chunk as usize * self.block_size;
            port.read_sectors(lba, chunk, &mut buf[offset..offset + bytes])?;
            lba += chunk as u64;
            remaining -= chunk as u64;
            offset += bytes;
        }
        Ok(())
    }

    /// Write `count` blocks starting at `start` from `buf`, chunked the same
    /// way as `read`.
    pub fn write(&mut self, hba: &mut AhciHba, start: u64, count: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.validate(start, count)?;
        if !self.capabilities.write {
            return Err(BlockError::IoError);
        }
        if buf.len() < count as usize * self.block_size {
            return Err(BlockError::InvalidParameter);
        }
        let port = hba.port_by_num(self.port_num).ok_or(BlockError::DeviceNotReady)?;

        let mut lba = start;
        let mut remaining = count;
        let mut offset = 0usize;
        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS_PER_COMMAND as u64) as u32;
            let bytes = chunk as usize * self.block_size;
            port.write_sectors(lba, chunk, &buf[offset..offset + bytes])?;
            lba += chunk as u64;
            remaining -= chunk as u64;
            offset += bytes;
        }
        Ok(())
    }

    pub fn flush(&mut self, hba: &mut AhciHba) -> Result<(), BlockError> {
        if self.state != DeviceState::Running {
            return Err(BlockError::DeviceNotReady);
        }
        let port = hba.port_by_num(self.port_num).ok_or(BlockError::DeviceNotReady)?;
        Ok(port.flush()?)
    }

    /// No write-back cache exists below this façade, so discard is always
    /// a successful no-op.
    pub fn discard(&mut self, _start: u64, _count: u64) -> Result<(), BlockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    fn sample_identity(sector_count: u64) -> DeviceIdentity {
        DeviceIdentity {
            sector_count,
            sector_size: 512,
            lba48_supported: true,
            model: String::from("TEST"),
            serial: String::from("0"),
            firmware: String::from("0"),
        }
    }

    #[test]
    fn validate_rejects_zero_count() {
        let mut dev = BlockDevice::new(0, &sample_identity(1000));
        dev.start();
        assert_eq!(dev.validate(999, 0), Err(BlockError::InvalidParameter));
    }

    #[test]
    fn validate_accepts_last_block() {
        let mut dev = BlockDevice::new(0, &sample_identity(1000));
        dev.start();
        assert!(dev.validate(999, 1).is_ok());
    }

    #[test]
    fn validate_rejects_overrun_by_one() {
        let mut dev = BlockDevice::new(0, &sample_identity(1000));
        dev.start();
        assert_eq!(dev.validate(999, 2), Err(BlockError::InvalidParameter));
    }

    #[test]
    fn chunk_plan_for_400_blocks_is_256_then_144() {
        let total = 400u64;
        let mut remaining = total;
        let mut chunks = std::vec::Vec::new();
        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS_PER_COMMAND as u64);
            chunks.push(chunk);
            remaining -= chunk;
        }
        assert_eq!(chunks, std::vec![256, 144]);
    }

    #[test]
    fn discard_is_always_ok() {
        let mut dev = BlockDevice::new(0, &sample_identity(1000));
        assert!(dev.discard(0, 5).is_ok());
    }

    #[test]
    fn not_running_device_rejects_validate() {
        let dev = BlockDevice::new(0, &sample_identity(1000));
        assert_eq!(dev.validate(0, 1), Err(BlockError::DeviceNotReady));
    }
}

//! PciBus: configuration-space access and device enumeration.
//!
//! PCI uses two I/O ports for configuration space access:
//! - CONFIG_ADDRESS (0xCF8): write the address of the config register to read/write
//! - CONFIG_DATA (0xCFC): read/write the configuration data
//!
//! Address format:
//! ```text
//! Bit 31    : Enable bit (must be 1)
//! Bits 23-16: Bus number (0-255)
//! Bits 15-11: Device number (0-31)
//! Bits 10-8 : Function number (0-7)
//! Bits 7-2  : Register offset (32-bit aligned)
//! Bits 1-0  : Must be 0
//! ```

use alloc::vec::Vec;
use core::{fmt, sync::atomic::AtomicBool};
use spin::Mutex;
use x86_64::instructions::port::Port;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const MAX_BUS: u8 = 255;
const MAX_DEVICE: u8 = 32;
const MAX_FUNCTION: u8 = 8;

/// Mass storage, SATA, AHCI 1.0 programming interface — the device class
/// this core is actually looking for on the bus.
pub const CLASS_MASS_STORAGE: u8 = 0x01;
pub const SUBCLASS_SATA: u8 = 0x06;
pub const PROG_IF_AHCI: u8 = 0x01;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceClass {
    Legacy = 0x00,
    MassStorage = 0x01,
    Network = 0x02,
    Display = 0x03,
    Multimedia = 0x04,
    Memory = 0x05,
    Bridge = 0x06,
    SimpleCommunication = 0x07,
    BaseSystemPeripheral = 0x08,
    InputDevice = 0x09,
    DockingStation = 0x0A,
    Processor = 0x0B,
    SerialBus = 0x0C,
    Wireless = 0x0D,
    IntelligentIO = 0x0E,
    SatelliteCommunication = 0x0F,
    Encryption = 0x10,
    SignalProcessing = 0x11,
    Unknown = 0xFF,
}

impl DeviceClass {
    fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DeviceClass::Legacy,
            0x01 => DeviceClass::MassStorage,
            0x02 => DeviceClass::Network,
            0x03 => DeviceClass::Display,
            0x04 => DeviceClass::Multimedia,
            0x05 => DeviceClass::Memory,
            0x06 => DeviceClass::Bridge,
            0x07 => DeviceClass::SimpleCommunication,
            0x08 => DeviceClass::BaseSystemPeripheral,
            0x09 => DeviceClass::InputDevice,
            0x0A => DeviceClass::DockingStation,
            0x0B => DeviceClass::Processor,
            0x0C => DeviceClass::SerialBus,
            0x0D => DeviceClass::Wireless,
            0x0E => DeviceClass::IntelligentIO,
            0x0F => DeviceClass::SatelliteCommunication,
            0x10 => DeviceClass::Encryption,
            0x11 => DeviceClass::SignalProcessing,
            _ => DeviceClass::Unknown,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Bar {
    pub address: u64,
    pub size: u64,
    pub is_io: bool,
    pub is_64bit: bool,
    pub prefetchable: bool,
}

impl Bar {
    const fn empty() -> Self {
        Bar {
            address: 0,
            size: 0,
            is_io: false,
            is_64bit: false,
            prefetchable: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// Pure BAR-sizing arithmetic, split out from the port-I/O probe so it is
/// host-testable: the write-all-ones/read-back dance is a hardware concern,
/// but turning the readback into an address/size pair is not.
fn io_bar_from_readback(bar_low: u32, size_mask: u32) -> Bar {
    let address = (bar_low & 0xFFFF_FFFC) as u64;
    let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
        0
    } else {
        (!(size_mask & 0xFFFF_FFFC)).wrapping_add(1) as u64
    };
    Bar {
        address,
        size,
        is_io: true,
        is_64bit: false,
        prefetchable: false,
    }
}

fn mem32_bar_from_readback(bar_low: u32, size_mask: u32, prefetchable: bool) -> Bar {
    let address = (bar_low & 0xFFFF_FFF0) as u64;
    let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
        0
    } else {
        (!(size_mask & 0xFFFF_FFF0)).wrapping_add(1) as u64
    };
    Bar {
        address,
        size,
        is_io: false,
        is_64bit: false,
        prefetchable,
    }
}

fn mem64_bar_from_readback(
    bar_low: u32,
    bar_high: u32,
    size_low: u32,
    size_high: u32,
    prefetchable: bool,
) -> Bar {
    let address = ((bar_high as u64) << 32) | ((bar_low & 0xFFFF_FFF0) as u64);
    let size_mask = ((size_high as u64) << 32) | ((size_low & 0xFFFF_FFF0) as u64);
    let size = if size_mask == 0 {
        0
    } else {
        (!size_mask).wrapping_add(1)
    };
    Bar {
        address,
        size,
        is_io: false,
        is_64bit: true,
        prefetchable,
    }
}

#[derive(Clone)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub class: DeviceClass,
    pub subclass: u8,
    pub prog_if: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub multifunction: bool,
    pub bars: [Bar; 6],
}

impl Device {
    /// Is this the AHCI HBA this core looks for on the bus?
    pub fn is_ahci_hba(&self) -> bool {
        self.class == DeviceClass::MassStorage
            && self.subclass == SUBCLASS_SATA
            && self.prog_if == PROG_IF_AHCI
    }

    pub fn get_mmio_bar(&self) -> Option<&Bar> {
        self.bars.iter().find(|bar| bar.is_valid() && !bar.is_io)
    }

    pub fn enable_bus_master(&self) {
        let command = pci_read_config_word(self.bus, self.device, self.function, 0x04);
        pci_write_config_word(self.bus, self.device, self.function, 0x04, command | 0x04);
    }

    pub fn enable_memory_space(&self) {
        let command = pci_read_config_word(self.bus, self.device, self.function, 0x04);
        pci_write_config_word(self.bus, self.device, self.function, 0x04, command | 0x02);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{} {:04x}:{:04x} {:?}/{:02x}",
            self.bus, self.device, self.function, self.vendor_id, self.device_id, self.class, self.subclass
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field("location", &format_args!("{:02x}:{:02x}.{}", self.bus, self.device, self.function))
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("device_id", &format_args!("{:#06x}", self.device_id))
            .field("class", &self.class)
            .field("subclass", &format_args!("{:#04x}", self.subclass))
            .field("irq", &self.interrupt_line)
            .finish()
    }
}

fn pci_read_config_dword(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    let address: u32 = 0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset & 0xFC) as u32);

    unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);
        addr_port.write(address);
        data_port.read()
    }
}

fn pci_write_config_dword(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    let address: u32 = 0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset & 0xFC) as u32);

    unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);
        addr_port.write(address);
        data_port.write(value);
    }
}

fn pci_read_config_word(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    let dword = pci_read_config_dword(bus, device, function, offset & 0xFC);
    let shift = ((offset & 2) * 8) as u32;
    ((dword >> shift) & 0xFFFF) as u16
}

fn pci_write_config_word(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    let dword_offset = offset & 0xFC;
    let mut dword = pci_read_config_dword(bus, device, function, dword_offset);
    let shift = ((offset & 2) * 8) as u32;
    let mask = !(0xFFFF << shift);
    dword = (dword & mask) | ((value as u32) << shift);
    pci_write_config_dword(bus, device, function, dword_offset, dword);
}

fn decode_bar(bus: u8, device: u8, function: u8, bar_index: u8) -> (Bar, bool) {
    let offset = 0x10 + (bar_index * 4);
    let bar_low = pci_read_config_dword(bus, device, function, offset);

    if bar_low & 0x01 != 0 {
        pci_write_config_dword(bus, device, function, offset, 0xFFFF_FFFF);
        let size_mask = pci_read_config_dword(bus, device, function, offset);
        pci_write_config_dword(bus, device, function, offset, bar_low);
        (io_bar_from_readback(bar_low, size_mask), false)
    } else {
        let bar_type = (bar_low >> 1) & 0x03;
        let prefetchable = (bar_low & 0x08) != 0;

        if bar_type == 0x02 {
            let bar_high = pci_read_config_dword(bus, device, function, offset + 4);
            pci_write_config_dword(bus, device, function, offset, 0xFFFF_FFFF);
            pci_write_config_dword(bus, device, function, offset + 4, 0xFFFF_FFFF);
            let size_low = pci_read_config_dword(bus, device, function, offset);
            let size_high = pci_read_config_dword(bus, device, function, offset + 4);
            pci_write_config_dword(bus, device, function, offset, bar_low);
            pci_write_config_dword(bus, device, function, offset + 4, bar_high);
            (
                mem64_bar_from_readback(bar_low, bar_high, size_low, size_high, prefetchable),
                true,
            )
        } else {
            pci_write_config_dword(bus, device, function, offset, 0xFFFF_FFFF);
            let size_mask = pci_read_config_dword(bus, device, function, offset);
            pci_write_config_dword(bus, device, function, offset, bar_low);
            (mem32_bar_from_readback(bar_low, size_mask, prefetchable), false)
        }
    }
}

fn probe_device(bus: u8, device: u8, function: u8) -> Option<Device> {
    let vendor_device = pci_read_config_dword(bus, device, function, 0x00);
    if vendor_device == 0xFFFF_FFFF {
        return None;
    }

    let vendor_id = vendor_device as u16;
    if vendor_id == 0xFFFF {
        return None;
    }
    let device_id = (vendor_device >> 16) as u16;

    let class_reg = pci_read_config_dword(bus, device, function, 0x08);
    let revision_id = class_reg as u8;
    let prog_if = (class_reg >> 8) as u8;
    let subclass = (class_reg >> 16) as u8;
    let class_code = (class_reg >> 24) as u8;

    let header_reg = pci_read_config_dword(bus, device, function, 0x0C);
    let header_type = (header_reg >> 16) as u8;
    let multifunction = (header_type & 0x80) != 0;

    let int_reg = pci_read_config_dword(bus, device, function, 0x3C);
    let interrupt_line = int_reg as u8;
    let interrupt_pin = (int_reg >> 8) as u8;

    let mut bars = [Bar::empty(); 6];
    let mut bar_index = 0;
    while bar_index < 6 {
        let (bar, skip_next) = decode_bar(bus, device, function, bar_index);
        bars[bar_index as usize] = bar;
        bar_index += 1;
        if skip_next && bar_index < 6 {
            bar_index += 1;
        }
    }

    Some(Device {
        bus,
        device,
        function,
        vendor_id,
        device_id,
        revision_id,
        class: DeviceClass::from_u8(class_code),
        subclass,
        prog_if,
        interrupt_line,
        interrupt_pin,
        multifunction,
        bars,
    })
}

static PCI_DEVICES: Mutex<Option<Vec<Device>>> = Mutex::new(None);
static PCI_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn vendor_name(vendor_id: u16) -> &'static str {
    match vendor_id {
        0x8086 => "Intel",
        0x1B36 => "QEMU/RedHat",
        0x1022 => "AMD",
        0x10DE => "NVIDIA",
        0x14E4 => "Broadcom",
        0x10EC => "Realtek",
        _ => "Unknown",
    }
}

/// Enumerate every bus/device/function (including other functions of a
/// multifunction device), returning the total device count.
pub fn enumerate() -> usize {
    log::info!("PCI: starting bus enumeration");

    let mut devices = Vec::new();
    let mut ahci_count = 0;

    for bus in 0..=MAX_BUS {
        for device in 0..MAX_DEVICE {
            if let Some(dev) = probe_device(bus, device, 0) {
                let is_multifunction = dev.multifunction;
                log_device(&dev);
                if dev.is_ahci_hba() {
                    ahci_count += 1;
                }
                devices.push(dev);

                if is_multifunction {
                    for function in 1..MAX_FUNCTION {
                        if let Some(func_dev) = probe_device(bus, device, function) {
                            log_device(&func_dev);
                            if func_dev.is_ahci_hba() {
                                ahci_count += 1;
                            }
                            devices.push(func_dev);
                        }
                    }
                }
            }
        }
    }

    let device_count = devices.len();
    log::info!(
        "PCI: enumeration complete, {device_count} devices ({ahci_count} AHCI controllers)"
    );

    *PCI_DEVICES.lock() = Some(devices);
    PCI_INITIALIZED.store(true, core::sync::atomic::Ordering::Release);

    device_count
}

fn log_device(dev: &Device) {
    log::info!(
        "PCI: {:02x}:{:02x}.{} [{:04x}:{:04x}] {} {:?}/0x{:02x} IRQ={}",
        dev.bus,
        dev.device,
        dev.function,
        dev.vendor_id,
        dev.device_id,
        vendor_name(dev.vendor_id),
        dev.class,
        dev.subclass,
        dev.interrupt_line
    );
    for (i, bar) in dev.bars.iter().enumerate() {
        if bar.is_valid() {
            log::debug!(
                "PCI:   BAR{i}: addr={:#x} size={:#x} {}",
                bar.address,
                bar.size,
                if bar.is_io { "I/O" } else { "MMIO" }
            );
        }
    }
}

/// Find the first AHCI HBA on the bus. Per spec there is at most one in
/// scope for this core.
pub fn find_ahci_hba() -> Option<Device> {
    let devices = PCI_DEVICES.lock();
    devices.as_ref()?.iter().find(|d| d.is_ahci_hba()).cloned()
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn mem32_bar_size_matches_spec_scenario() {
        // S3: a 1 MiB memory BAR set to all-ones reads back as 0xFFF00000.
        let bar = mem32_bar_from_readback(0x1000_0000, 0xFFF0_0000, false);
        assert_eq!(bar.size, 0x0010_0000);
        assert_eq!(bar.address, 0x1000_0000);
        assert!(!bar.is_64bit);
    }

    #[test]
    fn io_bar_size_rounds_to_four_byte_boundary() {
        let bar = io_bar_from_readback(0x0000_C001, 0xFFFF_FFF1);
        assert_eq!(bar.size, 16);
        assert!(bar.is_io);
    }

    #[test]
    fn mem64_bar_combines_high_and_low_halves() {
        let bar = mem64_bar_from_readback(0x0000_0004, 0x0000_0001, 0xF000_0004, 0xFFFF_FFFF, true);
        // size_mask = 0xFFFF_FFFF_F000_0000 -> size = 0x1000_0000
        assert_eq!(bar.size, 0x1000_0000);
        assert_eq!(bar.address, 0x0000_0001_0000_0000);
        assert!(bar.is_64bit);
        assert!(bar.prefetchable);
    }

    #[test]
    fn unimplemented_bar_reads_as_invalid() {
        let bar = mem32_bar_from_readback(0, 0, false);
        assert!(!bar.is_valid());
    }

    #[test]
    fn ahci_class_match_requires_all_three_fields() {
        let dev = sample_device(DeviceClass::MassStorage, SUBCLASS_SATA, PROG_IF_AHCI);
        assert!(dev.is_ahci_hba());

        let wrong_progif = sample_device(DeviceClass::MassStorage, SUBCLASS_SATA, 0x00);
        assert!(!wrong_progif.is_ahci_hba());
    }

    fn sample_device(class: DeviceClass, subclass: u8, prog_if: u8) -> Device {
        Device {
            bus: 0,
            device: 0,
            function: 0,
            vendor_id: 0x8086,
            device_id: 0x2922,
            revision_id: 0,
            class,
            subclass,
            prog_if,
            interrupt_line: 0,
            interrupt_pin: 0,
            multifunction: false,
            bars: [Bar::empty(); 6],
        }
    }
}

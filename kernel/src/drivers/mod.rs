//! Device drivers: PCI enumeration and the AHCI storage stack.

pub mod ahci;
pub mod pci;

use alloc::vec::Vec;

use crate::block::BlockDevice;

/// Enumerate the PCI bus, bring up the AHCI HBA if one is present, and
/// return it along with a `BlockDevice` façade for every ready SATA port.
pub fn init(phys_offset: u64) -> (usize, Option<ahci::AhciHba>, Vec<BlockDevice>) {
    log::info!("initializing driver subsystem");

    let device_count = pci::enumerate();

    let mut hba = None;
    let mut devices = Vec::new();

    if let Some(dev) = pci::find_ahci_hba() {
        match ahci::AhciHba::init(&dev, phys_offset) {
            Ok(mut controller) => {
                for port in controller.ports_mut() {
                    if port.is_ata() && port.state() == ahci::PortState::Ready {
                        if let Some(identity) = port.identity() {
                            let mut block_device = BlockDevice::new(port.port_num(), identity);
                            block_device.start();
                            devices.push(block_device);
                        }
                    }
                }
                hba = Some(controller);
            }
            Err(e) => log::warn!("ahci: HBA initialization failed: {}", e),
        }
    } else {
        log::info!("no AHCI HBA found on the bus");
    }

    log::info!("driver subsystem initialized, {} block devices", devices.len());
    (device_count, hba, devices)
}

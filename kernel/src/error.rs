//! `ProtonError`: a single error type spanning the whole discovery/storage
//! path, for callers (mainly `main.rs`) that want one `Result` to log and
//! move on from rather than matching each subsystem's own enum.
//!
//! Each subsystem keeps its own focused error type — `AcpiError`,
//! `TopologyError`, `AhciError`, `BlockError` — and this just folds them
//! together via `From`, the same way `BlockError` folds in `AhciError`.

use core::fmt;

use crate::acpi::AcpiError;
use crate::block::BlockError;
use crate::boot::BootError;
use crate::drivers::ahci::AhciError;
use crate::topology::cpu::TopologyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtonError {
    Boot(BootError),
    Acpi(AcpiError),
    Topology(TopologyError),
    Ahci(AhciError),
    Block(BlockError),
}

impl fmt::Display for ProtonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtonError::Boot(e) => write!(f, "boot: {e}"),
            ProtonError::Acpi(e) => write!(f, "acpi: {e}"),
            ProtonError::Topology(e) => write!(f, "topology: {e}"),
            ProtonError::Ahci(e) => write!(f, "ahci: {e}"),
            ProtonError::Block(e) => write!(f, "block: {e}"),
        }
    }
}

impl From<BootError> for ProtonError {
    fn from(e: BootError) -> Self {
        ProtonError::Boot(e)
    }
}

impl From<AcpiError> for ProtonError {
    fn from(e: AcpiError) -> Self {
        ProtonError::Acpi(e)
    }
}

impl From<TopologyError> for ProtonError {
    fn from(e: TopologyError) -> Self {
        ProtonError::Topology(e)
    }
}

impl From<AhciError> for ProtonError {
    fn from(e: AhciError) -> Self {
        ProtonError::Ahci(e)
    }
}

impl From<BlockError> for ProtonError {
    fn from(e: BlockError) -> Self {
        ProtonError::Block(e)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn subsystem_errors_convert_and_display() {
        let e: ProtonError = AcpiError::NoAcpi.into();
        assert_eq!(std::format!("{e}"), "acpi: no valid ACPI RSDP");

        let e: ProtonError = BlockError::Timeout.into();
        assert_eq!(std::format!("{e}"), "block: operation timed out");
    }
}

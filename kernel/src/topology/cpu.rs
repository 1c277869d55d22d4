//! CpuTopology: walks the MADT to enumerate logical CPUs, I/O APICs, and
//! interrupt source overrides.

use crate::acpi::TABLE_HEADER_SIZE;

pub const MAX_CPUS: usize = 64;
pub const MAX_IOAPICS: usize = 8;
pub const MAX_OVERRIDES: usize = 24;

const MADT_ENTRY_LOCAL_APIC: u8 = 0;
const MADT_ENTRY_IOAPIC: u8 = 1;
const MADT_ENTRY_INTERRUPT_OVERRIDE: u8 = 2;
const MADT_ENTRY_LOCAL_X2APIC: u8 = 9;

const LAPIC_FLAG_ENABLED: u32 = 1 << 0;
const LAPIC_FLAG_ONLINE_CAPABLE: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    /// No MADT present in the ACPI table set.
    MadtMissing,
}

impl core::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TopologyError::MadtMissing => write!(f, "MADT not present"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuDescriptor {
    /// Dense 0-based index assigned in MADT walk order.
    pub kernel_index: usize,
    pub apic_id: u32,
    /// ACPI Processor ID / ACPI Processor UID from the MADT entry.
    pub acpi_proc_id: u32,
    /// Proximity domain from SRAT, filled in by `assign_numa_nodes` once
    /// `NumaTopology` has parsed its own tables. `None` until then, or if no
    /// SRAT affinity names this APIC ID.
    pub numa_node: Option<u8>,
    pub is_bsp: bool,
    /// Only the BSP is online at the point this core hands off to the rest
    /// of the kernel — the scheduling model releases no other processor.
    pub is_online: bool,
    pub enabled: bool,
    pub online_capable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IoApicDescriptor {
    pub id: u8,
    pub phys_addr: u32,
    pub gsi_base: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptOverride {
    pub bus_source: u8,
    pub irq_source: u8,
    pub gsi: u32,
    pub flags: u16,
}

pub struct CpuTopology {
    cpus: [Option<CpuDescriptor>; MAX_CPUS],
    cpu_count: usize,
    ioapics: [Option<IoApicDescriptor>; MAX_IOAPICS],
    ioapic_count: usize,
    overrides: [Option<InterruptOverride>; MAX_OVERRIDES],
    override_count: usize,
}

/// One decoded MADT sub-structure entry: `(entry_type, payload)`, where
/// `payload` excludes the 2-byte type/length prefix every MADT entry starts
/// with.
struct MadtEntry<'a> {
    entry_type: u8,
    payload: &'a [u8],
}

/// Walk the MADT's variable-length entry list (immediately following the
/// fixed 8-byte local-APIC-address/flags prefix after the table header).
fn madt_entries(body: &[u8]) -> impl Iterator<Item = MadtEntry<'_>> {
    let entries = if body.len() > 8 { &body[8..] } else { &[] };
    MadtEntryIter { buf: entries }
}

struct MadtEntryIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for MadtEntryIter<'a> {
    type Item = MadtEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 2 {
            return None;
        }
        let entry_type = self.buf[0];
        let length = self.buf[1] as usize;
        if length < 2 || length > self.buf.len() {
            return None;
        }
        let payload = &self.buf[2..length];
        let rest = &self.buf[length..];
        self.buf = rest;
        Some(MadtEntry { entry_type, payload })
    }
}

/// Decode a type-0 Processor Local APIC entry: `(processor_id, apic_id, flags)`.
fn decode_local_apic(payload: &[u8]) -> Option<(u8, u32, u32)> {
    if payload.len() < 6 {
        return None;
    }
    let processor_id = payload[0];
    let apic_id = payload[1] as u32;
    let flags = u32::from_le_bytes(payload[2..6].try_into().ok()?);
    Some((processor_id, apic_id, flags))
}

/// Decode a type-9 Processor Local x2APIC entry: `(x2apic_id, flags, acpi_processor_uid)`.
fn decode_local_x2apic(payload: &[u8]) -> Option<(u32, u32, u32)> {
    if payload.len() < 14 {
        return None;
    }
    let x2apic_id = u32::from_le_bytes(payload[2..6].try_into().ok()?);
    let flags = u32::from_le_bytes(payload[6..10].try_into().ok()?);
    let uid = u32::from_le_bytes(payload[10..14].try_into().ok()?);
    Some((x2apic_id, flags, uid))
}

fn decode_ioapic(payload: &[u8]) -> Option<(u8, u32, u32)> {
    if payload.len() < 10 {
        return None;
    }
    let id = payload[0];
    let phys_addr = u32::from_le_bytes(payload[2..6].try_into().ok()?);
    let gsi_base = u32::from_le_bytes(payload[6..10].try_into().ok()?);
    Some((id, phys_addr, gsi_base))
}

fn decode_override(payload: &[u8]) -> Option<(u8, u8, u32, u16)> {
    if payload.len() < 8 {
        return None;
    }
    let bus_source = payload[0];
    let irq_source = payload[1];
    let gsi = u32::from_le_bytes(payload[2..6].try_into().ok()?);
    let flags = u16::from_le_bytes(payload[6..8].try_into().ok()?);
    Some((bus_source, irq_source, gsi, flags))
}

impl CpuTopology {
    /// Parse a MADT whose table header + body lives at `table_bytes`
    /// (`table_bytes.len() >= TABLE_HEADER_SIZE`, already checksum-validated
    /// by the caller). `bsp_apic_id` comes from reading the local APIC ID
    /// register directly (MMIO offset 0x20, bits 24..31) — MADT entries
    /// carry no BSP marker of their own.
    pub fn parse(table_bytes: &[u8], bsp_apic_id: u32) -> Self {
        let mut topo = CpuTopology {
            cpus: [None; MAX_CPUS],
            cpu_count: 0,
            ioapics: [None; MAX_IOAPICS],
            ioapic_count: 0,
            overrides: [None; MAX_OVERRIDES],
            override_count: 0,
        };

        if table_bytes.len() <= TABLE_HEADER_SIZE {
            return topo;
        }
        let body = &table_bytes[TABLE_HEADER_SIZE..];

        for entry in madt_entries(body) {
            match entry.entry_type {
                MADT_ENTRY_LOCAL_APIC => {
                    if let Some((processor_id, apic_id, flags)) = decode_local_apic(entry.payload) {
                        topo.push_cpu(apic_id, processor_id as u32, flags, bsp_apic_id);
                    }
                }
                MADT_ENTRY_LOCAL_X2APIC => {
                    if let Some((apic_id, flags, uid)) = decode_local_x2apic(entry.payload) {
                        topo.push_cpu(apic_id, uid, flags, bsp_apic_id);
                    }
                }
                MADT_ENTRY_IOAPIC => {
                    if let Some((id, phys_addr, gsi_base)) = decode_ioapic(entry.payload) {
                        if topo.ioapic_count < MAX_IOAPICS {
                            topo.ioapics[topo.ioapic_count] = Some(IoApicDescriptor {
                                id,
                                phys_addr,
                                gsi_base,
                            });
                            topo.ioapic_count += 1;
                        }
                    }
                }
                MADT_ENTRY_INTERRUPT_OVERRIDE => {
                    if let Some((bus_source, irq_source, gsi, flags)) =
                        decode_override(entry.payload)
                    {
                        if topo.override_count < MAX_OVERRIDES {
                            topo.overrides[topo.override_count] = Some(InterruptOverride {
                                bus_source,
                                irq_source,
                                gsi,
                                flags,
                            });
                            topo.override_count += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        // Universal invariant: exactly one CPU marked BSP. If no entry's
        // apic_id matched the register read while enabled (e.g. a buggy MADT
        // marks the running CPU disabled, or uses a differently-reported
        // x2APIC ID), fall back to the first enabled CPU. If the MADT yields
        // no enabled CPU at all, the BSP entry was omitted outright; append
        // a synthetic descriptor for it (spec section 4.4).
        if !topo.cpus[..topo.cpu_count].iter().flatten().any(|c| c.is_bsp) {
            match topo.cpus[..topo.cpu_count]
                .iter_mut()
                .flatten()
                .find(|c| c.enabled)
            {
                Some(slot) => {
                    slot.is_bsp = true;
                    slot.is_online = true;
                }
                None => topo.push_cpu(bsp_apic_id, bsp_apic_id, LAPIC_FLAG_ENABLED, bsp_apic_id),
            }
        }

        topo
    }

    fn push_cpu(&mut self, apic_id: u32, acpi_proc_id: u32, flags: u32, bsp_apic_id: u32) {
        let enabled = flags & LAPIC_FLAG_ENABLED != 0;
        let online_capable = flags & LAPIC_FLAG_ONLINE_CAPABLE != 0;
        if !enabled && !online_capable {
            // spec 4.4: record a CpuDescriptor only if Enabled or OnlineCapable is set.
            return;
        }
        if self.cpu_count >= MAX_CPUS {
            log::warn!("CpuTopology: dropping CPU apic_id={apic_id}, capacity {MAX_CPUS} reached");
            return;
        }
        let is_bsp = enabled && apic_id == bsp_apic_id;
        self.cpus[self.cpu_count] = Some(CpuDescriptor {
            kernel_index: self.cpu_count,
            apic_id,
            acpi_proc_id,
            numa_node: None,
            is_bsp,
            is_online: is_bsp,
            enabled,
            online_capable,
        });
        self.cpu_count += 1;
    }

    pub fn cpus(&self) -> impl Iterator<Item = &CpuDescriptor> {
        self.cpus[..self.cpu_count].iter().flatten()
    }

    pub fn ioapics(&self) -> impl Iterator<Item = &IoApicDescriptor> {
        self.ioapics[..self.ioapic_count].iter().flatten()
    }

    pub fn overrides(&self) -> impl Iterator<Item = &InterruptOverride> {
        self.overrides[..self.override_count].iter().flatten()
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn bsp(&self) -> Option<&CpuDescriptor> {
        self.cpus().find(|c| c.is_bsp)
    }

    /// Cross-reference each descriptor's `apic_id` against the SRAT-derived
    /// affinity table, filling in `numa_node`. Called once both tables have
    /// been parsed (spec section 4.5); a miss leaves `numa_node` at `None`.
    pub fn assign_numa_nodes(&mut self, numa: &crate::topology::numa::NumaTopology) {
        for cpu in self.cpus[..self.cpu_count].iter_mut().flatten() {
            cpu.numa_node = numa.node_for_apic_id(cpu.apic_id);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec::Vec;

    fn push_entry(buf: &mut Vec<u8>, entry_type: u8, payload: &[u8]) {
        buf.push(entry_type);
        buf.push((payload.len() + 2) as u8);
        buf.extend_from_slice(payload);
    }

    fn build_madt(entries: &[u8]) -> Vec<u8> {
        let mut table = Vec::new();
        table.resize(TABLE_HEADER_SIZE, 0);
        table.extend_from_slice(&0u32.to_le_bytes()); // local apic address
        table.extend_from_slice(&0u32.to_le_bytes()); // flags
        table.extend_from_slice(entries);
        table
    }

    #[test]
    fn exactly_one_bsp_selected() {
        let mut entries = Vec::new();
        // processor_id, apic_id, flags(enabled)
        push_entry(&mut entries, 0, &[0, 0, 1, 0, 0, 0]);
        push_entry(&mut entries, 0, &[1, 1, 1, 0, 0, 0]);
        let table = build_madt(&entries);

        let topo = CpuTopology::parse(&table, 1);
        assert_eq!(topo.cpu_count(), 2);
        let bsp_count = topo.cpus().filter(|c| c.is_bsp).count();
        assert_eq!(bsp_count, 1);
        assert_eq!(topo.bsp().unwrap().apic_id, 1);
    }

    #[test]
    fn falls_back_to_first_enabled_cpu_when_bsp_id_not_found() {
        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[0, 5, 1, 0, 0, 0]);
        let table = build_madt(&entries);

        let topo = CpuTopology::parse(&table, 99);
        assert_eq!(topo.bsp().unwrap().apic_id, 5);
    }

    #[test]
    fn disabled_cpu_entries_are_excluded() {
        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[0, 0, 0, 0, 0, 0]); // disabled, not online-capable
        push_entry(&mut entries, 0, &[1, 1, 1, 0, 0, 0]); // enabled
        let table = build_madt(&entries);

        let topo = CpuTopology::parse(&table, 1);
        assert!(topo.cpus().find(|c| c.apic_id == 0).is_none());
        assert!(topo.cpus().find(|c| c.apic_id == 1).unwrap().is_bsp);
        assert_eq!(topo.cpu_count(), 1);
    }

    #[test]
    fn ioapic_and_override_entries_decoded() {
        let mut entries = Vec::new();
        // id, reserved, phys_addr(4), gsi_base(4)
        push_entry(
            &mut entries,
            1,
            &[2, 0, 0x00, 0x00, 0xF0, 0xFE, 0, 0, 0, 0],
        );
        // bus_source, irq_source, gsi(4), flags(2)
        push_entry(&mut entries, 2, &[0, 0, 2, 0, 0, 0, 0, 0]);
        let table = build_madt(&entries);

        let topo = CpuTopology::parse(&table, 0);
        let ioapic = topo.ioapics().next().unwrap();
        assert_eq!(ioapic.id, 2);
        assert_eq!(ioapic.gsi_base, 0);

        let over = topo.overrides().next().unwrap();
        assert_eq!(over.irq_source, 0);
        assert_eq!(over.gsi, 2);
    }

    #[test]
    fn numa_node_assignment_matches_srat_affinity() {
        use crate::topology::numa::NumaTopology;

        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[0, 0, 1, 0, 0, 0]);
        push_entry(&mut entries, 0, &[1, 1, 1, 0, 0, 0]);
        let table = build_madt(&entries);
        let mut topo = CpuTopology::parse(&table, 0);

        let mut srat_entries = Vec::new();
        // processor local apic: domain_low, apic_id, flags(enabled), ...
        srat_entries.push(0u8);
        srat_entries.push(16);
        srat_entries.extend_from_slice(&[0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        srat_entries.push(0u8);
        srat_entries.push(16);
        srat_entries.extend_from_slice(&[1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        let mut srat = Vec::new();
        srat.resize(TABLE_HEADER_SIZE, 0);
        srat.extend_from_slice(&1u32.to_le_bytes());
        srat.extend_from_slice(&[0u8; 8]);
        srat.extend_from_slice(&srat_entries);

        let numa = NumaTopology::parse_srat(&srat);
        topo.assign_numa_nodes(&numa);

        assert_eq!(
            topo.cpus().find(|c| c.apic_id == 0).unwrap().numa_node,
            Some(0)
        );
        assert_eq!(
            topo.cpus().find(|c| c.apic_id == 1).unwrap().numa_node,
            Some(1)
        );
    }
}

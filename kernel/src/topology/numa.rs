//! NumaTopology: walks the SRAT (processor/memory proximity-domain
//! affinities) and the SLIT (inter-node distance matrix), building a node
//! table indexed by proximity domain.

use crate::acpi::TABLE_HEADER_SIZE;

pub const MAX_NODES: usize = 16;
/// Upper bound on processor affinity entries tracked for the apic_id -> node
/// lookup `CpuTopology::assign_numa_nodes` uses; matches `cpu::MAX_CPUS`.
const MAX_CPU_AFFINITIES: usize = 64;

const SRAT_ENTRY_PROCESSOR_LOCAL_APIC: u8 = 0;
const SRAT_ENTRY_MEMORY: u8 = 1;
const SRAT_ENTRY_PROCESSOR_X2APIC: u8 = 2;

const AFFINITY_FLAG_ENABLED: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, Default)]
pub struct NumaNode {
    pub node_id: u8,
    pub cpu_count: u32,
    pub mem_bytes: u64,
    pub base: u64,
    pub top: u64,
    /// False for a domain in `0..node_count` that the SRAT never actually
    /// referenced (the node table is sized densely off `max(domain) + 1`,
    /// so gaps below the top domain are allocated but unobserved).
    pub is_valid: bool,
}

pub struct NumaTopology {
    nodes: [NumaNode; MAX_NODES],
    node_count: usize,
    /// `distance[i][j]`, valid for `i, j < node_count`.
    distance: [[u8; MAX_NODES]; MAX_NODES],
    cpu_domains: [(u32, u8); MAX_CPU_AFFINITIES],
    cpu_domain_count: usize,
}

struct SratEntryIter<'a> {
    buf: &'a [u8],
}

struct SratEntry<'a> {
    entry_type: u8,
    payload: &'a [u8],
}

impl<'a> Iterator for SratEntryIter<'a> {
    type Item = SratEntry<'a>;

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
        self.buf = &self.buf[length..];
        Some(SratEntry { entry_type, payload })
    }
}

fn srat_entries(body: &[u8]) -> impl Iterator<Item = SratEntry<'_>> {
    // SRAT body starts with a 4-byte "Table Revision" field plus 8 bytes
    // reserved before the variable-length entry list.
    let entries = if body.len() > 12 { &body[12..] } else { &[] };
    SratEntryIter { buf: entries }
}

fn decode_processor_local_apic(payload: &[u8]) -> Option<(u32, u32, u32)> {
    if payload.len() < 14 {
        return None;
    }
    let domain_low = payload[0] as u32;
    let apic_id = payload[1] as u32;
    let flags = u32::from_le_bytes(payload[2..6].try_into().ok()?);
    let domain_high = [payload[6], payload[7], payload[8], 0];
    let domain = domain_low | (u32::from_le_bytes(domain_high) << 8);
    Some((apic_id, domain, flags))
}

fn decode_processor_x2apic(payload: &[u8]) -> Option<(u32, u32, u32)> {
    if payload.len() < 18 {
        return None;
    }
    let domain = u32::from_le_bytes(payload[2..6].try_into().ok()?);
    let apic_id = u32::from_le_bytes(payload[6..10].try_into().ok()?);
    let flags = u32::from_le_bytes(payload[10..14].try_into().ok()?);
    Some((apic_id, domain, flags))
}

fn decode_memory_affinity(payload: &[u8]) -> Option<(u32, u64, u64, u32)> {
    if payload.len() < 30 {
        return None;
    }
    let domain = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let base_low = u32::from_le_bytes(payload[6..10].try_into().ok()?) as u64;
    let base_high = u32::from_le_bytes(payload[10..14].try_into().ok()?) as u64;
    let len_low = u32::from_le_bytes(payload[14..18].try_into().ok()?) as u64;
    let len_high = u32::from_le_bytes(payload[18..22].try_into().ok()?) as u64;
    let flags = u32::from_le_bytes(payload[26..30].try_into().ok()?);
    let base = base_low | (base_high << 32);
    let length = len_low | (len_high << 32);
    Some((domain, base, length, flags))
}

impl NumaTopology {
    /// Single-node fallback used when no SRAT is present: every CPU and all
    /// memory belong to node 0.
    pub fn single_node() -> Self {
        let mut nodes = [NumaNode::default(); MAX_NODES];
        nodes[0] = NumaNode {
            node_id: 0,
            cpu_count: 0,
            mem_bytes: 0,
            base: 0,
            top: 0,
            is_valid: true,
        };
        let mut distance = [[0u8; MAX_NODES]; MAX_NODES];
        distance[0][0] = 10;
        NumaTopology {
            nodes,
            node_count: 1,
            distance,
            cpu_domains: [(0, 0); MAX_CPU_AFFINITIES],
            cpu_domain_count: 0,
        }
    }

    /// Parse an SRAT table body (header + entries) into a node table. Node
    /// count is `max(proximity_domain) + 1`, capped at `MAX_NODES`; domains
    /// at or beyond the cap are dropped with a logged warning (sparse,
    /// high-valued proximity domains are an open question the spec leaves
    /// to the implementation).
    pub fn parse_srat(table_bytes: &[u8]) -> Self {
        let mut nodes = [NumaNode::default(); MAX_NODES];
        let mut max_domain: i32 = -1;
        let mut cpu_domains = [(0u32, 0u8); MAX_CPU_AFFINITIES];
        let mut cpu_domain_count = 0usize;

        if table_bytes.len() <= TABLE_HEADER_SIZE {
            return Self::single_node();
        }
        let body = &table_bytes[TABLE_HEADER_SIZE..];

        for entry in srat_entries(body) {
            match entry.entry_type {
                SRAT_ENTRY_PROCESSOR_LOCAL_APIC => {
                    if let Some((apic_id, domain, flags)) =
                        decode_processor_local_apic(entry.payload)
                    {
                        if flags & AFFINITY_FLAG_ENABLED != 0 {
                            note_cpu(&mut nodes, &mut max_domain, domain);
                            note_cpu_domain(&mut cpu_domains, &mut cpu_domain_count, apic_id, domain);
                        }
                    }
                }
                SRAT_ENTRY_PROCESSOR_X2APIC => {
                    if let Some((apic_id, domain, flags)) = decode_processor_x2apic(entry.payload)
                    {
                        if flags & AFFINITY_FLAG_ENABLED != 0 {
                            note_cpu(&mut nodes, &mut max_domain, domain);
                            note_cpu_domain(&mut cpu_domains, &mut cpu_domain_count, apic_id, domain);
                        }
                    }
                }
                SRAT_ENTRY_MEMORY => {
                    if let Some((domain, base, length, flags)) =
                        decode_memory_affinity(entry.payload)
                    {
                        if flags & AFFINITY_FLAG_ENABLED != 0 {
                            note_memory(&mut nodes, &mut max_domain, domain, base, length);
                        }
                    }
                }
                _ => {}
            }
        }

        if max_domain < 0 {
            return Self::single_node();
        }

        let node_count = (max_domain as usize + 1).min(MAX_NODES);
        for (i, node) in nodes.iter_mut().enumerate().take(node_count) {
            node.node_id = i as u8;
            node.is_valid = node.cpu_count > 0 || node.mem_bytes > 0;
        }

        // Default matrix for when no SLIT follows: same-node is local (10),
        // cross-node is the spec's generic remote distance (20).
        let mut distance = [[20u8; MAX_NODES]; MAX_NODES];
        for i in 0..node_count {
            distance[i][i] = 10;
        }

        NumaTopology {
            nodes,
            node_count,
            distance,
            cpu_domains,
            cpu_domain_count,
        }
    }

    /// Look up the proximity domain the SRAT assigned to `apic_id`, if any
    /// processor affinity entry named it. Used to populate
    /// `CpuDescriptor::numa_node`.
    pub fn node_for_apic_id(&self, apic_id: u32) -> Option<u8> {
        self.cpu_domains[..self.cpu_domain_count]
            .iter()
            .find(|(id, _)| *id == apic_id)
            .map(|(_, domain)| *domain)
    }

    /// Overlay an SLIT distance matrix onto an already-built node table.
    /// Locality counts larger than the SRAT-derived node count, or than
    /// `MAX_NODES`, are truncated; `dist(i, i)` is always forced to 10
    /// regardless of what the table says, per the universal invariant.
    pub fn apply_slit(&mut self, table_bytes: &[u8]) {
        if table_bytes.len() <= TABLE_HEADER_SIZE + 8 {
            return;
        }
        let body = &table_bytes[TABLE_HEADER_SIZE..];
        let locality_count = u64::from_le_bytes(body[0..8].try_into().unwrap_or([0; 8])) as usize;
        let matrix = &body[8..];
        let n = locality_count.min(self.node_count).min(MAX_NODES);
        if matrix.len() < locality_count * locality_count {
            return;
        }
        for i in 0..n {
            for j in 0..n {
                self.distance[i][j] = matrix[i * locality_count + j];
            }
            self.distance[i][i] = 10;
        }
    }

    pub fn nodes(&self) -> &[NumaNode] {
        &self.nodes[..self.node_count]
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn distance(&self, from: usize, to: usize) -> u8 {
        if from < self.node_count && to < self.node_count {
            self.distance[from][to]
        } else {
            10
        }
    }
}

fn note_cpu(nodes: &mut [NumaNode; MAX_NODES], max_domain: &mut i32, domain: u32) {
    if domain as usize >= MAX_NODES {
        log::warn!("NumaTopology: dropping CPU affinity for out-of-range domain {domain}");
        return;
    }
    nodes[domain as usize].cpu_count += 1;
    *max_domain = (*max_domain).max(domain as i32);
}

fn note_cpu_domain(
    cpu_domains: &mut [(u32, u8); MAX_CPU_AFFINITIES],
    count: &mut usize,
    apic_id: u32,
    domain: u32,
) {
    if domain as usize >= MAX_NODES {
        return;
    }
    if *count >= MAX_CPU_AFFINITIES {
        log::warn!("NumaTopology: dropping apic_id->domain mapping, capacity {MAX_CPU_AFFINITIES} reached");
        return;
    }
    cpu_domains[*count] = (apic_id, domain as u8);
    *count += 1;
}

fn note_memory(
    nodes: &mut [NumaNode; MAX_NODES],
    max_domain: &mut i32,
    domain: u32,
    base: u64,
    length: u64,
) {
    if domain as usize >= MAX_NODES {
        log::warn!("NumaTopology: dropping memory affinity for out-of-range domain {domain}");
        return;
    }
    let node = &mut nodes[domain as usize];
    let top = base + length;
    if node.mem_bytes == 0 {
        node.base = base;
        node.top = top;
    } else {
        node.base = node.base.min(base);
        node.top = node.top.max(top);
    }
    node.mem_bytes += length;
    *max_domain = (*max_domain).max(domain as i32);
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

    fn build_srat(entries: &[u8]) -> Vec<u8> {
        let mut table = Vec::new();
        table.resize(TABLE_HEADER_SIZE, 0);
        table.extend_from_slice(&1u32.to_le_bytes()); // table revision
        table.extend_from_slice(&[0u8; 8]); // reserved
        table.extend_from_slice(entries);
        table
    }

    #[test]
    fn no_srat_yields_single_default_node() {
        let topo = NumaTopology::single_node();
        assert_eq!(topo.node_count(), 1);
        assert_eq!(topo.distance(0, 0), 10);
    }

    #[test]
    fn processor_and_memory_affinities_build_two_nodes() {
        let mut entries = Vec::new();
        // processor local apic: domain_low=0, apic_id, flags(enabled), sapic_eid, domain_high(3)
        push_entry(&mut entries, 0, &[0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        push_entry(&mut entries, 0, &[1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        // memory affinity: domain(4), reserved(2), base_low(4), base_high(4),
        // len_low(4), len_high(4), reserved(4), flags(4), reserved(8)
        let mut mem0 = Vec::new();
        mem0.extend_from_slice(&0u32.to_le_bytes());
        mem0.extend_from_slice(&[0u8; 2]);
        mem0.extend_from_slice(&0x1000_0000u32.to_le_bytes());
        mem0.extend_from_slice(&0u32.to_le_bytes());
        mem0.extend_from_slice(&0x1000_0000u32.to_le_bytes());
        mem0.extend_from_slice(&0u32.to_le_bytes());
        mem0.extend_from_slice(&[0u8; 4]);
        mem0.extend_from_slice(&1u32.to_le_bytes()); // enabled
        mem0.extend_from_slice(&[0u8; 8]);
        push_entry(&mut entries, 1, &mem0);

        let table = build_srat(&entries);
        let topo = NumaTopology::parse_srat(&table);

        assert_eq!(topo.node_count(), 2);
        assert_eq!(topo.nodes()[0].cpu_count, 1);
        assert_eq!(topo.nodes()[1].cpu_count, 1);
        assert_eq!(topo.nodes()[0].mem_bytes, 0x1000_0000);
        assert_eq!(topo.distance(0, 0), 10);
        assert_eq!(topo.distance(1, 1), 10);
    }

    #[test]
    fn default_distance_is_20_for_distinct_nodes_without_slit() {
        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        push_entry(&mut entries, 0, &[1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let table = build_srat(&entries);
        let topo = NumaTopology::parse_srat(&table);

        assert_eq!(topo.distance(0, 1), 20);
        assert_eq!(topo.distance(1, 0), 20);
    }

    #[test]
    fn cpu_affinity_maps_apic_id_to_domain() {
        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[0, 7, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        push_entry(&mut entries, 0, &[1, 9, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let table = build_srat(&entries);
        let topo = NumaTopology::parse_srat(&table);

        assert_eq!(topo.node_for_apic_id(7), Some(0));
        assert_eq!(topo.node_for_apic_id(9), Some(1));
        assert_eq!(topo.node_for_apic_id(42), None);
    }

    #[test]
    fn gap_domain_below_top_is_marked_invalid() {
        // Only domain 2 is ever referenced; domains 0 and 1 are allocated by
        // the dense max(domain)+1 sizing rule but never observed.
        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let table = build_srat(&entries);
        let topo = NumaTopology::parse_srat(&table);

        assert_eq!(topo.node_count(), 3);
        assert!(!topo.nodes()[0].is_valid);
        assert!(!topo.nodes()[1].is_valid);
        assert!(topo.nodes()[2].is_valid);
    }

    #[test]
    fn slit_overlay_respects_diagonal_invariant() {
        let mut entries = Vec::new();
        push_entry(&mut entries, 0, &[0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        push_entry(&mut entries, 0, &[1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let srat = build_srat(&entries);
        let mut topo = NumaTopology::parse_srat(&srat);

        let mut slit = Vec::new();
        slit.resize(TABLE_HEADER_SIZE, 0);
        slit.extend_from_slice(&2u64.to_le_bytes());
        slit.extend_from_slice(&[99, 20, 20, 99]); // deliberately wrong diagonal
        topo.apply_slit(&slit);

        assert_eq!(topo.distance(0, 0), 10);
        assert_eq!(topo.distance(1, 1), 10);
        assert_eq!(topo.distance(0, 1), 20);
    }
}

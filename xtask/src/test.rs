//! Boot-log verification: boots the kernel once under QEMU and checks the
//! serial log for the `log::info!`/`log::warn!` lines `kernel_main` emits
//! as it walks the discovery sequence (serial -> ACPI -> topology -> PCI ->
//! AHCI -> block devices).

use crate::{build_kernel, run_qemu, QemuOutcome};
use anyhow::Result;
use std::time::Duration;

/// Build the kernel and boot it once, checking for the markers below.
pub fn test_all(timeout: Duration) -> Result<()> {
    println!("Running boot-sequence checks");

    let kernel_bin = build_kernel(&["testing"], false)?;
    let outcome = run_qemu(&kernel_bin, timeout)?;

    parse_and_report_results(&outcome)
}

/// Log lines `kernel_main` always emits on a successful discovery pass.
/// `PCI` here is a substring match, not the literal line, since the exact
/// device/block-device counts vary with the emulated topology.
const EXPECTED_MARKERS: &[&str] = &[
    "ProtonOS kernel starting",
    "numa topology:",
    "pci devices discovered:",
    "ProtonOS boot sequence complete",
];

fn parse_and_report_results(outcome: &QemuOutcome) -> Result<()> {
    let output = &outcome.serial_output;

    println!("\nrunning {} boot markers", EXPECTED_MARKERS.len());

    let mut passed = 0;
    let mut failed = 0;

    for marker in EXPECTED_MARKERS {
        print!("marker \"{}\" ", marker);
        if output.contains(marker) {
            println!("... ok");
            passed += 1;
        } else {
            println!("... NOT FOUND");
            failed += 1;
        }
    }

    println!(
        "\ntest result: {}. {} passed; {} failed",
        if failed == 0 { "ok" } else { "FAILED" },
        passed,
        failed
    );

    if failed > 0 {
        anyhow::bail!("Boot sequence did not reach completion");
    }

    Ok(())
}
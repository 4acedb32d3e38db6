//! Best-effort process and accelerator statistics for `/health` and `/stats`
//!
//! Both readings return `None` instead of failing; the endpoints omit the
//! field in that case.

use sysinfo::System;

use crate::protocol::AcceleratorMemory;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Resident set size of this process, in MiB
pub fn resident_memory_mb() -> Option<f64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system
        .process(pid)
        .map(|process| process.memory() as f64 / BYTES_PER_MIB)
}

/// Memory counters of the first GPU, read through NVML
#[cfg(feature = "cuda")]
pub fn accelerator_memory() -> Option<AcceleratorMemory> {
    use std::sync::OnceLock;

    use nvml_wrapper::Nvml;
    use tracing::debug;

    static NVML: OnceLock<Option<Nvml>> = OnceLock::new();

    let nvml = NVML
        .get_or_init(|| match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                debug!("NVML unavailable: {:?}", e);
                None
            }
        })
        .as_ref()?;

    let counters = nvml.device_by_index(0).and_then(|device| {
        let name = device.name()?;
        let memory = device.memory_info()?;
        Ok((name, memory))
    });

    match counters {
        Ok((name, memory)) => Some(to_accelerator_memory(name, memory.used, memory.total)),
        Err(e) => {
            debug!("NVML memory query failed: {:?}", e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub fn accelerator_memory() -> Option<AcceleratorMemory> {
    None
}

/// Convert NVML byte counters to MiB
#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
fn to_accelerator_memory(name: String, used_bytes: u64, total_bytes: u64) -> AcceleratorMemory {
    AcceleratorMemory {
        name,
        memory_used_mb: used_bytes as f64 / BYTES_PER_MIB,
        memory_total_mb: total_bytes as f64 / BYTES_PER_MIB,
    }
}

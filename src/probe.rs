use sysinfo::System;

/// Used when the memory reading is unavailable; small enough that the
/// candidate walk starts from models any machine can hold.
const DEFAULT_RAM_GB: u64 = 8;

/// Total system memory in whole gigabytes.
///
/// A zero reading (unsupported platform, refresh failure) falls back to
/// [`DEFAULT_RAM_GB`] — model selection must always have a number to work
/// with, so this never returns an error.
pub fn total_ram_gb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let bytes = sys.total_memory();
    if bytes == 0 {
        log::warn!("[probe] memory reading unavailable, assuming {DEFAULT_RAM_GB}GB");
        return DEFAULT_RAM_GB;
    }
    (bytes / 1024 / 1024 / 1024).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_ram_gb_positive() {
        assert!(total_ram_gb() >= 1);
    }
}

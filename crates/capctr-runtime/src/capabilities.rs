//! Capability set of the calling process, as granted to privileged execs.

use crate::EngineError;

const PROC_STATUS: &str = "/proc/self/status";

/// Linux capability names indexed by bit number.
const CAPABILITY_NAMES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Effective capabilities of the current process, in bit order.
pub fn current_capabilities() -> Result<Vec<String>, EngineError> {
    let status = std::fs::read_to_string(PROC_STATUS)?;
    capabilities_from_status(&status)
}

/// Extract the `CapEff` mask from a `/proc/<pid>/status` document.
pub fn capabilities_from_status(status: &str) -> Result<Vec<String>, EngineError> {
    let hex_mask = status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .map(str::trim)
        .ok_or_else(|| EngineError::Internal(format!("no CapEff entry in {PROC_STATUS}")))?;
    let mask = u64::from_str_radix(hex_mask, 16).map_err(|e| {
        EngineError::Internal(format!("invalid CapEff mask '{hex_mask}': {e}"))
    })?;
    Ok(capabilities_from_mask(mask))
}

/// Names for every known bit set in `mask`. Bits newer than this table are
/// skipped.
pub fn capabilities_from_mask(mask: u64) -> Vec<String> {
    CAPABILITY_NAMES
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1u64 << bit) != 0)
        .map(|(_, name)| (*name).to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_maps_to_names() {
        // CAP_CHOWN | CAP_KILL | CAP_SYS_ADMIN
        let caps = capabilities_from_mask((1 << 0) | (1 << 5) | (1 << 21));
        assert_eq!(caps, vec!["CAP_CHOWN", "CAP_KILL", "CAP_SYS_ADMIN"]);
        assert!(capabilities_from_mask(0).is_empty());
    }

    #[test]
    fn full_mask_covers_table() {
        let caps = capabilities_from_mask(u64::MAX);
        assert_eq!(caps.len(), CAPABILITY_NAMES.len());
        assert_eq!(caps.last().map(String::as_str), Some("CAP_CHECKPOINT_RESTORE"));
    }

    #[test]
    fn parses_status_document() {
        let status = "Name:\tcat\nCapInh:\t0000000000000000\nCapPrm:\t00000000a80425fb\n\
                      CapEff:\t00000000a80425fb\nCapBnd:\t00000000a80425fb\n";
        let caps = capabilities_from_status(status).unwrap();
        assert!(caps.contains(&"CAP_NET_RAW".to_owned()));
        assert!(caps.contains(&"CAP_SETFCAP".to_owned()));
        assert!(!caps.contains(&"CAP_SYS_ADMIN".to_owned()));
    }

    #[test]
    fn missing_cap_eff_is_an_error() {
        assert!(capabilities_from_status("Name:\tcat\n").is_err());
        assert!(capabilities_from_status("CapEff:\tzz\n").is_err());
    }

    #[test]
    fn current_process_is_readable() {
        if std::path::Path::new(PROC_STATUS).exists() {
            assert!(current_capabilities().is_ok());
        }
    }
}

//! Linux capability handling.
//!
//! Task files name capabilities by their `CAP_*` names; those are resolved to
//! the kernel's bit numbers through a static table and collected into 64-bit
//! masks. The masks travel to the launcher on its command line, but the
//! supervisor also needs to manipulate its own sets (retaining permitted
//! capabilities across a uid change, raising ambient/inheritable bits) and to
//! query the effective set of a child.
//!
//! We use raw structs matching `<linux/capability.h>` because the libc crate
//! doesn't expose `__user_cap_header_struct` / `__user_cap_data_struct`.

use crate::error::{Error, Result};

/// Highest capability number known to this table. Regenerate the table when
/// the kernel UAPI bumps `CAP_LAST_CAP`.
pub const CAP_LAST_CAP: u64 = 40;

/// Name → kernel bit number, indexed by the kernel's `CAP_*` constant values.
static CAP_NAMES: &[&str] = &[
    "CAP_CHOWN",              // 0
    "CAP_DAC_OVERRIDE",       // 1
    "CAP_DAC_READ_SEARCH",    // 2
    "CAP_FOWNER",             // 3
    "CAP_FSETID",             // 4
    "CAP_KILL",               // 5
    "CAP_SETGID",             // 6
    "CAP_SETUID",             // 7
    "CAP_SETPCAP",            // 8
    "CAP_LINUX_IMMUTABLE",    // 9
    "CAP_NET_BIND_SERVICE",   // 10
    "CAP_NET_BROADCAST",      // 11
    "CAP_NET_ADMIN",          // 12
    "CAP_NET_RAW",            // 13
    "CAP_IPC_LOCK",           // 14
    "CAP_IPC_OWNER",          // 15
    "CAP_SYS_MODULE",         // 16
    "CAP_SYS_RAWIO",          // 17
    "CAP_SYS_CHROOT",         // 18
    "CAP_SYS_PTRACE",         // 19
    "CAP_SYS_PACCT",          // 20
    "CAP_SYS_ADMIN",          // 21
    "CAP_SYS_BOOT",           // 22
    "CAP_SYS_NICE",           // 23
    "CAP_SYS_RESOURCE",       // 24
    "CAP_SYS_TIME",           // 25
    "CAP_SYS_TTY_CONFIG",     // 26
    "CAP_MKNOD",              // 27
    "CAP_LEASE",              // 28
    "CAP_AUDIT_WRITE",        // 29
    "CAP_AUDIT_CONTROL",      // 30
    "CAP_SETFCAP",            // 31
    "CAP_MAC_OVERRIDE",       // 32
    "CAP_MAC_ADMIN",          // 33
    "CAP_SYSLOG",             // 34
    "CAP_WAKE_ALARM",         // 35
    "CAP_BLOCK_SUSPEND",      // 36
    "CAP_AUDIT_READ",         // 37
    "CAP_PERFMON",            // 38
    "CAP_BPF",                // 39
    "CAP_CHECKPOINT_RESTORE", // 40
];

/// Convert a capability name (e.g. `CAP_SYS_TIME`) to its kernel bit number.
pub fn cap_from_name(name: &str) -> Option<u64> {
    CAP_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name))
        .map(|i| i as u64)
}

/// Parse a whitespace-separated list of `CAP_*` names into a bitmask.
/// Unknown names are an error.
pub fn parse_cap_list(list: &str) -> Result<u64> {
    let mut mask = 0u64;
    for name in list.split_ascii_whitespace() {
        let bit = cap_from_name(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown capability name: {name}")))?;
        mask |= 1u64 << bit;
    }
    Ok(mask)
}

fn check_mask_range(mask: u64) -> Result<()> {
    let allowed = if CAP_LAST_CAP == 63 {
        u64::MAX
    } else {
        (1u64 << (CAP_LAST_CAP + 1)) - 1
    };
    if mask & !allowed != 0 {
        return Err(Error::InvalidInput(format!(
            "capability mask {mask:#x} has bits above CAP_LAST_CAP ({CAP_LAST_CAP})"
        )));
    }
    Ok(())
}

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const CAP_V3: u32 = 0x20080522; // _LINUX_CAPABILITY_VERSION_3

fn capget(pid: i32) -> Result<[CapData; 2]> {
    let mut hdr = CapHeader {
        version: CAP_V3,
        pid,
    };
    let mut data = [CapData::default(); 2];
    if unsafe { libc::syscall(libc::SYS_capget, &mut hdr as *mut _, data.as_mut_ptr()) } != 0 {
        return Err(Error::os("capget", nix::Error::last()));
    }
    Ok(data)
}

fn capset(data: &[CapData; 2]) -> Result<()> {
    let hdr = CapHeader {
        version: CAP_V3,
        pid: 0,
    };
    if unsafe { libc::syscall(libc::SYS_capset, &hdr as *const _, data.as_ptr()) } != 0 {
        return Err(Error::os("capset", nix::Error::last()));
    }
    Ok(())
}

fn mask_from_cap_words(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Tell the kernel to retain the permitted capability set across a uid
/// change, via the process securebits (`SECBIT_KEEP_CAPS`).
pub fn keep_caps_across_setuid() -> Result<()> {
    const SECBIT_KEEP_CAPS: libc::c_ulong = 1 << 4;
    let bits = unsafe { libc::prctl(libc::PR_GET_SECUREBITS) };
    if bits < 0 {
        return Err(Error::os("PR_GET_SECUREBITS", nix::Error::last()));
    }
    let new_bits = bits as libc::c_ulong | SECBIT_KEEP_CAPS;
    if unsafe { libc::prctl(libc::PR_SET_SECUREBITS, new_bits, 0, 0, 0) } != 0 {
        return Err(Error::os("PR_SET_SECUREBITS", nix::Error::last()));
    }
    Ok(())
}

/// Raise every bit of `mask` in the ambient set of the calling process.
///
/// Ambient bits require the capability to be present in the permitted and
/// inheritable sets first, so those are raised as one capset before the
/// per-bit `PR_CAP_AMBIENT_RAISE` calls.
pub fn set_ambient(mask: u64) -> Result<()> {
    check_mask_range(mask)?;
    if mask == 0 {
        return Ok(());
    }

    let mut data = capget(0)?;
    data[0].permitted |= (mask & 0xFFFF_FFFF) as u32;
    data[0].inheritable |= (mask & 0xFFFF_FFFF) as u32;
    data[1].permitted |= (mask >> 32) as u32;
    data[1].inheritable |= (mask >> 32) as u32;
    capset(&data)?;

    for bit in 0..=CAP_LAST_CAP {
        if mask & (1u64 << bit) == 0 {
            continue;
        }
        let ret = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE,
                bit as libc::c_ulong,
                0,
                0,
            )
        };
        if ret != 0 {
            return Err(Error::os(
                format!("PR_CAP_AMBIENT_RAISE for cap {bit}"),
                nix::Error::last(),
            ));
        }
    }
    Ok(())
}

/// Replace the inheritable capability set of the calling process with `mask`.
pub fn set_inheritable(mask: u64) -> Result<()> {
    check_mask_range(mask)?;
    let mut data = capget(0)?;
    data[0].inheritable = (mask & 0xFFFF_FFFF) as u32;
    data[1].inheritable = (mask >> 32) as u32;
    capset(&data)
}

/// Whether `pid` currently has capability bit `cap` in its effective set.
pub fn effective_cap_for_pid(pid: libc::pid_t, cap: u64) -> Result<bool> {
    if cap > CAP_LAST_CAP {
        return Err(Error::InvalidInput(format!(
            "capability number {cap} above CAP_LAST_CAP ({CAP_LAST_CAP})"
        )));
    }
    let data = capget(pid)?;
    let effective = mask_from_cap_words(data[0].effective, data[1].effective);
    Ok(effective & (1u64 << cap) != 0)
}

/// The inheritable capability set of the calling process.
pub fn get_inheritable() -> Result<u64> {
    let data = capget(0)?;
    Ok(mask_from_cap_words(data[0].inheritable, data[1].inheritable))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_table_matches_kernel_numbering() {
        assert_eq!(cap_from_name("CAP_CHOWN"), Some(0));
        assert_eq!(cap_from_name("CAP_NET_BIND_SERVICE"), Some(10));
        assert_eq!(cap_from_name("CAP_SETFCAP"), Some(31));
        assert_eq!(cap_from_name("CAP_MAC_OVERRIDE"), Some(32));
        assert_eq!(cap_from_name("CAP_CHECKPOINT_RESTORE"), Some(CAP_LAST_CAP));
        assert_eq!(cap_from_name("CAP_TIME_TRAVEL"), None);
    }

    #[test]
    fn table_covers_every_bit_once() {
        assert_eq!(CAP_NAMES.len() as u64, CAP_LAST_CAP + 1);
        for (i, name) in CAP_NAMES.iter().enumerate() {
            assert_eq!(cap_from_name(name), Some(i as u64));
        }
    }

    #[test]
    fn parse_list_builds_mask() {
        let mask = parse_cap_list("CAP_CHOWN CAP_NET_ADMIN CAP_SYS_TIME").unwrap();
        assert_eq!(mask, (1 << 0) | (1 << 12) | (1 << 25));
    }

    #[test]
    fn parse_list_is_case_insensitive() {
        assert_eq!(parse_cap_list("cap_kill").unwrap(), 1 << 5);
    }

    #[test]
    fn parse_list_rejects_unknown_names() {
        assert!(parse_cap_list("CAP_CHOWN CAP_NOT_A_THING").is_err());
    }

    #[test]
    fn mask_above_last_cap_is_rejected() {
        let bad = 1u64 << (CAP_LAST_CAP + 1);
        assert!(set_inheritable(bad).is_err());
        assert!(set_ambient(bad).is_err());
    }

    #[test]
    fn effective_query_rejects_out_of_range_bit() {
        assert!(effective_cap_for_pid(std::process::id() as libc::pid_t, CAP_LAST_CAP + 1).is_err());
    }
}

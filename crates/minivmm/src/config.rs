//! VM configuration and the small string grammars it is built from.
//!
//! Two textual formats reach the VMM from the command line:
//!
//! - **Sizes**: `number[gGmMkK]`, e.g. `1G`, `512m`, `0x1000`.  The
//!   numeric part accepts the usual base prefixes; the suffix is a binary
//!   multiplier.  When no suffix is present a caller-supplied default unit
//!   applies (the memory flag defaults to gigabytes).
//! - **Vsock routes**: `vmPort=transport:address`, comma separated, e.g.
//!   `17010=tcp:17010,18010=unix:port`.  Parsing is all-or-nothing: one bad
//!   segment rejects the whole list.
//!
//! [`VmConfig`] collects everything the execution engine needs.  Its
//! [`Default`] reproduces the stock configuration: `/dev/kvm`, `./bzImage`,
//! `./initrd`, one vCPU, 1 GiB of RAM and a tap interface named `tap`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::cid::{MAX_GUEST_CID, MIN_GUEST_CID};
use crate::memory::{MMIO_GAP_END, MMIO_GAP_START};

/// Largest supported vCPU count.
///
/// Bounded by the single-page MADT written in [`crate::acpi`].
pub const MAX_VCPUS: usize = 64;

/// Smallest accepted guest memory size (the kernel loads at 1 MiB).
pub const MIN_MEMORY_SIZE: u64 = 2 << 20;

/// Default kernel command line.
///
/// Serial console on COM1, PIC-only interrupt routing, no PCI probing.
/// Derived from the kvmtool defaults for direct kernel boot.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0 earlyprintk=serial noapic notsc lapic \
     tsc_early_khz=2000 pci=off mitigations=off rdinit=/init init=/init";

/// Errors produced while parsing or validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{input:?}: can't parse as num[gGmMkK]")]
    SizeSyntax { input: String },

    #[error("{input:?}: size does not fit in 64 bits")]
    SizeOutOfRange { input: String },

    #[error("{route:?} not in form vsockport=net:port: {reason}")]
    RouteSyntax { route: String, reason: &'static str },

    #[error("{input:?} does not have 3 fields (base@size@name)")]
    RegionSyntax { input: String },

    #[error("memory region {input:?} has zero size")]
    RegionEmpty { input: String },

    #[error("guest CID {cid} is outside [{MIN_GUEST_CID}, {MAX_GUEST_CID}]")]
    ReservedCid { cid: u64 },

    #[error("vCPU count {count} is outside 1..={MAX_VCPUS}")]
    VcpuCount { count: usize },

    #[error("memory size {size:#x} is below the {MIN_MEMORY_SIZE:#x} byte minimum")]
    MemoryTooSmall { size: u64 },
}

// ─── Numbers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumError {
    Syntax,
    Range,
}

/// Parse an unsigned integer with base detection.
///
/// `0x`/`0X` is hexadecimal, `0o`/`0O` octal, `0b`/`0B` binary, and a
/// bare leading `0` followed by more digits is octal.  Underscores are
/// not accepted.
fn parse_uint(s: &str) -> Result<u64, NumError> {
    let (digits, radix) = match s.as_bytes() {
        [b'0', b'x' | b'X', rest @ ..] => (rest, 16),
        [b'0', b'o' | b'O', rest @ ..] => (rest, 8),
        [b'0', b'b' | b'B', rest @ ..] => (rest, 2),
        [b'0', rest @ ..] if !rest.is_empty() => (rest, 8),
        other => (other, 10),
    };
    if digits.is_empty() {
        return Err(NumError::Syntax);
    }

    let mut value: u64 = 0;
    let mut overflow = false;
    for &c in digits {
        let digit = (c as char).to_digit(radix).ok_or(NumError::Syntax)?;
        // Keep scanning after overflow so trailing garbage is still a
        // syntax error rather than a range error.
        match value
            .checked_mul(u64::from(radix))
            .and_then(|v| v.checked_add(u64::from(digit)))
        {
            Some(v) => value = v,
            None => overflow = true,
        }
    }
    if overflow {
        Err(NumError::Range)
    } else {
        Ok(value)
    }
}

// ─── Sizes ───────────────────────────────────────────────────────────

fn unit_shift(unit: &str) -> Option<u32> {
    match unit {
        "G" | "g" => Some(30),
        "M" | "m" => Some(20),
        "K" | "k" => Some(10),
        "" => Some(0),
        _ => None,
    }
}

/// Parse a size string of the form `number[gGmMkK]`.
///
/// The multiplier suffix is optional; when it is absent, `default_unit`
/// (one of `"g"`, `"m"`, `"k"`, `""`, either case) applies instead.
///
/// ```
/// use minivmm::config::parse_size;
///
/// assert_eq!(parse_size("1G", "").unwrap(), 1 << 30);
/// assert_eq!(parse_size("8192m", "").unwrap(), 8192 << 20);
/// assert_eq!(parse_size("1", "k").unwrap(), 1 << 10);
/// assert!(parse_size("1T", "").is_err());
/// ```
pub fn parse_size(input: &str, default_unit: &str) -> Result<u64, ConfigError> {
    let number = input.trim_end_matches(|c| "gGmMkK".contains(c));
    let syntax = || ConfigError::SizeSyntax {
        input: input.to_string(),
    };
    let range = || ConfigError::SizeOutOfRange {
        input: input.to_string(),
    };

    if number.is_empty() {
        return Err(syntax());
    }
    let amount = parse_uint(number).map_err(|e| match e {
        NumError::Syntax => syntax(),
        NumError::Range => range(),
    })?;

    let unit = if input.len() > number.len() {
        &input[number.len()..]
    } else {
        default_unit
    };
    let shift = unit_shift(unit).ok_or_else(syntax)?;

    if shift > 0 && amount.leading_zeros() < shift {
        return Err(range());
    }
    Ok(amount << shift)
}

// ─── Vsock routes ────────────────────────────────────────────────────

/// A vsock port bridged to a host endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockRoute {
    /// Port number inside the guest's vsock address space.
    pub vm_port: u32,
    /// Host transport, e.g. `unix` or `tcp`.
    pub transport: String,
    /// Host address for the transport (socket path, port, ...).
    pub address: String,
}

impl fmt::Display for VsockRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}:{:?}", self.vm_port, self.transport, self.address)
    }
}

/// Format a route list the way it would be written on the command line.
pub fn format_routes(routes: &[VsockRoute]) -> String {
    routes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_route(segment: &str) -> Result<VsockRoute, ConfigError> {
    let err = |reason| ConfigError::RouteSyntax {
        route: segment.to_string(),
        reason,
    };

    let halves: Vec<&str> = segment.split('=').collect();
    let [port, local] = halves[..] else {
        return Err(err("expected exactly one '='"));
    };
    let parts: Vec<&str> = local.split(':').collect();
    let [transport, address] = parts[..] else {
        return Err(err("expected exactly one ':'"));
    };

    let vm_port = match parse_uint(port) {
        Ok(p) => u32::try_from(p).map_err(|_| err("port out of range"))?,
        Err(NumError::Syntax) => return Err(err("port is not a number")),
        Err(NumError::Range) => return Err(err("port out of range")),
    };

    Ok(VsockRoute {
        vm_port,
        transport: transport.to_string(),
        address: address.to_string(),
    })
}

/// Parse a comma-separated list of vsock routes.
///
/// Segments are parsed left to right.  Any malformed segment fails the
/// whole list; no partial result is returned.  An empty input yields no
/// routes.
pub fn parse_routes(input: &str) -> Result<Vec<VsockRoute>, ConfigError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    input.split(',').map(parse_route).collect()
}

/// Check a caller-pinned guest CID against the assignable domain.
pub fn validate_cid(cid: u64) -> Result<u32, ConfigError> {
    match u32::try_from(cid) {
        Ok(c) if (MIN_GUEST_CID..=MAX_GUEST_CID).contains(&c) => Ok(c),
        _ => Err(ConfigError::ReservedCid { cid }),
    }
}

// ─── VmConfig ────────────────────────────────────────────────────────

/// Vhost-vsock transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockConfig {
    /// Vhost control device, normally `/dev/vhost-vsock`.
    pub device: PathBuf,
    /// Pinned guest CID.  `None` draws one from the process allocator.
    pub cid: Option<u32>,
    /// Feature bits to offer before reading back the accepted set.
    pub features: Option<u64>,
    /// Host endpoints bridged to guest ports.
    pub routes: Vec<VsockRoute>,
}

/// Everything needed to construct and boot a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// KVM control device.
    pub kvm_path: PathBuf,
    /// Guest kernel (bzImage or ELF vmlinux).
    pub kernel: PathBuf,
    /// Initial ramdisk, if any.
    pub initrd: Option<PathBuf>,
    /// Kernel command line (without the virtio-mmio device announcement,
    /// which is appended automatically when a NIC is attached).
    pub cmdline: String,
    /// Tap interface backing the guest NIC.  `None` disables the NIC.
    pub tap_name: Option<String>,
    /// Number of vCPUs, each run by its own host thread.
    pub num_vcpus: usize,
    /// Guest RAM size in bytes, used when `memory_regions` is empty.
    pub memory_size: u64,
    /// Explicit `base@size@name` region specs; overrides `memory_size`.
    pub memory_regions: Vec<String>,
    /// Vhost-vsock transport, if enabled.
    pub vsock: Option<VsockConfig>,
    /// Forward host stdin into the guest serial console.
    pub serial_input: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            kvm_path: PathBuf::from("/dev/kvm"),
            kernel: PathBuf::from("./bzImage"),
            initrd: Some(PathBuf::from("./initrd")),
            cmdline: DEFAULT_CMDLINE.to_string(),
            tap_name: Some("tap".to_string()),
            num_vcpus: 1,
            memory_size: 1 << 30,
            memory_regions: Vec::new(),
            vsock: None,
            serial_input: true,
        }
    }
}

impl VmConfig {
    /// Reject configurations the execution engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_vcpus == 0 || self.num_vcpus > MAX_VCPUS {
            return Err(ConfigError::VcpuCount {
                count: self.num_vcpus,
            });
        }
        if self.memory_regions.is_empty() && self.memory_size < MIN_MEMORY_SIZE {
            return Err(ConfigError::MemoryTooSmall {
                size: self.memory_size,
            });
        }
        if let Some(cid) = self.vsock.as_ref().and_then(|v| v.cid) {
            validate_cid(u64::from(cid))?;
        }
        Ok(())
    }

    /// The region specs to map: explicit ones, or `memory_size` bytes of
    /// anonymous RAM from guest physical address 0.
    ///
    /// Default RAM that would reach the device window is split around
    /// it, the remainder continuing at [`MMIO_GAP_END`].
    pub fn region_specs(&self) -> Vec<String> {
        if !self.memory_regions.is_empty() {
            return self.memory_regions.clone();
        }
        let low = self.memory_size.min(MMIO_GAP_START);
        let mut specs = vec![format!("0@{low}@")];
        if self.memory_size > MMIO_GAP_START {
            specs.push(format!(
                "{MMIO_GAP_END:#x}@{}@",
                self.memory_size - MMIO_GAP_START
            ));
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        let cases = [
            ("1G", 1u64 << 30),
            ("1g", 1 << 30),
            ("1M", 1 << 20),
            ("1m", 1 << 20),
            ("1K", 1 << 10),
            ("1k", 1 << 10),
            ("8192m", 8192 << 20),
            ("4096", 4096),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_size(input, "").unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn size_default_unit_applies_without_suffix() {
        assert_eq!(parse_size("1", "k").unwrap(), 1 << 10);
        assert_eq!(parse_size("1", "").unwrap(), 1);
        assert_eq!(parse_size("2", "g").unwrap(), 2 << 30);
        // An explicit suffix wins over the default unit.
        assert_eq!(parse_size("3m", "g").unwrap(), 3 << 20);
    }

    #[test]
    fn size_base_prefixes() {
        assert_eq!(parse_size("0x10", "").unwrap(), 16);
        assert_eq!(parse_size("0x10k", "").unwrap(), 16 << 10);
        assert_eq!(parse_size("0b101", "").unwrap(), 5);
        assert_eq!(parse_size("0o17", "").unwrap(), 15);
        assert_eq!(parse_size("010", "").unwrap(), 8);
        assert_eq!(parse_size("0", "").unwrap(), 0);
    }

    #[test]
    fn size_rejects_bad_suffix() {
        assert!(matches!(
            parse_size("1T", ""),
            Err(ConfigError::SizeSyntax { .. })
        ));
        assert!(matches!(
            parse_size("1kk", ""),
            Err(ConfigError::SizeSyntax { .. })
        ));
        assert!(matches!(
            parse_size("1", "t"),
            Err(ConfigError::SizeSyntax { .. })
        ));
    }

    #[test]
    fn size_rejects_garbage() {
        for input in ["", "g", "123411;3413234134", "123411;3413234134m", "-1", "0x"] {
            assert!(
                matches!(parse_size(input, ""), Err(ConfigError::SizeSyntax { .. })),
                "{input:?} should be a syntax error"
            );
        }
    }

    #[test]
    fn size_out_of_range() {
        assert!(matches!(
            parse_size("0xfffffffffffffffffffffff", ""),
            Err(ConfigError::SizeOutOfRange { .. })
        ));
        assert!(matches!(
            parse_size("0x400000000g", ""),
            Err(ConfigError::SizeOutOfRange { .. })
        ));
        assert_eq!(parse_size("0x3ffffffffg", "").unwrap(), 0x3_ffff_ffff << 30);
    }

    #[test]
    fn single_unix_route() {
        let routes = parse_routes("17010=unix:port").unwrap();
        assert_eq!(
            routes,
            vec![VsockRoute {
                vm_port: 17010,
                transport: "unix".into(),
                address: "port".into(),
            }]
        );
    }

    #[test]
    fn two_routes_keep_input_order() {
        let routes = parse_routes("17010=tcp:17010,18010=unix:port").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].vm_port, 17010);
        assert_eq!(routes[0].transport, "tcp");
        assert_eq!(routes[0].address, "17010");
        assert_eq!(routes[1].vm_port, 18010);
        assert_eq!(routes[1].transport, "unix");
        assert_eq!(routes[1].address, "port");
    }

    #[test]
    fn malformed_route_fails_whole_list() {
        for input in [
            "1x010=unix:port",
            "1x010=unixport",
            "1x010unixport",
            "17010=tcp:17010,18010unix:port",
            "17010=tcp:17010,18010=unixport",
            "17010=tcp:17010,1x010=unixport",
            "1=2=unix:port",
            "99999999999=unix:port",
        ] {
            assert!(
                matches!(parse_routes(input), Err(ConfigError::RouteSyntax { .. })),
                "{input:?} should fail"
            );
        }
    }

    #[test]
    fn empty_route_list() {
        assert!(parse_routes("").unwrap().is_empty());
    }

    #[test]
    fn route_display() {
        let routes = parse_routes("17010=tcp:17010,18010=unix:port").unwrap();
        assert_eq!(
            format_routes(&routes),
            r#"17010="tcp":"17010",18010="unix":"port""#
        );
    }

    #[test]
    fn cid_domain() {
        for reserved in [0u64, 1, 2, u64::from(u32::MAX), u64::from(u32::MAX) - 2, 1 << 32] {
            assert!(validate_cid(reserved).is_err(), "{reserved} accepted");
        }
        assert_eq!(validate_cid(3).unwrap(), 3);
        assert_eq!(validate_cid(u64::from(u32::MAX) - 3).unwrap(), u32::MAX - 3);
    }

    #[test]
    fn default_config_is_valid() {
        let config = VmConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kvm_path, PathBuf::from("/dev/kvm"));
        assert_eq!(config.num_vcpus, 1);
        assert_eq!(config.memory_size, 1 << 30);
        assert_eq!(config.region_specs(), vec![format!("0@{}@", 1u64 << 30)]);
    }

    #[test]
    fn large_default_memory_skips_device_window() {
        let config = VmConfig {
            memory_size: 4 << 30,
            ..VmConfig::default()
        };
        assert_eq!(
            config.region_specs(),
            vec![
                format!("0@{}@", 0xd000_0000u64),
                format!("0x100000000@{}@", (4u64 << 30) - 0xd000_0000),
            ]
        );

        let exact = VmConfig {
            memory_size: 0xd000_0000,
            ..VmConfig::default()
        };
        assert_eq!(exact.region_specs().len(), 1);
    }

    #[test]
    fn validate_rejects_bad_vcpu_counts() {
        let mut config = VmConfig {
            num_vcpus: 0,
            ..VmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::VcpuCount { count: 0 })
        ));
        config.num_vcpus = MAX_VCPUS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_pinned_reserved_cid() {
        let config = VmConfig {
            vsock: Some(VsockConfig {
                device: PathBuf::from("/dev/vhost-vsock"),
                cid: Some(2),
                features: None,
                routes: Vec::new(),
            }),
            ..VmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReservedCid { cid: 2 })
        ));
    }
}

//! Boot a Linux guest under minivmm.
//!
//! ```bash
//! minivmm -k bzImage -i initrd -t tap0 -c 2 -m 512m
//!
//! # vhost-vsock with a pinned CID and two host routes
//! minivmm -k bzImage -i initrd --cid 42 -R 17010=tcp:17010,18010=unix:/tmp/port
//! ```

use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use minivmm::cid::CidAllocator;
use minivmm::config::{
    format_routes, parse_routes, parse_size, validate_cid, VsockConfig, VsockRoute,
    DEFAULT_CMDLINE,
};
use minivmm::vhost::VHOST_VSOCK_DEVICE;
use minivmm::{Vm, VmConfig, VmError};

#[derive(Parser)]
#[command(name = "minivmm")]
#[command(about = "Boot a Linux kernel on KVM with tap networking and vhost-vsock")]
#[command(version)]
struct Cli {
    /// KVM control device.
    #[arg(short = 'D', long, default_value = "/dev/kvm")]
    kvm: PathBuf,

    /// Kernel image (bzImage or vmlinux).
    #[arg(short, long, default_value = "./bzImage")]
    kernel: PathBuf,

    /// Initial ramdisk.  Pass an empty string to boot without one.
    #[arg(short, long, default_value = "./initrd")]
    initrd: PathBuf,

    /// Kernel command line.
    #[arg(short, long, default_value = DEFAULT_CMDLINE)]
    params: String,

    /// Tap interface for the guest NIC.  Empty disables networking.
    #[arg(short, long, default_value = "tap")]
    tap: String,

    /// Number of vCPUs.
    #[arg(short, long, default_value = "1")]
    cpus: usize,

    /// Guest memory size, `number[gGmMkK]`, gigabytes when unsuffixed.
    #[arg(short, long, default_value = "1", value_parser = parse_memory)]
    memory: u64,

    /// Guest memory region `base@size@name`; repeatable.  Overrides
    /// `--memory`.  An empty base follows the previous region, an empty
    /// name maps anonymous memory.
    #[arg(short, long = "region")]
    region: Vec<String>,

    /// Vsock routes, `port=transport:address[,...]`.
    #[arg(short = 'R', long, value_parser = parse_route_list)]
    routes: Option<RouteList>,

    /// Vhost-vsock device.  Implied by `--routes` or `--cid`.
    #[arg(long)]
    vsock: Option<PathBuf>,

    /// Guest CID; random when omitted.
    #[arg(long, value_parser = parse_cid)]
    cid: Option<u32>,

    /// Feature bits to offer the vhost-vsock backend.
    #[arg(long, value_parser = parse_features)]
    vsock_features: Option<u64>,

    /// Do not forward stdin to the guest console.
    #[arg(long)]
    no_stdin: bool,
}

fn parse_memory(s: &str) -> Result<u64, String> {
    parse_size(s, "g").map_err(|e| e.to_string())
}

#[derive(Clone, Debug)]
struct RouteList(Vec<VsockRoute>);

fn parse_route_list(s: &str) -> Result<RouteList, String> {
    parse_routes(s).map(RouteList).map_err(|e| e.to_string())
}

fn parse_cid(s: &str) -> Result<u32, String> {
    let cid = parse_size(s, "").map_err(|e| e.to_string())?;
    validate_cid(cid).map_err(|e| e.to_string())
}

fn parse_features(s: &str) -> Result<u64, String> {
    parse_size(s, "").map_err(|e| e.to_string())
}

impl Cli {
    fn into_config(self) -> VmConfig {
        let routes = self.routes.map(|r| r.0).unwrap_or_default();
        let vsock_requested = self.vsock.is_some() || self.cid.is_some() || !routes.is_empty();
        let vsock = vsock_requested.then(|| VsockConfig {
            device: self
                .vsock
                .unwrap_or_else(|| PathBuf::from(VHOST_VSOCK_DEVICE)),
            cid: self.cid,
            features: self.vsock_features,
            routes,
        });

        VmConfig {
            kvm_path: self.kvm,
            kernel: self.kernel,
            initrd: (!self.initrd.as_os_str().is_empty()).then_some(self.initrd),
            cmdline: self.params,
            tap_name: (!self.tap.is_empty()).then_some(self.tap),
            num_vcpus: self.cpus,
            memory_size: self.memory,
            memory_regions: self.region,
            vsock,
            serial_input: !self.no_stdin,
        }
    }
}

fn run(config: VmConfig) -> Result<(), VmError> {
    info!(
        "booting {:?} with {} vCPU(s), {} MiB",
        config.kernel,
        config.num_vcpus,
        config.memory_size >> 20
    );
    let mut cids = CidAllocator::from_entropy();
    let mut vm = Vm::new(config, &mut cids)?;
    if let Some(vsock) = vm.vsock() {
        info!(
            "vsock CID {} with routes [{}]",
            vsock.cid(),
            format_routes(vsock.routes())
        );
    }
    vm.load_kernel()?;
    let reason = vm.run()?;
    info!("guest stopped: {reason:?}");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e} ({:?})", e.kind());
            let mut source = e.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("minivmm").chain(args.iter().copied()))
    }

    fn config(args: &[&str]) -> VmConfig {
        parse(args).unwrap().into_config()
    }

    #[test]
    fn defaults_match_library_defaults() {
        assert_eq!(config(&[]), VmConfig::default());
    }

    #[test]
    fn empty_tap_and_initrd_disable_them() {
        let cfg = config(&["-t", "", "-i", ""]);
        assert_eq!(cfg.tap_name, None);
        assert_eq!(cfg.initrd, None);
    }

    #[test]
    fn memory_defaults_to_gigabytes() {
        assert_eq!(config(&["-m", "2"]).memory_size, 2 << 30);
        assert_eq!(config(&["-m", "512m"]).memory_size, 512 << 20);
    }

    #[test]
    fn cid_implies_vsock() {
        let vsock = config(&["--cid", "42"]).vsock.unwrap();
        assert_eq!(vsock.cid, Some(42));
        assert_eq!(vsock.device, PathBuf::from(VHOST_VSOCK_DEVICE));
        assert!(vsock.routes.is_empty());
    }

    #[test]
    fn routes_and_regions() {
        let cfg = config(&["-R", "17010=unix:port", "-r", "0@1g@", "-r", "@1g@/tmp/ram"]);
        let vsock = cfg.vsock.unwrap();
        assert_eq!(vsock.routes.len(), 1);
        assert_eq!(vsock.routes[0].vm_port, 17010);
        assert_eq!(cfg.memory_regions, ["0@1g@", "@1g@/tmp/ram"]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--cid", "2"]).is_err());
        assert!(parse(&["-m", "1T"]).is_err());
        assert!(parse(&["-R", "17010=tcp:17010,18010unix:port"]).is_err());
    }
}

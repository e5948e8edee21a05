//! Boot orchestration.
//!
//! Wires the uevent stream to the probe pipeline, module loading, LUKS
//! unlocking, LVM activation and network bringup, then waits for the root
//! filesystem to materialize and performs switch-root. The mount timeout is
//! the single deadline everything else races against.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::FutureExt as _;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::blkinfo::{self, BlkFormat, BlkInfo};
use crate::cmdline::{BootArgs, DeviceRef};
use crate::config::{self, RuntimeConfig};
use crate::console;
use crate::kmsg;
use crate::luks;
use crate::lvm::{self, LvmScanner};
use crate::module::ModuleLoader;
use crate::mount;
use crate::net;
use crate::uevent::{self, Dispatcher, Uevent};

/// One record per block device, keyed by (major, minor). Parent links point
/// back into the arena by key, which keeps stacked dm/LVM/partition graphs
/// cycle-safe.
#[derive(Debug)]
struct BlockDevice {
    name: String,
    path: PathBuf,
    parent: Option<(u64, u64)>,
    info: Option<BlkInfo>,
}

#[derive(Debug, Clone)]
struct RootCandidate {
    path: PathBuf,
    fstype: String,
}

#[derive(Default)]
struct BootState {
    devices: HashMap<(u64, u64), BlockDevice>,
    /// devpath -> arena key, for resolving partition parents
    devpaths: HashMap<String, (u64, u64)>,
    luks_in_flight: HashSet<String>,
    root: Option<RootCandidate>,
    resume_configured: bool,
}

pub struct Boot {
    args: Arc<BootArgs>,
    config: Arc<RuntimeConfig>,
    state: Mutex<BootState>,
    /// separate from `state`: PV assembly runs dm ioctls and must not sit
    /// under the arena lock
    lvm: Arc<Mutex<LvmScanner>>,
    root_ready: Notify,
    net_tx: Option<mpsc::UnboundedSender<String>>,
}

/// The whole PID-1 lifecycle up to the execve of the real init.
pub async fn boot() -> Result<()> {
    mount::mount_dev()?;
    kmsg::init()?;
    info!("booster {} starting", env!("CARGO_PKG_VERSION"));

    mount::mount_pseudo_filesystems()?;

    let args = Arc::new(BootArgs::from_proc().context("unable to parse kernel command line")?);
    if args.debug {
        kmsg::enable_debug();
        if let Err(e) = kmsg::disable_kmsg_throttling() {
            debug!("unable to disable kmsg throttling: {:#}", e);
        }
    }
    debug!("kernel command line parsed: root={:?}", args.root);

    let config = config::load_runtime_config()
        .await
        .context("unable to load runtime config")?;

    if config.enable_virtual_console {
        tokio::spawn(async {
            if let Err(e) = console::setup_virtual_console().await {
                warn!("virtual console setup failed: {:#}", e);
            }
        });
    }

    let modules = Arc::new(ModuleLoader::new(
        args.module_params.clone(),
        args.disable_concurrent_module_loading,
    )?);

    // network only comes up when the config asks for it
    let net_tx = match &config.network {
        Some(net_config) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let net_config = net_config.clone();
            tokio::spawn(net::setup(net_config, rx));
            Some(tx)
        }
        None => None,
    };

    let boot = Arc::new(Boot {
        args: Arc::clone(&args),
        config: Arc::clone(&config),
        state: Mutex::new(BootState::default()),
        lvm: Arc::new(Mutex::new(LvmScanner::default())),
        root_ready: Notify::new(),
        net_tx,
    });

    // uevent plumbing: netlink first, then replay what we missed
    let mut events = uevent::listen()?;
    let dispatcher = build_dispatcher(&boot);
    {
        let dispatcher = dispatcher.clone();
        let modules = Arc::clone(&modules);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(modalias) = event.var("MODALIAS") {
                    let modalias = modalias.to_string();
                    let modules = Arc::clone(&modules);
                    tokio::spawn(async move {
                        let _ = modules.load_modalias(&modalias).await;
                    });
                }
                dispatcher.dispatch(event);
            }
        });
    }

    {
        let modules = Arc::clone(&modules);
        let force = config.force_load_modules();
        tokio::spawn(async move { modules.force_load(force).await });
    }

    uevent::replay_existing_devices(&dispatcher);
    {
        let modules = Arc::clone(&modules);
        tokio::spawn(async move {
            let modaliases = tokio::task::spawn_blocking(uevent::collect_modaliases)
                .await
                .unwrap_or_default();
            for modalias in modaliases {
                let _ = modules.load_modalias(&modalias).await;
            }
        });
    }

    // everything is wired up; now it is a race against the timeout
    let root = {
        let wait = boot.wait_for_root();
        match config.mount_timeout()? {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(root) => root,
                Err(_) => {
                    error!("Timeout waiting for root filesystem");
                    boot.dump_devices().await;
                    bail!("root filesystem did not appear within {:?}", timeout);
                }
            },
            None => wait.await,
        }
    };

    info!(
        "root filesystem {} ({}) is ready",
        root.path.display(),
        root.fstype
    );
    fsck_if_packaged(&root.path).await;
    mount::mount_root(&root.path, &root.fstype, &args.root_mount_options())?;

    mount::switch_root(&args.init).map(|_| ())
}

fn build_dispatcher(boot: &Arc<Boot>) -> Dispatcher {
    let mut dispatcher = Dispatcher::default();

    let boot_block = Arc::clone(boot);
    dispatcher.register("block", move |event| {
        let boot = Arc::clone(&boot_block);
        async move { boot.handle_block_event(event).await }.boxed()
    });

    let boot_net = Arc::clone(boot);
    dispatcher.register("net", move |event| {
        let boot = Arc::clone(&boot_net);
        async move {
            if let (Some(tx), Some(iface)) = (&boot.net_tx, event.var("INTERFACE")) {
                let _ = tx.send(iface.to_string());
            }
        }
        .boxed()
    });

    // pure observer: a driver registration confirms that a module ended up
    // bound to its devices (the vfio passthrough setups watch for this)
    dispatcher.register("drivers", move |event| {
        async move {
            debug!("driver {} {}", event.devpath, event.action);
        }
        .boxed()
    });

    dispatcher
}

impl Boot {
    /// What we did find, for the console log of a failed boot.
    async fn dump_devices(&self) {
        let state = self.state.lock().await;
        for device in state.devices.values() {
            let format = device
                .info
                .as_ref()
                .map(|i| i.format.to_string())
                .unwrap_or_else(|| "unprobed".to_string());
            error!("  seen {} ({})", device.path.display(), format);
        }
    }

    async fn wait_for_root(&self) -> RootCandidate {
        loop {
            let notified = self.root_ready.notified();
            if let Some(root) = self.state.lock().await.root.clone() {
                return root;
            }
            notified.await;
        }
    }

    async fn handle_block_event(self: Arc<Self>, event: Uevent) {
        match event.action.as_str() {
            "add" | "change" => {}
            "remove" => {
                if let Some(key) = device_numbers(&event) {
                    let mut state = self.state.lock().await;
                    if let Some(device) = state.devices.remove(&key) {
                        debug!("block device {} removed", device.name);
                    }
                    state.devpaths.remove(&event.devpath);
                }
                return;
            }
            _ => return,
        }

        let Some(devname) = event.devname() else {
            return;
        };
        let Some(key) = device_numbers(&event) else {
            return;
        };
        let path = Path::new("/dev").join(devname);

        {
            let mut state = self.state.lock().await;
            let parent = if event.var("DEVTYPE") == Some("partition") {
                event
                    .devpath
                    .rsplit_once('/')
                    .and_then(|(parent_path, _)| state.devpaths.get(parent_path).copied())
            } else {
                None
            };
            if let Some(parent_key) = parent {
                if let Some(parent_dev) = state.devices.get(&parent_key) {
                    debug!("{} is a partition of {}", devname, parent_dev.name);
                }
            }
            state.devpaths.insert(event.devpath.clone(), key);
            state.devices.insert(
                key,
                BlockDevice {
                    name: devname.to_string(),
                    path: path.clone(),
                    parent,
                    info: None,
                },
            );
        }

        self.probe_device(path, key).await;
    }

    /// Probe a device node and act on its classification. Boxed because
    /// unlocked and assembled devices re-enter the pipeline recursively.
    fn probe_device(
        self: Arc<Self>,
        path: PathBuf,
        key: (u64, u64),
    ) -> futures::future::BoxFuture<'static, ()> {
        async move { self.probe_device_inner(path, key).await }.boxed()
    }

    async fn probe_device_inner(self: Arc<Self>, path: PathBuf, key: (u64, u64)) {
        let probe_path = path.clone();
        let info =
            match tokio::task::spawn_blocking(move || blkinfo::read_blk_info(&probe_path)).await
            {
                Ok(Ok(info)) => info,
                Ok(Err(e)) => {
                    debug!("unable to probe {}: {:#}", path.display(), e);
                    return;
                }
                Err(e) => {
                    warn!("probe task for {} failed: {}", path.display(), e);
                    return;
                }
            };

        debug!(
            "{}: format={} uuid={} label={}",
            path.display(),
            info.format,
            info.uuid
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_default(),
            info.label.as_deref().unwrap_or(""),
        );

        {
            let mut state = self.state.lock().await;
            if let Some(device) = state.devices.get_mut(&key) {
                device.info = Some(info.clone());
            }
        }

        match info.format {
            BlkFormat::Luks1 | BlkFormat::Luks2 => self.handle_luks(path, &info).await,
            BlkFormat::LvmPv if self.config.enable_lvm => self.handle_lvm_pv(path).await,
            BlkFormat::LvmPv => {
                debug!("ignoring lvm pv {}: lvm support is disabled", path.display())
            }
            _ => self.handle_filesystem(path, &info).await,
        }
    }

    async fn handle_luks(self: Arc<Self>, path: PathBuf, info: &BlkInfo) {
        let Some(uuid) = info.uuid.as_ref().map(|u| u.to_string()) else {
            warn!("luks device {} has no uuid", path.display());
            return;
        };
        if !self.args.luks.wants(&uuid) {
            debug!(
                "luks volume {} is not required by the command line",
                uuid
            );
            return;
        }
        {
            let mut state = self.state.lock().await;
            if !state.luks_in_flight.insert(uuid.clone()) {
                return; // someone is already working on it
            }
        }

        let name = self.args.luks.mapping_name(&uuid);
        let options = self.args.luks.options.clone();
        let boot = Arc::clone(&self);
        tokio::spawn(async move {
            match luks::unlock_and_activate(path, name, options).await {
                Ok(node) => {
                    // the plaintext device re-enters the probe pipeline
                    if let Some(key) = stat_device(&node) {
                        boot.probe_device(node, key).await;
                    }
                }
                Err(e) => {
                    warn!("{:#}", e);
                    // leave it unresolved; the mount timeout decides
                }
            }
        });
    }

    async fn handle_lvm_pv(self: Arc<Self>, path: PathBuf) {
        // PV parsing and LV activation both block on disk and dm ioctls;
        // the owned guard travels into the blocking task
        let mut scanner = Arc::clone(&self.lvm).lock_owned().await;
        let pv_path = path.clone();
        let nodes = match tokio::task::spawn_blocking(move || {
            lvm::read_pv(&pv_path).map(|pv| scanner.pv_discovered(pv))
        })
        .await
        {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(e)) => {
                warn!("unable to read lvm pv {}: {:#}", path.display(), e);
                return;
            }
            Err(e) => {
                warn!("lvm task for {} failed: {}", path.display(), e);
                return;
            }
        };

        for node in nodes {
            if let Some(key) = stat_device(&node) {
                Arc::clone(&self).probe_device(node, key).await;
            }
        }
    }

    async fn handle_filesystem(self: Arc<Self>, path: PathBuf, info: &BlkInfo) {
        self.maybe_configure_resume(&path, info).await;

        let Some(root_ref) = &self.args.root else {
            return;
        };
        let matches = match root_ref {
            DeviceRef::Uuid(uuid) => info.uuid.as_ref() == Some(uuid),
            DeviceRef::Label(label) => info.label.as_deref() == Some(label.as_str()),
            DeviceRef::Path(root_path) => {
                *root_path == path || device_aliases(&path).contains(root_path)
            }
        };
        if !matches {
            return;
        }
        let Some(fstype) = info.format.kernel_fs_type() else {
            debug!(
                "{} matches the root reference but is {}, not a mountable filesystem",
                path.display(),
                info.format
            );
            return;
        };

        let mut state = self.state.lock().await;
        if state.root.is_none() {
            state.root = Some(RootCandidate {
                path,
                fstype: fstype.to_string(),
            });
            self.root_ready.notify_waiters();
        }
    }

    async fn maybe_configure_resume(&self, path: &Path, info: &BlkInfo) {
        let Some(resume_ref) = &self.args.resume else {
            return;
        };
        let matches = match resume_ref {
            DeviceRef::Uuid(uuid) => info.uuid.as_ref() == Some(uuid),
            DeviceRef::Label(label) => info.label.as_deref() == Some(label.as_str()),
            DeviceRef::Path(resume_path) => resume_path == path,
        };
        if !matches {
            return;
        }
        let mut state = self.state.lock().await;
        if state.resume_configured {
            return;
        }
        if let Some((major, minor)) = stat_device(path) {
            match std::fs::write("/sys/power/resume", format!("{}:{}", major, minor)) {
                Ok(()) => {
                    info!("resume device {} configured", path.display());
                    state.resume_configured = true;
                }
                Err(e) => warn!("unable to configure resume device: {}", e),
            }
        }
    }
}

/// Alternative names a dm node is reachable under, so `root=/dev/mapper/x`
/// and `root=/dev/vg/lv` both match whichever path the probe used.
fn device_aliases(path: &Path) -> Vec<PathBuf> {
    let mut aliases = Vec::new();
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return aliases;
    };
    if name.starts_with("dm-") {
        if let Ok(dm_name) =
            std::fs::read_to_string(format!("/sys/class/block/{}/dm/name", name))
        {
            aliases.push(Path::new("/dev/mapper").join(dm_name.trim_end()));
        }
    }
    if path.starts_with("/dev/mapper") {
        // vg-lv mapper names are also addressable as /dev/<vg>/<lv>
        if let Some((vg, lv)) = split_vg_lv(name) {
            aliases.push(Path::new("/dev").join(vg).join(lv));
        }
    }
    aliases
}

/// Undo dm name escaping: a single dash separates vg from lv, doubled
/// dashes belong to the names themselves.
fn split_vg_lv(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'-' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'-' {
                i += 2;
                continue;
            }
            let vg = name[..i].replace("--", "-");
            let lv = name[i + 1..].replace("--", "-");
            return Some((vg, lv));
        }
        i += 1;
    }
    None
}

fn device_numbers(event: &Uevent) -> Option<(u64, u64)> {
    let major = event.var("MAJOR")?.parse().ok()?;
    let minor = event.var("MINOR")?.parse().ok()?;
    Some((major, minor))
}

fn stat_device(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    let rdev = meta.rdev();
    Some((
        nix::sys::stat::major(rdev),
        nix::sys::stat::minor(rdev),
    ))
}

async fn fsck_if_packaged(dev: &Path) {
    const FSCK: &str = "/usr/bin/fsck";
    if !Path::new(FSCK).exists() {
        return;
    }
    info!("running fsck on {}", dev.display());
    match tokio::process::Command::new(FSCK)
        .arg("-y")
        .arg(dev)
        .status()
        .await
    {
        // 0 = clean, 1 = errors corrected; both are fine to mount
        Ok(status) if matches!(status.code(), Some(0) | Some(1)) => {}
        Ok(status) => warn!("fsck on {} exited with {}", dev.display(), status),
        Err(e) => warn!("unable to run fsck: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_vg_lv() {
        assert_eq!(
            split_vg_lv("booster_test_vg-booster_test_lv"),
            Some(("booster_test_vg".into(), "booster_test_lv".into()))
        );
        assert_eq!(
            split_vg_lv("my--vg-my--lv"),
            Some(("my-vg".into(), "my-lv".into()))
        );
        assert_eq!(split_vg_lv("cryptroot"), None);
    }

    #[test]
    fn test_device_numbers() {
        let event = uevent::parse_uevent(
            b"add@/devices/virtual/block/dm-0\0ACTION=add\0SUBSYSTEM=block\0MAJOR=254\0MINOR=3\0DEVNAME=dm-0\0",
        )
        .unwrap();
        assert_eq!(device_numbers(&event), Some((254, 3)));

        let no_numbers = uevent::parse_uevent(
            b"add@/devices/virtual/block/dm-0\0ACTION=add\0SUBSYSTEM=block\0",
        )
        .unwrap();
        assert_eq!(device_numbers(&no_numbers), None);
    }
}

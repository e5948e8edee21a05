//! Kernel command line parsing.
//!
//! The command line is the boot loader's half of the contract: it names the
//! root device, the LUKS volumes that have to be opened to reach it, and a
//! handful of booster-specific switches. Everything else that looks like
//! `module.param=value` is collected and handed to that module at load time,
//! the same way modprobe would.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::mount::MsFlags;

use crate::types::BlkUuid;

/// How the command line refers to a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    Uuid(BlkUuid),
    Label(String),
    Path(PathBuf),
}

impl DeviceRef {
    fn parse(value: &str) -> Result<Self> {
        // quotes may wrap the whole value or just the part after UUID=
        if let Some(uuid) = value.strip_prefix("UUID=") {
            let uuid = uuid.trim_matches('"');
            Ok(DeviceRef::Uuid(BlkUuid::parse(&uuid.to_lowercase())?))
        } else if let Some(label) = value.strip_prefix("LABEL=") {
            Ok(DeviceRef::Label(label.trim_matches('"').to_string()))
        } else {
            Ok(DeviceRef::Path(PathBuf::from(value)))
        }
    }
}

/// Mount options accumulated from `rootflags=`. Flag atoms fold into
/// `MsFlags`, anything the kernel does not treat as a flag is passed through
/// as filesystem-specific data.
#[derive(Debug, Clone, PartialEq)]
pub struct MountOptions {
    pub flags: MsFlags,
    pub data: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::empty(),
            data: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Apply one comma-separated option string. Later atoms win over earlier
    /// ones, so `ro,rw,ro` ends up read-only and `lazytime,nolazytime` ends
    /// up without MS_LAZYTIME.
    pub fn apply(&mut self, csv: &str) {
        for atom in csv.split(',').filter(|a| !a.is_empty()) {
            match atom {
                "defaults" => {}
                "ro" => self.flags.insert(MsFlags::MS_RDONLY),
                "rw" => self.flags.remove(MsFlags::MS_RDONLY),
                "nosuid" => self.flags.insert(MsFlags::MS_NOSUID),
                "suid" => self.flags.remove(MsFlags::MS_NOSUID),
                "nodev" => self.flags.insert(MsFlags::MS_NODEV),
                "dev" => self.flags.remove(MsFlags::MS_NODEV),
                "noexec" => self.flags.insert(MsFlags::MS_NOEXEC),
                "exec" => self.flags.remove(MsFlags::MS_NOEXEC),
                "sync" => self.flags.insert(MsFlags::MS_SYNCHRONOUS),
                "async" => self.flags.remove(MsFlags::MS_SYNCHRONOUS),
                "dirsync" => self.flags.insert(MsFlags::MS_DIRSYNC),
                "noatime" => self.flags.insert(MsFlags::MS_NOATIME),
                "atime" => self.flags.remove(MsFlags::MS_NOATIME),
                "nodiratime" => self.flags.insert(MsFlags::MS_NODIRATIME),
                "diratime" => self.flags.remove(MsFlags::MS_NODIRATIME),
                "relatime" => self.flags.insert(MsFlags::MS_RELATIME),
                "norelatime" => self.flags.remove(MsFlags::MS_RELATIME),
                "strictatime" => self.flags.insert(MsFlags::MS_STRICTATIME),
                "nostrictatime" => self.flags.remove(MsFlags::MS_STRICTATIME),
                "lazytime" => self.flags.insert(MsFlags::MS_LAZYTIME),
                "nolazytime" => self.flags.remove(MsFlags::MS_LAZYTIME),
                "mand" => self.flags.insert(MsFlags::MS_MANDLOCK),
                "nomand" => self.flags.remove(MsFlags::MS_MANDLOCK),
                "silent" => self.flags.insert(MsFlags::MS_SILENT),
                "loud" => self.flags.remove(MsFlags::MS_SILENT),
                other => {
                    if !self.data.iter().any(|d| d == other) {
                        self.data.push(other.to_string());
                    }
                }
            }
        }
    }

    pub fn data_string(&self) -> String {
        self.data.join(",")
    }
}

/// LUKS-related command line state.
#[derive(Debug, Clone, Default)]
pub struct LuksArgs {
    /// Volumes that must be opened before the root filesystem can appear,
    /// keyed by canonical lowercase UUID text.
    pub uuids: Vec<String>,
    /// Explicit `rd.luks.name=<uuid>=<name>` mappings.
    pub names: HashMap<String, String>,
    /// Activation options from `rd.luks.options=`.
    pub options: Vec<String>,
}

impl LuksArgs {
    /// The dm name a volume activates under, and the name used in the
    /// passphrase prompt.
    pub fn mapping_name(&self, uuid: &str) -> String {
        match self.names.get(uuid) {
            Some(name) => name.clone(),
            None => format!("luks-{}", uuid),
        }
    }

    /// True when the command line asks for this volume, either by
    /// `rd.luks.uuid=` or through a `rd.luks.name=` mapping.
    pub fn wants(&self, uuid: &str) -> bool {
        self.uuids.iter().any(|u| u == uuid) || self.names.contains_key(uuid)
    }
}

#[derive(Debug, Clone)]
pub struct BootArgs {
    pub root: Option<DeviceRef>,
    pub rootflags: MountOptions,
    /// Top-level `rw`/`ro` toggle; overrides whatever rootflags computed.
    pub rw_override: Option<bool>,
    pub init: PathBuf,
    pub resume: Option<DeviceRef>,
    pub luks: LuksArgs,
    pub debug: bool,
    pub disable_concurrent_module_loading: bool,
    /// Aggregated `module.param=value` pairs, keyed by normalized module
    /// name, value ready to pass to finit_module.
    pub module_params: HashMap<String, String>,
}

impl Default for BootArgs {
    fn default() -> Self {
        Self {
            root: None,
            rootflags: MountOptions::default(),
            rw_override: None,
            init: PathBuf::from("/sbin/init"),
            resume: None,
            luks: LuksArgs::default(),
            debug: false,
            disable_concurrent_module_loading: false,
            module_params: HashMap::new(),
        }
    }
}

impl BootArgs {
    pub fn parse(cmdline: &str) -> Result<Self> {
        let mut args = BootArgs::default();

        for token in tokenize(cmdline) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(unquote(v))),
                None => (token.as_str(), None),
            };

            match (key, value.as_deref()) {
                ("root", Some(v)) => {
                    args.root =
                        Some(DeviceRef::parse(v).with_context(|| format!("root={}", v))?)
                }
                ("rootflags", Some(v)) => args.rootflags.apply(v),
                ("rw", None) => args.rw_override = Some(true),
                ("ro", None) => args.rw_override = Some(false),
                ("init", Some(v)) => args.init = PathBuf::from(v),
                ("resume", Some(v)) => {
                    args.resume =
                        Some(DeviceRef::parse(v).with_context(|| format!("resume={}", v))?)
                }
                ("rd.luks.uuid", Some(v)) => args.luks.uuids.push(v.to_lowercase()),
                ("rd.luks.name", Some(v)) => {
                    let (uuid, name) = v
                        .split_once('=')
                        .with_context(|| format!("malformed rd.luks.name={}", v))?;
                    args.luks
                        .names
                        .insert(uuid.to_lowercase(), name.to_string());
                }
                ("rd.luks.options", Some(v)) => {
                    for opt in v.split(',').filter(|o| !o.is_empty()) {
                        if !args.luks.options.iter().any(|o| o == opt) {
                            args.luks.options.push(opt.to_string());
                        }
                    }
                }
                ("booster.debug", None) => args.debug = true,
                ("booster.disable_concurrent_module_loading", None) => {
                    args.disable_concurrent_module_loading = true
                }
                (key, Some(v))
                    if key.contains('.')
                        && !key.starts_with("rd.")
                        && !key.starts_with("booster.") =>
                {
                    // modprobe-style module parameter, e.g. vfio-pci.ids=1002:67df
                    let (module, param) = key.split_once('.').unwrap();
                    let module = normalize_module_name(module);
                    let entry = args.module_params.entry(module).or_default();
                    if !entry.is_empty() {
                        entry.push(' ');
                    }
                    entry.push_str(&format!("{}={}", param, v));
                }
                _ => {} // not ours; the kernel and the real init consume the rest
            }
        }

        Ok(args)
    }

    pub fn from_proc() -> Result<Self> {
        let cmdline =
            std::fs::read_to_string("/proc/cmdline").context("unable to read /proc/cmdline")?;
        Self::parse(cmdline.trim())
    }

    /// Mount flags and data for the root filesystem with the `rw`/`ro`
    /// toggle applied.
    pub fn root_mount_options(&self) -> MountOptions {
        let mut opts = self.rootflags.clone();
        match self.rw_override {
            Some(true) => opts.flags.remove(MsFlags::MS_RDONLY),
            Some(false) => opts.flags.insert(MsFlags::MS_RDONLY),
            None => {}
        }
        opts
    }
}

/// Module names use underscores internally; the command line convention
/// accepts dashes.
pub fn normalize_module_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Split on whitespace, but keep double-quoted spans intact.
fn tokenize(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in cmdline.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_by_uuid() {
        let args = BootArgs::parse(
            "root=UUID=5c92fc66-7315-408b-b652-176dc554d370 rootflags=user_xattr,nobarrier booster.debug",
        )
        .unwrap();
        assert_eq!(
            args.root,
            Some(DeviceRef::Uuid(
                BlkUuid::parse("5c92fc66-7315-408b-b652-176dc554d370").unwrap()
            ))
        );
        assert!(args.debug);
        assert_eq!(args.rootflags.data_string(), "user_xattr,nobarrier");
    }

    #[test]
    fn test_quoted_values() {
        let args = BootArgs::parse(
            "rd.luks.uuid=\"639b8fdd-36ba-443e-be3e-e5b335935502\" root=UUID=\"7bbf9363-eb42-4476-8c1c-9f1f4d091385\"",
        )
        .unwrap();
        assert_eq!(args.luks.uuids, vec!["639b8fdd-36ba-443e-be3e-e5b335935502"]);
        assert_eq!(
            args.root,
            Some(DeviceRef::Uuid(
                BlkUuid::parse("7bbf9363-eb42-4476-8c1c-9f1f4d091385").unwrap()
            ))
        );
    }

    #[test]
    fn test_rootflags_conflicts_last_wins() {
        let mut opts = MountOptions::default();
        opts.apply("user_xattr,noatime,nobarrier,nodev,dirsync,lazytime,nolazytime,dev,rw,ro");
        assert!(opts.flags.contains(MsFlags::MS_RDONLY));
        assert!(opts.flags.contains(MsFlags::MS_NOATIME));
        assert!(opts.flags.contains(MsFlags::MS_DIRSYNC));
        assert!(!opts.flags.contains(MsFlags::MS_LAZYTIME));
        assert!(!opts.flags.contains(MsFlags::MS_NODEV));
        assert_eq!(opts.data_string(), "user_xattr,nobarrier");
    }

    #[test]
    fn test_rw_toggle_overrides_rootflags() {
        let args = BootArgs::parse("root=/dev/sda rootflags=ro rw").unwrap();
        assert!(!args.root_mount_options().flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_luks_name_mapping() {
        let args = BootArgs::parse(
            "rd.luks.name=f0c89fd5-7e1e-4ecc-b310-8cd650bd5415=cryptroot root=/dev/mapper/cryptroot rd.luks.options=discard",
        )
        .unwrap();
        assert!(args.luks.wants("f0c89fd5-7e1e-4ecc-b310-8cd650bd5415"));
        assert_eq!(
            args.luks.mapping_name("f0c89fd5-7e1e-4ecc-b310-8cd650bd5415"),
            "cryptroot"
        );
        assert_eq!(args.luks.options, vec!["discard"]);
    }

    #[test]
    fn test_luks_default_mapping_name() {
        let args =
            BootArgs::parse("rd.luks.uuid=639b8fdd-36ba-443e-be3e-e5b335935502").unwrap();
        assert_eq!(
            args.luks.mapping_name("639b8fdd-36ba-443e-be3e-e5b335935502"),
            "luks-639b8fdd-36ba-443e-be3e-e5b335935502"
        );
    }

    #[test]
    fn test_module_params_aggregate() {
        let args =
            BootArgs::parse("vfio-pci.ids=1002:67df,1002:aaf0 vfio-pci.disable_vga=1 rw").unwrap();
        assert_eq!(
            args.module_params.get("vfio_pci").map(String::as_str),
            Some("ids=1002:67df,1002:aaf0 disable_vga=1")
        );
        assert_eq!(args.rw_override, Some(true));
    }

    #[test]
    fn test_init_override() {
        let args = BootArgs::parse("root=/dev/vda init=/usr/lib/systemd/systemd").unwrap();
        assert_eq!(args.init, PathBuf::from("/usr/lib/systemd/systemd"));
    }

    #[test]
    fn test_ignores_foreign_tokens() {
        let args = BootArgs::parse("quiet loglevel=3 nmi_watchdog=0 root=/dev/sda").unwrap();
        assert_eq!(args.root, Some(DeviceRef::Path(PathBuf::from("/dev/sda"))));
        assert!(args.module_params.is_empty());
    }
}

//! Kernel module loading.
//!
//! Modules ship in the image under `/usr/lib/modules` together with the
//! pre-computed `modules.dep`, `modules.builtin` and `modules.alias` files.
//! Loads are deduplicated so that no matter how many uevents ask for a
//! module, the kernel sees exactly one finit_module call for it per boot.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::io::Read;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use log::{debug, info, warn};
use nix::kmod::{finit_module, ModuleInitFlags};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use tokio::sync::{Mutex, Notify};

use crate::cmdline::normalize_module_name;

const MODULES_DIR: &str = "/usr/lib/modules";

/// Completion state shared between the task performing a load and everyone
/// waiting on it.
struct LoadState {
    done: OnceLock<bool>,
    notify: Notify,
}

enum Slot {
    InFlight(Arc<LoadState>),
    Done(bool),
}

pub struct ModuleLoader {
    dir: PathBuf,
    /// module name -> (file path, direct dependencies)
    modules: HashMap<String, (PathBuf, Vec<String>)>,
    builtin: HashSet<String>,
    aliases: Vec<(String, String)>,
    /// aggregated parameter strings from the kernel command line
    params: HashMap<String, String>,
    states: Mutex<HashMap<String, Slot>>,
    /// present when booster.disable_concurrent_module_loading is set
    serialize: Option<Mutex<()>>,
}

impl ModuleLoader {
    pub fn new(params: HashMap<String, String>, serialize_loads: bool) -> Result<Self> {
        Self::with_dir(Path::new(MODULES_DIR), params, serialize_loads)
    }

    pub fn with_dir(
        dir: &Path,
        params: HashMap<String, String>,
        serialize_loads: bool,
    ) -> Result<Self> {
        let dep_path = dir.join("modules.dep");
        let modules = match std::fs::read_to_string(&dep_path) {
            Ok(content) => parse_modules_dep(dir, &content),
            // An image without modules is valid (everything built into the kernel).
            Err(_) => {
                debug!("no {} found, assuming all modules are built-in", dep_path.display());
                HashMap::new()
            }
        };

        let builtin = std::fs::read_to_string(dir.join("modules.builtin"))
            .map(|content| parse_modules_builtin(&content))
            .unwrap_or_default();

        let aliases = std::fs::read_to_string(dir.join("modules.alias"))
            .map(|content| parse_modules_alias(&content))
            .unwrap_or_default();

        Ok(Self {
            dir: dir.to_path_buf(),
            modules,
            builtin,
            aliases,
            params,
            states: Mutex::new(HashMap::new()),
            serialize: serialize_loads.then(|| Mutex::new(())),
        })
    }

    /// Load a module and, transitively, its dependencies. Concurrent
    /// requests for the same module coalesce into a single load.
    pub fn load<'a>(&'a self, name: &str) -> BoxFuture<'a, Result<()>> {
        let name = normalize_module_name(name);
        async move {
            if self.builtin.contains(&name) {
                return Ok(());
            }

            enum Role {
                Owner(Arc<LoadState>),
                Waiter(Arc<LoadState>),
                Finished(bool),
            }

            let role = {
                let mut states = self.states.lock().await;
                match states.get(&name) {
                    Some(Slot::Done(ok)) => Role::Finished(*ok),
                    Some(Slot::InFlight(state)) => Role::Waiter(Arc::clone(state)),
                    None => {
                        let state = Arc::new(LoadState {
                            done: OnceLock::new(),
                            notify: Notify::new(),
                        });
                        states.insert(name.clone(), Slot::InFlight(Arc::clone(&state)));
                        Role::Owner(state)
                    }
                }
            };

            match role {
                Role::Finished(true) => Ok(()),
                Role::Finished(false) => bail!("module {} failed to load earlier", name),
                Role::Waiter(state) => loop {
                    let notified = state.notify.notified();
                    if let Some(ok) = state.done.get() {
                        if *ok {
                            return Ok(());
                        }
                        bail!("module {} failed to load", name);
                    }
                    notified.await;
                },
                Role::Owner(state) => {
                    let result = self.perform_load(&name).await;
                    let ok = result.is_ok();
                    let _ = state.done.set(ok);
                    self.states
                        .lock()
                        .await
                        .insert(name.clone(), Slot::Done(ok));
                    state.notify.notify_waiters();
                    result
                }
            }
        }
        .boxed()
    }

    async fn perform_load(&self, name: &str) -> Result<()> {
        let Some((path, deps)) = self.modules.get(name) else {
            bail!("unknown module {}", name);
        };

        try_join_all(deps.iter().map(|dep| self.load(dep))).await?;

        let params = self.params.get(name).cloned().unwrap_or_default();
        if params.is_empty() {
            info!("loading module {}", name);
        } else {
            info!("loading module {} params=\"{}\"", name, params);
        }

        let path = path.clone();
        let serialized = match &self.serialize {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let name_owned = name.to_string();
        tokio::task::spawn_blocking(move || insert_module(&path, &name_owned, &params))
            .await
            .context("module load task failed")??;
        drop(serialized);
        Ok(())
    }

    /// Load every module whose alias pattern matches the given modalias
    /// string from a uevent.
    pub async fn load_modalias(&self, modalias: &str) -> Result<()> {
        let matched: Vec<&str> = self
            .aliases
            .iter()
            .filter(|(pattern, _)| wildcard_match(pattern, modalias))
            .map(|(_, module)| module.as_str())
            .collect();

        for module in matched {
            if let Err(e) = self.load(module).await {
                debug!("modalias {}: {:#}", modalias, e);
            }
        }
        Ok(())
    }

    /// Kick off the config's `modules_force_load` list. Failures are
    /// reported but do not stop the boot.
    pub async fn force_load(self: Arc<Self>, modules: Vec<String>) {
        let loads = modules.into_iter().map(|m| {
            let loader = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = loader.load(&m).await {
                    warn!("unable to load module {}: {:#}", m, e);
                }
            })
        });
        for load in loads {
            let _ = load.await;
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.dir
    }
}

/// Read, decompress and insert a module file. Compressed modules are
/// unpacked into a memfd so finit_module still sees a file descriptor.
fn insert_module(path: &Path, name: &str, params: &str) -> Result<()> {
    let mut raw = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .with_context(|| format!("unable to read {}", path.display()))?;

    let image = match path.extension().and_then(|e| e.to_str()) {
        Some("xz") => {
            let mut out = Vec::new();
            xz2::read::XzDecoder::new(raw.as_slice())
                .read_to_end(&mut out)
                .with_context(|| format!("unable to decompress {}", path.display()))?;
            out
        }
        Some("zst") => zstd::stream::decode_all(raw.as_slice())
            .with_context(|| format!("unable to decompress {}", path.display()))?,
        _ => raw,
    };

    let memfd_name = CString::new(name).context("module name contains a NUL byte")?;
    let memfd = memfd_create(&memfd_name, MemFdCreateFlag::MFD_CLOEXEC)
        .context("unable to create memfd")?;
    let mut memfd_file = std::fs::File::from(memfd);
    memfd_file
        .write_all(&image)
        .context("unable to fill module memfd")?;

    let params_c = CString::new(params).context("module params contain a NUL byte")?;
    match finit_module(&memfd_file, &params_c, ModuleInitFlags::empty()) {
        Ok(()) => Ok(()),
        // someone else (the kernel itself, an earlier boot stage) beat us to it
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("unable to load module {}", name)),
    }
}

/// `modules.dep` lines look like
/// `kernel/fs/xfs/xfs.ko.zst: kernel/lib/libcrc32c.ko.zst`, paths relative
/// to the modules directory.
fn parse_modules_dep(dir: &Path, content: &str) -> HashMap<String, (PathBuf, Vec<String>)> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let Some((module, deps)) = line.split_once(':') else {
            continue;
        };
        let name = module_name_from_path(module);
        let deps = deps
            .split_whitespace()
            .map(module_name_from_path)
            .collect();
        map.insert(name, (dir.join(module), deps));
    }
    map
}

fn parse_modules_builtin(content: &str) -> HashSet<String> {
    content.lines().map(module_name_from_path).collect()
}

fn parse_modules_alias(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some("alias"), Some(pattern), Some(module)) => {
                    Some((pattern.to_string(), normalize_module_name(module)))
                }
                _ => None,
            }
        })
        .collect()
}

fn module_name_from_path(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file
        .strip_suffix(".zst")
        .or_else(|| file.strip_suffix(".xz"))
        .unwrap_or(file);
    let stem = stem.strip_suffix(".ko").unwrap_or(stem);
    normalize_module_name(stem)
}

/// Glob match with `*` and `?`, which is all modules.alias patterns use.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();

    // iterative backtracking matcher
    let (mut pi, mut si) = (0, 0);
    let (mut star, mut star_si) = (None, 0);
    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_si = si;
            pi += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            star_si += 1;
            si = star_si;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modules_dep() {
        let content = "\
kernel/drivers/block/virtio_blk.ko.zst: kernel/drivers/virtio/virtio.ko.zst kernel/drivers/virtio/virtio_ring.ko.zst
kernel/drivers/virtio/virtio.ko.zst:
kernel/drivers/virtio/virtio_ring.ko.zst:
kernel/fs/ext4/ext4.ko.xz: kernel/lib/crc16.ko.xz
";
        let map = parse_modules_dep(Path::new("/usr/lib/modules"), content);
        let (path, deps) = &map["virtio_blk"];
        assert_eq!(
            path,
            &PathBuf::from("/usr/lib/modules/kernel/drivers/block/virtio_blk.ko.zst")
        );
        assert_eq!(deps, &["virtio", "virtio_ring"]);
        assert!(map["virtio"].1.is_empty());
        assert_eq!(map["ext4"].1, vec!["crc16"]);
    }

    #[test]
    fn test_module_name_normalization() {
        assert_eq!(
            module_name_from_path("kernel/drivers/vfio/pci/vfio-pci.ko.zst"),
            "vfio_pci"
        );
        assert_eq!(module_name_from_path("ext4.ko"), "ext4");
        assert_eq!(module_name_from_path("plain"), "plain");
    }

    #[test]
    fn test_parse_modules_alias() {
        let content = "\
# this file is generated
alias pci:v00001AF4d00001001sv*sd*bc*sc*i* virtio_blk
alias fs-ext4 ext4
";
        let aliases = parse_modules_alias(content);
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0].1, "virtio_blk");
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match(
            "pci:v00001AF4d00001001sv*sd*bc*sc*i*",
            "pci:v00001AF4d00001001sv00001AF4sd00000002bc01sc00i00"
        ));
        assert!(!wildcard_match(
            "pci:v00001AF4d00001001sv*",
            "pci:v00001AF4d00001042sv00001AF4"
        ));
        assert!(wildcard_match("fs-ext4", "fs-ext4"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "ac"));
    }

    #[tokio::test]
    async fn test_unknown_module_fails_once_and_is_remembered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("modules.dep"), "").unwrap();
        let loader =
            ModuleLoader::with_dir(dir.path(), HashMap::new(), false).unwrap();

        assert!(loader.load("no_such_module").await.is_err());
        // second failure comes from the recorded state, not a new attempt
        let err = loader.load("no_such_module").await.unwrap_err();
        assert!(err.to_string().contains("failed to load earlier"));
    }

    #[tokio::test]
    async fn test_builtin_modules_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("modules.dep"), "").unwrap();
        std::fs::write(
            dir.path().join("modules.builtin"),
            "kernel/fs/ext4/ext4.ko\n",
        )
        .unwrap();
        let loader =
            ModuleLoader::with_dir(dir.path(), HashMap::new(), false).unwrap();
        assert!(loader.load("ext4").await.is_ok());
    }
}

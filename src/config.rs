//! Runtime configuration embedded in the initramfs image.
//!
//! The generator serializes the subset of its configuration the runtime
//! cares about to `/etc/booster.yaml` inside the image. The file is absent
//! from minimal images, in which case every field takes its default.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use tokio::sync::RwLock;

const CONFIG_PATH: &str = "/etc/booster.yaml";

/// Early-userspace network setup. Absent means the network stays down.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Comma-separated MAC addresses of the interfaces to bring up. Empty
    /// means all of them.
    #[serde(default)]
    pub interfaces: Option<String>,

    #[serde(default)]
    pub dhcp: bool,

    /// Static address in CIDR form, e.g. `10.0.2.15/24`.
    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub gateway: Option<String>,

    #[serde(default)]
    pub dns_servers: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: Option<NetworkConfig>,

    /// Comma-separated module names to load unconditionally at boot.
    #[serde(default)]
    pub modules_force_load: Option<String>,

    /// How long to wait for the root filesystem, e.g. `10s`. No value means
    /// wait forever.
    #[serde(default)]
    pub mount_timeout: Option<String>,

    #[serde(default)]
    pub enable_lvm: bool,

    /// Set up console font and keymap with the resources packaged in the
    /// image.
    #[serde(default, rename = "vconsole")]
    pub enable_virtual_console: bool,
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(RuntimeConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("unable to parse {}", path.display()))
    }

    pub fn force_load_modules(&self) -> Vec<String> {
        match &self.modules_force_load {
            Some(csv) => csv
                .split(',')
                .filter(|m| !m.is_empty())
                .map(crate::cmdline::normalize_module_name)
                .collect(),
            None => Vec::new(),
        }
    }

    /// A zero timeout means wait forever, which is how the generator spells
    /// "no timeout configured".
    pub fn mount_timeout(&self) -> Result<Option<Duration>> {
        match &self.mount_timeout {
            Some(s) => Ok(Some(parse_duration(s)?).filter(|d| !d.is_zero())),
            None => Ok(None),
        }
    }
}

/// Parse durations of the `500ms`/`10s`/`2m`/`1h` form.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("duration {:?} is missing a unit", s))?;
    let (num, unit) = s.split_at(split);
    let num: u64 = num
        .parse()
        .with_context(|| format!("invalid duration {:?}", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => bail!("unknown duration unit {:?}", unit),
    }
}

lazy_static! {
    static ref RUNTIME_CONFIG: RwLock<Arc<RuntimeConfig>> =
        RwLock::new(Arc::new(RuntimeConfig::default()));
}

pub async fn load_runtime_config() -> Result<Arc<RuntimeConfig>> {
    let config = Arc::new(RuntimeConfig::load(CONFIG_PATH)?);
    *RUNTIME_CONFIG.write().await = Arc::clone(&config);
    Ok(config)
}

pub async fn runtime_config() -> Arc<RuntimeConfig> {
    Arc::clone(&*RUNTIME_CONFIG.read().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full() {
        let raw = r#"
network:
  interfaces: 52-54-00-12-34-53,52:54:00:12:34:56
  dhcp: true
modules_force_load: vfio_pci,vfio,vfio_iommu_type1,vfio_virqfd
mount_timeout: 10s
enable_lvm: true
vconsole: true
"#;
        let config: RuntimeConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(
            config.network,
            Some(NetworkConfig {
                interfaces: Some("52-54-00-12-34-53,52:54:00:12:34:56".into()),
                dhcp: true,
                ip: None,
                gateway: None,
                dns_servers: None,
            })
        );
        assert_eq!(
            config.force_load_modules(),
            vec!["vfio_pci", "vfio", "vfio_iommu_type1", "vfio_virqfd"]
        );
        assert_eq!(
            config.mount_timeout().unwrap(),
            Some(Duration::from_secs(10))
        );
        assert!(config.enable_lvm);
        assert!(config.enable_virtual_console);
    }

    #[test]
    fn test_deserialize_static_network() {
        let raw = r#"
network:
  ip: 10.0.2.15/24
  gateway: 10.0.2.255
  dns_servers: 10.0.2.3
"#;
        let config: RuntimeConfig = serde_yaml::from_str(raw).unwrap();
        let net = config.network.unwrap();
        assert!(!net.dhcp);
        assert_eq!(net.ip.as_deref(), Some("10.0.2.15/24"));
        assert_eq!(net.gateway.as_deref(), Some("10.0.2.255"));
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.mount_timeout().unwrap().is_none());
        assert!(config.force_load_modules().is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<RuntimeConfig>("no_such_field: 1").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("tomorrow").is_err());
    }

    #[test]
    fn test_zero_mount_timeout_means_forever() {
        let config: RuntimeConfig = serde_yaml::from_str("mount_timeout: 0s").unwrap();
        assert_eq!(config.mount_timeout().unwrap(), None);
    }
}

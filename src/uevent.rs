//! Kernel uevent engine.
//!
//! A netlink socket delivers device add/change/remove notifications, which
//! drive everything else: block devices get probed, MODALIAS values get
//! turned into module loads, network interfaces get configured. Devices
//! that appeared before the socket was open are covered by replaying
//! synthesized add events from sysfs.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use log::{debug, warn};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: String,
    pub devpath: String,
    pub subsystem: String,
    pub seqnum: Option<u64>,
    pub vars: HashMap<String, String>,
}

impl Uevent {
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn devname(&self) -> Option<&str> {
        self.var("DEVNAME")
    }
}

/// Parse one netlink datagram: a `action@devpath` header followed by
/// NUL-separated KEY=VALUE pairs. Returns None for datagrams that are not
/// kernel uevents (e.g. libudev traffic) or are malformed.
pub fn parse_uevent(datagram: &[u8]) -> Option<Uevent> {
    let mut fields = datagram.split(|b| *b == 0);
    let header = std::str::from_utf8(fields.next()?).ok()?;
    let (action, devpath) = header.split_once('@')?;

    let mut vars = HashMap::new();
    for field in fields {
        if field.is_empty() {
            continue;
        }
        let Ok(field) = std::str::from_utf8(field) else {
            return None;
        };
        let (key, value) = field.split_once('=')?;
        vars.insert(key.to_string(), value.to_string());
    }

    let subsystem = vars.get("SUBSYSTEM").cloned().unwrap_or_default();
    let seqnum = vars.get("SEQNUM").and_then(|s| s.parse().ok());

    Some(Uevent {
        action: action.to_string(),
        devpath: devpath.to_string(),
        subsystem,
        seqnum,
        vars,
    })
}

type Handler = Arc<dyn Fn(Uevent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Subsystem -> handler table, filled in once at startup.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl Dispatcher {
    pub fn register<F>(&mut self, subsystem: &'static str, handler: F)
    where
        F: Fn(Uevent) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers.insert(subsystem, Arc::new(handler));
    }

    pub fn dispatch(&self, event: Uevent) {
        debug!(
            "udev event Subsystem:{} Devpath:{} Action:{} Seqnum:{}",
            event.subsystem,
            event.devpath,
            event.action,
            event
                .seqnum
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if let Some(handler) = self.handlers.get(event.subsystem.as_str()) {
            tokio::spawn(handler(event));
        }
    }
}

/// Start the netlink reader. Events flow through the returned channel until
/// the process execs away.
pub fn listen() -> Result<mpsc::UnboundedReceiver<Uevent>> {
    let sock = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        Some(SockProtocol::NetlinkKObjectUEvent),
    )
    .context("unable to open uevent netlink socket")?;

    // group 1 is where the kernel broadcasts
    bind(sock.as_raw_fd(), &NetlinkAddr::new(std::process::id(), 1))
        .context("unable to bind uevent netlink socket")?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let len = match recv(sock.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => return,
                Ok(len) => len,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("uevent socket read failed: {}", e);
                    return;
                }
            };
            match parse_uevent(&buf[..len]) {
                Some(event) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                None => warn!("dropping malformed uevent datagram ({} bytes)", len),
            }
        }
    });

    Ok(rx)
}

/// Synthesize an add event for a device directory under
/// /sys/class/<subsystem>, from the attributes its `uevent` file carries.
fn synthesize_add(class_dir: &Path, name: &str, subsystem: &str) -> Option<Uevent> {
    let entry = class_dir.join(name);
    let resolved = std::fs::canonicalize(&entry).ok()?;
    let resolved = resolved.to_string_lossy();
    let devpath = resolved.strip_prefix("/sys")?.to_string();

    let mut vars = HashMap::new();
    vars.insert("ACTION".to_string(), "add".to_string());
    vars.insert("DEVPATH".to_string(), devpath.clone());
    vars.insert("SUBSYSTEM".to_string(), subsystem.to_string());
    if let Ok(content) = std::fs::read_to_string(entry.join("uevent")) {
        for line in content.lines() {
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }
    if subsystem == "net" {
        vars.entry("INTERFACE".to_string())
            .or_insert_with(|| name.to_string());
    }

    Some(Uevent {
        action: "add".to_string(),
        devpath,
        subsystem: subsystem.to_string(),
        seqnum: None,
        vars,
    })
}

/// Replay add events for block devices and network interfaces that existed
/// before the netlink socket was opened.
pub fn replay_existing_devices(dispatcher: &Dispatcher) {
    for subsystem in ["block", "net"] {
        let class_dir = Path::new("/sys/class").join(subsystem);
        let Ok(entries) = std::fs::read_dir(&class_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(event) = synthesize_add(&class_dir, &name, subsystem) {
                dispatcher.dispatch(event);
            }
        }
    }
}

/// Walk /sys/devices and collect every modalias value published before we
/// started listening; their driver modules still need loading.
pub fn collect_modaliases() -> Vec<String> {
    let mut result = Vec::new();
    let mut stack = vec![std::path::PathBuf::from("/sys/devices")];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if entry.file_name() == "modalias" {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    let value = content.trim();
                    if !value.is_empty() {
                        result.push(value.to_string());
                    }
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uevent() {
        let datagram =
            b"add@/devices/pci0000:00/0000:00:04.0/virtio1/block/vda\0ACTION=add\0DEVPATH=/devices/pci0000:00/0000:00:04.0/virtio1/block/vda\0SUBSYSTEM=block\0MAJOR=254\0MINOR=0\0DEVNAME=vda\0DEVTYPE=disk\0SEQNUM=1\0";
        let event = parse_uevent(datagram.as_slice()).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(event.subsystem, "block");
        assert_eq!(event.devname(), Some("vda"));
        assert_eq!(event.seqnum, Some(1));
        assert_eq!(event.var("DEVTYPE"), Some("disk"));
    }

    #[test]
    fn test_parse_uevent_drivers_subsystem() {
        let datagram = b"add@/bus/pci/drivers/vfio-pci\0ACTION=add\0DEVPATH=/bus/pci/drivers/vfio-pci\0SUBSYSTEM=drivers\0SEQNUM=5\0";
        let event = parse_uevent(datagram).unwrap();
        assert_eq!(event.subsystem, "drivers");
        assert_eq!(event.devpath, "/bus/pci/drivers/vfio-pci");
        assert_eq!(event.action, "add");
    }

    #[test]
    fn test_parse_rejects_non_kernel_traffic() {
        assert!(parse_uevent(b"libudev\0whatever").is_none());
        assert!(parse_uevent(b"").is_none());
        assert!(parse_uevent(b"no header separator\0A=B\0").is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_subsystem() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::default();
        let hits_clone = Arc::clone(&hits);
        dispatcher.register("block", move |_| {
            let hits = Arc::clone(&hits_clone);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        });

        let block = parse_uevent(
            b"add@/devices/virtual/block/dm-0\0ACTION=add\0SUBSYSTEM=block\0DEVNAME=dm-0\0",
        )
        .unwrap();
        let net = parse_uevent(
            b"add@/devices/virtual/net/eth0\0ACTION=add\0SUBSYSTEM=net\0INTERFACE=eth0\0",
        )
        .unwrap();
        dispatcher.dispatch(block);
        dispatcher.dispatch(net);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

//! Early-userspace network bringup.
//!
//! Needed only when a Tang pin has to reach its server. Interfaces are
//! selected by MAC address from the config; each one is brought up and
//! given either a static address or a DHCPv4 lease. Interfaces that never
//! appear are skipped silently, the mount timeout is the real deadline.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use rand::Rng as _;
use tokio::sync::mpsc;

use crate::config::NetworkConfig;

const DHCP_ATTEMPTS: u32 = 5;
const DHCP_REPLY_TIMEOUT: Duration = Duration::from_secs(4);
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Consume interface-appeared notifications from the uevent engine and
/// configure every interface the config selects.
pub async fn setup(config: NetworkConfig, mut interfaces: mpsc::UnboundedReceiver<String>) {
    let wanted = match config.interfaces.as_deref() {
        Some(csv) => match parse_mac_list(csv) {
            Ok(macs) => Some(macs),
            Err(e) => {
                warn!("malformed network interfaces list: {:#}", e);
                return;
            }
        },
        None => None,
    };

    let mut seen = HashSet::new();
    while let Some(name) = interfaces.recv().await {
        if name == "lo" || !seen.insert(name.clone()) {
            continue;
        }
        let Some(mac) = interface_mac(&name) else {
            continue;
        };
        if let Some(wanted) = &wanted {
            if !wanted.contains(&mac) {
                debug!("skipping network interface {} ({})", name, format_mac(&mac));
                continue;
            }
        }

        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = configure_interface(&name, &mac, &config).await {
                warn!("unable to configure network interface {}: {:#}", name, e);
            }
        });
    }
}

async fn configure_interface(name: &str, mac: &[u8; 6], config: &NetworkConfig) -> Result<()> {
    info!("bringing up network interface {}", name);
    link_up(name)?;

    if config.dhcp {
        dhcp_configure(name, mac).await?;
    } else if let Some(cidr) = &config.ip {
        let (addr, prefix) = parse_cidr(cidr)?;
        set_address(name, addr, mask_from_prefix(prefix))?;
        if let Some(gateway) = &config.gateway {
            let gateway: Ipv4Addr = gateway
                .parse()
                .with_context(|| format!("malformed gateway {}", gateway))?;
            add_default_route(name, gateway)?;
        }
        info!("network interface {} configured with {}", name, cidr);
    }

    if let Some(servers) = &config.dns_servers {
        let servers: Vec<Ipv4Addr> = servers
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().parse().context("malformed dns server"))
            .collect::<Result<_>>()?;
        write_resolv_conf(&servers)?;
    }
    Ok(())
}

pub fn parse_mac_list(csv: &str) -> Result<Vec<[u8; 6]>> {
    csv.split(',')
        .filter(|m| !m.is_empty())
        .map(parse_mac)
        .collect()
}

/// Accepts both `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let hex_str: String = s
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    let bytes = hex::decode(&hex_str).map_err(|_| anyhow!("malformed mac address {:?}", s))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("malformed mac address {:?}", s))
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn interface_mac(name: &str) -> Option<[u8; 6]> {
    let address = std::fs::read_to_string(format!("/sys/class/net/{}/address", name)).ok()?;
    parse_mac(address.trim()).ok()
}

pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .with_context(|| format!("address {:?} is missing a prefix length", s))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("malformed address {:?}", s))?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("malformed prefix length in {:?}", s))?;
    if prefix > 32 {
        bail!("prefix length {} out of range", prefix);
    }
    Ok((addr, prefix))
}

pub fn mask_from_prefix(prefix: u8) -> Ipv4Addr {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    Ipv4Addr::from(bits)
}

// ---- interface ioctls ----

fn ctl_socket() -> Result<OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("unable to open control socket")
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        bail!("interface name {} too long", name);
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.octets()),
        },
        sin_zero: [0; 8],
    };
    // sockaddr and sockaddr_in are layout-compatible for AF_INET
    unsafe { std::mem::transmute(sin) }
}

fn ioctl(fd: &OwnedFd, request: libc::c_ulong, argp: *mut libc::c_void) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, argp) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("ioctl failed");
    }
    Ok(())
}

fn link_up(name: &str) -> Result<()> {
    let fd = ctl_socket()?;
    let mut ifr = ifreq_for(name)?;
    ioctl(&fd, libc::SIOCGIFFLAGS, &mut ifr as *mut _ as *mut _)
        .with_context(|| format!("unable to read flags of {}", name))?;
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    ioctl(&fd, libc::SIOCSIFFLAGS, &mut ifr as *mut _ as *mut _)
        .with_context(|| format!("unable to bring {} up", name))
}

fn set_address(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
    let fd = ctl_socket()?;

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_addr = sockaddr_in(addr);
    ioctl(&fd, libc::SIOCSIFADDR, &mut ifr as *mut _ as *mut _)
        .with_context(|| format!("unable to set address on {}", name))?;

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_netmask = sockaddr_in(mask);
    ioctl(&fd, libc::SIOCSIFNETMASK, &mut ifr as *mut _ as *mut _)
        .with_context(|| format!("unable to set netmask on {}", name))
}

fn add_default_route(name: &str, gateway: Ipv4Addr) -> Result<()> {
    let fd = ctl_socket()?;
    let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
    route.rt_dst = sockaddr_in(Ipv4Addr::UNSPECIFIED);
    route.rt_genmask = sockaddr_in(Ipv4Addr::UNSPECIFIED);
    route.rt_gateway = sockaddr_in(gateway);
    route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as u16;

    let name_c = std::ffi::CString::new(name).context("bad interface name")?;
    route.rt_dev = name_c.as_ptr() as *mut libc::c_char;

    ioctl(&fd, libc::SIOCADDRT, &mut route as *mut _ as *mut _)
        .with_context(|| format!("unable to add default route via {}", gateway))
}

fn write_resolv_conf(servers: &[Ipv4Addr]) -> Result<()> {
    let mut content = String::new();
    for server in servers {
        content.push_str(&format!("nameserver {}\n", server));
    }
    std::fs::write(RESOLV_CONF, content).context("unable to write /etc/resolv.conf")
}

// ---- DHCPv4 ----

const DHCP_MAGIC: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const DHCP_DISCOVER: u8 = 1;
const DHCP_OFFER: u8 = 2;
const DHCP_REQUEST: u8 = 3;
const DHCP_ACK: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct DhcpReply {
    pub msg_type: u8,
    pub xid: u32,
    pub your_ip: Ipv4Addr,
    pub server_id: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub lease_secs: Option<u32>,
}

fn bootp_header(xid: u32, mac: &[u8; 6]) -> Vec<u8> {
    let mut packet = vec![0u8; 240];
    packet[0] = 1; // BOOTREQUEST
    packet[1] = 1; // ethernet
    packet[2] = 6; // hw address length
    packet[4..8].copy_from_slice(&xid.to_be_bytes());
    packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes()); // broadcast replies
    packet[28..34].copy_from_slice(mac);
    packet[236..240].copy_from_slice(&DHCP_MAGIC);
    packet
}

fn push_option(packet: &mut Vec<u8>, code: u8, data: &[u8]) {
    packet.push(code);
    packet.push(data.len() as u8);
    packet.extend_from_slice(data);
}

pub fn build_discover(xid: u32, mac: &[u8; 6]) -> Vec<u8> {
    let mut packet = bootp_header(xid, mac);
    push_option(&mut packet, 53, &[DHCP_DISCOVER]);
    push_option(&mut packet, 55, &[1, 3, 6]); // subnet, router, dns
    packet.push(255);
    packet
}

pub fn build_request(xid: u32, mac: &[u8; 6], requested: Ipv4Addr, server: Ipv4Addr) -> Vec<u8> {
    let mut packet = bootp_header(xid, mac);
    push_option(&mut packet, 53, &[DHCP_REQUEST]);
    push_option(&mut packet, 50, &requested.octets());
    push_option(&mut packet, 54, &server.octets());
    push_option(&mut packet, 55, &[1, 3, 6]);
    packet.push(255);
    packet
}

pub fn parse_reply(packet: &[u8]) -> Option<DhcpReply> {
    if packet.len() < 240 || packet[0] != 2 || packet[236..240] != DHCP_MAGIC {
        return None;
    }
    let mut reply = DhcpReply {
        msg_type: 0,
        xid: u32::from_be_bytes(packet[4..8].try_into().unwrap()),
        your_ip: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        server_id: None,
        subnet_mask: None,
        router: None,
        dns: Vec::new(),
        lease_secs: None,
    };

    let ipv4 = |data: &[u8]| -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(
            *data.first()?,
            *data.get(1)?,
            *data.get(2)?,
            *data.get(3)?,
        ))
    };

    let mut pos = 240;
    while pos < packet.len() {
        let code = packet[pos];
        if code == 255 {
            break;
        }
        if code == 0 {
            pos += 1;
            continue;
        }
        let len = *packet.get(pos + 1)? as usize;
        let data = packet.get(pos + 2..pos + 2 + len)?;
        match code {
            53 => reply.msg_type = *data.first()?,
            54 => reply.server_id = ipv4(data),
            1 => reply.subnet_mask = ipv4(data),
            3 => reply.router = ipv4(data),
            51 => reply.lease_secs = Some(u32::from_be_bytes(data.try_into().ok()?)),
            6 => {
                for server in data.chunks_exact(4) {
                    reply.dns.push(ipv4(server)?);
                }
            }
            _ => {}
        }
        pos += 2 + len;
    }

    (reply.msg_type != 0).then_some(reply)
}

async fn dhcp_configure(name: &str, mac: &[u8; 6]) -> Result<()> {
    let mut delay = Duration::from_millis(500);
    let mut last_err = None;
    for attempt in 0..DHCP_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(8));
        }
        match dhcp_exchange(name, mac).await {
            Ok(ack) => return apply_lease(name, &ack),
            Err(e) => {
                debug!("dhcp attempt {} on {} failed: {:#}", attempt + 1, name, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("dhcp failed")))
        .with_context(|| format!("dhcp gave up on {}", name))
}

async fn dhcp_exchange(name: &str, mac: &[u8; 6]) -> Result<DhcpReply> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 68)).context("unable to bind udp/68")?;
    socket.set_broadcast(true).context("unable to enable broadcast")?;
    nix::sys::socket::setsockopt(
        &socket,
        nix::sys::socket::sockopt::BindToDevice,
        &std::ffi::OsString::from(name),
    )
    .context("unable to bind socket to interface")?;
    socket
        .set_nonblocking(true)
        .context("unable to make socket non-blocking")?;
    let socket = tokio::net::UdpSocket::from_std(socket).context("unable to wrap socket")?;

    let xid: u32 = rand::thread_rng().gen();
    socket
        .send_to(&build_discover(xid, mac), ("255.255.255.255", 67))
        .await
        .context("unable to send DISCOVER")?;

    let offer = wait_reply(&socket, xid, DHCP_OFFER).await?;
    let server = offer.server_id.context("OFFER carries no server id")?;
    debug!(
        "dhcp offer on {}: {} from {}",
        name, offer.your_ip, server
    );

    socket
        .send_to(
            &build_request(xid, mac, offer.your_ip, server),
            ("255.255.255.255", 67),
        )
        .await
        .context("unable to send REQUEST")?;

    wait_reply(&socket, xid, DHCP_ACK).await
}

async fn wait_reply(socket: &tokio::net::UdpSocket, xid: u32, wanted: u8) -> Result<DhcpReply> {
    let deadline = tokio::time::Instant::now() + DHCP_REPLY_TIMEOUT;
    let mut buf = vec![0u8; 1500];
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("timed out waiting for dhcp reply")?;
        let (len, _) = tokio::time::timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| anyhow!("timed out waiting for dhcp reply"))?
            .context("udp receive failed")?;
        if let Some(reply) = parse_reply(&buf[..len]) {
            if reply.xid == xid && reply.msg_type == wanted {
                return Ok(reply);
            }
        }
    }
}

fn apply_lease(name: &str, ack: &DhcpReply) -> Result<()> {
    let mask = ack.subnet_mask.unwrap_or_else(|| mask_from_prefix(24));
    set_address(name, ack.your_ip, mask)?;
    if let Some(router) = ack.router {
        add_default_route(name, router)?;
    }
    if !ack.dns.is_empty() {
        write_resolv_conf(&ack.dns)?;
    }
    info!(
        "network interface {} leased {} (lease {}s)",
        name,
        ack.your_ip,
        ack.lease_secs.unwrap_or(0)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_both_separators() {
        assert_eq!(
            parse_mac("52:54:00:12:34:56").unwrap(),
            [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]
        );
        assert_eq!(
            parse_mac("52-54-00-12-34-53").unwrap(),
            [0x52, 0x54, 0x00, 0x12, 0x34, 0x53]
        );
        assert!(parse_mac("not a mac").is_err());
        assert!(parse_mac("52:54:00").is_err());
    }

    #[test]
    fn test_parse_mac_list() {
        let macs =
            parse_mac_list("52-54-00-12-34-53,52:54:00:12:34:56,52:54:00:12:34:57").unwrap();
        assert_eq!(macs.len(), 3);
    }

    #[test]
    fn test_parse_cidr() {
        let (addr, prefix) = parse_cidr("10.0.2.15/24").unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(prefix, 24);
        assert_eq!(mask_from_prefix(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(mask_from_prefix(0), Ipv4Addr::UNSPECIFIED);
        assert!(parse_cidr("10.0.2.15").is_err());
        assert!(parse_cidr("10.0.2.15/40").is_err());
    }

    #[test]
    fn test_dhcp_discover_layout() {
        let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        let packet = build_discover(0xdeadbeef, &mac);
        assert_eq!(packet[0], 1);
        assert_eq!(&packet[4..8], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&packet[28..34], &mac);
        assert_eq!(&packet[236..240], &DHCP_MAGIC);
        assert_eq!(packet[240..243], [53, 1, DHCP_DISCOVER]);
        assert_eq!(*packet.last().unwrap(), 255);
    }

    #[test]
    fn test_dhcp_reply_roundtrip() {
        let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        // emulate a server ACK to our REQUEST
        let mut packet = bootp_header(0x1234, &mac);
        packet[0] = 2; // BOOTREPLY
        packet[16..20].copy_from_slice(&[10, 0, 2, 15]);
        push_option(&mut packet, 53, &[DHCP_ACK]);
        push_option(&mut packet, 54, &[10, 0, 2, 2]);
        push_option(&mut packet, 1, &[255, 255, 255, 0]);
        push_option(&mut packet, 3, &[10, 0, 2, 2]);
        push_option(&mut packet, 6, &[10, 0, 2, 3, 8, 8, 8, 8]);
        push_option(&mut packet, 51, &86400u32.to_be_bytes());
        packet.push(255);

        let reply = parse_reply(&packet).unwrap();
        assert_eq!(reply.msg_type, DHCP_ACK);
        assert_eq!(reply.xid, 0x1234);
        assert_eq!(reply.your_ip, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(reply.server_id, Some(Ipv4Addr::new(10, 0, 2, 2)));
        assert_eq!(reply.subnet_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(reply.router, Some(Ipv4Addr::new(10, 0, 2, 2)));
        assert_eq!(
            reply.dns,
            vec![Ipv4Addr::new(10, 0, 2, 3), Ipv4Addr::new(8, 8, 8, 8)]
        );
        assert_eq!(reply.lease_secs, Some(86400));
    }

    #[test]
    fn test_parse_reply_rejects_garbage() {
        assert!(parse_reply(&[0u8; 100]).is_none());
        assert!(parse_reply(&[0u8; 300]).is_none()); // not a BOOTREPLY
    }
}

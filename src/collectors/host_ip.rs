use crate::collectors::{HostIpSource, SampleError};
use if_addrs::IfAddr;
use std::net::Ipv4Addr;

pub struct InterfaceHostIp;

impl HostIpSource for InterfaceHostIp {
    fn preferred_ip(&mut self) -> Result<String, SampleError> {
        let interfaces = if_addrs::get_if_addrs().map_err(|e| SampleError::ToolFailed {
            tool: "getifaddrs",
            message: e.to_string(),
        })?;

        let candidates: Vec<Ipv4Addr> = interfaces
            .iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match &iface.addr {
                IfAddr::V4(v4) => Some(v4.ip),
                IfAddr::V6(_) => None,
            })
            .filter(|ip| !ip.is_loopback() && !ip.is_link_local() && !ip.is_multicast())
            .collect();

        Ok(pick_preferred_ipv4(&candidates)
            .map(|ip| ip.to_string())
            .unwrap_or_default())
    }
}

/// Home-router subnet first, then any 192.168/16, then other private ranges, then whatever
/// came first.
pub fn pick_preferred_ipv4(candidates: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    let by = |pred: fn(&Ipv4Addr) -> bool| candidates.iter().copied().find(|ip| pred(ip));

    by(|ip| matches!(ip.octets(), [192, 168, 1, _]))
        .or_else(|| by(|ip| matches!(ip.octets(), [192, 168, _, _])))
        .or_else(|| by(Ipv4Addr::is_private))
        .or_else(|| candidates.first().copied())
}

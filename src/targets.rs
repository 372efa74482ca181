use anyhow::{bail, Context, Result};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Upper bound on hosts a single target string may expand to.
pub const MAX_HOSTS: usize = 65_536;

/// Expand a scan target into host addresses.
///
/// The target is a comma separated list of IP addresses and CIDR networks.
/// Duplicates are dropped, first appearance wins.
pub fn expand_target(target: &str) -> Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for item in target.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let hosts = if item.contains('/') {
            let net = item
                .parse::<IpNet>()
                .with_context(|| format!("invalid CIDR: {item}"))?;
            match net {
                IpNet::V4(n4) => {
                    let size = 1u64 << (32 - u32::from(n4.prefix_len()));
                    if size > MAX_HOSTS as u64 {
                        bail!("target expands to more than {MAX_HOSTS} hosts: {item}");
                    }
                }
                IpNet::V6(n6) if n6.prefix_len() < 128 => {
                    bail!("IPv6 networks are not supported: {item}");
                }
                IpNet::V6(_) => {}
            }
            expand_cidr_to_ips(net)
        } else {
            let ip = item
                .parse::<IpAddr>()
                .with_context(|| format!("invalid IP: {item}"))?;
            vec![ip]
        };
        for ip in hosts {
            if seen.insert(ip) {
                out.push(ip);
            }
        }
        if out.len() > MAX_HOSTS {
            bail!("target expands to more than {MAX_HOSTS} hosts");
        }
    }

    if out.is_empty() {
        bail!("target is empty");
    }
    Ok(out)
}

/// Expand a CIDR into individual IP addresses suitable for host scanning.
///
/// For IPv4, excludes the network and broadcast addresses unless the prefix is
/// /31 or /32. IPv6 networks expand only when they are a single host;
/// `expand_target` rejects wider ones before getting here.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(n6) if n6.prefix_len() == 128 => vec![IpAddr::V6(n6.addr())],
        IpNet::V6(_) => Vec::new(),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_ip() {
        let ips = expand_target("192.0.2.1").unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    }

    #[test]
    fn small_cidr_excludes_network_and_broadcast() {
        let ips = expand_target("192.168.1.0/30").unwrap();
        assert_eq!(
            ips,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            ]
        );
    }

    #[test]
    fn host_prefix_keeps_address() {
        let ips = expand_target("10.0.0.5/32").unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
    }

    #[test]
    fn list_is_deduplicated() {
        let ips = expand_target("10.0.0.1, 10.0.0.0/30,::1").unwrap();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ips[2], "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn invalid_targets_error() {
        assert!(expand_target("not-an-ip").is_err());
        assert!(expand_target("10.0.0.0/40").is_err());
        assert!(expand_target("").is_err());
        assert!(expand_target("10.0.0.0/8").is_err());
        let err = expand_target("10.0.0.1,2001:db8::/64").unwrap_err();
        assert!(err.to_string().contains("IPv6 networks are not supported"));
    }
}

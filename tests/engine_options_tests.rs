use ospd_rs::ports::parse_port_list;
use ospd_rs::targets::expand_target;
use std::net::{IpAddr, Ipv4Addr};

#[test]
fn port_list_with_ranges_and_duplicates() {
    let ports = parse_port_list("22, 80,443 8000-8002,8001").expect("parse ok");
    // Dedup, preserve order of first appearance
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_port_list("0").is_err());
}

#[test]
fn mixed_target_list() {
    let hosts = expand_target("10.0.0.0/30,192.0.2.9").expect("expand ok");
    assert_eq!(
        hosts,
        vec![
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)),
        ]
    );
}

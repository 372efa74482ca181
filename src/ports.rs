use anyhow::{bail, Context, Result};
use std::collections::HashSet;

/// Parse a scan's `ports` option into a deduplicated list of TCP ports.
///
/// Items are separated by commas or whitespace. Each item is a single port
/// (`80`) or an inclusive range (`8000-8010`). A leading `T:` marks TCP ports
/// and is accepted for compatibility with OSP port lists.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>> {
    let s = s.trim();
    let s = s.strip_prefix("T:").unwrap_or(s);
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for item in s.split(|c: char| c == ',' || c.is_whitespace()) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port(a.trim())
                .with_context(|| format!("invalid start in range: {item}"))?;
            let end =
                parse_port(b.trim()).with_context(|| format!("invalid end in range: {item}"))?;
            if start > end {
                bail!("invalid range {start}-{end} (start > end)");
            }
            out.extend((start..=end).filter(|p| seen.insert(*p)));
            continue;
        }

        let p = parse_port(item).with_context(|| format!("invalid port value: {item}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    if out.is_empty() {
        bail!("port list is empty");
    }
    Ok(out)
}

/// Commonly used TCP ports, scanned when a scan has no `ports` option.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 389, 443, 445, 465, 587, 631, 993, 995,
        1433, 1521, 2049, 3306, 3389, 5432, 5900, 6379, 8000, 8080, 8443, 9200, 27017,
    ];
    DEFAULT.to_vec()
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_list() {
        assert_eq!(parse_port_list("80,22, 443").unwrap(), vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_list("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn tcp_prefix_is_accepted() {
        assert_eq!(parse_port_list("T:21-22").unwrap(), vec![21, 22]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_list("70000").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("90-80").is_err());
        assert!(parse_port_list("http").is_err());
        assert!(parse_port_list(" , ").is_err());
    }

    #[test]
    fn default_has_common_ports() {
        let d = default_ports();
        assert!(d.contains(&80) && d.contains(&443));
    }
}

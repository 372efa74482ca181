use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::engine::EngineSettings;

const CERT_HINT: &str = "You can generate one using:\n  \
    openssl req -new -x509 -days 365 -nodes -out cert.pem -keyout cert.pem";

/// ospd-rs — Open Scanner Protocol daemon with an in-memory scan registry.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ospd-rs",
    version,
    about = "Open Scanner Protocol daemon with an in-memory scan registry.",
    long_about = None
)]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(short = 'p', long, default_value_t = 1234)]
    pub port: u32,

    /// Address to listen on.
    #[arg(short = 'b', long = "bind-address", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Private key file (PEM, PKCS#8).
    #[arg(short = 'k', long = "key-file", default_value = "cert.pem")]
    pub key_file: PathBuf,

    /// Certificate file (PEM).
    #[arg(short = 'c', long = "cert-file", default_value = "cert.pem")]
    pub cert_file: PathBuf,

    /// Scan execution timeout in seconds.
    #[arg(short = 't', long, default_value_t = 3600)]
    pub timeout: u64,

    /// Debug level: 0, 1 or 2.
    #[arg(short = 'd', long, default_value_t = 0)]
    pub debug: u8,

    /// Max concurrent TCP connect attempts per scan.
    #[arg(long, default_value_t = 1000)]
    pub concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "connect-timeout-ms", default_value_t = 400)]
    pub connect_timeout_ms: u64,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub debug: u8,
    pub engine: EngineSettings,
}

impl DaemonConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let port = match u16::try_from(cli.port) {
            Ok(p) if p > 0 => p,
            _ => bail!("--port must be in ]0,65535] interval"),
        };
        if cli.timeout <= 10 {
            bail!("--timeout should be at least 10 seconds");
        }
        if cli.debug > 2 {
            bail!("--debug must be 0, 1 or 2");
        }
        if cli.concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        require_file(&cli.key_file, "private key")?;
        require_file(&cli.cert_file, "public key")?;

        Ok(Self {
            bind_address: cli.bind_address,
            port,
            key_file: cli.key_file,
            cert_file: cli.cert_file,
            debug: cli.debug,
            engine: EngineSettings {
                concurrency: cli.concurrency,
                connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
                scan_timeout: Duration::from_secs(cli.timeout),
            },
        })
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{}: {what} file not found.\n{CERT_HINT}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem_file() -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "placeholder").unwrap();
        f
    }

    fn parse(extra: &[&str], pem: &NamedTempFile) -> Result<DaemonConfig> {
        let path = pem.path().to_str().unwrap();
        let mut args = vec!["ospd-rs", "-k", path, "-c", path];
        args.extend_from_slice(extra);
        DaemonConfig::from_cli(Cli::try_parse_from(args)?)
    }

    #[test]
    fn defaults() {
        let pem = pem_file();
        let cfg = parse(&[], &pem).unwrap();
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.bind_address.to_string(), "0.0.0.0");
        assert_eq!(cfg.debug, 0);
        assert_eq!(cfg.engine.scan_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.engine.concurrency, 1000);
    }

    #[test]
    fn port_range_is_checked() {
        let pem = pem_file();
        assert!(parse(&["-p", "0"], &pem).is_err());
        assert!(parse(&["-p", "65536"], &pem).is_err());
        assert_eq!(parse(&["-p", "65535"], &pem).unwrap().port, 65535);
    }

    #[test]
    fn timeout_must_exceed_ten_seconds() {
        let pem = pem_file();
        let err = parse(&["-t", "10"], &pem).unwrap_err();
        assert!(err.to_string().contains("--timeout"));
        assert!(parse(&["-t", "11"], &pem).is_ok());
    }

    #[test]
    fn debug_level_is_checked() {
        let pem = pem_file();
        assert!(parse(&["-d", "3"], &pem).is_err());
        assert_eq!(parse(&["-d", "2"], &pem).unwrap().debug, 2);
    }

    #[test]
    fn missing_key_file_is_rejected() {
        let cli = Cli::try_parse_from(["ospd-rs", "-k", "/nonexistent/key.pem"]).unwrap();
        let err = DaemonConfig::from_cli(cli).unwrap_err().to_string();
        assert!(err.contains("private key file not found"));
        assert!(err.contains("openssl req"));
    }
}

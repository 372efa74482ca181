//! TCP connect scan engine that reports into the scan registry.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RegistryResult;
use crate::registry::{ScanRegistry, PROGRESS_COMPLETE};
use crate::{ports, targets};

/// Option keys the engine understands.
pub const OPT_PORTS: &str = "ports";
pub const OPT_CONCURRENCY: &str = "concurrency";
pub const OPT_TIMEOUT_MS: &str = "timeout_ms";

const MAX_CONCURRENCY: usize = 5_000;

/// Daemon-wide engine defaults. Per-scan options may override the first two.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub concurrency: usize,
    pub connect_timeout: Duration,
    pub scan_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 1000,
            connect_timeout: Duration::from_millis(400),
            scan_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct ScanPlan {
    hosts: Vec<IpAddr>,
    ports: Vec<u16>,
    concurrency: usize,
    connect_timeout: Duration,
}

#[derive(Debug)]
struct OpenPort {
    addr: SocketAddr,
    latency_ms: u64,
    banner: Option<String>,
}

impl OpenPort {
    fn describe(&self) -> String {
        match &self.banner {
            Some(b) => format!("{} open ({} ms): {}", self.addr, self.latency_ms, b),
            None => format!("{} open ({} ms)", self.addr, self.latency_ms),
        }
    }
}

enum Outcome {
    Finished { open: u64 },
    Cancelled,
    TimedOut,
}

/// Run the scan registered under `scan_id` to completion.
///
/// Every path ends with the scan at 100% so it can be deleted afterwards.
pub async fn run_scan(
    registry: Arc<ScanRegistry>,
    scan_id: String,
    settings: EngineSettings,
    cancel: CancellationToken,
) {
    let id = scan_id.as_str();
    let plan = match plan_scan(&registry, id, &settings) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(scan_id = %id, "cannot start scan: {e:#}");
            report(registry.add_error(id, format!("{e:#}")));
            report(registry.set_progress(id, PROGRESS_COMPLETE.into()));
            return;
        }
    };

    info!(
        scan_id = %id,
        hosts = plan.hosts.len(),
        ports = plan.ports.len(),
        "scan started"
    );
    report(registry.add_log(
        id,
        format!(
            "scan started: {} hosts, {} ports",
            plan.hosts.len(),
            plan.ports.len()
        ),
    ));

    let probes = probe_all(&registry, id, &plan, &cancel);
    let outcome = time::timeout(settings.scan_timeout, probes)
        .await
        .unwrap_or(Outcome::TimedOut);

    match outcome {
        Outcome::Finished { open } => {
            info!(scan_id = %id, open, "scan finished");
            report(registry.add_log(id, format!("scan finished: {open} open ports")));
        }
        Outcome::Cancelled => {
            warn!(scan_id = %id, "scan interrupted");
            report(registry.add_error(id, "scan interrupted by daemon shutdown"));
        }
        Outcome::TimedOut => {
            warn!(scan_id = %id, "scan timed out");
            report(registry.add_error(
                id,
                format!("scan timed out after {:?}", settings.scan_timeout),
            ));
        }
    }
    report(registry.set_progress(id, PROGRESS_COMPLETE.into()));
}

fn plan_scan(registry: &ScanRegistry, id: &str, settings: &EngineSettings) -> Result<ScanPlan> {
    let target = registry.get_target(id)?;
    let options = registry.get_options(id)?;

    let hosts = targets::expand_target(&target)?;
    let ports = match options.get(OPT_PORTS) {
        Some(spec) => ports::parse_port_list(spec).context("invalid ports option")?,
        None => ports::default_ports(),
    };
    let concurrency = match options.get(OPT_CONCURRENCY) {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid concurrency option: {v}"))?,
        None => settings.concurrency,
    };
    let connect_timeout = match options.get(OPT_TIMEOUT_MS) {
        Some(v) => match v.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            Ok(_) => bail!("invalid timeout_ms option: {v} (must be positive)"),
            Err(e) => return Err(e).with_context(|| format!("invalid timeout_ms option: {v}")),
        },
        None => settings.connect_timeout,
    };

    Ok(ScanPlan {
        hosts,
        ports,
        concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
        connect_timeout,
    })
}

/// Counts finished probes and turns them into registry updates.
struct Tracker<'a> {
    registry: &'a ScanRegistry,
    id: &'a str,
    total: u64,
    done: u64,
    open: u64,
    reported: u64,
}

impl<'a> Tracker<'a> {
    fn record(&mut self, res: Result<Option<OpenPort>, JoinError>) {
        self.done += 1;
        match res {
            Ok(Some(port)) => {
                self.open += 1;
                report(self.registry.add_alert(self.id, port.describe()));
            }
            Ok(None) => {}
            Err(e) => {
                report(self.registry.add_error(self.id, format!("probe task failed: {e}")));
            }
        }

        // 100 is reserved for the completion transition in run_scan.
        let pct = self.done * 100 / self.total.max(1);
        if pct > self.reported && pct < u64::from(PROGRESS_COMPLETE) {
            self.reported = pct;
            report(self.registry.set_progress(self.id, pct as i64));
        }
    }
}

async fn probe_all(
    registry: &ScanRegistry,
    id: &str,
    plan: &ScanPlan,
    cancel: &CancellationToken,
) -> Outcome {
    let mut tracker = Tracker {
        registry,
        id,
        total: plan.hosts.len() as u64 * plan.ports.len() as u64,
        done: 0,
        open: 0,
        reported: 0,
    };
    let sem = Arc::new(Semaphore::new(plan.concurrency));
    let mut set = JoinSet::new();

    'spawn: for &ip in &plan.hosts {
        for &port in &plan.ports {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'spawn,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break 'spawn,
                },
            };
            let timeout = plan.connect_timeout;
            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                probe(SocketAddr::new(ip, port), timeout).await
            });
            while let Some(res) = set.try_join_next() {
                tracker.record(res);
            }
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                set.abort_all();
                return Outcome::Cancelled;
            }
            res = set.join_next() => match res {
                Some(res) => tracker.record(res),
                None => break,
            },
        }
    }

    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    Outcome::Finished { open: tracker.open }
}

async fn probe(addr: SocketAddr, timeout: Duration) -> Option<OpenPort> {
    let start = Instant::now();
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(mut stream)) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let banner = read_banner(&mut stream).await;
            debug!(%addr, latency_ms, "port open");
            Some(OpenPort {
                addr,
                latency_ms,
                banner,
            })
        }
        // Closed, filtered, or timed out.
        _ => None,
    }
}

/// Whatever the service says first, on one line.
async fn read_banner(stream: &mut TcpStream) -> Option<String> {
    const BANNER_WAIT: Duration = Duration::from_millis(200);
    let mut greeting = [0u8; 256];
    let len = match time::timeout(BANNER_WAIT, stream.read(&mut greeting)).await {
        Ok(Ok(len)) if len > 0 => len,
        _ => return None,
    };
    let text = String::from_utf8_lossy(&greeting[..len]);
    let line: String = text
        .trim_end()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    Some(line)
}

fn report(res: RegistryResult<()>) {
    if let Err(e) = res {
        warn!("dropping scan update: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResultKind, ScanOptions, ScanStatus};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn options(pairs: &[(&str, &str)]) -> ScanOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn open_port_is_reported_as_alert() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-test\r\n").await;
            }
        });

        let registry = Arc::new(ScanRegistry::new());
        let ports = port.to_string();
        let id = registry.create("127.0.0.1", options(&[(OPT_PORTS, ports.as_str())]));
        run_scan(
            registry.clone(),
            id.clone(),
            EngineSettings::default(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(registry.status(&id).unwrap(), ScanStatus::Complete);
        let results: Vec<_> = registry.results_iterator(&id).unwrap().collect();
        assert_eq!(results.first().unwrap().kind, ResultKind::Log);
        let alerts: Vec<_> = results
            .iter()
            .filter(|r| r.kind == ResultKind::Alert)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains(&format!("127.0.0.1:{port} open")));
        assert!(alerts[0].message.contains("SSH-2.0-test"));
        assert!(registry.delete(&id).unwrap());
    }

    #[tokio::test]
    async fn closed_port_completes_without_alerts() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let registry = Arc::new(ScanRegistry::new());
        let ports = port.to_string();
        let id = registry.create("127.0.0.1", options(&[(OPT_PORTS, ports.as_str())]));
        run_scan(
            registry.clone(),
            id.clone(),
            EngineSettings::default(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(registry.get_progress(&id).unwrap(), 100);
        assert!(registry
            .results_iterator(&id)
            .unwrap()
            .all(|r| r.kind == ResultKind::Log));
    }

    #[tokio::test]
    async fn bad_target_is_reported_as_error() {
        let registry = Arc::new(ScanRegistry::new());
        let id = registry.create("not-a-host", ScanOptions::new());
        run_scan(
            registry.clone(),
            id.clone(),
            EngineSettings::default(),
            CancellationToken::new(),
        )
        .await;

        let results: Vec<_> = registry.results_iterator(&id).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, ResultKind::Error);
        assert!(results[0].message.contains("invalid IP"));
        assert_eq!(registry.get_progress(&id).unwrap(), 100);
    }

    #[tokio::test]
    async fn bad_option_is_reported_as_error() {
        let registry = Arc::new(ScanRegistry::new());
        let id = registry.create("127.0.0.1", options(&[(OPT_CONCURRENCY, "many")]));
        run_scan(
            registry.clone(),
            id.clone(),
            EngineSettings::default(),
            CancellationToken::new(),
        )
        .await;

        let results: Vec<_> = registry.results_iterator(&id).unwrap().collect();
        assert_eq!(results[0].kind, ResultKind::Error);
        assert!(results[0].message.contains("invalid concurrency option"));
    }

    #[tokio::test]
    async fn zero_connect_timeout_is_rejected() {
        let registry = Arc::new(ScanRegistry::new());
        let id = registry.create("127.0.0.1", options(&[(OPT_TIMEOUT_MS, "0")]));
        run_scan(
            registry.clone(),
            id.clone(),
            EngineSettings::default(),
            CancellationToken::new(),
        )
        .await;

        let results: Vec<_> = registry.results_iterator(&id).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, ResultKind::Error);
        assert!(results[0].message.contains("invalid timeout_ms option"));
        assert_eq!(registry.get_progress(&id).unwrap(), 100);
    }

    #[tokio::test]
    async fn slow_scan_hits_scan_timeout() {
        let registry = Arc::new(ScanRegistry::new());
        let id = registry.create(
            "127.0.0.1",
            options(&[(OPT_PORTS, "1-65535"), (OPT_CONCURRENCY, "1")]),
        );
        let settings = EngineSettings {
            scan_timeout: Duration::from_millis(1),
            ..EngineSettings::default()
        };
        run_scan(registry.clone(), id.clone(), settings, CancellationToken::new()).await;

        assert_eq!(registry.get_progress(&id).unwrap(), 100);
        let last = registry.results_iterator(&id).unwrap().last().unwrap();
        assert_eq!(last.kind, ResultKind::Error);
        assert!(last.message.contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_scan_still_completes() {
        let registry = Arc::new(ScanRegistry::new());
        let id = registry.create("127.0.0.1", options(&[(OPT_PORTS, "1-1024")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_scan(registry.clone(), id.clone(), EngineSettings::default(), cancel).await;

        assert_eq!(registry.status(&id).unwrap(), ScanStatus::Complete);
        assert!(registry
            .results_iterator(&id)
            .unwrap()
            .any(|r| r.kind == ResultKind::Error && r.message.contains("interrupted")));
    }
}

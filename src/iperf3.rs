//! Throughput Oracle
//!
//! Measured uplink/downlink bandwidth between two endpoints. The
//! production implementation shells out to `iperf3`; the trait exists so
//! the consumer flow can run against a stub in tests. Servers are scoped
//! acquisitions: started at role boot, killed on shutdown.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// bits/s divided by this gives Mbyte/s
pub const BITS_PER_MBYTE: f64 = 8_000_000.0;

/// Bytes transferred per measurement stream (iperf3 `-n` argument)
const STREAM_SIZE: &str = "10M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Upload from the measuring side
    Forward,
    /// Download to the measuring side (iperf3 `-R`)
    Reverse,
}

/// Measured bandwidth source
#[async_trait]
pub trait ThroughputOracle: Send + Sync {
    /// Measure one direction against `host`, trying candidate server ports
    /// `[base_port, base_port + port_count)` sequentially until one
    /// accepts. Returns bits per second.
    async fn measure(
        &self,
        host: &str,
        base_port: u16,
        port_count: u16,
        direction: StreamDirection,
    ) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct Iperf3Sum {
    bits_per_second: f64,
}

#[derive(Debug, Deserialize)]
struct Iperf3End {
    sum_sent: Iperf3Sum,
    sum_received: Iperf3Sum,
}

#[derive(Debug, Deserialize)]
struct Iperf3Results {
    end: Iperf3End,
}

/// Oracle backed by the `iperf3` binary
#[derive(Debug, Default)]
pub struct Iperf3Oracle;

impl Iperf3Oracle {
    async fn run_stream(&self, host: &str, port: u16, direction: StreamDirection) -> Result<f64> {
        let port_arg = port.to_string();
        let mut args = vec!["-c", host, "-p", &port_arg, "-n", STREAM_SIZE, "-J"];
        if direction == StreamDirection::Reverse {
            args.push("-R");
        }

        let output = Command::new("iperf3")
            .args(&args)
            .output()
            .await
            .context("failed to run iperf3 client")?;
        if !output.status.success() {
            bail!(
                "iperf3 client against {}:{} exited with {}: {}",
                host,
                port,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let results: Iperf3Results = serde_json::from_slice(&output.stdout)
            .context("failed to unmarshal iperf3 results")?;
        Ok(match direction {
            StreamDirection::Forward => results.end.sum_sent.bits_per_second,
            StreamDirection::Reverse => results.end.sum_received.bits_per_second,
        })
    }
}

#[async_trait]
impl ThroughputOracle for Iperf3Oracle {
    async fn measure(
        &self,
        host: &str,
        base_port: u16,
        port_count: u16,
        direction: StreamDirection,
    ) -> Result<f64> {
        for port in base_port..base_port.saturating_add(port_count.max(1)) {
            match self.run_stream(host, port, direction).await {
                Ok(bps) => {
                    debug!("iperf3 {:?} stream to {}:{} measured {} bit/s", direction, host, port, bps);
                    return Ok(bps);
                }
                Err(e) => {
                    debug!("iperf3 {:?} stream to {}:{} failed: {:#}", direction, host, port, e);
                }
            }
        }
        bail!(
            "no iperf3 server reachable at {} ports {}..{}",
            host,
            base_port,
            base_port.saturating_add(port_count.max(1))
        )
    }
}

/// Running `iperf3 -s` processes, one per port in the configured range
pub struct Iperf3ServerPool {
    children: Vec<(u16, Child)>,
}

impl Iperf3ServerPool {
    /// Spawn one server per port. Individual spawn failures are logged and
    /// skipped so a partially bound range still serves.
    pub fn start(base_port: u16, port_count: u16) -> Self {
        let mut children = Vec::new();
        for port in base_port..base_port.saturating_add(port_count) {
            match Command::new("iperf3")
                .args(["-s", "-p", &port.to_string(), "-J"])
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => {
                    info!("started iperf3 server on port {}", port);
                    children.push((port, child));
                }
                Err(e) => {
                    warn!("failed to start iperf3 server on port {}: {}", port, e);
                }
            }
        }
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Kill every server process
    pub async fn shutdown(&mut self) {
        for (port, child) in &mut self.children {
            if let Err(e) = child.kill().await {
                warn!("failed to stop iperf3 server on port {}: {}", port, e);
            }
        }
        self.children.clear();
    }
}

/// Convert a measured rate from bits/s to Mbyte/s
pub fn bps_to_mbytes(bits_per_second: f64) -> f64 {
    bits_per_second / BITS_PER_MBYTE
}

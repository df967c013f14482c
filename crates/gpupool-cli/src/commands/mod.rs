//! CLI commands implementation

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, ValueEnum};
use gpupool_core::{
    AllocationHandle, AllocationId, AllocationRequest, ClusterMetrics, DemandAccounting,
    DeviceId, DeviceView, Priority, Reservation, ResourceShare, ResourceStatus,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

const GB: u64 = 1_000_000_000;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Plan response from API
#[derive(Debug, Deserialize)]
struct PlanResponse {
    device_ids: Vec<DeviceId>,
    per_device: ResourceShare,
}

/// Topology change response from API
#[derive(Debug, Deserialize)]
struct TopologyResponse {
    device_ids: Vec<DeviceId>,
    device_count: usize,
}

/// Status response from API
#[derive(Debug, Deserialize)]
struct StatusResponse {
    version: String,
    resources: ResourceStatus,
    active_allocations: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

/// Resource demand shared by `allocate` and `plan`
#[derive(Args, Debug)]
pub struct DemandArgs {
    /// Number of devices
    #[arg(short = 'n', long, default_value_t = 1)]
    pub devices: u32,

    /// Memory per device in GB
    #[arg(long, default_value_t = 0)]
    pub memory_gb: u64,

    /// Power per device in watts
    #[arg(long, default_value_t = 0)]
    pub power: u64,

    /// Interconnect bandwidth per device in GB/s
    #[arg(long, default_value_t = 0)]
    pub bandwidth: u64,

    /// Treat the demand as a total split evenly across devices
    #[arg(long)]
    pub total: bool,

    /// Requesting component
    #[arg(long, default_value = "cli")]
    pub owner: String,

    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Expected run time in seconds
    #[arg(long)]
    pub duration: Option<u64>,

    /// Devices that must not be selected
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<DeviceId>,
}

impl DemandArgs {
    fn into_request(self) -> AllocationRequest {
        let accounting = if self.total {
            DemandAccounting::Total
        } else {
            DemandAccounting::PerDevice
        };

        let mut request = AllocationRequest::new(self.owner, self.devices)
            .with_demand(
                self.memory_gb.saturating_mul(GB),
                self.power,
                self.bandwidth,
            )
            .with_accounting(accounting)
            .with_priority(self.priority.into())
            .excluding(self.exclude);
        request.estimated_duration_secs = self.duration;
        request
    }
}

/// Turn a non-success response into an error carrying the daemon's message
async fn failure(response: reqwest::Response, action: &str) -> anyhow::Error {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => anyhow::anyhow!("Failed to {}: {} ({})", action, body.message, body.error),
        Err(_) => anyhow::anyhow!("Failed to {}: HTTP {}", action, status),
    }
}

fn parse_allocation_id(allocation: &str) -> Result<AllocationId> {
    allocation
        .parse()
        .with_context(|| format!("'{}' is not an allocation ID", allocation))
}

fn gb(bytes: u64) -> f64 {
    bytes as f64 / GB as f64
}

/// Allocate devices
pub async fn allocate(client: &ApiClient, demand: DemandArgs) -> Result<()> {
    let request = demand.into_request();
    debug!(owner = %request.owner, devices = request.device_count, "Submitting allocation");

    let response = client
        .client
        .post(client.url("/api/v1/allocations"))
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, "allocate").await);
    }

    let handle: AllocationHandle = response.json().await?;
    println!("Allocation {} active", handle.allocation_id);
    println!("  Devices: {:?}", handle.device_ids);
    Ok(())
}

/// Release an allocation
pub async fn release(client: &ApiClient, allocation: &str) -> Result<()> {
    let id = parse_allocation_id(allocation)?;

    let response = client
        .client
        .delete(client.url(&format!("/api/v1/allocations/{}", id)))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, "release allocation").await);
    }

    println!("Allocation {} released", id);
    Ok(())
}

/// Migrate an allocation
pub async fn migrate(client: &ApiClient, allocation: &str, exclude: Vec<DeviceId>) -> Result<()> {
    let id = parse_allocation_id(allocation)?;

    #[derive(Serialize)]
    struct MigrateRequest {
        exclude: Vec<DeviceId>,
    }

    let response = client
        .client
        .post(client.url(&format!("/api/v1/allocations/{}/migrate", id)))
        .json(&MigrateRequest { exclude })
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, "migrate allocation").await);
    }

    let handle: AllocationHandle = response.json().await?;
    println!(
        "Allocation {} moved to devices {:?}",
        handle.allocation_id, handle.device_ids
    );
    Ok(())
}

/// Dry-run placement
pub async fn plan(client: &ApiClient, demand: DemandArgs) -> Result<()> {
    let request = demand.into_request();

    let response = client
        .client
        .post(client.url("/api/v1/plan"))
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, "plan").await);
    }

    let plan: PlanResponse = response.json().await?;
    println!("Would place on devices {:?}", plan.device_ids);
    println!(
        "  Per device: {:.1} GB, {} W, {} GB/s",
        gb(plan.per_device.memory_bytes),
        plan.per_device.power_watts,
        plan.per_device.bandwidth_gbps
    );
    Ok(())
}

/// List active allocations
pub async fn ps(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/allocations"))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, "list allocations").await);
    }

    let allocations: Vec<Reservation> = response.json().await?;
    if allocations.is_empty() {
        println!("No active allocations");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<36} {:<16} {:<16} {:>10} {:<9} {:>8}",
        "ID", "OWNER", "DEVICES", "MEM (GB)", "PRIORITY", "AGE (s)"
    );
    println!("{}", "-".repeat(100));
    for r in allocations {
        let devices = r
            .device_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<36} {:<16} {:<16} {:>10.1} {:<9} {:>8}",
            r.allocation_id,
            r.owner,
            devices,
            gb(r.memory_reserved_bytes()),
            r.priority.to_string(),
            (now - r.created_at).num_seconds()
        );
    }
    Ok(())
}

/// Show devices
pub async fn devices(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/devices"))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, "list devices").await);
    }

    let devices: Vec<DeviceView> = response.json().await?;
    println!(
        "{:<4} {:>18} {:>12} {:>5} {:>7} {:>7}",
        "ID", "MEM USED/TOTAL GB", "POWER (W)", "RES", "UTIL%", "TEMP"
    );
    println!("{}", "-".repeat(60));
    for d in devices {
        let (util, temp) = match &d.last_telemetry {
            Some(reading) => (
                format!("{:.0}", reading.metrics.utilization_pct),
                format!("{:.0}C", reading.metrics.temperature_c),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<4} {:>18} {:>12} {:>5} {:>7} {:>7}",
            d.device_id,
            format!(
                "{:.0}/{:.0}",
                gb(d.committed.memory_bytes),
                gb(d.capacity.memory_bytes)
            ),
            format!("{}/{}", d.committed.power_watts, d.capacity.max_power_watts),
            d.reservations,
            util,
            temp
        );
    }
    Ok(())
}

/// Show cluster metrics and resource status
pub async fn top(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(failure(response, "get status").await);
    }
    let status: StatusResponse = response.json().await?;

    let response = client
        .client
        .get(client.url("/api/v1/metrics"))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(failure(response, "get metrics").await);
    }
    let metrics: ClusterMetrics = response.json().await?;

    let res = &status.resources;
    println!("gpupool v{}", status.version);
    println!();
    println!(
        "Devices: {} total, {} idle, {} busy ({} reporting)",
        res.devices.total, res.devices.idle, res.devices.busy, metrics.reporting_devices
    );
    println!("Allocations: {}", status.active_allocations);
    println!(
        "Memory: {:.0}/{:.0} GB committed ({:.1}%)",
        gb(res.used.memory_bytes),
        gb(res.total.memory_bytes),
        metrics.memory_commitment_pct()
    );
    println!(
        "Power: {}/{} W committed, {:.0} W observed",
        res.used.power_watts, res.total.power_watts, metrics.observed_power_watts
    );
    match metrics.average_utilization_pct {
        Some(util) => println!("Utilization: {:.1}% average", util),
        None => println!("Utilization: no fresh telemetry"),
    }
    Ok(())
}

async fn topology(client: &ApiClient, path: &str, count: usize, action: &str) -> Result<()> {
    #[derive(Serialize)]
    struct TopologyRequest {
        count: usize,
    }

    let response = client
        .client
        .post(client.url(path))
        .json(&TopologyRequest { count })
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(failure(response, action).await);
    }

    let result: TopologyResponse = response.json().await?;
    println!(
        "Devices {:?} {}; cluster now has {} devices",
        result.device_ids,
        if path.ends_with("expand") {
            "added"
        } else {
            "removed"
        },
        result.device_count
    );
    Ok(())
}

/// Add devices
pub async fn expand(client: &ApiClient, count: usize) -> Result<()> {
    topology(client, "/api/v1/cluster/expand", count, "expand cluster").await
}

/// Remove devices
pub async fn shrink(client: &ApiClient, count: usize) -> Result<()> {
    topology(client, "/api/v1/cluster/shrink", count, "shrink cluster").await
}

//! mbtd — firmware distribution simulator.
//!
//! Spawns a set of update targets and one distributor on an in-process mesh
//! and pushes a firmware image to every target: BLOB transfer, verify,
//! apply, confirm.

use anyhow::{Context, Result};
use tokio::sync::oneshot;

use mbt_core::config::MbtConfig;
use mbt_core::wire::Address;
use mbt_services::dfu_cli::{DfuCli, DfuCliInputs, DfuTargetSpec, DfuXfer};

mod distributor;
mod image;
mod network;
mod node;
mod target;

use distributor::Distributor;
use image::{ImageMeta, MmapStream};
use network::Mesh;
use node::Node;
use target::Target;

const DISTRIBUTOR_ADDR: Address = 0x0001;
const FIRST_TARGET_ADDR: Address = 0x0100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MbtConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MbtConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MbtConfig::default()
    });
    let sim = &config.sim;
    tracing::info!(
        targets = sim.targets,
        group = format_args!("0x{:04x}", sim.group),
        loss_percent = sim.loss_percent,
        pull = sim.pull,
        "mbtd starting"
    );

    // Image
    let image_path = image::prepare(sim)?;
    let image = MmapStream::open(&image_path)?;
    let size = u32::try_from(image.bytes().len()).context("image larger than 4 GiB")?;
    let fwid = image::fwid_for(image.bytes());
    let metadata = ImageMeta::for_image(image.bytes(), fwid.clone()).encode()?;
    tracing::info!(
        path = %image_path.display(),
        size,
        fwid = %String::from_utf8_lossy(&fwid),
        "image ready"
    );

    // ── Mesh and shutdown ────────────────────────────────────────────────────
    let mesh = Mesh::new(sim.loss_percent);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Targets ──────────────────────────────────────────────────────────────
    let mut target_tasks = Vec::new();
    let mut specs = Vec::new();
    for i in 0..sim.targets {
        let addr = FIRST_TARGET_ADDR + i;
        let inbox = mesh.join(addr);
        if sim.group != 0 {
            mesh.subscribe(sim.group, addr);
        }
        let target = Target::new(addr, &config, &sim.state_dir)
            .with_context(|| format!("failed to set up target 0x{addr:04x}"))?;
        target_tasks.push(tokio::spawn(Node::new(target, mesh.port(addr), inbox, shutdown_tx.subscribe()).run()));
        specs.push(DfuTargetSpec { addr, img_idx: 0 });
    }

    // ── Distributor ──────────────────────────────────────────────────────────
    let (done_tx, done_rx) = oneshot::channel();
    let distributor = Distributor::new(
        DfuCli::new(config.blob_client.clone(), config.dfu.clone()),
        DfuCliInputs {
            targets: specs,
            group: sim.group,
            app_idx: sim.app_idx,
            ttl: sim.ttl,
            timeout_base: sim.timeout_base,
        },
        DfuXfer {
            blob_id: u64::from_le_bytes(blake3::hash(&metadata).as_bytes()[..8].try_into()?),
            size,
            fwid,
            metadata,
            mode: distributor::mode(sim.pull),
            blob_params: None,
        },
        Box::new(image),
        done_tx,
    );
    let inbox = mesh.join(DISTRIBUTOR_ADDR);
    let distributor_task =
        tokio::spawn(Node::new(distributor, mesh.port(DISTRIBUTOR_ADDR), inbox, shutdown_tx.subscribe()).run());

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();
    let report = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            None
        }
        r = done_rx => r.ok(),
    };

    let _ = shutdown_tx.send(());
    let _ = distributor_task.await;
    for task in target_tasks {
        match task.await {
            Ok(target) => tracing::info!(
                fwid = ?target.srv().imgs().first().map(|img| String::from_utf8_lossy(&img.fwid).into_owned()),
                phase = ?target.srv().phase(),
                "target final state"
            ),
            Err(e) => tracing::error!(error = %e, "target task failed"),
        }
    }

    match report {
        Some(report) => {
            for (addr, status) in &report.lost {
                tracing::warn!(addr = format_args!("0x{addr:04x}"), ?status, "target not updated");
            }
            match report.result {
                Ok(()) => {
                    tracing::info!(elapsed = ?report.elapsed, lost = report.lost.len(), "distribution complete");
                    Ok(())
                }
                Err(status) => anyhow::bail!("distribution failed: {status:?}"),
            }
        }
        None => Ok(()),
    }
}

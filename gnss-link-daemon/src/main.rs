mod config;
mod diagnostics;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{format_device, format_entry, format_sample, BuildInfo, Cli, Command, MaskAction};
use gnss_link_protocol::{
    BondStore, DeviceId, GnssMaskStatus, JsonBondStore, SessionHandle, SessionState,
    StartTriggerState,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long a device command waits for the session to become operational
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a control-point request waits for its response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(feature = "ble")]
async fn start_engine(config: &Config) -> Result<(SessionHandle, JoinHandle<()>)> {
    use gnss_link_protocol::{BtleplugTransport, SessionEngine};
    use std::sync::Arc;

    let store = JsonBondStore::new(config.bond_store_path()).context("Failed to open bond store")?;
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = BtleplugTransport::new(events_tx)
        .await
        .context("Failed to initialise Bluetooth adapter")?;
    Ok(SessionEngine::spawn(
        config.engine.clone(),
        Arc::new(transport),
        events_rx,
        Box::new(store),
    ))
}

#[cfg(not(feature = "ble"))]
async fn start_engine(_config: &Config) -> Result<(SessionHandle, JoinHandle<()>)> {
    bail!("gnss-link was built without Bluetooth support; rebuild with `--features ble`")
}

/// Bounded wait on the published state
async fn wait_until(
    handle: &SessionHandle,
    timeout: Duration,
    what: &str,
    predicate: impl FnMut(&gnss_link_protocol::SessionSnapshot) -> bool,
) -> Result<gnss_link_protocol::SessionSnapshot> {
    tokio::time::timeout(timeout, handle.wait_for(predicate))
        .await
        .map_err(|_| anyhow!("Timed out waiting for {}", what))?
        .map_err(Into::into)
}

/// Connect to the requested or last connected device
async fn attach(handle: &SessionHandle, config: &Config, device: Option<DeviceId>) -> Result<()> {
    let id = match device {
        Some(id) => id,
        None => JsonBondStore::new(config.bond_store_path())?
            .last_connected_id()?
            .ok_or_else(|| anyhow!("No device given and no previously connected device"))?,
    };

    info!("Connecting to {}", id);
    handle.connect(id).await.context("Failed to start connection")?;
    wait_until(handle, CONNECT_TIMEOUT, "the connection", |s| {
        s.state == SessionState::Connected(id)
    })
    .await?;
    println!("Connected to {}", id);
    Ok(())
}

async fn scan(handle: &SessionHandle, pairing: bool, seconds: u64) -> Result<()> {
    handle.start_scan(pairing).await.context("Failed to start scan")?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let snapshot = handle.snapshot();
    handle.stop_scan().await?;

    let devices = if pairing {
        snapshot.pairing_devices
    } else {
        snapshot.known_devices
    };
    if devices.is_empty() {
        println!("No devices found");
    }
    for device in &devices {
        println!("{}", format_device(device));
    }
    Ok(())
}

async fn list(handle: &SessionHandle, path: String) -> Result<()> {
    handle.list_directory(path.clone()).await?;
    let snapshot = wait_until(handle, RESPONSE_TIMEOUT, "the listing", |s| {
        !s.directory.awaiting_response
    })
    .await?;
    if let Some(error) = snapshot.directory.error {
        bail!("Listing {} failed: {}", path, error);
    }
    for entry in &snapshot.directory.entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

/// Print transfer progress until the task is aborted
fn report_progress(handle: &SessionHandle) -> JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        let mut last = -1i64;
        while rx.changed().await.is_ok() {
            let Some(progress) = rx.borrow_and_update().transfer.clone() else {
                continue;
            };
            let percent = (progress.fraction * 100.0) as i64;
            if percent != last {
                last = percent;
                eprint!("\r{} {}%", progress.path, percent);
            }
        }
    })
}

async fn download(
    handle: &SessionHandle,
    config: &Config,
    remote: String,
    local: &std::path::Path,
    size: u64,
) -> Result<()> {
    let destination = config.download_path(local);
    let progress = report_progress(handle);
    let result = handle.download(remote.clone(), size).await;
    progress.abort();
    eprintln!();

    let bytes = result.with_context(|| format!("Download of {} failed", remote))?;
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).context("Failed to create download directory")?;
    }
    std::fs::write(&destination, &bytes)
        .with_context(|| format!("Failed to write {}", destination.display()))?;
    println!(
        "{} -> {} ({})",
        remote,
        destination.display(),
        diagnostics::format_bytes(bytes.len() as u64)
    );
    Ok(())
}

async fn upload(handle: &SessionHandle, local: &std::path::Path, remote: String) -> Result<()> {
    let data =
        std::fs::read(local).with_context(|| format!("Failed to read {}", local.display()))?;
    let size = data.len() as u64;
    let progress = report_progress(handle);
    let result = handle.upload(remote.clone(), data).await;
    progress.abort();
    eprintln!();

    result.with_context(|| format!("Upload to {} failed", remote))?;
    println!(
        "{} -> {} ({})",
        local.display(),
        remote,
        diagnostics::format_bytes(size)
    );
    Ok(())
}

async fn live(handle: &SessionHandle, count: usize) -> Result<()> {
    let mut rx = handle.subscribe();
    let mut printed = 0usize;
    let mut last = None;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                changed.context("Session engine stopped")?;
                let sample = rx.borrow_and_update().live_sample;
                if sample.is_some() && sample != last {
                    if let Some(sample) = &sample {
                        println!("{}", format_sample(sample));
                    }
                    last = sample;
                    printed += 1;
                    if count > 0 && printed >= count {
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn mask(handle: &SessionHandle, action: MaskAction) -> Result<()> {
    // the engine reads the mask on connect; let that settle first
    wait_until(handle, RESPONSE_TIMEOUT, "the initial mask read", |s| {
        s.gnss_mask_status != GnssMaskStatus::Pending
    })
    .await?;

    match action {
        MaskAction::Get => handle.get_mask().await?,
        MaskAction::Set { value } => handle.set_mask(value).await?,
    }
    let snapshot = wait_until(handle, RESPONSE_TIMEOUT, "the mask response", |s| {
        s.gnss_mask_status != GnssMaskStatus::Pending
    })
    .await?;

    match (snapshot.gnss_mask_status, snapshot.gnss_mask) {
        (GnssMaskStatus::Failure(reason), _) => bail!("Mask request failed: {}", reason),
        (_, Some(mask)) => println!("GNSS field mask: 0x{:02X}", mask),
        (_, None) => println!("GNSS field mask: unknown"),
    }
    Ok(())
}

async fn start_trigger(handle: &SessionHandle, start: bool) -> Result<()> {
    let wanted = if start {
        handle.start_countdown().await?;
        StartTriggerState::Counting
    } else {
        handle.cancel_countdown().await?;
        StartTriggerState::Idle
    };
    let snapshot = wait_until(handle, RESPONSE_TIMEOUT, "the start trigger", |s| {
        !s.start_pending && (s.start_trigger == wanted || s.start_error.is_some())
    })
    .await?;
    if let Some(reason) = snapshot.start_error {
        bail!("Start request failed: {}", reason);
    }
    println!("Start trigger: {:?}", snapshot.start_trigger);
    if let Some(result) = snapshot.start_result {
        println!(
            "Last result: {:?} at {}",
            result.outcome,
            result.received_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn run_device_command(
    handle: &SessionHandle,
    config: &Config,
    device: Option<DeviceId>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Scan { pairing, seconds } => scan(handle, pairing, seconds).await,
        Command::Forget { id } => {
            handle.forget(id).await?;
            println!("Forgot {}", id);
            Ok(())
        }
        command => {
            attach(handle, config, device).await?;
            let result = match command {
                Command::List { path } => list(handle, path).await,
                Command::Download {
                    remote,
                    local,
                    size,
                } => download(handle, config, remote, &local, size).await,
                Command::Upload { local, remote } => upload(handle, &local, remote).await,
                Command::Live { count } => live(handle, count).await,
                Command::Mask { action } => mask(handle, action).await,
                Command::Start => start_trigger(handle, true).await,
                Command::CancelStart => start_trigger(handle, false).await,
                other => Err(anyhow!("{:?} does not need a device", other)),
            };
            if let Err(e) = handle.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
            result
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    match cli.command {
        Command::Version => {
            BuildInfo::get().display();
            Ok(())
        }
        Command::DumpConfig => {
            let contents = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("# {}", config.config_path().display());
            println!("{}", contents);
            Ok(())
        }
        command => {
            let (handle, engine) = start_engine(&config).await?;
            let result = run_device_command(&handle, &config, cli.device, command).await;
            if handle.shutdown().is_ok() {
                let _ = engine.await;
            }
            result
        }
    }
}

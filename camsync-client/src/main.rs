use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use camsync_device::{
    ConnectionManager, DeviceConfig, DeviceController, DeviceEvent, DeviceHandle, ProcessCapture,
    SystemClock, WsTransport,
};
use camsync_proto::relay::DeviceType;

#[derive(Debug, Parser)]
#[command(about = "camsync device: join a relay as master or slave and record in sync")]
struct Opts {
    /// Relay WebSocket URL (default: $CAMSYNC_RELAY_URL or ws://127.0.0.1:9090/ws)
    #[arg(long, global = true)]
    relay_url: Option<String>,

    /// Where recordings are written (default: <videos>/camsync)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Recording ceiling in milliseconds
    #[arg(long, global = true)]
    max_duration_ms: Option<u64>,

    #[command(subcommand)]
    role: RoleCmd,
}

#[derive(Debug, Subcommand)]
enum RoleCmd {
    /// Press Enter to trigger every slave on the relay, `q` to quit.
    Master {
        /// Send the bare SEND_TO_SLAVES command instead of a structured trigger
        #[arg(long)]
        legacy: bool,
    },
    /// Wait for a trigger, then record at the next top of the minute.
    /// `s` stops a recording early, `q` quits.
    Slave {
        /// Output file extension
        #[arg(long, default_value = "mp4")]
        extension: String,

        /// Recorder command; `{output}` is replaced with the file path
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn describe(event: &DeviceEvent) -> String {
    match event {
        DeviceEvent::Connected { device_id, role } => format!("connected as {role} ({device_id})"),
        DeviceEvent::ConnectionFailed(e) => format!("connection failed: {e}"),
        DeviceEvent::TriggerSent(_) => "trigger sent".to_string(),
        DeviceEvent::Armed { origin } => match origin {
            Some(id) => format!("armed by {id}"),
            None => "armed".to_string(),
        },
        DeviceEvent::Countdown(s) => format!("recording in {s}s"),
        DeviceEvent::ArmExpired => "trigger expired before a boundary was reached".to_string(),
        DeviceEvent::Released { at, missed } => {
            format!("released at {} (missed {missed})", at.format("%H:%M:%S%.3f"))
        }
        DeviceEvent::SessionState(state) => format!("session: {state:?}"),
        DeviceEvent::RecordingFinished(artifact) => format!(
            "saved {} ({} bytes, {:.1}s)",
            artifact.path.display(),
            artifact.bytes,
            artifact.duration.as_secs_f64()
        ),
        DeviceEvent::RecordingFailed(e) => format!("recording failed: {e}"),
    }
}

/// Stdin lines, read on a plain thread.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn read_commands(handle: DeviceHandle, device_type: DeviceType) -> anyhow::Result<()> {
    let mut lines = stdin_lines();
    while let Some(line) = lines.recv().await {
        match (device_type, line.trim()) {
            (_, "q") => break,
            (DeviceType::Master, "") => {
                if let Err(e) = handle.trigger().await {
                    eprintln!("trigger failed: {e}");
                }
            }
            (DeviceType::Slave, "s") => handle.stop_recording().await?,
            (_, other) => eprintln!("unknown command {other:?}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let mut config = DeviceConfig::from_env();
    if let Some(url) = opts.relay_url {
        config.relay_url = url;
    }
    if let Some(dir) = opts.output_dir {
        config.output_dir = dir;
    }
    if let Some(ms) = opts.max_duration_ms {
        config.max_duration = Duration::from_millis(ms);
    }

    let (device_type, command) = match opts.role {
        RoleCmd::Master { legacy } => {
            config.legacy_trigger |= legacy;
            (DeviceType::Master, Vec::new())
        }
        RoleCmd::Slave { extension, command } => {
            config.extension = extension;
            (DeviceType::Slave, command)
        }
    };

    let connection = Arc::new(
        ConnectionManager::new(&config.relay_url, Arc::new(WsTransport))
            .context("relay url")?,
    );
    let (handle, mut events) = DeviceController::spawn(
        &config,
        connection,
        Arc::new(SystemClock),
        Box::new(ProcessCapture::new(command)),
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            eprintln!("{}", describe(&event));
        }
    });

    handle
        .select_role(device_type)
        .await
        .map_err(|e| anyhow!("joining relay at {}: {e}", config.relay_url))?;
    match device_type {
        DeviceType::Master => eprintln!("Press Enter to trigger, q to quit."),
        DeviceType::Slave => eprintln!("Waiting for a trigger. s stops a recording, q quits."),
    }

    tokio::select! {
        result = read_commands(handle.clone(), device_type) => result?,
        _ = tokio::signal::ctrl_c() => eprintln!("interrupted"),
    }

    handle.shutdown().await?;
    Ok(())
}

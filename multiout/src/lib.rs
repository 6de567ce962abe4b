use anyhow::Result;
use clap::Parser;
use config::ConfigManager;
use output_core::device_watcher::forward_events;
use output_core::{
    AudioHardware, ControlWorker, DeviceEvent, DeviceWatcher, OrchestratorSettings, SimDevice,
    SimulatedHardware, spawn_refresh_timer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

mod command;
mod types;
use command::{Command, HELP, resolve_device};
use types::StatusView;

/// Mirror system audio to several output devices at once.
#[derive(Debug, Parser)]
#[command(name = "multiout", version, about)]
pub struct Args {
    /// Directory holding multiout.toml. Defaults to the executable's directory.
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
    /// Use simulated devices instead of the system's audio hardware.
    #[arg(long)]
    pub simulate: bool,
    /// Override the device refresh interval for this run.
    #[arg(long)]
    pub refresh_secs: Option<u64>,
}

struct App {
    worker: Arc<ControlWorker>,
    config_manager: ConfigManager,
    timer: JoinHandle<()>,
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    let config_manager = ConfigManager::load(args.config_dir.clone())?;
    let config = config_manager.handle().read().clone();

    // RUST_LOG wins over the configured level.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.general.log_level.as_str()),
    )
    .init();
    log::info!("using config {}", config_manager.path().display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(args, config_manager));
    // The stdin reader sits in a blocking read that would otherwise hold up shutdown.
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn serve(args: Args, config_manager: ConfigManager) -> Result<()> {
    let config = config_manager.handle().read().clone();
    let hardware = select_hardware(args.simulate);

    let worker = Arc::new(ControlWorker::start(
        hardware.clone(),
        OrchestratorSettings::from(&config),
    )?);

    let (mut watcher, events) = DeviceWatcher::start(hardware)?;
    let weak = Arc::downgrade(&worker);
    let forwarder = forward_events(events, move |evt| {
        if evt != DeviceEvent::Changed {
            return;
        }
        if let Some(worker) = weak.upgrade() {
            if let Err(e) = worker.request_refresh() {
                log::debug!("dropping device change: {}", e);
            }
        }
    })?;

    let secs = args
        .refresh_secs
        .unwrap_or(config.general.refresh_interval_secs)
        .max(1);
    let timer = spawn_refresh_timer(&worker, Duration::from_secs(secs));

    let mut app = App {
        worker,
        config_manager,
        timer,
    };

    println!("{}", HELP);
    let result = console(&mut app).await;

    // Every exit path ends here so the original output is restored.
    app.timer.abort();
    let listeners_removed = watcher.stop();
    app.worker.stop();
    if listeners_removed {
        if forwarder.join().is_err() {
            log::warn!("device event thread panicked");
        }
    } else {
        // A listener the HAL kept still feeds the event thread; leave it detached.
        log::warn!("device listeners still registered, not waiting for the event thread");
    }
    println!("{}", StatusView::from_snapshot(&app.worker.snapshot()));
    result
}

async fn console(app: &mut App) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            res = &mut ctrl_c => {
                res?;
                log::info!("interrupted");
                return Ok(());
            }
        };
        // End of input behaves like `quit`.
        let Some(line) = line else {
            return Ok(());
        };
        match Command::parse(&line) {
            Ok(Some(Command::Quit)) => return Ok(()),
            Ok(Some(cmd)) => {
                if let Err(e) = execute(app, cmd).await {
                    println!("error: {:#}", e);
                }
            }
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }
}

async fn execute(app: &mut App, cmd: Command) -> Result<()> {
    match cmd {
        Command::List => {
            let view = StatusView::from_snapshot(&app.worker.snapshot());
            for row in &view.devices {
                println!("{}", row);
            }
        }
        Command::Status => {
            println!("{}", StatusView::from_snapshot(&app.worker.snapshot()));
        }
        Command::Json => {
            let view = StatusView::from_snapshot(&app.worker.snapshot());
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Toggle(target) => {
            let device = find(app, &target)?;
            let state = app.worker.toggle_selection(device).await?;
            log::debug!("state after toggle: {:?}", state);
            println!("{}", StatusView::from_snapshot(&app.worker.snapshot()));
        }
        Command::Volume { target, level } => {
            let device = find(app, &target)?;
            let name = device.name.clone();
            match app.worker.set_volume(device, level).await? {
                Ok(channel) => println!("{} volume set ({:?} element)", name, channel),
                Err(e) => println!("{}: level recorded, device not updated: {}", name, e),
            }
        }
        Command::Refresh => {
            app.worker.call_async(|o| o.refresh()).await?;
            println!("{} output device(s)", app.worker.snapshot().devices.len());
        }
        Command::Interval(secs) => {
            app.config_manager
                .update(|cfg| cfg.general.refresh_interval_secs = secs)?;
            app.timer.abort();
            app.timer = spawn_refresh_timer(&app.worker, Duration::from_secs(secs));
            println!("refreshing every {}s", secs);
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn find(app: &App, target: &str) -> Result<output_core::Device> {
    resolve_device(&app.worker.snapshot(), target)
        .ok_or_else(|| anyhow::anyhow!("no output device {}", target))
}

#[cfg(target_os = "macos")]
fn select_hardware(simulate: bool) -> Arc<dyn AudioHardware> {
    if simulate {
        return demo_hardware();
    }
    Arc::new(output_core::CoreAudioHardware::new())
}

#[cfg(not(target_os = "macos"))]
fn select_hardware(simulate: bool) -> Arc<dyn AudioHardware> {
    if !simulate {
        log::warn!("no audio backend for this platform, using simulated devices");
    }
    demo_hardware()
}

/// A small, plausible set of devices for trying the console without hardware.
fn demo_hardware() -> Arc<dyn AudioHardware> {
    use output_core::hal::element;

    let hw = SimulatedHardware::new();
    hw.add_device(SimDevice::output("BuiltInSpeakerDevice", "MacBook Pro Speakers"));
    hw.add_device(
        SimDevice::output("bt-headphones", "Headphones")
            .with_volume_elements(&[(element::LEFT, 0.6), (element::RIGHT, 0.6)]),
    );
    hw.add_device(SimDevice::output("hdmi-display", "Display Audio").with_volume_elements(&[]));
    hw.add_device(SimDevice::input_only("BuiltInMicrophoneDevice", "MacBook Pro Microphone"));
    Arc::new(hw)
}

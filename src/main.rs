//! # Attendance Kiosk Entry Point
//!
//! This binary wires the kiosk library to real or simulated devices and runs
//! the cooperative loop on a fixed tokio interval.
//!
//! - `--simulate`: simulated clock and scripted card field, no hardware
//! - `--config <path>`: configuration file (default `kiosk-config.toml`)
//!
//! Event lines and command echo go to the serial device from the config, or
//! to stdout when none is set. Logs go to stderr (`RUST_LOG` to filter).

// Test modules
#[cfg(test)]
mod tests;

#[cfg(all(target_os = "linux", feature = "hardware"))]
mod gpio_cdev;
#[cfg(all(target_os = "linux", feature = "hardware"))]
mod hw_spi_spidev;

use anyhow::Context;
use kiosk_lib::bus::RegisterBus;
use kiosk_lib::config::Config;
use kiosk_lib::kiosk::{Feedback, Kiosk, Panel};
use kiosk_lib::mfrc522::CardReader;
use kiosk_lib::signal::{command_channel, CommandReceiver, CommandSender, IrqFlag};
use kiosk_lib::sim::{date_at, SimClock, SimulatedDs3231, SimulatedField};
use kiosk_lib::spi::NoPin;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Input = Box<dyn Read + Send>;
type Output = Box<dyn Write + Send>;

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    simulate: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--simulate" => parsed.simulate = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }
    Ok(parsed)
}

/// Command input and event output, from the configured serial device or
/// stdin/stdout.
fn open_channel(config: &Config) -> anyhow::Result<(Input, Output)> {
    match &config.serial.device {
        Some(path) => {
            let device = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("open serial device {}", path.display()))?;
            let writer = device.try_clone().context("clone serial handle")?;
            Ok((Box::new(device), Box::new(writer)))
        }
        None => Ok((Box::new(io::stdin()), Box::new(io::stdout()))),
    }
}

/// Feed bytes from `input` into the command ring until it closes.
fn spawn_command_reader(
    mut input: Input,
    mut sender: CommandSender<'static>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("command-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 64];
            loop {
                match input.read(&mut buf) {
                    Ok(0) => {
                        info!(dropped = sender.dropped(), "command input closed");
                        return;
                    }
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            sender.push(byte);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "command input failed");
                        return;
                    }
                }
            }
        })
        .context("spawn command reader")
}

async fn run<C, R, F, W>(
    mut kiosk: Kiosk<C, R, F, W>,
    mut commands: CommandReceiver<'static>,
    interval: Duration,
) -> anyhow::Result<()>
where
    C: RegisterBus,
    R: CardReader,
    F: Feedback,
    W: Write,
{
    kiosk.start();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => kiosk.step(Instant::now(), &mut commands),
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

fn run_simulation(config: &Config, rt: &tokio::runtime::Runtime) -> anyhow::Result<()> {
    info!(
        start = %config.schedule.reset_time,
        taps = config.simulation.taps.len(),
        "running against simulated devices"
    );
    let clock = SimClock::running(date_at(config.schedule.reset_time));
    let alarm = Arc::new(IrqFlag::new());
    let rtc = SimulatedDs3231::new(clock.clone()).with_alarm_line(Arc::clone(&alarm));
    let field = SimulatedField::new(clock, config.simulation.taps.clone());

    let (input, output) = open_channel(config)?;
    let (sender, receiver) = command_channel();
    spawn_command_reader(input, sender)?;

    let kiosk = Kiosk::new(rtc, field, Panel::<NoPin>::new(None), output, config)
        .with_alarm_line(alarm);
    rt.block_on(run(kiosk, receiver, config.timing.poll_interval()))
}

/// Bring up the clock bus, card reader and interrupt lines, then run.
#[cfg(all(target_os = "linux", feature = "hardware"))]
fn run_hardware(config: &Config, rt: &tokio::runtime::Runtime) -> anyhow::Result<()> {
    use crate::gpio_cdev::{watch_falling_edges, CdevOpenDrainPin, CdevOutputPin};
    use crate::hw_spi_spidev::SpidevLink;
    use kiosk_lib::bus::{I2cBus, RetryBudget};
    use kiosk_lib::ds3231::DS3231_ADDRESS;
    use kiosk_lib::mfrc522::Mfrc522;
    use kiosk_lib::spi::SpiRegisters;
    use linux_embedded_hal::gpio_cdev::Chip;

    let hw = &config.hardware;
    let mut chip = Chip::new(&hw.gpio_chip).with_context(|| format!("open {}", hw.gpio_chip))?;

    let scl = CdevOpenDrainPin::new(&mut chip, hw.scl_line).context("request SCL line")?;
    let sda = CdevOpenDrainPin::new(&mut chip, hw.sda_line).context("request SDA line")?;
    let budget =
        RetryBudget::new(config.bus.retry_budget).context("retry_budget must be non-zero")?;
    let mut i2c = I2cBus::new(
        scl,
        sda,
        DS3231_ADDRESS,
        budget,
        Duration::from_micros(config.bus.half_period_us),
    );
    // One-time recovery of a slave left mid-byte by a previous run
    if let Err(error) = i2c.reset_bus(config.bus.reset_pulses) {
        warn!(%error, "clock bus reset failed");
    }
    i2c.clear_fault();

    let spi = SpidevLink::open(&hw.spi_device, hw.spi_speed_hz)
        .with_context(|| format!("open {}", hw.spi_device))?;
    let cs = hw
        .cs_line
        .map(|line| CdevOutputPin::new(&mut chip, line))
        .transpose()
        .context("request chip select line")?;
    let mut reader = Mfrc522::new(SpiRegisters::new(spi, cs), config.bus.card_poll_budget);
    reader.init().context("initialise card reader")?;
    match reader.version() {
        Ok(version) => info!(version = %format!("{version:#04x}"), "card reader ready"),
        Err(error) => warn!(%error, "card reader version probe failed"),
    }

    let alarm = Arc::new(IrqFlag::new());
    if let Some(line) = hw.rtc_int_line {
        watch_falling_edges(&mut chip, line, Arc::clone(&alarm)).context("watch clock alarm line")?;
    }
    let buzzer = hw
        .buzzer_line
        .map(|line| CdevOutputPin::new(&mut chip, line))
        .transpose()
        .context("request buzzer line")?;

    let (input, output) = open_channel(config)?;
    let (sender, receiver) = command_channel();
    spawn_command_reader(input, sender)?;

    let mut kiosk =
        Kiosk::new(i2c, reader, Panel::new(buzzer), output, config).with_alarm_line(alarm);
    if let Some(line) = hw.rfid_irq_line {
        let ready = Arc::new(IrqFlag::new());
        watch_falling_edges(&mut chip, line, Arc::clone(&ready)).context("watch reader IRQ line")?;
        kiosk = kiosk.gate_reads_on(ready);
    }
    rt.block_on(run(kiosk, receiver, config.timing.poll_interval()))
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = parse_args(env::args().skip(1))?;
    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("load configuration")?;

    // Create Tokio runtime for the poll cadence
    let rt = tokio::runtime::Runtime::new()?;

    if args.simulate {
        return run_simulation(&config, &rt);
    }

    #[cfg(all(target_os = "linux", feature = "hardware"))]
    {
        run_hardware(&config, &rt)
    }

    #[cfg(not(all(target_os = "linux", feature = "hardware")))]
    {
        anyhow::bail!(
            "hardware support not enabled; rebuild with --features hardware on Linux \
             or run with --simulate"
        )
    }
}

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use headset_fleet_lib::app::adb::ping::SystemPinger;
use headset_fleet_lib::app::adb::scrcpy::{MirrorOptions, ScrcpyLauncher};
use headset_fleet_lib::app::adb::transport::AdbTransport;
use headset_fleet_lib::app::config::{load_config, AppConfig};
use headset_fleet_lib::app::logging::{init_logging, resolve_trace_id};
use headset_fleet_lib::app::models::BatchReport;
use headset_fleet_lib::app::orchestrator::{Orchestrator, Stores};
use headset_fleet_lib::AppError;
use serde::Serialize;

const USAGE: &str = "Usage: fleetctl [--json] [--trace-id ID] <command>\n\
Commands:\n  \
devices\n  \
register <target> [--alias NAME]\n  \
promote <serial>\n  \
remove <serial>\n  \
sync\n  \
connect <address>...\n  \
probe <target>...\n  \
actions\n  \
run <action_id> <target>...\n  \
room-run <room_id> <action_id>\n  \
mirror <target>... [--max-fps N] [--bitrate RATE]\n  \
watch [--ticks N]\n";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Devices,
    Register { target: String, alias: Option<String> },
    Promote { serial: String },
    Remove { serial: String },
    Sync,
    Connect { addresses: Vec<String> },
    Probe { targets: Vec<String> },
    Actions,
    Run { action_id: String, targets: Vec<String> },
    RoomRun { room_id: String, action_id: String },
    Mirror { targets: Vec<String>, options: MirrorOptions },
    Watch { ticks: Option<u64> },
}

#[derive(Debug, Clone)]
struct Args {
    json: bool,
    trace_id: Option<String>,
    command: Command,
}

fn required(value: Option<String>, flag: &str) -> Result<String, String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(value: String, flag: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("{flag} expects a number, got {value}"))
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut json = false;
    let mut trace_id = None;
    let mut alias = None;
    let mut ticks = None;
    let mut options = MirrorOptions::default();
    let mut positional = Vec::new();

    let mut it = raw.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--trace-id" => trace_id = Some(required(it.next(), "--trace-id")?),
            "--alias" => alias = Some(required(it.next(), "--alias")?),
            "--ticks" => ticks = Some(parse_number(required(it.next(), "--ticks")?, "--ticks")?),
            "--max-fps" => {
                let value = required(it.next(), "--max-fps")?;
                options.max_fps = Some(parse_number(value, "--max-fps")?);
            }
            "--bitrate" => options.bitrate = Some(required(it.next(), "--bitrate")?),
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("Unknown arg: {other}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or_else(|| USAGE.to_string())?;
    let rest: Vec<String> = positional.collect();
    let needs = |count: usize| -> Result<(), String> {
        if rest.len() < count {
            Err(format!("{name} needs at least {count} argument(s)\n{USAGE}"))
        } else {
            Ok(())
        }
    };

    let command = match name.as_str() {
        "devices" => Command::Devices,
        "register" => {
            needs(1)?;
            Command::Register {
                target: rest[0].clone(),
                alias,
            }
        }
        "promote" => {
            needs(1)?;
            Command::Promote { serial: rest[0].clone() }
        }
        "remove" => {
            needs(1)?;
            Command::Remove { serial: rest[0].clone() }
        }
        "sync" => Command::Sync,
        "connect" => {
            needs(1)?;
            Command::Connect { addresses: rest }
        }
        "probe" => {
            needs(1)?;
            Command::Probe { targets: rest }
        }
        "actions" => Command::Actions,
        "run" => {
            needs(2)?;
            Command::Run {
                action_id: rest[0].clone(),
                targets: rest[1..].to_vec(),
            }
        }
        "room-run" => {
            needs(2)?;
            Command::RoomRun {
                room_id: rest[0].clone(),
                action_id: rest[1].clone(),
            }
        }
        "mirror" => {
            needs(1)?;
            Command::Mirror { targets: rest, options }
        }
        "watch" => Command::Watch { ticks },
        other => return Err(format!("Unknown command: {other}\n{USAGE}")),
    };

    Ok(Args {
        json,
        trace_id,
        command,
    })
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) {
    if json {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        println!("{}", text(value));
    }
}

fn batch_text(report: &BatchReport<String>) -> String {
    let mut lines: Vec<String> = report
        .items
        .iter()
        .map(|item| {
            let mark = if item.ok { "ok  " } else { "FAIL" };
            format!("{mark} {}: {}", item.target, item.detail)
        })
        .collect();
    lines.push(format!("{} succeeded, {} failed", report.success, report.failed));
    lines.join("\n")
}

fn progress(done: usize, total: usize) {
    eprintln!("[{done}/{total}]");
}

fn run(args: Args, orchestrator: &Orchestrator, trace_id: &str) -> Result<(), AppError> {
    let json = args.json;
    let on_progress: Option<&dyn Fn(usize, usize)> = if json { None } else { Some(&progress) };

    match args.command {
        Command::Devices => {
            let devices = orchestrator.devices();
            let stats = orchestrator.statistics();
            emit(json, &(devices, stats), |(devices, stats)| {
                let mut lines: Vec<String> = devices
                    .iter()
                    .map(|device| {
                        format!(
                            "{:<20} {:<22} {:<14} {:>3}% {:>5.1}C {}",
                            device.display_name(),
                            device.connection_string(),
                            device.status.as_str(),
                            device.battery,
                            device.temperature,
                            device.ping_ms.map(|ms| format!("{ms:.1}ms")).unwrap_or_default()
                        )
                    })
                    .collect();
                lines.push(format!(
                    "{} devices, {} online, {} low battery, {} hot",
                    stats.total, stats.online, stats.low_battery, stats.high_temperature
                ));
                lines.join("\n")
            });
        }
        Command::Register { target, alias } => {
            let device = orchestrator.register_device(&target, alias.as_deref(), trace_id)?;
            emit(json, &device, |device| {
                format!("registered {} ({})", device.display_name(), device.serial)
            });
        }
        Command::Promote { serial } => {
            let device = orchestrator.promote_to_wifi(&serial, trace_id)?;
            emit(json, &device, |device| {
                format!("{} now on {}", device.serial, device.connection_string())
            });
        }
        Command::Remove { serial } => {
            let device = orchestrator.remove_device(&serial, trace_id)?;
            emit(json, &device, |device| {
                format!("removed {} ({})", device.display_name(), device.serial)
            });
        }
        Command::Sync => {
            let report = orchestrator.sync_devices(trace_id)?;
            emit(json, &report, |report| {
                let mut lines: Vec<String> = report
                    .changes
                    .iter()
                    .map(|change| {
                        format!(
                            "{}: {} -> {}",
                            change.serial,
                            change.from.as_str(),
                            change.to.as_str()
                        )
                    })
                    .collect();
                lines.push(format!(
                    "{} changes, {} probed, {} saved",
                    report.changes.len(),
                    report.probed.len(),
                    report.persisted
                ));
                lines.join("\n")
            });
        }
        Command::Connect { addresses } => {
            let report = orchestrator.connect_batch(addresses, on_progress, trace_id)?;
            emit(json, &report, batch_text);
        }
        Command::Probe { targets } => {
            let batch = orchestrator.probe_batch(targets, on_progress, trace_id)?;
            emit(json, &batch, |batch| batch_text(&batch.report));
        }
        Command::Actions => {
            let actions = orchestrator.stores().actions.all();
            emit(json, &actions, |actions| {
                actions
                    .iter()
                    .map(|action| {
                        format!(
                            "{} {:<24} {:<12} runs {} ({:.0}% ok)",
                            action.action_id,
                            action.name,
                            action.action_type.as_str(),
                            action.execution_count,
                            action.success_rate()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        }
        Command::Run { action_id, targets } => {
            let report = orchestrator.run_action_batch(&action_id, targets, on_progress, trace_id)?;
            emit(json, &report, batch_text);
        }
        Command::RoomRun { room_id, action_id } => {
            let report = orchestrator.run_room_action(&room_id, &action_id, on_progress, trace_id)?;
            emit(json, &report, batch_text);
        }
        Command::Mirror { targets, options } => {
            let report =
                orchestrator.launch_mirror_batch(targets, &options, on_progress, trace_id)?;
            emit(json, &report, batch_text);
        }
        Command::Watch { ticks } => {
            let interval = Duration::from_secs(orchestrator.config().network.ping_interval_secs);
            let mut tick = 0u64;
            while ticks.map(|limit| tick < limit).unwrap_or(true) {
                let tick_trace = format!("{trace_id}-{tick}");
                match orchestrator.sync_devices(&tick_trace) {
                    Ok(report) => emit(json, &report, |report| {
                        format!(
                            "tick {tick}: {} changes, {} probed",
                            report.changes.len(),
                            report.probed.len()
                        )
                    }),
                    Err(err) => eprintln!("tick {tick}: sync failed: {err}"),
                }
                let polled = orchestrator.poll_tick(&tick_trace)?;
                emit(json, &polled, |polled| {
                    let oldest = polled
                        .oldest_in_flight_ms
                        .map(|ms| format!(" (oldest {ms}ms)"))
                        .unwrap_or_default();
                    format!(
                        "tick {tick}: {} checks queued, {} updated, {} in flight{oldest}",
                        polled.submitted,
                        polled.updated.len(),
                        polled.in_flight
                    )
                });
                tick += 1;
                thread::sleep(interval);
            }
        }
    }
    Ok(())
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    let trace_id = resolve_trace_id(args.trace_id.clone());

    let config = match load_config(&trace_id) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.log_level);

    let orchestrator = match build(config, &trace_id) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let result = run(args, &orchestrator, &trace_id);
    orchestrator.shutdown();
    if let Err(err) = result {
        eprintln!("{} [{}] trace_id={}", err.error, err.code, err.trace_id);
        std::process::exit(err.exit_code());
    }
}

fn build(config: AppConfig, trace_id: &str) -> Result<Orchestrator, AppError> {
    let transport = Arc::new(AdbTransport::new(&config.adb, trace_id)?);
    let launcher = Arc::new(ScrcpyLauncher::new(config.scrcpy.clone()));
    let stores = Stores::open(&config.data_dir(), trace_id)?;
    Orchestrator::new(config, transport, Arc::new(SystemPinger), launcher, stores, trace_id)
}

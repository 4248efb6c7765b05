use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use prompt_stacker::actions::{ActionDriver, DryRunDriver};
use prompt_stacker::cli::{Cli, Command};
use prompt_stacker::config::{CONFIG_DIR, StackerConfig};
use prompt_stacker::controller::{self, AutomationController};
use prompt_stacker::log::{self, ExecutionLog};
use prompt_stacker::progress::ProgressEvent;
use prompt_stacker::session::{AutomationState, Role};
use prompt_stacker::watchdog::Watchdog;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .stacker/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

fn render_config_human(config: &StackerConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Session\n");
    push_kv(&mut output, "prompts", config.session.prompts.len());
    push_kv(&mut output, "target_title", &config.session.target_title);
    output.push('\n');

    output.push_str("Timers\n");
    for (name, secs) in config.timers.entries() {
        push_kv(&mut output, name, format!("{secs}s"));
    }
    output.push('\n');

    output.push_str("Coordinates\n");
    let coordinates = config.coordinates.to_coordinates();
    for role in Role::ALL {
        match coordinates.get(&role) {
            Some(point) => push_kv(&mut output, role.as_str(), point),
            None => push_kv(&mut output, role.as_str(), "(not set)"),
        }
    }
    output.push('\n');

    output.push_str("Countdown\n");
    push_kv(&mut output, "tick", format!("{}ms", config.countdown.tick_millis));
    push_kv(&mut output, "poll_divisor", config.countdown.poll_divisor);
    push_kv(&mut output, "grace_ticks", config.countdown.grace_ticks);
    output.push('\n');

    output.push_str("Controller\n");
    push_kv(
        &mut output,
        "pause_timeout",
        format!("{}s", config.controller.pause_timeout_secs),
    );
    push_kv(
        &mut output,
        "stop_join_timeout",
        format!("{}s", config.controller.stop_join_timeout_secs),
    );
    push_kv(
        &mut output,
        "max_timer",
        format!("{}s", config.controller.max_timer_secs),
    );
    output.push('\n');

    output.push_str("Watchdog\n");
    push_kv(&mut output, "enabled", config.watchdog.enabled);
    push_kv(&mut output, "period", format!("{}s", config.watchdog.period_secs));
    push_kv(
        &mut output,
        "stuck_threshold",
        format!("{}s", config.watchdog.stuck_threshold_secs),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &StackerConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn render_event(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::Tick(tick) => {
            let paused = if tick.paused { "  [paused]" } else { "" };
            Some(format!(
                "\r\x1b[2K  {}  {:>4}s  next: {}{}",
                tick.label,
                tick.display_secs(),
                tick.next_label,
                paused
            ))
        }
        ProgressEvent::StateChanged { from, to } => {
            Some(format!("\n\x1b[36m[stacker]\x1b[0m {from} → {to}\n"))
        }
        ProgressEvent::PhaseStarted { .. } => None,
        ProgressEvent::IndexChanged { index, total } => Some(format!(
            "\n\x1b[36m[stacker]\x1b[0m prompt {} of {}\n",
            (*index + 1).min(*total),
            total
        )),
        ProgressEvent::Failed { class, message } => Some(format!(
            "\n\x1b[31m[stacker]\x1b[0m ✗ {class} failure: {message}\n"
        )),
        ProgressEvent::Repaired { check, detail } => Some(format!(
            "\n\x1b[33m[stacker]\x1b[0m ⚠ watchdog ({check}): {detail}\n"
        )),
    }
}

/// Read single-letter commands from stdin until it closes.
fn spawn_input_thread(controller: Arc<AutomationController>) -> Result<()> {
    thread::Builder::new()
        .name("stacker-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let accepted = match line.trim() {
                    "" => continue,
                    "p" => controller.toggle_pause(),
                    "s" => controller.skip(),
                    "r" => controller.retry(),
                    "n" => controller.next_prompt(),
                    "c" => controller.cancel(),
                    other => {
                        eprintln!("unknown command '{other}' (p = pause/resume, s = skip, r = retry, n = next, c = cancel)");
                        continue;
                    }
                };
                if !accepted {
                    eprintln!("ignored: automation is {}", controller.state());
                }
            }
        })
        .context("failed to spawn input thread")?;
    Ok(())
}

fn run_session(config: &StackerConfig, project_root: &Path, use_watchdog: bool) -> Result<()> {
    let log_path = log::run_log_path(&project_root.join(CONFIG_DIR), Utc::now());
    let journal = Arc::new(ExecutionLog::new(&log_path)?);
    let driver: Arc<dyn ActionDriver> = Arc::new(DryRunDriver::new(&config.session.target_title));
    let controller = Arc::new(
        AutomationController::new(config.session_state(), driver, config.controller_config())
            .with_journal(journal),
    );
    controller.on_progress(|event| {
        if let Some(line) = render_event(event) {
            eprint!("{line}");
        }
    });

    let run_id = controller.start().context("failed to start automation")?;
    println!("\x1b[36m[stacker]\x1b[0m run {run_id}");
    println!("\x1b[36m[stacker]\x1b[0m log: {}", log_path.display());
    println!("\x1b[36m[stacker]\x1b[0m controls: p = pause/resume, s = skip, r = retry, n = next, c = cancel");

    {
        let controller = controller.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            controller.cancel();
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let watchdog = if use_watchdog && config.watchdog.enabled {
        let handle = Watchdog::new(controller.clone(), config.watchdog_config())
            .spawn(stop.clone())
            .context("failed to spawn watchdog")?;
        Some(handle)
    } else {
        info!("watchdog disabled");
        None
    };

    spawn_input_thread(controller.clone())?;

    let final_state = loop {
        if let Some(state) = controller.wait_for_terminal(Duration::from_millis(500)) {
            break state;
        }
    };

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = watchdog {
        if handle.join().is_err() {
            warn!("watchdog thread panicked");
        }
    }
    let (index, total) = controller.progress();
    if let Err(e) = controller.stop() {
        warn!(error = %e, "run worker did not shut down cleanly");
    }

    println!();
    println!("\x1b[36m[stacker]\x1b[0m run {run_id} {final_state} after {index} of {total} prompts");
    if final_state != AutomationState::Completed {
        bail!("run {run_id} ended as {final_state}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "stacker=warn,prompt_stacker=warn",
        0 => "stacker=info,prompt_stacker=info",
        1 => "stacker=debug,prompt_stacker=debug",
        _ => "stacker=trace,prompt_stacker=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = StackerConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .stacker/config.toml found, using defaults"),
        }
    }

    // Logs land next to the config file when there is one.
    let project_root = config_path
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .unwrap_or(&cwd)
        .to_path_buf();

    match cli.command {
        Command::Run { no_watchdog } => run_session(&config, &project_root, !no_watchdog)?,
        Command::Check => {
            let session = config.session_state();
            controller::validate(&session.guarded(), config.controller.max_timer_secs)
                .context("configuration is not runnable")?;
            println!(
                "ok: {} prompts, all coordinates set, timers within {}s",
                session.prompts().len(),
                config.controller.max_timer_secs
            );
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}

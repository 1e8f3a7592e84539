use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use status_watch::cli::{Cli, Command};
use status_watch::config::{self, MonitorConfig};
use status_watch::driver::chrome::ChromeLauncher;
use status_watch::log::CycleLog;
use status_watch::monitor::Monitor;
use status_watch::navigator::Navigator;
use status_watch::notify::{NotifyError, SmtpNotifier};
use status_watch::scheduler::{self, Scheduler, SchedulerConfig};
use status_watch::shell_completion;
use status_watch::store::FileStatusStore;

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "status_watch=warn",
        0 => "status_watch=info",
        1 => "status_watch=debug",
        _ => "status_watch=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Command::Completions { shell } = cli.command {
        shell_completion::print(shell)?;
        return Ok(ExitCode::SUCCESS);
    }

    // Nothing touches the network until the whole environment checks out.
    let config = MonitorConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    config::render_json(&config).context("failed to serialize config to JSON")?
                );
            } else {
                print!("{}", config::render_human(&config));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { event_log } => {
            let log = event_log.as_deref().map(CycleLog::new).transpose()?;
            let schedule = SchedulerConfig {
                interval: scheduler::DEFAULT_INTERVAL,
                cycle_budget: config.cycle_timeout,
            };
            run(&config, schedule, log.as_ref(), Mode::Once).await
        }
        Command::Watch {
            interval_mins,
            event_log,
        } => {
            let log = event_log.as_deref().map(CycleLog::new).transpose()?;
            let schedule = SchedulerConfig {
                interval: Duration::from_secs(interval_mins * 60),
                cycle_budget: config.cycle_timeout,
            };
            run(&config, schedule, log.as_ref(), Mode::Loop).await
        }
        Command::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

enum Mode {
    Once,
    Loop,
}

async fn run(
    config: &MonitorConfig,
    schedule: SchedulerConfig,
    log: Option<&CycleLog>,
    mode: Mode,
) -> Result<ExitCode> {
    let launcher = ChromeLauncher::new(config.headless, config.check_timeout);
    let monitor = Monitor::new(
        FileStatusStore::new(config.status_file.clone()),
        SmtpNotifier::new(&config.mail),
    );
    let navigator = Navigator::from_config(config);

    let mut scheduler = Scheduler::new(&launcher, &monitor, &navigator, schedule);
    if let Some(log) = log {
        scheduler = scheduler.with_log(log);
    }

    match mode {
        Mode::Once => {
            let result = scheduler.run_check().await;
            println!("{}", scheduler::summary_line(&result));
            if let Ok(report) = &result
                && let Some(NotifyError::AuthenticationRejected { .. }) =
                    report.outcome.notify_error()
            {
                error!("fix the mail credentials; the change will be re-sent on the next check");
            }
            if scheduler::cycle_failed(&result) {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Mode::Loop => {
            let stats = scheduler.watch(shutdown_signal()).await;
            info!(cycles = stats.cycles, failed = stats.failed, "watch stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

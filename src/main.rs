use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use sysjobs::config::{self, Config, LoggingConfig};
use sysjobs::manager::{
    job_channel, BusScope, CallContext, JobMode, JobReceiver, JobResult, ManagerClient,
    UnitProperty, Who, ZbusTransport,
};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sysjobs")]
#[command(author, version, about = "Drive systemd units and wait for their jobs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Talk to the calling user's service manager
    #[arg(long, global = true)]
    user: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Do not wait for jobs to finish
    #[arg(long, global = true)]
    no_block: bool,

    /// Use this config file instead of the default one
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a unit
    Start(JobArgs),

    /// Stop a unit
    Stop(JobArgs),

    /// Restart a unit
    Restart(JobArgs),

    /// Restart a unit if it is running
    TryRestart(JobArgs),

    /// Reload a unit's configuration
    Reload(JobArgs),

    /// Reload a unit if supported, restart it otherwise
    ReloadOrRestart(JobArgs),

    /// Reload a unit if supported, restart it if running
    ReloadOrTryRestart(JobArgs),

    /// Run a command as a transient service
    Run {
        /// Unit name, e.g. "backup-once.service"
        name: String,

        /// Unit description
        #[arg(long)]
        description: Option<String>,

        /// Keep the unit active after the command exits
        #[arg(long)]
        remain_after_exit: bool,

        /// Extra unit properties as NAME=VALUE
        #[arg(short, long = "property", value_name = "NAME=VALUE")]
        properties: Vec<String>,

        /// Job mode (replace, fail, isolate, ...)
        #[arg(long)]
        mode: Option<JobMode>,

        /// Command line to run
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Send a signal to a unit's processes
    Kill {
        unit: String,

        /// Which processes: all, main, control
        #[arg(long, default_value = "all")]
        kill_whom: Who,

        /// Signal name or number
        #[arg(short, long, default_value = "SIGTERM")]
        signal: String,
    },

    /// Reset a unit's failed state
    ResetFailed { unit: String },

    /// Show unit properties
    Show {
        unit: String,

        /// Only show these properties
        #[arg(short, long)]
        property: Vec<String>,

        /// Read the type specific interface, e.g. "Service" or "Timer"
        #[arg(short = 't', long = "type")]
        unit_type: Option<String>,
    },

    /// Change unit properties
    SetProperty {
        unit: String,

        /// Assignments as NAME=VALUE
        #[arg(required = true, value_name = "NAME=VALUE")]
        assignments: Vec<String>,

        /// Only until the manager restarts
        #[arg(long)]
        runtime: bool,
    },

    /// List loaded units
    ListUnits(ListArgs),

    /// List installed unit files
    ListUnitFiles(ListArgs),

    /// List queued jobs
    ListJobs,

    /// Enable unit files
    Enable(UnitFileArgs),

    /// Disable unit files
    Disable(UnitFileArgs),

    /// Mask unit files
    Mask(UnitFileArgs),

    /// Unmask unit files
    Unmask(UnitFileArgs),

    /// Reload the manager configuration
    DaemonReload,

    /// Print the manager's overall state
    IsSystemRunning,

    /// Show configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Args)]
struct JobArgs {
    unit: String,

    /// Job mode (replace, fail, isolate, ...)
    #[arg(long)]
    mode: Option<JobMode>,
}

#[derive(Args)]
struct ListArgs {
    /// Only entries in this state (repeatable)
    #[arg(long)]
    state: Vec<String>,

    /// Only names matching this glob (repeatable)
    #[arg(long)]
    pattern: Vec<String>,
}

#[derive(Args)]
struct UnitFileArgs {
    #[arg(required = true)]
    files: Vec<String>,

    /// Only until the next reboot
    #[arg(long)]
    runtime: bool,

    /// Replace conflicting symlinks
    #[arg(long)]
    force: bool,
}

#[derive(Clone, Copy)]
enum Lifecycle {
    Start,
    Stop,
    Restart,
    TryRestart,
    Reload,
    ReloadOrRestart,
    ReloadOrTryRestart,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("sysjobs=debug,zbus=info")
    } else {
        EnvFilter::new(format!("sysjobs={},zbus=warn", logging.level))
    };

    let (file_layer, guard) = match logging.directory() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sysjobs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Parse a signal given as a number, `SIGTERM` or `TERM`.
#[cfg(unix)]
fn parse_signal(signal: &str) -> anyhow::Result<i32> {
    use nix::sys::signal::Signal;

    if let Ok(number) = signal.parse::<i32>() {
        return Ok(Signal::try_from(number)
            .with_context(|| format!("Unknown signal number {}", number))? as i32);
    }

    let name = signal.to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };
    let parsed: Signal = name
        .parse()
        .with_context(|| format!("Unknown signal {}", signal))?;
    Ok(parsed as i32)
}

#[cfg(not(unix))]
fn parse_signal(signal: &str) -> anyhow::Result<i32> {
    signal
        .parse()
        .with_context(|| format!("Unknown signal {}", signal))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print rows as left-aligned columns, the last column unpadded.
fn print_table(header: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    print_row(header, &widths);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        print_row(&cells, &widths);
    }
    println!("\n{} entries listed.", rows.len());
}

fn print_row(cells: &[&str], widths: &[usize]) {
    let last = cells.len().saturating_sub(1);
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(i, (cell, width))| {
            if i == last {
                cell.to_string()
            } else {
                format!("{:<width$}", cell, width = width)
            }
        })
        .collect();
    println!("{}", line.join(" "));
}

/// Wait for a job's result, bounded by the wait timeout and Ctrl-C.
async fn wait_for_job(
    ctx: &CallContext,
    unit: &str,
    job_id: u32,
    rx: JobReceiver,
    config: &Config,
) -> anyhow::Result<JobResult> {
    debug!("Waiting for job {} ({})", job_id, unit);
    let result = match config.jobs.wait_timeout() {
        Some(after) => tokio::select! {
            _ = ctx.token().cancelled() => bail!("Interrupted while waiting for job {}", job_id),
            outcome = tokio::time::timeout(after, rx) => outcome
                .with_context(|| format!("Job {} for {} did not finish within {:?}", job_id, unit, after))?,
        },
        None => tokio::select! {
            _ = ctx.token().cancelled() => bail!("Interrupted while waiting for job {}", job_id),
            outcome = rx => outcome,
        },
    };
    result.with_context(|| format!("Lost track of job {} for {}", job_id, unit))
}

/// Report a job's id, then its result unless `--no-block` was given.
async fn finish_job(
    cli: &Cli,
    ctx: &CallContext,
    config: &Config,
    unit: &str,
    job_id: u32,
    rx: Option<JobReceiver>,
) -> anyhow::Result<()> {
    let Some(rx) = rx else {
        if cli.json {
            print_json(&serde_json::json!({ "unit": unit, "job": job_id }))?;
        } else {
            println!("Enqueued job {} for {}", job_id, unit);
        }
        return Ok(());
    };

    let result = wait_for_job(ctx, unit, job_id, rx, config).await?;
    if cli.json {
        print_json(&serde_json::json!({ "unit": unit, "job": job_id, "result": result }))?;
    }
    if !result.is_done() {
        bail!("Job {} for {} finished with result: {}", job_id, unit, result);
    }
    info!("Job {} for {} done", job_id, unit);
    Ok(())
}

async fn lifecycle(
    client: &ManagerClient<ZbusTransport>,
    cli: &Cli,
    ctx: &CallContext,
    config: &Config,
    op: Lifecycle,
    args: &JobArgs,
) -> anyhow::Result<()> {
    let mode = args.mode.unwrap_or(config.jobs.mode);
    let (tx, rx) = notify_pair(cli.no_block);
    let unit = args.unit.as_str();

    let job_id = match op {
        Lifecycle::Start => client.start_unit(ctx, unit, mode, tx).await?,
        Lifecycle::Stop => client.stop_unit(ctx, unit, mode, tx).await?,
        Lifecycle::Restart => client.restart_unit(ctx, unit, mode, tx).await?,
        Lifecycle::TryRestart => client.try_restart_unit(ctx, unit, mode, tx).await?,
        Lifecycle::Reload => client.reload_unit(ctx, unit, mode, tx).await?,
        Lifecycle::ReloadOrRestart => client.reload_or_restart_unit(ctx, unit, mode, tx).await?,
        Lifecycle::ReloadOrTryRestart => {
            client
                .reload_or_try_restart_unit(ctx, unit, mode, tx)
                .await?
        }
    };

    finish_job(cli, ctx, config, unit, job_id, rx).await
}

fn notify_pair(
    no_block: bool,
) -> (Option<sysjobs::manager::JobSender>, Option<JobReceiver>) {
    if no_block {
        (None, None)
    } else {
        let (tx, rx) = job_channel();
        (Some(tx), Some(rx))
    }
}

/// Load the config. Also returns the default file's path when this call
/// created it, so it can be reported once logging is up.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    match path {
        Some(path) => {
            let config = Config::load_from(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            Ok((config, None))
        }
        None => {
            let default_path = Config::config_path()?;
            let created = (!default_path.exists()).then_some(default_path);
            Ok((Config::load()?, created))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Commands::Config { show } = &cli.command {
        if *show {
            config::show(cli.config.as_deref())?;
        } else {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => Config::config_path()?,
            };
            println!("{}", path.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let (config, created) = load_config(cli.config.as_ref())?;
    let _guard = init_logging(cli.verbose, &config.logging);
    if let Some(path) = created {
        info!("Created default config at {}", path.display());
    }

    let ctx = match config.jobs.call_timeout() {
        Some(after) => CallContext::with_timeout(after),
        None => CallContext::background(),
    };
    let interrupt = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let scope = if cli.user {
        BusScope::User
    } else {
        config.bus.scope
    };
    let transport = ZbusTransport::connect(scope).await?;
    let client = ManagerClient::connect(transport).await?;

    let code = run(&client, &cli, &ctx, &config).await;
    client.close();
    code
}

async fn run(
    client: &ManagerClient<ZbusTransport>,
    cli: &Cli,
    ctx: &CallContext,
    config: &Config,
) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::Start(args) => lifecycle(client, cli, ctx, config, Lifecycle::Start, args).await?,
        Commands::Stop(args) => lifecycle(client, cli, ctx, config, Lifecycle::Stop, args).await?,
        Commands::Restart(args) => {
            lifecycle(client, cli, ctx, config, Lifecycle::Restart, args).await?
        }
        Commands::TryRestart(args) => {
            lifecycle(client, cli, ctx, config, Lifecycle::TryRestart, args).await?
        }
        Commands::Reload(args) => {
            lifecycle(client, cli, ctx, config, Lifecycle::Reload, args).await?
        }
        Commands::ReloadOrRestart(args) => {
            lifecycle(client, cli, ctx, config, Lifecycle::ReloadOrRestart, args).await?
        }
        Commands::ReloadOrTryRestart(args) => {
            lifecycle(client, cli, ctx, config, Lifecycle::ReloadOrTryRestart, args).await?
        }

        Commands::Run {
            name,
            description,
            remain_after_exit,
            properties,
            mode,
            argv,
        } => {
            let mut unit_properties = vec![
                UnitProperty::description(
                    description.as_deref().unwrap_or(&argv.join(" ")),
                ),
                UnitProperty::exec_start(argv[0].clone(), argv.clone(), false),
            ];
            if *remain_after_exit {
                unit_properties.push(UnitProperty::remain_after_exit(true));
            }
            for assignment in properties {
                let property = UnitProperty::parse_assignment(assignment)
                    .with_context(|| format!("Expected NAME=VALUE, got {:?}", assignment))?;
                unit_properties.push(property);
            }

            let mode = mode.unwrap_or(config.jobs.mode);
            let (tx, rx) = notify_pair(cli.no_block);
            let job_id = client
                .start_transient_unit(ctx, name, mode, &unit_properties, tx)
                .await?;
            finish_job(cli, ctx, config, name, job_id, rx).await?;
        }

        Commands::Kill {
            unit,
            kill_whom,
            signal,
        } => {
            let signal = parse_signal(signal)?;
            client.kill_unit(ctx, unit, *kill_whom, signal).await?;
        }

        Commands::ResetFailed { unit } => client.reset_failed_unit(ctx, unit).await?,

        Commands::Show {
            unit,
            property,
            unit_type,
        } => {
            let all = match unit_type {
                Some(unit_type) => client.get_unit_type_properties(ctx, unit, unit_type).await?,
                None => client.get_unit_properties(ctx, unit).await?,
            };
            let selected: BTreeMap<_, _> = all
                .into_iter()
                .filter(|(name, _)| property.is_empty() || property.contains(name))
                .collect();

            if cli.json {
                print_json(&selected)?;
            } else {
                for (name, value) in &selected {
                    println!("{}={}", name, value);
                }
            }
        }

        Commands::SetProperty {
            unit,
            assignments,
            runtime,
        } => {
            let properties = assignments
                .iter()
                .map(|a| {
                    UnitProperty::parse_assignment(a)
                        .with_context(|| format!("Expected NAME=VALUE, got {:?}", a))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            client
                .set_unit_properties(ctx, unit, *runtime, &properties)
                .await?;
        }

        Commands::ListUnits(args) => {
            let units = if args.pattern.is_empty() {
                if args.state.is_empty() {
                    client.list_units(ctx).await?
                } else {
                    client.list_units_filtered(ctx, &args.state).await?
                }
            } else {
                client
                    .list_units_by_patterns(ctx, &args.state, &args.pattern)
                    .await?
            };

            if cli.json {
                print_json(&units)?;
            } else {
                let rows: Vec<Vec<String>> = units
                    .iter()
                    .map(|u| {
                        vec![
                            u.name.clone(),
                            u.load_state.clone(),
                            u.active_state.clone(),
                            u.sub_state.clone(),
                            u.description.clone(),
                        ]
                    })
                    .collect();
                print_table(&["UNIT", "LOAD", "ACTIVE", "SUB", "DESCRIPTION"], &rows);
            }
        }

        Commands::ListUnitFiles(args) => {
            let files = if args.state.is_empty() && args.pattern.is_empty() {
                client.list_unit_files(ctx).await?
            } else {
                client
                    .list_unit_files_by_patterns(ctx, &args.state, &args.pattern)
                    .await?
            };

            if cli.json {
                print_json(&files)?;
            } else {
                let rows: Vec<Vec<String>> = files
                    .iter()
                    .map(|f| vec![f.path.clone(), f.state.clone()])
                    .collect();
                print_table(&["UNIT FILE", "STATE"], &rows);
            }
        }

        Commands::ListJobs => {
            let jobs = client.list_jobs(ctx).await?;
            if cli.json {
                print_json(&jobs)?;
            } else {
                let rows: Vec<Vec<String>> = jobs
                    .iter()
                    .map(|j| {
                        vec![
                            j.id.to_string(),
                            j.unit.clone(),
                            j.job_type.clone(),
                            j.state.clone(),
                        ]
                    })
                    .collect();
                print_table(&["JOB", "UNIT", "TYPE", "STATE"], &rows);
            }
        }

        Commands::Enable(args) => {
            let (carries_install_info, changes) = client
                .enable_unit_files(ctx, &args.files, args.runtime, args.force)
                .await?;
            if !carries_install_info {
                eprintln!("The unit files have no installation config, nothing was enabled.");
            }
            report_changes(cli, &changes)?;
        }

        Commands::Disable(args) => {
            let changes = client
                .disable_unit_files(ctx, &args.files, args.runtime)
                .await?;
            report_changes(cli, &changes)?;
        }

        Commands::Mask(args) => {
            let changes = client
                .mask_unit_files(ctx, &args.files, args.runtime, args.force)
                .await?;
            report_changes(cli, &changes)?;
        }

        Commands::Unmask(args) => {
            let changes = client
                .unmask_unit_files(ctx, &args.files, args.runtime)
                .await?;
            report_changes(cli, &changes)?;
        }

        Commands::DaemonReload => client.reload(ctx).await?,

        Commands::IsSystemRunning => {
            let state = client.system_state(ctx).await?;
            if cli.json {
                print_json(&state)?;
            } else {
                println!("{}", state.value);
            }
            if state.value.as_str() != Some("running") {
                return Ok(ExitCode::FAILURE);
            }
        }

        // Handled before connecting
        Commands::Config { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

fn report_changes(cli: &Cli, changes: &[sysjobs::manager::UnitFileChange]) -> anyhow::Result<()> {
    if cli.json {
        return print_json(&changes);
    }
    for change in changes {
        match change.change.as_str() {
            "symlink" => println!(
                "Created symlink {} -> {}",
                change.filename, change.destination
            ),
            "unlink" => println!("Removed {}", change.filename),
            other => println!("{} {} {}", other, change.filename, change.destination),
        }
    }
    Ok(())
}

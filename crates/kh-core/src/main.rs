//! kill-hogs CLI entry point.

use clap::{Args, Parser, Subcommand};
use kh_common::error::format_error_human;
use kh_common::StructuredError;
use kh_config::{load_settings, LoadedSettings, Overrides};
use kh_core::enforce::FileRequestFlag;
use kh_core::exit_codes::ExitCode;
use kh_core::logging::{event_names, init_logging, LogConfig, LogFormat, LogLevel};
use kh_core::run::{request_enforcement, run_once, LiveCollaborators};
use std::path::PathBuf;
use tracing::{error, info};

/// Resource-usage enforcement for shared login nodes
#[derive(Parser)]
#[command(name = "kill-hogs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalOpts,

    #[command(flatten)]
    run: RunArgs,
}

impl Cli {
    /// Arguments for an enforcement run.
    ///
    /// Run flags may be given before or after `run`; both places count.
    fn run_args(&self) -> RunArgs {
        match &self.command {
            Some(Commands::Run(after)) => self.run.merge(after),
            _ => self.run.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to kill_hogs.yml (otherwise KILL_HOGS_CONFIG, ~/.kill_hogs, /etc/kill_hogs)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format on stderr: human or jsonl
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sample processes and enforce limits once (default)
    Run(RunArgs),

    /// Request enforcement by the next --request-only run
    Request,

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Summed memory percentage above which an account is killed [default: 10]
    #[arg(long, value_name = "PERCENT")]
    memory_threshold: Option<f64>,

    /// Summed CPU percentage (100 per core) above which an account is killed [default: 600]
    #[arg(long, value_name = "PERCENT")]
    cpu_threshold: Option<f64>,

    /// GPU wall-time ceiling in minutes; 0 disables GPU accounting [default: 0]
    #[arg(long, value_name = "MINUTES")]
    gpu_max_walltime: Option<f64>,

    /// CPU measurement window in seconds [default: 0.3]
    #[arg(long, value_name = "SECONDS")]
    cpu_interval: Option<f64>,

    /// Only report what would be killed
    #[arg(long)]
    dummy: bool,

    /// Mail offenders when their processes are killed
    #[arg(long)]
    email: bool,

    /// Post reports to the chat webhook
    #[arg(long)]
    slack: bool,

    /// Only act when enforcement was requested with `kill-hogs request`
    #[arg(long)]
    request_only: bool,
}

impl RunArgs {
    /// Combine top-level flags with those given after the `run` subcommand.
    /// Values after `run` win; switches set in either place stay set.
    fn merge(&self, after: &RunArgs) -> RunArgs {
        RunArgs {
            memory_threshold: after.memory_threshold.or(self.memory_threshold),
            cpu_threshold: after.cpu_threshold.or(self.cpu_threshold),
            gpu_max_walltime: after.gpu_max_walltime.or(self.gpu_max_walltime),
            cpu_interval: after.cpu_interval.or(self.cpu_interval),
            dummy: self.dummy || after.dummy,
            email: self.email || after.email,
            slack: self.slack || after.slack,
            request_only: self.request_only || after.request_only,
        }
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            memory_threshold: self.memory_threshold,
            cpu_threshold: self.cpu_threshold,
            gpu_max_walltime: self.gpu_max_walltime,
            cpu_interval: self.cpu_interval,
            dummy: self.dummy,
            email: self.email,
            slack: self.slack,
            request_only: self.request_only,
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not errors.
            let code = if e.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Clean
            };
            let _ = e.print();
            std::process::exit(code.as_i32());
        }
    };

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    let log_config = LogConfig::from_env(cli_level, cli.global.log_format);
    init_logging(&log_config);

    let exit_code = match &cli.command {
        None | Some(Commands::Run(_)) => {
            run_enforcement(&cli.global, &log_config, &cli.run_args())
        }
        Some(Commands::Request) => run_request(&cli.global, &log_config),
        Some(Commands::CheckConfig) => run_check_config(&cli.global, &log_config),
    };

    std::process::exit(exit_code.as_i32());
}

fn report_error(log_config: &LogConfig, err: &kh_common::Error) {
    error!(code = err.code(), category = %err.category(), "{err}");
    match log_config.format {
        LogFormat::Human => eprintln!("{}", format_error_human(err)),
        LogFormat::Jsonl => eprintln!("{}", StructuredError::from(err).to_json()),
    }
}

fn load(
    global: &GlobalOpts,
    log_config: &LogConfig,
    overrides: &Overrides,
) -> Result<LoadedSettings, ExitCode> {
    match load_settings(global.config.as_deref(), overrides) {
        Ok(loaded) => {
            info!(
                target: event_names::CONFIG_LOADED,
                source = %loaded.source,
                path = ?loaded.path,
                "configuration loaded"
            );
            Ok(loaded)
        }
        Err(e) => {
            let err: kh_common::Error = e.into();
            error!(target: event_names::CONFIG_ERROR, "{err}");
            report_error(log_config, &err);
            Err(ExitCode::ConfigError)
        }
    }
}

fn run_enforcement(global: &GlobalOpts, log_config: &LogConfig, args: &RunArgs) -> ExitCode {
    let loaded = match load(global, log_config, &args.overrides()) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    let live = match LiveCollaborators::from_settings(&loaded.settings) {
        Ok(live) => live,
        Err(e) => {
            let err = e.into();
            report_error(log_config, &err);
            return ExitCode::for_error(&err);
        }
    };

    match run_once(&loaded.settings, live.collaborators()) {
        Ok(summary) => summary.exit_code(),
        Err(e) => {
            let code = e.exit_code();
            report_error(log_config, &e.into());
            code
        }
    }
}

fn run_request(global: &GlobalOpts, log_config: &LogConfig) -> ExitCode {
    let loaded = match load(global, log_config, &Overrides::default()) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    let flag = FileRequestFlag::new(&loaded.settings.request_flag_path);
    match request_enforcement(&flag) {
        Ok(()) => {
            println!(
                "Enforcement requested; the next on-demand run will act ({}).",
                flag.path().display()
            );
            ExitCode::Clean
        }
        Err(e) => {
            let code = if e.is_permission_denied() {
                ExitCode::PermissionError
            } else {
                ExitCode::IoError
            };
            report_error(log_config, &e.into());
            code
        }
    }
}

fn run_check_config(global: &GlobalOpts, log_config: &LogConfig) -> ExitCode {
    let loaded = match load(global, log_config, &Overrides::default()) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    match loaded.settings.to_yaml() {
        Ok(yaml) => {
            match &loaded.path {
                Some(path) => println!("# {} ({})", path.display(), loaded.source),
                None => println!("# {}", loaded.source),
            }
            print!("{yaml}");
            ExitCode::Clean
        }
        Err(e) => {
            report_error(log_config, &kh_common::Error::Config(e.to_string()));
            ExitCode::InternalError
        }
    }
}

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use comics_core::backend::CommandBackend;
use comics_core::{read_job_file, BatchRunner, JobOptions, JobRequest, Orchestrator, Registry};

#[derive(Parser, Debug)]
#[command(name = "comics-down", version, about = "Resumable comic and media downloader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    options: OptionArgs,

    /// Directory jobs are saved under.
    #[arg(long, global = true, env = "COMICS_DOWN_PATH", default_value = ".")]
    path: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    /// Also write logs to a daily file in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve and download a job, or every job of a job file.
    Download {
        url: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// One `url[|name]` per line.
        #[arg(long, conflicts_with_all = ["url", "name"])]
        job_file: Option<PathBuf>,
    },
    /// Resolve volumes and files without downloading.
    Index {
        url: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the stored state of a job.
    Status {
        name: String,
        /// Print the full volume and file tree.
        #[arg(long)]
        files: bool,
    },
    /// List site drivers and transfer types.
    Support,
}

#[derive(Args, Debug)]
struct OptionArgs {
    #[arg(long, global = true, default_value_t = 10)]
    down_worker: usize,
    /// Seconds a single file may take; 0 disables the limit.
    #[arg(long, global = true, default_value_t = 300)]
    down_overtime: u64,
    #[arg(long, global = true, default_value_t = 1)]
    job_worker: usize,
    #[arg(long, global = true)]
    auto_redo: bool,
    #[arg(long, global = true, default_value_t = 10)]
    redo_limit: u32,
    /// Redo failed files for as long as failures occur.
    #[arg(long, global = true)]
    no_redo_limit: bool,
    #[arg(long, global = true)]
    force_update: bool,
    #[arg(long, global = true)]
    search_mode: bool,
    /// Keep `*.tmp` files after a finished job.
    #[arg(long, global = true)]
    keep_tmp: bool,
    #[arg(long, global = true, default_value = comics_core::config::DEFAULT_LEDGER_FILE)]
    ledger_file: String,
    /// Transfer type remap, `from=to`; `*` matches every type.
    #[arg(long = "downtype", global = true, value_parser = parse_pair)]
    downtype_mapping: Vec<(String, String)>,
    #[arg(long, global = true)]
    user_agent: Option<String>,
    /// Connect and read timeout in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    overtime: u64,
    #[arg(long, global = true, default_value_t = 3)]
    connect_retry: u32,
    #[arg(long, global = true)]
    insecure: bool,
    #[arg(long, global = true)]
    proxy: Option<String>,
    /// Bytes per second shared by all transfers.
    #[arg(long, global = true)]
    speed_limit: Option<u64>,
    /// Site driver id instead of routing by URL.
    #[arg(long, global = true)]
    driver: Option<String>,
    #[arg(long = "driver-param", global = true, value_parser = parse_pair)]
    driver_params: Vec<(String, String)>,
    /// External downloader, `type=program arg...` with `{url}`, `{dest}` and
    /// `{dir}` placeholders.
    #[arg(long = "command-backend", global = true, value_parser = parse_pair)]
    command_backends: Vec<(String, String)>,
}

impl OptionArgs {
    fn job_options(&self) -> JobOptions {
        let defaults = JobOptions::default();
        JobOptions {
            down_worker: self.down_worker.max(1),
            down_overtime: (self.down_overtime > 0).then(|| Duration::from_secs(self.down_overtime)),
            job_worker: self.job_worker.max(1),
            auto_redo: self.auto_redo,
            redo_limit: if self.no_redo_limit { None } else { Some(self.redo_limit) },
            force_update: self.force_update,
            search_mode: self.search_mode,
            remove_tmp: !self.keep_tmp,
            ledger_file: self.ledger_file.clone(),
            downtype_mapping: self.downtype_mapping.iter().cloned().collect(),
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent.clone()),
            overtime: Duration::from_secs(self.overtime.max(1)),
            connect_retry: self.connect_retry.max(1),
            verify_tls: !self.insecure,
            down_proxy: self.proxy.clone(),
            speed_limit_bytes_per_sec: self.speed_limit.filter(|limit| *limit > 0),
            site_driver: self.driver.clone(),
            driver_params: self.driver_params.iter().cloned().collect(),
            ..defaults
        }
    }
}

fn parse_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, rest)) if !key.trim().is_empty() => Ok((key.trim().to_string(), rest.trim().to_string())),
        _ => Err(format!("expected key=value, got `{}`", value)),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match logging::init(cli.debug, cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("error: {:#}", err);
            return ExitCode::from(2);
        }
    };
    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let options = cli.options.job_options();
    let registry = build_registry(&cli.options, &options)?;
    let orchestrator = Orchestrator::new(Arc::new(registry), options);

    match cli.command {
        Command::Download {
            url,
            name,
            job_file,
        } => {
            if let Some(job_file) = job_file {
                let entries = read_job_file(&job_file)?;
                if entries.is_empty() {
                    bail!("job file {} lists no jobs", job_file.display());
                }
                let report = BatchRunner::new(Arc::new(orchestrator), &cli.path).run(entries);
                print_json(&report)?;
                return Ok(report.exit_code());
            }
            let url = url.unwrap_or_default();
            if url.trim().is_empty() && name.is_none() {
                bail!("download needs a url, --name or --job-file");
            }
            let summary = orchestrator
                .run(&JobRequest::new(url, name, &cli.path))
                .context("job aborted")?;
            print_json(&summary)?;
            Ok(summary.exit_code())
        }
        Command::Index { url, name } => {
            let doc = orchestrator
                .index(&JobRequest::new(url, name, &cli.path))
                .context("index failed")?;
            info!(job = %doc.info.name, files = doc.info.files, "index written");
            print_json(&doc)?;
            Ok(0)
        }
        Command::Status { name, files } => {
            if files {
                print_json(&orchestrator.get_index_info(&name, &cli.path)?)?;
            } else {
                print_json(&orchestrator.get_status(&name, &cli.path)?)?;
            }
            Ok(0)
        }
        Command::Support => {
            let registry = orchestrator.registry();
            print_json(&serde_json::json!({
                "sites": registry
                    .supported_sites()
                    .into_iter()
                    .map(|(id, routes)| serde_json::json!({"driver": id, "routes": routes}))
                    .collect::<Vec<_>>(),
                "transfer_types": registry.backend_types(),
            }))?;
            Ok(0)
        }
    }
}

fn build_registry(args: &OptionArgs, options: &JobOptions) -> Result<Registry> {
    let mut registry = Registry::with_builtins(options).context("build transfer backends")?;
    for (transfer_type, command) in &args.command_backends {
        let mut parts = command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("command backend [{}] has no program", transfer_type);
        };
        registry.register_backend(Arc::new(CommandBackend::new(
            transfer_type.clone(),
            program,
            parts.collect(),
        )));
    }
    Ok(registry)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("encode output")?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_on_first_equals() {
        assert_eq!(
            parse_pair("you-get=you-get -o {dir} {url}").unwrap(),
            ("you-get".to_string(), "you-get -o {dir} {url}".to_string())
        );
        assert!(parse_pair("=http").is_err());
        assert!(parse_pair("http").is_err());
    }

    #[test]
    fn flags_map_onto_job_options() {
        let cli = Cli::parse_from([
            "comics-down",
            "download",
            "file:///tmp/work.json",
            "--down-overtime",
            "0",
            "--no-redo-limit",
            "--downtype",
            "torrent=http",
            "--keep-tmp",
        ]);
        let options = cli.options.job_options();
        assert_eq!(options.down_overtime, None);
        assert_eq!(options.redo_limit, None);
        assert_eq!(options.downtype_mapping.get("torrent").map(String::as_str), Some("http"));
        assert!(!options.remove_tmp);
        assert_eq!(options.down_worker, 10);
    }
}

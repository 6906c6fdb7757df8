use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

use binarylane_backup::api::{ApiClient, BackupApi, Image, Server};
use binarylane_backup::backup::{
    BatchPolicy, ServerSelection, backup_then_download, resolve_server, run_batch, select_servers,
};
use binarylane_backup::config::{DownloadTool, Settings, parse_days};
use binarylane_backup::download::{
    DownloadOptions, Downloader, HttpTransport, Transport, WgetTransport, backup_images,
};
use binarylane_backup::poller::{PollConfig, SystemClock};
use binarylane_backup::prune::{PruneOptions, prune};
use binarylane_backup::relocate::{MoveTarget, move_files, resolve_remote};
use binarylane_backup::remote::{Rclone, RcloneVerbosity, RemoteStore};
use binarylane_backup::reporter::{CommandCtx, Reporter, StdoutReporter, Verbosity};
use binarylane_backup::storage::Storage;
use binarylane_backup::verify::{CheckTarget, ZstdTester, check_files};
use binarylane_backup::{Error, Result, logging};

const API_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Parser)]
#[command(name = "blbackup", author, version, about = "Back up BinaryLane servers")]
struct Args {
    /// Settings file (TOML); defaults to $BINARYLANE_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More output; repeat for debug logging
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Never prompt for confirmation
    #[arg(short = 'n', long, global = true)]
    no_interaction: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show account information
    Account,
    /// List servers
    Servers {
        /// Show only servers matching this hostname
        name: Option<String>,
        /// Print server ids only
        #[arg(long, conflicts_with = "names")]
        ids: bool,
        /// Print server names only
        #[arg(long)]
        names: bool,
    },
    /// List backups for a server, or every backup image on the account
    Backups {
        /// Server name or numeric id
        server: Option<String>,
        /// Print backup ids only
        #[arg(long, conflicts_with = "urls")]
        ids: bool,
        /// Print download links
        #[arg(long)]
        urls: bool,
    },
    /// Take new server backups
    Create {
        #[command(flatten)]
        select: SelectArgs,
        /// Download each backup once it completes
        #[arg(short, long)]
        download: bool,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Download backups to local storage
    Download {
        #[command(flatten)]
        select: SelectArgs,
        /// Download this backup image id
        #[arg(long, conflicts_with_all = ["server", "all", "include", "exclude"])]
        image: Option<u64>,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Test downloaded backup files
    Check {
        /// File relative to the downloads directory
        file: Option<String>,
        /// Check every downloaded file
        #[arg(long, conflicts_with = "file")]
        all: bool,
        /// List files without testing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Move downloaded backups to secondary storage
    Move {
        /// File relative to the downloads directory
        file: Option<String>,
        /// Move every downloaded file
        #[arg(long, conflicts_with = "file")]
        all: bool,
        /// rclone remote, overriding RCLONE_REMOTE
        #[arg(long)]
        remote: Option<String>,
        /// List planned moves without transferring
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete old backup files
    Clean {
        /// Keep files newer than this many days, overriding KEEPONLY_DAYS
        #[arg(long)]
        days: Option<String>,
        /// List files that would be deleted
        #[arg(long)]
        dry_run: bool,
        /// Also clean the configured remote
        #[arg(long)]
        remote: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Account => "account",
            Command::Servers { .. } => "servers",
            Command::Backups { .. } => "backups",
            Command::Create { .. } => "create",
            Command::Download { .. } => "download",
            Command::Check { .. } => "check",
            Command::Move { .. } => "move",
            Command::Clean { .. } => "clean",
        }
    }
}

#[derive(Debug, ClapArgs)]
struct SelectArgs {
    /// Server name or numeric id
    server: Option<String>,
    /// Every server on the account
    #[arg(long)]
    all: bool,
    /// Only servers named in this file
    #[arg(long, value_name = "FILE")]
    include: Option<PathBuf>,
    /// Every server except those named in this file
    #[arg(long, value_name = "FILE")]
    exclude: Option<PathBuf>,
    /// Exit with failure if any server in a batch fails
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, ClapArgs)]
struct FetchArgs {
    /// Download even if a local copy exists
    #[arg(short, long)]
    force: bool,
    /// Skip the zstd integrity test
    #[arg(long)]
    no_test: bool,
    /// Copy each download to secondary storage
    #[arg(long = "move")]
    relocate: bool,
    /// rclone remote, overriding RCLONE_REMOTE
    #[arg(long)]
    remote: Option<String>,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let verbosity = Verbosity::from_flags(args.verbose, args.quiet);

    let settings = match Settings::load(args.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&settings, verbosity) {
        eprintln!("ERROR: {e}");
        return ExitCode::FAILURE;
    }

    let reporter: Arc<dyn Reporter> = Arc::new(StdoutReporter::new(verbosity));
    let ctx = CommandCtx::new(args.cmd.name(), reporter);
    let app = App {
        settings,
        verbosity,
        no_interaction: args.no_interaction,
    };
    match app.run(args.cmd, &ctx) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            ctx.error(e.to_string());
            ExitCode::FAILURE
        }
    }
}

struct App {
    settings: Settings,
    verbosity: Verbosity,
    no_interaction: bool,
}

impl App {
    fn run(&self, cmd: Command, ctx: &CommandCtx) -> Result<bool> {
        match cmd {
            Command::Account => self.cmd_account(),
            Command::Servers { name, ids, names } => self.cmd_servers(name.as_deref(), ids, names),
            Command::Backups { server, ids, urls } => {
                self.cmd_backups(server.as_deref(), ids, urls)
            }
            Command::Create {
                select,
                download,
                fetch,
            } => self.cmd_create(&select, download, &fetch, ctx),
            Command::Download {
                select,
                image,
                fetch,
            } => self.cmd_download(&select, image, &fetch, ctx),
            Command::Check { file, all, dry_run } => self.cmd_check(file, all, dry_run, ctx),
            Command::Move {
                file,
                all,
                remote,
                dry_run,
            } => self.cmd_move(file, all, remote.as_deref(), dry_run, ctx),
            Command::Clean {
                days,
                dry_run,
                remote,
            } => self.cmd_clean(days.as_deref(), dry_run, remote, ctx),
        }
    }

    fn api(&self) -> Result<ApiClient> {
        ApiClient::new(&self.settings.api_url, self.settings.api_token()?, API_TIMEOUT)
    }

    fn storage(&self) -> Storage {
        Storage::new(&self.settings.downloads_dir)
    }

    fn rclone(&self) -> Rclone {
        let v = match self.verbosity {
            Verbosity::Quiet => RcloneVerbosity::Quiet,
            Verbosity::Normal => RcloneVerbosity::Normal,
            Verbosity::Verbose | Verbosity::Debug => RcloneVerbosity::Verbose,
        };
        Rclone::new(&self.settings.rclone_binary, v)
    }

    fn transport(&self) -> Result<Box<dyn Transport>> {
        Ok(match self.settings.download_tool {
            DownloadTool::Http => Box::new(HttpTransport::new(None)?),
            DownloadTool::Wget => Box::new(WgetTransport::new(&self.settings.wget_binary)),
        })
    }

    fn poll_config(&self) -> PollConfig {
        PollConfig::new(self.settings.poll_interval(), self.settings.timeout())
    }

    fn policy(&self, strict: bool) -> BatchPolicy {
        if strict {
            BatchPolicy::FailOnError
        } else {
            self.settings.batch_policy()
        }
    }

    fn cmd_account(&self) -> Result<bool> {
        let account = self.api()?.account()?;
        print_table(&["Email", "Status"], &[vec![account.email, account.status]]);
        Ok(true)
    }

    fn cmd_servers(&self, name: Option<&str>, ids: bool, names: bool) -> Result<bool> {
        let servers = self.api()?.servers(name)?;
        if servers.is_empty() {
            let suffix = name.map(|n| format!(" for {n}")).unwrap_or_default();
            return Err(Error::msg(format!("No server data returned{suffix}")));
        }
        if ids || names {
            for s in &servers {
                if ids {
                    println!("{}", s.id);
                } else {
                    println!("{}", s.name);
                }
            }
            return Ok(true);
        }
        let rows: Vec<Vec<String>> = servers
            .iter()
            .map(|s| {
                vec![
                    s.id.to_string(),
                    s.name.clone(),
                    s.memory.to_string(),
                    s.vcpus.to_string(),
                    s.disk.to_string(),
                ]
            })
            .collect();
        print_table(&["ID", "Name", "Memory", "VCPUs", "Disk"], &rows);
        Ok(true)
    }

    fn cmd_backups(&self, server: Option<&str>, ids: bool, urls: bool) -> Result<bool> {
        let api = self.api()?;
        let images = match server {
            Some(arg) => {
                let server = resolve_server(&api, arg)?;
                let mut backups = api.backups(&server)?;
                if backups.is_empty() {
                    return Err(Error::msg(format!("No backup data returned for {arg}")));
                }
                backups.sort_by_key(|b| b.id);
                if !ids && !urls {
                    println!();
                    println!("Backups for {} ({}):", server.name, server.id);
                    println!();
                }
                backups
            }
            None => {
                let images = backup_images(api.images()?);
                if images.is_empty() {
                    return Err(Error::msg("No image data returned"));
                }
                images
            }
        };

        if ids {
            for image in &images {
                println!("{}", image.id);
            }
        } else if urls {
            for image in &images {
                let link = api.link(image.id)?;
                println!("{} {}", image.id, link.primary_url().unwrap_or("-"));
            }
        } else {
            self.print_images(&images);
        }
        Ok(true)
    }

    fn print_images(&self, images: &[Image]) {
        let rows: Vec<Vec<String>> = images
            .iter()
            .map(|i| {
                let created = i
                    .created()
                    .map(|t| self.settings.timezone.format(&t))
                    .unwrap_or_else(|_| i.created_at.clone());
                vec![
                    i.id.to_string(),
                    i.display_name().to_string(),
                    created,
                    format!("{:.2}", i.size_gigabytes),
                ]
            })
            .collect();
        print_table(&["Image ID", "Image Name", "Created", "Size GB"], &rows);
    }

    /// Validated remote for `--move`, checked before any network activity.
    fn relocation_remote(&self, fetch: &FetchArgs, store: &dyn RemoteStore) -> Result<Option<String>> {
        if !fetch.relocate {
            return Ok(None);
        }
        let configured = self.settings.rclone_remote.as_deref();
        resolve_remote(store, fetch.remote.as_deref(), configured).map(Some)
    }

    fn download_options(&self, fetch: &FetchArgs, remote: Option<String>) -> DownloadOptions {
        DownloadOptions {
            force: fetch.force,
            test: !fetch.no_test,
            relocate: fetch.relocate,
            remote,
        }
    }

    fn cmd_create(
        &self,
        select: &SelectArgs,
        download: bool,
        fetch: &FetchArgs,
        ctx: &CommandCtx,
    ) -> Result<bool> {
        let selection = selection(select)?;
        let rclone = self.rclone();
        let remote = if download {
            self.relocation_remote(fetch, &rclone)?
        } else {
            None
        };

        let api = self.api()?;
        let storage = self.storage();
        let transport = self.transport()?;
        let tester = ZstdTester::new(&self.settings.zstd_binary);
        let clock = SystemClock::default();
        let downloader = Downloader {
            api: &api,
            storage: &storage,
            transport: transport.as_ref(),
            tester: &tester,
            remote: Some(&rclone),
            clock: &clock,
            options: self.download_options(fetch, remote),
        };
        let poll = self.poll_config();
        let single = selection.is_single();

        let servers = select_servers(&api, &selection)?;
        let chained = download.then_some(&downloader);
        let unit = |server: &Server| -> Result<bool> {
            backup_then_download(&api, server, poll, &clock, chained, single, ctx)
        };

        if single {
            return servers.first().map_or(Ok(false), unit);
        }
        ctx.notice("Backing up all servers");
        let summary = run_batch(&servers, ctx, unit);
        Ok(summary.exit_ok(self.policy(select.strict)))
    }

    fn cmd_download(
        &self,
        select: &SelectArgs,
        image: Option<u64>,
        fetch: &FetchArgs,
        ctx: &CommandCtx,
    ) -> Result<bool> {
        let nothing_selected = select.server.is_none()
            && !select.all
            && select.include.is_none()
            && select.exclude.is_none();
        if image.is_none() && nothing_selected {
            let api = self.api()?;
            let images = backup_images(api.images()?);
            if images.is_empty() {
                return Err(Error::msg("No image data returned"));
            }
            self.print_images(&images);
            return Ok(true);
        }

        let selection = match image {
            Some(_) => None,
            None => Some(selection(select)?),
        };
        let rclone = self.rclone();
        let remote = self.relocation_remote(fetch, &rclone)?;

        let api = self.api()?;
        let storage = self.storage();
        let transport = self.transport()?;
        let tester = ZstdTester::new(&self.settings.zstd_binary);
        let clock = SystemClock::default();
        let downloader = Downloader {
            api: &api,
            storage: &storage,
            transport: transport.as_ref(),
            tester: &tester,
            remote: Some(&rclone),
            clock: &clock,
            options: self.download_options(fetch, remote),
        };

        if let Some(image_id) = image {
            let outcome = downloader.download_image(image_id, ctx)?;
            return Ok(outcome.counts_as_success());
        }
        let Some(selection) = selection else {
            return Ok(false);
        };

        let servers = select_servers(&api, &selection)?;
        let single = selection.is_single();
        let unit =
            |server: &Server| -> Result<bool> { downloader.download_server(server, single, ctx) };
        if single {
            return servers.first().map_or(Ok(false), unit);
        }
        let summary = run_batch(&servers, ctx, unit);
        Ok(summary.exit_ok(self.policy(select.strict)))
    }

    fn cmd_check(&self, file: Option<String>, all: bool, dry_run: bool, ctx: &CommandCtx) -> Result<bool> {
        let target = match (file, all) {
            (_, true) => CheckTarget::All,
            (Some(f), false) => CheckTarget::One(f),
            (None, false) => {
                return Err(Error::msg(
                    "No file specified. Specify --all option to check all backup files",
                ));
            }
        };
        let tester = ZstdTester::new(&self.settings.zstd_binary);
        let summary = check_files(&self.storage(), &tester, &target, dry_run, ctx)?;
        Ok(summary.failed.is_empty())
    }

    fn cmd_move(
        &self,
        file: Option<String>,
        all: bool,
        remote: Option<&str>,
        dry_run: bool,
        ctx: &CommandCtx,
    ) -> Result<bool> {
        let rclone = self.rclone();
        let remote = resolve_remote(&rclone, remote, self.settings.rclone_remote.as_deref())?;
        let target = match (file, all) {
            (_, true) => MoveTarget::All,
            (Some(f), false) => MoveTarget::One(f),
            (None, false) => {
                return Err(Error::msg(
                    "No file specified. Specify --all option to move all backup files",
                ));
            }
        };
        let clock = SystemClock::default();
        let summary = move_files(&self.storage(), &rclone, &remote, &target, dry_run, &clock, ctx)?;
        Ok(summary.ok())
    }

    fn cmd_clean(&self, days: Option<&str>, dry_run: bool, remote: bool, ctx: &CommandCtx) -> Result<bool> {
        let cutoff_days = match days {
            Some(raw) => parse_days("--days", raw)?,
            None => self.settings.keeponly_days,
        };
        if !dry_run && !self.no_interaction && !confirm("This operation cannot be undone. Continue ?")? {
            ctx.line("Operation aborted by user");
            return Ok(true);
        }

        let rclone = self.rclone();
        let configured = self
            .settings
            .rclone_remote
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let remote_target = configured.map(|r| (&rclone as &dyn RemoteStore, r));
        let opts = PruneOptions {
            cutoff_days,
            dry_run,
            include_remote: remote,
            now: chrono::Utc::now(),
        };
        let report = prune(&self.storage(), remote_target, &opts, ctx)?;
        Ok(report.ok())
    }
}

fn selection(select: &SelectArgs) -> Result<ServerSelection> {
    ServerSelection::from_args(
        select.server.as_deref(),
        select.all,
        select.include.as_deref(),
        select.exclude.as_deref(),
    )
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<width$}", width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("{}", line(headers.to_vec()));
    println!(
        "{}",
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  ")
    );
    for row in rows {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}

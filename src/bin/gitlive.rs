use std::{fs, path::Path};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::LevelFilter;

use gitlive::{
    config_reader::ConfigReader,
    file_selector,
    publisher::{Publisher, SyncError, SyncMode, SyncOptions, SyncOutcome},
    url_util::{authenticate_url, normalize_url},
    z0,
};
use run_git::git::GitRunner;

/// Name of the config file looked up in the current directory.
const CONFIG_FILE: &str = "gitlive.z0";

#[derive(clap::Parser, Debug)]
#[clap(version)]
/// Mirror `live/*` release tags of the repository in the current
/// directory into a public LIVE repository, one squashed commit per
/// release. The development history between releases is never pushed.
struct Opts {
    /// URL of the LIVE repository. Can also come from GITLIVE_URL or
    /// the `url` key in gitlive.z0.
    #[clap(long)]
    url: Option<String>,

    /// User name for http(s) authentication against LIVE.
    #[clap(long)]
    user: Option<String>,

    /// Password or token for http(s) authentication against LIVE.
    /// Prefer GITLIVE_PASSWORD; this option is visible in process
    /// listings. Never read from the config file.
    #[clap(long)]
    password: Option<String>,

    /// Show what would be pushed, but do not touch LIVE.
    #[clap(long)]
    dry_run: bool,

    /// Publish only tags newer than the newest already-published one.
    /// This is the default mode.
    #[clap(long)]
    incremental: bool,

    /// Publish every tag missing from LIVE, force-updating branch and
    /// tags where needed.
    #[clap(long)]
    repair: bool,

    /// Legacy alias for --repair.
    #[clap(long, hide = true)]
    full: bool,

    /// Rebuild LIVE from scratch: delete all its tags and replace
    /// main with a freshly rooted history.
    #[clap(long)]
    nuke: bool,

    /// Log progress (-v); repeat (-vv) to log every git invocation.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Same as -vv.
    #[clap(long)]
    very_verbose: bool,
}

impl Opts {
    fn mode(&self) -> SyncMode {
        match (self.nuke, self.repair || self.full, self.incremental) {
            (true, _, _) => SyncMode::Nuke,
            (false, true, _) => SyncMode::Repair,
            (false, false, _) => SyncMode::Incremental,
        }
    }

    fn log_level(&self) -> LevelFilter {
        if self.very_verbose || self.verbose >= 2 {
            LevelFilter::Debug
        } else if self.verbose == 1 {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        }
    }

    /// The key/value options in the `--name=value` shape the layered
    /// config reader expects.
    fn config_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (name, value) in [
            ("url", &self.url),
            ("user", &self.user),
            ("password", &self.password),
        ] {
            if let Some(value) = value {
                args.push(format!("--{name}={value}"));
            }
        }
        args
    }
}

fn main() {
    let opts = Opts::parse();
    env_logger::Builder::new()
        .filter_level(opts.log_level())
        .format_timestamp(None)
        .format_target(false)
        .init();
    match run(&opts) {
        Ok(SyncOutcome { tags_published }) => {
            if opts.dry_run {
                println!("dry run: would push {tags_published} tag(s)");
            } else {
                println!("{tags_published} tag(s) published");
            }
        }
        Err(e) => {
            eprintln!("gitlive: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(opts: &Opts) -> Result<SyncOutcome, SyncError> {
    let source = GitRunner::new(".");
    if source
        .try_run(&["rev-parse", "--is-inside-work-tree"])
        .as_deref()
        != Some("true")
    {
        return Err(SyncError::Detection(
            "the current directory is not inside a git work tree".to_owned(),
        ));
    }
    let source_repo = std::env::current_dir()
        .context("determining the current directory")
        .map_err(SyncError::Other)?;

    let z0_tree = if Path::new(CONFIG_FILE).exists() {
        let text = fs::read_to_string(CONFIG_FILE)
            .with_context(|| anyhow!("reading {CONFIG_FILE}"))
            .map_err(SyncError::Other)?;
        let tree = z0::parse(&text)
            .map_err(|e| SyncError::Other(anyhow!("{CONFIG_FILE}: {e}")))?;
        Some(tree)
    } else {
        None
    };

    let config = ConfigReader::new(opts.config_args(), std::env::vars().collect(), z0_tree);
    let url = config.url().ok_or(SyncError::MissingUrl)?;
    let url = normalize_url(&url);
    let user = config.user().unwrap_or_default();
    let password = config.password().unwrap_or_default();
    let live_url = authenticate_url(&url, &user, &password);

    let rules = file_selector::parse_rules(&config.files()).map_err(SyncError::Other)?;

    Publisher::new(SyncOptions {
        source_repo,
        live_url,
        rules,
        mode: opts.mode(),
        dry_run: opts.dry_run,
    })
    .sync()
}

//! weiboharvest binary.
//!
//! Parses CLI arguments, initializes logging, wires cookies and the
//! session into the HTTP context, and maps every outcome to the exit-code
//! contract: 0 success, 1 failure, 2 bad arguments, 3 auth failure,
//! 5 interrupted.

mod sink;
mod target;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use weiboharvest_core::api::{ApiConfig, ApiContext};
use weiboharvest_core::harvester::{Harvester, HarvestOptions};
use weiboharvest_core::progress::{NullSink, ProgressSink};
use weiboharvest_core::ratecontrol::{RateConfig, RateController};
use weiboharvest_core::{ChallengeMode, Error};

/// Resumable, rate-limited Weibo media harvester
#[derive(Parser)]
#[command(name = "weiboharvest")]
#[command(version)]
#[command(about = "Resumable, rate-limited Weibo media harvester")]
#[command(after_help = "\
Targets:
  123456                   harvest a user by uid
  some_nickname            harvest a user by nickname
  '#topic'                 harvest a super-topic
  ':keyword'               harvest full-text search results
  https://…/detail/<mid>   harvest a single post")]
struct Cli {
    /// Targets: UID, nickname, #supertopic, :search, or a post URL
    targets: Vec<String>,

    /// Harvest a single post by its mid (URL positionals still win)
    #[arg(short = 'm', long)]
    mid: Option<String>,

    /// Load cookies from a local browser (external collaborator)
    #[arg(long, value_enum)]
    load_cookies: Option<Browser>,

    /// Cookie string, e.g. "SUB=…; SUBP=…"
    #[arg(long)]
    cookie: Option<String>,

    /// File containing a cookie string
    #[arg(long)]
    cookie_file: Option<PathBuf>,

    /// Session file (default: ~/.config/weiboharvest/session.json)
    #[arg(long)]
    sessionfile: Option<PathBuf>,

    /// Fetch visitor cookies via a headful browser (external collaborator)
    #[arg(long)]
    visitor_cookies: bool,

    /// Skip video media
    #[arg(long)]
    no_videos: bool,

    /// Skip picture media
    #[arg(long)]
    no_pictures: bool,

    /// Maximum posts per target (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    count: usize,

    /// Stop a target once an already-downloaded file is seen
    #[arg(long)]
    fast_update: bool,

    /// Watermark file enabling incremental runs
    #[arg(long)]
    latest_stamps: Option<PathBuf>,

    /// Output directory template
    #[arg(long)]
    dirname_pattern: Option<String>,

    /// Media file basename template
    #[arg(long, default_value = "{date}_{name}")]
    filename_pattern: String,

    /// Also write <mid>.json with the raw upstream record
    #[arg(long)]
    metadata_json: bool,

    /// Also write <mid>.txt with this literal string
    #[arg(long)]
    post_metadata_txt: Option<String>,

    /// Disable checkpoint resume entirely
    #[arg(long)]
    no_resume: bool,

    /// Minimum seconds between consecutive api requests
    #[arg(long, default_value_t = 0.0)]
    request_interval: f64,

    /// How to handle upstream challenge walls
    #[arg(long, value_enum, default_value = "auto")]
    captcha_mode: CaptchaModeArg,

    /// Concurrent media workers per post
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Root output directory
    #[arg(short = 'o', long, default_value = ".")]
    output_dir: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Browser {
    Chrome,
    Firefox,
    Edge,
}

#[derive(Clone, Copy, ValueEnum)]
enum CaptchaModeArg {
    Auto,
    Browser,
    Manual,
    Skip,
}

impl From<CaptchaModeArg> for ChallengeMode {
    fn from(mode: CaptchaModeArg) -> Self {
        match mode {
            CaptchaModeArg::Auto => ChallengeMode::Auto,
            CaptchaModeArg::Browser => ChallengeMode::Browser,
            CaptchaModeArg::Manual => ChallengeMode::Manual,
            CaptchaModeArg::Skip => ChallengeMode::Skip,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the -v/-q flags; default keeps the harvest
    // narration on the sink and warnings on the log.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("weiboharvest=debug,weiboharvest_core=debug,info")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::new("weiboharvest=info,weiboharvest_core=info,warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose)
        .compact()
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(Error::Interrupted) => {
            tracing::warn!("interrupted, state flushed");
            ExitCode::from(Error::Interrupted.exit_code())
        }
        Err(e) => {
            tracing::error!(error = %e, "harvest failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<bool, Error> {
    if cli.request_interval < 0.0 {
        return Err(Error::Init {
            message: "--request-interval must be >= 0".to_string(),
        });
    }
    if cli.targets.is_empty() && cli.mid.is_none() {
        return Err(Error::Init {
            message: "at least one target or --mid is required".to_string(),
        });
    }

    let raw_targets = if cli.targets.is_empty() {
        vec![String::new()]
    } else {
        cli.targets.clone()
    };
    let targets = raw_targets
        .iter()
        .map(|raw| target::parse_target(raw, cli.mid.as_deref()))
        .collect::<Result<Vec<_>, Error>>()?;

    let rate = RateController::new(RateConfig {
        request_interval: Duration::from_secs_f64(cli.request_interval),
        ..RateConfig::default()
    })?;

    let sink: Arc<dyn ProgressSink> = if std::io::stderr().is_terminal() {
        Arc::new(sink::ConsoleSink::new())
    } else {
        Arc::new(NullSink)
    };

    let config = ApiConfig {
        challenge_mode: cli.captcha_mode.into(),
        session_path: cli.sessionfile.clone(),
        ..ApiConfig::default()
    };
    // No browser collaborator is bundled: `browser` mode fails fast at
    // construction, `auto` falls back to the operator prompt.
    let context = {
        let pause_sink = sink.clone();
        let resume_sink = sink.clone();
        ApiContext::new(config, rate, None)?.on_challenge_pause(
            move || pause_sink.pause(),
            move || resume_sink.resume(),
        )
    };

    let mut has_auth = context.load_session(cli.sessionfile.as_deref()).await;
    if cli.load_cookies.is_some() {
        return Err(Error::Auth {
            message: "--load-cookies needs the external browser collaborator; \
                      use --cookie or --cookie-file instead"
                .to_string(),
        });
    }
    if let Some(cookie) = &cli.cookie {
        context.set_cookies_from_string(cookie).await?;
        has_auth = true;
    }
    if let Some(path) = &cli.cookie_file {
        context.set_cookies_from_file(path).await?;
        has_auth = true;
    }
    if cli.visitor_cookies {
        return Err(Error::Auth {
            message: "--visitor-cookies needs the external browser collaborator".to_string(),
        });
    }
    if has_auth {
        context.validate_cookie().await?;
        if let Err(e) = context.save_session(cli.sessionfile.as_deref()).await {
            tracing::warn!(error = %e, "failed to save session");
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, flushing state");
                cancel.cancel();
            }
        });
    }

    let options = HarvestOptions {
        dirname_pattern: cli.dirname_pattern.clone(),
        filename_pattern: cli.filename_pattern.clone(),
        no_videos: cli.no_videos,
        no_pictures: cli.no_pictures,
        count: cli.count,
        fast_update: cli.fast_update,
        latest_stamps: cli.latest_stamps.clone(),
        metadata_json: cli.metadata_json,
        post_metadata_txt: cli.post_metadata_txt.clone(),
        max_workers: cli.max_workers,
        no_resume: cli.no_resume,
        checkpoint_dir: None,
        output_dir: cli.output_dir.clone(),
    };

    let mut harvester = Harvester::new(Arc::new(context), options, sink.clone(), cancel)?;
    let outcome = harvester.run(&targets).await;
    sink.close();

    let results = outcome?;
    Ok(!results.is_empty() && results.values().all(|ok| *ok))
}

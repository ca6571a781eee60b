use anyhow::Error;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use genq::{
    telemetry, GenerationRequest, HttpGateway, ImageParams, Job, JobManager, Kind, ManagerConfig, Notice, Params,
    SubmitOptions, VideoParams,
};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'u',
        long = "base_url",
        env = "GENQ_BASE_URL",
        help = "Generation API base URL",
        default_value = "http://localhost:8999/api"
    )]
    base_url: String,

    #[arg(short = 't', long = "token", env = "GENQ_TOKEN", help = "Bearer token sent with every request")]
    token: Option<String>,

    #[arg(long = "timeout_secs", help = "Per-request timeout in seconds", default_value = "10")]
    timeout_secs: u64,

    #[arg(
        long = "poll_interval_ms",
        help = "Delay between status fetches of one job",
        default_value = "2000"
    )]
    poll_interval_ms: u64,

    #[arg(long = "jaeger_endpoint", help = "Jaeger collector endpoint for span export")]
    jaeger_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
enum Command {
    /// Submit a generation and follow it until it finishes
    Submit(SubmitArgs),
    /// Print one page of history
    History {
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        limit: u32,
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Delete jobs by id
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Load the first page and follow every job still in progress
    Watch {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum KindArg {
    Image,
    Video,
}

impl From<KindArg> for Kind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Image => Kind::Image,
            KindArg::Video => Kind::Video,
        }
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
struct SubmitArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(short = 'p', long)]
    prompt: String,
    #[arg(long, help = "Image size, e.g. 1024x1024")]
    size: Option<String>,
    #[arg(long)]
    quality: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,
    #[arg(long)]
    guidance_scale: Option<f64>,
    #[arg(long, help = "Video resolution, e.g. 720p")]
    resolution: Option<String>,
    #[arg(long, help = "Video duration in seconds")]
    duration: Option<u32>,
    #[arg(long, help = "Video aspect ratio, e.g. 16:9")]
    ratio: Option<String>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    camera_fixed: Option<bool>,
    #[arg(long)]
    cfg_scale: Option<f64>,
    #[arg(long)]
    watermark: bool,
    #[arg(long)]
    template_id: Option<i64>,
    #[arg(long)]
    style_id: Option<i64>,
    #[arg(long)]
    count: Option<u32>,
    #[arg(long, help = "Return once the job is accepted instead of following it")]
    detach: bool,
}

impl SubmitArgs {
    fn into_request(self) -> GenerationRequest {
        let params = match self.kind {
            KindArg::Image => Params::Image(ImageParams {
                size: self.size,
                quality: self.quality,
                seed: self.seed,
                guidance_scale: self.guidance_scale,
            }),
            KindArg::Video => Params::Video(VideoParams {
                resolution: self.resolution,
                duration: self.duration,
                ratio: self.ratio,
                fps: self.fps,
                camera_fixed: self.camera_fixed,
                cfg_scale: self.cfg_scale,
                ..Default::default()
            }),
        };
        GenerationRequest::new(self.prompt, params).with_options(SubmitOptions {
            watermark: self.watermark,
            template_id: self.template_id,
            style_id: self.style_id,
            count: self.count,
            ..Default::default()
        })
    }
}

fn describe(job: &Job) -> String {
    let prompt: String = job.prompt.chars().take(40).collect();
    let progress = job.progress.map(|p| format!("{p:>3}%")).unwrap_or_else(|| "   -".into());
    let urls = job
        .result
        .as_ref()
        .map(|r| r.urls.join(" "))
        .unwrap_or_default();
    format!("{:<12} {:<5} {:<10} {} {:<40} {}", job.id, job.kind(), job.status, progress, prompt, urls)
}

/// Print notices until no poller is left or the token is cancelled.
async fn follow(
    manager: &JobManager,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    cancel_token: &CancellationToken,
) {
    while !manager.tracked().is_empty() {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Follow cancelled");
                break;
            },
            notice = notices.recv() => {
                match notice {
                    Some(Notice::Completed { id }) | Some(Notice::Failed { id, .. }) => {
                        if let Some(job) = manager.get(&genq::JobId::persisted(&id)) {
                            println!("{}", describe(&job));
                        }
                    },
                    Some(Notice::PollInterrupted { id, error }) => {
                        println!("{id}: status unavailable ({error}), last known state kept");
                    },
                    Some(msg) => info!(event = "Notice", msg = ?msg),
                    None => break,
                }
            }
        }
    }
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let gateway = HttpGateway::new(config.base_url.clone(), Duration::from_secs(config.timeout_secs))?
        .with_token(config.token.clone());

    let manager_config = ManagerConfig {
        poll_interval: Duration::from_millis(config.poll_interval_ms),
        resume_polling_on_load: matches!(config.command, Command::Watch { .. }),
        ..ManagerConfig::default()
    };

    // Channel for notices coming back from the manager and its pollers
    let (send_to_client, mut recv_from_manager) = mpsc::unbounded_channel();
    let manager = JobManager::new(Arc::new(gateway), manager_config, send_to_client);

    match config.command {
        Command::Submit(args) => {
            let detach = args.detach;
            let job = tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Submission cancelled");
                    return Ok(());
                },
                job = manager.submit(args.into_request()) => job?,
            };
            println!("{}", describe(&job));
            if !detach {
                follow(&manager, &mut recv_from_manager, &cancel_token).await;
            }
        }
        Command::History { page, limit, kind } => {
            manager.load(page, limit, kind.map(Kind::from)).await?;
            for job in manager.snapshot() {
                println!("{}", describe(&job));
            }
            let cursor = manager.cursor();
            println!(
                "page {} ({} per page), {} total{}",
                cursor.page,
                cursor.page_size,
                cursor.total,
                if cursor.has_next { ", more available" } else { "" }
            );
        }
        Command::Delete { ids } => {
            manager.batch_delete(&ids).await?;
            println!("deleted {}", ids.join(", "));
        }
        Command::Watch { kind } => {
            let page_size = manager.config().page_size;
            manager.load(1, page_size, kind.map(Kind::from)).await?;
            info!(tracked = ?manager.tracked(), "Following jobs in progress");
            follow(&manager, &mut recv_from_manager, &cancel_token).await;
        }
    }

    manager.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token).instrument(info_span!("genq")));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "Failed to install signal handlers");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        token.cancel();
    });

    let result = app.await?;
    telemetry::shutdown();
    result?;

    Ok(())
}

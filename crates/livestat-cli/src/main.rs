use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use livestat_adapters::{
    drill_down_adapter, AssumeYes, FetchStrategy, LoginOutcome, Operator, SessionProvider,
    TerminalOperator, WebDriverPage,
};
use livestat_core::SourceKind;
use livestat_sync::{Pipeline, RunConfig, RunError, RunSummary};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "livestat")]
#[command(about = "Livestream analytics harvester")]
struct Cli {
    /// YAML run configuration (defaults to ./livestat.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Process only the first N identifiers.
    #[arg(long, global = true)]
    limit: Option<usize>,
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Skip the login confirmation prompt.
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open a visible browser to log in and save the session to the profile.
    Login,
    /// Enumerate past broadcasts into the listing workbook.
    List,
    /// Reservation funnel per broadcast.
    Reservations {
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },
    /// Product table per broadcast (scraped).
    Products,
    /// SPU sales rows per broadcast.
    Spu,
    /// E-commerce conversion summary per broadcast.
    Conversion,
    /// Promotion score per broadcast, added to the listing workbook.
    Diagnostic {
        /// Write a separate diagnostic workbook instead of augmenting the listing.
        #[arg(long)]
        standalone: bool,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    Api,
    Browser,
}

impl From<StrategyArg> for FetchStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Api => FetchStrategy::Api,
            StrategyArg::Browser => FetchStrategy::Browser,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match RunConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{err:#}"), "could not load configuration");
            return ExitCode::from(1);
        }
    };
    if let Some(limit) = cli.limit {
        config.limit = Some(limit);
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Commands::Reservations {
        strategy: Some(strategy),
    } = &cli.command
    {
        config.reservation_strategy = (*strategy).into();
    }

    match run(&cli, config).await {
        Ok(Some(summary)) => {
            println!(
                "{} run complete: run_id={} targets={} ok={} failed={} rows={} output={}",
                summary.source,
                summary.run_id,
                summary.targets,
                summary.succeeded,
                summary.failed,
                summary.records,
                summary.output.display()
            );
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(RunError::NotAuthenticated) => {
            error!("not logged in; run `livestat login` first");
            ExitCode::from(2)
        }
        Err(err) => {
            error!(error = %err, "run failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli, config: RunConfig) -> Result<Option<RunSummary>, RunError> {
    let provider = SessionProvider::new(config.browser.clone());
    let operator: Box<dyn Operator> = if cli.yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalOperator)
    };
    if provider
        .interactive_login(&config.login_url(), operator.as_ref())
        .await
        == LoginOutcome::Declined
    {
        return Err(RunError::NotAuthenticated);
    }

    let kind = match &cli.command {
        Commands::Login => return Ok(None),
        Commands::List => SourceKind::Listing,
        Commands::Reservations { .. } => SourceKind::Reservation,
        Commands::Products => SourceKind::ProductTable,
        Commands::Spu => SourceKind::Spu,
        Commands::Conversion => SourceKind::Conversion,
        Commands::Diagnostic { .. } => SourceKind::Diagnostic,
    };

    let credentials = provider.acquire(Some(&config.base_url)).await;
    let pipeline = Pipeline::connect(config, credentials)?;

    match &cli.command {
        Commands::List => return pipeline.run_listing().await.map(Some),
        Commands::Diagnostic { standalone: false } => {
            return pipeline.augment_listing_with_diagnostics().await.map(Some)
        }
        _ => {}
    }

    let config = pipeline.config();
    let adapter = drill_down_adapter(
        kind,
        &config.endpoints,
        &config.page_wait,
        config.reservation_strategy,
        &config.id_field,
    )
    .ok_or_else(|| RunError::Setup(format!("no drill-down adapter for {kind}")))?;

    if adapter.strategy() == FetchStrategy::Api {
        return pipeline.run_drill_down(adapter.as_ref()).await.map(Some);
    }

    let page = WebDriverPage::launch(&config.browser, config.browser.headless)
        .await
        .map_err(|e| RunError::Setup(format!("launching browser: {e}")))?;
    info!(source = %kind, "browser session started");
    let result = {
        let pipeline = pipeline.with_page(&page);
        pipeline.run_drill_down(adapter.as_ref()).await
    };
    if let Err(err) = page.close().await {
        warn!(error = %err, "closing browser failed");
    }
    result.map(Some)
}

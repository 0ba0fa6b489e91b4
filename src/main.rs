use anyhow::Context;
use argus::cli::output::Output;
use argus::cli::{Cli, Commands, RunArgs};
use argus::utils::toml_config::LoggingConfig;
use argus::{
    ArgusConfig, JsonlTraceSink, LLMClient, LlmDecisionService, LlmReportSynthesizer,
    MemoryTraceSink, ResearchCoordinator, ResearchReport, SourceRegistry, TraceSink,
};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    let output = if cli.no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    if let Err(error) = run(cli, &output).await {
        output.error(&format!("{error:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    // Credentials may live in .env
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(&cli.config, output)?;
            init_tracing(&config.logging, cli.verbose)?;
            research(config, args, output).await
        }
        Commands::Sources => {
            let config = load_config(&cli.config, output)?;
            list_sources(&config, output);
            Ok(())
        }
        Commands::Config { validate } => {
            if validate {
                ArgusConfig::load(&cli.config)
                    .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;
                output.success(&format!("{} is valid", cli.config.display()));
                return Ok(());
            }
            let config = load_config(&cli.config, output)?;
            show_config(&config, output);
            Ok(())
        }
    }
}

/// Load the config file, or fall back to defaults when it does not exist.
fn load_config(path: &Path, output: &Output) -> anyhow::Result<ArgusConfig> {
    if !path.exists() {
        output.warning(&format!("{} not found, using defaults", path.display()));
        return Ok(ArgusConfig::default());
    }
    ArgusConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

async fn research(mut config: ArgusConfig, args: RunArgs, output: &Output) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let provider = config.llm.to_provider()?;
    output.banner();
    output.info(&format!("Using {} model {}", provider.name(), provider.model()));
    let llm: Arc<dyn LLMClient> = Arc::from(provider.create_client()?);

    let run_id = uuid::Uuid::new_v4().to_string();
    let sink: Arc<dyn TraceSink> = if config.trace.enabled {
        let sink = JsonlTraceSink::create(&config.trace.output_dir, &run_id).await?;
        output.info(&format!("Tracing to {}", sink.dir().display()));
        Arc::new(sink)
    } else {
        Arc::new(MemoryTraceSink::new())
    };

    let coordinator = ResearchCoordinator::new(
        Arc::new(config),
        Arc::new(SourceRegistry::with_default_sources()),
        Arc::new(LlmDecisionService::new(llm.clone())),
        Arc::new(LlmReportSynthesizer::new(llm)),
        sink,
    );

    match coordinator.research_with_id(&run_id, &args.question).await {
        Ok(report) => {
            match &args.output {
                Some(path) => {
                    write_report(&report, path).await?;
                    output.success(&format!("Report written to {}", path.display()));
                }
                None => output.report(&report),
            }
            Ok(())
        }
        Err(failure) => {
            if let Some(path) = &args.output {
                write_report(&failure.partial, path).await?;
                output.warning(&format!("Partial report written to {}", path.display()));
            }
            Err(failure.into())
        }
    }
}

async fn write_report(report: &ResearchReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

fn list_sources(config: &ArgusConfig, output: &Output) {
    let registry = SourceRegistry::with_default_sources();
    let strict = config.strict_sources();

    output.header("Sources");
    output.table_header(&["Name", "Enabled", "Critical", "Min interval"]);
    for (name, description) in registry.descriptions() {
        let source = config.source(&name);
        let interval = strict
            .get(&name)
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_else(|| "-".to_string());
        output.table_row(&[
            name.as_str(),
            yes_no(config.is_source_enabled(&name)),
            yes_no(source.critical),
            interval.as_str(),
        ]);
        output.list_item(&description);
    }
    if registry.is_empty() {
        output.hint("No sources registered; build with the web-search feature");
    }
}

fn show_config(config: &ArgusConfig, output: &Output) {
    output.header("LLM");
    output.kv("provider", &format!("{:?}", config.llm.provider));
    output.kv("model", &config.llm.model);

    output.header("Research");
    let r = &config.research;
    output.kv("max tasks", &r.max_tasks.to_string());
    output.kv("concurrency", &r.max_concurrent_tasks.to_string());
    output.kv("max retries", &r.max_retries.to_string());
    output.kv("task timeout", &format!("{}s", r.task_timeout_secs));
    output.kv("run budget", &format!("{}s", r.run_budget_secs));

    output.header("Hypotheses");
    output.kv("enabled", yes_no(config.hypotheses.enabled));
    output.kv("mode", &format!("{:?}", config.hypotheses.mode));

    output.header("Trace");
    output.kv("enabled", yes_no(config.trace.enabled));
    output.kv("output dir", &config.trace.output_dir.display().to_string());
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

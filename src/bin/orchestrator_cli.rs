//! Orchestrator CLI: configuration checks and a dry run of staged startup.
//!
//! Usage:
//!   orchestrator-cli validate <config>                         Validate a config file
//!   orchestrator-cli simulate [--config <path>] [--delay-ms N]  Simulate staged start
//!   orchestrator-cli health [--config <path>] [--wait-ms N]     Print the health report

use anyhow::{bail, Context};
use async_trait::async_trait;
use staged_orchestrator::config::OrchestratorConfig;
use staged_orchestrator::orchestrator::OrchestrationContext;
use staged_orchestrator::services::{ManagedService, ServiceKind};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../../config/orchestrator.yaml");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]),
        "simulate" => cmd_simulate(&args[2..]).await,
        "health" => cmd_health(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("orchestrator-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"orchestrator-cli - staged service orchestration tools

USAGE:
    orchestrator-cli <COMMAND> [OPTIONS]

COMMANDS:
    validate <config>           Parse and validate an orchestrator config
    simulate [OPTIONS]          Register simulated services and route every configured route
    health [OPTIONS]            Print the health report after a simulated start
    version                     Show version information
    help                        Show this help message

OPTIONS:
    --config <path>             Config file (defaults to the bundled layout)
    --delay-ms <n>              Simulated init time per non-fallback service (default 200)
    --wait-ms <n>               How long to let services start before reporting (default 500)

ENVIRONMENT:
    RUST_LOG                    Log filter (default: info)
    ORCHESTRATOR_*              Config overrides, see the config module docs"#
    );
}

/// Service whose initialization just takes a while.
struct SimulatedService {
    name: String,
    kind: ServiceKind,
    delay: Duration,
}

#[async_trait]
impl ManagedService for SimulatedService {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ServiceKind {
        self.kind
    }

    async fn initialize(&self) -> staged_orchestrator::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn flag_millis(args: &[String], flag: &str, default: u64) -> anyhow::Result<Duration> {
    match flag_value(args, flag) {
        Some(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("{flag} expects milliseconds, got '{raw}'"))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(Duration::from_millis(default)),
    }
}

fn load_config(args: &[String]) -> anyhow::Result<OrchestratorConfig> {
    match flag_value(args, "--config") {
        Some(path) => {
            OrchestratorConfig::from_path(path).with_context(|| format!("loading {path}"))
        }
        None => {
            let mut config = OrchestratorConfig::from_yaml_str(DEFAULT_CONFIG)?;
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn cmd_validate(args: &[String]) -> anyhow::Result<()> {
    let Some(path) = args.first() else {
        bail!("validate requires a config path");
    };
    let config = OrchestratorConfig::from_path(path).with_context(|| format!("loading {path}"))?;

    println!("{path}: OK");
    println!("services ({}):", config.services.len());
    for svc in &config.services {
        let tier = match (svc.required_for_basic, svc.required_for_enhanced) {
            (true, _) => "basic",
            (false, true) => "enhanced",
            (false, false) => "auxiliary",
        };
        println!("  {:<20} {:<18} {}", svc.name, svc.kind.as_str(), tier);
    }
    println!("routes ({}):", config.routes.len());
    for (name, route) in &config.routes {
        println!("  {:<20} {}", name, route.candidates.join(" -> "));
    }
    Ok(())
}

fn start_simulation(
    args: &[String],
) -> anyhow::Result<Arc<OrchestrationContext<dyn ManagedService>>> {
    let config = load_config(args)?;
    let delay = flag_millis(args, "--delay-ms", 200)?;
    let ctx = Arc::new(OrchestrationContext::<dyn ManagedService>::new(config)?);

    let declared = ctx.config().services.clone();
    for (position, svc) in declared.iter().enumerate() {
        let delay = if svc.kind.is_degraded() {
            Duration::ZERO
        } else {
            delay * (position as u32 + 1)
        };
        ctx.register_service(
            svc.tier(),
            Arc::new(SimulatedService {
                name: svc.name.clone(),
                kind: svc.kind,
                delay,
            }),
        )?;
    }
    ctx.start()?;
    Ok(ctx)
}

async fn cmd_simulate(args: &[String]) -> anyhow::Result<()> {
    let ctx = start_simulation(args)?;
    let basic = ctx.wait_for_basic(None).await;
    println!("basic ready: {basic}");

    for route in ctx.router().route_names() {
        let routed = ctx
            .route_request(&route, |svc| async move {
                Ok::<_, staged_orchestrator::Error>(svc.kind)
            })
            .await?;
        println!("{}", serde_json::to_string(&routed.routing)?);
    }

    tokio::time::sleep(flag_millis(args, "--wait-ms", 500)?).await;
    let status = ctx.system_status();
    println!(
        "after wait: basic={} enhanced={}",
        status.basic_ready, status.enhanced_ready
    );
    ctx.shutdown().await;
    Ok(())
}

async fn cmd_health(args: &[String]) -> anyhow::Result<()> {
    let ctx = start_simulation(args)?;
    tokio::time::sleep(flag_millis(args, "--wait-ms", 500)?).await;
    let report = ctx.health_report();
    println!("HTTP {}", report.http_status());
    println!("{}", report.to_json()?);
    ctx.shutdown().await;
    Ok(())
}

pub mod audit;
pub mod cli;
pub mod config;
pub mod data;
pub mod dataset;
pub mod expr;
pub mod io_utils;
pub mod matching;
pub mod orchestrator;
pub mod reconcile;
pub mod sandbox;
pub mod schema;
pub mod semantic;
pub mod services;
pub mod session;
pub mod similarity;
pub mod table;
pub mod yaml_provider;

use std::{env, fs, path::Path, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    audit::AuditLedger,
    cli::{Cli, Commands, InputArgs, OutputArgs},
    config::EngineConfig,
    dataset::{Dataset, DatasetCollection},
    matching::MatchingCascade,
    orchestrator::{Orchestrator, TurnStatus},
    reconcile::{MatchStatus, ReconcileSpec},
    sandbox::{Chart, Sandbox},
    semantic::{AliasJudge, CharNgramEmbedder},
    services::ScriptedServices,
    session::Session,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("tabheal", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => handle_run(&args, config),
        Commands::Resolve(args) => handle_resolve(&args, config),
        Commands::Reconcile(args) => handle_reconcile(&args, config),
        Commands::Replay(args) => handle_replay(&args, config),
        Commands::Config(args) => {
            yaml_provider::save_to_path(&args.output, &config)?;
            info!("Configuration written to {:?}", args.output);
            Ok(())
        }
    }
}

fn load_dataset(
    name: &str,
    path: &Path,
    delimiter: Option<u8>,
    encoding: Option<&str>,
) -> Result<Dataset> {
    let delimiter = io_utils::resolve_delimiter(path, delimiter);
    let encoding = io_utils::resolve_encoding(encoding)?;
    info!(
        "Loading '{name}' from {:?} with delimiter '{}' and encoding {}",
        path,
        printable_delimiter(delimiter),
        encoding.name()
    );
    Dataset::from_csv(name, path, delimiter, encoding)
        .with_context(|| format!("Loading dataset '{name}' from {path:?}"))
}

fn load_inputs(args: &InputArgs) -> Result<DatasetCollection> {
    let mut datasets = DatasetCollection::new();
    for spec in &args.inputs {
        if datasets.contains(&spec.name) {
            bail!("Dataset name '{}' is given more than once", spec.name);
        }
        datasets.ingest(load_dataset(
            &spec.name,
            &spec.path,
            args.delimiter,
            args.input_encoding.as_deref(),
        )?);
    }
    Ok(datasets)
}

fn load_judge(path: Option<&Path>) -> Result<Option<AliasJudge>> {
    path.map(AliasJudge::load).transpose()
}

fn write_outputs(
    output: &OutputArgs,
    result: Option<&Dataset>,
    ledger: Option<&AuditLedger>,
    charts: &[Chart],
) -> Result<()> {
    if let Some(path) = &output.result {
        match result {
            Some(table) => {
                table.write_csv(path, io_utils::resolve_delimiter(path, None))?;
                info!("Result table '{}' written to {:?}", table.name(), path);
            }
            None => bail!("No result table was designated; nothing to write to {path:?}"),
        }
    }
    if let Some(path) = &output.audit {
        ledger.cloned().unwrap_or_default().write_csv(path)?;
        info!("Audit ledger written to {:?}", path);
    }
    if let Some(path) = &output.charts {
        sandbox::chart::write_charts(path, charts)?;
        info!("{} chart(s) written to {:?}", charts.len(), path);
    }
    Ok(())
}

fn handle_run(args: &cli::RunArgs, config: EngineConfig) -> Result<()> {
    let mut datasets = load_inputs(&args.input)?;
    let payload = fs::read_to_string(&args.payload)
        .with_context(|| format!("Reading payload from {:?}", args.payload))?;
    let embedder = CharNgramEmbedder::default();
    let judge = load_judge(args.input.aliases.as_deref())?;

    let mut sandbox = Sandbox::new(config).with_embedder(&embedder);
    if let Some(judge) = judge.as_ref() {
        sandbox = sandbox.with_judge(judge);
    }
    let attempt = sandbox.execute(&mut datasets, &payload);
    for line in &attempt.log {
        println!("{line}");
    }
    if let Some(err) = &attempt.error {
        bail!("Payload {} failed: {err}", attempt.fingerprint);
    }
    write_outputs(
        &args.output,
        attempt.output.result.as_ref(),
        Some(&attempt.ledger),
        &attempt.output.charts,
    )
}

fn handle_resolve(args: &cli::ResolveArgs, config: EngineConfig) -> Result<()> {
    let source = load_dataset(
        "source",
        &args.source,
        args.delimiter,
        args.input_encoding.as_deref(),
    )?;
    let target = load_dataset(
        "target",
        &args.target,
        args.delimiter,
        args.input_encoding.as_deref(),
    )?;
    let embedder = CharNgramEmbedder::default();
    let judge = load_judge(args.aliases.as_deref())?;
    let mut cascade = MatchingCascade::new(config.matching).with_embedder(&embedder);
    if let Some(judge) = judge.as_ref() {
        cascade = cascade.with_judge(judge);
    }

    let mut ledger = AuditLedger::new(config.sandbox.exclusion_sample_rows);
    let source_column = source.require_column(&args.source_column)?;
    let target_column = target.require_column(&args.target_column)?;
    let mapping = cascade.resolve(
        source.distinct_display(source_column),
        target.distinct_display(target_column),
        &mut ledger,
    );
    let table = mapping.to_dataset("mapping");
    println!("{}", table.render(usize::MAX));
    info!(
        "Resolved {} of {} key(s)",
        mapping.resolved_count(),
        mapping.len()
    );

    if let Some(path) = &args.output {
        table.write_csv(path, io_utils::resolve_delimiter(path, None))?;
        info!("Key mapping written to {:?}", path);
    }
    if let Some(path) = &args.merge {
        let (merged, matched) = matching::merge_resolved(
            "merged",
            &source,
            source_column,
            &target,
            target_column,
            &mapping,
        )?;
        merged.write_csv(path, io_utils::resolve_delimiter(path, None))?;
        info!(
            "Merged table written to {:?}: {matched} of {} row(s) matched",
            path,
            source.row_count()
        );
    }
    if let Some(path) = &args.audit {
        ledger.write_csv(path)?;
    }
    Ok(())
}

fn handle_reconcile(args: &cli::ReconcileArgs, config: EngineConfig) -> Result<()> {
    let left = load_dataset(
        "left",
        &args.left,
        args.delimiter,
        args.input_encoding.as_deref(),
    )?;
    let right = load_dataset(
        "right",
        &args.right,
        args.delimiter,
        args.input_encoding.as_deref(),
    )?;
    let tolerance = args
        .tolerance
        .unwrap_or(config.reconcile.default_tolerance);
    let spec = ReconcileSpec::new(
        (args.left_key.as_str(), args.left_amount.as_str()),
        (args.right_key.as_str(), args.right_amount.as_str()),
    )
    .with_tolerance(tolerance);
    debug!("Reconciling with {spec:?}");

    let mut ledger = AuditLedger::new(config.sandbox.exclusion_sample_rows);
    let records = reconcile::reconcile(&left, &right, &spec, &mut ledger)?;
    let summary = MatchStatus::ALL
        .iter()
        .map(|status| {
            let count = records.iter().filter(|r| r.status == *status).count();
            vec![status.to_string(), count.to_string()]
        })
        .collect::<Vec<_>>();
    println!(
        "{}",
        table::render_table(&["status".to_string(), "records".to_string()], &summary)
    );

    if let Some(path) = &args.output {
        reconcile::records_to_dataset("reconciliation", &records)?
            .write_csv(path, io_utils::resolve_delimiter(path, None))?;
        info!("{} reconciliation record(s) written to {:?}", records.len(), path);
    }
    if let Some(path) = &args.audit {
        ledger.write_csv(path)?;
    }
    Ok(())
}

fn handle_replay(args: &cli::ReplayArgs, config: EngineConfig) -> Result<()> {
    let services = ScriptedServices::load(&args.script)?;
    let embedder = CharNgramEmbedder::default();
    let judge = load_judge(args.input.aliases.as_deref())?;
    let mut sandbox = Sandbox::new(config).with_embedder(&embedder);
    if let Some(judge) = judge.as_ref() {
        sandbox = sandbox.with_judge(judge);
    }
    let orchestrator = Orchestrator::new(&services, &services, sandbox);

    let mut session = Session::new();
    for dataset in load_inputs(&args.input)?.iter() {
        session.ingest(dataset.clone());
    }

    let instructions = if args.instructions.is_empty() {
        vec![String::new()]
    } else {
        args.instructions.clone()
    };
    let mut reports = Vec::with_capacity(instructions.len());
    for instruction in &instructions {
        let report = orchestrator.run_turn(&mut session, instruction);
        for attempt in &report.attempts {
            for line in &attempt.log {
                println!("{line}");
            }
        }
        for reply in &report.replies {
            println!("{reply}");
        }
        println!("Turn {}: {}", reports.len() + 1, report.status);
        reports.push(report);
    }

    if let Some(path) = &args.report {
        io_utils::write_json(path, &reports)?;
        info!("Turn report(s) written to {:?}", path);
    }
    let result = session.take_result();
    let ledger = session.take_audit();
    write_outputs(&args.output, result.as_ref(), ledger.as_ref(), session.charts())?;

    if reports
        .last()
        .is_some_and(|report| report.status == TurnStatus::Aborted)
    {
        bail!("The last turn was aborted after repeated failures");
    }
    Ok(())
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}

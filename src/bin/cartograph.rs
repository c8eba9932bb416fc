//! Cartograph CLI: drive the embedding pipeline of a project.
//!
//! Usage:
//!   cartograph project <create|list|delete|config> [--data-dir path]
//!   cartograph ingest <project> <file> [--labelled]
//!   cartograph extract <project> [--stage clustering]
//!   cartograph train <cohesion|correction> <project> ...

use cartograph::lineage::StageConfig;
use cartograph::{
    Correction, NewUnit, PipelineContext, ProjectConfig, ProjectId, Settings, Stage,
    TrainingMode, TrainingOptions, TrainingRequest, UnitId,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cartograph",
    version,
    about = "Incremental embedding, projection and clustering of text corpora"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Settings file (YAML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Keep the database and artifacts under this directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Embedding batch size
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    /// Spill embedding batches to disk
    #[arg(long, global = true)]
    disk_spill: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Add units from a text file, one per line
    Ingest {
        project: i64,
        file: PathBuf,
        /// Lines are `label<TAB>text`
        #[arg(long)]
        labelled: bool,
    },
    /// Bring a stage (and everything upstream of it) up to date
    Extract {
        project: i64,
        #[arg(long, default_value = "clustering")]
        stage: Stage,
    },
    /// Refine the trainable projector
    Train {
        #[command(subcommand)]
        mode: TrainMode,
    },
    /// Drop a stage's current model and outputs, and everything downstream
    Reset { project: i64, stage: Stage },
    /// Refit reduction and clustering from the current embeddings
    Recalculate { project: i64 },
    /// Remove models and outputs left behind by earlier configurations
    Gc { project: i64 },
    /// Print the plot view as JSON
    Plot {
        project: i64,
        /// Write to the project's plots directory instead of stdout
        #[arg(long)]
        export: bool,
    },
    /// Show counts per stage and cluster sizes
    Stats { project: i64 },
    /// List units whose label disagrees with their cluster's dominant label
    Mismatches {
        project: i64,
        #[arg(long, default_value_t = 0.7)]
        cutoff: f32,
        #[arg(long, default_value_t = 20)]
        max_count: usize,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Create {
        name: String,
        /// Project configuration (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List all projects
    List,
    /// Delete a project and everything derived from it
    Delete { project: i64 },
    /// Show a project's configuration, or replace it
    Config {
        project: i64,
        /// New configuration (YAML)
        #[arg(long)]
        set: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TrainArgs {
    project: i64,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long = "train-batch-size")]
    batch: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
}

#[derive(Subcommand)]
enum TrainMode {
    /// Pull units with the same label together
    Cohesion(TrainArgs),
    /// Move units to target positions
    Correction {
        #[command(flatten)]
        args: TrainArgs,
        /// `UNIT:X,Y`, repeatable
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
        /// Weight of the drift term
        #[arg(long)]
        lambda: Option<f32>,
    },
}

fn load_settings(global: &GlobalArgs) -> Result<Settings, String> {
    let mut settings = Settings::load(global.settings.as_deref()).map_err(|e| e.to_string())?;
    if let Some(dir) = &global.data_dir {
        let training = settings.training.clone();
        settings = Settings {
            batch_size: settings.batch_size,
            use_disk_storage: settings.use_disk_storage,
            training,
            ..Settings::in_dir(dir)
        };
    }
    if let Some(batch_size) = global.batch_size {
        settings.batch_size = batch_size;
    }
    if global.disk_spill {
        settings.use_disk_storage = true;
    }
    Ok(settings)
}

fn read_config(path: &Path) -> Result<ProjectConfig, String> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    ProjectConfig::from_yaml(&yaml).map_err(|e| e.to_string())
}

fn parse_target(spec: &str) -> Result<Correction, String> {
    let (unit, coords) = spec
        .split_once(':')
        .ok_or_else(|| format!("target '{}' is not UNIT:X,Y", spec))?;
    let unit: i64 = unit
        .trim()
        .parse()
        .map_err(|_| format!("bad unit id in '{}'", spec))?;
    let target = coords
        .split(',')
        .map(|c| c.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| format!("bad coordinates in '{}'", spec))?;
    Ok(Correction {
        unit: UnitId(unit),
        target,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_project_create(ctx: &PipelineContext, name: &str, config: Option<&Path>) -> i32 {
    let config = match config.map(read_config).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match ctx.create_project(name, config) {
        Ok(project) => {
            println!("Created project '{}' ({})", project.name, project.id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_project_list(ctx: &PipelineContext) -> i32 {
    let projects = match ctx.list_projects() {
        Ok(projects) => projects,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if projects.is_empty() {
        println!("No projects defined.");
        return 0;
    }
    println!("{:>6}  {:<24}  {:<10}  {}", "ID", "NAME", "REDUCTION", "CREATED");
    println!("{}", "-".repeat(72));
    for project in projects {
        println!(
            "{:>6}  {:<24}  {:<10}  {}",
            project.id.0,
            project.name,
            project.config.reduction_config.model_name(),
            project.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    0
}

async fn cmd_project_delete(ctx: &PipelineContext, project: ProjectId) -> i32 {
    match ctx.delete_project(project).await {
        Ok(()) => {
            println!("Deleted project {}", project);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_project_config(ctx: &PipelineContext, project: ProjectId, set: Option<&Path>) -> i32 {
    let result = match set {
        None => ctx.project(project),
        Some(path) => match read_config(path) {
            Ok(config) => ctx.set_config(project, config).await,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        },
    };
    match result {
        Ok(project) => print_json(&project.config),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_ingest(ctx: &PipelineContext, project: ProjectId, file: &Path, labelled: bool) -> i32 {
    let contents = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", file.display(), e);
            return 1;
        }
    };
    let mut units = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if !labelled {
            units.push(NewUnit::new(line.trim()));
            continue;
        }
        match line.split_once('\t') {
            Some((label, text)) if !label.trim().is_empty() => {
                units.push(NewUnit::new(text.trim()).with_label(label.trim()))
            }
            Some((_, text)) => units.push(NewUnit::new(text.trim())),
            None => {
                eprintln!("Error: line {} has no label column", lineno + 1);
                return 1;
            }
        }
    }
    match ctx.add_units(project, &units).await {
        Ok(ids) => {
            println!("Ingested {} units into project {}", ids.len(), project);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_extract(ctx: &PipelineContext, project: ProjectId, stage: Stage) -> i32 {
    let started = std::time::Instant::now();
    match ctx.extract(project, stage).await {
        Ok(processed) => {
            println!(
                "Processed {} items for {} in {:.2}s",
                processed,
                stage,
                started.elapsed().as_secs_f64()
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn training_options(ctx: &PipelineContext, request: &TrainingRequest, args: &TrainArgs) -> TrainingOptions {
    let defaults = &ctx.settings().training;
    let mut options = match request.mode {
        TrainingMode::Cohesion => TrainingOptions::cohesion(defaults),
        TrainingMode::Correction(_) => TrainingOptions::correction(defaults),
    };
    if let Some(epochs) = args.epochs {
        options.epochs = epochs;
    }
    if let Some(batch_size) = args.batch {
        options.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        options.learning_rate = learning_rate;
    }
    options
}

async fn cmd_train(ctx: &PipelineContext, mode: TrainMode) -> i32 {
    let (args, request, lambda) = match mode {
        TrainMode::Cohesion(args) => (args, TrainingRequest::cohesion(), None),
        TrainMode::Correction {
            args,
            targets,
            lambda,
        } => {
            let corrections = match targets.iter().map(|t| parse_target(t)).collect::<Result<Vec<_>, _>>() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return 1;
                }
            };
            (args, TrainingRequest::correction(corrections), lambda)
        }
    };
    let mut options = training_options(ctx, &request, &args);
    if let Some(lambda) = lambda {
        options.lambda = lambda;
    }

    match ctx
        .train(ProjectId(args.project), request.with_options(options))
        .await
    {
        Ok(report) => {
            let last = report.epoch_losses.last().copied().unwrap_or_default();
            println!(
                "Trained {} on {} units: {} steps, final loss {:.4}, {} positions regenerated",
                report.mode, report.units, report.steps, last, report.regenerated.reduced
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_reset(ctx: &PipelineContext, project: ProjectId, stage: Stage) -> i32 {
    match ctx.reset(project, stage).await {
        Ok(report) => {
            println!(
                "Reset {} stage(s): {} models, {} artifacts removed",
                report.stages.len(),
                report.models_removed,
                report.artifacts_removed
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_recalculate(ctx: &PipelineContext, project: ProjectId) -> i32 {
    match ctx.recalculate(project).await {
        Ok(report) => {
            println!(
                "Recalculated: {} positions, {} cluster labels",
                report.reduced, report.clustered
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_gc(ctx: &PipelineContext, project: ProjectId) -> i32 {
    match ctx.collect_garbage(project).await {
        Ok(report) => {
            println!(
                "Removed {} models and {} artifacts",
                report.models_removed, report.artifacts_removed
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_plot(ctx: &PipelineContext, project: ProjectId, export: bool) -> i32 {
    if export {
        return match ctx.export_plot(project) {
            Ok(path) => {
                println!("Wrote {}", path.display());
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        };
    }
    match ctx.plot(project) {
        Ok(rows) => print_json(&rows),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_stats(ctx: &PipelineContext, project: ProjectId) -> i32 {
    match ctx.stats(project) {
        Ok(stats) => print_json(&stats),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_mismatches(ctx: &PipelineContext, project: ProjectId, cutoff: f32, max_count: usize) -> i32 {
    match ctx.mismatches(project, cutoff, max_count) {
        Ok(found) => print_json(&found),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = match load_settings(&cli.global).and_then(|s| PipelineContext::open(s).map_err(|e| e.to_string())) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Project { action } => match action {
            ProjectAction::Create { name, config } => cmd_project_create(&ctx, &name, config.as_deref()),
            ProjectAction::List => cmd_project_list(&ctx),
            ProjectAction::Delete { project } => cmd_project_delete(&ctx, ProjectId(project)).await,
            ProjectAction::Config { project, set } => {
                cmd_project_config(&ctx, ProjectId(project), set.as_deref()).await
            }
        },
        Commands::Ingest {
            project,
            file,
            labelled,
        } => cmd_ingest(&ctx, ProjectId(project), &file, labelled).await,
        Commands::Extract { project, stage } => cmd_extract(&ctx, ProjectId(project), stage).await,
        Commands::Train { mode } => cmd_train(&ctx, mode).await,
        Commands::Reset { project, stage } => cmd_reset(&ctx, ProjectId(project), stage).await,
        Commands::Recalculate { project } => cmd_recalculate(&ctx, ProjectId(project)).await,
        Commands::Gc { project } => cmd_gc(&ctx, ProjectId(project)).await,
        Commands::Plot { project, export } => cmd_plot(&ctx, ProjectId(project), export),
        Commands::Stats { project } => cmd_stats(&ctx, ProjectId(project)),
        Commands::Mismatches {
            project,
            cutoff,
            max_count,
        } => cmd_mismatches(&ctx, ProjectId(project), cutoff, max_count),
    };
    std::process::exit(code);
}

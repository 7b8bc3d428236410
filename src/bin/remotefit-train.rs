//! Train a built-in estimator on a table held in a SQLite substrate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use remotefit::estimator::{
    BoostedStumps, EstimatorBlob, GridSearchCV, LogisticRegression, ParamGrid, ParamValue,
    RidgeRegression, Scoring,
};
use remotefit::session::Session;
use remotefit::{
    DatasetHandle, Estimator, ExecutionMode, ModelSpecification, SqliteSession, TrainerBuilder,
    config, logging,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    if let Err(err) = logging::init() {
        eprintln!("Logging disabled: {err}");
    }
    let settings = match &options.config {
        Some(path) => config::load_from_path(path),
        None => config::load_or_default(),
    }
    .map_err(|err| err.to_string())?;

    let stage_root = match &options.stage_root {
        Some(path) => path.clone(),
        None => remotefit::app_dirs::stages_dir().map_err(|err| err.to_string())?,
    };
    let session = SqliteSession::open(&options.db, &stage_root)
        .map_err(|err| err.to_string())?
        .with_max_concurrent(settings.max_concurrent_units);
    let schema = session
        .describe_table(&options.table)
        .map_err(|err| err.to_string())?;

    let estimator = build_estimator(&options)?;
    let spec = ModelSpecification::builder(estimator.as_ref())
        .input_cols(options.inputs.iter().cloned())
        .label_cols(options.labels.iter().cloned())
        .build(&schema)
        .map_err(|err| err.to_string())?;

    let mut trainer = TrainerBuilder::new(DatasetHandle::remote(&options.table), spec, estimator)
        .session(Arc::new(session))
        .settings(settings)
        .mode(options.mode)
        .build()
        .map_err(|err| err.to_string())?;
    println!("mode: {}", trainer.mode());
    let trained = trainer.train();
    let cleaned = trainer.cleanup();
    let result = trained.map_err(|err| err.to_string())?;
    cleaned.map_err(|err| err.to_string())?;

    for warning in &result.warnings {
        println!("warning: {warning}");
    }
    if let Some(rows) = result.metrics.rows {
        println!("rows: {rows}");
    }
    if result.metrics.chunks > 0 {
        println!("chunks: {}", result.metrics.chunks);
    }
    if let Some(search) = &result.metrics.search {
        println!(
            "best: combination {} {{{}}} score={:.4}",
            search.best_index,
            remotefit::estimator::format_params(&search.best_params),
            search.best_score
        );
    }
    println!("elapsed: {:.2?}", result.metrics.duration);
    save_model(&options.model_out, result.estimator.as_ref())?;
    println!("model: {}", options.model_out.display());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EstimatorKind {
    Ridge,
    LogReg,
    Boost,
}

#[derive(Debug, Clone)]
struct CliOptions {
    db: PathBuf,
    stage_root: Option<PathBuf>,
    config: Option<PathBuf>,
    table: String,
    inputs: Vec<String>,
    labels: Vec<String>,
    estimator: EstimatorKind,
    mode: Option<ExecutionMode>,
    grid: ParamGrid,
    cv: usize,
    scoring: Option<Scoring>,
    model_out: PathBuf,
}

fn build_estimator(options: &CliOptions) -> Result<Box<dyn Estimator>, String> {
    let base: Box<dyn Estimator> = match options.estimator {
        EstimatorKind::Ridge => Box::new(RidgeRegression::default()),
        EstimatorKind::LogReg => Box::new(LogisticRegression::default()),
        EstimatorKind::Boost => Box::new(BoostedStumps::default()),
    };
    if options.grid.is_empty() {
        if options.mode == Some(ExecutionMode::DistributedSearch) {
            return Err("--mode search requires at least one --grid entry".to_string());
        }
        return Ok(base);
    }
    let scoring = options.scoring.unwrap_or(match options.estimator {
        EstimatorKind::LogReg => Scoring::Accuracy,
        EstimatorKind::Ridge | EstimatorKind::Boost => Scoring::R2,
    });
    Ok(Box::new(GridSearchCV::new(
        base,
        options.grid.clone(),
        options.cv,
        scoring,
    )))
}

fn save_model(path: &Path, estimator: &dyn Estimator) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let blob = EstimatorBlob::from_estimator(estimator).map_err(|err| err.to_string())?;
    let bytes = serde_json::to_vec_pretty(&blob).map_err(|err| err.to_string())?;
    std::fs::write(path, bytes).map_err(|err| err.to_string())
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut db: Option<PathBuf> = None;
    let mut stage_root: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut table: Option<String> = None;
    let mut inputs: Vec<String> = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut estimator = EstimatorKind::Ridge;
    let mut mode = None;
    let mut grid = ParamGrid::new();
    let mut cv = 5usize;
    let mut scoring = None;
    let mut model_out = PathBuf::from("model.json");

    let mut idx = 0usize;
    while idx < args.len() {
        let flag = args[idx].as_str();
        if matches!(flag, "-h" | "--help") {
            return Err(help_text());
        }
        idx += 1;
        let value = args
            .get(idx)
            .ok_or_else(|| format!("{flag} requires a value"))?;
        match flag {
            "--db" => db = Some(PathBuf::from(value)),
            "--stage-root" => stage_root = Some(PathBuf::from(value)),
            "--config" => config = Some(PathBuf::from(value)),
            "--table" => table = Some(value.clone()),
            "--inputs" => inputs = split_list(value),
            "--labels" => labels = split_list(value),
            "--estimator" => {
                estimator = match value.as_str() {
                    "ridge" => EstimatorKind::Ridge,
                    "logreg" => EstimatorKind::LogReg,
                    "boost" => EstimatorKind::Boost,
                    other => return Err(format!("Unknown --estimator value: {other}")),
                }
            }
            "--mode" => mode = Some(value.parse::<ExecutionMode>()?),
            "--grid" => {
                let (name, values) = parse_grid_entry(value)?;
                grid.insert(name, values);
            }
            "--cv" => {
                cv = value
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid --cv value: {value}"))?;
            }
            "--scoring" => scoring = Some(value.parse::<Scoring>()?),
            "--out" => model_out = PathBuf::from(value),
            other => return Err(format!("Unknown argument: {other}\n\n{}", help_text())),
        }
        idx += 1;
    }

    let db = db.ok_or_else(|| format!("--db is required\n\n{}", help_text()))?;
    let table = table.ok_or_else(|| format!("--table is required\n\n{}", help_text()))?;
    if inputs.is_empty() || labels.is_empty() {
        return Err(format!("--inputs and --labels are required\n\n{}", help_text()));
    }
    Ok(CliOptions {
        db,
        stage_root,
        config,
        table,
        inputs,
        labels,
        estimator,
        mode,
        grid,
        cv,
        scoring,
        model_out,
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// `alpha=0.1,1,10`
fn parse_grid_entry(value: &str) -> Result<(String, Vec<ParamValue>), String> {
    let (name, values) = value
        .split_once('=')
        .ok_or_else(|| format!("Invalid --grid entry (expected name=v1,v2): {value}"))?;
    let values: Vec<ParamValue> = split_list(values).iter().map(|v| parse_param(v)).collect();
    if name.trim().is_empty() || values.is_empty() {
        return Err(format!("Invalid --grid entry: {value}"));
    }
    Ok((name.trim().to_string(), values))
}

fn parse_param(value: &str) -> ParamValue {
    if let Ok(int) = value.parse::<i64>() {
        ParamValue::Int(int)
    } else if let Ok(float) = value.parse::<f64>() {
        ParamValue::Float(float)
    } else if let Ok(flag) = value.parse::<bool>() {
        ParamValue::Bool(flag)
    } else {
        ParamValue::Text(value.to_string())
    }
}

fn help_text() -> String {
    [
        "remotefit-train",
        "",
        "Trains a built-in estimator on a table in a SQLite substrate.",
        "",
        "Usage:",
        "  remotefit-train --db <file> --table <name> --inputs <a,b> --labels <y> [options]",
        "",
        "Options:",
        "  --db <file>            SQLite database holding the table (required).",
        "  --stage-root <dir>     Directory for stages (default: app data stages dir).",
        "  --config <file>        Settings file (default: app config.toml).",
        "  --table <name>         Training table (required).",
        "  --inputs <cols>        Comma-separated feature columns (required).",
        "  --labels <cols>        Comma-separated label columns (required).",
        "  --estimator <kind>     ridge | logreg | boost (default: ridge).",
        "  --mode <mode>          local | remote | search | external (default: automatic).",
        "  --grid <name=v1,v2>    Search values for one parameter; repeatable.",
        "  --cv <n>               Search folds (default: 5).",
        "  --scoring <metric>     accuracy | r2 | mean_squared_error | mean_absolute_error.",
        "  --out <file>           Output model path (default: model.json).",
    ]
    .join("\n")
}

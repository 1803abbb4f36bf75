use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wcs_engine::{
    analyze_labeled, parse_duration_token, prepare, AnalysisConfig, IntensityBand, KindSummary,
    KinematicSeries, KinematicStats, PreprocessOptions, ResultSet, SeriesMetadata, SignalGate,
    VelocityStats, WindowOutcome,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Worst-case-scenario epoch analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute rolling and contiguous WCS windows for one or more velocity files
    Analyze(AnalyzeArgs),
    /// Report velocity and kinematic statistics without windowing
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Velocity files (one value per line, or CSV with a velocity column)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// JSON analysis config; flags below override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Sampling rate in Hz
    #[arg(long)]
    rate: Option<f64>,

    /// Epoch durations (comma separated tokens like 30,60s,1.5m)
    #[arg(long)]
    durations: Option<String>,

    /// Intensity band `name:lower:upper` in m/s (repeatable)
    #[arg(long = "band")]
    bands: Vec<String>,

    /// Velocity ceiling for spike clipping (m/s)
    #[arg(long)]
    ceiling: Option<f64>,

    /// Keep velocity spikes as recorded
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "ceiling")]
    no_clip: bool,

    /// Zero samples at or below this velocity before banding (m/s)
    #[arg(long)]
    gate_velocity: Option<f64>,

    /// Zero samples whose |acceleration| is at or below this value before banding (m/s²)
    #[arg(long, conflicts_with = "gate_velocity")]
    gate_acceleration: Option<f64>,

    /// Name of the velocity column in CSV inputs
    #[arg(long, default_value = "Velocity")]
    column: String,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Velocity files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Sampling rate in Hz
    #[arg(long, default_value_t = wcs_engine::DEFAULT_SAMPLING_RATE_HZ)]
    rate: f64,

    /// Name of the velocity column in CSV inputs
    #[arg(long, default_value = "Velocity")]
    column: String,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SeriesReport {
    Ok {
        source: String,
        summary: Vec<KindSummary>,
        result: ResultSet,
    },
    Failed {
        source: String,
        error: String,
    },
}

#[derive(Serialize)]
struct AnalysisReport<'a> {
    generated_at: String,
    config: &'a AnalysisConfig,
    series: Vec<SeriesReport>,
}

#[derive(Serialize)]
struct InspectEntry {
    source: String,
    clipped_samples: usize,
    velocity: VelocityStats,
    kinematics: KinematicStats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Analyze(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let config = build_config(&args)?;
    info!(
        "Analyzing {} input(s) at {} Hz: {} epoch(s), {} band(s)",
        args.inputs.len(),
        config.sampling_rate(),
        config.epoch_durations().len(),
        config.bands().len()
    );

    let t_compute = Instant::now();
    let reports: Vec<SeriesReport> = args
        .inputs
        .par_iter()
        .map(|path| analyze_file(path, &config, &args.column))
        .collect();
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} series)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            reports.len()
        );
    }

    let failed = reports
        .iter()
        .filter(|r| matches!(r, SeriesReport::Failed { .. }))
        .count();

    let t_write = Instant::now();
    let mut writer = open_output(&args.output)?;
    match args.format {
        OutputFormat::Json => {
            let report = AnalysisReport {
                generated_at: Utc::now().to_rfc3339(),
                config: &config,
                series: reports,
            };
            serde_json::to_writer_pretty(&mut writer, &report)?;
            writeln!(writer)?;
        }
        OutputFormat::Csv => write_result_rows(&reports, &mut writer)?,
    }
    writer.flush()?;
    if args.profile || args.verbose {
        info!(
            "Write stage: {:.1} ms",
            t_write.elapsed().as_secs_f64() * 1000.0
        );
    }
    if args.output.as_os_str() != "-" {
        info!("Wrote results: {}", args.output.display());
    }

    if failed == args.inputs.len() {
        return Err(anyhow!("all {} input(s) failed", failed));
    }
    if failed > 0 {
        warn!("{} of {} input(s) failed", failed, args.inputs.len());
    }
    Ok(())
}

fn analyze_file(path: &Path, config: &AnalysisConfig, column: &str) -> SeriesReport {
    let source = path.display().to_string();
    let velocity = match read_velocity_file(path, column) {
        Ok(v) => v,
        Err(err) => {
            warn!("Skipping {}: {:#}", source, err);
            return SeriesReport::Failed {
                source,
                error: format!("{:#}", err),
            };
        }
    };
    let subject = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string);
    let metadata = SeriesMetadata::new(source.clone(), subject);
    match analyze_labeled(metadata, &velocity, config) {
        Ok(result) => {
            let skipped = result.skipped().count();
            info!(
                "{}: {} windows evaluated, {} skipped, {} clipped samples",
                source,
                result.evaluated_count(),
                skipped,
                result.clipped_samples()
            );
            for entry in result.skipped() {
                debug!(
                    "{}: skipped {} {} s ({})",
                    source,
                    entry.band.name,
                    entry.epoch_s,
                    entry.kind.as_str()
                );
            }
            SeriesReport::Ok {
                source,
                summary: result.summary(),
                result,
            }
        }
        Err(failure) => {
            warn!("{}", failure);
            SeriesReport::Failed {
                source,
                error: failure.error.to_string(),
            }
        }
    }
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let options = PreprocessOptions::default();
    let entries = args
        .inputs
        .par_iter()
        .map(|path| -> Result<InspectEntry> {
            let velocity = read_velocity_file(path, &args.column)?;
            let series = prepare(&velocity, args.rate, &options)
                .with_context(|| format!("invalid series in {}", path.display()))?;
            let kinematics = KinematicSeries::derive(series.velocity().view(), args.rate);
            Ok(InspectEntry {
                source: path.display().to_string(),
                clipped_samples: series.clipped_samples(),
                velocity: VelocityStats::compute(&series, &kinematics),
                kinematics: kinematics.stats(series.duration_s()),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut writer = open_output(&args.output)?;
    serde_json::to_writer_pretty(
        &mut writer,
        &serde_json::json!({
            "generated_at": Utc::now().to_rfc3339(),
            "sampling_rate": args.rate,
            "series": entries,
        }),
    )?;
    writeln!(writer)?;
    writer.flush()?;
    if args.output.as_os_str() != "-" {
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

fn build_config(args: &AnalyzeArgs) -> Result<AnalysisConfig> {
    let base = match args.config.as_ref() {
        Some(path) => load_config(path)?,
        None => AnalysisConfig::default(),
    };

    let rate = args.rate.unwrap_or_else(|| base.sampling_rate());
    let durations = match args.durations.as_ref() {
        Some(list) => {
            let parsed = parse_duration_list(list)?;
            if parsed.is_empty() {
                return Err(anyhow!("--durations list was empty"));
            }
            parsed
        }
        None => base.epoch_durations().to_vec(),
    };
    let bands = if args.bands.is_empty() {
        base.bands().to_vec()
    } else {
        args.bands
            .iter()
            .map(|spec| parse_band(spec))
            .collect::<Result<Vec<_>>>()?
    };

    let mut preprocess = base.preprocess().clone();
    if args.no_clip {
        preprocess.velocity_ceiling = None;
    } else if let Some(ceiling) = args.ceiling {
        preprocess.velocity_ceiling = Some(ceiling);
    }

    let gate = if let Some(threshold) = args.gate_velocity {
        SignalGate::Velocity { threshold }
    } else if let Some(threshold) = args.gate_acceleration {
        SignalGate::Acceleration { threshold }
    } else {
        base.gate().clone()
    };

    let config = AnalysisConfig::new(rate, durations, bands)
        .and_then(|c| c.with_preprocess(preprocess))
        .and_then(|c| c.with_gate(gate))
        .context("invalid analysis configuration")?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<AnalysisConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    AnalysisConfig::from_json_str(&text)
        .with_context(|| format!("{} is not a valid analysis config", path.display()))
}

fn parse_duration_list(input: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = parse_duration_token(trimmed).ok_or_else(|| {
            anyhow!(
                "invalid duration '{}': expected seconds or a 1.5m / 0.5h style token",
                trimmed
            )
        })?;
        if value <= 0.0 {
            return Err(anyhow!("duration tokens must be > 0"));
        }
        out.push(value);
    }
    Ok(out)
}

/// `name:lower:upper`, e.g. `hsr:5.5:7`.
fn parse_band(spec: &str) -> Result<IntensityBand> {
    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
    let [name, lower, upper] = parts.as_slice() else {
        return Err(anyhow!(
            "invalid band '{}': expected name:lower:upper",
            spec
        ));
    };
    if name.is_empty() {
        return Err(anyhow!("invalid band '{}': name is empty", spec));
    }
    let lower: f64 = lower
        .parse()
        .with_context(|| format!("invalid lower bound in band '{}'", spec))?;
    let upper: f64 = upper
        .parse()
        .with_context(|| format!("invalid upper bound in band '{}'", spec))?;
    Ok(IntensityBand::new(*name, lower, upper))
}

/// Read one velocity column. The first non-empty row is a header when it
/// names `column`; a purely numeric single-field first row means a bare
/// velocity column. Several numeric fields without a header are rejected.
fn read_velocity_file(path: &Path, column: &str) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut index: Option<usize> = None;
    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("{}: malformed row {}", path.display(), row + 1))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let idx = match index {
            Some(idx) => idx,
            None => {
                if let Some(idx) = record.iter().position(|f| f.eq_ignore_ascii_case(column)) {
                    index = Some(idx);
                    continue;
                }
                if record.iter().any(|f| f.parse::<f64>().is_err()) {
                    return Err(anyhow!(
                        "{}: header has no '{}' column",
                        path.display(),
                        column
                    ));
                }
                if record.len() > 1 {
                    return Err(anyhow!(
                        "{}: {} columns without a header; add a header naming '{}'",
                        path.display(),
                        record.len(),
                        column
                    ));
                }
                index = Some(0);
                0
            }
        };
        let field = record.get(idx).ok_or_else(|| {
            anyhow!(
                "{}: row {} has no column {}",
                path.display(),
                row + 1,
                idx + 1
            )
        })?;
        let value: f64 = field.parse().with_context(|| {
            format!(
                "{}: row {}: '{}' is not a number",
                path.display(),
                row + 1,
                field
            )
        })?;
        out.push(value);
    }
    if out.is_empty() {
        return Err(anyhow!("{} contains no velocity samples", path.display()));
    }
    Ok(out)
}

fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(io::stdout().lock()))
    } else {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Box::new(io::BufWriter::new(file)))
    }
}

fn write_result_rows<W: Write>(reports: &[SeriesReport], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record([
        "source",
        "band",
        "epoch_s",
        "kind",
        "window_samples",
        "status",
        "value_m",
        "mean_rate_mps",
        "time_in_band_s",
        "start_index",
        "end_index",
        "start_s",
        "end_s",
        "detail",
    ])?;

    for report in reports {
        let (source, result) = match report {
            SeriesReport::Ok { source, result, .. } => (source, result),
            SeriesReport::Failed { source, error } => {
                writer.write_record([
                    source.as_str(),
                    "",
                    "",
                    "",
                    "",
                    "failed",
                    "",
                    "",
                    "",
                    "",
                    "",
                    "",
                    "",
                    error.as_str(),
                ])?;
                continue;
            }
        };
        for entry in result.results() {
            let mut row = vec![
                source.clone(),
                entry.band.name.clone(),
                format!("{}", entry.epoch_s),
                entry.kind.as_str().to_string(),
                entry.window_samples.to_string(),
            ];
            match &entry.outcome {
                WindowOutcome::Evaluated(peak) => row.extend([
                    "evaluated".to_string(),
                    format!("{:.3}", peak.value),
                    format!("{:.3}", peak.mean_rate),
                    format!("{:.3}", peak.time_in_band_s),
                    peak.start_index.to_string(),
                    peak.end_index.to_string(),
                    format!("{:.3}", peak.start_s),
                    format!("{:.3}", peak.end_s),
                    String::new(),
                ]),
                WindowOutcome::Skipped(reason) => {
                    row.push("skipped".to_string());
                    row.extend(std::iter::repeat(String::new()).take(7));
                    row.push(reason.to_string());
                }
            }
            writer.write_record(&row)?;
        }
    }
    writer.flush()?;
    Ok(())
}

//! dotgrid CLI: calibrate a camera from asymmetric dot-grid views.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dotgrid::{
    calibrate, open_source, preview_distortion, reference_camera, CalibrationConfig, CalibrationReport, CameraModel,
    CancelToken, DistortionPreview, DotGridPattern, FolderSink, NullSink, PreviewParams, PreviewSink,
    SimulationParams, SourceConfig,
};
use log::{info, warn};

#[cfg(not(feature = "tracing"))]
use log::LevelFilter;

#[cfg(feature = "tracing")]
use tracing_log::LogTracer;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "dotgrid")]
#[command(about = "Camera calibration with an asymmetric 4x11 dot grid")]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON log lines (requires the `tracing` feature).
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect samples from the configured source and solve for the camera.
    Calibrate(CalibrateArgs),

    /// Calibrate a simulated camera and compare with the ground truth.
    Simulate(SimulateArgs),

    /// Undistort one image with a calibration report (or the reference camera).
    Undistort(UndistortArgs),

    /// Write alternating original/undistorted preview frames of one image
    /// (with a calibration report or the reference camera).
    Preview(PreviewArgs),

    /// Print the object points of the calibration pattern.
    Pattern {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Calibration config (JSON). Defaults apply to missing fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the calibration report (JSON).
    #[arg(long)]
    report: Option<PathBuf>,

    /// Folder for operator preview frames.
    #[arg(long)]
    preview_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct SimulateArgs {
    /// Number of samples to collect.
    #[arg(long, default_value = "20")]
    samples: usize,

    /// Where to write the calibration report (JSON).
    #[arg(long)]
    report: Option<PathBuf>,

    /// Folder for operator preview frames.
    #[arg(long)]
    preview_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct UndistortArgs {
    /// Calibration report (JSON). The reference camera is used when omitted.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Input image.
    #[arg(long)]
    input: PathBuf,

    /// Output image.
    #[arg(long)]
    output: PathBuf,

    /// Free scaling: 0 keeps valid pixels only, 1 keeps the whole field of view.
    #[arg(long, default_value = "1.0")]
    alpha: f64,
}

#[derive(Debug, Clone, Args)]
struct PreviewArgs {
    /// Calibration report (JSON). The reference camera is used when omitted.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Input image.
    #[arg(long)]
    input: PathBuf,

    /// Folder for the preview frames.
    #[arg(long)]
    out_dir: PathBuf,

    /// Number of original/undistorted cycles (until Ctrl-C when omitted).
    #[arg(long)]
    cycles: Option<usize>,

    /// Time each image is shown, in milliseconds.
    #[arg(long, default_value = "200")]
    cadence_ms: u64,

    /// Display scale.
    #[arg(long, default_value = "0.5")]
    scale: f32,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
            warn!("Ctrl-C handler not installed: {err}");
        }
    }

    match cli.command {
        Commands::Calibrate(args) => run_calibrate(&args, &cancel),
        Commands::Simulate(args) => run_simulate(&args, &cancel),
        Commands::Undistort(args) => run_undistort(&args),
        Commands::Preview(args) => run_preview(&args, &cancel),
        Commands::Pattern { json } => run_pattern(json),
    }
}

fn init_logging(verbose: u8, json: bool) {
    // Ignore errors if a logger/subscriber was already installed.
    #[cfg(feature = "tracing")]
    {
        let _ = verbose;
        let _ = LogTracer::init();
        dotgrid::core::init_tracing(json);
    }
    #[cfg(not(feature = "tracing"))]
    {
        let level = match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        let _ = dotgrid::core::init_with_level(level);
        if json {
            warn!("--json-logs needs the `tracing` feature; using plain logs");
        }
    }
}

fn preview_sink(dir: Option<&PathBuf>) -> CliResult<Box<dyn PreviewSink>> {
    let sink: Box<dyn PreviewSink> = match dir {
        Some(dir) => Box::new(FolderSink::new(dir)?),
        None => Box::new(NullSink),
    };
    Ok(sink)
}

fn run_with_config(config: &CalibrationConfig, cancel: &CancelToken) -> CliResult<CalibrationReport> {
    let mut sink = preview_sink(config.preview_dir.as_ref())?;
    let source = open_source(config)?;
    let report = calibrate(source, config, &mut *sink, cancel)?;
    println!("{report}");

    // Visual check of the result on a fresh frame.
    if let Some(dir) = &config.preview_dir {
        let mut sink = FolderSink::new(dir.join("distortion"))?;
        let mut source = open_source(config)?;
        let cycles = preview_distortion(
            &mut *source,
            &report.camera,
            &config.preview,
            config.sampling.frame_timeout,
            &mut sink,
            cancel,
        )?;
        info!("{cycles} preview cycles written to {}", dir.join("distortion").display());
    }
    Ok(report)
}

// ── calibrate ──────────────────────────────────────────────────────────

fn run_calibrate(args: &CalibrateArgs, cancel: &CancelToken) -> CliResult<()> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading config {}", path.display());
            CalibrationConfig::load_json(path)?
        }
        None => CalibrationConfig::default(),
    };
    if args.report.is_some() {
        config.report_path = args.report.clone();
    }
    if args.preview_dir.is_some() {
        config.preview_dir = args.preview_dir.clone();
    }
    run_with_config(&config, cancel)?;
    Ok(())
}

// ── simulate ───────────────────────────────────────────────────────────

fn run_simulate(args: &SimulateArgs, cancel: &CancelToken) -> CliResult<()> {
    let mut config = CalibrationConfig::default();
    let sim = SimulationParams {
        // A few spare poses in case a view is missed.
        views: args.samples + 4,
        ..SimulationParams::default()
    };
    let truth = sim.camera;
    config.source = SourceConfig::Synthetic(sim);
    config.sampling.target_samples = args.samples;
    config.report_path = args.report.clone();
    config.preview_dir = args.preview_dir.clone();
    // Keep the preview bounded; there is no operator to close it.
    config.preview.max_cycles = Some(1);

    let report = run_with_config(&config, cancel)?;
    let (t, e) = (truth.matrix, report.camera.matrix);
    println!("ground truth:");
    println!("{truth}");
    println!(
        "error: fx {:+.3} fy {:+.3} cx {:+.3} cy {:+.3}",
        e.fx - t.fx,
        e.fy - t.fy,
        e.cx - t.cx,
        e.cy - t.cy
    );
    Ok(())
}

/// Camera from `--report`, or the reference camera; the report also
/// carries the frame size it was calibrated at.
fn load_camera(report: Option<&PathBuf>) -> CliResult<(CameraModel, Option<(u32, u32)>)> {
    match report {
        Some(path) => {
            let report = CalibrationReport::load_json(path)?;
            Ok((report.camera, Some((report.image_width, report.image_height))))
        }
        None => {
            info!("no --report given, using the reference camera");
            Ok((reference_camera(), None))
        }
    }
}

// ── undistort ──────────────────────────────────────────────────────────

fn run_undistort(args: &UndistortArgs) -> CliResult<()> {
    let (camera, calibrated_size) = load_camera(args.report.as_ref())?;
    let img = image::open(&args.input)
        .map_err(|e| -> CliError { format!("failed to open image {}: {}", args.input.display(), e).into() })?
        .to_rgb8();
    if let Some((w, h)) = calibrated_size.filter(|&size| size != img.dimensions()) {
        warn!(
            "image is {}x{}, calibration was done at {w}x{h}",
            img.width(),
            img.height()
        );
    }

    let params = PreviewParams {
        alpha: args.alpha,
        scale: 1.0,
        ..PreviewParams::default()
    };
    let preview = DistortionPreview::new(&camera, &img, &params);
    preview.undistorted().save(&args.output)?;
    let roi = preview.roi();
    println!(
        "valid region: x={} y={} width={} height={}",
        roi.x, roi.y, roi.width, roi.height
    );
    info!("undistorted image written to {}", args.output.display());
    Ok(())
}

// ── preview ────────────────────────────────────────────────────────────

fn run_preview(args: &PreviewArgs, cancel: &CancelToken) -> CliResult<()> {
    let (camera, _) = load_camera(args.report.as_ref())?;
    let img = image::open(&args.input)
        .map_err(|e| -> CliError { format!("failed to open image {}: {}", args.input.display(), e).into() })?
        .to_rgb8();
    let params = PreviewParams {
        scale: args.scale,
        cadence: Duration::from_millis(args.cadence_ms),
        max_cycles: args.cycles,
        ..PreviewParams::default()
    };
    let preview = DistortionPreview::new(&camera, &img, &params);
    let mut sink = FolderSink::new(&args.out_dir)?;
    let cycles = preview.run(&mut sink, &params, cancel)?;
    println!("{cycles} cycles, {} frames written", sink.written());
    Ok(())
}

// ── pattern ────────────────────────────────────────────────────────────

fn run_pattern(json: bool) -> CliResult<()> {
    let pattern = DotGridPattern::new(Default::default())?;
    if json {
        let points: Vec<[f32; 3]> = pattern.object_points().iter().map(|p| [p.x, p.y, p.z]).collect();
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }
    println!("{} dots ({} rows x {} cols)", pattern.len(), pattern.rows(), pattern.cols());
    for (idx, p) in pattern.object_points().iter().enumerate() {
        let Some(g) = pattern.grid_index(idx) else {
            continue;
        };
        println!("{idx:3}  col {:2} row {}  ({:5.1}, {:5.1}, {:.1})", g.col, g.row, p.x, p.y, p.z);
    }
    Ok(())
}

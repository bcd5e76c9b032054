use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nalgebra::Vector3;
use scanfuse::{
    camera::CameraIntrinsics,
    config::ScanConfig,
    error::{Error, Result},
    io::{write_obj_file, write_ply, TumSource},
    marching_cubes::MarchingCubes,
    mesh::Mesh,
    metrics::TransformMetrics,
    pipeline::{MeshExtraction, ScanPipeline},
    session::{FrameOutcome, Session},
    source::{FrameSource, Limited},
    sync::CancelToken,
    synthetic::{linear_trajectory, SyntheticScene, SyntheticSensor},
    trajectory::Trajectory,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Input {
    /// A rendered corner scene along a straight path
    Synthetic,
    /// A TUM RGB-D sequence directory
    Tum,
}

#[derive(Parser)]
struct Args {
    /// Kind of input
    #[clap(value_enum)]
    input: Input,
    /// Path to the sequence directory, for recorded inputs
    dataset: Option<PathBuf>,
    /// Output mesh, .ply or .obj
    #[clap(long, short, default_value = "scan.ply")]
    output: PathBuf,
    /// JSON file overriding the default scan parameters
    #[clap(long)]
    config: Option<PathBuf>,
    /// Maximum number of frames to process
    #[clap(long)]
    max_frames: Option<usize>,
    /// Colors the mesh from the keyframes
    #[clap(long, action)]
    colorize: bool,
    /// Streams through the threaded pipeline at the given frames per second,
    /// dropping frames the worker cannot keep up with
    #[clap(long)]
    realtime: Option<f64>,
}

fn open_source(args: &Args) -> Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match args.input {
        Input::Synthetic => {
            let intrinsics = CameraIntrinsics::new(262.5, 262.5, 159.5, 119.5, 320, 240);
            let poses = linear_trajectory(&Vector3::zeros(), &Vector3::new(0.003, 0.0, 0.0), 60);
            Box::new(
                SyntheticSensor::new(SyntheticScene::corner(), intrinsics, poses).with_color(true),
            )
        }
        Input::Tum => {
            let dataset = args
                .dataset
                .as_ref()
                .ok_or_else(|| Error::invalid_parameter("a TUM input needs a dataset directory"))?;
            Box::new(TumSource::load(dataset)?)
        }
    };
    Ok(match args.max_frames {
        Some(max_frames) => Box::new(Limited::new(source, max_frames)),
        None => source,
    })
}

/// Processes every frame in order on this thread.
fn scan_sequential(session: &mut Session, source: &mut dyn FrameSource) -> Result<Trajectory> {
    let mut ground_truth = Trajectory::default();
    while let Some(frame) = source.next_frame()? {
        let gt_pose = frame.ground_truth;
        if let FrameOutcome::Tracked(processed) = session.process(frame.depth, frame.color)? {
            if let Some(pose) = gt_pose {
                ground_truth.push(pose, processed.timestamp);
            }
        }
    }
    Ok(ground_truth)
}

fn scan_realtime(session: Session, source: Box<dyn FrameSource>, fps: f64) -> Result<Session> {
    let pipeline = ScanPipeline::start(session)?;
    let capture = pipeline.spawn_source(source, Some(Duration::from_secs_f64(1.0 / fps)))?;
    let frames = match capture.join() {
        Ok(frames) => frames?,
        Err(panic) => std::panic::resume_unwind(panic),
    };
    let dropped = pipeline.dropped_frames();
    let session = pipeline.finish()?;
    info!(frames, dropped, "capture done");
    Ok(session)
}

fn write_mesh(path: &Path, mesh: &Mesh) -> Result<()> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("obj") => write_obj_file(path, mesh),
        Some("ply") => write_ply(path, mesh),
        _ => Err(Error::invalid_parameter(format!(
            "unknown mesh format: {}",
            path.display()
        ))),
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ScanConfig::from_json_file(path)?,
        None => ScanConfig::default(),
    };
    let mut source = open_source(&args)?;
    let mut session = Session::new(config, source.calibration().clone())?;

    let ground_truth = match args.realtime {
        Some(fps) => {
            session = scan_realtime(session, source, fps)?;
            None
        }
        None => Some(scan_sequential(&mut session, source.as_mut())?),
    };

    let stats = session.stats();
    println!(
        "Tracked {} frames, lost {}, recentered {} times",
        stats.tracked, stats.lost, stats.recentered
    );
    if let Some(ground_truth) = ground_truth {
        if ground_truth.len() == session.trajectory().len() && !ground_truth.is_empty() {
            let metrics = TransformMetrics::mean_trajectory_error(
                session.trajectory(),
                &ground_truth.first_frame_at_origin(),
            )?;
            println!("Mean trajectory error: {metrics}");
        }
    }

    let mut mesh = MeshExtraction::spawn(session.shared_volume(), MarchingCubes::default())?.wait();
    if mesh.is_empty() {
        warn!("no surface was scanned");
    }
    if args.colorize {
        let colorizer = session.colorizer();
        mesh = colorizer.preview(&mesh, &session.read_volume());
        let outcome = colorizer.enhanced(&mesh, &session.keyframe_snapshot(), &CancelToken::new());
        info!(status = ?outcome.status, "colorized");
        mesh = outcome.mesh;
    }

    write_mesh(&args.output, &mesh)?;
    println!(
        "Wrote {} vertices and {} faces to {}",
        mesh.len_vertices(),
        mesh.len_faces(),
        args.output.display()
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

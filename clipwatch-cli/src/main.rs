//! Record motion triggered clips from a camera or video file.
//!
//! While running, the following commands are accepted on standard input:
//!
//! * `set <name> <value>` - change a setting.
//! * `show` - list all settings.
//! * `stop` or `q` - close any open clip and exit.
//!
//! Ctrl-C stops the same way.

use clap::*;
use clipwatch::prelude::v1::{Result, *};
use log::*;
use std::io::BufRead;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let matches = Command::new("clipwatch")
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .takes_value(true)
                .help("Camera index, video file, or .rawclip file")
                .default_value("0"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .help("JSON configuration file"),
        )
        .arg(Arg::new("threshold").long("threshold").takes_value(true))
        .arg(Arg::new("min-area").long("min-area").takes_value(true))
        .arg(Arg::new("persistence").long("persistence").takes_value(true))
        .arg(
            Arg::new("pre-buffer-seconds")
                .long("pre-buffer-seconds")
                .takes_value(true),
        )
        .arg(
            Arg::new("clip-duration")
                .long("clip-duration")
                .takes_value(true),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .takes_value(true)
                .help("Nominal frame rate. Defaults to the rate reported by the input"),
        )
        .arg(
            Arg::new("output-dir")
                .long("output-dir")
                .short('o')
                .takes_value(true),
        )
        .arg(Arg::new("log-dir").long("log-dir").takes_value(true))
        .arg(
            Arg::new("no-log")
                .long("no-log")
                .help("Disable the motion event log"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('d')
                .help("Print per-frame diagnostics"),
        )
        .arg(
            Arg::new("preview")
                .long("preview")
                .short('p')
                .help("Show annotated frames in a window (requires the `cv` feature)"),
        )
        .get_matches();

    let debug = matches.is_present("debug");

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" }),
    )
    .init();

    let mut config = match matches.value_of("config") {
        Some(path) => {
            let file = std::fs::File::open(path)?;
            serde_json::from_reader(std::io::BufReader::new(file))?
        }
        None => Config::default(),
    };

    apply_args(&mut config, &matches)?;

    let input = matches.value_of("input").unwrap_or("0");
    let source = open_source(input)?;

    if !matches.is_present("fps") && !matches.is_present("config") {
        if let Some(fps) = source.framerate() {
            if let Err(e) = config.set_fps(fps as f32) {
                warn!("Ignoring input frame rate: {}", e);
            }
        }
    }

    let dim = source
        .dimensions()
        .ok_or_else(|| anyhow!("Could not determine frame dimensions of {}", input))?;

    info!(
        "Watching {} ({}x{} @ {} fps), saving clips to {:?}",
        input, dim.0, dim.1, config.fps, config.output_dir
    );

    let (factory, snapshots) = backends();
    let pipeline = MotionPipeline::new(&config, dim, factory, snapshots)?;
    let mut worker = PipelineWorker::spawn(source, pipeline, SharedConfig::new(config)?);

    let quit = Arc::new(AtomicBool::new(false));

    {
        let quit = quit.clone();
        ctrlc::set_handler(move || {
            info!("Interrupted, stopping");
            quit.store(true, Ordering::Relaxed);
        })?;
    }

    {
        let config = worker.config().clone();
        let quit = quit.clone();
        std::thread::spawn(move || control_loop(&config, &quit));
    }

    let watched = if matches.is_present("preview") {
        watch_with_preview(&worker, &quit)
    } else {
        watch(&worker, &quit, |_| Ok(true))
    };

    let ret = worker.stop();

    for e in worker.take_errors() {
        error!("{}", e);
    }

    info!("Processed {} frames", worker.output().frames);

    watched.and(ret)
}

#[cfg(feature = "cv")]
fn watch_with_preview(worker: &PipelineWorker, quit: &AtomicBool) -> Result<()> {
    let mut preview = clipwatch_cv::CvPreview::new("clipwatch")?;
    watch(worker, quit, |output| preview.show(output))
}

#[cfg(not(feature = "cv"))]
fn watch_with_preview(worker: &PipelineWorker, quit: &AtomicBool) -> Result<()> {
    warn!("Preview requires the `cv` feature");
    watch(worker, quit, |_| Ok(true))
}

/// Report worker progress until it finishes, `quit` is set, or `on_output` returns `false`.
fn watch(
    worker: &PipelineWorker,
    quit: &AtomicBool,
    mut on_output: impl FnMut(&PipelineOutput) -> Result<bool>,
) -> Result<()> {
    let mut prev = PipelineOutput::default();
    let mut last_status = Instant::now();

    while worker.is_running() && !quit.load(Ordering::Relaxed) {
        std::thread::sleep(POLL_INTERVAL);

        let output = worker.output();

        if output.confirmed_motion != prev.confirmed_motion {
            info!(
                "Motion {}",
                if output.confirmed_motion {
                    "detected"
                } else {
                    "ended"
                }
            );
        }

        if output.is_recording && !prev.is_recording {
            if let Some(clip) = &output.current_clip {
                info!("Recording to {:?} at {:.1} fps", clip, output.fps);
            }
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            info!(
                "{} frames, {:.1} fps{}",
                output.frames,
                output.fps,
                if output.is_recording { ", recording" } else { "" }
            );
        }

        for e in worker.take_errors() {
            error!("{}", e);
        }

        if !on_output(&output)? {
            break;
        }

        prev = output;
    }

    Ok(())
}

fn apply_args(config: &mut Config, matches: &ArgMatches) -> Result<()> {
    if let Some(v) = matches.value_of("threshold") {
        config.set_threshold(v.parse()?)?;
    }
    if let Some(v) = matches.value_of("min-area") {
        config.set_min_contour_area(v.parse()?)?;
    }
    if let Some(v) = matches.value_of("persistence") {
        config.set_persistence(v.parse()?)?;
    }
    if let Some(v) = matches.value_of("pre-buffer-seconds") {
        config.set_pre_buffer_seconds(v.parse()?)?;
    }
    if let Some(v) = matches.value_of("clip-duration") {
        config.set_clip_duration_seconds(v.parse()?)?;
    }
    if let Some(v) = matches.value_of("fps") {
        config.set_fps(v.parse()?)?;
    }
    if let Some(v) = matches.value_of("output-dir") {
        config.set_output_dir(v)?;
    }
    if let Some(v) = matches.value_of("log-dir") {
        config.set_log_dir(v)?;
    }
    if matches.is_present("no-log") {
        config.set_log_enabled(false)?;
    }
    if matches.is_present("debug") {
        config.set_show_debug(true)?;
    }

    config.validate()?;

    Ok(())
}

fn open_source(input: &str) -> Result<Box<dyn FrameSource>> {
    if input.ends_with(".rawclip") {
        return Ok(Box::new(RawClipSource::open(input)?));
    }

    #[cfg(feature = "cv")]
    {
        Ok(Box::new(clipwatch_cv::CvFrameSource::try_new(input)?))
    }

    #[cfg(not(feature = "cv"))]
    {
        Err(anyhow!(
            "Only .rawclip inputs are supported without the `cv` feature"
        ))
    }
}

#[cfg(feature = "cv")]
fn backends() -> (Box<dyn SinkFactory>, Box<dyn SnapshotWriter>) {
    (
        Box::new(ThreadedSinkFactory::new(clipwatch_cv::CvSinkFactory, 64)),
        Box::new(clipwatch_cv::CvSnapshotWriter::default()),
    )
}

#[cfg(not(feature = "cv"))]
fn backends() -> (Box<dyn SinkFactory>, Box<dyn SnapshotWriter>) {
    (
        Box::new(ThreadedSinkFactory::new(RawClipFactory, 64)),
        Box::new(PpmSnapshotWriter),
    )
}

fn control_loop(config: &SharedConfig, quit: &AtomicBool) {
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read command: {}", e);
                break;
            }
        };

        let mut words = line.split_whitespace();

        match (words.next(), words.next()) {
            (Some("stop" | "q" | "quit"), None) => {
                quit.store(true, Ordering::Relaxed);
                break;
            }
            (Some("show"), None) => {
                for (name, prop) in config.props() {
                    println!("{name}: {prop}");
                }
            }
            (Some("set"), Some(name)) => {
                let value = words.collect::<Vec<_>>().join(" ");

                if let Err(e) = set_prop(config, name, &value) {
                    error!("{}", e);
                }
            }
            (None, _) => {}
            _ => warn!("Unknown command: {}", line.trim()),
        }
    }
}

fn set_prop(config: &SharedConfig, name: &str, value: &str) -> Result<()> {
    let (_, current) = config
        .props()
        .into_iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| anyhow!("Unknown setting {}", name))?;

    let prop = current
        .parse_like(value)
        .ok_or_else(|| anyhow!("Invalid value for {}: {}", name, value))?;

    config.set_prop(name, &prop)?;

    info!("{} = {}", name, prop);

    Ok(())
}

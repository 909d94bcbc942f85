//! OpenCV backend
//!
//! Provides camera and video capture with MOG2 background subtraction, MP4 clip encoding, JPEG
//! snapshots and a preview window.

use clipwatch::prelude::v1::{Result, *};
use log::*;
use opencv::core::{
    Point, Ptr, Rect, Scalar, Size, Vec3b, Vector, BORDER_CONSTANT, BORDER_DEFAULT, CV_8UC3,
};
use opencv::highgui;
use opencv::imgproc;
use opencv::prelude::*;
use opencv::video::{self, BackgroundSubtractorMOG2};
use opencv::videoio::*;
use std::path::Path;

const MOG2_HISTORY: i32 = 500;
const MOG2_VAR_THRESHOLD: f64 = 16.0;
const BLUR_SIZE: i32 = 11;
const MORPH_ITERATIONS: i32 = 2;

/// Camera or video file with background subtraction based motion detection.
pub struct CvFrameSource {
    capture: VideoCapture,
    subtractor: Ptr<dyn BackgroundSubtractorMOG2>,
    frame: Mat,
    fg_mask: Mat,
    thresh: Mat,
    blurred: Mat,
    dilated: Mat,
    eroded: Mat,
}

impl CvFrameSource {
    /// Open a capture device or video file.
    ///
    /// `input` is treated as a camera index if it parses as an integer, and as a file path or URL
    /// otherwise.
    pub fn try_new(input: &str) -> Result<Self> {
        let capture = match input.parse::<i32>() {
            Ok(index) => VideoCapture::new(index, CAP_ANY)?,
            Err(_) => VideoCapture::from_file(input, CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(anyhow!("Could not open video source {}", input));
        }

        let subtractor =
            video::create_background_subtractor_mog2(MOG2_HISTORY, MOG2_VAR_THRESHOLD, false)?;

        Ok(Self {
            capture,
            subtractor,
            frame: Default::default(),
            fg_mask: Default::default(),
            thresh: Default::default(),
            blurred: Default::default(),
            dilated: Default::default(),
            eroded: Default::default(),
        })
    }

    fn find_regions(&mut self, tuning: &DetectionTuning, out: &mut Vec<Detection>) -> Result<()> {
        self.subtractor.apply(&self.frame, &mut self.fg_mask, -1.0)?;

        imgproc::threshold(
            &self.fg_mask,
            &mut self.thresh,
            tuning.threshold as f64,
            255.0,
            imgproc::THRESH_BINARY,
        )?;

        imgproc::gaussian_blur(
            &self.thresh,
            &mut self.blurred,
            Size::new(BLUR_SIZE, BLUR_SIZE),
            0.0,
            0.0,
            BORDER_DEFAULT,
        )?;

        let border = imgproc::morphology_default_border_value()?;

        imgproc::dilate(
            &self.blurred,
            &mut self.dilated,
            &Mat::default(),
            Point::new(-1, -1),
            MORPH_ITERATIONS,
            BORDER_CONSTANT,
            border,
        )?;

        imgproc::erode(
            &self.dilated,
            &mut self.eroded,
            &Mat::default(),
            Point::new(-1, -1),
            MORPH_ITERATIONS,
            BORDER_CONSTANT,
            border,
        )?;

        let mut contours = Vector::<Vector<Point>>::new();

        imgproc::find_contours(
            &self.eroded,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::default(),
        )?;

        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;

            if area < tuning.min_contour_area as f64 {
                continue;
            }

            let Rect {
                x,
                y,
                width,
                height,
            } = imgproc::bounding_rect(&contour)?;

            out.push(Detection::from_bounds(
                area as usize,
                (x as usize, y as usize, width as usize, height as usize),
            ));
        }

        Ok(())
    }
}

impl FrameSource for CvFrameSource {
    fn next_frame(
        &mut self,
        frame: &mut Frame,
        detections: &mut Vec<Detection>,
        tuning: &DetectionTuning,
    ) -> Result<bool> {
        detections.clear();

        if !self.capture.read(&mut self.frame)? || self.frame.empty() {
            return Ok(false);
        }

        let (width, height) = (self.frame.cols() as usize, self.frame.rows() as usize);

        if frame.dim() != (width, height) {
            frame.reset(width, height);
        }

        for (y, row) in frame.pixels_mut().chunks_mut(width).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                let bgr: &Vec3b = self.frame.at_2d(y as i32, x as i32)?;
                *px = RGBA::from_bgr_slice(&bgr[..]);
            }
        }

        self.find_regions(tuning, detections)?;

        Ok(true)
    }

    fn framerate(&self) -> Option<f64> {
        self.capture.get(CAP_PROP_FPS).ok().filter(|f| *f > 0.0)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        let width = self.capture.get(CAP_PROP_FRAME_WIDTH).ok()?;
        let height = self.capture.get(CAP_PROP_FRAME_HEIGHT).ok()?;

        if width > 0.0 && height > 0.0 {
            Some((width as usize, height as usize))
        } else {
            None
        }
    }
}

fn frame_to_bgr(frame: &Frame, mat: &mut Mat) -> Result<()> {
    let (width, height) = frame.dim();

    if mat.cols() as usize != width || mat.rows() as usize != height {
        *mat = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            CV_8UC3,
            Scalar::all(0.0),
        )?;
    }

    for (y, row) in frame.pixels().chunks(width).enumerate() {
        for (x, px) in row.iter().enumerate() {
            let bgr: &mut Vec3b = mat.at_2d_mut(y as i32, x as i32)?;
            *bgr = Vec3b::from([px.b, px.g, px.r]);
        }
    }

    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| anyhow!("Path {:?} is not valid UTF-8", path))
}

/// MP4 clip written through an OpenCV [`VideoWriter`].
pub struct CvClipSink {
    writer: VideoWriter,
    dim: (usize, usize),
    buf: Mat,
    closed: bool,
}

impl CvClipSink {
    pub fn create(path: &Path, width: usize, height: usize, fps: f64) -> Result<Self> {
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;

        let writer = VideoWriter::new(
            path_str(path)?,
            fourcc,
            fps,
            Size::new(width as i32, height as i32),
            true,
        )?;

        if !writer.is_opened()? {
            return Err(anyhow!("Could not open video writer for {:?}", path));
        }

        Ok(Self {
            writer,
            dim: (width, height),
            buf: Default::default(),
            closed: false,
        })
    }
}

impl FrameSink for CvClipSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(anyhow!("Clip is closed"));
        }

        if frame.dim() != self.dim {
            return Err(anyhow!(
                "Frame is {:?}, clip expects {:?}",
                frame.dim(),
                self.dim
            ));
        }

        frame_to_bgr(frame, &mut self.buf)?;
        self.writer.write(&self.buf)?;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.writer.release()?;
        }
        Ok(())
    }
}

impl Drop for CvClipSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error while releasing video writer: {}", e);
        }
    }
}

/// Creates MP4 clips.
#[derive(Default)]
pub struct CvSinkFactory;

impl SinkFactory for CvSinkFactory {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn create(
        &mut self,
        path: &Path,
        width: usize,
        height: usize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>> {
        CvClipSink::create(path, width, height, fps).map(|s| Box::new(s) as _)
    }
}

/// Writes snapshots as JPEG images.
#[derive(Default)]
pub struct CvSnapshotWriter {
    buf: Mat,
}

impl SnapshotWriter for CvSnapshotWriter {
    fn extension(&self) -> &str {
        "jpg"
    }

    fn write_snapshot(&mut self, path: &Path, frame: &Frame) -> Result<()> {
        frame_to_bgr(frame, &mut self.buf)?;

        if !opencv::imgcodecs::imwrite(path_str(path)?, &self.buf, &Vector::new())? {
            return Err(anyhow!("Could not write snapshot {:?}", path));
        }

        Ok(())
    }
}

/// BGR colours of the status lines.
const STATUS_COLOURS: [(f64, f64, f64); 3] = [
    (0.0, 0.0, 255.0),
    (0.0, 255.0, 0.0),
    (255.0, 255.0, 255.0),
];
const STATUS_SCALES: [f64; 3] = [0.7, 0.7, 0.6];

/// Window showing the annotated frames with status text.
pub struct CvPreview {
    window: String,
    buf: Mat,
}

impl CvPreview {
    pub fn new(window: &str) -> Result<Self> {
        highgui::named_window(window, highgui::WINDOW_AUTOSIZE)?;

        Ok(Self {
            window: window.into(),
            buf: Default::default(),
        })
    }

    /// Show the latest output.
    ///
    /// Returns `false` once `q` or escape is pressed in the window.
    pub fn show(&mut self, output: &PipelineOutput) -> Result<bool> {
        if output.frame.pixels().is_empty() {
            return Ok(true);
        }

        frame_to_bgr(&output.frame, &mut self.buf)?;

        let lines = output.status_lines(&chrono::Local::now().naive_local());

        // Text starts below the recording marker.
        for (i, line) in lines.iter().enumerate() {
            let (b, g, r) = STATUS_COLOURS[i];
            imgproc::put_text(
                &mut self.buf,
                line,
                Point::new(10, 50 + 30 * i as i32),
                imgproc::FONT_HERSHEY_SIMPLEX,
                STATUS_SCALES[i],
                Scalar::new(b, g, r, 0.0),
                2,
                imgproc::LINE_8,
                false,
            )?;
        }

        if output.is_recording {
            imgproc::put_text(
                &mut self.buf,
                "REC",
                Point::new(28, 22),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.6,
                Scalar::new(0.0, 0.0, 255.0, 0.0),
                2,
                imgproc::LINE_8,
                false,
            )?;
        }

        highgui::imshow(&self.window, &self.buf)?;

        let key = highgui::wait_key(1)?;

        Ok(key != 'q' as i32 && key != 27)
    }
}

impl Drop for CvPreview {
    fn drop(&mut self) {
        if let Err(e) = highgui::destroy_window(&self.window) {
            warn!("Error while closing preview: {}", e);
        }
    }
}

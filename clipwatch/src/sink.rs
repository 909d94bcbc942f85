//! # Clip output sinks
//!
//! A sink receives frames of a single clip in arrival order. Sinks are created by a
//! [`SinkFactory`] whenever the recorder opens a new clip.

use crate::frame::Frame;
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{spawn, JoinHandle};

/// Destination of clip frames.
pub trait FrameSink: Send {
    /// Append a frame to the clip.
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and release the clip.
    ///
    /// Closing an already closed sink must succeed without doing anything.
    fn close(&mut self) -> Result<()>;
}

/// Creates a new sink for every recording session.
pub trait SinkFactory: Send {
    /// File extension of the produced clips, without the leading dot.
    fn extension(&self) -> &str;

    /// Open a new clip.
    ///
    /// # Arguments
    ///
    /// * `path` - target file path.
    /// * `width` - width of every frame in the clip.
    /// * `height` - height of every frame in the clip.
    /// * `fps` - nominal frame rate of the clip.
    fn create(
        &mut self,
        path: &Path,
        width: usize,
        height: usize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>>;
}

/// Build the file name of a clip started at `timestamp`.
///
/// Names have one second resolution. Two clips started within the same second share the name.
pub fn clip_file_name<Tz: TimeZone>(timestamp: &DateTime<Tz>, extension: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("motion_{}.{extension}", timestamp.format("%Y%m%d_%H%M%S"))
}

const RAW_CLIP_MAGIC: &[u8; 4] = b"CWRC";
const RAW_CLIP_VERSION: u32 = 1;
/// Largest frame accepted by [`RawClipReader`], in bytes.
pub const RAW_CLIP_MAX_FRAME_BYTES: usize = 1 << 28;

/// Uncompressed clip file.
///
/// The format is a small header followed by raw RGBA frames:
///
/// `magic[4] | version: u32 | width: u32 | height: u32 | fps: f64 | frame 0 | frame 1 | ...`
///
/// All numbers are little endian, and each frame is `width * height * 4` bytes.
pub struct RawClipSink {
    out: Option<BufWriter<File>>,
    dim: (usize, usize),
    path: PathBuf,
}

impl RawClipSink {
    pub fn create(path: &Path, width: usize, height: usize, fps: f64) -> Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        out.write_all(RAW_CLIP_MAGIC)?;
        out.write_all(&RAW_CLIP_VERSION.to_le_bytes())?;
        out.write_all(&(width as u32).to_le_bytes())?;
        out.write_all(&(height as u32).to_le_bytes())?;
        out.write_all(&fps.to_le_bytes())?;

        Ok(Self {
            out: Some(out),
            dim: (width, height),
            path: path.into(),
        })
    }
}

impl FrameSink for RawClipSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.dim() != self.dim {
            return Err(anyhow!(
                "frame is {:?}, clip {:?} is {:?}",
                frame.dim(),
                self.path,
                self.dim
            ));
        }

        let out = self
            .out
            .as_mut()
            .ok_or_else(|| anyhow!("clip {:?} is closed", self.path))?;

        out.write_all(frame.as_bytes())?;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl Drop for RawClipSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Creates [`RawClipSink`] instances.
#[derive(Default)]
pub struct RawClipFactory;

impl SinkFactory for RawClipFactory {
    fn extension(&self) -> &str {
        "rawclip"
    }

    fn create(
        &mut self,
        path: &Path,
        width: usize,
        height: usize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>> {
        RawClipSink::create(path, width, height, fps).map(|s| Box::new(s) as _)
    }
}

/// Reads frames back from a raw clip.
pub struct RawClipReader<T> {
    reader: T,
    width: usize,
    height: usize,
    fps: f64,
}

impl RawClipReader<std::io::BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(std::io::BufReader::new(file))
    }
}

impl<T: Read> RawClipReader<T> {
    /// Parse the clip header.
    pub fn new(mut reader: T) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if &magic != RAW_CLIP_MAGIC {
            return Err(anyhow!("Not a raw clip"));
        }

        let mut word = [0u8; std::mem::size_of::<u32>()];
        reader.read_exact(&mut word)?;
        let version = u32::from_le_bytes(word);

        if version != RAW_CLIP_VERSION {
            return Err(anyhow!("Unsupported raw clip version {version}"));
        }

        reader.read_exact(&mut word)?;
        let width = u32::from_le_bytes(word) as usize;
        reader.read_exact(&mut word)?;
        let height = u32::from_le_bytes(word) as usize;

        let frame_bytes = width
            .checked_mul(height)
            .and_then(|px| px.checked_mul(std::mem::size_of::<crate::frame::RGBA>()));

        match frame_bytes {
            Some(n) if n > 0 && n <= RAW_CLIP_MAX_FRAME_BYTES => {}
            _ => return Err(anyhow!("Invalid raw clip dimensions {width}x{height}")),
        }

        let mut fps = [0u8; std::mem::size_of::<f64>()];
        reader.read_exact(&mut fps)?;
        let fps = f64::from_le_bytes(fps);

        Ok(Self {
            reader,
            width,
            height,
            fps,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Read the next frame into `frame`.
    ///
    /// Returns `Ok(false)` once the end of the clip is reached.
    pub fn read_frame(&mut self, frame: &mut Frame) -> Result<bool> {
        if frame.dim() != self.dim() {
            frame.reset(self.width, self.height);
        }

        let buf = frame.as_bytes_mut();
        let mut filled = 0;

        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..])? {
                0 if filled == 0 => return Ok(false),
                0 => return Err(anyhow!("Truncated frame")),
                n => filled += n,
            }
        }

        Ok(true)
    }

    /// Read all remaining frames.
    pub fn frames(mut self) -> Result<Vec<Frame>> {
        let mut frames = vec![];
        let mut frame = Frame::new(self.width, self.height);

        while self.read_frame(&mut frame)? {
            frames.push(frame.clone());
        }

        Ok(frames)
    }
}

/// Sink that hands frames off to a dedicated writer thread.
///
/// The queue between the caller and the writer is bounded. When it is full, `write` blocks until
/// the writer catches up, so memory stays bounded during slow disk I/O. Frames are written in the
/// order they were queued. A failure on the writer thread is reported by the next `write` or
/// `close` call.
pub struct ThreadedSink {
    tx: Option<SyncSender<Frame>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ThreadedSink {
    /// Spawn a writer thread for `inner`.
    ///
    /// # Arguments
    ///
    /// * `inner` - sink doing the actual I/O.
    /// * `capacity` - maximum number of queued frames.
    pub fn spawn(mut inner: Box<dyn FrameSink>, capacity: usize) -> Self {
        let (tx, rx): (_, Receiver<Frame>) = mpsc::sync_channel(capacity);

        let handle = spawn(move || {
            for frame in rx {
                if let Err(e) = inner.write(&frame) {
                    if let Err(close_err) = inner.close() {
                        log::warn!("Error while closing failed sink: {}", close_err);
                    }
                    return Err(e);
                }
            }
            inner.close()
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn join(&mut self) -> Result<()> {
        self.tx = None;

        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("Sink writer thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl FrameSink for ThreadedSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("Threaded sink is closed"))?;

        if tx.send(frame.clone()).is_err() {
            // The writer only hangs up after a failure.
            self.join()?;
            return Err(anyhow!("Sink writer stopped"));
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.join()
    }
}

impl Drop for ThreadedSink {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            log::warn!("Error while dropping threaded sink: {}", e);
        }
    }
}

/// Wraps every sink of another factory in a [`ThreadedSink`].
pub struct ThreadedSinkFactory<F> {
    inner: F,
    capacity: usize,
}

impl<F: SinkFactory> ThreadedSinkFactory<F> {
    pub fn new(inner: F, capacity: usize) -> Self {
        Self { inner, capacity }
    }
}

impl<F: SinkFactory> SinkFactory for ThreadedSinkFactory<F> {
    fn extension(&self) -> &str {
        self.inner.extension()
    }

    fn create(
        &mut self,
        path: &Path,
        width: usize,
        height: usize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>> {
        let inner = self.inner.create(path, width, height, fps)?;
        Ok(Box::new(ThreadedSink::spawn(inner, self.capacity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RGBA;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    fn numbered(n: u8) -> Frame {
        Frame::filled(3, 2, RGBA::opaque(n, n, n))
    }

    #[test]
    fn clip_name_format() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap()
            .and_utc();
        assert_eq!(
            clip_file_name(&ts, "rawclip"),
            "motion_20240309_070501.rawclip"
        );
    }

    #[test]
    fn raw_clip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.rawclip");

        let mut sink = RawClipFactory.create(&path, 3, 2, 12.5).unwrap();
        for i in 0..5 {
            sink.write(&numbered(i)).unwrap();
        }
        sink.close().unwrap();
        sink.close().unwrap();

        let reader = RawClipReader::open(&path).unwrap();
        assert_eq!(reader.dim(), (3, 2));
        assert_eq!(reader.fps(), 12.5);

        let frames = reader.frames().unwrap();
        assert_eq!(frames, (0..5).map(numbered).collect::<Vec<_>>());
    }

    #[test]
    fn raw_clip_rejects_other_dims() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawClipSink::create(&dir.path().join("a.rawclip"), 3, 2, 30.0).unwrap();
        assert!(sink.write(&Frame::new(2, 3)).is_err());
    }

    #[test]
    fn raw_clip_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawClipSink::create(&dir.path().join("a.rawclip"), 3, 2, 30.0).unwrap();
        sink.close().unwrap();
        assert!(sink.write(&numbered(0)).is_err());
    }

    #[test]
    fn reader_rejects_garbage() {
        assert!(RawClipReader::new(&b"nope and more bytes here"[..]).is_err());
    }

    fn header(width: u32, height: u32) -> Vec<u8> {
        let mut out = RAW_CLIP_MAGIC.to_vec();
        out.extend_from_slice(&RAW_CLIP_VERSION.to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&30f64.to_le_bytes());
        out
    }

    #[test]
    fn reader_rejects_bad_dimensions() {
        for (w, h) in [(0, 10), (10, 0), (u32::MAX, u32::MAX), (1 << 16, 1 << 16)] {
            assert!(
                RawClipReader::new(&header(w, h)[..]).is_err(),
                "{w}x{h} accepted"
            );
        }

        let bytes = header(3, 2);
        let reader = RawClipReader::new(&bytes[..]).unwrap();
        assert_eq!(reader.dim(), (3, 2));
    }

    #[derive(Clone, Default)]
    struct Collect {
        frames: Arc<Mutex<Vec<u8>>>,
        fail_after: Option<usize>,
    }

    impl FrameSink for Collect {
        fn write(&mut self, frame: &Frame) -> Result<()> {
            let mut frames = self.frames.lock().unwrap();
            if Some(frames.len()) == self.fail_after {
                return Err(anyhow!("disk full"));
            }
            frames.push(frame.pixels()[0].r);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn threaded_sink_keeps_order() {
        let collect = Collect::default();
        let mut sink = ThreadedSink::spawn(Box::new(collect.clone()), 2);

        for i in 0..50 {
            sink.write(&numbered(i)).unwrap();
        }
        sink.close().unwrap();
        sink.close().unwrap();

        assert_eq!(*collect.frames.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn threaded_sink_reports_failure() {
        let collect = Collect {
            fail_after: Some(3),
            ..Default::default()
        };
        let mut sink = ThreadedSink::spawn(Box::new(collect.clone()), 1);

        let mut failed = false;
        for i in 0..20 {
            if sink.write(&numbered(i)).is_err() {
                failed = true;
                break;
            }
        }

        // Either a write noticed the failure, or the close must.
        assert!(failed || sink.close().is_err());
        assert_eq!(*collect.frames.lock().unwrap(), vec![0, 1, 2]);
    }
}

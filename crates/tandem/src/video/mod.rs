//! Frame acquisition.
//!
//! A [`FrameSource`] hands the pipeline the most recent frame without waiting for a new one. The
//! provided implementation, [`ThreadedSource`], runs a blocking [`Capture`] device on a background
//! thread and keeps only the latest frame around, so a slow consumer sees fresh frames instead of
//! a growing backlog.

pub mod httpcam;
pub mod sequence;
pub mod synthetic;
pub mod webcam;

use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use image::RgbImage;

use crate::drop::defer;

/// How long [`ThreadedSource::start`] waits for the first frame.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Width and height of a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn num_pixels(&self) -> u32 {
        self.width * self.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A captured video frame.
///
/// Cloning a frame is cheap; the pixel data is shared.
#[derive(Clone)]
pub struct Frame {
    seq: u64,
    image: Arc<RgbImage>,
    captured_at: Instant,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self {
            seq,
            image: Arc::new(image),
            captured_at: Instant::now(),
        }
    }

    /// Returns the frame's sequence number.
    ///
    /// Sequence numbers start at 0 and increase by one for every frame the source captured, so
    /// gaps between frames seen by a reader are frames that were never read.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Returns the pixel data, copying it only if other clones of this frame exist.
    pub fn into_image(self) -> RgbImage {
        Arc::try_unwrap(self.image).unwrap_or_else(|shared| (*shared).clone())
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// A source of video frames for the pipeline.
pub trait FrameSource {
    /// Starts capturing. Returns once the first frame is available.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Returns the most recently captured frame.
    ///
    /// Never waits for a new frame: when called faster than frames arrive, the same frame is
    /// returned again. Returns [`None`] only if no frame was captured yet.
    fn read(&mut self) -> Option<Frame>;

    /// Returns `false` once the source is exhausted, has failed, or was stopped.
    fn is_running(&self) -> bool;

    /// Stops capturing and releases the device. Calling this more than once has no effect.
    fn stop(&mut self);

    /// Takes the error that made the source stop running, if any.
    fn take_error(&mut self) -> Option<anyhow::Error> {
        None
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn start(&mut self) -> anyhow::Result<()> {
        (**self).start()
    }

    fn read(&mut self) -> Option<Frame> {
        (**self).read()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        (**self).take_error()
    }
}

/// A blocking capture device.
///
/// Devices are driven from a single capture thread and do not need to be [`Send`] once opened;
/// see [`ThreadedSource::new`].
pub trait Capture {
    /// Blocks until the next frame is captured.
    ///
    /// Returns `Ok(None)` when the device has no more frames to offer.
    fn capture(&mut self) -> anyhow::Result<Option<RgbImage>>;
}

impl<C: Capture + ?Sized> Capture for Box<C> {
    fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
        (**self).capture()
    }
}

type Opener = Box<dyn FnOnce() -> anyhow::Result<Box<dyn Capture>> + Send>;

struct Latest {
    frame: Option<Frame>,
    error: Option<anyhow::Error>,
}

struct SourceShared {
    latest: Mutex<Latest>,
    arrived: Condvar,
    running: AtomicBool,
}

impl SourceShared {
    fn lock(&self) -> MutexGuard<'_, Latest> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a [`Capture`] device on a background thread, keeping the latest frame.
///
/// The device is opened on the capture thread, so it does not have to be movable between threads
/// once opened.
pub struct ThreadedSource {
    name: String,
    opener: Option<Opener>,
    shared: Arc<SourceShared>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedSource {
    /// Creates a source that will call `open` on its capture thread once started.
    pub fn new<N, F, C>(name: N, open: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> anyhow::Result<C> + Send + 'static,
        C: Capture + 'static,
    {
        Self {
            name: name.into(),
            opener: Some(Box::new(move || -> anyhow::Result<Box<dyn Capture>> {
                Ok(Box::new(open()?))
            })),
            shared: Arc::new(SourceShared {
                latest: Mutex::new(Latest {
                    frame: None,
                    error: None,
                }),
                arrived: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Creates a source for an already opened device.
    pub fn from_capture<N, C>(name: N, capture: C) -> Self
    where
        N: Into<String>,
        C: Capture + Send + 'static,
    {
        Self::new(name, move || Ok(capture))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FrameSource for ThreadedSource {
    fn start(&mut self) -> anyhow::Result<()> {
        let Some(opener) = self.opener.take() else {
            bail!("video source `{}` was already started", self.name);
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let name = self.name.clone();
        self.handle = Some(
            thread::Builder::new()
                .name(format!("capture {name}"))
                .spawn(move || capture_loop(&name, opener, &shared))?,
        );

        let deadline = Instant::now() + FIRST_FRAME_TIMEOUT;
        let mut latest = self.shared.lock();
        loop {
            if latest.frame.is_some() {
                log::debug!("video source `{}` started", self.name);
                return Ok(());
            }
            if let Some(e) = latest.error.take() {
                return Err(e.context(format!("video source `{}` failed", self.name)));
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                bail!("video source `{}` ended before producing a frame", self.name);
            }
            let now = Instant::now();
            if now >= deadline {
                bail!(
                    "video source `{}` produced no frame within {:?}",
                    self.name,
                    FIRST_FRAME_TIMEOUT
                );
            }
            latest = self
                .shared
                .arrived
                .wait_timeout(latest, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn read(&mut self) -> Option<Frame> {
        self.shared.lock().frame.clone()
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("capture thread of video source `{}` panicked", self.name);
            }
            log::debug!("video source `{}` stopped", self.name);
        }
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.shared.lock().error.take()
    }
}

impl Drop for ThreadedSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(name: &str, opener: Opener, shared: &SourceShared) {
    log::trace!("capture thread for `{name}` starting");
    let _guard = defer(|| {
        shared.running.store(false, Ordering::SeqCst);
        shared.arrived.notify_all();
        log::trace!("capture thread for `{name}` exiting");
    });

    let mut device = match opener() {
        Ok(device) => device,
        Err(e) => {
            shared.lock().error = Some(e);
            return;
        }
    };

    let mut seq = 0;
    while shared.running.load(Ordering::SeqCst) {
        match device.capture() {
            Ok(Some(image)) => {
                shared.lock().frame = Some(Frame::new(seq, image));
                shared.arrived.notify_all();
                seq += 1;
            }
            Ok(None) => {
                log::info!("video source `{name}` exhausted after {seq} frames");
                break;
            }
            Err(e) => {
                log::error!("video source `{name}` failed: {e:#}");
                shared.lock().error = Some(e);
                break;
            }
        }
    }
}

/// Where to take frames from, parsed from the `video_input` configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoInput {
    /// A V4L2 webcam, optionally selected by its device name (`webcam` or `webcam:<name>`).
    Webcam { name: Option<String> },
    /// An HTTP server streaming multipart MJPEG (`http://host:port/path`).
    Http { addr: String, path: String },
    /// A generated test pattern (`synthetic`).
    Synthetic,
    /// An image file, or a directory of images played back in name order.
    Path(PathBuf),
}

impl FromStr for VideoInput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty video input");
        }
        if s == "webcam" {
            return Ok(Self::Webcam { name: None });
        }
        if let Some(name) = s.strip_prefix("webcam:") {
            return Ok(Self::Webcam {
                name: Some(name.to_string()),
            });
        }
        if s == "synthetic" {
            return Ok(Self::Synthetic);
        }
        if let Some(rest) = s.strip_prefix("http://") {
            let (addr, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/video"),
            };
            if addr.is_empty() {
                bail!("missing host in video input `{s}`");
            }
            return Ok(Self::Http {
                addr: addr.to_string(),
                path: path.to_string(),
            });
        }
        Ok(Self::Path(PathBuf::from(s)))
    }
}

/// Creates a (not yet started) frame source for `input`.
///
/// `resolution` is the requested capture size. Webcams negotiate the closest supported format,
/// the synthetic source uses it as-is, file sources ignore it.
pub fn open_source(input: &VideoInput, resolution: Resolution) -> anyhow::Result<ThreadedSource> {
    let source = match input {
        VideoInput::Webcam { name } => {
            let mut options = webcam::WebcamOptions::default().resolution(resolution);
            if let Some(name) = name {
                options = options.name(name.clone());
            }
            ThreadedSource::new("webcam", move || webcam::Webcam::open(options))
        }
        VideoInput::Http { addr, path } => {
            let addr = resolve(addr)?;
            let path = path.clone();
            ThreadedSource::new(format!("http {addr}"), move || {
                httpcam::HttpStream::connect(addr, &path)
            })
        }
        VideoInput::Synthetic => ThreadedSource::from_capture(
            "synthetic",
            synthetic::Synthetic::new(resolution, synthetic::DEFAULT_FPS),
        ),
        VideoInput::Path(path) => {
            let sequence = sequence::ImageSequence::open(path)?;
            ThreadedSource::from_capture(path.display().to_string(), sequence)
        }
    };
    Ok(source)
}

fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("`{addr}` did not resolve to any address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counted {
        remaining: u32,
    }

    impl Capture for Counted {
        fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            thread::sleep(Duration::from_millis(1));
            Ok(Some(RgbImage::new(4, 4)))
        }
    }

    struct Failing;

    impl Capture for Failing {
        fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
            bail!("device unplugged")
        }
    }

    #[test]
    fn parse_inputs() {
        assert_eq!(
            "webcam".parse::<VideoInput>().unwrap(),
            VideoInput::Webcam { name: None }
        );
        assert_eq!(
            "webcam:HD Pro Webcam C920".parse::<VideoInput>().unwrap(),
            VideoInput::Webcam {
                name: Some("HD Pro Webcam C920".into())
            }
        );
        assert_eq!(
            "http://192.168.0.2:4747".parse::<VideoInput>().unwrap(),
            VideoInput::Http {
                addr: "192.168.0.2:4747".into(),
                path: "/video".into(),
            }
        );
        assert_eq!(
            "http://cam.local:8080/mjpg/stream".parse::<VideoInput>().unwrap(),
            VideoInput::Http {
                addr: "cam.local:8080".into(),
                path: "/mjpg/stream".into(),
            }
        );
        assert_eq!(
            "synthetic".parse::<VideoInput>().unwrap(),
            VideoInput::Synthetic
        );
        assert_eq!(
            "frames/".parse::<VideoInput>().unwrap(),
            VideoInput::Path("frames/".into())
        );
        assert!("".parse::<VideoInput>().is_err());
        assert!("http:///video".parse::<VideoInput>().is_err());
    }

    #[test]
    fn threaded_source_runs_to_exhaustion() {
        let mut source = ThreadedSource::from_capture("counted", Counted { remaining: 5 });
        assert!(!source.is_running());
        assert!(source.read().is_none());

        source.start().unwrap();
        let first = source.read().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.is_running() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        let last = source.read().unwrap();
        assert!(last.seq() >= first.seq());
        assert_eq!(last.seq(), 4);

        // Reading again repeats the latest frame.
        assert_eq!(source.read().unwrap().seq(), 4);
        assert!(source.take_error().is_none());
        source.stop();
        source.stop();
    }

    #[test]
    fn start_reports_device_errors() {
        let mut source = ThreadedSource::from_capture("failing", Failing);
        let err = source.start().unwrap_err();
        assert!(format!("{err:#}").contains("device unplugged"));
        assert!(!source.is_running());
    }

    struct FailsLater(u32);

    impl Capture for FailsLater {
        fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
            if self.0 == 0 {
                bail!("cable pulled");
            }
            self.0 -= 1;
            thread::sleep(Duration::from_millis(1));
            Ok(Some(RgbImage::new(4, 4)))
        }
    }

    #[test]
    fn keeps_error_that_ended_capture() {
        let mut source = ThreadedSource::from_capture("flaky", FailsLater(1));
        source.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.is_running() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        let err = source.take_error().unwrap();
        assert!(format!("{err:#}").contains("cable pulled"));
        assert!(source.take_error().is_none());
    }

    #[test]
    fn start_reports_open_errors() {
        let mut source = ThreadedSource::new("missing", || -> anyhow::Result<Counted> {
            bail!("no such device")
        });
        let err = source.start().unwrap_err();
        assert!(format!("{err:#}").contains("no such device"));
        assert!(source.start().is_err());
    }

    #[test]
    fn frame_into_image_shares_until_unique() {
        let frame = Frame::new(0, RgbImage::new(2, 2));
        let clone = frame.clone();
        assert_eq!(frame.into_image().dimensions(), (2, 2));
        assert_eq!(clone.into_image().dimensions(), (2, 2));
    }
}

//! V4L2 webcam access.
//!
//! Only `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are supported.

use std::env;

use anyhow::bail;
use image::{ImageFormat, RgbImage};
use linuxvideo::{
    format::{FrameSizes, PixFormat, Pixelformat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device,
};

use super::{Capture, Resolution};

/// Selects the device by name when no name was configured.
const ENV_VAR_WEBCAM_NAME: &str = "TANDEM_WEBCAM_NAME";

/// Device selection and format negotiation options.
#[derive(Debug, Default, Clone)]
pub struct WebcamOptions {
    name: Option<String>,
    resolution: Option<Resolution>,
}

impl WebcamOptions {
    /// Sets the name of the webcam device to open.
    ///
    /// If no webcam with the given name can be found, opening the webcam will result in an error.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the desired image resolution.
    ///
    /// The smallest format covering it is selected. If the webcam has none, its largest format is
    /// used instead.
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }
}

fn negotiate_format(device: &Device, wanted: Option<Resolution>) -> anyhow::Result<PixFormat> {
    let mut pixel_format = None;
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?;
        if format.pixelformat() == Pixelformat::JPEG || format.pixelformat() == Pixelformat::MJPG {
            pixel_format = Some(format.pixelformat());
            break;
        }
    }
    let Some(pixel_format) = pixel_format else {
        bail!("no supported pixel format found");
    };

    let sizes = match device.frame_sizes(pixel_format)? {
        FrameSizes::Discrete(sizes) => sizes
            .iter()
            .map(|size| Resolution::new(size.width(), size.height()))
            .collect::<Vec<_>>(),
        FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
            bail!("stepwise or continuous resolutions are not supported");
        }
    };

    let Some(resolution) = pick_resolution(&sizes, wanted) else {
        bail!("webcam offers no frame sizes");
    };
    log::debug!("negotiated {resolution} (wanted {wanted:?}) from {sizes:?}");

    Ok(PixFormat::new(
        resolution.width(),
        resolution.height(),
        pixel_format,
    ))
}

fn pick_resolution(sizes: &[Resolution], wanted: Option<Resolution>) -> Option<Resolution> {
    let covering = sizes
        .iter()
        .filter(|res| {
            wanted.map_or(false, |wanted| {
                res.width() >= wanted.width() && res.height() >= wanted.height()
            })
        })
        .min_by_key(|res| res.num_pixels());
    covering
        .or_else(|| sizes.iter().max_by_key(|res| res.num_pixels()))
        .copied()
}

/// A webcam yielding a stream of RGB frames.
pub struct Webcam {
    stream: ReadStream,
    resolution: Resolution,
}

impl Webcam {
    /// Opens the first supported webcam found.
    ///
    /// This can block for a significant amount of time while the webcam initializes (on the order
    /// of hundreds of milliseconds).
    pub fn open(options: WebcamOptions) -> anyhow::Result<Self> {
        let name = options.name.clone().or_else(|| {
            let name = env::var(ENV_VAR_WEBCAM_NAME).ok()?;
            log::debug!("webcam override: `{ENV_VAR_WEBCAM_NAME}` is set to '{name}'");
            Some(name)
        });

        for res in linuxvideo::list()? {
            match res {
                Ok(dev) => match Self::open_device(dev, name.as_deref(), options.resolution) {
                    Ok(Some(webcam)) => return Ok(webcam),
                    Ok(None) => {}
                    Err(e) => log::debug!("{e}"),
                },
                Err(e) => log::warn!("{e}"),
            }
        }

        match name {
            Some(name) => bail!("no supported webcam named '{name}' found"),
            None => bail!("no supported webcam device found"),
        }
    }

    fn open_device(
        dev: Device,
        name: Option<&str>,
        wanted: Option<Resolution>,
    ) -> anyhow::Result<Option<Self>> {
        let caps = dev.capabilities()?;
        if let Some(name) = name {
            if caps.card() != name {
                return Ok(None);
            }
        }

        let cap_flags = caps.device_capabilities();
        let path = dev.path()?;
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );
        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            return Ok(None);
        }

        let pixfmt = negotiate_format(&dev, wanted)?;
        let capture = dev.video_capture(pixfmt)?;
        let format = capture.format();
        let resolution = Resolution::new(format.width(), format.height());
        log::info!("opened {} ({}), {}", caps.card(), path.display(), resolution);

        Ok(Some(Self {
            stream: capture.into_stream(2)?,
            resolution,
        }))
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Reads the next frame from the camera, blocking until one is available.
    pub fn read(&mut self) -> anyhow::Result<RgbImage> {
        let resolution = self.resolution;
        let image = self.stream.dequeue(|buf| {
            let image = match image::load_from_memory_with_format(&*buf, ImageFormat::Jpeg) {
                Ok(image) => image.into_rgb8(),
                Err(e) => {
                    // Even good webcams produce the occasional corrupted MJPG frame. Skipping it
                    // would double the latency for that frame, so hand back a blank one.
                    log::error!("webcam decode error: {e}");
                    RgbImage::new(resolution.width(), resolution.height())
                }
            };
            Ok(image)
        })?;
        Ok(image)
    }
}

impl Capture for Webcam {
    fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
        self.read().map(Some)
    }
}

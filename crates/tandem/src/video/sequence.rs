//! Playback of still images as a video stream.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use image::RgbImage;

use super::Capture;

const DEFAULT_FPS: u32 = 30;

/// An image file, or the images of a directory in file name order, delivered at a fixed rate.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
    interval: Duration,
    last: Option<Instant>,
    /// Decoded image, kept when there is only one.
    still: Option<RgbImage>,
}

impl ImageSequence {
    /// Opens a single image or a directory of `.jpg`/`.jpeg`/`.png` files.
    ///
    /// The sequence loops by default.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let paths = if path.is_dir() {
            let mut paths = Vec::new();
            for entry in fs::read_dir(path)
                .with_context(|| format!("failed to read directory `{}`", path.display()))?
            {
                let entry = entry?.path();
                if is_image(&entry) {
                    paths.push(entry);
                }
            }
            paths.sort();
            paths
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            bail!("video input `{}` does not exist", path.display());
        };

        if paths.is_empty() {
            bail!("no images found in `{}`", path.display());
        }
        log::debug!("playing {} image(s) from `{}`", paths.len(), path.display());

        Ok(Self {
            paths,
            next: 0,
            looping: true,
            interval: Duration::from_secs(1) / DEFAULT_FPS,
            last: None,
            still: None,
        })
    }

    /// Sets whether to start over after the last image instead of ending the stream.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Sets the playback rate. A rate of 0 delivers images as fast as they decode.
    pub fn fps(mut self, fps: u32) -> Self {
        self.interval = match fps {
            0 => Duration::ZERO,
            fps => Duration::from_secs(1) / fps,
        };
        self
    }

    pub fn num_images(&self) -> usize {
        self.paths.len()
    }

    fn load(&mut self, index: usize) -> anyhow::Result<RgbImage> {
        if self.paths.len() == 1 {
            if let Some(image) = &self.still {
                return Ok(image.clone());
            }
        }
        let path = &self.paths[index];
        let image = image::open(path)
            .with_context(|| format!("failed to load `{}`", path.display()))?
            .into_rgb8();
        if self.paths.len() == 1 {
            self.still = Some(image.clone());
        }
        Ok(image)
    }
}

impl Capture for ImageSequence {
    fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
        if self.next == self.paths.len() {
            if !self.looping {
                return Ok(None);
            }
            self.next = 0;
        }

        if let Some(last) = self.last {
            let due = last + self.interval;
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.last = Some(Instant::now());

        let image = self.load(self.next)?;
        self.next += 1;
        Ok(Some(image))
    }
}

fn is_image(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => ["jpg", "jpeg", "png"]
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known)),
        None => false,
    }
}

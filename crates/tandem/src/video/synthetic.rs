//! Generated test video.

use std::{
    thread,
    time::{Duration, Instant},
};

use image::{Rgb, RgbImage};

use super::{Capture, Resolution};

pub const DEFAULT_FPS: u32 = 30;

const BACKGROUND: Rgb<u8> = Rgb([32, 32, 48]);
const SQUARE: Rgb<u8> = Rgb([230, 200, 40]);

/// A square bouncing across a plain background, delivered at a fixed frame rate.
///
/// Needs no hardware, which makes it useful for running the pipeline on machines without a
/// camera and for measuring scheduling overhead.
pub struct Synthetic {
    resolution: Resolution,
    interval: Duration,
    next_due: Option<Instant>,
    frame: u64,
    limit: Option<u64>,
}

impl Synthetic {
    pub fn new(resolution: Resolution, fps: u32) -> Self {
        Self {
            resolution,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: None,
            frame: 0,
            limit: None,
        }
    }

    /// Ends the stream after `frames` frames.
    pub fn limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.resolution.width(), self.resolution.height());
        let side = (w.min(h) / 4).max(1);
        let x = bounce(self.frame * 7, w.saturating_sub(side));
        let y = bounce(self.frame * 5, h.saturating_sub(side));

        RgbImage::from_fn(w, h, |px, py| {
            if (x..x + side).contains(&px) && (y..y + side).contains(&py) {
                SQUARE
            } else {
                BACKGROUND
            }
        })
    }
}

/// Position along `0..=range` after moving `dist` pixels back and forth.
fn bounce(dist: u64, range: u32) -> u32 {
    if range == 0 {
        return 0;
    }
    let range = u64::from(range);
    let pos = dist % (2 * range);
    let pos = if pos > range { 2 * range - pos } else { pos };
    pos as u32
}

impl Capture for Synthetic {
    fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
        if self.limit.map_or(false, |limit| self.frame >= limit) {
            return Ok(None);
        }

        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due + self.interval);

        let image = self.render();
        self.frame += 1;
        Ok(Some(image))
    }
}

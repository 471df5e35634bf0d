//! Annotation drawing on RGB frames.
//!
//! Every function returns a guard that draws when it is dropped, so optional settings can be
//! chained onto the call:
//!
//! ```
//! # use image::RgbImage;
//! # use tandem::draw;
//! # let mut image = RgbImage::new(64, 64);
//! draw::rect(&mut image, 4, 4, 20, 10).color(draw::GREEN).stroke_width(2);
//! ```

use std::convert::Infallible;

use embedded_graphics::{
    draw_target::DrawTarget,
    mono_font::{ascii, MonoTextStyleBuilder},
    pixelcolor::Rgb888,
    prelude::*,
    primitives::{PrimitiveStyleBuilder, Rectangle, StrokeAlignment},
    text::{Alignment, Baseline, Text, TextStyleBuilder},
};
use image::{Rgb, RgbImage};

pub const RED: Rgb888 = Rgb888::new(255, 0, 0);
pub const GREEN: Rgb888 = Rgb888::new(77, 255, 9);
pub const BLACK: Rgb888 = Rgb888::new(0, 0, 0);

const PALETTE: [Rgb888; 8] = [
    Rgb888::new(230, 25, 75),
    Rgb888::new(60, 180, 75),
    Rgb888::new(255, 225, 25),
    Rgb888::new(0, 130, 200),
    Rgb888::new(245, 130, 48),
    Rgb888::new(145, 30, 180),
    Rgb888::new(70, 240, 240),
    Rgb888::new(240, 50, 230),
];

/// A stable color for a detection class.
pub fn class_color(class: u32) -> Rgb888 {
    PALETTE[class as usize % PALETTE.len()]
}

/// Guard returned by [`rect`]; draws the rectangle outline when dropped.
pub struct DrawRect<'a> {
    image: &'a mut RgbImage,
    rect: Rectangle,
    color: Rgb888,
    stroke_width: u32,
}

impl DrawRect<'_> {
    pub fn color(&mut self, color: Rgb888) -> &mut Self {
        self.color = color;
        self
    }

    /// Sets the stroke width. The stroke is drawn inside the rectangle; the default is 1.
    pub fn stroke_width(&mut self, width: u32) -> &mut Self {
        self.stroke_width = width;
        self
    }
}

impl Drop for DrawRect<'_> {
    fn drop(&mut self) {
        let style = PrimitiveStyleBuilder::new()
            .stroke_color(self.color)
            .stroke_width(self.stroke_width)
            .stroke_alignment(StrokeAlignment::Inside)
            .build();
        match self.rect.into_styled(style).draw(&mut Target(&mut *self.image)) {
            Ok(()) => {}
            Err(infallible) => match infallible {},
        }
    }
}

/// Guard returned by [`text`]; draws the text when dropped.
pub struct DrawText<'a> {
    image: &'a mut RgbImage,
    x: i32,
    y: i32,
    text: &'a str,
    color: Rgb888,
    background: Option<Rgb888>,
    baseline: Baseline,
}

impl DrawText<'_> {
    pub fn color(&mut self, color: Rgb888) -> &mut Self {
        self.color = color;
        self
    }

    /// Fills the text's bounding box with `color` before drawing the glyphs.
    pub fn background(&mut self, color: Rgb888) -> &mut Self {
        self.background = Some(color);
        self
    }

    /// Aligns the bottom of the text with the `y` coordinate.
    pub fn align_bottom(&mut self) -> &mut Self {
        self.baseline = Baseline::Bottom;
        self
    }
}

impl Drop for DrawText<'_> {
    fn drop(&mut self) {
        let mut character_style = MonoTextStyleBuilder::new()
            .font(&ascii::FONT_6X10)
            .text_color(self.color);
        if let Some(background) = self.background {
            character_style = character_style.background_color(background);
        }
        let text_style = TextStyleBuilder::new()
            .alignment(Alignment::Left)
            .baseline(self.baseline)
            .build();
        match Text::with_text_style(
            self.text,
            Point::new(self.x, self.y),
            character_style.build(),
            text_style,
        )
        .draw(&mut Target(&mut *self.image))
        {
            Ok(_) => {}
            Err(infallible) => match infallible {},
        }
    }
}

/// Draws the outline of an axis-aligned rectangle with its top left corner at `x`/`y`.
pub fn rect(image: &mut RgbImage, x: i32, y: i32, width: u32, height: u32) -> DrawRect<'_> {
    DrawRect {
        image,
        rect: Rectangle::new(Point::new(x, y), Size::new(width, height)),
        color: RED,
        stroke_width: 1,
    }
}

/// Draws a line of text with its top left corner at `x`/`y`.
pub fn text<'a>(image: &'a mut RgbImage, x: i32, y: i32, text: &'a str) -> DrawText<'a> {
    DrawText {
        image,
        x,
        y,
        text,
        color: RED,
        background: None,
        baseline: Baseline::Top,
    }
}

struct Target<'a>(&'a mut RgbImage);

impl Dimensions for Target<'_> {
    fn bounding_box(&self) -> Rectangle {
        let (width, height) = self.0.dimensions();
        Rectangle::new(Point::zero(), Size::new(width, height))
    }
}

impl DrawTarget for Target<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.0.dimensions();
        for Pixel(point, color) in pixels {
            if point.x >= 0
                && (point.x as u32) < width
                && point.y >= 0
                && (point.y as u32) < height
            {
                self.0.put_pixel(
                    point.x as u32,
                    point.y as u32,
                    Rgb([color.r(), color.g(), color.b()]),
                );
            }
        }
        Ok(())
    }
}

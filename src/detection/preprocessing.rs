use image::{DynamicImage, Rgb, RgbImage};
use image::imageops::{self, FilterType};

/// Fill colour used for the square padding
pub const PAD_FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// Per-side padding that turns a `width x height` image into a square
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Compute the padding for a square canvas of side `max(width, height)`.
/// The leading side gets the floor of half the gap, the trailing side the rest.
pub fn square_padding(width: u32, height: u32) -> Padding {
    let m = width.max(height);
    let left = (m - width) / 2;
    let top = (m - height) / 2;
    Padding {
        left,
        top,
        right: m - width - left,
        bottom: m - height - top,
    }
}

/// Pad to square with [`PAD_FILL`], then resize to `target_size x target_size`.
/// No source pixel is cropped; aspect ratio is kept by the padding step.
pub fn normalize(img: &DynamicImage, target_size: u32) -> DynamicImage {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let pad = square_padding(width, height);
    let side = width.max(height);

    let mut canvas = RgbImage::from_pixel(side, side, PAD_FILL);
    imageops::overlay(&mut canvas, &rgb, pad.left.into(), pad.top.into());

    let resized = imageops::resize(&canvas, target_size, target_size, FilterType::CatmullRom);
    DynamicImage::ImageRgb8(resized)
}

/// Stateless normalizer bound to a fixed target size
#[derive(Debug, Clone, Copy)]
pub struct ImageNormalizer {
    pub target_size: u32,
}

impl ImageNormalizer {
    pub fn new(target_size: u32) -> Self {
        Self { target_size }
    }

    pub fn normalize(&self, img: &DynamicImage) -> DynamicImage {
        normalize(img, self.target_size)
    }
}

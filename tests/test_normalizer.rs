use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use washlens::detection::{ImageNormalizer, Padding, square_padding};

fn white(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([255u8, 255, 255])))
}

#[test]
fn tall_image_is_padded_left_and_right() {
    assert_eq!(
        square_padding(100, 300),
        Padding { left: 100, top: 0, right: 100, bottom: 0 }
    );

    let out = ImageNormalizer::new(320).normalize(&white(100, 300));
    assert_eq!(out.dimensions(), (320, 320));
    // padding band is black, content stays white
    assert_eq!(out.get_pixel(10, 160).0[..3], [0, 0, 0]);
    assert!(out.get_pixel(160, 160).0[0] > 250);
    assert!(out.get_pixel(160, 5).0[0] > 250);
}

#[test]
fn wide_image_is_padded_top_and_bottom() {
    assert_eq!(
        square_padding(300, 100),
        Padding { left: 0, top: 100, right: 0, bottom: 100 }
    );

    let out = ImageNormalizer::new(320).normalize(&white(300, 100));
    assert_eq!(out.dimensions(), (320, 320));
    assert_eq!(out.get_pixel(160, 10).0[..3], [0, 0, 0]);
    assert_eq!(out.get_pixel(160, 310).0[..3], [0, 0, 0]);
    assert!(out.get_pixel(5, 160).0[0] > 250);
}

#[test]
fn grayscale_input_comes_out_as_rgb() {
    let gray = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(50, 20, image::Luma([200u8])));
    let out = ImageNormalizer::new(64).normalize(&gray);
    assert_eq!(out.dimensions(), (64, 64));
    assert!(out.as_rgb8().is_some());
}

use image::{DynamicImage, Rgb, RgbImage, imageops::FilterType};
use rten_tensor::NdTensor;

/// Grey used to pad letterboxed detector input.
const PAD_VALUE: u8 = 114;

/// How a source image was fitted into the square detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Map a point from detector input space back to source image space.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Resize keeping aspect ratio and pad to a `size`x`size` canvas, image centred.
pub fn letterbox(img: &DynamicImage, size: u32) -> (RgbImage, Letterbox) {
    let (width, height) = (img.width(), img.height());
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(&img.to_rgb8(), scaled_w, scaled_h, FilterType::Triangle);

    let pad_x = ((size - scaled_w) as f32 / 2.0 - 0.1).round().max(0.0) as u32;
    let pad_y = ((size - scaled_h) as f32 / 2.0 - 0.1).round().max(0.0) as u32;

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    image::imageops::overlay(&mut canvas, &resized, pad_x.into(), pad_y.into());

    (canvas, Letterbox { scale, pad_x, pad_y })
}

/// Planar `[1, 3, H, W]` tensor with channels scaled into [0, 1].
pub fn to_nchw_tensor(img: &RgbImage) -> NdTensor<f32, 4> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0f32; 3 * plane];

    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for c in 0..3 {
            data[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
    }

    NdTensor::from_data([1, 3, height as usize, width as usize], data)
}

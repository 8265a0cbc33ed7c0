//! Draws classified regions onto a copy of the source image.

use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::config::RenderStyle;
use crate::error::{PipelineError, RegionFailure};
use crate::models::{BoundingBox, CellType};

const BUNDLED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

/// Gap in pixels between a label's baseline area and the box top edge.
const LABEL_GAP: i32 = 2;

/// One classified region to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Detection index, carried through to skip reports.
    pub index: usize,
    pub bbox: BoundingBox,
    pub label: CellType,
    pub confidence: f32,
}

pub fn label_text(label: CellType, confidence: f32) -> String {
    format!("{label} ({confidence:.2})")
}

pub struct Rendered {
    pub image: DynamicImage,
    /// Regions that fell outside the image and were not drawn.
    pub skipped: Vec<RegionFailure>,
}

pub struct AnnotationRenderer {
    style: RenderStyle,
    font: FontVec,
}

impl AnnotationRenderer {
    /// Labels use `style.font_path` when set, the bundled DejaVu Sans otherwise.
    pub fn new(style: RenderStyle) -> Result<Self, PipelineError> {
        let font = match &style.font_path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    PipelineError::InvalidConfig(format!(
                        "cannot read label font {}: {e}",
                        path.display()
                    ))
                })?;
                let font = FontVec::try_from_vec(bytes).map_err(|e| {
                    PipelineError::InvalidConfig(format!(
                        "invalid label font {}: {e}",
                        path.display()
                    ))
                })?;
                debug!("Loaded label font: {}", path.display());
                font
            }
            None => FontVec::try_from_vec(BUNDLED_FONT.to_vec()).map_err(|e| {
                PipelineError::InvalidConfig(format!("bundled label font is unreadable: {e}"))
            })?,
        };
        Ok(Self { style, font })
    }

    /// Draw every annotation in order onto a copy of `base`.
    ///
    /// With nothing to draw the result is `base` unchanged.
    pub fn render(&self, base: &DynamicImage, annotations: &[Annotation]) -> Rendered {
        if annotations.is_empty() {
            return Rendered {
                image: base.clone(),
                skipped: Vec::new(),
            };
        }

        let mut canvas: RgbImage = base.to_rgb8();
        let (width, height) = canvas.dimensions();
        let mut skipped = Vec::new();

        for annotation in annotations {
            let bbox = annotation.bbox;
            if !bbox.fits_within(width, height) {
                let err = PipelineError::RenderSkipped { bbox, width, height };
                warn!("Region {}: {}", annotation.index + 1, err);
                skipped.push(RegionFailure::new(annotation.index, bbox, &err));
                continue;
            }
            self.draw_box(&mut canvas, &bbox);
            self.draw_label(&mut canvas, annotation);
        }

        Rendered {
            image: DynamicImage::ImageRgb8(canvas),
            skipped,
        }
    }

    fn draw_box(&self, canvas: &mut RgbImage, bbox: &BoundingBox) {
        let color = self.style.color();
        for t in 0..self.style.thickness {
            let inset = 2 * t;
            if bbox.width() <= inset || bbox.height() <= inset {
                break;
            }
            let rect = Rect::at(bbox.x1 + t as i32, bbox.y1 + t as i32)
                .of_size(bbox.width() - inset, bbox.height() - inset);
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }

    fn draw_label(&self, canvas: &mut RgbImage, annotation: &Annotation) {
        let font = &self.font;
        let text = label_text(annotation.label, annotation.confidence);
        let scale = PxScale::from(self.style.font_scale);
        let (_, text_height) = text_size(scale, font, &text);
        let y = (annotation.bbox.y1 - text_height as i32 - LABEL_GAP).max(0);
        draw_text_mut(canvas, self.style.color(), annotation.bbox.x1, y, scale, font, &text);
    }
}

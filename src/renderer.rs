//! Skin rasterization with tiny-skia (via resvg).

use crate::job::{RenderMode, RenderRequest};
use resvg::tiny_skia::{FilterQuality, Paint, Pattern, Pixmap, Rect, SpreadMode, Transform};
use tracing::debug;

/// Largest output raster, in pixels, a render may allocate.
pub const MAX_OUTPUT_PIXELS: u64 = 4096 * 4096;

/// Turns a render request into a raster image.
///
/// Each worker context owns its renderer and calls it from a single thread,
/// so implementations may hold non-thread-safe resources.
#[cfg_attr(test, mockall::automock)]
pub trait Renderer: Send {
    fn render(&mut self, request: &RenderRequest) -> Result<Pixmap, RenderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Zero, or larger than [`MAX_OUTPUT_PIXELS`].
    #[error("invalid output dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("texture {width}x{height} is not a skin layout")]
    UnsupportedTexture { width: u32, height: u32 },

    #[error("renderer panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Creates one renderer per worker context.
pub type RendererFactory = Box<dyn Fn(usize) -> Box<dyn Renderer> + Send + Sync>;

/// Texture region in 64x64 skin units.
#[derive(Debug, Clone, Copy)]
struct Uv {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

const fn uv(x: f32, y: f32, w: f32, h: f32) -> Uv {
    Uv { x, y, w, h }
}

/// One body part: its front and back texture faces and where it sits in the
/// front view (figure units, 16 wide and 32 tall).
#[derive(Debug, Clone, Copy)]
struct Part {
    front: Uv,
    back: Uv,
    at: (f32, f32),
    size: (f32, f32),
    is_leg: bool,
}

/// Front-view skin renderer.
///
/// Draws the classic 64x64 (or legacy 64x32) skin layout as a flat figure.
/// `rotation_y` beyond 90 degrees shows the back faces, both rotations
/// foreshorten the figure, `leg_rotation` swings the legs around the hip and
/// `flipped` turns the figure upside down.
#[derive(Debug, Default)]
pub struct SkinRenderer;

impl SkinRenderer {
    pub fn new() -> Self {
        Self
    }

    fn parts(mode: RenderMode, slim: bool, legacy: bool) -> Vec<Part> {
        let arm = if slim { 3.0 } else { 4.0 };
        let head = Part {
            front: uv(8.0, 8.0, 8.0, 8.0),
            back: uv(24.0, 8.0, 8.0, 8.0),
            at: (4.0, 0.0),
            size: (8.0, 8.0),
            is_leg: false,
        };
        if mode == RenderMode::Head {
            return vec![head];
        }

        let body = Part {
            front: uv(20.0, 20.0, 8.0, 12.0),
            back: uv(32.0, 20.0, 8.0, 12.0),
            at: (4.0, 8.0),
            size: (8.0, 12.0),
            is_leg: false,
        };
        let right_arm = Part {
            front: uv(44.0, 20.0, arm, 12.0),
            back: uv(48.0 + arm, 20.0, arm, 12.0),
            at: (4.0 - arm, 8.0),
            size: (arm, 12.0),
            is_leg: false,
        };
        // Legacy textures have no left limbs; the right ones are reused.
        let left_arm = if legacy {
            Part { at: (12.0, 8.0), ..right_arm }
        } else {
            Part {
                front: uv(36.0, 52.0, arm, 12.0),
                back: uv(40.0 + arm, 52.0, arm, 12.0),
                at: (12.0, 8.0),
                size: (arm, 12.0),
                is_leg: false,
            }
        };
        let mut parts = vec![head, body, right_arm, left_arm];
        if mode == RenderMode::Bust {
            return parts;
        }

        let right_leg = Part {
            front: uv(4.0, 20.0, 4.0, 12.0),
            back: uv(12.0, 20.0, 4.0, 12.0),
            at: (4.0, 20.0),
            size: (4.0, 12.0),
            is_leg: true,
        };
        let left_leg = if legacy {
            Part { at: (8.0, 20.0), ..right_leg }
        } else {
            Part {
                front: uv(20.0, 52.0, 4.0, 12.0),
                back: uv(28.0, 52.0, 4.0, 12.0),
                at: (8.0, 20.0),
                size: (4.0, 12.0),
                is_leg: true,
            }
        };
        parts.push(right_leg);
        parts.push(left_leg);
        parts
    }

    fn figure_height(mode: RenderMode) -> f32 {
        match mode {
            RenderMode::Head => 8.0,
            RenderMode::Bust => 20.0,
            RenderMode::Body => 32.0,
        }
    }
}

impl Renderer for SkinRenderer {
    fn render(&mut self, request: &RenderRequest) -> Result<Pixmap, RenderError> {
        let (width, height) = (request.width, request.height);
        if u64::from(width) * u64::from(height) > MAX_OUTPUT_PIXELS {
            return Err(RenderError::InvalidDimensions { width, height });
        }
        let mut canvas =
            Pixmap::new(width, height).ok_or(RenderError::InvalidDimensions { width, height })?;

        let texture = &request.source_image;
        let (tw, th) = (texture.width(), texture.height());
        if tw == 0 || tw % 64 != 0 || (th != tw && th * 2 != tw) {
            return Err(RenderError::UnsupportedTexture { width: tw, height: th });
        }
        let legacy = th * 2 == tw;
        let texel = tw as f32 / 64.0;

        let yaw = (request.rotation_y as f32).to_radians().cos();
        let pitch = (request.rotation_x as f32).to_radians().cos();
        let show_back = yaw < 0.0;

        let (fig_w, fig_h) = match request.mode {
            RenderMode::Head => (8.0, 8.0),
            _ => (16.0, Self::figure_height(request.mode)),
        };
        let x_offset = if request.mode == RenderMode::Head { 4.0 } else { 0.0 };
        let scale = (width as f32 / fig_w).min(height as f32 / fig_h);

        let mut view = Transform::from_translate(width as f32 / 2.0, height as f32 / 2.0)
            .pre_scale(scale, scale);
        if request.flipped {
            view = view.pre_scale(1.0, -1.0);
        }
        let view = view
            .pre_scale(yaw.abs().max(0.05), pitch.abs().max(0.05))
            .pre_translate(-fig_w / 2.0 - x_offset, -fig_h / 2.0);

        debug!(
            mode = %request.mode,
            width,
            height,
            texture = %format!("{tw}x{th}"),
            show_back,
            "Rendering skin"
        );

        for part in Self::parts(request.mode, request.slim, legacy) {
            let face = if show_back { part.back } else { part.front };
            let (dx, dy) = part.at;
            let (dw, dh) = part.size;
            let Some(rect) = Rect::from_xywh(dx, dy, dw, dh) else {
                continue;
            };

            // Maps texture pixels onto the part's rectangle in figure units.
            // Back faces are mirrored horizontally.
            let sx = dw / (face.w * texel);
            let sy = dh / (face.h * texel);
            let ty = dy - face.y * texel * sy;
            let pattern_transform = if show_back {
                let tx = dx + (face.x + face.w) * texel * sx;
                Transform::from_row(-sx, 0.0, 0.0, sy, tx, ty)
            } else {
                Transform::from_row(sx, 0.0, 0.0, sy, dx - face.x * texel * sx, ty)
            };

            let paint = Paint {
                shader: Pattern::new(
                    texture.as_ref(),
                    SpreadMode::Pad,
                    FilterQuality::Nearest,
                    1.0,
                    pattern_transform,
                ),
                anti_alias: false,
                ..Paint::default()
            };

            let transform = if part.is_leg && request.leg_rotation != 0 {
                let swing = if dx < 8.0 {
                    request.leg_rotation
                } else {
                    -request.leg_rotation
                };
                view.pre_concat(Transform::from_rotate_at(swing as f32, dx + dw / 2.0, dy))
            } else {
                view
            };

            canvas.fill_rect(rect, &paint, transform, None);
        }

        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_request;
    use resvg::tiny_skia::Color;

    #[test]
    fn test_render_body_fills_center() {
        let mut renderer = SkinRenderer::new();
        let image = renderer.render(&test_request(64, 128)).unwrap();

        assert_eq!(image.width(), 64);
        assert_eq!(image.height(), 128);
        // The torso sits in the middle of the figure.
        let pixel = image.pixel(32, 60).unwrap();
        assert_eq!(pixel.alpha(), 255);
    }

    #[test]
    fn test_render_head_mode() {
        let mut request = test_request(32, 32);
        request.mode = RenderMode::Head;
        request.rotation_y = 180;

        let image = SkinRenderer::new().render(&request).unwrap();
        assert_eq!(image.pixel(16, 16).unwrap().alpha(), 255);
    }

    #[test]
    fn test_zero_dimensions_fail() {
        let err = SkinRenderer::new().render(&test_request(0, 0)).unwrap_err();
        assert!(matches!(err, RenderError::InvalidDimensions { width: 0, height: 0 }));
    }

    #[test]
    fn test_oversized_output_fails_before_allocating() {
        let err = SkinRenderer::new()
            .render(&test_request(1_000_000, 1_000_000))
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidDimensions { width: 1_000_000, height: 1_000_000 }
        ));

        // Within the pixel budget even when one side is long.
        assert!(SkinRenderer::new().render(&test_request(4096, 64)).is_ok());
    }

    #[test]
    fn test_non_skin_texture_fails() {
        let mut request = test_request(32, 32);
        request.source_image = Pixmap::new(10, 10).unwrap();

        let err = SkinRenderer::new().render(&request).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedTexture { .. }));
    }

    #[test]
    fn test_legacy_texture_and_options() {
        let mut request = test_request(64, 64);
        let mut legacy = Pixmap::new(64, 32).unwrap();
        legacy.fill(Color::from_rgba8(10, 20, 30, 255));
        request.source_image = legacy;
        request.slim = true;
        request.flipped = true;
        request.leg_rotation = 30;
        request.rotation_x = 20;

        assert!(SkinRenderer::new().render(&request).is_ok());
    }
}

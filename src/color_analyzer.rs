//! Average-color extraction and contrast-aware theme derivation.
//!
//! All functions are pure over color values. Luminance follows the sRGB
//! relative-luminance definition so contrast ratios are comparable with the
//! usual accessibility thresholds.

use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// Longest edge the image is reduced to before averaging.
pub const AVERAGE_SAMPLE_MAX_EDGE_PX: u32 = 64;
/// Luminance where contrast against black equals contrast against white.
pub const LUMINANCE_MIDPOINT: f32 = 0.179;
/// Lowest acceptable foreground/background contrast ratio.
pub const MIN_CONTRAST_RATIO: f32 = 3.0;

/// RGB color with channels in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0.0, 0.0, 0.0);
    pub const WHITE: Color = Color::rgb(1.0, 1.0, 1.0);
    /// Returned for images with nothing visible to average.
    pub const NEUTRAL: Color = Color::rgb(128.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0);
    pub const FLAT_BLACK: Color = Color::rgb(43.0 / 255.0, 43.0 / 255.0, 43.0 / 255.0);
    pub const FLAT_WHITE: Color = Color::rgb(236.0 / 255.0, 240.0 / 255.0, 241.0 / 255.0);

    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn from_rgb_u8(r: u8, g: u8, b: u8) -> Self {
        Self::rgb(
            f32::from(r) / 255.0,
            f32::from(g) / 255.0,
            f32::from(b) / 255.0,
        )
    }

    pub fn to_rgb_u8(self) -> (u8, u8, u8) {
        (
            channel_to_u8(self.r),
            channel_to_u8(self.g),
            channel_to_u8(self.b),
        )
    }

    /// Formats as uppercase `#RRGGBB`.
    pub fn to_hex(self) -> String {
        let (r, g, b) = self.to_rgb_u8();
        format!("#{r:02X}{g:02X}{b:02X}")
    }

    fn clamped(self) -> Self {
        Self::rgb(clamp_unit(self.r), clamp_unit(self.g), clamp_unit(self.b))
    }
}

/// Background plus derived foreground colors applied to the presentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThemeColors {
    pub background: Color,
    pub foreground: Color,
    pub background_light: Color,
}

impl ThemeColors {
    /// Derives the full theme from one background color.
    pub fn from_background(background: Color, lighten_fraction: f32, prefer_flat: bool) -> Self {
        Self {
            background,
            foreground: contrasting_color(background, prefer_flat),
            background_light: lighten(background, lighten_fraction),
        }
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

fn channel_to_u8(value: f32) -> u8 {
    (clamp_unit(value) * 255.0).round() as u8
}

fn linearize(channel: f32) -> f32 {
    let c = clamp_unit(channel);
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Returns sRGB relative luminance in `[0, 1]`.
pub fn relative_luminance(color: Color) -> f32 {
    0.2126 * linearize(color.r) + 0.7152 * linearize(color.g) + 0.0722 * linearize(color.b)
}

/// Returns the contrast ratio between two colors, in `[1, 21]`.
pub fn contrast_ratio(a: Color, b: Color) -> f32 {
    let la = relative_luminance(a);
    let lb = relative_luminance(b);
    let (lighter, darker) = if la >= lb { (la, lb) } else { (lb, la) };
    (lighter + 0.05) / (darker + 0.05)
}

fn fit_to_max_edge(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let clamped = max_edge.max(1);
    if width.max(height) <= clamped {
        return (width, height);
    }
    if width >= height {
        let scaled =
            ((u64::from(height) * u64::from(clamped)) + (u64::from(width) / 2)) / u64::from(width);
        (clamped, scaled.max(1) as u32)
    } else {
        let scaled =
            ((u64::from(width) * u64::from(clamped)) + (u64::from(height) / 2)) / u64::from(height);
        (scaled.max(1) as u32, clamped)
    }
}

/// Computes the alpha-weighted mean color of a reduced copy of `image`.
///
/// Zero-size and fully transparent images yield [`Color::NEUTRAL`].
pub fn average_color(image: &DynamicImage) -> Color {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Color::NEUTRAL;
    }
    let (target_width, target_height) = fit_to_max_edge(width, height, AVERAGE_SAMPLE_MAX_EDGE_PX);
    let sample = if (target_width, target_height) == (width, height) {
        image.to_rgba8()
    } else {
        image
            .resize_exact(target_width, target_height, FilterType::Triangle)
            .to_rgba8()
    };

    let mut sums = [0u64; 3];
    let mut alpha_total = 0u64;
    for pixel in sample.pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u64::from(a);
        sums[0] += u64::from(r) * alpha;
        sums[1] += u64::from(g) * alpha;
        sums[2] += u64::from(b) * alpha;
        alpha_total += alpha;
    }
    if alpha_total == 0 {
        return Color::NEUTRAL;
    }
    let mean = |sum: u64| ((sum + alpha_total / 2) / alpha_total).min(255) as u8;
    Color::from_rgb_u8(mean(sums[0]), mean(sums[1]), mean(sums[2]))
}

/// Picks a light or dark foreground for `background`.
///
/// Dark backgrounds (luminance below [`LUMINANCE_MIDPOINT`]) get white,
/// everything else black. With `prefer_flat` the softened flat variants are
/// used unless they would drop below [`MIN_CONTRAST_RATIO`].
pub fn contrasting_color(background: Color, prefer_flat: bool) -> Color {
    let wants_light = relative_luminance(background) < LUMINANCE_MIDPOINT;
    let (pure, flat) = if wants_light {
        (Color::WHITE, Color::FLAT_WHITE)
    } else {
        (Color::BLACK, Color::FLAT_BLACK)
    };
    if prefer_flat && contrast_ratio(flat, background) >= MIN_CONTRAST_RATIO {
        flat
    } else {
        pure
    }
}

/// Moves each channel toward white by `fraction`, clamped to `[0, 1]`.
pub fn lighten(color: Color, fraction: f32) -> Color {
    let f = clamp_unit(fraction);
    let base = color.clamped();
    Color::rgb(
        base.r + (1.0 - base.r) * f,
        base.g + (1.0 - base.g) * f,
        base.b + (1.0 - base.b) * f,
    )
    .clamped()
}

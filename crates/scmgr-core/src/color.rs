//! Colour similarity for the contrast rule.
//!
//! Two colours are compared in HSV space projected onto a cone: hue is the
//! angle, saturation times value the distance from the axis and value the
//! height. Projecting first keeps dark colours close to each other
//! regardless of hue, which matches how they are perceived.
//!
//! The similarity test itself is symmetric. Whether a similar background
//! actually hides the label also depends on alpha, which is what
//! [`background_dominates`] decides.

use std::f64::consts::PI;

use crate::component::Color;

/// Cone radius used by the projection.
pub const CONE_RADIUS: f64 = 100.0;

/// Half-angle of the projection cone, in degrees.
pub const CONE_ANGLE_DEG: f64 = 30.0;

/// Hue/saturation/value triple. Hue in degrees `[0, 360)`, saturation and
/// value in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsv {
    pub h: f64,
    pub s: f64,
    pub v: f64,
}

impl Hsv {
    /// Converts the RGB channels of `color`; alpha is ignored.
    #[must_use]
    pub fn from_color(color: Color) -> Self {
        let r = f64::from(color.red()) / 255.0;
        let g = f64::from(color.green()) / 255.0;
        let b = f64::from(color.blue()) / 255.0;

        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let h = if delta <= f64::EPSILON {
            0.0
        } else if (max - r).abs() <= f64::EPSILON {
            60.0 * ((g - b) / delta).rem_euclid(6.0)
        } else if (max - g).abs() <= f64::EPSILON {
            60.0 * ((b - r) / delta + 2.0)
        } else {
            60.0 * ((r - g) / delta + 4.0)
        };
        let s = if max <= f64::EPSILON { 0.0 } else { delta / max };

        Self { h, s, v: max }
    }

    /// Projects onto the 3-D cone.
    #[must_use]
    pub fn project(&self) -> [f64; 3] {
        let angle = CONE_ANGLE_DEG / 180.0 * PI;
        let r = CONE_RADIUS * angle.sin();
        let height = CONE_RADIUS * angle.cos();
        let hue = self.h / 180.0 * PI;
        [
            r * self.v * self.s * hue.cos(),
            r * self.v * self.s * hue.sin(),
            height * (1.0 - self.v),
        ]
    }
}

/// Euclidean distance between the cone projections of two colours.
#[must_use]
pub fn color_distance(a: Color, b: Color) -> f64 {
    let pa = Hsv::from_color(a).project();
    let pb = Hsv::from_color(b).project();
    let dx = pa[0] - pb[0];
    let dy = pa[1] - pb[1];
    let dz = pa[2] - pb[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Symmetric similarity: projected distance strictly below `threshold`.
#[must_use]
pub fn is_color_similar(a: Color, b: Color, threshold: f64) -> bool {
    color_distance(a, b) < threshold
}

/// Returns `true` if `bg` would dominate the blended pixel when `fg` is
/// drawn over it.
///
/// `mixed = fgA + bgA - fgA * bgA`; the background dominates when
/// `bgA / mixed` exceeds `ratio`.
#[must_use]
pub fn background_dominates(fg: Color, bg: Color, ratio: f64) -> bool {
    let fa = fg.alpha_fraction();
    let ba = bg.alpha_fraction();
    let mixed = fa + ba - fa * ba;
    if mixed <= f64::EPSILON {
        return false;
    }
    ba / mixed > ratio
}

/// Contrast failure: colours are similar and the background dominates.
#[must_use]
pub fn is_contrast_insufficient(fg: Color, bg: Color, threshold: f64, ratio: f64) -> bool {
    is_color_similar(fg, bg, threshold) && background_dominates(fg, bg, ratio)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const WHITE: Color = Color(0xFFFF_FFFF);
    const BLACK: Color = Color(0xFF00_0000);
    const RED: Color = Color(0xFFFF_0000);
    const BLUE: Color = Color(0xFF00_00FF);

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_hsv_primaries() {
        let red = Hsv::from_color(RED);
        assert!(approx(red.h, 0.0) && approx(red.s, 1.0) && approx(red.v, 1.0));

        let blue = Hsv::from_color(BLUE);
        assert!(approx(blue.h, 240.0));

        let green = Hsv::from_color(Color(0xFF00_FF00));
        assert!(approx(green.h, 120.0));

        let black = Hsv::from_color(BLACK);
        assert!(approx(black.s, 0.0) && approx(black.v, 0.0));
    }

    #[test]
    fn test_identical_colors_are_similar() {
        assert!(is_color_similar(RED, RED, 5.0));
        assert!(approx(color_distance(BLUE, BLUE), 0.0));
    }

    #[test]
    fn test_black_and_white_are_far_apart() {
        let d = color_distance(BLACK, WHITE);
        assert!(d > 80.0, "distance {d}");
        assert!(!is_color_similar(BLACK, WHITE, 5.0));
    }

    #[test]
    fn test_near_black_hues_are_similar() {
        // Very dark red and very dark blue look alike.
        let dark_red = Color(0xFF03_0000);
        let dark_blue = Color(0xFF00_0003);
        assert!(is_color_similar(dark_red, dark_blue, 5.0));
        assert!(!is_color_similar(RED, BLUE, 5.0));
    }

    #[test]
    fn test_background_dominance() {
        // Opaque over opaque: background fills the pixel.
        assert!(background_dominates(WHITE, WHITE, 0.5));
        // Faint background under opaque label does not hide it.
        assert!(!background_dominates(WHITE, Color(0x4DFF_FFFF), 0.5));
        // Faint label over opaque background is hidden.
        assert!(background_dominates(Color(0x20FF_FFFF), WHITE, 0.5));
        // Both fully transparent.
        assert!(!background_dominates(Color(0), Color(0), 0.5));
    }

    #[test]
    fn test_contrast_requires_both_conditions() {
        assert!(is_contrast_insufficient(RED, RED, 5.0, 0.5));
        assert!(!is_contrast_insufficient(RED, BLUE, 5.0, 0.5));
        assert!(!is_contrast_insufficient(RED, Color(0x30FF_0000), 5.0, 0.5));
    }

    proptest! {
        #[test]
        fn prop_similarity_is_symmetric(a in any::<u32>(), b in any::<u32>()) {
            let (a, b) = (Color(a), Color(b));
            prop_assert_eq!(is_color_similar(a, b, 5.0), is_color_similar(b, a, 5.0));
            prop_assert!((color_distance(a, b) - color_distance(b, a)).abs() < 1e-9);
        }

        #[test]
        fn prop_alpha_does_not_change_distance(
            rgb in 0u32..0x0100_0000,
            a1 in any::<u8>(),
            a2 in any::<u8>(),
        ) {
            let c1 = Color(u32::from(a1) << 24 | rgb);
            let c2 = Color(u32::from(a2) << 24 | rgb);
            prop_assert!(color_distance(c1, c2) < 1e-9);
        }
    }
}

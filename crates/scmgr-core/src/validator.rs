//! Contrast and geometry validity rules.
//!
//! A component is valid only if four independent groups of checks pass:
//!
//! | Group | Rejects |
//! |-------|---------|
//! | bounds | non-finite rects, rect outside window/screen, oversize |
//! | parent effect | opacity/blur ancestors, clipping that hides content |
//! | size | missing label, padding tricks, undersized font/icon |
//! | contrast | translucent label, label colour close to background |
//!
//! Validation never panics; callers get `Ok(())` or a [`ValidityError`]
//! whose `Display` is the human-readable reason.

use std::f64::consts::FRAC_1_SQRT_2;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::color::is_contrast_insufficient;
use crate::component::{BackgroundType, Rect, SecurityComponent};
use crate::oracle::{ScreenInfo, WindowScale};

// =============================================================================
// Policy
// =============================================================================

/// Thresholds used by the validity rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Minimum font size when no icon is shown.
    pub min_font_size_without_icon: f64,
    /// Minimum font size when an icon is shown next to the text.
    pub min_font_size_with_icon: f64,
    pub min_icon_size: f64,
    /// Minimum padding on each side when a background is drawn.
    pub min_padding: f64,
    /// Exact padding required on each side when no background is drawn.
    pub borderless_padding: f64,
    pub min_text_icon_space: f64,
    /// Labels with alpha below this are too faint to be trusted.
    pub min_visible_alpha: u8,
    pub color_distance_threshold: f64,
    pub background_dominance_ratio: f64,
    /// Components covering at least this fraction of the screen are
    /// rejected.
    pub max_screen_area_ratio: f64,
    pub epsilon: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_font_size_without_icon: 12.0,
            min_font_size_with_icon: 8.0,
            min_icon_size: 12.0,
            min_padding: 0.0,
            borderless_padding: 4.0,
            min_text_icon_space: 0.0,
            min_visible_alpha: 0x1A,
            color_distance_threshold: 5.0,
            background_dominance_ratio: 0.5,
            max_screen_area_ratio: 0.1,
            epsilon: 0.001,
        }
    }
}

/// Oracle facts needed to validate one component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationContext {
    pub screen: ScreenInfo,
    pub window_scale: WindowScale,
}

// =============================================================================
// Errors
// =============================================================================

/// Which rectangle a bounds failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectRole {
    Component,
    Window,
}

impl std::fmt::Display for RectRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Component => f.write_str("component rect"),
            Self::Window => f.write_str("window rect"),
        }
    }
}

/// Check group a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityCheck {
    Bounds,
    ParentEffect,
    Size,
    Contrast,
}

/// Reason a component is invalid.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ValidityError {
    #[error("{role} is not positive and finite")]
    InvalidRect { role: RectRole },

    #[error("screen size {width}x{height} is not positive and finite")]
    InvalidScreen { width: f64, height: f64 },

    #[error("window scale {scale} is not positive and finite")]
    InvalidWindowScale { scale: f64 },

    #[error("component rect is outside its window rect")]
    OutOfWindow,

    #[error("component rect is outside the screen")]
    OutOfScreen,

    #[error("component corner is outside the round screen")]
    OutsideRoundScreen,

    #[error("component covers {percent:.1}% of the screen")]
    TooLarge { percent: f64 },

    #[error("ancestor applies a visual effect")]
    ParentEffect,

    #[error("ancestor clip hides part of the component")]
    Clipped,

    #[error("component has neither text nor icon")]
    NoTextOrIcon,

    #[error("borderless component padding must be exactly {expected}")]
    BorderlessPadding { expected: f64 },

    #[error("padding is smaller than {min}")]
    PaddingTooSmall { min: f64 },

    #[error("text-icon space {space} is smaller than {min}")]
    TextIconSpaceTooSmall { space: f64, min: f64 },

    #[error("font size {size} is smaller than {min}")]
    FontTooSmall { size: f64, min: f64 },

    #[error("icon size {size} is smaller than {min}")]
    IconTooSmall { size: f64, min: f64 },

    #[error("border width {width} is invalid")]
    InvalidBorderWidth { width: f64 },

    #[error("font color is too transparent (alpha {alpha:#04x})")]
    FontTooTransparent { alpha: u8 },

    #[error("icon color is too transparent (alpha {alpha:#04x})")]
    IconTooTransparent { alpha: u8 },

    #[error("font color is too similar to the background color")]
    FontContrast,

    #[error("icon color is too similar to the background color")]
    IconContrast,
}

impl ValidityError {
    /// Returns the check group that produced this error.
    #[must_use]
    pub const fn check(&self) -> ValidityCheck {
        match self {
            Self::InvalidRect { .. }
            | Self::InvalidScreen { .. }
            | Self::InvalidWindowScale { .. }
            | Self::OutOfWindow
            | Self::OutOfScreen
            | Self::OutsideRoundScreen
            | Self::TooLarge { .. } => ValidityCheck::Bounds,
            Self::ParentEffect | Self::Clipped => ValidityCheck::ParentEffect,
            Self::NoTextOrIcon
            | Self::BorderlessPadding { .. }
            | Self::PaddingTooSmall { .. }
            | Self::TextIconSpaceTooSmall { .. }
            | Self::FontTooSmall { .. }
            | Self::IconTooSmall { .. }
            | Self::InvalidBorderWidth { .. } => ValidityCheck::Size,
            Self::FontTooTransparent { .. }
            | Self::IconTooTransparent { .. }
            | Self::FontContrast
            | Self::IconContrast => ValidityCheck::Contrast,
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Pure validity checker; holds only its policy.
#[derive(Debug, Clone, Default)]
pub struct ContrastAndGeometryValidator {
    policy: ValidationPolicy,
}

impl ContrastAndGeometryValidator {
    #[must_use]
    pub const fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Runs every check group in order and returns the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidityError`] found.
    pub fn validate(
        &self,
        component: &SecurityComponent,
        ctx: &ValidationContext,
    ) -> Result<(), ValidityError> {
        self.validate_drawn(component, ctx).map(|_| ())
    }

    /// Like [`validate`](Self::validate), returning the rect the component
    /// is drawn at on success.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidityError`] found.
    pub fn validate_drawn(
        &self,
        component: &SecurityComponent,
        ctx: &ValidationContext,
    ) -> Result<Rect, ValidityError> {
        let (rect, _) = self.check_bounds(component, ctx)?;
        self.check_parent_effect(component, &rect)?;
        self.check_sizes(component)?;
        self.check_contrast(component)?;
        Ok(rect)
    }

    /// Validates and records the outcome in `component.is_valid` and
    /// `component.drawn_rect`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidityError`] found.
    pub fn validate_and_mark(
        &self,
        component: &mut SecurityComponent,
        ctx: &ValidationContext,
    ) -> Result<(), ValidityError> {
        match self.validate_drawn(component, ctx) {
            Ok(drawn) => {
                component.is_valid = true;
                component.drawn_rect = Some(drawn);
                Ok(())
            },
            Err(err) => {
                component.is_valid = false;
                component.drawn_rect = None;
                tracing::debug!(
                    kind = %component.kind(),
                    check = ?err.check(),
                    reason = %err,
                    "component failed validity check"
                );
                Err(err)
            },
        }
    }

    /// Applies the hosting window's render scale to the component and
    /// window rects.
    ///
    /// Normal scaling anchors at the window's top-left corner, compat
    /// scaling at the window centre.
    ///
    /// # Errors
    ///
    /// Returns [`ValidityError::InvalidWindowScale`] for a non-finite or
    /// non-positive scale.
    pub fn scaled_geometry(
        &self,
        component: &SecurityComponent,
        scale: WindowScale,
    ) -> Result<(Rect, Rect), ValidityError> {
        let factor = scale.scale;
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ValidityError::InvalidWindowScale { scale: factor });
        }
        if (factor - 1.0).abs() < self.policy.epsilon {
            return Ok((component.rect, component.window_rect));
        }

        let window = component.window_rect;
        let (ax, ay) = if scale.compat_mode {
            window.center()
        } else {
            (window.x, window.y)
        };
        Ok((
            component.rect.scaled_about(ax, ay, factor),
            window.scaled_about(ax, ay, factor),
        ))
    }

    /// Bounds group. Returns the scaled `(rect, window_rect)` on success.
    pub fn check_bounds(
        &self,
        component: &SecurityComponent,
        ctx: &ValidationContext,
    ) -> Result<(Rect, Rect), ValidityError> {
        let eps = self.policy.epsilon;
        if !component.rect.is_positive_finite() {
            return Err(ValidityError::InvalidRect {
                role: RectRole::Component,
            });
        }
        if !component.window_rect.is_positive_finite() {
            return Err(ValidityError::InvalidRect {
                role: RectRole::Window,
            });
        }
        let screen = ctx.screen;
        if !(screen.width.is_finite() && screen.height.is_finite())
            || screen.width <= 0.0
            || screen.height <= 0.0
        {
            return Err(ValidityError::InvalidScreen {
                width: screen.width,
                height: screen.height,
            });
        }

        let (rect, window_rect) = self.scaled_geometry(component, ctx.window_scale)?;

        if !window_rect.contains_rect(&rect, eps) {
            return Err(ValidityError::OutOfWindow);
        }

        if screen.circular {
            self.check_round_screen(component, &rect, &screen)?;
        } else if !Rect::new(0.0, 0.0, screen.width, screen.height).contains_rect(&rect, eps) {
            return Err(ValidityError::OutOfScreen);
        }

        let screen_area = screen.width * screen.height;
        if rect.area() >= screen_area * self.policy.max_screen_area_ratio {
            return Err(ValidityError::TooLarge {
                percent: rect.area() / screen_area * 100.0,
            });
        }

        Ok((rect, window_rect))
    }

    /// Every corner, pulled inward along its diagonal by the corner radius,
    /// must lie within the circle inscribed in the screen.
    fn check_round_screen(
        &self,
        component: &SecurityComponent,
        rect: &Rect,
        screen: &ScreenInfo,
    ) -> Result<(), ValidityError> {
        let radius = screen.width.min(screen.height) / 2.0;
        let (cx, cy) = (screen.width / 2.0, screen.height / 2.0);
        let radii = component.style.border_radius.unwrap_or_default();
        let max_corner = rect.width.min(rect.height) / 2.0;
        let inset = |r: f64| r.max(0.0).min(max_corner) * (1.0 - FRAC_1_SQRT_2);

        let corners = [
            (rect.x + inset(radii.top_left), rect.y + inset(radii.top_left)),
            (
                rect.right() - inset(radii.top_right),
                rect.y + inset(radii.top_right),
            ),
            (
                rect.x + inset(radii.bottom_left),
                rect.bottom() - inset(radii.bottom_left),
            ),
            (
                rect.right() - inset(radii.bottom_right),
                rect.bottom() - inset(radii.bottom_right),
            ),
        ];
        for (px, py) in corners {
            if (px - cx).hypot(py - cy) > radius + self.policy.epsilon {
                return Err(ValidityError::OutsideRoundScreen);
            }
        }
        Ok(())
    }

    /// Parent-effect group. `rect` is the scaled component rect.
    pub fn check_parent_effect(
        &self,
        component: &SecurityComponent,
        rect: &Rect,
    ) -> Result<(), ValidityError> {
        let effect = &component.parent_effect;
        if effect.has_effect {
            return Err(ValidityError::ParentEffect);
        }
        if effect.is_clipped {
            // Unknown clip bounds fail closed.
            let Some(clip) = effect.clip_rect else {
                return Err(ValidityError::Clipped);
            };
            if !clip.contains_rect(rect, self.policy.epsilon) {
                return Err(ValidityError::Clipped);
            }
        }
        Ok(())
    }

    /// Size group: label presence, padding, spacing, font/icon minimums.
    // Negated comparisons so that NaN fails every minimum.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn check_sizes(&self, component: &SecurityComponent) -> Result<(), ValidityError> {
        let policy = &self.policy;
        let style = &component.style;
        let has_text = component.has_text();
        let has_icon = component.has_icon();

        if !has_text && !has_icon {
            return Err(ValidityError::NoTextOrIcon);
        }

        if !style.border_width.is_finite() || style.border_width < 0.0 {
            return Err(ValidityError::InvalidBorderWidth {
                width: style.border_width,
            });
        }

        let sides = style.padding.sides();
        if style.background == BackgroundType::None {
            if sides
                .iter()
                .any(|p| !((p - policy.borderless_padding).abs() < policy.epsilon))
            {
                return Err(ValidityError::BorderlessPadding {
                    expected: policy.borderless_padding,
                });
            }
        } else if sides.iter().any(|p| !(*p >= policy.min_padding)) {
            return Err(ValidityError::PaddingTooSmall {
                min: policy.min_padding,
            });
        }

        if !(style.text_icon_space >= policy.min_text_icon_space) {
            return Err(ValidityError::TextIconSpaceTooSmall {
                space: style.text_icon_space,
                min: policy.min_text_icon_space,
            });
        }

        if has_text {
            let min = if has_icon {
                policy.min_font_size_with_icon
            } else {
                policy.min_font_size_without_icon
            };
            if !(style.font_size >= min) {
                return Err(ValidityError::FontTooSmall {
                    size: style.font_size,
                    min,
                });
            }
        }

        if has_icon && !(style.icon_size >= policy.min_icon_size) {
            return Err(ValidityError::IconTooSmall {
                size: style.icon_size,
                min: policy.min_icon_size,
            });
        }

        Ok(())
    }

    /// Contrast group: label opacity and label/background similarity.
    pub fn check_contrast(&self, component: &SecurityComponent) -> Result<(), ValidityError> {
        let policy = &self.policy;
        let style = &component.style;
        let has_text = component.has_text();
        let has_icon = component.has_icon();

        if has_text && style.font_color.alpha() < policy.min_visible_alpha {
            return Err(ValidityError::FontTooTransparent {
                alpha: style.font_color.alpha(),
            });
        }
        if has_icon && style.icon_color.alpha() < policy.min_visible_alpha {
            return Err(ValidityError::IconTooTransparent {
                alpha: style.icon_color.alpha(),
            });
        }

        if style.background == BackgroundType::None || style.bg_color.alpha() == 0 {
            return Ok(());
        }

        let insufficient = |fg| {
            is_contrast_insufficient(
                fg,
                style.bg_color,
                policy.color_distance_threshold,
                policy.background_dominance_ratio,
            )
        };
        if has_text && insufficient(style.font_color) {
            return Err(ValidityError::FontContrast);
        }
        if has_icon && insufficient(style.icon_color) {
            return Err(ValidityError::IconContrast);
        }
        Ok(())
    }
}

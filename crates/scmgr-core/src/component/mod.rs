//! Security component data model.
//!
//! A [`SecurityComponent`] is what an application declares about one of its
//! buttons: where it is, what it looks like and which kind of permission it
//! stands for. Every field is attacker-controlled until the validator has
//! checked it.
//!
//! # Wire form
//!
//! Declared info arrives as JSON:
//!
//! ```json
//! {
//!   "type": "save", "text": "save", "icon": "line",
//!   "rect": {"x": 10, "y": 10, "width": 120, "height": 40},
//!   "window_rect": {"x": 0, "y": 0, "width": 400, "height": 800},
//!   "window_id": 7, "display_id": 0,
//!   "style": { "background": "capsule", "font_size": 16, "icon_size": 16,
//!              "text_icon_space": 4,
//!              "padding": {"top": 8, "right": 8, "bottom": 8, "left": 8},
//!              "border_width": 0, "font_color": 4294967295,
//!              "icon_color": 4294967295, "bg_color": 4278190335 }
//! }
//! ```

mod labels;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::labels::{
    ComponentLabels, LocationIcon, LocationText, PasteIcon, PasteText, SaveIcon, SaveText,
};

/// Security component identifier, unique within the service lifetime.
pub type ScId = i32;

/// Sentinel returned when no identifier could be allocated.
pub const INVALID_SC_ID: ScId = -1;

/// First identifier handed out; allocation wraps back here before overflow.
pub const SC_ID_BASE: ScId = 1000;

// =============================================================================
// Kind
// =============================================================================

/// The permission a component stands for. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Location button.
    Location,
    /// Paste button.
    Paste,
    /// Save button.
    Save,
}

/// How a verified click on a kind turns into a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStyle {
    /// Boolean capability held until the owner goes to the background.
    Capability,
    /// Reference-counted grant that expires on its own.
    PerClick,
}

impl ComponentKind {
    /// Parses the numeric kind code used on the IPC surface.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Location),
            2 => Some(Self::Paste),
            3 => Some(Self::Save),
            _ => None,
        }
    }

    /// Returns the numeric kind code used on the IPC surface.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Location => 1,
            Self::Paste => 2,
            Self::Save => 3,
        }
    }

    /// Returns the lower-case name, used for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Paste => "paste",
            Self::Save => "save",
        }
    }

    /// Bit recorded in the first-use consent store.
    #[must_use]
    pub const fn consent_bit(self) -> u32 {
        match self {
            Self::Location => 1,
            Self::Paste => 1 << 1,
            Self::Save => 1 << 2,
        }
    }

    /// Returns the grant style for this kind.
    #[must_use]
    pub const fn grant_style(self) -> GrantStyle {
        match self {
            Self::Location | Self::Paste => GrantStyle::Capability,
            Self::Save => GrantStyle::PerClick,
        }
    }

    /// Returns all kinds.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::Location, Self::Paste, Self::Save]
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Axis-aligned rectangle in device-independent units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// Rectangle with origin `(x, y)`.
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// X coordinate of the right edge.
    #[must_use]
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Y coordinate of the bottom edge.
    #[must_use]
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Width times height.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Centre point as `(x, y)`.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// All coordinates finite, origin non-negative, extent strictly
    /// positive.
    #[must_use]
    pub fn is_positive_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Inclusive point test with `epsilon` tolerance on every edge.
    #[must_use]
    pub fn contains_point(&self, x: f64, y: f64, epsilon: f64) -> bool {
        x >= self.x - epsilon
            && x <= self.right() + epsilon
            && y >= self.y - epsilon
            && y <= self.bottom() + epsilon
    }

    /// Returns `true` if `other` lies fully inside `self` (with tolerance).
    #[must_use]
    pub fn contains_rect(&self, other: &Self, epsilon: f64) -> bool {
        other.x >= self.x - epsilon
            && other.y >= self.y - epsilon
            && other.right() <= self.right() + epsilon
            && other.bottom() <= self.bottom() + epsilon
    }

    /// Strict overlap; rectangles that only share an edge do not intersect.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Scales the rectangle by `scale` about the anchor point `(ax, ay)`.
    #[must_use]
    pub fn scaled_about(&self, ax: f64, ay: f64, scale: f64) -> Self {
        Self {
            x: ax + (self.x - ax) * scale,
            y: ay + (self.y - ay) * scale,
            width: self.width * scale,
            height: self.height * scale,
        }
    }
}

// =============================================================================
// Style
// =============================================================================

/// 32-bit ARGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(pub u32);

impl Color {
    /// Packs the four channels.
    #[must_use]
    pub const fn from_argb(a: u8, r: u8, g: u8, b: u8) -> Self {
        Self(((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32))
    }

    /// Alpha channel, `0` fully transparent.
    #[must_use]
    pub const fn alpha(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Red channel.
    #[must_use]
    pub const fn red(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Green channel.
    #[must_use]
    pub const fn green(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Blue channel.
    #[must_use]
    pub const fn blue(self) -> u8 {
        self.0 as u8
    }

    /// Alpha as a fraction in `[0, 1]`.
    #[must_use]
    pub fn alpha_fraction(self) -> f64 {
        f64::from(self.alpha()) / 255.0
    }
}

/// Padding between the component border and its content.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Padding {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Padding {
    /// Same padding on every side.
    #[must_use]
    pub const fn uniform(value: f64) -> Self {
        Self {
            top: value,
            right: value,
            bottom: value,
            left: value,
        }
    }

    /// `[top, right, bottom, left]`.
    #[must_use]
    pub const fn sides(&self) -> [f64; 4] {
        [self.top, self.right, self.bottom, self.left]
    }
}

/// Per-corner border radius.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BorderRadius {
    pub top_left: f64,
    pub top_right: f64,
    pub bottom_left: f64,
    pub bottom_right: f64,
}

/// Background shape drawn behind the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundType {
    /// No background: the label floats on the host content.
    None,
    #[default]
    Capsule,
    Circle,
    Normal,
}

/// Where the on-screen tip bubble is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipPosition {
    AboveBottom,
    BelowTop,
}

/// Declared visual style.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentStyle {
    #[serde(default)]
    pub background: BackgroundType,
    #[serde(default)]
    pub font_size: f64,
    #[serde(default)]
    pub icon_size: f64,
    #[serde(default)]
    pub text_icon_space: f64,
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub border_width: f64,
    pub font_color: Color,
    pub icon_color: Color,
    pub bg_color: Color,
    #[serde(default)]
    pub border_radius: Option<BorderRadius>,
}

/// Visual effects applied by ancestor views.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ParentEffect {
    /// An ancestor applies opacity, blur or a similar transform.
    #[serde(default)]
    pub has_effect: bool,
    /// An ancestor clips its children.
    #[serde(default)]
    pub is_clipped: bool,
    /// Clip bounds declared by the clipping ancestor.
    #[serde(default)]
    pub clip_rect: Option<Rect>,
}

// =============================================================================
// Component
// =============================================================================

/// One registered UI trust anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityComponent {
    #[serde(flatten)]
    pub labels: ComponentLabels,
    pub rect: Rect,
    pub window_rect: Rect,
    #[serde(default)]
    pub window_id: i32,
    #[serde(default)]
    pub display_id: u64,
    /// Wearable / cross-axis display state, forwarded to the screen oracle.
    #[serde(default)]
    pub cross_axis: bool,
    #[serde(default)]
    pub tip_position: Option<TipPosition>,
    pub style: ComponentStyle,
    #[serde(default)]
    pub parent_effect: ParentEffect,
    /// Result of the last validity check.
    #[serde(skip)]
    pub is_valid: bool,
    /// A permission is currently outstanding for this component.
    #[serde(skip)]
    pub is_grant: bool,
    /// Where the component is actually drawn once the hosting window's
    /// scale is applied. Set by a passing validity check.
    #[serde(skip)]
    pub drawn_rect: Option<Rect>,
}

impl SecurityComponent {
    /// Parses declared JSON info.
    ///
    /// Parsing only establishes shape; validity is decided by the
    /// validator. `is_valid` and `is_grant` always start `false`.
    ///
    /// # Errors
    ///
    /// Returns the decoder error for malformed JSON or an unknown kind.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Rect to hit-test clicks and overlaps against: the drawn rect once
    /// validated, the declared rect before that.
    #[must_use]
    pub fn screen_rect(&self) -> Rect {
        self.drawn_rect.unwrap_or(self.rect)
    }

    /// Kind implied by the labels.
    #[must_use]
    pub const fn kind(&self) -> ComponentKind {
        self.labels.kind()
    }

    /// The component shows a text label.
    #[must_use]
    pub const fn has_text(&self) -> bool {
        self.labels.has_text()
    }

    /// The component shows an icon.
    #[must_use]
    pub const fn has_icon(&self) -> bool {
        self.labels.has_icon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVE_JSON: &str = r#"{
        "type": "save", "text": "save", "icon": "line",
        "rect": {"x": 10, "y": 10, "width": 120, "height": 40},
        "window_rect": {"x": 0, "y": 0, "width": 400, "height": 800},
        "window_id": 7,
        "style": {"background": "capsule", "font_size": 16, "icon_size": 16,
                  "text_icon_space": 4,
                  "padding": {"top": 8, "right": 8, "bottom": 8, "left": 8},
                  "font_color": 4294967295, "icon_color": 4294967295,
                  "bg_color": 4278190335}
    }"#;

    #[test]
    fn test_parse_declared_info() {
        let component = SecurityComponent::from_json(SAVE_JSON).unwrap();
        assert_eq!(component.kind(), ComponentKind::Save);
        assert_eq!(component.window_id, 7);
        assert_eq!(component.rect, Rect::new(10.0, 10.0, 120.0, 40.0));
        assert_eq!(component.style.background, BackgroundType::Capsule);
        assert_eq!(component.style.bg_color, Color(0xFF00_00FF));
        assert!(!component.is_valid);
        assert!(!component.is_grant);
        assert_eq!(component.drawn_rect, None);
        assert_eq!(component.screen_rect(), component.rect);
    }

    #[test]
    fn test_parse_unknown_kind_rejected() {
        let raw = SAVE_JSON.replace(
            "\"save\", \"text\": \"save\"",
            "\"camera\", \"text\": \"save\"",
        );
        assert!(SecurityComponent::from_json(&raw).is_err());
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for kind in ComponentKind::all() {
            assert_eq!(ComponentKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ComponentKind::from_code(0), None);
        assert_eq!(ComponentKind::from_code(-3), None);
    }

    #[test]
    fn test_consent_bits_are_distinct() {
        let mask = ComponentKind::all()
            .iter()
            .fold(0u32, |acc, k| acc | k.consent_bit());
        assert_eq!(mask.count_ones(), 3);
    }

    #[test]
    fn test_color_channels() {
        let c = Color::from_argb(0x80, 0x11, 0x22, 0x33);
        assert_eq!(c.0, 0x8011_2233);
        assert_eq!(c.alpha(), 0x80);
        assert_eq!(c.red(), 0x11);
        assert_eq!(c.green(), 0x22);
        assert_eq!(c.blue(), 0x33);
    }

    #[test]
    fn test_rect_intersection_excludes_shared_edge() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(10.0, 0.0, 10.0, 10.0);
        let c = Rect::new(9.0, 9.0, 5.0, 5.0);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(c.intersects(&a));
    }

    #[test]
    fn test_rect_contains_point_with_epsilon() {
        let r = Rect::new(10.0, 10.0, 20.0, 20.0);
        assert!(r.contains_point(10.0, 10.0, 0.0));
        assert!(r.contains_point(30.0, 30.0, 0.0));
        assert!(r.contains_point(30.0005, 30.0, 0.001));
        assert!(!r.contains_point(30.01, 30.0, 0.001));
    }

    #[test]
    fn test_rect_scaled_about_anchor() {
        let r = Rect::new(10.0, 20.0, 100.0, 50.0);
        let s = r.scaled_about(0.0, 0.0, 0.5);
        assert_eq!(s, Rect::new(5.0, 10.0, 50.0, 25.0));
        let unchanged = r.scaled_about(10.0, 20.0, 1.0);
        assert_eq!(unchanged, r);
    }
}

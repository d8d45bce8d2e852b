//! Window occlusion check.
//!
//! A component is covered if any other window whose (floating-scaled) rect
//! intersects it sits at the same or a higher layer than the component's
//! own window. A component whose window is missing from the snapshot is
//! treated as covered.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::Rect;

/// One entry of the window-manager snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub window_id: i32,
    pub rect: Rect,
    /// Z-order; larger is closer to the user.
    pub layer: i32,
    /// Scale applied to floating windows, anchored at their top-left.
    #[serde(default = "default_floating_scale")]
    pub floating_scale: f64,
}

const fn default_floating_scale() -> f64 {
    1.0
}

impl WindowInfo {
    #[must_use]
    pub const fn new(window_id: i32, rect: Rect, layer: i32) -> Self {
        Self {
            window_id,
            rect,
            layer,
            floating_scale: 1.0,
        }
    }

    /// Rect as actually drawn. A bogus scale falls back to the declared
    /// rect rather than shrinking the window out of the way.
    #[must_use]
    pub fn effective_rect(&self) -> Rect {
        let scale = self.floating_scale;
        if scale.is_finite() && scale > 0.0 {
            self.rect.scaled_about(self.rect.x, self.rect.y, scale)
        } else {
            self.rect
        }
    }
}

/// Decides which windows are exempt from the occlusion check.
pub trait WindowClassifier: Send + Sync {
    /// UI-extension windows are checked by their host instead.
    fn is_ui_extension(&self, window_id: i32) -> bool;
}

/// Classifies UI-extension windows by a bit mask over the window id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskClassifier {
    mask: u32,
}

/// Default UI-extension window id bit.
pub const DEFAULT_UI_EXTENSION_MASK: u32 = 0x4000_0000;

impl MaskClassifier {
    #[must_use]
    pub const fn new(mask: u32) -> Self {
        Self { mask }
    }
}

impl Default for MaskClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_UI_EXTENSION_MASK)
    }
}

impl WindowClassifier for MaskClassifier {
    #[allow(clippy::cast_sign_loss)]
    fn is_ui_extension(&self, window_id: i32) -> bool {
        self.mask != 0 && (window_id as u32) & self.mask == self.mask
    }
}

/// Why a component is considered covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Occlusion {
    #[error("window {window_id} not found in the window snapshot")]
    WindowMissing { window_id: i32 },

    #[error("covered by window {by_window} at layer {by_layer} (own layer {own_layer})")]
    CoveredBy {
        by_window: i32,
        by_layer: i32,
        own_layer: i32,
    },
}

/// Window-stack occlusion checker.
#[derive(Clone)]
pub struct WindowOcclusionChecker {
    classifier: Arc<dyn WindowClassifier>,
}

impl fmt::Debug for WindowOcclusionChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowOcclusionChecker").finish_non_exhaustive()
    }
}

impl Default for WindowOcclusionChecker {
    fn default() -> Self {
        Self::new(Arc::new(MaskClassifier::default()))
    }
}

impl WindowOcclusionChecker {
    #[must_use]
    pub fn new(classifier: Arc<dyn WindowClassifier>) -> Self {
        Self { classifier }
    }

    /// Returns `Ok(())` if nothing covers `rect`, or the reason it is
    /// covered.
    pub fn check(
        &self,
        window_id: i32,
        rect: &Rect,
        snapshot: &[WindowInfo],
    ) -> Result<(), Occlusion> {
        if self.classifier.is_ui_extension(window_id) {
            return Ok(());
        }

        let Some(own) = snapshot.iter().find(|w| w.window_id == window_id) else {
            return Err(Occlusion::WindowMissing { window_id });
        };
        let own_layer = own.layer;

        snapshot
            .iter()
            .filter(|w| w.window_id != window_id)
            .filter(|w| w.effective_rect().intersects(rect))
            .find(|w| w.layer >= own_layer)
            .map_or(Ok(()), |w| {
                Err(Occlusion::CoveredBy {
                    by_window: w.window_id,
                    by_layer: w.layer,
                    own_layer,
                })
            })
    }

    #[must_use]
    pub fn is_covered(&self, window_id: i32, rect: &Rect, snapshot: &[WindowInfo]) -> bool {
        self.check(window_id, rect, snapshot).is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUTTON: Rect = Rect::new(100.0, 100.0, 100.0, 40.0);

    fn app_window() -> WindowInfo {
        WindowInfo::new(1, Rect::new(0.0, 0.0, 1000.0, 2000.0), 10)
    }

    #[test]
    fn test_uncovered_component() {
        let checker = WindowOcclusionChecker::default();
        let snapshot = [
            app_window(),
            // Below the app window.
            WindowInfo::new(2, Rect::new(0.0, 0.0, 1000.0, 2000.0), 5),
            // Above, but elsewhere on screen.
            WindowInfo::new(3, Rect::new(500.0, 500.0, 100.0, 100.0), 20),
        ];
        assert!(!checker.is_covered(1, &BUTTON, &snapshot));
    }

    #[test]
    fn test_higher_intersecting_window_covers() {
        let checker = WindowOcclusionChecker::default();
        let snapshot = [
            app_window(),
            WindowInfo::new(4, Rect::new(150.0, 120.0, 10.0, 10.0), 11),
        ];
        assert_eq!(
            checker.check(1, &BUTTON, &snapshot),
            Err(Occlusion::CoveredBy {
                by_window: 4,
                by_layer: 11,
                own_layer: 10
            })
        );
    }

    #[test]
    fn test_equal_layer_covers() {
        let checker = WindowOcclusionChecker::default();
        let snapshot = [
            app_window(),
            WindowInfo::new(5, Rect::new(0.0, 0.0, 150.0, 150.0), 10),
        ];
        assert!(checker.is_covered(1, &BUTTON, &snapshot));
    }

    #[test]
    fn test_missing_own_window_fails_closed() {
        let checker = WindowOcclusionChecker::default();
        let snapshot = [WindowInfo::new(9, Rect::new(0.0, 0.0, 10.0, 10.0), 1)];
        assert_eq!(
            checker.check(1, &BUTTON, &snapshot),
            Err(Occlusion::WindowMissing { window_id: 1 })
        );
        assert!(checker.is_covered(1, &BUTTON, &[]));
    }

    #[test]
    fn test_floating_scale_applied_before_intersection() {
        let checker = WindowOcclusionChecker::default();
        // Declared rect would cover the button, but the window is drawn at
        // a quarter size in the top-left corner.
        let mut floating = WindowInfo::new(6, Rect::new(0.0, 0.0, 300.0, 300.0), 50);
        floating.floating_scale = 0.25;
        let snapshot = [app_window(), floating];
        assert!(!checker.is_covered(1, &BUTTON, &snapshot));

        floating.floating_scale = 1.0;
        let snapshot = [app_window(), floating];
        assert!(checker.is_covered(1, &BUTTON, &snapshot));
    }

    #[test]
    fn test_ui_extension_window_exempt() {
        let checker = WindowOcclusionChecker::default();
        let ext_id = 0x4000_0007;
        // Not even present in the snapshot.
        assert!(!checker.is_covered(ext_id, &BUTTON, &[]));
    }

    #[test]
    fn test_injected_classifier() {
        struct NoExtensions;
        impl WindowClassifier for NoExtensions {
            fn is_ui_extension(&self, _window_id: i32) -> bool {
                false
            }
        }
        let checker = WindowOcclusionChecker::new(Arc::new(NoExtensions));
        assert!(checker.is_covered(0x4000_0007, &BUTTON, &[]));
    }

    #[test]
    fn test_zero_mask_disables_exemption() {
        let classifier = MaskClassifier::new(0);
        assert!(!classifier.is_ui_extension(0x4000_0007));
        assert!(!classifier.is_ui_extension(0));
    }
}

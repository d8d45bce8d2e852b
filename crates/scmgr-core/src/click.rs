//! Click verification.
//!
//! A reported click is trusted only if it is recent, hits the component,
//! and (for pointer clicks) the component is not covered by another
//! window. Key clicks must use a confirming key. Accessibility clicks only
//! need a fresh timestamp here; the caller vets the reporting channel.
//!
//! Timestamps are accepted in `[now - window, now]`. Future timestamps are
//! never accepted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::SecurityComponent;
use crate::config::ServiceConfig;
use crate::occlusion::{Occlusion, WindowInfo, WindowOcclusionChecker};

/// Space key.
pub const KEYCODE_SPACE: i32 = 2050;
/// Enter key.
pub const KEYCODE_ENTER: i32 = 2054;
/// Numeric-pad enter key.
pub const KEYCODE_NUMPAD_ENTER: i32 = 2124;

/// Default replay window, in milliseconds.
pub const DEFAULT_CLICK_WINDOW_MS: u64 = 1_000;

/// Default upper bound for the opaque extra-info payload.
pub const DEFAULT_MAX_EXTRA_INFO_LEN: usize = 0x1000;

/// Pointer click in screen coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEvent {
    pub timestamp_ms: u64,
    pub x: f64,
    pub y: f64,
    /// Opaque payload attached by the verified input path.
    #[serde(default)]
    pub extra_info: Option<Vec<u8>>,
}

/// Key press while the component has focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub timestamp_ms: u64,
    pub key_code: i32,
}

/// Click delivered by an accessibility service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityEvent {
    pub timestamp_ms: u64,
}

/// Reported click event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClickEvent {
    Point(PointEvent),
    Key(KeyEvent),
    Accessibility(AccessibilityEvent),
}

impl ClickEvent {
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Point(e) => e.timestamp_ms,
            Self::Key(e) => e.timestamp_ms,
            Self::Accessibility(e) => e.timestamp_ms,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Point(_) => "point",
            Self::Key(_) => "key",
            Self::Accessibility(_) => "accessibility",
        }
    }
}

/// Why a click was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClickRejection {
    #[error("timestamp {timestamp_ms} outside the accepted window (now {now_ms})")]
    InvalidTimestamp { timestamp_ms: u64, now_ms: u64 },

    #[error("point ({x}, {y}) misses the component")]
    Miss { x: f64, y: f64 },

    #[error("component is occluded: {0}")]
    Occluded(Occlusion),

    #[error("extra info is present but empty")]
    MissingExtraData,

    #[error("extra info is {len} bytes, limit is {max}")]
    ExtraDataTooLarge { len: usize, max: usize },

    #[error("key code {key_code} cannot click a security component")]
    BadKey { key_code: i32 },

    #[error("accessibility click from an untrusted channel")]
    UntrustedChannel,
}

impl ClickRejection {
    /// Rejections that indicate a forged or replayed event rather than an
    /// honest race. The owning process is quarantined for these.
    #[must_use]
    pub const fn is_tampering(&self) -> bool {
        matches!(self, Self::InvalidTimestamp { .. } | Self::MissingExtraData)
    }

    /// Short code for logs and metric labels.
    #[must_use]
    pub const fn as_code(&self) -> &'static str {
        match self {
            Self::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
            Self::Miss { .. } => "MISS",
            Self::Occluded(_) => "OCCLUDED",
            Self::MissingExtraData => "MISSING_EXTRA_DATA",
            Self::ExtraDataTooLarge { .. } => "EXTRA_DATA_TOO_LARGE",
            Self::BadKey { .. } => "BAD_KEY",
            Self::UntrustedChannel => "UNTRUSTED_CHANNEL",
        }
    }
}

/// Tunables for click verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickPolicy {
    pub window_ms: u64,
    pub allowed_keys: Vec<i32>,
    pub max_extra_info_len: usize,
    /// Reject pointer clicks that carry no extra info at all.
    pub require_extra_info: bool,
}

impl Default for ClickPolicy {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_CLICK_WINDOW_MS,
            allowed_keys: vec![KEYCODE_SPACE, KEYCODE_ENTER, KEYCODE_NUMPAD_ENTER],
            max_extra_info_len: DEFAULT_MAX_EXTRA_INFO_LEN,
            require_extra_info: false,
        }
    }
}

impl ClickPolicy {
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            window_ms: config.timing.click_window_ms,
            allowed_keys: vec![KEYCODE_SPACE, KEYCODE_ENTER, KEYCODE_NUMPAD_ENTER],
            max_extra_info_len: config.limits.max_extra_info_len,
            require_extra_info: config.limits.require_extra_info,
        }
    }
}

/// Stateless click verifier.
#[derive(Debug, Clone)]
pub struct ClickVerifier {
    policy: ClickPolicy,
    occlusion: WindowOcclusionChecker,
    epsilon: f64,
}

impl ClickVerifier {
    #[must_use]
    pub const fn new(policy: ClickPolicy, occlusion: WindowOcclusionChecker, epsilon: f64) -> Self {
        Self {
            policy,
            occlusion,
            epsilon,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &ClickPolicy {
        &self.policy
    }

    /// Verifies `event` against `component`.
    ///
    /// `snapshot` is only consulted for pointer clicks.
    pub fn check_click(
        &self,
        component: &SecurityComponent,
        event: &ClickEvent,
        now_ms: u64,
        snapshot: &[WindowInfo],
    ) -> Result<(), ClickRejection> {
        self.check_timestamp(event.timestamp_ms(), now_ms)?;
        match event {
            ClickEvent::Point(point) => self.check_point(component, point, snapshot),
            ClickEvent::Key(key) => self.check_key(key),
            ClickEvent::Accessibility(_) => Ok(()),
        }
    }

    /// Accepts `timestamp_ms` in `[now_ms - window, now_ms]`.
    pub fn check_timestamp(&self, timestamp_ms: u64, now_ms: u64) -> Result<(), ClickRejection> {
        let earliest = now_ms.saturating_sub(self.policy.window_ms);
        if timestamp_ms < earliest || timestamp_ms > now_ms {
            return Err(ClickRejection::InvalidTimestamp {
                timestamp_ms,
                now_ms,
            });
        }
        Ok(())
    }

    fn check_point(
        &self,
        component: &SecurityComponent,
        point: &PointEvent,
        snapshot: &[WindowInfo],
    ) -> Result<(), ClickRejection> {
        let rect = component.screen_rect();
        if !rect.contains_point(point.x, point.y, self.epsilon) {
            return Err(ClickRejection::Miss {
                x: point.x,
                y: point.y,
            });
        }

        self.occlusion
            .check(component.window_id, &rect, snapshot)
            .map_err(ClickRejection::Occluded)?;

        match &point.extra_info {
            Some(data) if data.is_empty() => Err(ClickRejection::MissingExtraData),
            Some(data) if data.len() > self.policy.max_extra_info_len => {
                Err(ClickRejection::ExtraDataTooLarge {
                    len: data.len(),
                    max: self.policy.max_extra_info_len,
                })
            },
            None if self.policy.require_extra_info => Err(ClickRejection::MissingExtraData),
            _ => Ok(()),
        }
    }

    fn check_key(&self, key: &KeyEvent) -> Result<(), ClickRejection> {
        if self.policy.allowed_keys.contains(&key.key_code) {
            Ok(())
        } else {
            Err(ClickRejection::BadKey {
                key_code: key.key_code,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::component::{
        BackgroundType, Color, ComponentLabels, ComponentStyle, Padding, ParentEffect, Rect,
        SaveText,
    };

    const NOW: u64 = 1_700_000_000_000;

    fn component() -> SecurityComponent {
        SecurityComponent {
            labels: ComponentLabels::Save {
                text: Some(SaveText::Save),
                icon: None,
            },
            rect: Rect::new(100.0, 100.0, 100.0, 40.0),
            window_rect: Rect::new(0.0, 0.0, 1000.0, 2000.0),
            window_id: 1,
            display_id: 0,
            cross_axis: false,
            tip_position: None,
            style: ComponentStyle {
                background: BackgroundType::Capsule,
                font_size: 16.0,
                icon_size: 16.0,
                text_icon_space: 4.0,
                padding: Padding::uniform(8.0),
                border_width: 0.0,
                font_color: Color(0xFFFF_FFFF),
                icon_color: Color(0xFFFF_FFFF),
                bg_color: Color(0xFF00_7DFF),
                border_radius: None,
            },
            parent_effect: ParentEffect::default(),
            is_valid: true,
            is_grant: false,
            drawn_rect: None,
        }
    }

    fn snapshot() -> Vec<WindowInfo> {
        vec![WindowInfo::new(1, Rect::new(0.0, 0.0, 1000.0, 2000.0), 10)]
    }

    fn verifier() -> ClickVerifier {
        ClickVerifier::new(
            ClickPolicy::default(),
            WindowOcclusionChecker::default(),
            0.001,
        )
    }

    fn point(timestamp_ms: u64, x: f64, y: f64, extra: Option<Vec<u8>>) -> ClickEvent {
        ClickEvent::Point(PointEvent {
            timestamp_ms,
            x,
            y,
            extra_info: extra,
        })
    }

    #[test]
    fn test_valid_point_click() {
        let event = point(NOW - 10, 150.0, 120.0, Some(vec![1, 2, 3]));
        verifier()
            .check_click(&component(), &event, NOW, &snapshot())
            .unwrap();
    }

    #[test]
    fn test_timestamp_window_boundaries() {
        let v = verifier();
        let window = v.policy().window_ms;
        assert!(v.check_timestamp(NOW, NOW).is_ok());
        assert!(v.check_timestamp(NOW - 1, NOW).is_ok());
        assert!(v.check_timestamp(NOW - window, NOW).is_ok());
        assert!(v.check_timestamp(NOW - window - 1, NOW).is_err());
        assert!(v.check_timestamp(NOW + 1, NOW).is_err());
    }

    #[test]
    fn test_stale_click_rejected_even_when_hitting() {
        let event = point(NOW - 5_000, 150.0, 120.0, Some(vec![1]));
        let err = verifier()
            .check_click(&component(), &event, NOW, &snapshot())
            .unwrap_err();
        assert!(matches!(err, ClickRejection::InvalidTimestamp { .. }));
        assert!(err.is_tampering());
    }

    #[test]
    fn test_miss_rejected() {
        let event = point(NOW, 250.0, 120.0, Some(vec![1]));
        let err = verifier()
            .check_click(&component(), &event, NOW, &snapshot())
            .unwrap_err();
        assert!(matches!(err, ClickRejection::Miss { .. }));
        assert!(!err.is_tampering());
    }

    #[test]
    fn test_point_checked_against_drawn_rect() {
        // Declared at (100, 100, 100, 40), drawn at half scale.
        let mut scaled = component();
        scaled.drawn_rect = Some(Rect::new(50.0, 50.0, 50.0, 20.0));
        let v = verifier();

        let on_drawn = point(NOW, 75.0, 60.0, Some(vec![1]));
        v.check_click(&scaled, &on_drawn, NOW, &snapshot()).unwrap();

        let on_declared = point(NOW, 150.0, 120.0, Some(vec![1]));
        assert!(matches!(
            v.check_click(&scaled, &on_declared, NOW, &snapshot()),
            Err(ClickRejection::Miss { .. })
        ));

        // A window over the drawn rect covers it, one over the declared
        // rect does not.
        let mut windows = snapshot();
        windows.push(WindowInfo::new(2, Rect::new(150.0, 110.0, 40.0, 20.0), 30));
        v.check_click(&scaled, &on_drawn, NOW, &windows).unwrap();
        windows.push(WindowInfo::new(3, Rect::new(60.0, 55.0, 10.0, 10.0), 30));
        assert!(matches!(
            v.check_click(&scaled, &on_drawn, NOW, &windows),
            Err(ClickRejection::Occluded(_))
        ));
    }

    #[test]
    fn test_edge_hit_within_epsilon() {
        let event = point(NOW, 200.0005, 140.0, None);
        verifier()
            .check_click(&component(), &event, NOW, &snapshot())
            .unwrap();
    }

    #[test]
    fn test_occluded_click_rejected() {
        let mut windows = snapshot();
        windows.push(WindowInfo::new(2, Rect::new(90.0, 90.0, 50.0, 50.0), 30));
        let event = point(NOW, 150.0, 120.0, Some(vec![1]));
        let err = verifier()
            .check_click(&component(), &event, NOW, &windows)
            .unwrap_err();
        assert!(matches!(err, ClickRejection::Occluded(_)));
    }

    #[test]
    fn test_empty_extra_info_rejected() {
        let event = point(NOW, 150.0, 120.0, Some(Vec::new()));
        let err = verifier()
            .check_click(&component(), &event, NOW, &snapshot())
            .unwrap_err();
        assert_eq!(err, ClickRejection::MissingExtraData);
        assert!(err.is_tampering());
    }

    #[test]
    fn test_oversized_extra_info_rejected() {
        let event = point(
            NOW,
            150.0,
            120.0,
            Some(vec![0; DEFAULT_MAX_EXTRA_INFO_LEN + 1]),
        );
        assert!(matches!(
            verifier().check_click(&component(), &event, NOW, &snapshot()),
            Err(ClickRejection::ExtraDataTooLarge { .. })
        ));
    }

    #[test]
    fn test_absent_extra_info_when_required() {
        let policy = ClickPolicy {
            require_extra_info: true,
            ..ClickPolicy::default()
        };
        let v = ClickVerifier::new(policy, WindowOcclusionChecker::default(), 0.001);
        let event = point(NOW, 150.0, 120.0, None);
        assert_eq!(
            v.check_click(&component(), &event, NOW, &snapshot()),
            Err(ClickRejection::MissingExtraData)
        );
    }

    #[test]
    fn test_key_allow_list() {
        let v = verifier();
        for key_code in [KEYCODE_SPACE, KEYCODE_ENTER, KEYCODE_NUMPAD_ENTER] {
            let event = ClickEvent::Key(KeyEvent {
                timestamp_ms: NOW - 1,
                key_code,
            });
            v.check_click(&component(), &event, NOW, &[]).unwrap();
        }
        let event = ClickEvent::Key(KeyEvent {
            timestamp_ms: NOW - 1,
            key_code: 2017,
        });
        assert_eq!(
            v.check_click(&component(), &event, NOW, &[]),
            Err(ClickRejection::BadKey { key_code: 2017 })
        );
    }

    #[test]
    fn test_key_future_timestamp_rejected() {
        let event = ClickEvent::Key(KeyEvent {
            timestamp_ms: NOW + 1,
            key_code: KEYCODE_ENTER,
        });
        assert!(matches!(
            verifier().check_click(&component(), &event, NOW, &[]),
            Err(ClickRejection::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_accessibility_only_checks_time() {
        let v = verifier();
        let fresh = ClickEvent::Accessibility(AccessibilityEvent { timestamp_ms: NOW });
        v.check_click(&component(), &fresh, NOW, &[]).unwrap();
        let stale = ClickEvent::Accessibility(AccessibilityEvent { timestamp_ms: 0 });
        assert!(v.check_click(&component(), &stale, NOW, &[]).is_err());
    }

    #[test]
    fn test_click_event_json_shape() {
        let event: ClickEvent = serde_json::from_str(
            r#"{"kind":"point","timestamp_ms":5,"x":1.5,"y":2.0,"extra_info":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(event.timestamp_ms(), 5);
        assert_eq!(event.kind_str(), "point");
    }

    proptest! {
        #[test]
        fn prop_timestamp_accepted_iff_in_window(offset in -3_000i64..3_000) {
            let v = verifier();
            let ts = NOW.checked_add_signed(offset).unwrap();
            let accepted = v.check_timestamp(ts, NOW).is_ok();
            prop_assert_eq!(accepted, (-1_000..=0).contains(&offset));
        }

        #[test]
        fn prop_points_outside_rect_miss(x in -1_000.0f64..1_000.0, y in -1_000.0f64..1_000.0) {
            let c = component();
            let inside = c.rect.contains_point(x, y, 0.001);
            let event = point(NOW, x, y, Some(vec![7]));
            let result = verifier().check_click(&c, &event, NOW, &snapshot());
            prop_assert_eq!(result.is_ok(), inside);
        }
    }
}

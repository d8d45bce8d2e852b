//! scmgr-core - trust rules for screen-anchored security components.
//!
//! Untrusted applications declare location, paste and save buttons
//! ("security components"). A click on one of them yields a short-lived,
//! narrowly-scoped permission, but only if the button is visually truthful,
//! unobstructed and the click demonstrably came from the user. This crate
//! holds the pure, lock-free parts of that decision:
//!
//! - [`component`]: the declared component model (geometry, style, labels)
//! - [`color`]: HSV projection and colour-similarity maths
//! - [`validator`]: geometry, size and contrast validity rules
//! - [`occlusion`]: window-stack occlusion check
//! - [`click`]: point/key/accessibility click verification
//! - [`oracle`]: traits for the OS services consulted by the daemon
//! - [`config`]: service configuration (TOML)
//! - [`error`]: the service-wide error taxonomy
//!
//! Stateful pieces (registry, permission grants, timers) live in
//! `scmgr-daemon`.

pub mod click;
pub mod color;
pub mod component;
pub mod config;
pub mod error;
pub mod occlusion;
pub mod oracle;
pub mod validator;

pub use click::{ClickEvent, ClickPolicy, ClickRejection, ClickVerifier};
pub use component::{ComponentKind, ComponentLabels, Rect, ScId, SecurityComponent};
pub use config::ServiceConfig;
pub use error::{ErrorCode, ScError, ScResult};
pub use occlusion::{WindowInfo, WindowOcclusionChecker};
pub use validator::{ContrastAndGeometryValidator, ValidationContext, ValidityError};

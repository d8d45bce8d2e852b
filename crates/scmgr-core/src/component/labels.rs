//! Kind-specific text and icon labels.
//!
//! Each component kind only accepts its own enumerated labels. Encoding the
//! kind as the enum tag makes a "save" text on a "location" button
//! unrepresentable after parsing.

use serde::{Deserialize, Serialize};

use super::ComponentKind;

/// Text labels accepted on a location button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationText {
    CurrentLocation,
    AddLocation,
    SelectLocation,
    ShareLocation,
    SendLocation,
    Locating,
    Location,
    SendCurrentLocation,
    Relocation,
    PunchIn,
    CurrentPosition,
}

/// Icon labels accepted on a location button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationIcon {
    Filled,
    Line,
}

/// Text labels accepted on a paste button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasteText {
    Paste,
}

/// Icon labels accepted on a paste button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasteIcon {
    Line,
}

/// Text labels accepted on a save button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveText {
    Download,
    DownloadFile,
    Save,
    SaveImage,
    SaveFile,
    DownloadAndShare,
    Receive,
    ContinueToReceive,
}

/// Icon labels accepted on a save button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveIcon {
    Filled,
    Line,
}

/// Kind tag plus the kind's text/icon labels.
///
/// Serialized internally tagged as `"type": "location" | "paste" | "save"`;
/// an absent `text`/`icon` means the label is not shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentLabels {
    Location {
        #[serde(default)]
        text: Option<LocationText>,
        #[serde(default)]
        icon: Option<LocationIcon>,
    },
    Paste {
        #[serde(default)]
        text: Option<PasteText>,
        #[serde(default)]
        icon: Option<PasteIcon>,
    },
    Save {
        #[serde(default)]
        text: Option<SaveText>,
        #[serde(default)]
        icon: Option<SaveIcon>,
    },
}

impl ComponentLabels {
    /// Returns the component kind encoded by the tag.
    #[must_use]
    pub const fn kind(&self) -> ComponentKind {
        match self {
            Self::Location { .. } => ComponentKind::Location,
            Self::Paste { .. } => ComponentKind::Paste,
            Self::Save { .. } => ComponentKind::Save,
        }
    }

    /// Returns `true` if a text label is shown.
    #[must_use]
    pub const fn has_text(&self) -> bool {
        match self {
            Self::Location { text, .. } => text.is_some(),
            Self::Paste { text, .. } => text.is_some(),
            Self::Save { text, .. } => text.is_some(),
        }
    }

    /// Returns `true` if an icon is shown.
    #[must_use]
    pub const fn has_icon(&self) -> bool {
        match self {
            Self::Location { icon, .. } => icon.is_some(),
            Self::Paste { icon, .. } => icon.is_some(),
            Self::Save { icon, .. } => icon.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_parse_per_kind() {
        let labels: ComponentLabels =
            serde_json::from_str(r#"{"type":"save","text":"save_image","icon":"filled"}"#)
                .unwrap();
        assert_eq!(labels.kind(), ComponentKind::Save);
        assert!(labels.has_text());
        assert!(labels.has_icon());
    }

    #[test]
    fn test_foreign_label_rejected() {
        // "paste" is not a save text.
        let result: Result<ComponentLabels, _> =
            serde_json::from_str(r#"{"type":"save","text":"paste"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_absent_labels() {
        let labels: ComponentLabels = serde_json::from_str(r#"{"type":"paste"}"#).unwrap();
        assert!(!labels.has_text());
        assert!(!labels.has_icon());
    }
}

//! Scene frame geometry derived from the requested aspect ratio.

use serde::{Deserialize, Serialize};

/// Output aspect ratio accepted by the renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    /// Parse a caller-supplied value. Unknown values fall back to 16:9.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("9:16") => Self::Portrait,
            Some("1:1") => Self::Square,
            _ => Self::Landscape,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Square => "1:1",
        }
    }

    pub fn frame_config(&self) -> FrameConfig {
        match self {
            Self::Landscape => FrameConfig {
                pixel_width: 3840,
                pixel_height: 2160,
                logical_width: 14.22,
            },
            Self::Portrait => FrameConfig {
                pixel_width: 1080,
                pixel_height: 1920,
                logical_width: 8.0,
            },
            Self::Square => FrameConfig {
                pixel_width: 1080,
                pixel_height: 1080,
                logical_width: 8.0,
            },
        }
    }
}

/// Pixel size and scene-unit width for one render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameConfig {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub logical_width: f64,
}

/// Prefix the user's scene code with imports and frame configuration.
pub fn render_source(code: &str, frame: &FrameConfig) -> String {
    format!(
        "from manim import *\nfrom math import *\nconfig.frame_size = ({}, {})\nconfig.frame_width = {}\n\n{}",
        frame.pixel_width,
        frame.pixel_height,
        format_float(frame.logical_width),
        code
    )
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Predefined ArUco dictionaries usable for the board markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dictionary {
    #[serde(rename = "DICT_4X4_50")]
    Dict4x4_50,
    #[serde(rename = "DICT_4X4_250")]
    Dict4x4_250,
    #[serde(rename = "DICT_5X5_100")]
    Dict5x5_100,
    #[serde(rename = "DICT_5X5_250")]
    Dict5x5_250,
    #[serde(rename = "DICT_6X6_250")]
    Dict6x6_250,
    #[serde(rename = "DICT_7X7_250")]
    Dict7x7_250,
}

/// Geometry of the ChArUco board used for both generation and detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSpec {
    pub squares_x: u8,
    pub squares_y: u8,
    /// Side of a chessboard square (any unit, only the ratio matters here)
    pub square_length: f32,
    pub marker_length: f32,
    pub dictionary: Dictionary,
}

impl Default for BoardSpec {
    fn default() -> Self {
        Self {
            squares_x: 7,
            squares_y: 7,
            square_length: 0.3,
            marker_length: 0.18,
            dictionary: Dictionary::Dict6x6_250,
        }
    }
}

impl BoardSpec {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn load_or_default(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Number of inner chessboard corners, the most a single view can yield.
    pub fn max_corners(&self) -> usize {
        (self.squares_x.saturating_sub(1) as usize) * (self.squares_y.saturating_sub(1) as usize)
    }
}

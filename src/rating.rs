//! Valoración por estrellas y su traducción a la escala NPS (0-10).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("La valoración debe estar entre 1 y 5 estrellas (recibido {0})")]
pub struct InvalidRating(pub u8);

/// Número de estrellas elegido por el usuario (1-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct StarRating(u8);

impl StarRating {
    pub fn stars(self) -> u8 {
        self.0
    }

    /// Tabla fija: 1→2, 2→4, 3→6, 4→8, 5→10.
    pub fn nps_score(self) -> u8 {
        match self.0 {
            1 => 2,
            2 => 4,
            3 => 6,
            4 => 8,
            _ => 10,
        }
    }

    pub fn category(self) -> NpsCategory {
        NpsCategory::from_score(self.nps_score())
    }
}

impl TryFrom<u8> for StarRating {
    type Error = InvalidRating;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidRating(value))
        }
    }
}

impl From<StarRating> for u8 {
    fn from(rating: StarRating) -> Self {
        rating.0
    }
}

impl fmt::Display for StarRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}★", self.0)
    }
}

/// Segmento NPS clásico de una puntuación 0-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpsCategory {
    Detractor,
    Passive,
    Promoter,
}

impl NpsCategory {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=6 => Self::Detractor,
            7..=8 => Self::Passive,
            _ => Self::Promoter,
        }
    }
}

impl fmt::Display for NpsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Detractor => "Detractor",
            Self::Passive => "Passive",
            Self::Promoter => "Promoter",
        };
        f.write_str(label)
    }
}

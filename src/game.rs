use std::fmt;

use serde::{Deserialize, Serialize};

/// Which game's engine declarations a unit is compiled against.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum GameVariant {
    #[default]
    K1,
    K2,
}

impl GameVariant {
    pub fn builtin_declarations(self) -> &'static str {
        match self {
            GameVariant::K1 => include_str!("../data/k1_nwscript.nss"),
            GameVariant::K2 => include_str!("../data/k2_nwscript.nss"),
        }
    }
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameVariant::K1 => f.write_str("k1"),
            GameVariant::K2 => f.write_str("k2"),
        }
    }
}

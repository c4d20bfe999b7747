//! Dynamic World land-cover classes.
use serde::{Deserialize, Serialize};

/// The nine classes of the Dynamic World `label` band, by class code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandCoverClass {
    Water = 0,
    Trees = 1,
    Grass = 2,
    FloodedVegetation = 3,
    Crops = 4,
    ShrubAndScrub = 5,
    Built = 6,
    Bare = 7,
    SnowAndIce = 8,
}

impl LandCoverClass {
    pub const ALL: [LandCoverClass; 9] = [
        LandCoverClass::Water,
        LandCoverClass::Trees,
        LandCoverClass::Grass,
        LandCoverClass::FloodedVegetation,
        LandCoverClass::Crops,
        LandCoverClass::ShrubAndScrub,
        LandCoverClass::Built,
        LandCoverClass::Bare,
        LandCoverClass::SnowAndIce,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(code).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            LandCoverClass::Water => "water",
            LandCoverClass::Trees => "trees",
            LandCoverClass::Grass => "grass",
            LandCoverClass::FloodedVegetation => "flooded_vegetation",
            LandCoverClass::Crops => "crops",
            LandCoverClass::ShrubAndScrub => "shrub_and_scrub",
            LandCoverClass::Built => "built",
            LandCoverClass::Bare => "bare",
            LandCoverClass::SnowAndIce => "snow_and_ice",
        }
    }
}

/// Class codes of every Dynamic World class, ascending.
pub fn all_codes() -> Vec<i32> {
    LandCoverClass::ALL.iter().map(|c| c.code()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_positions() {
        for (i, class) in LandCoverClass::ALL.iter().enumerate() {
            assert_eq!(class.code(), i as i32);
            assert_eq!(LandCoverClass::from_code(i as i32), Some(*class));
        }
        assert_eq!(LandCoverClass::from_code(9), None);
        assert_eq!(LandCoverClass::from_code(-1), None);
        assert_eq!(LandCoverClass::Trees.name(), "trees");
    }
}

// Fallback driver selection for participants who miss the pick deadline.

use std::collections::{HashMap, HashSet};

use crate::error::SurvivorError;
use crate::model::{AutoPickReason, DriverId, QualifyingEntry};

/// Grid slot the fallback starts from.
pub const AUTO_PICK_ANCHOR: u8 = 15;

/// Driver chosen by the decider.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoPickDecision {
    pub driver_id: DriverId,
    pub driver_name: String,
    pub team_name: String,
    pub position: u8,
    /// Signed distance from the anchor slot (`position - 15`).
    pub offset: i16,
    pub reason: AutoPickReason,
}

/// Derives a deterministic auto-pick from the qualifying order.
///
/// Candidates are tried at P15, then P16, P17 and so on to the back of the
/// grid, then P14 down to P1. Drivers in the exclusion set are skipped.
#[derive(Debug, Clone, Copy)]
pub struct AutoPickDecider {
    anchor: u8,
}

impl Default for AutoPickDecider {
    fn default() -> Self {
        AutoPickDecider {
            anchor: AUTO_PICK_ANCHOR,
        }
    }
}

impl AutoPickDecider {
    pub fn decide(
        &self,
        race_id: &str,
        order: &[QualifyingEntry],
        excluded: &HashSet<DriverId>,
    ) -> Result<AutoPickDecision, SurvivorError> {
        let by_position: HashMap<u8, &QualifyingEntry> =
            order.iter().map(|e| (e.position, e)).collect();
        let back_of_grid = order.iter().map(|e| e.position).max().unwrap_or(0);

        let chosen = candidate_positions(self.anchor, back_of_grid)
            .filter_map(|pos| by_position.get(&pos))
            .find(|entry| !excluded.contains(&entry.driver_id));

        let Some(entry) = chosen else {
            return Err(SurvivorError::NoEligibleDriver {
                race_id: race_id.to_string(),
            });
        };

        let reason = if entry.position == self.anchor {
            AutoPickReason::P15Fallback
        } else {
            AutoPickReason::DeadlineMissed {
                position: entry.position,
            }
        };

        Ok(AutoPickDecision {
            driver_id: entry.driver_id.clone(),
            driver_name: entry.driver_name.clone(),
            team_name: entry.team_name.clone(),
            position: entry.position,
            offset: i16::from(entry.position) - i16::from(self.anchor),
            reason,
        })
    }
}

fn candidate_positions(anchor: u8, back_of_grid: u8) -> impl Iterator<Item = u8> {
    (anchor..=back_of_grid.max(anchor)).chain((1..anchor).rev())
}

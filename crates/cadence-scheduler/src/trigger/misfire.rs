use serde::{Deserialize, Serialize};

/// What a trigger does when it finds its fire time already behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Resolved per schedule kind, see [`Schedule::resolve_smart`](super::Schedule::resolve_smart).
    #[default]
    Smart,
    /// Not a misfire at all: every missed fire is replayed back to back.
    IgnoreMisfires,
    /// Fire once, right now.
    FireNow,
    /// Skip the missed fires; next fire strictly after now.
    DoNothing,
    /// Skip the missed fires; next fire at or after now.
    RescheduleNextValid,
    RescheduleNowWithExistingCount,
    RescheduleNowWithRemainingCount,
    RescheduleNextWithExistingCount,
    RescheduleNextWithRemainingCount,
}

impl MisfireInstruction {
    /// Legal for every schedule kind.
    pub fn is_universal(self) -> bool {
        matches!(
            self,
            MisfireInstruction::Smart
                | MisfireInstruction::IgnoreMisfires
                | MisfireInstruction::FireNow
                | MisfireInstruction::DoNothing
                | MisfireInstruction::RescheduleNextValid
        )
    }
}

impl std::fmt::Display for MisfireInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MisfireInstruction::Smart => "smart",
            MisfireInstruction::IgnoreMisfires => "ignore_misfires",
            MisfireInstruction::FireNow => "fire_now",
            MisfireInstruction::DoNothing => "do_nothing",
            MisfireInstruction::RescheduleNextValid => "reschedule_next_valid",
            MisfireInstruction::RescheduleNowWithExistingCount => {
                "reschedule_now_with_existing_count"
            }
            MisfireInstruction::RescheduleNowWithRemainingCount => {
                "reschedule_now_with_remaining_count"
            }
            MisfireInstruction::RescheduleNextWithExistingCount => {
                "reschedule_next_with_existing_count"
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                "reschedule_next_with_remaining_count"
            }
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MisfireInstruction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "smart" => Ok(MisfireInstruction::Smart),
            "ignore_misfires" => Ok(MisfireInstruction::IgnoreMisfires),
            "fire_now" => Ok(MisfireInstruction::FireNow),
            "do_nothing" => Ok(MisfireInstruction::DoNothing),
            "reschedule_next_valid" => Ok(MisfireInstruction::RescheduleNextValid),
            "reschedule_now_with_existing_count" => {
                Ok(MisfireInstruction::RescheduleNowWithExistingCount)
            }
            "reschedule_now_with_remaining_count" => {
                Ok(MisfireInstruction::RescheduleNowWithRemainingCount)
            }
            "reschedule_next_with_existing_count" => {
                Ok(MisfireInstruction::RescheduleNextWithExistingCount)
            }
            "reschedule_next_with_remaining_count" => {
                Ok(MisfireInstruction::RescheduleNextWithRemainingCount)
            }
            other => Err(format!("unknown misfire instruction: {other}")),
        }
    }
}

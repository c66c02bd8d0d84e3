//! Stickiness tiering and migration scoring (spec.md §4.2). Kept as pure
//! functions over plain inputs so the scheduling policy is testable without
//! standing up a real `ContextPool`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stickiness {
    Weak,
    Balanced,
    Strong,
}

impl Stickiness {
    pub fn downgrade(self) -> Self {
        match self {
            Stickiness::Strong => Stickiness::Balanced,
            Stickiness::Balanced => Stickiness::Weak,
            Stickiness::Weak => Stickiness::Weak,
        }
    }

    pub fn upgrade(self) -> Self {
        match self {
            Stickiness::Weak => Stickiness::Balanced,
            Stickiness::Balanced => Stickiness::Strong,
            Stickiness::Strong => Stickiness::Strong,
        }
    }

    /// `None` means migration is never permitted at this tier (`Strong`).
    pub fn migration_threshold(self) -> Option<i32> {
        match self {
            Stickiness::Weak => Some(45),
            Stickiness::Balanced => Some(68),
            Stickiness::Strong => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StickinessInputs {
    pub strict_affinity: bool,
    pub has_previous_response_id: bool,
    pub store_disabled: bool,
    pub turn_index: u32,
    pub existing_broken: bool,
    pub existing_recent_failure: bool,
    pub existing_used_recently: bool,
}

/// Computes the base tier, then applies at most one downgrade or one
/// upgrade step per spec.md §4.2 (never both).
pub fn compute_stickiness(inputs: StickinessInputs) -> Stickiness {
    let mut tier = if inputs.strict_affinity {
        Stickiness::Strong
    } else if inputs.has_previous_response_id {
        Stickiness::Strong
    } else if inputs.store_disabled || inputs.turn_index > 1 {
        Stickiness::Balanced
    } else {
        Stickiness::Weak
    };

    if inputs.existing_broken || inputs.existing_recent_failure {
        tier = tier.downgrade();
    } else if inputs.existing_used_recently {
        tier = tier.upgrade();
    }
    tier
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationScoreInputs {
    pub broken: bool,
    pub failure_streak: u32,
    pub recent_failure: bool,
    pub migrated_within_last_minute: bool,
    pub migration_count: u32,
    pub idle: Duration,
}

/// The candidate-recycle score (spec.md §4.2). Higher is a better migration
/// target; callers compare against [`Stickiness::migration_threshold`].
pub fn migration_score(inputs: MigrationScoreInputs) -> i32 {
    let mut score: i32 = 100;
    if inputs.broken {
        score -= 30;
    }
    score -= (12 * inputs.failure_streak as i32).min(40);
    if inputs.recent_failure {
        score -= 18;
    }
    if inputs.migrated_within_last_minute {
        score -= 10;
    }
    score -= (4 * inputs.migration_count as i32).min(20);

    if inputs.idle <= Duration::from_secs(15) {
        score -= 15;
    } else if inputs.idle >= Duration::from_secs(180) {
        score += 16;
    } else {
        score += inputs.idle.as_secs() as i32 / 12;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_affinity_is_always_strong_and_never_migrates() {
        let tier = compute_stickiness(StickinessInputs {
            strict_affinity: true,
            ..Default::default()
        });
        assert_eq!(tier, Stickiness::Strong);
        assert_eq!(tier.migration_threshold(), None);
    }

    #[test]
    fn broken_existing_context_downgrades_one_tier() {
        let tier = compute_stickiness(StickinessInputs {
            has_previous_response_id: true,
            existing_broken: true,
            ..Default::default()
        });
        assert_eq!(tier, Stickiness::Balanced);
    }

    #[test]
    fn recently_used_healthy_context_upgrades_one_tier() {
        let tier = compute_stickiness(StickinessInputs {
            existing_used_recently: true,
            ..Default::default()
        });
        assert_eq!(tier, Stickiness::Balanced);
    }

    #[test]
    fn fresh_idle_conn_is_penalized_long_idle_is_rewarded() {
        let fresh = migration_score(MigrationScoreInputs {
            idle: Duration::from_secs(5),
            ..Default::default()
        });
        let stale = migration_score(MigrationScoreInputs {
            idle: Duration::from_secs(200),
            ..Default::default()
        });
        assert_eq!(fresh, 85);
        assert_eq!(stale, 116);
        assert!(stale > fresh);
    }

    #[test]
    fn broken_and_failing_context_falls_below_weak_threshold() {
        let score = migration_score(MigrationScoreInputs {
            broken: true,
            failure_streak: 5,
            recent_failure: true,
            idle: Duration::from_secs(60),
            ..Default::default()
        });
        assert!(score < Stickiness::Weak.migration_threshold().unwrap());
    }
}

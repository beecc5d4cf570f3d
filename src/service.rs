use crate::award::AwardEngine;
use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::PointsConfig;
use crate::error::LedgerResult;
use crate::ledger::Ledger;
use crate::redeem::RedemptionEngine;
use crate::roster::Roster;
use crate::store::{SqliteStore, Store};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The engines of one open workspace, sharing a store and a clock.
pub struct Services {
    pub config: PointsConfig,
    pub roster: Roster,
    pub ledger: Ledger,
    pub awards: AwardEngine,
    pub catalog: Catalog,
    pub redemption: RedemptionEngine,
    db_path: Option<PathBuf>,
}

impl Services {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: PointsConfig) -> Self {
        Self {
            roster: Roster::new(Arc::clone(&store), Arc::clone(&clock)),
            ledger: Ledger::new(Arc::clone(&store), Arc::clone(&clock)),
            awards: AwardEngine::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.grades.clone(),
                config.homework.clone(),
                config.attendance.clone(),
            ),
            catalog: Catalog::new(Arc::clone(&store)),
            redemption: RedemptionEngine::new(store, clock),
            config,
            db_path: None,
        }
    }

    /// Services over the workspace database at `db_path`.
    pub fn open(db_path: &Path, config: PointsConfig) -> LedgerResult<Self> {
        let store = SqliteStore::open(db_path, config.locking.timeout())?;
        let mut services = Self::new(Arc::new(store), Arc::new(SystemClock), config);
        services.db_path = Some(db_path.to_path_buf());
        Ok(services)
    }

    /// Applies new rules to subsequent requests. A changed lock timeout
    /// reopens the workspace store so the new busy timeout takes effect.
    pub fn reconfigure(self, config: PointsConfig) -> LedgerResult<Self> {
        if let Some(path) = &self.db_path {
            if config.locking.timeout_ms != self.config.locking.timeout_ms {
                return Self::open(path, config);
            }
        }
        let Services {
            roster,
            ledger,
            catalog,
            redemption,
            db_path,
            awards,
            ..
        } = self;
        let awards = awards.with_rules(
            config.grades.clone(),
            config.homework.clone(),
            config.attendance.clone(),
        );
        Ok(Self {
            config,
            roster,
            ledger,
            awards,
            catalog,
            redemption,
            db_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::award::AwardOutcome;
    use crate::ledger::tests::{enroll, memory_store};

    #[test]
    fn reconfigure_changes_award_rules_for_later_events() {
        let store = memory_store();
        enroll(&store, "s1", "ip-21");
        let services = Services::new(store, Arc::new(SystemClock), PointsConfig::default());
        assert_eq!(
            services.awards.on_grade_posted("s1", "g1", 3).expect("grade"),
            AwardOutcome::NotEligible
        );

        let mut config = PointsConfig::default();
        config.grades.min_value = 3;
        config.grades.points_by_value.insert(3, 2);
        let services = services.reconfigure(config).expect("reconfigure");
        let outcome = services.awards.on_grade_posted("s1", "g2", 3).expect("grade");
        assert_eq!(outcome.awarded().map(|t| t.amount), Some(2));
        assert_eq!(services.config.grades.min_value, 3);
    }
}

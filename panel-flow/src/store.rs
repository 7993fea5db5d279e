//! Single-slot case store with reducer-style updates.
//!
//! All mutations go through [`CaseStore::apply`], which checks the event's
//! case id against the current case before reducing. Settlements arriving
//! from a superseded case fail that check and are dropped, so in-flight
//! remote calls never need to be cancelled to keep state consistent.

use crate::model::{CasePhase, CaseState, ReportStatus, SpecialistOutcome, Specialty};
use std::sync::Mutex;
use tracing::{debug, warn};

/// A discrete state transition for the current case.
#[derive(Debug, Clone)]
pub enum CaseEvent {
    /// All specialist calls are being issued; every report goes loading.
    DispatchStarted,
    /// One specialist call settled, in arrival order.
    SpecialistSettled {
        specialty: Specialty,
        outcome: SpecialistOutcome,
    },
    /// The barrier passed; the synthesis call is being issued.
    SynthesisStarted,
    /// The synthesis call settled.
    SynthesisSettled(Result<String, String>),
}

/// Holds the one current case. A new case replaces the previous one
/// wholesale; no history is kept.
pub struct CaseStore {
    current: Mutex<Option<CaseState>>,
}

impl CaseStore {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Install a new case, discarding the previous one. Late events from
    /// the old case will no longer match the stored id.
    pub fn replace(&self, case: CaseState) {
        let mut slot = self.current.lock().unwrap();
        if let Some(old) = slot.as_ref() {
            debug!(old_case = %old.id, new_case = %case.id, "replacing current case");
        }
        *slot = Some(case);
    }

    /// Apply one event to the case identified by `case_id`. Returns false
    /// when the event is stale (the case was replaced) and was dropped.
    pub fn apply(&self, case_id: &str, event: CaseEvent) -> bool {
        let mut slot = self.current.lock().unwrap();
        match slot.as_mut() {
            Some(case) if case.id == case_id => {
                reduce(case, event);
                true
            }
            _ => {
                debug!(case_id, ?event, "dropping event for stale case");
                false
            }
        }
    }

    /// Clone of the current case, if any.
    pub fn snapshot(&self) -> Option<CaseState> {
        self.current.lock().unwrap().clone()
    }

    /// Clone of the current case only when it matches `case_id`.
    pub fn snapshot_of(&self, case_id: &str) -> Option<CaseState> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .filter(|case| case.id == case_id)
            .cloned()
    }
}

impl Default for CaseStore {
    fn default() -> Self {
        Self::new()
    }
}

fn reduce(case: &mut CaseState, event: CaseEvent) {
    match event {
        CaseEvent::DispatchStarted => {
            for report in case.specialists.values_mut() {
                if report.status == ReportStatus::Pending {
                    report.status = ReportStatus::Loading;
                }
            }
            case.phase = CasePhase::AwaitingSpecialists;
        }
        CaseEvent::SpecialistSettled { specialty, outcome } => {
            let Some(report) = case.specialists.get_mut(&specialty) else {
                warn!(case_id = %case.id, %specialty, "settlement for unknown specialty");
                return;
            };
            if report.status.is_terminal() {
                warn!(case_id = %case.id, %specialty, "duplicate settlement ignored");
                return;
            }
            report.status = if outcome.is_failure() {
                ReportStatus::Error
            } else {
                ReportStatus::Complete
            };
            report.outcome = Some(outcome);
        }
        CaseEvent::SynthesisStarted => {
            if !case.all_specialists_settled() {
                warn!(
                    case_id = %case.id,
                    settled = case.settled_count(),
                    total = case.specialists.len(),
                    "synthesis requested before all specialists settled; ignoring"
                );
                return;
            }
            case.final_report.status = ReportStatus::Loading;
            case.phase = CasePhase::Synthesizing;
        }
        CaseEvent::SynthesisSettled(result) => {
            match result {
                Ok(summary) => {
                    case.final_report.summary = summary;
                    case.final_report.status = ReportStatus::Complete;
                }
                Err(message) => {
                    case.final_report.summary =
                        format!("Failed to generate final report: {message}");
                    case.final_report.status = ReportStatus::Error;
                }
            }
            case.phase = CasePhase::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseSubmission, PatientHistory, SpecialistAnalysis};

    fn submission() -> CaseSubmission {
        CaseSubmission {
            report_text: "persistent cough".to_string(),
            history: PatientHistory::default(),
            image: None,
        }
    }

    fn analysis() -> SpecialistAnalysis {
        SpecialistAnalysis {
            summary: "ok".to_string(),
            key_findings: vec![],
            potential_conditions: vec![],
            recommendations: vec![],
        }
    }

    fn settle_all(store: &CaseStore, case_id: &str) {
        for &specialty in Specialty::ALL.iter() {
            store.apply(
                case_id,
                CaseEvent::SpecialistSettled {
                    specialty,
                    outcome: SpecialistOutcome::Analysis(analysis()),
                },
            );
        }
    }

    #[test]
    fn lifecycle_runs_pending_loading_terminal() {
        let store = CaseStore::new();
        store.replace(CaseState::new("c1", &submission()));

        store.apply("c1", CaseEvent::DispatchStarted);
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.phase, CasePhase::AwaitingSpecialists);
        assert!(
            snapshot
                .specialists
                .values()
                .all(|r| r.status == ReportStatus::Loading)
        );

        store.apply(
            "c1",
            CaseEvent::SpecialistSettled {
                specialty: Specialty::Oncologist,
                outcome: SpecialistOutcome::Failed("no output".to_string()),
            },
        );
        let snapshot = store.snapshot().unwrap();
        let oncology = &snapshot.specialists[&Specialty::Oncologist];
        assert_eq!(oncology.status, ReportStatus::Error);
        // Other specialists are untouched by a sibling settlement.
        assert_eq!(
            snapshot.specialists[&Specialty::Cardiologist].status,
            ReportStatus::Loading
        );
    }

    #[test]
    fn terminal_reports_never_revisit_earlier_states() {
        let store = CaseStore::new();
        store.replace(CaseState::new("c1", &submission()));
        store.apply("c1", CaseEvent::DispatchStarted);

        store.apply(
            "c1",
            CaseEvent::SpecialistSettled {
                specialty: Specialty::Neurologist,
                outcome: SpecialistOutcome::Analysis(analysis()),
            },
        );
        store.apply(
            "c1",
            CaseEvent::SpecialistSettled {
                specialty: Specialty::Neurologist,
                outcome: SpecialistOutcome::Failed("late duplicate".to_string()),
            },
        );

        let snapshot = store.snapshot().unwrap();
        assert_eq!(
            snapshot.specialists[&Specialty::Neurologist].status,
            ReportStatus::Complete
        );
    }

    #[test]
    fn synthesis_start_is_refused_before_the_barrier() {
        let store = CaseStore::new();
        store.replace(CaseState::new("c1", &submission()));
        store.apply("c1", CaseEvent::DispatchStarted);

        store.apply("c1", CaseEvent::SynthesisStarted);
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.phase, CasePhase::AwaitingSpecialists);
        assert_eq!(snapshot.final_report.status, ReportStatus::Pending);

        settle_all(&store, "c1");
        store.apply("c1", CaseEvent::SynthesisStarted);
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.phase, CasePhase::Synthesizing);
        assert_eq!(snapshot.final_report.status, ReportStatus::Loading);
    }

    #[test]
    fn stale_case_events_are_dropped() {
        let store = CaseStore::new();
        store.replace(CaseState::new("old", &submission()));
        store.apply("old", CaseEvent::DispatchStarted);

        store.replace(CaseState::new("new", &submission()));
        store.apply("new", CaseEvent::DispatchStarted);

        // A settlement from the superseded case arrives late.
        let applied = store.apply(
            "old",
            CaseEvent::SpecialistSettled {
                specialty: Specialty::Radiologist,
                outcome: SpecialistOutcome::Failed("stale".to_string()),
            },
        );
        assert!(!applied);

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.id, "new");
        assert_eq!(
            snapshot.specialists[&Specialty::Radiologist].status,
            ReportStatus::Loading
        );
        assert!(store.snapshot_of("old").is_none());
    }

    #[test]
    fn synthesis_failure_records_error_with_message() {
        let store = CaseStore::new();
        store.replace(CaseState::new("c1", &submission()));
        store.apply("c1", CaseEvent::DispatchStarted);
        settle_all(&store, "c1");
        store.apply("c1", CaseEvent::SynthesisStarted);
        store.apply(
            "c1",
            CaseEvent::SynthesisSettled(Err("upstream 503".to_string())),
        );

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.phase, CasePhase::Done);
        assert_eq!(snapshot.final_report.status, ReportStatus::Error);
        assert!(snapshot.final_report.summary.contains("upstream 503"));
    }
}

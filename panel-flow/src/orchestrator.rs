//! Concurrent dispatch of the specialist panel and the synthesis join.
//!
//! One run per case: all specialist calls are issued together with no
//! concurrency cap, each settlement is applied to the store as it
//! arrives, and only after the full join does the single synthesis call
//! go out. Per-call timeouts turn a hung remote call into an ordinary
//! failed settlement so the barrier always completes.

use crate::client::AnalysisClient;
use crate::error::{PanelError, Result};
use crate::model::{CaseState, CaseSubmission, SpecialistAnalysis, SpecialistOutcome, Specialty};
use crate::store::{CaseEvent, CaseStore};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on each specialist call; a call that exceeds it settles as
    /// an error so the barrier cannot stall.
    pub specialist_timeout: Duration,
    /// Bound on the synthesis call.
    pub synthesis_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            specialist_timeout: Duration::from_secs(120),
            synthesis_timeout: Duration::from_secs(180),
        }
    }
}

/// Drives the per-case analysis workflow against a [`CaseStore`].
pub struct Orchestrator {
    client: Arc<dyn AnalysisClient>,
    store: Arc<CaseStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn AnalysisClient>,
        store: Arc<CaseStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn store(&self) -> Arc<CaseStore> {
        self.store.clone()
    }

    /// Validate a submission, install it as the current case, and spawn
    /// the analysis run. Returns the new case id immediately; progress is
    /// observed through store snapshots.
    pub fn submit(&self, submission: CaseSubmission) -> Result<String> {
        if submission.is_empty() {
            return Err(PanelError::EmptySubmission(
                "a case needs report text or an attached image".to_string(),
            ));
        }

        let case_id = Uuid::new_v4().to_string();
        self.store.replace(CaseState::new(case_id.clone(), &submission));
        info!(case_id = %case_id, "case accepted, dispatching specialist panel");

        let client = self.client.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let run_id = case_id.clone();
        tokio::spawn(async move {
            run_case(client, store, config, run_id, submission).await;
        });

        Ok(case_id)
    }
}

async fn run_case(
    client: Arc<dyn AnalysisClient>,
    store: Arc<CaseStore>,
    config: OrchestratorConfig,
    case_id: String,
    submission: CaseSubmission,
) {
    store.apply(&case_id, CaseEvent::DispatchStarted);

    let submission = &submission;
    let settled: Vec<(Specialty, SpecialistOutcome)> =
        join_all(Specialty::ALL.iter().map(|&specialty| {
            let client = client.clone();
            let store = store.clone();
            let case_id = case_id.clone();
            async move {
                let outcome = match timeout(
                    config.specialist_timeout,
                    client.specialist_analysis(
                        specialty,
                        &submission.report_text,
                        &submission.history,
                        submission.image.as_ref(),
                    ),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => SpecialistOutcome::Failed(format!(
                        "{specialty} analysis timed out after {}s",
                        config.specialist_timeout.as_secs()
                    )),
                };
                if outcome.is_failure() {
                    error!(case_id = %case_id, %specialty, "specialist analysis failed");
                } else {
                    info!(case_id = %case_id, %specialty, "specialist analysis complete");
                }
                store.apply(
                    &case_id,
                    CaseEvent::SpecialistSettled {
                        specialty,
                        outcome: outcome.clone(),
                    },
                );
                (specialty, outcome)
            }
        }))
        .await;

    // Full join reached: build the successful subset from the settled
    // outcomes. Failed specialties are excluded entirely.
    let successful: BTreeMap<Specialty, SpecialistAnalysis> = settled
        .into_iter()
        .filter_map(|(specialty, outcome)| match outcome {
            SpecialistOutcome::Analysis(analysis) => Some((specialty, analysis)),
            SpecialistOutcome::Failed(_) => None,
        })
        .collect();

    info!(
        case_id = %case_id,
        successful = successful.len(),
        total = Specialty::ALL.len(),
        "specialist barrier complete, starting synthesis"
    );
    store.apply(&case_id, CaseEvent::SynthesisStarted);

    let result = match timeout(
        config.synthesis_timeout,
        client.synthesis(&successful, &submission.report_text, &submission.history),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(format!(
            "synthesis timed out after {}s",
            config.synthesis_timeout.as_secs()
        )),
    };

    match &result {
        Ok(_) => info!(case_id = %case_id, "final report complete"),
        Err(message) => error!(case_id = %case_id, error = %message, "synthesis failed"),
    }
    store.apply(&case_id, CaseEvent::SynthesisSettled(result));
}

use panel_flow::{
    CasePhase, CaseState, CaseSubmission, FinalReport, ReportStatus, SpecialistAnalysis,
    SpecialistOutcome,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SubmitCaseRequest {
    #[serde(flatten)]
    pub submission: CaseSubmission,
}

#[derive(Debug, Serialize)]
pub struct SubmitCaseResponse {
    pub case_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
}

/// One specialist's card, as the UI renders it.
#[derive(Debug, Serialize)]
pub struct SpecialistCard {
    pub specialty: String,
    pub description: String,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<SpecialistAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full snapshot of the current case for polling clients.
#[derive(Debug, Serialize)]
pub struct CaseResponse {
    pub case_id: String,
    pub phase: CasePhase,
    pub settled: usize,
    pub total: usize,
    pub specialists: Vec<SpecialistCard>,
    pub final_report: FinalReport,
}

impl From<CaseState> for CaseResponse {
    fn from(case: CaseState) -> Self {
        let settled = case.settled_count();
        let total = case.specialists.len();
        let specialists = case
            .specialists
            .into_values()
            .map(|report| {
                let (analysis, error) = match report.outcome {
                    Some(SpecialistOutcome::Analysis(analysis)) => (Some(analysis), None),
                    Some(SpecialistOutcome::Failed(message)) => (None, Some(message)),
                    None => (None, None),
                };
                SpecialistCard {
                    specialty: report.specialty.to_string(),
                    description: report.specialty.description().to_string(),
                    status: report.status,
                    analysis,
                    error,
                }
            })
            .collect();
        Self {
            case_id: case.id,
            phase: case.phase,
            settled,
            total,
            specialists,
            final_report: case.final_report,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Medical disciplines on the fixed specialist panel.
///
/// The panel is static configuration: every case dispatches one analysis
/// call per variant, and prompt templates are selected by variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Specialty {
    Cardiologist,
    Pulmonologist,
    Neurologist,
    Gastroenterologist,
    Endocrinologist,
    Immunologist,
    Nephrologist,
    Hematologist,
    Oncologist,
    Radiologist,
    Psychologist,
}

impl Specialty {
    /// The full panel, in display order.
    pub const ALL: [Specialty; 11] = [
        Specialty::Cardiologist,
        Specialty::Pulmonologist,
        Specialty::Neurologist,
        Specialty::Gastroenterologist,
        Specialty::Endocrinologist,
        Specialty::Immunologist,
        Specialty::Nephrologist,
        Specialty::Hematologist,
        Specialty::Oncologist,
        Specialty::Radiologist,
        Specialty::Psychologist,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Specialty::Cardiologist => "Cardiologist",
            Specialty::Pulmonologist => "Pulmonologist",
            Specialty::Neurologist => "Neurologist",
            Specialty::Gastroenterologist => "Gastroenterologist",
            Specialty::Endocrinologist => "Endocrinologist",
            Specialty::Immunologist => "Immunologist",
            Specialty::Nephrologist => "Nephrologist",
            Specialty::Hematologist => "Hematologist",
            Specialty::Oncologist => "Oncologist",
            Specialty::Radiologist => "Radiologist",
            Specialty::Psychologist => "Psychologist",
        }
    }

    /// One-line description shown on the specialist card.
    pub fn description(&self) -> &'static str {
        match self {
            Specialty::Cardiologist => "Analyzes heart and blood vessel conditions.",
            Specialty::Pulmonologist => "Focuses on the respiratory system.",
            Specialty::Neurologist => "Diagnoses and treats nervous system disorders.",
            Specialty::Gastroenterologist => "Specializes in the digestive system.",
            Specialty::Endocrinologist => "Deals with hormones and glands.",
            Specialty::Immunologist => "Manages immune system disorders.",
            Specialty::Nephrologist => "Focuses on kidney health.",
            Specialty::Hematologist => "Studies blood, and blood-forming organs.",
            Specialty::Oncologist => "Treats cancer and tumors.",
            Specialty::Radiologist => "Interprets medical images.",
            Specialty::Psychologist => "Assesses mental and emotional health.",
        }
    }
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured patient-history fields. All free text; blank means unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientHistory {
    pub past_diagnoses: String,
    pub chronic_conditions: String,
    pub allergies: String,
    pub current_medications: String,
    pub family_history: String,
    pub lifestyle_factors: String,
}

impl PatientHistory {
    /// True when every field is blank after trimming.
    pub fn is_empty(&self) -> bool {
        [
            &self.past_diagnoses,
            &self.chronic_conditions,
            &self.allergies,
            &self.current_medications,
            &self.family_history,
            &self.lifestyle_factors,
        ]
        .iter()
        .all(|f| f.trim().is_empty())
    }
}

/// Image attached to a case, already base64-encoded by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedImage {
    pub data: String,
    pub mime_type: String,
}

/// Structured result of one specialist analysis call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialistAnalysis {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub potential_conditions: Vec<String>,
    pub recommendations: Vec<String>,
}

/// What one specialist call settled with. Remote failures and unparseable
/// output both degrade to `Failed` with a descriptive message; the client
/// boundary never surfaces them any other way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpecialistOutcome {
    Analysis(SpecialistAnalysis),
    Failed(String),
}

impl SpecialistOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SpecialistOutcome::Failed(_))
    }
}

/// Lifecycle of a specialist or final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Loading,
    Complete,
    Error,
}

impl ReportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Complete | ReportStatus::Error)
    }
}

/// One panel member's report for the current case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistReport {
    pub specialty: Specialty,
    pub status: ReportStatus,
    pub outcome: Option<SpecialistOutcome>,
}

impl SpecialistReport {
    pub fn pending(specialty: Specialty) -> Self {
        Self {
            specialty,
            status: ReportStatus::Pending,
            outcome: None,
        }
    }
}

/// The synthesized narrative produced after the specialist barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub summary: String,
    pub status: ReportStatus,
}

impl FinalReport {
    pub fn pending() -> Self {
        Self {
            summary: String::new(),
            status: ReportStatus::Pending,
        }
    }
}

/// Orchestrator state machine for one case. A case exists only once
/// submitted, so the earliest phase is already `Dispatching`; "no case
/// yet" is the store holding nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePhase {
    Dispatching,
    AwaitingSpecialists,
    Synthesizing,
    Done,
}

/// Everything submitted for one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSubmission {
    pub report_text: String,
    #[serde(default)]
    pub history: PatientHistory,
    #[serde(default)]
    pub image: Option<AttachedImage>,
}

impl CaseSubmission {
    /// A submission with no report text and no image carries nothing to
    /// analyze and must be rejected before any dispatch.
    pub fn is_empty(&self) -> bool {
        self.report_text.trim().is_empty() && self.image.is_none()
    }
}

/// Aggregate state for the current case. Replaced wholesale when a new
/// case is submitted; no history of prior cases is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseState {
    pub id: String,
    pub report_text: String,
    pub image: Option<AttachedImage>,
    pub history: PatientHistory,
    pub phase: CasePhase,
    pub specialists: BTreeMap<Specialty, SpecialistReport>,
    pub final_report: FinalReport,
}

impl CaseState {
    pub fn new(id: impl Into<String>, submission: &CaseSubmission) -> Self {
        let specialists = Specialty::ALL
            .iter()
            .map(|&s| (s, SpecialistReport::pending(s)))
            .collect();
        Self {
            id: id.into(),
            report_text: submission.report_text.clone(),
            image: submission.image.clone(),
            history: submission.history.clone(),
            phase: CasePhase::Dispatching,
            specialists,
            final_report: FinalReport::pending(),
        }
    }

    /// Number of specialist reports that reached a terminal state.
    pub fn settled_count(&self) -> usize {
        self.specialists
            .values()
            .filter(|r| r.status.is_terminal())
            .count()
    }

    /// True once no specialist report is still loading or pending.
    pub fn all_specialists_settled(&self) -> bool {
        self.settled_count() == self.specialists.len()
    }

    /// The analyses of every specialist whose report completed, keyed by
    /// specialty. Errored specialties are absent, never placeholders.
    pub fn successful_analyses(&self) -> BTreeMap<Specialty, SpecialistAnalysis> {
        self.specialists
            .values()
            .filter(|r| r.status == ReportStatus::Complete)
            .filter_map(|r| match &r.outcome {
                Some(SpecialistOutcome::Analysis(a)) => Some((r.specialty, a.clone())),
                _ => None,
            })
            .collect()
    }
}

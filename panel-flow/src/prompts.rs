//! Prompt templates for specialist analysis, final synthesis, and the
//! follow-up chat context. All pure string construction; the fixed
//! specialty panel selects templates by enum key, nothing is dynamic.

use crate::model::{CaseState, PatientHistory, ReportStatus, Specialty, SpecialistAnalysis};
use std::collections::BTreeMap;

/// Sentinel returned when no history field carries any content.
pub const NO_HISTORY: &str = "No patient history provided.";

fn field_or_na(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() { "N/A" } else { trimmed }
}

/// Render the patient history as a fixed-order bulleted list, or the
/// [`NO_HISTORY`] sentinel when every field is blank.
pub fn format_history(history: &PatientHistory) -> String {
    if history.is_empty() {
        return NO_HISTORY.to_string();
    }
    format!(
        "- **Past Diagnoses:** {}\n\
         - **Chronic Conditions:** {}\n\
         - **Allergies:** {}\n\
         - **Current Medications:** {}\n\
         - **Family History:** {}\n\
         - **Lifestyle Factors:** {}",
        field_or_na(&history.past_diagnoses),
        field_or_na(&history.chronic_conditions),
        field_or_na(&history.allergies),
        field_or_na(&history.current_medications),
        field_or_na(&history.family_history),
        field_or_na(&history.lifestyle_factors),
    )
}

/// Build the prompt for one specialist call. The model is instructed to
/// answer with a JSON object of exactly four keys: `summary` plus three
/// string arrays.
pub fn specialist_prompt(specialty: Specialty, report_text: &str, formatted_history: &str) -> String {
    format!(
        "You are a world-class {specialty}. Your task is to analyze the following medical data from your specific field of expertise. Consider all available information, including the current report, attached images (if any), and the patient's history.

Focus ONLY on aspects relevant to {specialty}.

Provide your analysis in a structured JSON format. The JSON object must contain exactly four keys: \"summary\", \"keyFindings\", \"potentialConditions\", and \"recommendations\". \"summary\" must be a short free-text string; each of the other keys must have an array of strings as its value.

Example response format:
{{
  \"summary\": \"A one-sentence overall impression.\",
  \"keyFindings\": [\"Finding 1\", \"Finding 2\"],
  \"potentialConditions\": [\"Condition 1\", \"Condition 2\"],
  \"recommendations\": [\"Recommendation 1\", \"Recommendation 2\"]
}}

Do not include any other text or markdown formatting outside of the JSON object.

**Patient History:**
---
{formatted_history}
---

**Medical Report:**
---
{report_text}
---"
    )
}

/// Build the synthesis prompt from the successful specialist analyses.
/// Errored specialties are simply not present in the map.
pub fn synthesis_prompt(
    analyses: &BTreeMap<Specialty, SpecialistAnalysis>,
    report_text: &str,
    formatted_history: &str,
) -> String {
    let mut combined = String::new();
    for (specialty, analysis) in analyses {
        let serialized =
            serde_json::to_string_pretty(analysis).unwrap_or_else(|_| "{}".to_string());
        combined.push_str(&format!("**{specialty} Report:**\n{serialized}\n\n"));
    }
    if combined.is_empty() {
        combined.push_str("No specialist produced a usable analysis for this case.\n");
    }

    format!(
        "You are the lead physician of a Multidisciplinary Team (MDT). You have received analyses from various specialists regarding a patient's medical report and history. Your task is to synthesize these reports into a single, integrated final diagnosis.

**Instructions:**
1. **Review the patient's history and the original report.**
2. **Review all specialist reports** provided below. Note that they are in JSON format.
3. **Synthesize the findings** into a cohesive summary, taking the full patient context into account.
4. **Identify and prioritize the top 3 most critical health issues.** For each issue, provide supporting evidence from the specialist reports and patient history.
5. **Provide an overall assessment and a coordinated action plan.**

Format your response using markdown.

**Patient History:**
---
{formatted_history}
---

**Original Medical Report:**
---
{report_text}
---

**Specialist Analyses (JSON format):**
---
{combined}
---"
    )
}

/// Build the system instruction seeding a chat session with the full
/// case context: history, original report, final diagnosis, and every
/// completed specialist's findings.
pub fn chat_context(case: &CaseState) -> String {
    let mut findings = String::new();
    for report in case.specialists.values() {
        if report.status != ReportStatus::Complete {
            continue;
        }
        if let Some(crate::model::SpecialistOutcome::Analysis(analysis)) = &report.outcome {
            let serialized = serde_json::to_string(analysis).unwrap_or_else(|_| "{}".to_string());
            findings.push_str(&format!("{}: {}\n", report.specialty, serialized));
        }
    }

    format!(
        "You are a helpful medical assistant answering follow-up questions about a completed multi-specialist case review. Base your answers on the case context below. Be clear that you provide information, not a medical diagnosis.

**Patient History:**
{}

**Original Report:**
{}

**Final Diagnosis:**
{}

**Specialist Findings:**
{}",
        format_history(&case.history),
        case.report_text,
        case.final_report.summary,
        findings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseSubmission, SpecialistOutcome};

    fn history_with_allergies() -> PatientHistory {
        PatientHistory {
            allergies: "penicillin".to_string(),
            ..PatientHistory::default()
        }
    }

    #[test]
    fn blank_history_formats_to_sentinel() {
        assert_eq!(format_history(&PatientHistory::default()), NO_HISTORY);
    }

    #[test]
    fn partial_history_substitutes_na_for_blank_fields() {
        let rendered = format_history(&history_with_allergies());
        assert!(rendered.contains("**Allergies:** penicillin"));
        assert!(rendered.contains("**Past Diagnoses:** N/A"));
        assert!(rendered.contains("**Lifestyle Factors:** N/A"));
        assert_ne!(rendered, NO_HISTORY);
    }

    #[test]
    fn specialist_prompt_names_all_four_json_keys() {
        let prompt = specialist_prompt(Specialty::Cardiologist, "report", NO_HISTORY);
        for key in ["summary", "keyFindings", "potentialConditions", "recommendations"] {
            assert!(prompt.contains(key), "missing key {key}");
        }
        assert!(prompt.contains("Cardiologist"));
        assert!(prompt.contains(NO_HISTORY));
    }

    #[test]
    fn synthesis_prompt_includes_only_given_specialties() {
        let mut analyses = BTreeMap::new();
        analyses.insert(
            Specialty::Nephrologist,
            SpecialistAnalysis {
                summary: "renal function reduced".to_string(),
                key_findings: vec!["elevated creatinine".to_string()],
                potential_conditions: vec![],
                recommendations: vec![],
            },
        );
        let prompt = synthesis_prompt(&analyses, "report", NO_HISTORY);
        assert!(prompt.contains("**Nephrologist Report:**"));
        assert!(prompt.contains("elevated creatinine"));
        assert!(!prompt.contains("**Cardiologist Report:**"));
        assert!(prompt.contains("top 3 most critical health issues"));
    }

    #[test]
    fn chat_context_skips_errored_specialists() {
        let submission = CaseSubmission {
            report_text: "report text".to_string(),
            history: history_with_allergies(),
            image: None,
        };
        let mut case = CaseState::new("case-1", &submission);
        case.final_report.summary = "final diagnosis".to_string();
        case.final_report.status = ReportStatus::Complete;

        let ok = case.specialists.get_mut(&Specialty::Cardiologist).unwrap();
        ok.status = ReportStatus::Complete;
        ok.outcome = Some(SpecialistOutcome::Analysis(SpecialistAnalysis {
            summary: "normal sinus rhythm".to_string(),
            key_findings: vec![],
            potential_conditions: vec![],
            recommendations: vec![],
        }));

        let failed = case.specialists.get_mut(&Specialty::Radiologist).unwrap();
        failed.status = ReportStatus::Error;
        failed.outcome = Some(SpecialistOutcome::Failed("boom".to_string()));

        let context = chat_context(&case);
        assert!(context.contains("normal sinus rhythm"));
        assert!(context.contains("final diagnosis"));
        assert!(!context.contains("boom"));
    }
}

//! Plan tracking: predicted steps and their lifecycle.
//!
//! The plan is emitted once up-front so the client can render progress
//! rows before any work happens. Steps move pending → active →
//! completed/failed; anything still pending at the end of the run is
//! emitted as skipped so no row is left in limbo.

use bandproto::events::{PlanStep, StepStatus, StreamEvent};
use bandproto::tools::{self, Phase};
use uuid::Uuid;

use crate::prompt::ParsedPrompt;

/// Parallel-group tag for the per-instrument steps.
pub const INSTRUMENTS_GROUP: &str = "instruments";

/// Tracks plan steps through a composition run.
#[derive(Debug, Default)]
pub struct PlanTracker {
    pub plan_id: String,
    pub title: String,
    steps: Vec<PlanStep>,
}

impl PlanTracker {
    /// Predict the plan from the parsed prompt: optional tempo/key setup,
    /// one step per instrument, and a mixing step for multi-instrument
    /// compositions.
    pub fn build_from_prompt(parsed: &ParsedPrompt, project_tempo: u32, project_key: &str) -> Self {
        let mut steps = Vec::new();
        let mut next_id = 0usize;
        let mut step = |label: String,
                        phase: Phase,
                        tool_name: Option<&str>,
                        track_name: Option<String>,
                        parallel_group: Option<&str>| {
            next_id += 1;
            PlanStep {
                step_id: format!("step-{next_id}"),
                label,
                status: StepStatus::Pending,
                phase,
                tool_name: tool_name.map(str::to_string),
                track_name,
                parallel_group: parallel_group.map(str::to_string),
            }
        };

        if parsed.tempo.is_some_and(|t| t != project_tempo) {
            steps.push(step(
                format!("Set tempo to {} BPM", parsed.tempo.unwrap_or_default()),
                Phase::Setup,
                Some(tools::SET_TEMPO),
                None,
                None,
            ));
        }
        if parsed
            .key
            .as_deref()
            .is_some_and(|k| !k.trim().eq_ignore_ascii_case(project_key.trim()))
        {
            steps.push(step(
                format!("Set key to {}", parsed.key.clone().unwrap_or_default()),
                Phase::Setup,
                Some(tools::SET_KEY),
                None,
                None,
            ));
        }

        for role in &parsed.roles {
            let instrument = instrument_label(role);
            steps.push(step(
                format!("Compose {instrument}"),
                Phase::Composition,
                Some(tools::ADD_MIDI_TRACK),
                Some(instrument.clone()),
                Some(INSTRUMENTS_GROUP),
            ));
        }

        if parsed.roles.len() > 1 {
            steps.push(step(
                "Balance the mix".to_string(),
                Phase::Mixing,
                Some(tools::SET_TRACK_VOLUME),
                None,
                None,
            ));
        }

        Self {
            plan_id: Uuid::new_v4().to_string(),
            title: plan_title(parsed),
            steps,
        }
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The up-front `plan` event.
    pub fn to_plan_event(&self) -> StreamEvent {
        StreamEvent::Plan {
            plan_id: self.plan_id.clone(),
            title: self.title.clone(),
            steps: self.steps.clone(),
        }
    }

    pub fn find_step(&self, tool_name: &str) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| s.tool_name.as_deref() == Some(tool_name))
    }

    /// Step ids belonging to one instrument (by its display name).
    pub fn step_ids_for_instrument(&self, instrument: &str) -> Vec<String> {
        let needle = instrument.to_lowercase();
        self.steps
            .iter()
            .filter(|s| {
                s.parallel_group.as_deref() == Some(INSTRUMENTS_GROUP)
                    && s.track_name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase() == needle)
            })
            .map(|s| s.step_id.clone())
            .collect()
    }

    /// Step ids for the phase-3 mixing pass, if still pending.
    pub fn pending_mixing_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Pending
                    && s.parallel_group.is_none()
                    && s.phase == Phase::Mixing
            })
            .map(|s| s.step_id.clone())
            .collect()
    }

    fn transition(
        &mut self,
        step_id: &str,
        status: StepStatus,
        result: Option<String>,
        agent_id: Option<String>,
    ) -> Option<StreamEvent> {
        let step = self.steps.iter_mut().find(|s| s.step_id == step_id)?;
        step.status = status;
        Some(StreamEvent::PlanStepUpdate {
            step_id: step_id.to_string(),
            status,
            phase: step.phase,
            result,
            agent_id,
        })
    }

    pub fn activate(&mut self, step_id: &str, agent_id: Option<String>) -> Option<StreamEvent> {
        self.transition(step_id, StepStatus::Active, None, agent_id)
    }

    pub fn complete(
        &mut self,
        step_id: &str,
        result: Option<String>,
        agent_id: Option<String>,
    ) -> Option<StreamEvent> {
        self.transition(step_id, StepStatus::Completed, result, agent_id)
    }

    pub fn fail(
        &mut self,
        step_id: &str,
        reason: String,
        agent_id: Option<String>,
    ) -> Option<StreamEvent> {
        self.transition(step_id, StepStatus::Failed, Some(reason), agent_id)
    }

    /// Whether a step can still be failed (pending or active).
    pub fn is_unresolved(&self, step_id: &str) -> bool {
        self.steps
            .iter()
            .any(|s| s.step_id == step_id && matches!(s.status, StepStatus::Pending | StepStatus::Active))
    }

    /// Emit `skipped` for every step still pending at end of run.
    pub fn finalize_pending_as_skipped(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
                events.push(StreamEvent::PlanStepUpdate {
                    step_id: step.step_id.clone(),
                    status: StepStatus::Skipped,
                    phase: step.phase,
                    result: None,
                    agent_id: None,
                });
            }
        }
        events
    }
}

/// Display name for an instrument role.
pub fn instrument_label(role: &str) -> String {
    match role.to_lowercase().as_str() {
        "drums" | "drum" => "Drums".to_string(),
        "bass" => "Bass".to_string(),
        "chords" | "chord" => "Chords".to_string(),
        "melody" => "Melody".to_string(),
        "lead" => "Lead".to_string(),
        "arp" => "Arp".to_string(),
        "pads" | "pad" => "Pads".to_string(),
        "fx" => "FX".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        }
    }
}

fn plan_title(parsed: &ParsedPrompt) -> String {
    if parsed.style.is_empty() {
        "Compose".to_string()
    } else {
        format!("Compose {}", parsed.style)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed() -> ParsedPrompt {
        ParsedPrompt {
            style: "house".into(),
            tempo: Some(124),
            key: Some("Am".into()),
            roles: vec!["drums".into(), "bass".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_includes_setup_when_tempo_differs() {
        let tracker = PlanTracker::build_from_prompt(&parsed(), 120, "C");
        assert!(tracker.find_step(tools::SET_TEMPO).is_some());
        assert!(tracker.find_step(tools::SET_KEY).is_some());
    }

    #[test]
    fn test_plan_skips_setup_when_project_matches() {
        let tracker = PlanTracker::build_from_prompt(&parsed(), 124, "am");
        assert!(tracker.find_step(tools::SET_TEMPO).is_none());
        assert!(tracker.find_step(tools::SET_KEY).is_none());
    }

    #[test]
    fn test_one_instrument_step_per_role() {
        let tracker = PlanTracker::build_from_prompt(&parsed(), 120, "C");
        assert_eq!(tracker.step_ids_for_instrument("Drums").len(), 1);
        assert_eq!(tracker.step_ids_for_instrument("Bass").len(), 1);
    }

    #[test]
    fn test_transitions_emit_updates() {
        let mut tracker = PlanTracker::build_from_prompt(&parsed(), 120, "C");
        let step_id = tracker.step_ids_for_instrument("Drums")[0].clone();
        let event = tracker.activate(&step_id, Some("drums".into())).unwrap();
        match event {
            StreamEvent::PlanStepUpdate { status, .. } => assert_eq!(status, StepStatus::Active),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(tracker.is_unresolved(&step_id));
        tracker.complete(&step_id, None, None).unwrap();
        assert!(!tracker.is_unresolved(&step_id));
    }

    #[test]
    fn test_finalize_marks_remaining_pending_as_skipped() {
        let mut tracker = PlanTracker::build_from_prompt(&parsed(), 120, "C");
        let total = tracker.steps().len();
        let step_id = tracker.step_ids_for_instrument("Drums")[0].clone();
        tracker.complete(&step_id, None, None);
        let skipped = tracker.finalize_pending_as_skipped();
        assert_eq!(skipped.len(), total - 1);
        assert!(tracker.finalize_pending_as_skipped().is_empty());
    }

    #[test]
    fn test_single_role_has_no_mixing_step() {
        let mut one_role = parsed();
        one_role.roles = vec!["drums".into()];
        let tracker = PlanTracker::build_from_prompt(&one_role, 120, "C");
        assert!(tracker.pending_mixing_steps().is_empty());
    }
}

//! Refinement loop between the analysis and critique agents.
//!
//! Every hop goes through a message envelope, so either agent can be swapped
//! for anything that implements [`Agent`]. The loop is bounded by
//! `max_refinement_iterations`: at most that many critiques and one more
//! analysis call than that.

use crate::agent::Agent;
use crate::error::OrchestratorError;
use crate::message::{task_data, RequestEnvelope};
use crate::models::{AnalysisResult, BugReport, CritiqueVerdict, ReviewStatus, SessionOutcome};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const ORCHESTRATOR_ID: &str = "orchestrator";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub critique_enabled: bool,
    pub max_refinement_iterations: u32,
    /// Bug reports analysed at once in batch mode.
    pub concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            critique_enabled: true,
            max_refinement_iterations: 2,
            concurrency: 2,
        }
    }
}

pub struct Orchestrator {
    analyst: Arc<dyn Agent>,
    critic: Arc<dyn Agent>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(analyst: Arc<dyn Agent>, critic: Arc<dyn Agent>, config: OrchestratorConfig) -> Self {
        Self {
            analyst,
            critic,
            config,
        }
    }

    /// Analyse one bug report, refining until approved or out of budget.
    pub async fn run(&self, bug: &BugReport) -> Result<AnalysisResult, OrchestratorError> {
        let bug_value = encode(bug)?;
        let mut attempt: AnalysisResult = self
            .dispatch(
                self.analyst.as_ref(),
                "analyze_bug",
                task_data([("bug_report", bug_value.clone())]),
            )
            .await?;

        if attempt.outcome == SessionOutcome::Failed {
            warn!("Analysis of '{}' failed; skipping critique", bug.title);
            attempt.critique_approved = false;
            attempt.review_status = ReviewStatus::Unreviewed;
            return Ok(attempt);
        }

        if !self.config.critique_enabled {
            info!("Critique disabled; returning unreviewed result");
            // No critique ran: accepted as-is, but marked unreviewed.
            attempt.critique_approved = true;
            attempt.review_status = ReviewStatus::Unreviewed;
            return Ok(attempt);
        }

        let max = self.config.max_refinement_iterations;
        if max == 0 {
            info!("No refinement budget; returning unreviewed result");
            attempt.critique_approved = false;
            attempt.review_status = ReviewStatus::Unreviewed;
            return Ok(attempt);
        }

        let mut iteration = 1;
        loop {
            let verdict: CritiqueVerdict = self
                .dispatch(
                    self.critic.as_ref(),
                    "critique_analysis",
                    task_data([
                        ("bug_report", bug_value.clone()),
                        ("analysis_result", encode(&attempt)?),
                    ]),
                )
                .await?;

            let score = attempt.apply_confidence_adjustment(verdict.confidence_adjustment);
            attempt.critique_feedback = Some(verdict.feedback_text());
            info!(
                "Refinement {}/{}: {} (confidence now {:.2})",
                iteration,
                max,
                if verdict.approved { "approved" } else { "not approved" },
                score
            );

            if verdict.approved {
                attempt.critique_approved = true;
                attempt.review_status = ReviewStatus::Approved;
                return Ok(attempt);
            }
            if iteration >= max {
                info!("Refinement budget exhausted; returning best effort");
                attempt.critique_approved = false;
                attempt.review_status = ReviewStatus::Rejected;
                return Ok(attempt);
            }

            attempt = self
                .dispatch(
                    self.analyst.as_ref(),
                    "improve_analysis",
                    task_data([
                        ("bug_report", bug_value.clone()),
                        ("previous_result", encode(&attempt)?),
                        ("critique", encode(&verdict)?),
                    ]),
                )
                .await?;
            iteration += 1;
        }
    }

    /// Analyse several reports concurrently. Results keep the input order.
    pub async fn run_batch(
        &self,
        bugs: &[BugReport],
    ) -> Vec<Result<AnalysisResult, OrchestratorError>> {
        let concurrency = self.config.concurrency.max(1);
        info!("Analysing {} bug reports, {} at a time", bugs.len(), concurrency);
        stream::iter(bugs)
            .map(|bug| self.run(bug))
            .buffered(concurrency)
            .collect()
            .await
    }

    async fn dispatch<T: DeserializeOwned>(
        &self,
        agent: &dyn Agent,
        task: &str,
        data: Map<String, Value>,
    ) -> Result<T, OrchestratorError> {
        let request = RequestEnvelope::new(ORCHESTRATOR_ID, agent.agent_id(), task, data);
        let response = agent.process(&request).await;

        let payload = response
            .into_result()
            .map_err(|message| OrchestratorError::AgentRejected {
                agent: agent.agent_id().to_string(),
                task: task.to_string(),
                message,
            })?;
        serde_json::from_value(payload).map_err(|source| OrchestratorError::BadPayload {
            agent: agent.agent_id().to_string(),
            task: task.to_string(),
            source,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, OrchestratorError> {
    serde_json::to_value(value).map_err(|source| OrchestratorError::BadPayload {
        agent: ORCHESTRATOR_ID.to_string(),
        task: "encode".to_string(),
        source,
    })
}

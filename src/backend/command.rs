//! Evaluator that shells out to an external training program.

use std::process::Command;
use std::time::Instant;

use crate::evolution::{CollaboratorError, EvaluationOutcome, EvaluationRequest, Evaluator};
use crate::schema::EvaluatorConfig;

/// Runs `program [args..] <definition> <output_dir> [parent_id]`.
///
/// The program also sees `EVO_CANDIDATE_ID`, `EVO_DEFINITION`,
/// `EVO_OUTPUT_DIR` and, for children, `EVO_PARENT_ID`. The last non-empty
/// line on stdout is the reward. A non-zero exit status or an unparsable
/// reward is an evaluation failure.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationOutcome, CollaboratorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&request.definition)
            .arg(&request.output_dir)
            .env("EVO_CANDIDATE_ID", request.id.to_string())
            .env("EVO_DEFINITION", &request.definition)
            .env("EVO_OUTPUT_DIR", &request.output_dir);
        if let Some(parent) = &request.parent {
            command.arg(parent.to_string());
            command.env("EVO_PARENT_ID", parent.to_string());
        }

        log::debug!("Evaluating {} with {}", request.id, self.program);
        let start = Instant::now();
        let output = command.output().map_err(|source| CollaboratorError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let elapsed = start.elapsed().as_secs_f64();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(CollaboratorError::EvaluationFailed {
                id: request.id.clone(),
                reason: format!("{} ({})", output.status, tail.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reward = parse_reward(&stdout).ok_or_else(|| CollaboratorError::EvaluationFailed {
            id: request.id.clone(),
            reason: "no reward on the last line of output".to_string(),
        })?;

        Ok(EvaluationOutcome {
            reward,
            train_time: Some(elapsed),
        })
    }
}

/// Finite reward on the last non-empty line.
fn parse_reward(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|reward| reward.is_finite())
}

//! Domain validation plugged into the action queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use scoresync_common::{Error, Result};

use crate::action::{ActionPayload, ScoreMutation, SCORES};

/// Domain rules checked before a mutation is written to the queue.
pub trait PayloadValidator: Send + Sync {
    /// Reject the payload with `Error::Validation` if it breaks a rule.
    fn validate(&self, payload: &ActionPayload) -> Result<()>;
}

/// Declared scoring scale of a competition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRules {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
    /// Values at or below this need a justification.
    pub low_extreme: f64,
    /// Values at or above this need a justification.
    pub high_extreme: f64,
}

const EPSILON: f64 = 1e-9;

impl ScoreRules {
    /// 0 to 10 in half points, extremes at 3.0 and 8.5.
    pub fn reference() -> Self {
        Self {
            min: 0.0,
            max: 10.0,
            increment: 0.5,
            low_extreme: 3.0,
            high_extreme: 8.5,
        }
    }

    pub fn is_extreme(&self, value: f64) -> bool {
        value <= self.low_extreme + EPSILON || value >= self.high_extreme - EPSILON
    }

    pub fn check(&self, value: f64, justification: Option<&str>) -> Result<()> {
        if value < self.min - EPSILON || value > self.max + EPSILON {
            return Err(Error::Validation(format!(
                "score {} is outside {}..={}",
                value, self.min, self.max
            )));
        }
        if self.increment > 0.0 {
            let steps = (value - self.min) / self.increment;
            if (steps - steps.round()).abs() > 1e-6 {
                return Err(Error::Validation(format!(
                    "score {} is not a multiple of {}",
                    value, self.increment
                )));
            }
        }
        if self.is_extreme(value) && justification.map_or(true, |j| j.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "score {} is in an extreme band and needs a justification",
                value
            )));
        }
        Ok(())
    }

    fn check_mutation(&self, score: &ScoreMutation) -> Result<()> {
        self.check(score.value, score.justification.as_deref())
    }
}

impl Default for ScoreRules {
    fn default() -> Self {
        Self::reference()
    }
}

impl PayloadValidator for ScoreRules {
    fn validate(&self, payload: &ActionPayload) -> Result<()> {
        match payload {
            ActionPayload::ScoreUpsert(score) => self.check_mutation(score),
            ActionPayload::ResolvedRecord { resource, fields, .. }
                if resource.resource_type == SCORES =>
            {
                let score: ScoreMutation = serde_json::from_value(Value::Object(fields.clone()))
                    .map_err(|e| Error::Validation(format!("resolved score is malformed: {}", e)))?;
                self.check_mutation(&score)
            }
            _ => Ok(()),
        }
    }
}

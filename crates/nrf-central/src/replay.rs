//! Replay scripts
//!
//! A replay script is a list of data requests run in order through the same
//! command path as manual requests. One request per line:
//!
//! ```text
//! # caption, endpoint, direction, payload
//! led on,  01 02 00a4, WRITE, 01 ff
//! battery, 0024,       READ,
//! ```
//!
//! Blank lines and `#` comments are skipped, as are lines with fewer than
//! four fields.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::controller::SessionHandle;
use crate::error::{CentralError, Result};
use crate::gateway::{IoDirection, IoOutcome};

/// One request of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStep {
    /// Free-text caption
    pub caption: String,
    /// Endpoint label
    pub endpoint: String,
    /// Read or write
    pub direction: IoDirection,
    /// Hex payload; ignored for reads
    pub payload: String,
}

/// A parsed script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayScript {
    steps: Vec<ReplayStep>,
}

/// A step that completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Caption of the step
    pub caption: String,
    /// What the request returned
    pub outcome: IoOutcome,
}

/// The step a run stopped at
#[derive(Debug)]
pub struct StepFailure {
    /// Index of the step in the script
    pub index: usize,
    /// Caption of the step
    pub caption: String,
    /// Why it failed
    pub error: CentralError,
}

/// Result of running a script
#[derive(Debug, Default)]
pub struct ReplayReport {
    /// Steps that completed, in order
    pub completed: Vec<StepOutcome>,
    /// First failing step, if any
    pub failure: Option<StepFailure>,
}

impl ReplayReport {
    /// Whether every step ran
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

impl ReplayScript {
    /// Parse script text
    pub fn parse(text: &str) -> Result<Self> {
        let mut steps = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                debug!(line = line_no, fields = fields.len(), "Skipping short replay line");
                continue;
            }

            let direction = fields[2]
                .parse::<IoDirection>()
                .map_err(|reason| CentralError::ReplayParse {
                    line: line_no,
                    reason,
                })?;

            steps.push(ReplayStep {
                caption: fields[0].to_string(),
                endpoint: fields[1].to_string(),
                direction,
                payload: fields[3].to_string(),
            });
        }

        Ok(Self { steps })
    }

    /// Read and parse a script file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let script = Self::parse(&text)?;
        info!(
            path = %path.as_ref().display(),
            steps = script.len(),
            "Loaded replay script"
        );
        Ok(script)
    }

    /// Steps in order
    pub fn steps(&self) -> &[ReplayStep] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the script has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Submit every step in order, stopping at the first failure
    pub async fn run(&self, handle: &SessionHandle) -> ReplayReport {
        let mut report = ReplayReport::default();

        for (index, step) in self.steps.iter().enumerate() {
            debug!(index, caption = %step.caption, "Replaying step");
            match handle
                .submit_io_request(step.direction, &step.endpoint, &step.payload)
                .await
            {
                Ok(outcome) => report.completed.push(StepOutcome {
                    caption: step.caption.clone(),
                    outcome,
                }),
                Err(error) => {
                    warn!(index, caption = %step.caption, %error, "Replay stopped");
                    report.failure = Some(StepFailure {
                        index,
                        caption: step.caption.clone(),
                        error,
                    });
                    break;
                }
            }
        }

        report
    }
}

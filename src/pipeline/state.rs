use serde::Serialize;
use std::fmt;

/// Lifecycle of one PR through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Discovered,
    Downloading,
    Downloaded,
    Analyzing,
    Analyzed,
    Aggregated,
    Evaluated,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// The happy path is strictly linear; `Failed` is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Discovered, Downloading)
                | (Downloading, Downloaded)
                | (Downloaded, Analyzing)
                | (Analyzing, Analyzed)
                | (Analyzed, Aggregated)
                | (Aggregated, Evaluated)
                | (Evaluated, Done)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Discovered => "discovered",
            PipelineState::Downloading => "downloading",
            PipelineState::Downloaded => "downloaded",
            PipelineState::Analyzing => "analyzing",
            PipelineState::Analyzed => "analyzed",
            PipelineState::Aggregated => "aggregated",
            PipelineState::Evaluated => "evaluated",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

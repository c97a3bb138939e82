//! Component health reporting back to the main loop.

/// Terminal states a component can report.
#[derive(Debug, Clone)]
pub enum State {
    UpstreamShutdown(String),
    TreasuryShutdown(String),
    StratumShutdown(String),
}

/// A status message sent over the status channel.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: State,
}

impl Status {
    pub fn upstream(reason: impl Into<String>) -> Self {
        Status {
            state: State::UpstreamShutdown(reason.into()),
        }
    }

    pub fn treasury(reason: impl Into<String>) -> Self {
        Status {
            state: State::TreasuryShutdown(reason.into()),
        }
    }

    pub fn stratum(reason: impl Into<String>) -> Self {
        Status {
            state: State::StratumShutdown(reason.into()),
        }
    }
}

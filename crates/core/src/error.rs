/// Result alias that carries the custom [`TourError`] type.
pub type Result<T> = std::result::Result<T, TourError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum TourError {
    /// Free-form message for host-level failures that have no dedicated
    /// variant.
    #[error("{0}")]
    Message(String),
    /// Two consecutive vertices carry the same measure, so no interpolation
    /// parameter exists between them.
    #[error("degenerate segment: both vertices carry measure {measure}")]
    DegenerateSegment { measure: f64 },
    #[error("malformed path: {0}")]
    MalformedPath(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A playback operation was requested from a state that does not allow it.
    #[error("cannot {action} playback while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
    #[error("no route available: {0}")]
    NoRouteAvailable(String),
    #[error("candidate query failed: {0}")]
    CandidateQuery(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl TourError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

impl From<&str> for TourError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for TourError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

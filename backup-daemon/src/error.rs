use backup_engine::EngineError;

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for DaemonError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(m) => DaemonError::NotFound(m),
            EngineError::Conflict(m) => DaemonError::Conflict(m),
            EngineError::Validation(m) | EngineError::Config(m) => DaemonError::BadRequest(m),
            other => DaemonError::Internal(other.into()),
        }
    }
}

impl From<tokio::task::JoinError> for DaemonError {
    fn from(e: tokio::task::JoinError) -> Self {
        DaemonError::Internal(e.into())
    }
}

impl DaemonError {
    /// Process exit code for the command line.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::NotFound(_) => 3,
            DaemonError::BadRequest(_) => 2,
            DaemonError::Conflict(_) => 4,
            DaemonError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_daemon_errors() {
        assert!(matches!(
            DaemonError::from(EngineError::NotFound("x".into())),
            DaemonError::NotFound(_)
        ));
        assert!(matches!(
            DaemonError::from(EngineError::Config("x".into())),
            DaemonError::BadRequest(_)
        ));
        assert!(matches!(
            DaemonError::from(EngineError::Conflict("x".into())),
            DaemonError::Conflict(_)
        ));
        let internal = DaemonError::from(EngineError::Execution("tar failed".into()));
        assert!(matches!(internal, DaemonError::Internal(_)));
        assert!(internal.to_string().contains("tar failed"));
    }
}

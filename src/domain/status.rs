use std::fmt;

/// State of a single key within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Loading,
    Success,
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Loading => write!(f, "loading"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// Outcome of the task run for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult<T> {
    pub status: TaskStatus,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> TaskResult<T> {
    #[must_use]
    pub fn loading() -> Self {
        Self {
            status: TaskStatus::Loading,
            data: None,
            message: None,
        }
    }

    #[must_use]
    pub fn success(data: T) -> Self {
        Self {
            status: TaskStatus::Success,
            data: Some(data),
            message: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.status == TaskStatus::Loading
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == TaskStatus::Error
    }
}

/// Status of a whole batch, derived from its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverallStatus {
    #[default]
    Idle,
    Loading,
    Success,
    SuccessWithErrors,
    Error,
}

impl OverallStatus {
    /// Derive the batch status from per-key statuses.
    ///
    /// Any loading key keeps the batch loading. Otherwise the batch succeeds, fails,
    /// or partially succeeds depending on the mix. No keys means idle.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut any = false;
        let mut success = false;
        let mut error = false;

        for status in statuses {
            any = true;
            match status {
                TaskStatus::Loading => return OverallStatus::Loading,
                TaskStatus::Success => success = true,
                TaskStatus::Error => error = true,
            }
        }

        match (any, success, error) {
            (false, _, _) => OverallStatus::Idle,
            (true, true, true) => OverallStatus::SuccessWithErrors,
            (true, true, false) => OverallStatus::Success,
            (true, false, _) => OverallStatus::Error,
        }
    }

    /// Derive the status from a success count against the number of requested keys.
    #[must_use]
    pub fn from_counts(succeeded: usize, requested: usize) -> Self {
        if requested == 0 {
            OverallStatus::Idle
        } else if succeeded >= requested {
            OverallStatus::Success
        } else if succeeded > 0 {
            OverallStatus::SuccessWithErrors
        } else {
            OverallStatus::Error
        }
    }

    /// Terminal statuses don't change without an external trigger.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OverallStatus::Idle
                | OverallStatus::Success
                | OverallStatus::SuccessWithErrors
                | OverallStatus::Error
        )
    }

    /// True when at least part of the batch is usable.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            OverallStatus::Success | OverallStatus::SuccessWithErrors
        )
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Idle => write!(f, "idle"),
            OverallStatus::Loading => write!(f, "loading"),
            OverallStatus::Success => write!(f, "success"),
            OverallStatus::SuccessWithErrors => write!(f, "success with errors"),
            OverallStatus::Error => write!(f, "error"),
        }
    }
}

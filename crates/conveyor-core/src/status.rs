/// Status codes shared by every uuid-keyed work-queue table (outbox, timers,
/// job-runs).
///
/// Terminal states are `Done` and `Failed`; there are no transitions out of
/// them except an explicit operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum WorkStatus {
    Ready = 0,
    InProgress = 1,
    Done = 2,
    Failed = 3,
}

impl WorkStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Ready),
            1 => Some(Self::InProgress),
            2 => Some(Self::Done),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Inbox rows carry a wider, string-typed vocabulary: a row is `Seen` when
/// first received, `Processing` while claimed, and terminally `Done` or
/// `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seen => "Seen",
            Self::Processing => "Processing",
            Self::Done => "Done",
            Self::Dead => "Dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Seen" => Some(Self::Seen),
            "Processing" => Some(Self::Processing),
            "Done" => Some(Self::Done),
            "Dead" => Some(Self::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_status_round_trips_codes() {
        for status in [
            WorkStatus::Ready,
            WorkStatus::InProgress,
            WorkStatus::Done,
            WorkStatus::Failed,
        ] {
            assert_eq!(WorkStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(WorkStatus::from_i16(42), None);
    }

    #[test]
    fn inbox_status_round_trips_labels() {
        for status in [
            InboxStatus::Seen,
            InboxStatus::Processing,
            InboxStatus::Done,
            InboxStatus::Dead,
        ] {
            assert_eq!(InboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InboxStatus::parse("Queued"), None);
    }
}

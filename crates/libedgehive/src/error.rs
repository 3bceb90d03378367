use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("mailbox closed: {0}")]
    MailboxClosed(String),

    #[error("module {0} is remote and has no local mailbox")]
    RemoteModule(String),

    #[error("timeout to send message to {0}")]
    SendTimeout(String),

    #[error("timeout to get response for message {0}")]
    RecvTimeout(String),

    #[error(
        "timeout in group {group}: {missing} of {total} members did not reply ({send_failures} timed out on send)"
    )]
    GroupTimeout {
        group: String,
        missing: usize,
        total: usize,
        send_failures: usize,
    },

    #[error("a synchronous send with id {0} is already waiting")]
    DuplicateMessageId(String),

    #[error("timeout connecting to {0}")]
    ConnectTimeout(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Errors a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SendTimeout(_)
                | Self::RecvTimeout(_)
                | Self::GroupTimeout { .. }
                | Self::ConnectTimeout(_)
                | Self::ConnectionClosed(_)
                | Self::Transport(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SendTimeout(_)
                | Self::RecvTimeout(_)
                | Self::GroupTimeout { .. }
                | Self::ConnectTimeout(_)
        )
    }
}

impl From<rustls::Error> for BusError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        assert!(BusError::RecvTimeout("m".into()).is_transient());
        assert!(BusError::SendTimeout("x".into()).is_timeout());
        assert!(!BusError::UnknownModule("x".into()).is_transient());
        assert!(!BusError::MailboxClosed("x".into()).is_timeout());
    }

    #[test]
    fn group_timeout_reports_missing_members() {
        let e = BusError::GroupTimeout {
            group: "g".into(),
            missing: 1,
            total: 3,
            send_failures: 0,
        };
        assert_eq!(
            e.to_string(),
            "timeout in group g: 1 of 3 members did not reply (0 timed out on send)"
        );
    }
}

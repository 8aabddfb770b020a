use thiserror::Error;

/// Endpoint-agnostic error kinds of the link layer. The TX surfaces these
/// to its caller after retry exhaustion; the RX never raises wire problems
/// synchronously and uses them only for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("timeout waiting for acknowledgement")]
    Timeout,
    #[error("communication error (NACK received)")]
    Comm,
    #[error("receiver not responding (handshake timeout)")]
    HostUnreachable,
    #[error("receiver rejected connection (handshake NACK)")]
    ConnRefused,
    #[error("invalid data length")]
    InvalidLength,
    #[error("CRC32 mismatch")]
    CrcMismatch,
    #[error("unexpected sequence number")]
    SeqMismatch,
    #[error("buffer space exhausted")]
    Resource,
    #[error("device is busy")]
    Busy,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation interrupted")]
    Interrupted,
}

impl LinkError {
    /// errno the kernel-driver rendition of this condition would return,
    /// for callers that talk to the real character devices.
    pub fn errno(&self) -> i32 {
        match self {
            LinkError::Timeout => libc::ETIMEDOUT,
            LinkError::Comm => libc::ECOMM,
            LinkError::HostUnreachable => libc::EHOSTUNREACH,
            LinkError::ConnRefused => libc::ECONNREFUSED,
            LinkError::InvalidLength => libc::EINVAL,
            LinkError::CrcMismatch => libc::EBADMSG,
            LinkError::SeqMismatch => libc::EPROTO,
            LinkError::Resource => libc::ENOMEM,
            LinkError::Busy => libc::EBUSY,
            LinkError::WouldBlock => libc::EAGAIN,
            LinkError::Interrupted => libc::EINTR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_the_driver() {
        assert_eq!(LinkError::Timeout.errno(), libc::ETIMEDOUT);
        assert_eq!(LinkError::Comm.errno(), libc::ECOMM);
        assert_eq!(LinkError::HostUnreachable.errno(), libc::EHOSTUNREACH);
        assert_eq!(LinkError::ConnRefused.errno(), libc::ECONNREFUSED);
        assert_eq!(LinkError::Busy.errno(), libc::EBUSY);
    }

    #[test]
    fn messages_name_the_condition() {
        assert_eq!(
            LinkError::Comm.to_string(),
            "communication error (NACK received)"
        );
        assert_eq!(
            LinkError::HostUnreachable.to_string(),
            "receiver not responding (handshake timeout)"
        );
    }
}

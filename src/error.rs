use std::error::Error as StdError;
use thiserror::Error;

/// Error taxonomy for the download engine.
///
/// `Paused` and `Cancelled` are control-flow signals: the supervisor treats
/// them as clean exits, never as failures.
#[derive(Error, Debug, Clone)]
pub enum DownloadError {
    /// The source string could not be interpreted (bad URL, missing file,
    /// malformed magnet).
    #[error("invalid source: {0}")]
    SourceInvalid(String),

    /// The server could not be reached at all.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server answered with an unusable status code.
    #[error("server returned HTTP {0}")]
    BadStatus(u16),

    /// More than the allowed number of redirects.
    #[error("too many redirects")]
    RedirectLoop,

    /// The server refused or ignored a range request. Non-terminal: the
    /// engine falls back to a single stream.
    #[error("server does not support range requests")]
    RangeUnsupported,

    /// Transient socket-level failure (reset, refused, unreachable).
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A read exceeded its deadline beyond the tolerated budget.
    #[error("read timed out: {0}")]
    Timeout(String),

    /// One or more chunks were short after the worker pool joined.
    #[error("download incomplete: chunks {indices:?} short ({downloaded} of {total} bytes)")]
    Incomplete {
        indices: Vec<usize>,
        downloaded: u64,
        total: u64,
    },

    /// The assembled artifact failed size or checksum verification.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The server sent an HTML/JSON error page instead of the file.
    #[error("server returned an error page instead of a file")]
    ErrorPage,

    /// Cooperative pause. Carries the human-readable reason.
    #[error("paused: {0}")]
    Paused(String),

    /// User-requested termination. Temp files are retained.
    #[error("cancelled")]
    Cancelled,

    /// The torrent source could not be parsed as metainfo.
    #[error("failed to parse torrent: {0}")]
    BadMetainfo(String),

    /// The underlying BitTorrent engine reported an unrecoverable error.
    #[error("torrent engine error: {0}")]
    TorrentEngine(String),

    /// Local filesystem failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// State store failure.
    #[error("state store error: {0}")]
    Store(String),
}

impl DownloadError {
    /// Transient errors are retried by the chunk retry loop and counted by
    /// the connection-failure handler; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DownloadError::ConnectionLost(_)
                | DownloadError::Timeout(_)
                | DownloadError::Unreachable(_)
        )
    }

    /// True for the statuses the degradation detector treats as the server
    /// refusing concurrent range requests.
    pub fn is_range_hostile_status(status: u16) -> bool {
        matches!(status, 400 | 403 | 429 | 503)
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => DownloadError::ConnectionLost(err.to_string()),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => DownloadError::Timeout(err.to_string()),
            _ => DownloadError::Io(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for DownloadError {
    fn from(err: rusqlite::Error) -> Self {
        DownloadError::Store(err.to_string())
    }
}

/// Classify a `reqwest` failure using its native predicates rather than
/// message substrings.
pub fn classify_reqwest(err: &reqwest::Error) -> DownloadError {
    if err.is_redirect() {
        return DownloadError::RedirectLoop;
    }
    if err.is_timeout() {
        return DownloadError::Timeout(err.to_string());
    }
    if err.is_connect() {
        return DownloadError::Unreachable(err.to_string());
    }
    // Mid-body failures surface as decode/request errors wrapping an io
    // error; walk the chain for a socket-level kind.
    let mut source = StdError::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return DownloadError::from(std::io::Error::new(io.kind(), io.to_string()));
        }
        source = StdError::source(inner);
    }
    if err.is_body() || err.is_decode() {
        return DownloadError::ConnectionLost(err.to_string());
    }
    DownloadError::Unreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_to_taxonomy() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(
            DownloadError::from(reset),
            DownloadError::ConnectionLost(_)
        ));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        assert!(matches!(
            DownloadError::from(timed_out),
            DownloadError::Timeout(_)
        ));

        let perm = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(DownloadError::from(perm), DownloadError::Io(_)));
    }

    #[test]
    fn transient_set_is_retryable_only() {
        assert!(DownloadError::ConnectionLost("x".into()).is_transient());
        assert!(DownloadError::Timeout("x".into()).is_transient());
        assert!(!DownloadError::Integrity("x".into()).is_transient());
        assert!(!DownloadError::Cancelled.is_transient());
        assert!(!DownloadError::Paused("x".into()).is_transient());
    }

    #[test]
    fn range_hostile_statuses() {
        for s in [400u16, 403, 429, 503] {
            assert!(DownloadError::is_range_hostile_status(s));
        }
        for s in [200u16, 206, 404, 500] {
            assert!(!DownloadError::is_range_hostile_status(s));
        }
    }
}

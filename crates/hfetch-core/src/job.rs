//! Control-channel message types: jobs in, results out.

use std::io::Write;

/// Destination for fetched body bytes. Ownership moves into the subsystem
/// with the job and the sink is dropped (closed) exactly once when the fetch
/// terminates, whatever the outcome.
pub type Sink = Box<dyn Write + Send>;

/// One fetch request, handed to the reactor over the control channel.
/// Never mutated after submission.
pub struct FetchJob {
    /// Opaque correlation id; echoed back in the matching [`FetchResult`].
    pub id: u64,
    /// Target URL. Only `https` is accepted.
    pub url: String,
    /// Optional `If-Modified-Since` value, sent verbatim. Preserved across
    /// redirects.
    pub if_modified_since: Option<String>,
    /// Where body bytes go.
    pub sink: Sink,
}

impl std::fmt::Debug for FetchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchJob")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("if_modified_since", &self.if_modified_since)
            .finish_non_exhaustive()
    }
}

/// Tri-state outcome of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Fresh content; the full body was written to the sink.
    Ok,
    /// Server answered 304; nothing was written to the sink.
    NotModified,
    /// Anything else. The sink may hold a truncated prefix; it is not
    /// rolled back.
    Failed,
}

/// Completion report for one admitted job. Exactly one result is produced
/// per job; results are not ordered relative to submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub id: u64,
    pub outcome: FetchOutcome,
    /// The server's `Last-Modified`, if any. Only present for `Ok` and
    /// `NotModified`.
    pub last_modified: Option<String>,
}

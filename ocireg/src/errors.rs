pub type Result<T, E = Error> = std::result::Result<T, E>;

// every kind the engine can surface; the message carries the operation,
// reference, and digest where one applies so callers can log it as-is
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("canceled: {0}")]
    Canceled(String),
    #[error("backoff limit reached: {0}")]
    BackoffLimit(#[source] Box<Error>),
    #[error("all mirrors failed: {0}")]
    AllMirrorsFailed(#[source] Box<Error>),
    #[error("reference is missing a tag: {0}")]
    MissingTag(String),
    #[error("reference is missing a digest: {0}")]
    MissingDigest(String),
    #[error("reference is missing a tag or digest: {0}")]
    MissingTagOrDigest(String),
    #[error("reference is missing a repository name: {0}")]
    MissingName(String),
    #[error("response is missing a location header: {0}")]
    MissingLocation(String),
    // sentinel: the registry declined a mount and handed back an upload
    // session at this location, not a terminal failure
    #[error("mount returned an upload location: {0}")]
    MountReturnedLocation(String),
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },
    #[error("size mismatch: expected {expected} bytes, read {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("parsing failed: {0}")]
    ParsingFailed(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("unsupported config version: {0}")]
    UnsupportedConfigVersion(String),
    #[error("unsupported api: {0}")]
    UnsupportedApi(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("no api endpoint for host flavor: {0}")]
    ApiNotFound(String),
    #[error("unexpected http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("manifest body is not set: {0}")]
    ManifestNotSet(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    OciSpec(#[from] oci_spec::OciSpecError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map a terminal http status onto the typed kind the api layer reports.
    pub(crate) fn from_status(status: u16, ctx: &str, url: &str) -> Error {
        match status {
            404 => Error::NotFound(ctx.to_string()),
            401 | 403 => Error::Unauthorized(ctx.to_string()),
            429 => Error::RateLimit(ctx.to_string()),
            _ => Error::HttpStatus {
                status,
                url: url.to_string(),
            },
        }
    }

    // peel retry wrappers so 404-after-failover still reads as not-found;
    // other failures keep their all-mirrors-failed/backoff-limit kind
    pub(crate) fn map_terminal(self, ctx: &str) -> Error {
        match self {
            Error::AllMirrorsFailed(inner) => match *inner {
                Error::HttpStatus {
                    status: status @ (401 | 403 | 404 | 429),
                    url,
                } => Error::from_status(status, ctx, &url),
                other => Error::AllMirrorsFailed(Box::new(other)),
            },
            Error::BackoffLimit(inner) => match *inner {
                Error::HttpStatus {
                    status: status @ (401 | 403 | 404 | 429),
                    url,
                } => Error::from_status(status, ctx, &url),
                other => Error::BackoffLimit(Box::new(other)),
            },
            Error::HttpStatus { status, url } => Error::from_status(status, ctx, &url),
            other => other,
        }
    }
}

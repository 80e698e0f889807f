#[derive(Debug, derive_more::Display, derive_more::IsVariant)]
enum ErrorPayload {
    #[display(fmt = "A barrier needs at least one participant")]
    ZeroParticipants,

    #[display(fmt = "A bounded queue needs a capacity of at least one")]
    ZeroCapacity,

    #[display(fmt = "Invalid configuration: {}", _0)]
    InvalidConfig(String),

    #[display(fmt = "The wait was cancelled")]
    Cancelled,

    #[display(fmt = "The wait timed out")]
    TimedOut,

    #[display(fmt = "The other half of the channel has gone away")]
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
#[error("{payload}")]
pub struct Error {
    payload: ErrorPayload,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn from_payload(payload: ErrorPayload) -> Self {
        Error { payload }
    }

    pub(crate) fn zero_participants() -> Self {
        Self::from_payload(ErrorPayload::ZeroParticipants)
    }

    pub(crate) fn zero_capacity() -> Self {
        Self::from_payload(ErrorPayload::ZeroCapacity)
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::from_payload(ErrorPayload::InvalidConfig(message.into()))
    }

    pub(crate) fn cancelled() -> Self {
        Self::from_payload(ErrorPayload::Cancelled)
    }

    pub(crate) fn timed_out() -> Self {
        Self::from_payload(ErrorPayload::TimedOut)
    }

    pub(crate) fn disconnected() -> Self {
        Self::from_payload(ErrorPayload::Disconnected)
    }

    /// Did a [crate::CancelToken] end the wait?
    pub fn is_cancelled(&self) -> bool {
        self.payload.is_cancelled()
    }

    /// Did the deadline of a `*_timeout` call elapse?
    pub fn is_timed_out(&self) -> bool {
        self.payload.is_timed_out()
    }

    /// Was the wait abandoned for any reason, either cancellation or timeout?
    pub fn is_interrupted(&self) -> bool {
        self.is_cancelled() || self.is_timed_out()
    }

    /// Did constructing a primitive or a configuration fail?
    pub fn is_construction(&self) -> bool {
        self.payload.is_zero_participants()
            || self.payload.is_zero_capacity()
            || self.payload.is_invalid_config()
    }

    pub fn is_disconnected(&self) -> bool {
        self.payload.is_disconnected()
    }
}

/// Returned by enqueue operations which gave up before the item went in.
///
/// The item is handed back to the caller rather than dropped.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct EnqueueError<T> {
    error: Error,
    item: T,
}

impl<T> EnqueueError<T> {
    pub(crate) fn new(error: Error, item: T) -> Self {
        Self { error, item }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Get back the item which was not enqueued.
    pub fn into_item(self) -> T {
        self.item
    }

    pub fn into_parts(self) -> (Error, T) {
        (self.error, self.item)
    }
}

impl<T> From<EnqueueError<T>> for Error {
    fn from(value: EnqueueError<T>) -> Error {
        value.error
    }
}

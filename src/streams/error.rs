use std::{error::Error, fmt, sync::Arc};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("{}", aborted_message(.0))]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream is locked to a writer")]
    Locked,
    #[error("Writer was released")]
    Released,
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(f64),
    #[error("Invalid high water mark: {0}")]
    InvalidHighWaterMark(f64),
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

fn aborted_message(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!("Stream was aborted: {}", reason),
        None => "Stream was aborted".to_string(),
    }
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for MessageError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(MessageError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(MessageError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows sinks to use `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use writable_streams::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct DiskFull;
///
/// impl std::fmt::Display for DiskFull {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "disk full")
///     }
/// }
///
/// impl std::error::Error for DiskFull {}
///
/// impl_stream_error_from!(DiskFull);
///
/// fn flush_to_disk() -> Result<(), StreamError> {
///     Err::<(), _>(DiskFull)?;
///     Ok(())
/// }
///
/// assert_eq!(flush_to_disk().unwrap_err().to_string(), "disk full");
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

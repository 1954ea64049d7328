/// Resilience helpers shared by the image services
///
/// Currently provides **Retry**: exponential backoff with jitter for transient
/// failures, with an optional predicate deciding which errors are worth
/// another attempt.
///
/// # Example: Record update with retry
///
/// ```rust,no_run
/// use resilience::{retry_if, RetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = RetryConfig::default();
///
///     let result = retry_if(
///         &config,
///         "mark_done",
///         |err: &String| err.contains("connection"),
///         || async {
///             // Your database update
///             Ok::<_, String>(())
///         },
///     )
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;

pub use retry::{retry_if, with_retry, RetryConfig, RetryError};

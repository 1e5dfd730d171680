//! Structured logging helpers.
//!
//! Provides operation timing for schedule reloads and syncs, and the startup
//! banner macro used by the binary.

use std::time::Instant;

/// Operation timer for measuring and logging execution duration.
///
/// # Examples
///
/// ```rust,ignore
/// use dbbeat::logging::OpTimer;
///
/// let timer = OpTimer::new("scheduler", "reload");
/// let rows = store.load_enabled().await;
/// timer.finish_with_result(rows.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    /// Component being timed (e.g., "scheduler", "store").
    component: String,
    /// Operation being performed (e.g., "reload", "sync").
    operation: String,
    start: Instant,
}

impl OpTimer {
    /// Creates a new operation timer and logs the start.
    #[must_use]
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        let component = component.into();
        let operation = operation.into();

        tracing::debug!(
            component = %component,
            operation = %operation,
            "Operation started"
        );

        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Milliseconds since the timer started.
    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    /// Finishes the timer and logs the duration along with an item count.
    pub fn finish_with_count(self, count: usize) {
        let duration_ms = self.elapsed_ms();

        tracing::debug!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = duration_ms,
            count = count,
            "Operation completed"
        );
    }

    /// Finishes the timer with result-aware logging.
    ///
    /// Successful operations log at debug level since reloads and syncs run
    /// on every tick; failures log at error level with the error attached.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.elapsed_ms();

        match result {
            Ok(_) => {
                tracing::debug!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    "Operation completed successfully"
                );
            }
            Err(e) => {
                tracing::error!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    error = %e,
                    "Operation failed"
                );
            }
        }
    }
}

/// Macro for logging the startup banner.
///
/// # Examples
///
/// ```rust,ignore
/// log_banner!("dbbeat v0.1.0");
/// ```
#[macro_export]
macro_rules! log_banner {
    ($title:expr) => {
        tracing::info!("═══════════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("═══════════════════════════════════════════════════════");
    };
}

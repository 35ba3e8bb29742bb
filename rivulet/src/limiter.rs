//! Per-tenant admission limits.

use crate::error::LimitError;

/// Decides whether a tenant may create another stream.
pub trait Limiter: Send + Sync {
    /// Checks that a tenant currently owning `current` streams may create
    /// one more.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::MaxStreamsPerUser`] when the tenant is at its cap.
    fn assert_max_streams_per_user(&self, tenant: &str, current: usize) -> Result<(), LimitError>;
}

/// A limiter with one fixed cap for every tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticLimiter {
    max_streams: usize,
}

impl StaticLimiter {
    /// Creates a limiter allowing `max_streams` per tenant; `0` disables the cap.
    pub fn new(max_streams: usize) -> Self {
        Self { max_streams }
    }

    /// Creates a limiter that admits everything.
    pub fn unlimited() -> Self {
        Self::new(0)
    }
}

impl Limiter for StaticLimiter {
    fn assert_max_streams_per_user(&self, tenant: &str, current: usize) -> Result<(), LimitError> {
        if self.max_streams == 0 || current < self.max_streams {
            return Ok(());
        }
        Err(LimitError::MaxStreamsPerUser {
            tenant: tenant.to_string(),
            limit: self.max_streams,
            current,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_limiter() {
        let limiter = StaticLimiter::new(2);
        assert!(limiter.assert_max_streams_per_user("t", 0).is_ok());
        assert!(limiter.assert_max_streams_per_user("t", 1).is_ok());
        assert_eq!(
            limiter.assert_max_streams_per_user("t", 2),
            Err(LimitError::MaxStreamsPerUser {
                tenant: "t".to_string(),
                limit: 2,
                current: 2,
            })
        );

        assert!(
            StaticLimiter::unlimited()
                .assert_max_streams_per_user("t", usize::MAX)
                .is_ok()
        );
    }
}

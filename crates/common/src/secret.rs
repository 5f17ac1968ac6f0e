//! Secret wrapper for sensitive values
//!
//! OAuth access and refresh tokens travel through the pool and the request
//! path as `Secret<String>` so an accidental `{:?}` in a log line can never
//! leak them. The inner value is zeroized on drop. Byte-backed secrets
//! additionally support constant-time matching, used when a presented OAuth
//! state is checked against a stored flow verifier.

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Wrap a sensitive value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize + AsRef<[u8]>> Secret<T> {
    /// Constant-time equality against a caller-supplied candidate.
    ///
    /// The comparison touches every byte regardless of where the values
    /// first differ. Flow state keys and verifiers are matched through
    /// this rather than `==`.
    pub fn verify(&self, candidate: impl AsRef<[u8]>) -> bool {
        let stored = self.0.as_ref();
        let candidate = candidate.as_ref();

        let mut diff = stored.len() ^ candidate.len();
        for (a, b) in stored.iter().zip(candidate.iter()) {
            diff |= usize::from(a ^ b);
        }
        diff == 0
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

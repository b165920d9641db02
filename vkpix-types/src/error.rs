use std::fmt;

/// Which allocator family rejected a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Host,
    Blob,
    Weight,
    Staging,
    Dedicated,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "host",
            Self::Blob => "blob",
            Self::Weight => "weight",
            Self::Staging => "staging",
            Self::Dedicated => "dedicated",
        };
        f.write_str(name)
    }
}

/// Every failure the runtime can report.
///
/// All fallible operations return this by value; there is no panic channel.
/// Recorder-local failures are sticky: the recorder remembers the first error
/// and surfaces it from `submit_and_wait`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("no compatible GPU")]
    NoDevice,
    #[error("device lost; the registry entry is poisoned until the instance is recreated")]
    DeviceLost,
    #[error("{kind} allocator failed to provide {bytes} bytes")]
    Alloc { bytes: usize, kind: AllocKind },
    #[error("shader compilation failed: {log}")]
    ShaderCompile { log: String },
    #[error("shader reflection failed: {reason}")]
    ShaderReflect { reason: String },
    #[error("queue submit failed with driver status {status}")]
    Submit { status: i32 },
    #[error("fence wait timed out")]
    Timeout,
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
    #[error("device lacks requested capability: {feature}")]
    UnsupportedFeature { feature: &'static str },
}

impl Error {
    /// True when the error invalidates all cached per-device state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = Error::Alloc {
            bytes: 4096,
            kind: AllocKind::Staging,
        };
        assert_eq!(e.to_string(), "staging allocator failed to provide 4096 bytes");
        assert!(!e.is_fatal());
        assert!(Error::DeviceLost.is_fatal());
    }
}

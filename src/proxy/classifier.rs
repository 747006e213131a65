/// How a request path is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Keyed by path and body hash, short TTL, never served stale.
    Bypass,
    /// Keyed by path alone, kept forever as the outage fallback.
    PathKeyed,
}

impl PathClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathClass::Bypass => "bypass",
            PathClass::PathKeyed => "path_keyed",
        }
    }
}

/// Returns `Bypass` if `path` contains any of `patterns` as a plain substring.
pub fn classify<S: AsRef<str>>(path: &str, patterns: &[S]) -> PathClass {
    if patterns.iter().any(|pattern| path.contains(pattern.as_ref())) {
        PathClass::Bypass
    } else {
        PathClass::PathKeyed
    }
}

/// Bypass patterns from the configuration.
#[derive(Debug, Clone, Default)]
pub struct PathClassifier {
    patterns: Vec<String>,
}

impl PathClassifier {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn classify(&self, path: &str) -> PathClass {
        classify(path, &self.patterns)
    }
}

use once_cell::sync::Lazy;

pub const DEFAULT_GC_THRESHOLD: usize = 4096;

/// Bridge settings read once from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbiConfig {
    /// `MOLT_TRACE_CAPI`: log shadow lifecycle events to stderr.
    pub trace: bool,
    /// `MOLT_CAPI_GC_THRESHOLD`: host allocations between automatic
    /// collections when an argument frame closes. `0` disables them.
    pub gc_threshold: usize,
    /// `MOLT_CAPI_VERIFY_REFCNT` or the `refcount_verify` feature.
    pub verify_refcnt: bool,
}

impl Default for AbiConfig {
    fn default() -> Self {
        Self {
            trace: false,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            verify_refcnt: cfg!(feature = "refcount_verify"),
        }
    }
}

fn parse_flag(raw: Option<String>) -> bool {
    matches!(raw.as_deref().map(str::trim), Some("1" | "true" | "yes" | "on"))
}

impl AbiConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let gc_threshold = lookup("MOLT_CAPI_GC_THRESHOLD")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(defaults.gc_threshold);
        Self {
            trace: parse_flag(lookup("MOLT_TRACE_CAPI")),
            gc_threshold,
            verify_refcnt: defaults.verify_refcnt || parse_flag(lookup("MOLT_CAPI_VERIFY_REFCNT")),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

static CONFIG: Lazy<AbiConfig> = Lazy::new(AbiConfig::from_env);

pub fn config() -> &'static AbiConfig {
    &CONFIG
}

pub(crate) fn trace_capi() -> bool {
    CONFIG.trace
}

macro_rules! capi_trace {
    ($($arg:tt)*) => {
        if $crate::config::trace_capi() {
            eprintln!("molt capi: {}", format_args!($($arg)*));
        }
    };
}
pub(crate) use capi_trace;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = AbiConfig::from_lookup(|_| None);
        assert!(!cfg.trace);
        assert_eq!(cfg.gc_threshold, DEFAULT_GC_THRESHOLD);
        assert_eq!(cfg.verify_refcnt, cfg!(feature = "refcount_verify"));
    }

    #[test]
    fn reads_each_variable() {
        let cfg = AbiConfig::from_lookup(lookup_in(&[
            ("MOLT_TRACE_CAPI", "1"),
            ("MOLT_CAPI_GC_THRESHOLD", " 0 "),
            ("MOLT_CAPI_VERIFY_REFCNT", "true"),
        ]));
        assert!(cfg.trace);
        assert_eq!(cfg.gc_threshold, 0);
        assert!(cfg.verify_refcnt);
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = AbiConfig::from_lookup(lookup_in(&[
            ("MOLT_TRACE_CAPI", "0"),
            ("MOLT_CAPI_GC_THRESHOLD", "lots"),
        ]));
        assert!(!cfg.trace);
        assert_eq!(cfg.gc_threshold, DEFAULT_GC_THRESHOLD);
    }
}

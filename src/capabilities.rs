//! The closed set of globals handed to the entry program.
//!
//! The JavaScript side lives in `src/bootstrap.js`; this record names what
//! it installs. The bootstrap refuses any name it has no implementation
//! for, so adding a capability means touching both files.

use serde::Serialize;

/// Value of `process.env.NODE_ENV` (and the bare `NODE_ENV` global).
pub const NODE_ENV: &str = "server";

/// Every global the sandbox sees besides the ECMAScript built-ins.
pub const GLOBALS: &[&str] = &[
    "fetch",
    "Request",
    "Response",
    "Headers",
    "URL",
    "console",
    "process",
    "NODE_ENV",
    "setTimeout",
    "setImmediate",
    "clearTimeout",
];

/// Fixed capability record passed to `__fab_prepare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityEnvironment {
    pub node_env: &'static str,
    pub globals: Vec<&'static str>,
}

impl CapabilityEnvironment {
    pub fn build() -> Self {
        Self {
            node_env: NODE_ENV,
            globals: GLOBALS.to_vec(),
        }
    }

    /// Script that installs this record and a fresh `module.exports` slot.
    pub(crate) fn prepare_script(&self) -> Result<String, serde_json::Error> {
        Ok(format!(
            "globalThis.__fab_prepare({})",
            serde_json::to_string(self)?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_is_fixed() {
        assert_eq!(CapabilityEnvironment::build(), CapabilityEnvironment::build());
    }

    #[test]
    fn test_no_host_capabilities() {
        let env = CapabilityEnvironment::build();
        for forbidden in ["require", "Deno", "fs", "child_process", "WebSocket"] {
            assert!(!env.globals.contains(&forbidden), "{forbidden} must not be exposed");
        }
    }

    #[test]
    fn test_prepare_script_is_json() {
        let script = CapabilityEnvironment::build().prepare_script().unwrap();
        assert!(script.starts_with("globalThis.__fab_prepare({"));
        assert!(script.contains(r#""nodeEnv":"server""#));
        assert!(script.contains(r#""setImmediate""#));
    }
}

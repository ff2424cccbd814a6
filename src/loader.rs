//! Module loader that only serves JavaScript out of the in-memory bundle.
//! Blocks network, filesystem and inline-source imports; restricts to .js/.mjs.

use std::sync::Arc;

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};

use crate::bundle::Bundle;

/// URL scheme under which bundle entries are addressed.
pub const BUNDLE_SCHEME: &str = "fab";

/// Specifier of the entry program, used as the script name and as the
/// referrer for dynamic imports made from it.
pub const ENTRY_SPECIFIER: &str = "fab:///server.js";

/// A module loader that resolves every import against the bundle.
///
/// - No network access (http/https URLs rejected)
/// - No host filesystem access (file URLs rejected)
/// - Only .js and .mjs entries allowed
pub struct BundleLoader {
    bundle: Arc<Bundle>,
}

impl BundleLoader {
    pub fn new(bundle: Arc<Bundle>) -> Self {
        Self { bundle }
    }

    /// Validate file extension is allowed (.js or .mjs only)
    fn is_extension_allowed(path: &str) -> bool {
        path.ends_with(".js") || path.ends_with(".mjs")
    }
}

impl ModuleLoader for BundleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("data:")
            || specifier.starts_with("blob:")
            || specifier.starts_with("file:")
        {
            return Err(anyhow!("Imports outside the bundle are forbidden: {}", specifier));
        }

        let resolved = if specifier.starts_with("./")
            || specifier.starts_with("../")
            || specifier.starts_with('/')
        {
            let referrer_url = ModuleSpecifier::parse(referrer)
                .or_else(|_| ModuleSpecifier::parse(ENTRY_SPECIFIER))
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            referrer_url
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))?
        } else if specifier.starts_with("fab:") {
            ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid bundle URL '{}': {}", specifier, e))?
        } else {
            // Bare specifier - resolve from the bundle root
            ModuleSpecifier::parse(&format!("{BUNDLE_SCHEME}:///{specifier}"))
                .map_err(|e| anyhow!("Invalid bare specifier '{}': {}", specifier, e))?
        };

        if resolved.scheme() != BUNDLE_SCHEME {
            return Err(anyhow!(
                "Only {}: URLs allowed, got: {}",
                BUNDLE_SCHEME,
                resolved.scheme()
            ));
        }

        if !Self::is_extension_allowed(resolved.path()) {
            return Err(anyhow!(
                "Only .js and .mjs files allowed, got: {}",
                resolved.path()
            ));
        }

        if self.bundle.get(resolved.path()).is_none() {
            return Err(anyhow!("Module not found in bundle: {}", resolved.path()));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        if module_specifier.scheme() != BUNDLE_SCHEME {
            return ModuleLoadResponse::Sync(Err(anyhow!(
                "Access denied: {}",
                module_specifier
            )));
        }

        let path = module_specifier.path();
        let Some(bytes) = self.bundle.get(path) else {
            return ModuleLoadResponse::Sync(Err(anyhow!("Module not found in bundle: {}", path)));
        };

        let code = match std::str::from_utf8(bytes) {
            Ok(code) => code.to_string(),
            Err(e) => {
                return ModuleLoadResponse::Sync(Err(anyhow!(
                    "Module '{}' is not valid UTF-8: {}",
                    path,
                    e
                )));
            }
        };

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            module_specifier,
            None,
        )))
    }
}

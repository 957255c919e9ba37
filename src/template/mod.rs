//! Lazily compiled body templates.
//!
//! Templates are loaded from `base_dir` on first use and kept for the life
//! of the cache. Names ending in `.html` get HTML auto-escaping.

use minijinja::{Environment, UndefinedBehavior};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::config::TemplateConfig;
use crate::errors::{SmtpError, SmtpResult};

/// Name-keyed cache of compiled templates.
pub struct TemplateCache {
    env: RwLock<Environment<'static>>,
    base_dir: PathBuf,
    default_ext: String,
}

impl fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCache")
            .field("base_dir", &self.base_dir)
            .field("default_ext", &self.default_ext)
            .field("cached", &self.len())
            .finish()
    }
}

impl TemplateCache {
    /// Creates an empty cache.
    pub fn new(config: &TemplateConfig) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            env: RwLock::new(env),
            base_dir: config.base_dir.clone(),
            default_ext: config.default_ext.clone(),
        }
    }

    /// Gives mutable access to the environment, e.g. to register functions
    /// and filters templates may call.
    pub fn with_functions<F>(&self, configure: F)
    where
        F: FnOnce(&mut Environment<'static>),
    {
        configure(&mut self.env.write());
    }

    /// Returns the number of compiled templates.
    pub fn len(&self) -> usize {
        self.env.read().templates().count()
    }

    /// Returns true if nothing has been compiled yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the template `name` with `context`, loading and compiling it
    /// on first use.
    pub async fn render<S: Serialize>(&self, name: &str, context: S) -> SmtpResult<String> {
        let key = self.resolve(name)?;

        {
            let env = self.env.read();
            if let Ok(template) = env.get_template(&key) {
                return Ok(template.render(&context)?);
            }
        }

        let path = self.base_dir.join(&key);
        let source = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SmtpError::template(format!("Failed to load template {}: {}", path.display(), e))
                .with_cause(e)
        })?;

        // A concurrent miss on the same name may compile it too; the last
        // insert wins.
        self.env.write().add_template_owned(key.clone(), source)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(template = %key, "Compiled template");

        let env = self.env.read();
        let template = env.get_template(&key)?;
        Ok(template.render(&context)?)
    }

    fn resolve(&self, name: &str) -> SmtpResult<String> {
        let path = Path::new(name);
        if name.is_empty()
            || path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SmtpError::template(format!("Invalid template name: {:?}", name)));
        }

        if path.extension().is_some() || self.default_ext.is_empty() {
            return Ok(name.to_string());
        }
        let ext = self.default_ext.trim_start_matches('.');
        Ok(format!("{}.{}", name, ext))
    }
}

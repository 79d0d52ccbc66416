//! Context for prefixing the logs of a run.
//!

use core::fmt::Display;

use shared::Tier;

/// Holds the context for the current run. Used for prefixing logs.
#[derive(Default, Debug, Clone)]
pub struct Context {
    /// The backup or restore this run is for.
    pub id: Option<String>,
    /// The tier of an automatic backup.
    pub tier: Option<Tier>,
    /// The current context
    pub current_context: &'static str,
}

impl Context {
    /// Create a context for a run.
    pub fn new(id: &str, tier: Option<Tier>) -> Self {
        Self {
            id: Some(id.to_string()),
            tier,
            current_context: "",
        }
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(id) = &self.id {
            write!(f, "[{id}] ")?;
        }

        if let Some(tier) = &self.tier {
            write!(f, "[{tier}] ")?;
        }

        if !self.current_context.is_empty() {
            write!(f, "[{}] ", self.current_context)?;
        }

        Ok(())
    }
}

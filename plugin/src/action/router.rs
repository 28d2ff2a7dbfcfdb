use super::{Action, ActionScript};
use crate::errors::ActionError;
use std::collections::HashMap;

/// Maps request paths to scripts.
///
/// Resolution order for a path (trailing slashes trimmed):
/// 1. the exact path,
/// 2. `path/*`,
/// 3. `prefix/*` for each shorter `/`-delimited prefix, deepest first,
/// 4. the default script.
///
/// A configured log filter runs after every request. Its result is ignored.
pub struct ActionRouter {
    routes: HashMap<String, ActionScript>,
    default: ActionScript,
    log_filter: Option<ActionScript>,
}

impl ActionRouter {
    pub fn new(default: ActionScript) -> Self {
        ActionRouter {
            routes: HashMap::new(),
            default,
            log_filter: None,
        }
    }

    pub fn route(mut self, path: &str, script: ActionScript) -> Self {
        self.routes.insert(path.to_string(), script);
        self
    }

    pub fn with_log_filter(mut self, log_filter: ActionScript) -> Self {
        self.log_filter = Some(log_filter);
        self
    }

    /// Returns the script `path` is routed to.
    pub fn resolve(&self, path: &str) -> &ActionScript {
        let mut key = path.trim_end_matches('/');
        if let Some(script) = self.routes.get(key) {
            return script;
        }

        loop {
            if let Some(script) = self.routes.get(&format!("{key}/*")) {
                return script;
            }
            match key.rfind('/') {
                Some(n) => key = &key[..n],
                None => break,
            }
        }

        &self.default
    }

    /// Runs the script for the action's path, then the log filter.
    pub async fn run_route(&self, action: &mut dyn Action) -> Result<(), ActionError> {
        let path = action.path().to_string();
        let result = self.resolve(&path).run(action).await;

        if let Some(log_filter) = &self.log_filter {
            let _ = log_filter.execute(action).await;
        }

        result
    }
}

use super::{Action, ActionFunc};
use crate::errors::ActionError;

/// An ordered list of requirements ending with the handler.
///
/// Running a script executes its entries strictly in order and stops at the
/// first error. The failing entry has already responded.
#[derive(Clone, Default)]
pub struct ActionScript {
    funcs: Vec<ActionFunc>,
}

impl ActionScript {
    pub fn new(funcs: Vec<ActionFunc>) -> Self {
        ActionScript { funcs }
    }

    /// Builds a script from optional entries; `None` entries are skipped.
    pub fn with_optional(funcs: impl IntoIterator<Item = Option<ActionFunc>>) -> Self {
        ActionScript {
            funcs: funcs.into_iter().flatten().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Runs the script without touching the recorded error.
    pub async fn execute(&self, action: &mut dyn Action) -> Result<(), ActionError> {
        for func in &self.funcs {
            func(action).await?;
        }
        Ok(())
    }

    /// Runs the script and records its error on the action's context.
    pub async fn run(&self, action: &mut dyn Action) -> Result<(), ActionError> {
        let result = self.execute(action).await;
        if let Err(err) = &result {
            action.context_mut().record_error(err);
        }
        result
    }
}

/// Builds an [`ActionScript`] from requirement and handler functions.
#[macro_export]
macro_rules! action_script {
    ($($func:expr),* $(,)?) => {
        $crate::action::ActionScript::new(vec![$($func as $crate::action::ActionFunc),*])
    };
}

//! Filter evaluation and template rendering over an [`EvalEnv`].
//!
//! Both run in strict mode: referencing a name that is not in the
//! environment is an error, never an empty string. Filters are
//! expressions such as `check.status == "unhealthy"`; templates use
//! `{{ ... }}` interpolation.

use crate::env::EvalEnv;
use minijinja::{Environment, UndefinedBehavior};
use std::collections::BTreeMap;

pub struct Templater {
    env: Environment<'static>,
}

impl Default for Templater {
    fn default() -> Self {
        Self::new()
    }
}

impl Templater {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Evaluates a boolean filter. An empty filter matches everything.
    pub fn eval(&self, filter: &str, env: &EvalEnv) -> Result<bool, minijinja::Error> {
        if filter.trim().is_empty() {
            return Ok(true);
        }
        let expr = self.env.compile_expression(filter)?;
        Ok(expr.eval(env.as_map())?.is_true())
    }

    /// Like [`Templater::eval`] but any evaluation error counts as no match.
    pub fn matches(&self, filter: &str, env: &EvalEnv) -> bool {
        match self.eval(filter, env) {
            Ok(matched) => matched,
            Err(e) => {
                tracing::debug!(filter, error = %e, "filter failed to evaluate, treating as no match");
                false
            }
        }
    }

    pub fn render(&self, template: &str, env: &EvalEnv) -> Result<String, minijinja::Error> {
        self.env.render_str(template, env.as_map())
    }

    /// Renders every value of a property map.
    pub fn render_map(
        &self,
        map: &BTreeMap<String, String>,
        env: &EvalEnv,
    ) -> Result<BTreeMap<String, String>, minijinja::Error> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.render(v, env)?)))
            .collect()
    }
}

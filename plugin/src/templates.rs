use minijinja::Environment;
use serde::Serialize;
use std::sync::Arc;

const TEMPLATES: &[(&str, &str)] = &[
    ("message.html", include_str!("../templates/message.html")),
    (
        "oauth1-complete.html",
        include_str!("../templates/oauth1-complete.html"),
    ),
    (
        "user-connected.html",
        include_str!("../templates/user-connected.html"),
    ),
];

/// Embedded HTML templates. HTML templates are auto-escaped.
#[derive(Clone)]
pub struct Templates {
    env: Arc<Environment<'static>>,
}

impl Templates {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(*name, *source)?;
        }
        Ok(Templates { env: Arc::new(env) })
    }

    pub fn render<S: Serialize>(&self, name: &str, values: &S) -> Result<String, minijinja::Error> {
        self.env.get_template(name)?.render(values)
    }
}

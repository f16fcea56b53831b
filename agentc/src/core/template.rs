//! Placeholder substitution for code templates.
//!
//! Templates contain `{{ name }}` placeholders and nothing else: no
//! conditionals, no loops, no filters. Repetition (one file per tool, one
//! declaration per resource) belongs to the caller.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex")
});

/// Named values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Replace every placeholder with its binding.
///
/// Unbound placeholders render as the empty string. Substitution is a single
/// pass: placeholder syntax inside a bound value is emitted literally.
pub fn render(template: &str, bindings: &Bindings) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            bindings.get(&caps[1]).unwrap_or_default().to_string()
        })
        .into_owned()
}

/// Placeholder names in `template` that have no binding, deduplicated and sorted.
pub fn unbound(template: &str, bindings: &Bindings) -> Vec<String> {
    let mut names: Vec<String> = PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .filter(|name| bindings.get(name).is_none())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_named_placeholders() {
        let mut bindings = Bindings::new();
        bindings.set("name", "echo").set("count", "2");
        assert_eq!(
            render("tool {{name}} x{{ count }}", &bindings),
            "tool echo x2"
        );
    }

    #[test]
    fn unbound_placeholders_render_empty() {
        let bindings = Bindings::new();
        assert_eq!(render("a{{missing}}b", &bindings), "ab");
        assert_eq!(unbound("{{b}}{{a}}{{b}}", &bindings), vec!["a", "b"]);
    }

    #[test]
    fn values_are_not_rescanned() {
        let mut bindings = Bindings::new();
        bindings.set("outer", "{{inner}}").set("inner", "boom");
        assert_eq!(render("{{outer}}", &bindings), "{{inner}}");
    }

    #[test]
    fn control_flow_syntax_is_left_alone() {
        let bindings = Bindings::new();
        let template = "{% if x %}y{% endif %} { single }";
        assert_eq!(render(template, &bindings), template);
    }
}

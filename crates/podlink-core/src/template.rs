//! Target-address template expansion.
//!
//! Forward targets may reference environment variables scraped from the
//! carrier pod using `{{.NAME}}` substitution, plus a `splitAt` helper for
//! picking a field out of a delimited value:
//!
//! ```text
//! {{.POSTGRES_HOST}}:{{.POSTGRES_PORT}}
//! {{ splitAt .MY_VAR "," 1 }}
//! ```
//!
//! A referenced key that is not in the map is an error, never an empty
//! substitution.

use std::collections::HashMap;
use std::sync::LazyLock;

use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use regex::Regex;
use thiserror::Error;

static BRACE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^{}]*\}\}").expect("brace regex is valid"));
static DOT_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{\s(])\.([A-Za-z_][A-Za-z0-9_]*)").expect("dot-ref regex is valid")
});

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template render: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Renders target-address templates against the scraped environment map.
pub struct Expander {
    registry: Handlebars<'static>,
}

impl Expander {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Addresses are plain text, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("splitAt", Box::new(split_at));
        Self { registry }
    }

    /// Render `template` against `vars`. Missing keys are an error.
    pub fn expand(
        &self,
        template: &str,
        vars: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        let normalized = normalize_refs(template);
        Ok(self.registry.render_template(&normalized, vars)?)
    }
}

impl Default for Expander {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite `{{.NAME}}`-style references to plain paths inside each brace
/// block, leaving the surrounding text untouched.
fn normalize_refs(template: &str) -> String {
    BRACE_BLOCK_RE
        .replace_all(template, |block: &regex::Captures<'_>| {
            DOT_REF_RE.replace_all(&block[0], "$1$2").into_owned()
        })
        .into_owned()
}

/// `splitAt s sep i`: the i-th field of `s` split by `sep`. An index outside
/// `0..fields` (including any negative index) is an error.
fn split_at(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let s = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("splitAt", 0))?;
    let sep = h
        .param(1)
        .and_then(|p| p.value().as_str())
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("splitAt", 1))?;
    let index = h
        .param(2)
        .and_then(|p| p.value().as_i64())
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("splitAt", 2))?;

    let fields: Vec<&str> = s.split(sep).collect();
    if index < 0 || index as usize >= fields.len() {
        return Err(RenderErrorReason::Other(format!(
            "splitAt index {index} out of range for {} field(s)",
            fields.len()
        ))
        .into());
    }

    out.write(fields[index as usize])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_simple_refs() {
        let expander = Expander::new();
        let vars = envs(&[("POSTGRES_HOST", "localhost"), ("POSTGRES_PORT", "5432")]);
        let out = expander
            .expand("{{.POSTGRES_HOST}}:{{.POSTGRES_PORT}}", &vars)
            .unwrap();
        assert_eq!(out, "localhost:5432");
    }

    #[test]
    fn test_expand_leaves_plain_text_untouched() {
        let expander = Expander::new();
        let out = expander
            .expand("postgresql12.postgresql.svc.cluster.local:5432", &envs(&[]))
            .unwrap();
        assert_eq!(out, "postgresql12.postgresql.svc.cluster.local:5432");
    }

    #[test]
    fn test_expand_does_not_escape_values() {
        let expander = Expander::new();
        let vars = envs(&[("AUTH_SERVICE_URL", "http://auth.local/login?a=1&b=2")]);
        let out = expander.expand("{{.AUTH_SERVICE_URL}}", &vars).unwrap();
        assert_eq!(out, "http://auth.local/login?a=1&b=2");
    }

    #[test]
    fn test_expand_missing_key_is_error() {
        let expander = Expander::new();
        let vars = envs(&[("POSTGRES_HOST", "localhost")]);
        assert!(expander
            .expand("{{.POSTGRES_HOST}}:{{.NON_EXISTING_KEY}}", &vars)
            .is_err());
    }

    #[test]
    fn test_split_at_picks_field() {
        let expander = Expander::new();
        let vars = envs(&[("MY_VAR", "localhost:5432,example.com:8080")]);
        let out = expander
            .expand(r#"{{ splitAt .MY_VAR "," 1 }}"#, &vars)
            .unwrap();
        assert_eq!(out, "example.com:8080");

        let out = expander
            .expand(r#"{{ splitAt .MY_VAR "," 0 }}"#, &vars)
            .unwrap();
        assert_eq!(out, "localhost:5432");
    }

    #[test]
    fn test_split_at_out_of_range_is_error() {
        let expander = Expander::new();
        let vars = envs(&[("MY_VAR", "a:1,b:2")]);
        assert!(expander
            .expand(r#"{{ splitAt .MY_VAR "," 3 }}"#, &vars)
            .is_err());
        assert!(expander
            .expand(r#"{{ splitAt .MY_VAR "," -1 }}"#, &vars)
            .is_err());
        assert!(expander
            .expand(r#"{{ splitAt .MY_VAR "," 12 }}"#, &vars)
            .is_err());
    }
}

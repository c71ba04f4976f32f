//! `${NAME}` interpolation for task definitions.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpolateError {
    #[error("unclosed variable reference: ${{{0}")]
    Unclosed(String),
    #[error("variable '{0}' is not set")]
    Unset(String),
}

/// Interpolate `${NAME}` references from the process environment.
///
/// ```
/// assert_eq!(cmdsandbox::env::interpolate("no vars here").unwrap(), "no vars here");
/// ```
pub fn interpolate(s: &str) -> Result<String, InterpolateError> {
    interpolate_with(s, &HashMap::new())
}

/// Interpolate `${NAME}` references, looking in `vars` before the environment.
///
/// `$` not followed by `{` is kept literally.
pub fn interpolate_with(s: &str, vars: &HashMap<String, String>) -> Result<String, InterpolateError> {
    expand(s, |name| {
        vars.get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    })
}

fn expand(
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, InterpolateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let reference = &rest[start + 2..];
        let Some(end) = reference.find('}') else {
            return Err(InterpolateError::Unclosed(reference.to_string()));
        };
        let name = &reference[..end];
        let value = lookup(name).ok_or_else(|| InterpolateError::Unset(name.to_string()))?;
        out.push_str(&value);
        rest = &reference[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variables_from_map() {
        let vars = HashMap::from([("WHO".to_string(), "world".to_string())]);
        assert_eq!(interpolate_with("hello ${WHO}!", &vars).unwrap(), "hello world!");
        assert_eq!(interpolate_with("", &vars).unwrap(), "");
        assert_eq!(interpolate_with("cost: $5", &vars).unwrap(), "cost: $5");
    }

    #[test]
    fn map_shadows_environment() {
        let Some(path) = std::env::var_os("PATH") else {
            return;
        };
        assert_eq!(
            interpolate("${PATH}").unwrap(),
            path.to_string_lossy().into_owned()
        );
        let vars = HashMap::from([("PATH".to_string(), "shadowed".to_string())]);
        assert_eq!(interpolate_with("${PATH}", &vars).unwrap(), "shadowed");
    }

    #[test]
    fn missing_variable() {
        assert_eq!(
            interpolate("${CMDSANDBOX_NONEXISTENT_12345}"),
            Err(InterpolateError::Unset("CMDSANDBOX_NONEXISTENT_12345".to_string()))
        );
    }

    #[test]
    fn unclosed_reference() {
        let err = interpolate("${UNCLOSED").unwrap_err();
        assert_eq!(err, InterpolateError::Unclosed("UNCLOSED".to_string()));
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn adjacent_and_repeated_references() {
        let vars = HashMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "${A}".to_string()),
        ]);
        assert_eq!(interpolate_with("${A}${A}-${B}$", &vars).unwrap(), "11-${A}$");
    }
}

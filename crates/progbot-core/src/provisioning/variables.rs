//! `{name}` substitution over layered variable sources.
//!
//! Sources merge lowest to highest precedence: system, custom (panel
//! defined), vision (QR scan), captured (earlier script steps).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::{Captures, Regex};
use tracing::warn;

/// Variable name to value.
pub type Variables = BTreeMap<String, String>;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, always compiles.
    PATTERN.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("variable pattern compiles"))
}

/// Variables every board gets: position, cell id, wall-clock stamps and the
/// panel name.
pub fn system_variables(row: u32, col: u32, panel_name: &str, now: DateTime<Local>) -> Variables {
    let mut vars = Variables::new();
    vars.insert("row".into(), row.to_string());
    vars.insert("col".into(), col.to_string());
    vars.insert("cell_id".into(), format!("R{row}C{col}"));
    vars.insert(
        "timestamp".into(),
        now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    );
    vars.insert("date".into(), now.format("%Y-%m-%d").to_string());
    vars.insert("time".into(), now.format("%H:%M:%S").to_string());
    vars.insert("panel_name".into(), panel_name.to_string());
    vars
}

/// Replace every `{name}` in `template`. Unknown names stay in place
/// literally and are returned in the second element, in order of
/// appearance.
pub fn substitute(template: &str, variables: &Variables) -> (String, Vec<String>) {
    let mut missing = Vec::new();
    let result = variable_pattern().replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                warn!(variable = name, "missing variable");
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });
    (result.into_owned(), missing)
}

/// Names referenced by `template`, in order, duplicates kept.
pub fn extract_variable_names(template: &str) -> Vec<String> {
    variable_pattern()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Names in `template` that `available` does not define.
///
/// When `allow_capture_vars` is set the template is always reported valid,
/// since unknown names may be captured by an earlier step at run time; the
/// unknown list is then advisory.
pub fn validate_variables(
    template: &str,
    available: &Variables,
    allow_capture_vars: bool,
) -> (bool, Vec<String>) {
    let unknown: Vec<String> = extract_variable_names(template)
        .into_iter()
        .filter(|name| !available.contains_key(name))
        .collect();
    let valid = allow_capture_vars || unknown.is_empty();
    (valid, unknown)
}

/// Variables visible to one provisioning run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    system: Variables,
    custom: Variables,
    vision: Variables,
    captured: Variables,
}

impl VariableContext {
    /// Build a context for the board at `(row, col)`, stamping the system
    /// variables with the current local time.
    pub fn new(row: u32, col: u32, panel_name: &str, vision: Variables, custom: Variables) -> Self {
        Self::from_parts(system_variables(row, col, panel_name, Local::now()), custom, vision)
    }

    /// Build a context from explicit layers.
    pub fn from_parts(system: Variables, custom: Variables, vision: Variables) -> Self {
        Self {
            system,
            custom,
            vision,
            captured: Variables::new(),
        }
    }

    /// Merge step captures. Same-named keys are overwritten, nothing is
    /// ever removed.
    pub fn add_captures(&mut self, captures: &Variables) {
        self.captured
            .extend(captures.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Every variable, higher layers winning.
    pub fn get_all(&self) -> Variables {
        let mut merged = self.system.clone();
        for layer in [&self.custom, &self.vision, &self.captured] {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        [&self.captured, &self.vision, &self.custom, &self.system]
            .into_iter()
            .find_map(|layer| layer.get(name))
            .map(String::as_str)
    }

    pub fn substitute(&self, template: &str) -> (String, Vec<String>) {
        substitute(template, &self.get_all())
    }

    /// Everything captured so far.
    pub fn all_captures(&self) -> &Variables {
        &self.captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_precedence_captured_beats_vision_beats_custom_beats_system() {
        let mut ctx = VariableContext::from_parts(
            vars(&[("a", "1")]),
            vars(&[("a", "2"), ("b", "1")]),
            vars(&[("a", "3")]),
        );
        ctx.add_captures(&vars(&[("a", "4")]));

        let all = ctx.get_all();
        assert_eq!(all["a"], "4");
        assert_eq!(all["b"], "1");
        assert_eq!(ctx.get("a"), Some("4"));
    }

    #[test]
    fn test_substitute_without_placeholders_is_unchanged() {
        let ctx = VariableContext::default();
        assert_eq!(
            ctx.substitute("no vars here"),
            ("no vars here".to_string(), Vec::new())
        );
    }

    #[test]
    fn test_missing_variable_left_literal() {
        let ctx = VariableContext::default();
        let (text, missing) = ctx.substitute("{missing}");
        assert_eq!(text, "{missing}");
        assert_eq!(missing, vec!["missing".to_string()]);
    }

    #[test]
    fn test_system_variables_shape() {
        let now = Local::now();
        let sys = system_variables(3, 1, "demo", now);
        assert_eq!(sys["cell_id"], "R3C1");
        assert_eq!(sys["row"], "3");
        assert_eq!(sys["col"], "1");
        assert_eq!(sys["panel_name"], "demo");
        assert_eq!(sys["date"], now.format("%Y-%m-%d").to_string());
    }

    #[test]
    fn test_captures_accumulate_and_overwrite() {
        let mut ctx = VariableContext::default();
        ctx.add_captures(&vars(&[("mac", "AA"), ("fw", "1.0")]));
        ctx.add_captures(&vars(&[("fw", "1.1")]));

        assert_eq!(ctx.all_captures().len(), 2);
        assert_eq!(ctx.substitute("{mac}/{fw}").0, "AA/1.1");
    }

    #[test]
    fn test_extract_and_validate() {
        assert_eq!(
            extract_variable_names("SET {serial_number} {mac} {serial_number}"),
            vec!["serial_number", "mac", "serial_number"]
        );

        let available = vars(&[("serial_number", "X")]);
        let (valid, unknown) = validate_variables("SET {serial_number} {mac}", &available, false);
        assert!(!valid);
        assert_eq!(unknown, vec!["mac".to_string()]);

        let (valid, unknown) = validate_variables("SET {mac}", &available, true);
        assert!(valid);
        assert_eq!(unknown, vec!["mac".to_string()]);
    }
}

// src/asserts/attrs.rs

//! Attribute constraints
//!
//! A mini-language embedded in snap-declaration headers. A constraint tree
//! has anchored regular expressions at its leaves, maps at internal nodes
//! (every key must match) and lists as alternations (at least one branch
//! must match). Constraints compile once; checking a value tree yields
//! success or a diagnostic naming the failing dotted path.

use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;

/// A compiled set of constraints on plug or slot attributes
#[derive(Debug)]
pub struct AttributeConstraints {
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    Map(Vec<(String, Matcher)>),
    Regexp(Regex),
    Alternatives(Vec<Matcher>),
}

#[derive(Clone, Copy, Default)]
struct CompileContext<'a> {
    dotted: &'a str,
    had_map: bool,
    was_alt: bool,
}

fn chain(context: &str, key: &str) -> String {
    if context.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", context, key)
    }
}

impl AttributeConstraints {
    /// Compile a constraint tree from its assertion-header form
    pub fn compile(constraints: &Value) -> Result<Self> {
        let matcher = compile_matcher(CompileContext::default(), constraints)?;
        Ok(Self { matcher })
    }

    /// Check a value tree against the compiled constraints.
    ///
    /// Pure: depends only on the compiled constraints and `attrs`.
    pub fn check(&self, attrs: &Value) -> Result<()> {
        self.matcher.matches("", attrs)
    }
}

fn compile_matcher(cc: CompileContext<'_>, constraints: &Value) -> Result<Matcher> {
    match constraints {
        Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, constraint) in map {
                let dotted = chain(cc.dotted, key);
                let entry_cc = CompileContext {
                    dotted: &dotted,
                    had_map: true,
                    was_alt: false,
                };
                entries.push((key.clone(), compile_matcher(entry_cc, constraint)?));
            }
            Ok(Matcher::Map(entries))
        }
        Value::Array(alts) => {
            if cc.was_alt {
                return Err(Error::AssertParse(format!(
                    "cannot nest alternative constraints directly at {:?}",
                    cc.dotted
                )));
            }
            let mut compiled = Vec::with_capacity(alts.len());
            for (i, alt) in alts.iter().enumerate() {
                let dotted = format!("{}/alt#{}/", cc.dotted, i + 1);
                let alt_cc = CompileContext {
                    dotted: &dotted,
                    had_map: cc.had_map,
                    was_alt: true,
                };
                compiled.push(compile_matcher(alt_cc, alt)?);
            }
            Ok(Matcher::Alternatives(compiled))
        }
        Value::String(pattern) => {
            if !cc.had_map {
                return Err(Error::AssertParse(
                    "first level of non alternative constraints must be a set of key-value \
                     constraints"
                        .to_string(),
                ));
            }
            let anchored = format!("^{}$", pattern);
            let rx = Regex::new(&anchored).map_err(|e| {
                Error::AssertParse(format!(
                    "cannot compile {:?} constraint {:?}: {}",
                    cc.dotted, pattern, e
                ))
            })?;
            Ok(Matcher::Regexp(rx))
        }
        other => Err(Error::AssertParse(format!(
            "constraint {:?} must be a key-value map, regexp or a list of alternative \
             constraints: {}",
            cc.dotted, other
        ))),
    }
}

impl Matcher {
    fn matches(&self, context: &str, value: &Value) -> Result<()> {
        match self {
            Matcher::Map(entries) => match value {
                Value::Object(map) => {
                    for (key, matcher) in entries {
                        let entry_context = chain(context, key);
                        match map.get(key) {
                            None | Some(Value::Null) => {
                                return Err(Error::AssertConsistency(format!(
                                    "attribute {:?} has constraints but is unset",
                                    entry_context
                                )));
                            }
                            Some(v) => matcher.matches(&entry_context, v)?,
                        }
                    }
                    Ok(())
                }
                Value::Array(list) => self.match_list(context, list),
                _ => Err(Error::AssertConsistency(format!(
                    "attribute {:?} must be a map",
                    context
                ))),
            },
            Matcher::Regexp(rx) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Array(list) => return self.match_list(context, list),
                    _ => {
                        return Err(Error::AssertConsistency(format!(
                            "attribute {:?} must be a scalar or list",
                            context
                        )));
                    }
                };
                if !rx.is_match(&text) {
                    return Err(Error::AssertConsistency(format!(
                        "attribute {:?} value {:?} does not match {}",
                        context,
                        text,
                        rx.as_str()
                    )));
                }
                Ok(())
            }
            Matcher::Alternatives(alts) => {
                let mut first_err = None;
                for alt in alts {
                    match alt.matches(context, value) {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                }
                let descr = if context.is_empty() {
                    String::new()
                } else {
                    format!(" for attribute {:?}", context)
                };
                Err(Error::AssertConsistency(format!(
                    "no alternative{} matches: {}",
                    descr,
                    first_err.map(|e| e.to_string()).unwrap_or_default()
                )))
            }
        }
    }

    /// Apply the matcher element-wise to a list value
    fn match_list(&self, context: &str, list: &[Value]) -> Result<()> {
        for (i, elem) in list.iter().enumerate() {
            self.matches(&chain(context, &i.to_string()), elem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_match() {
        let constraints =
            AttributeConstraints::compile(&json!({"bus": "usb", "speed": ["high", "full"]}))
                .unwrap();

        constraints
            .check(&json!({"bus": "usb", "speed": "full"}))
            .unwrap();

        let err = constraints
            .check(&json!({"bus": "pci", "speed": "full"}))
            .unwrap_err();
        assert!(err.to_string().contains("\"bus\""));
    }

    #[test]
    fn test_unset_attribute() {
        let constraints = AttributeConstraints::compile(&json!({"bus": "usb"})).unwrap();
        let err = constraints.check(&json!({"speed": "full"})).unwrap_err();
        assert!(err.to_string().contains("has constraints but is unset"));
    }

    #[test]
    fn test_scalar_coercion() {
        let constraints = AttributeConstraints::compile(&json!({
            "enabled": "true|false",
            "port": "[0-9]+",
        }))
        .unwrap();

        constraints
            .check(&json!({"enabled": true, "port": 8080}))
            .unwrap();
    }

    #[test]
    fn test_list_matched_element_wise() {
        let constraints = AttributeConstraints::compile(&json!({"paths": "/dev/.*"})).unwrap();

        constraints
            .check(&json!({"paths": ["/dev/ttyS0", "/dev/ttyS1"]}))
            .unwrap();

        let err = constraints
            .check(&json!({"paths": ["/dev/ttyS0", "/etc/passwd"]}))
            .unwrap_err();
        assert!(err.to_string().contains("paths.1"));
    }

    #[test]
    fn test_nested_maps_and_alternatives() {
        let constraints = AttributeConstraints::compile(&json!({
            "device": [
                {"bus": "usb", "vendor": "0x[0-9a-f]{4}"},
                {"bus": "pci"},
            ],
        }))
        .unwrap();

        constraints
            .check(&json!({"device": {"bus": "usb", "vendor": "0x1d6b"}}))
            .unwrap();
        constraints
            .check(&json!({"device": {"bus": "pci"}}))
            .unwrap();

        let err = constraints
            .check(&json!({"device": {"bus": "isa"}}))
            .unwrap_err();
        assert!(err.to_string().contains("alternative"));
        assert!(err.to_string().contains("\"device\""));
    }

    #[test]
    fn test_nested_alternatives_rejected_at_compile() {
        let err = AttributeConstraints::compile(&json!({"x": [["a"]]})).unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot nest alternative constraints"));
    }

    #[test]
    fn test_top_level_must_be_map() {
        let err = AttributeConstraints::compile(&json!("usb")).unwrap_err();
        assert!(err.to_string().contains("first level"));
    }

    #[test]
    fn test_anchoring() {
        let constraints = AttributeConstraints::compile(&json!({"bus": "usb"})).unwrap();
        assert!(constraints.check(&json!({"bus": "usb-host"})).is_err());
    }

    #[test]
    fn test_check_is_pure() {
        let constraints = AttributeConstraints::compile(&json!({"bus": "usb"})).unwrap();
        let input = json!({"bus": "usb"});
        for _ in 0..3 {
            constraints.check(&input).unwrap();
        }
        assert_eq!(input, json!({"bus": "usb"}));
    }
}

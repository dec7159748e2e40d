//! Payload projection from event values onto scope variables.

use std::collections::BTreeMap;

use crate::value::EventValue;

/// Variables produced for the target scope.
pub type ScopeVariables = BTreeMap<String, EventValue>;

/// Binds each mapped event field that is present onto its variable name.
///
/// Absent fields leave the variable unset; there are no defaults.
#[must_use]
pub fn project(mapping: &[(String, String)], values: &BTreeMap<String, EventValue>) -> ScopeVariables {
    let mut out = ScopeVariables::new();
    for (field, variable) in mapping {
        if let Some(value) = values.get(field) {
            out.insert(variable.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
            .collect()
    }

    #[test]
    fn projects_only_mapped_fields() {
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), EventValue::from("x"));
        values.insert("b".to_string(), EventValue::Integer(1));

        let vars = project(&mapping(&[("a", "varA")]), &values);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("varA"), Some(&EventValue::from("x")));
    }

    #[test]
    fn absent_field_leaves_variable_unset() {
        let values = BTreeMap::new();
        let vars = project(&mapping(&[("missing", "var")]), &values);
        assert!(vars.is_empty());
    }

    #[test]
    fn one_field_may_feed_several_variables() {
        let mut values = BTreeMap::new();
        values.insert("customerId".to_string(), EventValue::from("kermit"));
        let vars = project(
            &mapping(&[("customerId", "customerIdVar"), ("customerId", "owner")]),
            &values,
        );
        assert_eq!(vars.len(), 2);
    }
}

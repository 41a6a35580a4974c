use indexmap::IndexMap;

use crate::error::{Result, SweepError};
use crate::value::{ParamValue, ValueSpec};

/// Parameter name to default value, in declaration order.
pub type BaseDefaults = IndexMap<String, ParamValue>;

/// Swept parameter name to its value sequence, in declaration order.
pub type Overrides = IndexMap<String, ValueSpec>;

/// One point of the sweep: every defaulted parameter bound to a single value,
/// keyed in `BaseDefaults` order.
pub type CaseAssignment = IndexMap<String, ParamValue>;

/// Expand a sweep into its ordered case assignments.
///
/// The parameter declared last in `overrides` varies fastest. Parameters
/// that are not overridden contribute their default and do not multiply
/// the case count. An empty `overrides` yields exactly one assignment.
pub fn expand(base_defaults: &BaseDefaults, overrides: &Overrides) -> Result<Vec<CaseAssignment>> {
    if let Some(key) = overrides.keys().find(|k| !base_defaults.contains_key(*k)) {
        return Err(SweepError::config(
            key.as_str(),
            "swept parameter is not declared in the base defaults",
        ));
    }

    let mut defaults = CaseAssignment::with_capacity(base_defaults.len());
    for (key, value) in base_defaults {
        defaults.insert(key.clone(), value.clone().normalize(key)?);
    }

    let mut axes: Vec<(&str, Vec<ParamValue>)> = Vec::with_capacity(overrides.len());
    for (key, spec) in overrides {
        axes.push((key.as_str(), spec.values(key)?));
    }

    let total = axes.iter().try_fold(1usize, |acc, (key, values)| {
        acc.checked_mul(values.len())
            .ok_or_else(|| SweepError::config(*key, "sweep size overflows the case index"))
    })?;
    if total > u32::MAX as usize {
        return Err(SweepError::config(
            axes.last().map(|(k, _)| *k).unwrap_or_default(),
            format!("sweep expands to {total} cases, more than a registry can address"),
        ));
    }

    let mut cases = Vec::with_capacity(total);
    for index in 0..total {
        let mut assignment = defaults.clone();
        let mut rest = index;
        for (key, values) in axes.iter().rev() {
            let pick = rest % values.len();
            rest /= values.len();
            // existing key: position in the map is preserved
            assignment.insert((*key).to_string(), values[pick].clone());
        }
        cases.push(assignment);
    }
    Ok(cases)
}

/// Names of the swept parameters, in declaration order.
pub fn swept_parameters(overrides: &Overrides) -> Vec<String> {
    overrides.keys().cloned().collect()
}

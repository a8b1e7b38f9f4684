//! Unit validation for numeric facts
//!
//! A conservative fixed table: known simple units pass, everything else
//! fails. Percent additionally requires the value to sit in [0, 100].

const SIMPLE_UNITS: &[&str] = &[
    "%", "percent", "ms", "s", "min", "h", "m", "km", "kg", "g", "mb", "gb", "count", "usd",
];

/// Validate that a numeric value is compatible with a unit label.
pub fn validate_numeric_unit(value: f64, unit: &str) -> bool {
    if !value.is_finite() {
        return false;
    }
    let unit = unit.trim().to_lowercase();
    if !SIMPLE_UNITS.contains(&unit.as_str()) {
        return false;
    }
    if unit == "%" || unit == "percent" {
        return (0.0..=100.0).contains(&value);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_units_pass() {
        assert!(validate_numeric_unit(42.0, "ms"));
        assert!(validate_numeric_unit(3.5, "kg"));
        assert!(validate_numeric_unit(10.0, "Count"));
    }

    #[test]
    fn test_unknown_units_fail() {
        assert!(!validate_numeric_unit(1.0, "parsec"));
        assert!(!validate_numeric_unit(1.0, ""));
    }

    #[test]
    fn test_percent_bounds() {
        assert!(validate_numeric_unit(99.9, "%"));
        assert!(!validate_numeric_unit(120.0, "percent"));
        assert!(!validate_numeric_unit(-1.0, "%"));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert!(!validate_numeric_unit(f64::NAN, "ms"));
    }
}

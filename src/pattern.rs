//! Predicates for filtering discovered services.
//!
//! A pattern is built once and then applied to any number of
//! [`ServiceConfiguration`]s. Construction may fail on bad input; matching
//! never does, and missing data simply means "no match".

use log::debug;
use regex::Regex;

use crate::configuration::{Flags, Position, ServiceConfiguration};
use crate::error::{Result, ServiceDiscoError};

/// Label that makes a [`PropertyPattern`] search every value of a service.
pub const WILDCARD_LABEL: &str = "*";

/// A pure predicate over service configurations.
pub trait ServicePattern: Send + Sync {
    /// Returns true if `service` belongs to this pattern.
    fn match_description(&self, service: &ServiceConfiguration) -> bool;
}

/// Matches services whose property `label` matches a regular expression.
///
/// The label is compared literally. With the wildcard label `*` the
/// expression is tried against every value the service carries. The
/// expression searches the value; anchor it with `^`/`$` for a full match.
#[derive(Clone, Debug)]
pub struct PropertyPattern {
    label: String,
    expression: Regex,
}

impl PropertyPattern {
    /// # Errors
    /// Returns `ServiceDiscoError::ConfigError` if `expression` is not a valid
    /// regular expression.
    pub fn new(label: impl Into<String>, expression: &str) -> Result<Self> {
        let label = label.into();
        let expression = Regex::new(expression).map_err(|e| {
            ServiceDiscoError::ConfigError(format!(
                "Invalid expression for label '{}': {}",
                label, e
            ))
        })?;
        Ok(PropertyPattern { label, expression })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn expression(&self) -> &str {
        self.expression.as_str()
    }
}

impl Default for PropertyPattern {
    fn default() -> Self {
        PropertyPattern {
            label: WILDCARD_LABEL.to_string(),
            expression: Regex::new(".*").expect("match-all expression compiles"),
        }
    }
}

impl ServicePattern for PropertyPattern {
    fn match_description(&self, service: &ServiceConfiguration) -> bool {
        if self.label == WILDCARD_LABEL {
            return service.values().any(|value| self.expression.is_match(value));
        }
        service
            .get(&self.label)
            .is_some_and(|value| self.expression.is_match(value))
    }
}

/// Matches services located within `distance` of a point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionPattern {
    origin: Position,
    distance: f64,
}

impl PositionPattern {
    pub fn new(x: f64, y: f64, z: f64, distance: f64) -> Self {
        PositionPattern {
            origin: Position::new(x, y, z),
            distance,
        }
    }
}

impl ServicePattern for PositionPattern {
    fn match_description(&self, service: &ServiceConfiguration) -> bool {
        match service.location() {
            Some(position) => position.distance_to(&self.origin) <= self.distance,
            None => {
                debug!("Service {} has no usable location", service.name());
                false
            }
        }
    }
}

/// Matches services that advertise every given capability flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagPattern {
    flags: Flags,
}

impl FlagPattern {
    pub fn new(flags: Flags) -> Self {
        FlagPattern { flags }
    }
}

impl ServicePattern for FlagPattern {
    fn match_description(&self, service: &ServiceConfiguration) -> bool {
        service
            .flags()
            .unwrap_or_default()
            .contains(self.flags)
    }
}

/// Conjunction of borrowed patterns, evaluated in the order they were added.
///
/// ```
/// use service_discovery::{FlagPattern, Flags, MultiPattern, PropertyPattern};
///
/// let by_type = PropertyPattern::new("type", "^_rimres").unwrap();
/// let ready = FlagPattern::new(Flags::READY);
/// let mut multi = MultiPattern::new();
/// multi.add_pattern(&by_type).add_pattern(&ready);
/// assert_eq!(multi.len(), 2);
/// ```
#[derive(Default)]
pub struct MultiPattern<'a> {
    patterns: Vec<&'a dyn ServicePattern>,
}

impl<'a> MultiPattern<'a> {
    pub fn new() -> Self {
        MultiPattern {
            patterns: Vec::new(),
        }
    }

    pub fn add_pattern(&mut self, pattern: &'a dyn ServicePattern) -> &mut Self {
        self.patterns.push(pattern);
        self
    }

    /// By-value variant of [`MultiPattern::add_pattern`].
    pub fn with(mut self, pattern: &'a dyn ServicePattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl ServicePattern for MultiPattern<'_> {
    fn match_description(&self, service: &ServiceConfiguration) -> bool {
        self.patterns.iter().all(|p| p.match_description(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(service_type: &str, properties: &[&str]) -> ServiceConfiguration {
        ServiceConfiguration::new("module", service_type, "local")
            .with_properties(properties.iter().copied())
    }

    #[test]
    fn test_property_pattern_by_type() {
        let pattern = PropertyPattern::new("type", "^_rimres").unwrap();
        assert!(pattern.match_description(&service("_rimres._tcp", &[])));
        assert!(!pattern.match_description(&service("_other._tcp", &[])));
    }

    #[test]
    fn test_property_pattern_missing_label_never_matches() {
        let pattern = PropertyPattern::new("service_year", ".*").unwrap();
        assert!(!pattern.match_description(&service("_rimres._tcp", &[])));
        assert!(pattern.match_description(&service("_rimres._tcp", &["service_year=1999"])));
    }

    #[test]
    fn test_property_pattern_label_is_literal() {
        let pattern = PropertyPattern::new("service.*", "1999").unwrap();
        assert!(!pattern.match_description(&service("_rimres._tcp", &["service_year=1999"])));
    }

    #[test]
    fn test_property_pattern_wildcard_searches_all_values() {
        let pattern = PropertyPattern::new(WILDCARD_LABEL, "^communication$").unwrap();
        assert!(pattern.match_description(&service("_t._tcp", &["role=communication"])));
        assert!(pattern.match_description(&service("_t._tcp", &["communication"])));
        assert!(!pattern.match_description(&service("_t._tcp", &["role=communications"])));
    }

    #[test]
    fn test_property_pattern_extended_syntax() {
        let pattern = PropertyPattern::new("group", "^(arm|leg)[0-9]+$").unwrap();
        assert!(pattern.match_description(&service("_t._tcp", &["group=arm12"])));
        assert!(!pattern.match_description(&service("_t._tcp", &["group=head1"])));
    }

    #[test]
    fn test_property_pattern_invalid_expression() {
        let err = PropertyPattern::new("type", "(unclosed").unwrap_err();
        assert!(matches!(err, ServiceDiscoError::ConfigError(_)));
    }

    #[test]
    fn test_default_property_pattern_matches_everything() {
        let pattern = PropertyPattern::default();
        assert_eq!(pattern.label(), WILDCARD_LABEL);
        assert!(pattern.match_description(&service("_any._udp", &[])));
    }

    #[test]
    fn test_position_pattern_boundary_is_inclusive() {
        let pattern = PositionPattern::new(0.0, 0.0, 0.0, 5.0);
        assert!(pattern.match_description(&service("_t._tcp", &["location=3,4,0"])));
        assert!(!pattern.match_description(&service("_t._tcp", &["location=3,4,1"])));
    }

    #[test]
    fn test_position_pattern_without_location() {
        let pattern = PositionPattern::new(0.0, 0.0, 0.0, 1000.0);
        assert!(!pattern.match_description(&service("_t._tcp", &[])));
        assert!(!pattern.match_description(&service("_t._tcp", &["location=near"])));
    }

    #[test]
    fn test_flag_pattern_requires_all_bits() {
        let pattern = FlagPattern::new(Flags::READY | Flags::SLAM);
        let all = (Flags::READY | Flags::SLAM | Flags::REMOTE).to_property();
        let ready = Flags::READY.to_property();
        assert!(pattern.match_description(&service("_t._tcp", &[all.as_str()])));
        assert!(!pattern.match_description(&service("_t._tcp", &[ready.as_str()])));
        assert!(!pattern.match_description(&service("_t._tcp", &[])));
    }

    #[test]
    fn test_multi_pattern_is_conjunction() {
        let any_type = PropertyPattern::new("type", ".*").unwrap();
        let busy = FlagPattern::new(Flags::BUSY);
        let mut multi = MultiPattern::new();
        multi.add_pattern(&any_type).add_pattern(&busy);

        let busy_flags = Flags::BUSY.to_property();
        assert!(multi.match_description(&service("_t._tcp", &[busy_flags.as_str()])));
        assert!(!multi.match_description(&service("_t._tcp", &["flags=2"])));
    }

    #[test]
    fn test_empty_multi_pattern_matches_everything() {
        let multi = MultiPattern::new();
        assert!(multi.is_empty());
        assert!(multi.match_description(&service("_t._tcp", &[])));
    }

    struct Counting<'c> {
        result: bool,
        calls: &'c AtomicUsize,
    }

    impl ServicePattern for Counting<'_> {
        fn match_description(&self, _: &ServiceConfiguration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    #[test]
    fn test_multi_pattern_short_circuits() {
        let calls = AtomicUsize::new(0);
        let fail = Counting {
            result: false,
            calls: &calls,
        };
        let pass = Counting {
            result: true,
            calls: &calls,
        };
        let multi = MultiPattern::new().with(&fail).with(&pass);
        assert!(!multi.match_description(&service("_t._tcp", &[])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multi_pattern_nests() {
        let by_type = PropertyPattern::new("type", "^_rimres").unwrap();
        let inner = MultiPattern::new().with(&by_type);
        let ready = FlagPattern::new(Flags::READY);
        let outer = MultiPattern::new().with(&inner).with(&ready);
        assert!(outer.match_description(&service("_rimres._tcp", &["flags=2"])));
        assert!(!outer.match_description(&service("_other._tcp", &["flags=2"])));
    }
}

//! Ruby-style version and requirement algebra.
//!
//! Versions are ordered sequences of numeric or alphabetic segments
//! (`3.1.0`, `1.0.beta`, `2.15.0.rc1`). Requirements combine an operator
//! with a version; constraints AND several requirements together.

use pubgrub::Ranges;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while parsing a version
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("malformed version {input:?}: {reason}")]
    Malformed { input: String, reason: String },
}

/// Errors that can occur while parsing a requirement or constraint
#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("unparseable requirement {input:?}")]
    Unparseable { input: String },

    #[error("invalid version in requirement {input:?}: {source}")]
    InvalidVersion {
        input: String,
        #[source]
        source: VersionError,
    },

    #[error("pessimistic operator requires a numeric pivot segment in {version:?}")]
    NonNumericPivot { version: String },
}

/// A single version segment
///
/// Two numerics compare by value, two alphabetics lexicographically, and a
/// numeric always orders above an alphabetic (`1.0 > 1.0.beta`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Numeric(u64),
    Alpha(String),
}

impl Segment {
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Numeric(_))
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.cmp(b),
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
            (Self::Numeric(_), Self::Alpha(_)) => Ordering::Greater,
            (Self::Alpha(_), Self::Numeric(_)) => Ordering::Less,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Alpha(s) => write!(f, "{s}"),
        }
    }
}

/// A Ruby-style version
///
/// Segments are kept exactly as parsed; trailing zero-numeric segments are
/// insignificant for comparison (`1.2.0` equals `1.2`) but preserved so that
/// formatting round-trips and the pessimistic pivot stays where the author
/// wrote it (`~> 3.0.0` bounds at `3.1`, `~> 3.0` bounds at `4`).
#[derive(Debug, Clone)]
pub struct Version {
    segments: Vec<Segment>,
}

impl Version {
    /// Parse a version string.
    ///
    /// Splits on `.`, `-` and `_`; each piece is numeric if it parses as a
    /// nonnegative integer, alphabetic (lowercased) otherwise. The empty
    /// string parses as `"0"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string contains an empty segment.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self {
                segments: vec![Segment::Numeric(0)],
            });
        }

        let mut segments = Vec::new();
        for piece in trimmed.split(['.', '-', '_']) {
            if piece.is_empty() {
                return Err(VersionError::Malformed {
                    input: input.to_string(),
                    reason: "empty segment".to_string(),
                });
            }

            if let Ok(n) = piece.parse::<u64>() {
                segments.push(Segment::Numeric(n));
            } else {
                segments.push(Segment::Alpha(piece.to_lowercase()));
            }
        }

        Ok(Self { segments })
    }

    /// The parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments with insignificant trailing zeros removed
    fn canonical_segments(&self) -> &[Segment] {
        let mut len = self.segments.len();
        while len > 0 && self.segments[len - 1] == Segment::Numeric(0) {
            len -= 1;
        }
        &self.segments[..len]
    }

    /// Whether any segment is alphabetic (a prerelease marker).
    ///
    /// Prereleases order before the corresponding release: `1.0.beta < 1.0`.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.segments.iter().any(|s| !s.is_numeric())
    }

    /// The exclusive upper bound of a pessimistic (`~>`) requirement.
    ///
    /// The pivot is the second-to-last segment (the last for single-segment
    /// versions); the bound is the version truncated after the pivot with the
    /// pivot incremented: `~> 3.0` bounds at `4`, `~> 3.0.1` at `3.1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pivot segment is not numeric.
    pub fn pessimistic_bound(&self) -> Result<Self, ConstraintError> {
        let pivot = self.segments.len().saturating_sub(2);
        let Some(Segment::Numeric(value)) = self.segments.get(pivot) else {
            return Err(ConstraintError::NonNumericPivot {
                version: self.to_string(),
            });
        };

        let mut segments: Vec<Segment> = self.segments[..pivot].to_vec();
        segments.push(Segment::Numeric(value + 1));
        Ok(Self { segments })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_segments().hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let longest = usize::max(self.segments.len(), other.segments.len());
        for index in 0..longest {
            let a = self.segments.get(index).unwrap_or(&Segment::Numeric(0));
            let b = other.segments.get(index).unwrap_or(&Segment::Numeric(0));
            let ordering = a.cmp(b);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        if self.segments.is_empty() {
            f.write_str("0")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self {
            segments: vec![Segment::Numeric(0)],
        }
    }
}

/// Requirement operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Pessimistic,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Pessimistic => "~>",
        })
    }
}

/// A single requirement: an operator applied to a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub op: Op,
    pub version: Version,
}

impl Requirement {
    /// Parse one requirement like `>= 1.0` or `~> 3.0.1`.
    ///
    /// A bare version means exact equality.
    ///
    /// # Errors
    ///
    /// Returns an error on an unparseable operator or version, or a `~>`
    /// whose pivot segment is not numeric.
    pub fn parse(input: &str) -> Result<Self, ConstraintError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ConstraintError::Unparseable {
                input: input.to_string(),
            });
        }

        let (op, rest) = if let Some(rest) = trimmed.strip_prefix("~>") {
            (Op::Pessimistic, rest)
        } else if let Some(rest) = trimmed.strip_prefix("!=") {
            (Op::Ne, rest)
        } else if let Some(rest) = trimmed.strip_prefix(">=") {
            (Op::Ge, rest)
        } else if let Some(rest) = trimmed.strip_prefix("<=") {
            (Op::Le, rest)
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            (Op::Gt, rest)
        } else if let Some(rest) = trimmed.strip_prefix('<') {
            (Op::Lt, rest)
        } else if let Some(rest) = trimmed.strip_prefix('=') {
            (Op::Eq, rest)
        } else {
            (Op::Eq, trimmed)
        };

        let version =
            Version::parse(rest.trim()).map_err(|source| ConstraintError::InvalidVersion {
                input: input.to_string(),
                source,
            })?;

        // Validate the pivot up front so `~>` on a non-numeric pivot is
        // rejected at parse time rather than first evaluation.
        if op == Op::Pessimistic {
            version.pessimistic_bound()?;
        }

        Ok(Self { op, version })
    }

    /// Test a version against this requirement.
    #[must_use]
    pub fn satisfies(&self, version: &Version) -> bool {
        match self.op {
            Op::Eq => version == &self.version,
            Op::Ne => version != &self.version,
            Op::Gt => version > &self.version,
            Op::Ge => version >= &self.version,
            Op::Lt => version < &self.version,
            Op::Le => version <= &self.version,
            Op::Pessimistic => {
                // Parse validated the pivot, so the bound exists.
                self.version.pessimistic_bound().map_or(false, |bound| {
                    version >= &self.version && version < &bound
                })
            }
        }
    }

    /// Convert to a `PubGrub` range.
    #[must_use]
    pub fn to_range(&self) -> Ranges<Version> {
        match self.op {
            Op::Eq => Ranges::singleton(self.version.clone()),
            Op::Ne => Ranges::strictly_lower_than(self.version.clone())
                .union(&Ranges::strictly_higher_than(self.version.clone())),
            Op::Gt => Ranges::strictly_higher_than(self.version.clone()),
            Op::Ge => Ranges::higher_than(self.version.clone()),
            Op::Lt => Ranges::strictly_lower_than(self.version.clone()),
            Op::Le => Ranges::lower_than(self.version.clone()),
            Op::Pessimistic => self.version.pessimistic_bound().map_or_else(
                |_| Ranges::empty(),
                |bound| Ranges::between(self.version.clone(), bound),
            ),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.version)
    }
}

/// An AND of requirements
///
/// The empty constraint is equivalent to `>= 0` and satisfied by every
/// version, prereleases included.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Constraint {
    requirements: Vec<Requirement>,
}

impl Constraint {
    /// The unconstrained (`>= 0`) constraint.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            requirements: Vec::new(),
        }
    }

    /// Parse a comma-separated list of requirements.
    ///
    /// An empty string or a lone `>= 0` yields the empty constraint.
    ///
    /// # Errors
    ///
    /// Returns an error if any requirement fails to parse.
    pub fn parse(input: &str) -> Result<Self, ConstraintError> {
        Self::parse_with_separator(input, ',')
    }

    /// Parse with an explicit AND separator.
    ///
    /// The compact index joins multiple requirements for one gem with `&`
    /// because `,` already separates dependency entries.
    ///
    /// # Errors
    ///
    /// Returns an error if any requirement fails to parse.
    pub fn parse_with_separator(input: &str, separator: char) -> Result<Self, ConstraintError> {
        let mut requirements = Vec::new();
        for part in input.split(separator) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let requirement = Requirement::parse(part)?;
            if requirement.op == Op::Ge && requirement.version == Version::default() {
                continue;
            }
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    /// Build a constraint from already-parsed requirements.
    #[must_use]
    pub fn from_requirements(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Whether this is the unconstrained `>= 0` constraint.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.requirements.is_empty()
    }

    /// The individual requirements.
    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Test a version: the AND of every requirement's individual test.
    #[must_use]
    pub fn satisfies(&self, version: &Version) -> bool {
        self.requirements.iter().all(|r| r.satisfies(version))
    }

    /// Whether any requirement names a prerelease version.
    ///
    /// Used to opt a dependency into prerelease candidates during
    /// resolution.
    #[must_use]
    pub fn mentions_prerelease(&self) -> bool {
        self.requirements.iter().any(|r| r.version.is_prerelease())
    }

    /// Convert to a `PubGrub` range (intersection of all requirements).
    #[must_use]
    pub fn to_ranges(&self) -> Ranges<Version> {
        let mut ranges = Ranges::full();
        for requirement in &self.requirements {
            ranges = ranges.intersection(&requirement.to_range());
        }
        ranges
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requirements.is_empty() {
            return f.write_str(">= 0");
        }
        for (index, requirement) in self.requirements.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{requirement}")?;
        }
        Ok(())
    }
}

impl FromStr for Constraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests can panic")]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn c(s: &str) -> Constraint {
        Constraint::parse(s).unwrap()
    }

    mod version_parsing {
        use super::*;

        #[test]
        fn numeric_segments() {
            let version = v("3.1.4");
            assert_eq!(version.segments().len(), 3);
            assert_eq!(version.to_string(), "3.1.4");
        }

        #[test]
        fn alpha_segments_lowercased() {
            let version = v("1.0.BETA");
            assert!(version.is_prerelease());
            assert_eq!(version.to_string(), "1.0.beta");
        }

        #[test]
        fn dash_and_underscore_separators() {
            assert_eq!(v("1.0-rc1"), v("1.0.rc1"));
            assert_eq!(v("1.0_1"), v("1.0.1"));
        }

        #[test]
        fn empty_string_is_zero() {
            assert_eq!(v(""), v("0"));
            assert_eq!(v("").to_string(), "0");
        }

        #[test]
        fn empty_segment_is_malformed() {
            assert!(Version::parse("1..2").is_err());
            assert!(Version::parse(".1").is_err());
        }

        #[test]
        fn trailing_zeros_are_insignificant() {
            assert_eq!(v("1.2.0"), v("1.2"));
            assert_eq!(v("1.0.0.0"), v("1"));
            assert_ne!(v("1.2.1"), v("1.2"));
        }

        #[test]
        fn display_preserves_parsed_segments() {
            assert_eq!(v("1.2.0").to_string(), "1.2.0");
            assert_eq!(v("8.0").to_string(), "8.0");
        }
    }

    mod version_ordering {
        use super::*;
        use std::cmp::Ordering;

        #[test]
        fn numeric_comparison() {
            assert!(v("1.2.3") < v("1.2.4"));
            assert!(v("1.10") > v("1.9"));
            assert!(v("2") > v("1.9.9"));
        }

        #[test]
        fn missing_segments_are_zero() {
            assert!(v("1.2") < v("1.2.1"));
            assert_eq!(v("1.2").cmp(&v("1.2.0")), Ordering::Equal);
        }

        #[test]
        fn prerelease_orders_before_release() {
            assert!(v("1.0.beta") < v("1.0"));
            assert!(v("1.0.alpha") < v("1.0.beta"));
            assert!(v("3.0.rc1") < v("3.0"));
        }

        #[test]
        fn comparison_is_reflexive_and_antisymmetric() {
            let versions = ["1.0", "1.0.beta", "1.0.1", "2", "0.9.9"];
            for a in versions {
                assert_eq!(v(a).cmp(&v(a)), Ordering::Equal);
                for b in versions {
                    assert_eq!(v(a).cmp(&v(b)), v(b).cmp(&v(a)).reverse());
                }
            }
        }

        #[test]
        fn comparison_is_transitive() {
            let mut versions: Vec<Version> = ["1.0.beta", "2.1", "1.0", "0.9", "2.0.rc1", "2"]
                .iter()
                .map(|s| v(s))
                .collect();
            versions.sort();
            for window in versions.windows(3) {
                assert!(window[0] <= window[1] && window[1] <= window[2]);
                assert!(window[0] <= window[2]);
            }
        }
    }

    mod pessimistic_bound {
        use super::*;

        #[test]
        fn two_segment_bumps_major() {
            assert_eq!(v("3.0").pessimistic_bound().unwrap(), v("4"));
            assert_eq!(v("8.0").pessimistic_bound().unwrap(), v("9"));
        }

        #[test]
        fn three_segment_bumps_minor() {
            assert_eq!(v("3.0.1").pessimistic_bound().unwrap(), v("3.1"));
            assert_eq!(v("8.0.0").pessimistic_bound().unwrap(), v("8.1"));
        }

        #[test]
        fn four_segment_bumps_third() {
            assert_eq!(v("3.3.0.2").pessimistic_bound().unwrap(), v("3.3.1"));
        }

        #[test]
        fn single_segment_bumps_itself() {
            assert_eq!(v("3").pessimistic_bound().unwrap(), v("4"));
        }

        #[test]
        fn alpha_pivot_is_rejected() {
            assert!(v("1.beta.2").pessimistic_bound().is_err());
            assert!(Requirement::parse("~> 1.beta.2").is_err());
        }
    }

    mod requirements {
        use super::*;

        #[test]
        fn operators_parse() {
            for (input, op) in [
                ("= 1.0", Op::Eq),
                ("!= 1.0", Op::Ne),
                ("> 1.0", Op::Gt),
                (">= 1.0", Op::Ge),
                ("< 1.0", Op::Lt),
                ("<= 1.0", Op::Le),
                ("~> 1.0", Op::Pessimistic),
            ] {
                assert_eq!(Requirement::parse(input).unwrap().op, op);
            }
        }

        #[test]
        fn bare_version_means_exact() {
            let requirement = Requirement::parse("2.1.4").unwrap();
            assert_eq!(requirement.op, Op::Eq);
            assert!(requirement.satisfies(&v("2.1.4")));
            assert!(!requirement.satisfies(&v("2.1.5")));
        }

        #[test]
        fn pessimistic_equivalence() {
            // ~> X  <=>  >= X, < bumped-pivot(X)
            let requirement = Requirement::parse("~> 3.0.0").unwrap();
            assert!(requirement.satisfies(&v("3.0.0")));
            assert!(requirement.satisfies(&v("3.0.5")));
            assert!(!requirement.satisfies(&v("3.1.0")));
            assert!(!requirement.satisfies(&v("2.9.9")));

            let requirement = Requirement::parse("~> 8.0").unwrap();
            assert!(requirement.satisfies(&v("8.0.1")));
            assert!(requirement.satisfies(&v("8.9")));
            assert!(!requirement.satisfies(&v("9.0")));

            let requirement = Requirement::parse("~> 8.0.0").unwrap();
            assert!(requirement.satisfies(&v("8.0.1")));
            assert!(!requirement.satisfies(&v("8.1.0")));
        }

        #[test]
        fn display_round_trips() {
            for input in ["~> 3.0", ">= 1.2.3", "!= 2.0", "= 1.0"] {
                let requirement = Requirement::parse(input).unwrap();
                assert_eq!(requirement.to_string(), input);
            }
        }
    }

    mod constraints {
        use super::*;

        #[test]
        fn empty_matches_everything() {
            let constraint = c("");
            assert!(constraint.is_any());
            assert!(constraint.satisfies(&v("0")));
            assert!(constraint.satisfies(&v("999.9")));
            assert!(constraint.satisfies(&v("1.0.beta")));
            assert_eq!(constraint.to_string(), ">= 0");
        }

        #[test]
        fn gte_zero_normalizes_to_empty() {
            assert!(c(">= 0").is_any());
        }

        #[test]
        fn conjunction_of_requirements() {
            let constraint = c(">= 1.0, < 2.0");
            assert!(constraint.satisfies(&v("1.5")));
            assert!(!constraint.satisfies(&v("0.9")));
            assert!(!constraint.satisfies(&v("2.0")));

            // satisfies == AND of the individual tests
            for version in ["0.9", "1.0", "1.5", "2.0", "2.1"] {
                let expected = constraint
                    .requirements()
                    .iter()
                    .all(|r| r.satisfies(&v(version)));
                assert_eq!(constraint.satisfies(&v(version)), expected);
            }
        }

        #[test]
        fn ampersand_separator() {
            let constraint = Constraint::parse_with_separator(">= 2.0& < 3.0", '&').unwrap();
            assert!(constraint.satisfies(&v("2.5")));
            assert!(!constraint.satisfies(&v("3.0")));
        }

        #[test]
        fn prerelease_mention() {
            assert!(c(">= 1.0.beta").mentions_prerelease());
            assert!(!c(">= 1.0").mentions_prerelease());
        }

        #[test]
        fn ranges_match_satisfies() {
            for input in ["~> 3.0.0", ">= 1.0, < 2.0", "!= 1.5", "= 2.0", ""] {
                let constraint = c(input);
                let ranges = constraint.to_ranges();
                for version in ["0.5", "1.0", "1.5", "2.0", "3.0.0", "3.0.9", "3.1"] {
                    assert_eq!(
                        ranges.contains(&v(version)),
                        constraint.satisfies(&v(version)),
                        "mismatch for {input:?} against {version}"
                    );
                }
            }
        }
    }
}

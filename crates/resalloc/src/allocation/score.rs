use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};

/// Explains why an allocator produced a score. Used for diagnostics only.
pub type Criteria = serde_json::Map<String, serde_json::Value>;

/// How well an allocator can satisfy a request.
///
/// The numeric encoding (see [`Score::value`]) is
/// - `> 0` estimated wall-clock seconds, lower is better
/// - `0` can serve, no estimate
/// - `-1` could serve, but has no capacity right now
/// - `-2` can never serve this request
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Score {
    /// Estimated wall-clock seconds. Other values are mapped by [`Score::normalize`].
    Estimate(f64),
    NoEstimate,
    Unavailable,
    Unsupported,
}

impl Score {
    pub fn from_value(value: f64) -> Score {
        if value > 0.0 {
            Score::Estimate(value)
        } else if value == 0.0 {
            Score::NoEstimate
        } else if value >= -1.0 {
            Score::Unavailable
        } else {
            // Also covers NaN.
            Score::Unsupported
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Score::Estimate(seconds) => *seconds,
            Score::NoEstimate => 0.0,
            Score::Unavailable => -1.0,
            Score::Unsupported => -2.0,
        }
    }

    /// Maps estimates that are not positive numbers onto the tier their value encodes.
    /// A NaN estimate is [`Score::Unsupported`].
    pub fn normalize(self) -> Score {
        match self {
            Score::Estimate(seconds) if seconds.is_nan() => Score::Unsupported,
            Score::Estimate(seconds) if seconds <= 0.0 => Score::from_value(seconds),
            score => score,
        }
    }

    /// Returns true if the allocator can serve the request right now.
    pub fn can_serve(&self) -> bool {
        matches!(self, Score::Estimate(_) | Score::NoEstimate)
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value())
    }
}

/// Score reported by an allocator together with its explanation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rating {
    pub score: Score,
    pub criteria: Criteria,
}

impl Rating {
    pub fn new(score: Score, criteria: Criteria) -> Self {
        Self { score, criteria }
    }

    pub fn no_estimate() -> Self {
        Self::new(Score::NoEstimate, Criteria::new())
    }

    pub fn unsupported(key: &str, value: serde_json::Value) -> Self {
        let mut criteria = Criteria::new();
        criteria.insert(key.to_string(), value);
        Self::new(Score::Unsupported, criteria)
    }
}

/// Running best-fit selection over candidates offered in registration order.
///
/// Starts at [`Score::Unsupported`] with no candidate. A candidate replaces the current best when
/// - nothing usable was seen yet and the candidate is at least [`Score::Unavailable`],
/// - the best one has no estimate and the candidate has one,
/// - both have estimates and the candidate's is strictly lower.
///
/// Otherwise the current best is kept. An [`Score::Unavailable`] best is never replaced, so a
/// pass that starts with a busy allocator ends in a shortage. Exact ties keep the earlier
/// candidate. Offered scores are normalized first.
pub struct BestFit<T> {
    score: Score,
    criteria: Criteria,
    candidate: Option<T>,
}

impl<T> Default for BestFit<T> {
    fn default() -> Self {
        Self {
            score: Score::Unsupported,
            criteria: Criteria::new(),
            candidate: None,
        }
    }
}

impl<T> BestFit<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a candidate. Returns true if it became the new best.
    pub fn offer(&mut self, rating: Rating, candidate: T) -> bool {
        let score = rating.score.normalize();
        let adopt = match (self.score, score) {
            (Score::Unsupported, Score::Unsupported) => false,
            (Score::Unsupported, _) => true,
            (Score::NoEstimate, Score::Estimate(_)) => true,
            (Score::Estimate(best), Score::Estimate(new)) => new < best,
            _ => false,
        };
        if adopt {
            self.score = score;
            self.criteria = rating.criteria;
            self.candidate = Some(candidate);
        } else if self.candidate.is_none() {
            // Keep the explanation of a refusal so that a failed selection can be diagnosed.
            self.criteria = rating.criteria;
        }
        adopt
    }

    pub fn score(&self) -> Score {
        self.score
    }

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    pub fn candidate(&self) -> Option<&T> {
        self.candidate.as_ref()
    }

    pub fn into_parts(self) -> (Score, Criteria, Option<T>) {
        (self.score, self.criteria, self.candidate)
    }
}

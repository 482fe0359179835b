//! Completion predicates deciding when a rule has served its purpose.

/// Decides, from the number of requests a rule has handled, whether the rule
/// is finished.
pub trait RuleCompletion: Send + Sync {
    fn is_complete(&self, seen_requests: u64) -> bool;

    /// Human-readable clause for rule explanations. With `without_exact` set
    /// the count is phrased as a lower bound.
    fn explain(&self, without_exact: bool) -> String;
}

/// Never completes; the rule keeps matching forever.
pub struct Always;

impl RuleCompletion for Always {
    fn is_complete(&self, _seen_requests: u64) -> bool {
        false
    }

    fn explain(&self, _without_exact: bool) -> String {
        "forever".to_string()
    }
}

/// Complete after `n` handled requests.
pub struct Times(pub u64);

impl Times {
    fn noun(&self) -> String {
        match self.0 {
            1 => "once".to_string(),
            2 => "twice".to_string(),
            3 => "thrice".to_string(),
            n => format!("{n} times"),
        }
    }
}

impl RuleCompletion for Times {
    fn is_complete(&self, seen_requests: u64) -> bool {
        seen_requests >= self.0
    }

    fn explain(&self, without_exact: bool) -> String {
        if without_exact {
            format!("at least {}", self.noun())
        } else {
            self.noun()
        }
    }
}

/// Complete after a single handled request.
pub fn once() -> Times {
    Times(1)
}

pub fn twice() -> Times {
    Times(2)
}

pub fn thrice() -> Times {
    Times(3)
}

//! Nested cooperative deadlines for the handler pipeline.
//!
//! Three budgets stack: the overall session budget (armed by the transport
//! when the connection is accepted), a per-section budget (armed by the
//! controller for each callback class), and an optional handler-local budget
//! (armed by an individual handler around a DNS lookup or similar). The
//! effective deadline at any moment is the minimum of the three.

use std::time::Duration;

use tokio::time::Instant;

use crate::handlers::HandlerError;

/// Callback classes that map to the configurable section timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Connect,
    Command,
    Content,
    AddHeader,
}

impl TimeoutClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutClass::Connect => "connect",
            TimeoutClass::Command => "command",
            TimeoutClass::Content => "content",
            TimeoutClass::AddHeader => "addheader",
        }
    }
}

#[derive(Debug, Default)]
pub struct Deadlines {
    overall: Option<Instant>,
    section: Option<Instant>,
    handler: Option<Instant>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the whole-session budget. A zero duration disarms it.
    pub fn set_overall(&mut self, budget: Duration) {
        self.overall = checked_deadline(budget);
    }

    pub fn clear_overall(&mut self) {
        self.overall = None;
    }

    /// Arm the per-section budget for the current event. Zero disarms.
    pub fn arm_section(&mut self, budget: Duration) {
        self.section = checked_deadline(budget);
    }

    pub fn disarm_section(&mut self) {
        self.section = None;
        self.handler = None;
    }

    /// Arm a handler-local budget, clamped to the remaining outer budget.
    /// Returns the effective deadline to pass to `tokio::time::timeout_at`.
    pub fn arm_handler(&mut self, budget: Duration, site: &'static str) -> Result<Instant, HandlerError> {
        let outer = self.outer_deadline();
        if let Some(outer) = outer
            && outer <= Instant::now()
        {
            return Err(HandlerError::Timeout { site });
        }

        let local = Instant::now() + budget;
        let effective = match outer {
            Some(outer) if outer < local => outer,
            _ => local,
        };
        self.handler = Some(effective);

        Ok(effective)
    }

    /// Leave a handler-local scope: re-arm to the still-remaining outer
    /// budget, or raise Timeout when that budget is already spent.
    pub fn reset_to_outer(&mut self, site: &'static str) -> Result<(), HandlerError> {
        self.handler = None;
        if let Some(outer) = self.outer_deadline()
            && outer <= Instant::now()
        {
            return Err(HandlerError::Timeout { site });
        }
        Ok(())
    }

    fn outer_deadline(&self) -> Option<Instant> {
        min_deadline(self.overall, self.section)
    }

    /// The currently armed deadline: `min(overall, section, handler)`.
    pub fn current(&self) -> Option<Instant> {
        min_deadline(self.outer_deadline(), self.handler)
    }

    /// The deadline to use for an awaited operation. When every budget is
    /// disarmed this is far enough in the future to never fire.
    pub fn effective(&self) -> Instant {
        self.current()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.current()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Raise Timeout when the armed deadline has passed.
    pub fn check_now(&self, site: &'static str) -> Result<(), HandlerError> {
        match self.current() {
            Some(deadline) if deadline <= Instant::now() => Err(HandlerError::Timeout { site }),
            _ => Ok(()),
        }
    }
}

fn checked_deadline(budget: Duration) -> Option<Instant> {
    if budget.is_zero() {
        None
    } else {
        Some(Instant::now() + budget)
    }
}

fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn zero_budget_means_disarmed() {
        let mut deadlines = Deadlines::new();
        deadlines.set_overall(Duration::ZERO);
        deadlines.arm_section(Duration::ZERO);

        assert!(deadlines.current().is_none());
        assert!(deadlines.check_now("test").is_ok());
    }

    #[tokio::test]
    async fn handler_budget_is_clamped_to_outer() {
        let mut deadlines = Deadlines::new();
        deadlines.arm_section(Duration::from_millis(50));

        let effective = deadlines
            .arm_handler(Duration::from_secs(60), "clamp")
            .unwrap();
        assert!(effective <= Instant::now() + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn reset_to_outer_raises_when_outer_spent() {
        tokio::time::pause();

        let mut deadlines = Deadlines::new();
        deadlines.arm_section(Duration::from_millis(10));
        deadlines
            .arm_handler(Duration::from_millis(5), "arm")
            .unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;

        let err = deadlines.reset_to_outer("lookup done").unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn check_now_raises_after_expiry() {
        tokio::time::pause();

        let mut deadlines = Deadlines::new();
        deadlines.set_overall(Duration::from_millis(10));
        assert!(deadlines.check_now("early").is_ok());

        tokio::time::advance(Duration::from_millis(11)).await;
        let err = deadlines.check_now("late").unwrap_err();
        assert!(matches!(err, HandlerError::Timeout { site: "late" }));
    }

    #[tokio::test]
    async fn section_disarm_keeps_overall() {
        let mut deadlines = Deadlines::new();
        deadlines.set_overall(Duration::from_secs(60));
        deadlines.arm_section(Duration::from_secs(1));
        deadlines.disarm_section();

        let remaining = deadlines.time_remaining().unwrap();
        assert!(remaining > Duration::from_secs(30));
    }
}

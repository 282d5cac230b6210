//! Per-message disposition register: reject/defer/quarantine reasons and
//! return-code arbitration towards the MTA.

use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

const DEFAULT_REJECT: &str = "550 5.0.0 Message rejected";
const DEFAULT_DEFER: &str = "450 4.0.0 Message deferred";

static REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([54])\d\d ([54])\.\d\.\d ").expect("reason regex"));

/// The per-event answer handed back to the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnCode {
    #[default]
    Continue,
    Accept,
    Reject,
    Tempfail,
    Discard,
}

impl ReturnCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnCode::Continue => "continue",
            ReturnCode::Accept => "accept",
            ReturnCode::Reject => "reject",
            ReturnCode::Tempfail => "tempfail",
            ReturnCode::Discard => "discard",
        }
    }
}

#[derive(Debug, Default)]
pub struct Disposition {
    return_code: ReturnCode,
    reject_reason: Option<String>,
    defer_reason: Option<String>,
    quarantine_reason: Option<String>,
}

impl Disposition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Request rejection. The reason must carry a 5xx status and a matching
    /// 5.x.x enhanced status; anything else is replaced by the default.
    pub fn reject_mail(&mut self, reason: impl Into<String>) {
        self.reject_reason = Some(validate_reason(reason.into(), '5', DEFAULT_REJECT));
    }

    /// Request a temporary failure with a 4xx reason.
    pub fn defer_mail(&mut self, reason: impl Into<String>) {
        self.defer_reason = Some(validate_reason(reason.into(), '4', DEFAULT_DEFER));
    }

    /// Request quarantine. The observable effect is the
    /// `X-Disposition-Quarantine` header; the return code stays `continue`.
    pub fn quarantine_mail(&mut self, reason: impl Into<String>) {
        self.quarantine_reason = Some(reason.into());
    }

    pub fn set_return(&mut self, code: ReturnCode) {
        self.return_code = code;
    }

    pub fn handler_return(&self) -> ReturnCode {
        self.return_code
    }

    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantine_reason.as_deref()
    }

    pub fn is_quarantine(&self) -> bool {
        self.quarantine_reason.is_some()
    }

    /// Arbitrate the final code: reject > defer > quarantine > handler-set.
    pub fn get_return(&self) -> ReturnCode {
        if self.reject_reason.is_some() {
            ReturnCode::Reject
        } else if self.defer_reason.is_some() {
            ReturnCode::Tempfail
        } else if self.quarantine_reason.is_some() {
            // Quarantined mail continues; the header carries the verdict.
            ReturnCode::Continue
        } else {
            self.return_code
        }
    }

    /// The SMTP reason accompanying the final code, when one was recorded.
    pub fn reason(&self) -> Option<&str> {
        if self.reject_reason.is_some() {
            self.reject_reason.as_deref()
        } else if self.defer_reason.is_some() {
            self.defer_reason.as_deref()
        } else {
            None
        }
    }
}

fn validate_reason(reason: String, class: char, fallback: &str) -> String {
    let conforming = REASON_RE
        .captures(&reason)
        .is_some_and(|caps| caps[1].starts_with(class) && caps[1] == caps[2]);

    if conforming {
        reason
    } else {
        info!("non-conforming disposition reason {reason:?} replaced by {fallback:?}");
        fallback.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn precedence_reject_over_defer_over_quarantine() {
        let mut disposition = Disposition::new();
        disposition.set_return(ReturnCode::Accept);
        assert_eq!(disposition.get_return(), ReturnCode::Accept);

        disposition.quarantine_mail("spam policy");
        assert_eq!(disposition.get_return(), ReturnCode::Continue);
        assert!(disposition.is_quarantine());

        disposition.defer_mail("451 4.7.1 Greylisted");
        assert_eq!(disposition.get_return(), ReturnCode::Tempfail);

        disposition.reject_mail("550 5.7.1 SPF hardfail");
        assert_eq!(disposition.get_return(), ReturnCode::Reject);
        assert_eq!(disposition.reason(), Some("550 5.7.1 SPF hardfail"));
    }

    #[test]
    fn invalid_reject_reason_is_replaced() {
        let mut disposition = Disposition::new();
        disposition.reject_mail("nope");
        assert_eq!(disposition.reason(), Some(DEFAULT_REJECT));

        let mut disposition = Disposition::new();
        disposition.reject_mail("999 9.9.9 nope");
        assert_eq!(disposition.reason(), Some(DEFAULT_REJECT));
    }

    #[test]
    fn status_classes_must_agree() {
        // 5xx status with 4.x.x enhanced status is rejected as non-conforming
        let mut disposition = Disposition::new();
        disposition.reject_mail("550 4.0.0 mixed up");
        assert_eq!(disposition.reason(), Some(DEFAULT_REJECT));

        let mut disposition = Disposition::new();
        disposition.defer_mail("421 4.3.2 Shutting down");
        assert_eq!(disposition.reason(), Some("421 4.3.2 Shutting down"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut disposition = Disposition::new();
        disposition.reject_mail("550 5.7.1 go away");
        disposition.clear();
        assert_eq!(disposition.get_return(), ReturnCode::Continue);
        assert_eq!(disposition.reason(), None);
    }
}

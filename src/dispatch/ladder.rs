//! Quota-recovery ladder as an explicit state machine.
//!
//! The ladder is pure: it looks at a classified response and decides the next
//! move, so every branch point is testable without any network. The
//! dispatcher owns the side effects (sending, sleeping, shelling out).

use std::time::Duration;

/// Statuses eligible for any kind of retry.
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Bodies larger than this skip the degrade step; rewriting a huge payload is
/// unlikely to fit the remaining quota anyway.
pub const DEGRADE_MAX_BODY_BYTES: usize = 512 * 1024;

const PLAIN_RETRY_STEP: Duration = Duration::from_secs(1);

/// What the dispatcher observed about one upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Not in the retryable set (includes 2xx): return unchanged.
    Final,
    /// 429 carrying a quota-exhaustion error code.
    QuotaExhausted,
    /// Generic retryable condition (plain 429 or retryable 5xx).
    Retryable,
}

/// The dispatcher's next move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderStep {
    /// Return the response as-is.
    ReturnResponse,
    /// Resend the original payload after this delay.
    RetryAfter(Duration),
    /// Resend a degraded payload with the same account.
    SendDegraded,
    /// Invoke the external-process fallback.
    InvokeFallback,
    /// Give up with a deterministic quota-error response.
    FailQuota,
}

#[derive(Debug)]
pub struct Ladder {
    max_plain_retries: u32,
    plain_attempts: u32,
    degrade_sent: bool,
}

impl Ladder {
    pub fn new(max_plain_retries: u32) -> Self {
        Ladder {
            max_plain_retries,
            plain_attempts: 0,
            degrade_sent: false,
        }
    }

    /// Decide the next step for a classified response.
    ///
    /// `degradable` reflects the current payload (JSON, small enough, not
    /// already degraded); `fallback_available` reflects config plus the
    /// text-only modality gate.
    pub fn next(
        &mut self,
        class: ResponseClass,
        degradable: bool,
        fallback_available: bool,
    ) -> LadderStep {
        match class {
            ResponseClass::Final => LadderStep::ReturnResponse,

            ResponseClass::QuotaExhausted => {
                if !self.degrade_sent && degradable {
                    self.degrade_sent = true;
                    return LadderStep::SendDegraded;
                }
                if fallback_available {
                    return LadderStep::InvokeFallback;
                }
                LadderStep::FailQuota
            }

            ResponseClass::Retryable => {
                if self.plain_attempts >= self.max_plain_retries {
                    return LadderStep::ReturnResponse;
                }
                self.plain_attempts += 1;
                // Linear backoff keyed to the attempt number.
                LadderStep::RetryAfter(PLAIN_RETRY_STEP * self.plain_attempts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_responses_short_circuit() {
        let mut l = Ladder::new(2);
        assert_eq!(l.next(ResponseClass::Final, true, true), LadderStep::ReturnResponse);
    }

    #[test]
    fn quota_walks_degrade_then_fallback_then_fail() {
        let mut l = Ladder::new(2);
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, true, true),
            LadderStep::SendDegraded
        );
        // Degraded resend still hits quota: next rung.
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, false, true),
            LadderStep::InvokeFallback
        );
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, false, false),
            LadderStep::FailQuota
        );
    }

    #[test]
    fn quota_skips_degrade_for_undegradable_bodies() {
        let mut l = Ladder::new(2);
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, false, true),
            LadderStep::InvokeFallback
        );

        let mut l = Ladder::new(2);
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, false, false),
            LadderStep::FailQuota
        );
    }

    #[test]
    fn degrade_happens_at_most_once() {
        let mut l = Ladder::new(2);
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, true, false),
            LadderStep::SendDegraded
        );
        assert_eq!(
            l.next(ResponseClass::QuotaExhausted, true, false),
            LadderStep::FailQuota
        );
    }

    #[test]
    fn plain_retries_back_off_linearly_then_give_up() {
        let mut l = Ladder::new(2);
        assert_eq!(
            l.next(ResponseClass::Retryable, true, true),
            LadderStep::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            l.next(ResponseClass::Retryable, true, true),
            LadderStep::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            l.next(ResponseClass::Retryable, true, true),
            LadderStep::ReturnResponse
        );
    }
}

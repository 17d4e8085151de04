use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::InvalidPolicy;

/// Shortest delay a timed policy waits between attempts.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// How a session reacts once its physical connection is lost.
///
/// `Manual` leaves the session in `Reconnecting` until the caller invokes
/// `reconnect()`. The timed variants schedule retries; any pending retry is
/// cancelled by `stop()`. Deserialized values are validated: a zero delay
/// or a backoff factor below 1 is rejected.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "PolicyConfig", into = "PolicyConfig")]
pub enum ReconnectPolicy {
    #[default]
    Manual,
    FixedDelay {
        delay_ms: u64,
        /// Consecutive failed attempts tolerated before giving up (0 = unlimited).
        max_attempts: u32,
    },
    Exponential {
        initial_backoff_ms: u64,
        backoff_factor: f64,
        max_backoff_ms: u64,
        max_attempts: u32,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum PolicyConfig {
    Manual,
    FixedDelay {
        delay_ms: u64,
        #[serde(default)]
        max_attempts: u32,
    },
    Exponential {
        #[serde(default = "default_initial_backoff_ms")]
        initial_backoff_ms: u64,
        #[serde(default = "default_backoff_factor")]
        backoff_factor: f64,
        #[serde(default = "default_max_backoff_ms")]
        max_backoff_ms: u64,
        #[serde(default)]
        max_attempts: u32,
    },
}

impl TryFrom<PolicyConfig> for ReconnectPolicy {
    type Error = InvalidPolicy;

    fn try_from(config: PolicyConfig) -> Result<Self, Self::Error> {
        match config {
            PolicyConfig::Manual => Ok(Self::Manual),
            PolicyConfig::FixedDelay {
                delay_ms,
                max_attempts,
            } => {
                if delay_ms == 0 {
                    return Err(InvalidPolicy("fixed delay must be at least 1 ms".into()));
                }
                Ok(Self::FixedDelay {
                    delay_ms,
                    max_attempts,
                })
            }
            PolicyConfig::Exponential {
                initial_backoff_ms,
                backoff_factor,
                max_backoff_ms,
                max_attempts,
            } => {
                if initial_backoff_ms == 0 || max_backoff_ms == 0 {
                    return Err(InvalidPolicy("backoff delays must be at least 1 ms".into()));
                }
                if !valid_factor(backoff_factor) {
                    return Err(InvalidPolicy(format!(
                        "backoff factor must be a finite number >= 1, got {backoff_factor}"
                    )));
                }
                Ok(Self::Exponential {
                    initial_backoff_ms,
                    backoff_factor,
                    max_backoff_ms,
                    max_attempts,
                })
            }
        }
    }
}

impl From<ReconnectPolicy> for PolicyConfig {
    fn from(policy: ReconnectPolicy) -> Self {
        match policy {
            ReconnectPolicy::Manual => Self::Manual,
            ReconnectPolicy::FixedDelay {
                delay_ms,
                max_attempts,
            } => Self::FixedDelay {
                delay_ms,
                max_attempts,
            },
            ReconnectPolicy::Exponential {
                initial_backoff_ms,
                backoff_factor,
                max_backoff_ms,
                max_attempts,
            } => Self::Exponential {
                initial_backoff_ms,
                backoff_factor,
                max_backoff_ms,
                max_attempts,
            },
        }
    }
}

fn valid_factor(factor: f64) -> bool {
    factor.is_finite() && factor >= 1.0
}

const fn default_initial_backoff_ms() -> u64 {
    1_000
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Decision for the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for a caller-invoked `reconnect()`.
    WaitForCaller,
    /// Retry after the delay.
    After(Duration),
    /// Attempts are exhausted.
    GiveUp,
}

impl ReconnectPolicy {
    /// Retries after `delay`, raised to [`MIN_RETRY_DELAY`] when shorter.
    pub fn fixed(delay: Duration) -> Self {
        Self::FixedDelay {
            delay_ms: delay.max(MIN_RETRY_DELAY).as_millis() as u64,
            max_attempts: 0,
        }
    }

    pub fn exponential(initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        let initial = if initial_backoff_ms == 0 {
            default_initial_backoff_ms()
        } else {
            initial_backoff_ms
        };
        let factor = if !valid_factor(backoff_factor) {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self::Exponential {
            initial_backoff_ms: initial,
            backoff_factor: factor,
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: 0,
        }
    }

    /// Caps consecutive failed attempts. Has no effect on `Manual`.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        match &mut self {
            Self::Manual => {}
            Self::FixedDelay { max_attempts, .. } | Self::Exponential { max_attempts, .. } => {
                *max_attempts = attempts;
            }
        }
        self
    }

    pub fn with_max_backoff_ms(mut self, max: u64) -> Self {
        if let Self::Exponential { max_backoff_ms, .. } = &mut self {
            *max_backoff_ms = max.max(1);
        }
        self
    }

    /// Parses the `CONSOLE_RECONNECT` form: `manual`, `fixed:<ms>` or `exp:<ms>`.
    /// A zero delay is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "manual" {
            return Some(Self::Manual);
        }
        let (mode, ms) = value.split_once(':')?;
        let ms: u64 = ms.trim().parse().ok().filter(|ms| *ms > 0)?;
        match mode.trim() {
            "fixed" => Some(Self::fixed(Duration::from_millis(ms))),
            "exp" | "exponential" => Some(Self::exponential(ms, default_backoff_factor())),
            _ => None,
        }
    }

    /// Decides what to do after `failures` consecutive lost connections
    /// (1 for the first loss).
    pub fn decide(&self, failures: u32) -> RetryDecision {
        match self {
            Self::Manual => RetryDecision::WaitForCaller,
            Self::FixedDelay {
                delay_ms,
                max_attempts,
            } => {
                if exhausted(*max_attempts, failures) {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::After(Duration::from_millis(*delay_ms).max(MIN_RETRY_DELAY))
                }
            }
            Self::Exponential {
                initial_backoff_ms,
                backoff_factor,
                max_backoff_ms,
                max_attempts,
            } => {
                if exhausted(*max_attempts, failures) {
                    return RetryDecision::GiveUp;
                }
                let exp = backoff_factor.powi(failures.saturating_sub(1) as i32);
                let base = (*initial_backoff_ms as f64 * exp).round() as u64;
                let delay = Duration::from_millis(base.min(*max_backoff_ms));
                RetryDecision::After(delay.max(MIN_RETRY_DELAY))
            }
        }
    }
}

fn exhausted(max_attempts: u32, failures: u32) -> bool {
    max_attempts > 0 && failures > max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_always_waits_for_caller() {
        let p = ReconnectPolicy::Manual.with_max_attempts(1);
        assert_eq!(p.decide(5), RetryDecision::WaitForCaller);
    }

    #[test]
    fn exponential_policy_grows_with_cap() {
        let p = ReconnectPolicy::exponential(100, 2.0).with_max_backoff_ms(250);
        assert_eq!(p.decide(1), RetryDecision::After(Duration::from_millis(100)));
        assert_eq!(p.decide(2), RetryDecision::After(Duration::from_millis(200)));
        assert_eq!(p.decide(3), RetryDecision::After(Duration::from_millis(250)));
    }

    #[test]
    fn fixed_policy_gives_up_after_max_attempts() {
        let p = ReconnectPolicy::fixed(Duration::from_millis(50)).with_max_attempts(2);
        assert_eq!(p.decide(2), RetryDecision::After(Duration::from_millis(50)));
        assert_eq!(p.decide(3), RetryDecision::GiveUp);
    }

    #[test]
    fn parses_env_forms() {
        assert_eq!(ReconnectPolicy::parse("manual"), Some(ReconnectPolicy::Manual));
        assert_eq!(
            ReconnectPolicy::parse("fixed:500"),
            Some(ReconnectPolicy::fixed(Duration::from_millis(500)))
        );
        assert!(matches!(
            ReconnectPolicy::parse("EXP:200"),
            Some(ReconnectPolicy::Exponential {
                initial_backoff_ms: 200,
                ..
            })
        ));
        assert_eq!(ReconnectPolicy::parse("sometimes"), None);
        assert_eq!(ReconnectPolicy::parse("fixed:0"), None);
        assert_eq!(ReconnectPolicy::parse("exp:0"), None);
    }

    #[test]
    fn deserialize_rejects_policies_that_never_pause() {
        for raw in [
            r#"{"mode":"fixed_delay","delay_ms":0}"#,
            r#"{"mode":"exponential","backoff_factor":-2.0}"#,
            r#"{"mode":"exponential","backoff_factor":0.5}"#,
            r#"{"mode":"exponential","initial_backoff_ms":0}"#,
        ] {
            let err = serde_json::from_str::<ReconnectPolicy>(raw).expect_err(raw);
            assert!(err.to_string().contains("invalid reconnect policy"), "{err}");
        }
    }

    #[test]
    fn zero_and_invalid_inputs_are_clamped_by_constructors() {
        assert_eq!(
            ReconnectPolicy::fixed(Duration::ZERO).decide(1),
            RetryDecision::After(MIN_RETRY_DELAY)
        );
        let p = ReconnectPolicy::exponential(10, f64::NAN);
        assert!(matches!(
            p,
            ReconnectPolicy::Exponential { backoff_factor, .. } if backoff_factor == 2.0
        ));
        assert_eq!(p.decide(2), RetryDecision::After(Duration::from_millis(20)));
    }

    #[test]
    fn serializes_with_mode_tag() {
        let json = serde_json::to_value(ReconnectPolicy::fixed(Duration::from_millis(250)))
            .expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"mode": "fixed_delay", "delay_ms": 250, "max_attempts": 0})
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let p: ReconnectPolicy =
            serde_json::from_str(r#"{"mode":"exponential","max_attempts":4}"#).expect("parse");
        assert_eq!(
            p,
            ReconnectPolicy::Exponential {
                initial_backoff_ms: 1_000,
                backoff_factor: 2.0,
                max_backoff_ms: 30_000,
                max_attempts: 4,
            }
        );
    }
}

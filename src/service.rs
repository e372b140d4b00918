//! The Bouncer service: three stateless operations used by external
//! harnesses to probe request/response behavior.
//!
//! `Greet` echoes a string with a `"hello "` prefix, `Bounce` round-trips
//! timestamps and reports the elapsed duration, and `GrowTail` increments a
//! counter nested one level deep. Every call is a pure transformation of its
//! input; nothing survives the call.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{RpcError, RpcServer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub greeting: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeted {
    pub reply: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ball {
    pub message: String,
    pub when: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceResult {
    pub reply: String,
    pub time_message: String,
    pub now: DateTime<Utc>,
    /// Signed elapsed time, carried on the wire as whole nanoseconds.
    #[serde(with = "duration_nanos")]
    pub ago: TimeDelta,
}

/// `tail` is optional on the wire because the source protocol makes nested
/// messages nullable. [`grow_tail`] rejects a body without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub tail: Option<Tail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tail {
    pub count: i64,
}

mod duration_nanos {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(delta: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match delta.num_nanoseconds() {
            Some(nanos) => serializer.serialize_i64(nanos),
            None => Err(serde::ser::Error::custom(
                "duration overflows i64 nanoseconds",
            )),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TimeDelta, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = i64::deserialize(deserializer)?;
        Ok(TimeDelta::nanoseconds(nanos))
    }
}

/// Prefixes the greeting with `"hello "`. Infallible, empty input included.
pub fn greet(request: Greeting) -> Greeted {
    Greeted {
        reply: format!("hello {}", request.greeting),
    }
}

/// Computes `ago = now - when` (signed; `now` before `when` yields a
/// negative duration) and renders `when` plus the truncated duration into
/// `time_message`. The input `now` is echoed back untouched.
pub fn bounce(request: Ball) -> BounceResult {
    let ago = request.now.signed_duration_since(request.when);
    // Nanoseconds are already the finest granularity, so this is a no-op;
    // the truncation step is part of the documented contract.
    let ago = truncate(ago, TimeDelta::nanoseconds(1));

    let time_message = format!(
        "{} was {} ago",
        request.when.to_rfc3339_opts(SecondsFormat::Nanos, true),
        format_duration(ago),
    );

    BounceResult {
        reply: format!("hello {}", request.message),
        time_message,
        now: request.now,
        ago,
    }
}

/// Returns a new body whose tail count is one higher. The request is
/// consumed; response and request never alias. A body without a tail is
/// rejected rather than defaulted, so a harness probing the nested-message
/// path gets a distinct per-call error instead of a silent zero.
pub fn grow_tail(request: Body) -> Result<Body, RpcError> {
    let tail = request
        .tail
        .ok_or_else(|| RpcError::InvalidRequest("body has no tail to grow".to_string()))?;

    Ok(Body {
        tail: Some(Tail {
            count: tail.count + 1,
        }),
    })
}

/// Truncates `delta` toward zero to a multiple of `granularity`. A zero or
/// negative granularity leaves the value unchanged.
pub fn truncate(delta: TimeDelta, granularity: TimeDelta) -> TimeDelta {
    let Some(step) = granularity.num_nanoseconds().filter(|&step| step > 0) else {
        return delta;
    };
    let Some(nanos) = delta.num_nanoseconds() else {
        return delta;
    };
    TimeDelta::nanoseconds(nanos - nanos % step)
}

/// Renders a duration compactly: sub-second values pick the largest fitting
/// unit (`ns`, `µs`, `ms`), larger values read `[Nh][Nm]N[.frac]s` with
/// minutes always shown when hours are. Trailing zeros in fractions are
/// trimmed; zero is `"0s"`.
pub fn format_duration(delta: TimeDelta) -> String {
    let Some(nanos) = delta.num_nanoseconds() else {
        // Out of i64-nanosecond range; whole seconds is the best we can say.
        return format!("{}s", delta.num_seconds());
    };
    if nanos == 0 {
        return "0s".to_string();
    }

    let sign = if nanos < 0 { "-" } else { "" };
    let n = nanos.unsigned_abs();

    if n < 1_000 {
        format!("{sign}{n}ns")
    } else if n < 1_000_000 {
        format!("{sign}{}µs", with_fraction(n / 1_000, n % 1_000, 3))
    } else if n < 1_000_000_000 {
        format!("{sign}{}ms", with_fraction(n / 1_000_000, n % 1_000_000, 6))
    } else {
        let secs = n / 1_000_000_000;
        let frac = n % 1_000_000_000;

        let mut out = String::from(sign);
        if secs >= 3600 {
            out.push_str(&format!("{}h", secs / 3600));
        }
        if secs >= 60 {
            out.push_str(&format!("{}m", (secs / 60) % 60));
        }
        out.push_str(&with_fraction(secs % 60, frac, 9));
        out.push('s');
        out
    }
}

fn with_fraction(whole: u64, frac: u64, digits: usize) -> String {
    if frac == 0 {
        return whole.to_string();
    }
    let mut frac = format!("{frac:0>width$}", width = digits);
    while frac.ends_with('0') {
        frac.pop();
    }
    format!("{whole}.{frac}")
}

/// Registers the three Bouncer methods on an [`RpcServer`].
pub async fn register_bouncer(server: &RpcServer) {
    server
        .register_typed("Greet", |request: Greeting| async move { Ok(greet(request)) })
        .await;

    server
        .register_typed("Bounce", |request: Ball| async move { Ok(bounce(request)) })
        .await;

    server
        .register_typed("GrowTail", |request: Body| async move { grow_tail(request) })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, nanos).unwrap()
    }

    #[test]
    fn greet_prefixes_hello() {
        let greeted = greet(Greeting {
            greeting: "world".to_string(),
        });
        assert_eq!(greeted.reply, "hello world");
    }

    #[test]
    fn greet_accepts_empty_input() {
        let greeted = greet(Greeting {
            greeting: String::new(),
        });
        assert_eq!(greeted.reply, "hello ");
    }

    #[test]
    fn bounce_five_seconds() {
        // 2024-05-01T12:00:00Z
        let when = at(1_714_564_800, 0);
        let now = when + TimeDelta::seconds(5);

        let result = bounce(Ball {
            message: "x".to_string(),
            when,
            now,
        });

        assert_eq!(result.reply, "hello x");
        assert_eq!(result.ago, TimeDelta::seconds(5));
        assert_eq!(result.now, now);
        assert_eq!(
            result.time_message,
            "2024-05-01T12:00:00.000000000Z was 5s ago"
        );
    }

    #[test]
    fn bounce_preserves_sub_second_precision() {
        let when = at(1_714_564_800, 123_456_789);
        let now = when + TimeDelta::nanoseconds(1_500_000_000);

        let result = bounce(Ball {
            message: "t".to_string(),
            when,
            now,
        });

        assert_eq!(result.ago, TimeDelta::nanoseconds(1_500_000_000));
        assert_eq!(
            result.time_message,
            "2024-05-01T12:00:00.123456789Z was 1.5s ago"
        );
    }

    #[test]
    fn bounce_allows_now_before_when() {
        let when = at(1_714_564_800, 0);
        let now = when - TimeDelta::seconds(5);

        let result = bounce(Ball {
            message: "back".to_string(),
            when,
            now,
        });

        assert_eq!(result.ago, TimeDelta::seconds(-5));
        assert_eq!(result.now, now);
        assert!(result.time_message.ends_with("was -5s ago"));
    }

    #[test]
    fn bounce_echoes_now_exactly() {
        let when = at(1_000_000, 1);
        let now = at(2_000_000, 999_999_999);

        let result = bounce(Ball {
            message: String::new(),
            when,
            now,
        });

        assert_eq!(result.now, now);
    }

    #[test]
    fn grow_tail_increments_count() {
        let body = Body {
            tail: Some(Tail { count: 41 }),
        };
        let grown = grow_tail(body).unwrap();
        assert_eq!(grown.tail, Some(Tail { count: 42 }));
    }

    #[test]
    fn grow_tail_is_not_idempotent() {
        let body = Body {
            tail: Some(Tail { count: 0 }),
        };
        let twice = grow_tail(grow_tail(body).unwrap()).unwrap();
        assert_eq!(twice.tail.unwrap().count, 2);
    }

    #[test]
    fn grow_tail_rejects_missing_tail() {
        let err = grow_tail(Body { tail: None }).unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
    }

    #[test]
    fn grow_tail_returns_a_fresh_body() {
        let body = Body {
            tail: Some(Tail { count: 7 }),
        };
        let original = body.clone();
        let grown = grow_tail(body).unwrap();
        assert_ne!(grown, original);
        assert_eq!(original.tail.unwrap().count, 7);
    }

    #[test]
    fn truncate_toward_zero_at_second_granularity() {
        let second = TimeDelta::seconds(1);
        assert_eq!(
            truncate(TimeDelta::milliseconds(1_500), second),
            TimeDelta::seconds(1)
        );
        assert_eq!(
            truncate(TimeDelta::milliseconds(-1_500), second),
            TimeDelta::seconds(-1)
        );
        assert_eq!(truncate(TimeDelta::milliseconds(999), second), TimeDelta::zero());
    }

    #[test]
    fn truncate_at_nanosecond_granularity_is_identity() {
        let delta = TimeDelta::nanoseconds(1_234_567_891);
        assert_eq!(truncate(delta, TimeDelta::nanoseconds(1)), delta);
    }

    #[test]
    fn truncate_ignores_non_positive_granularity() {
        let delta = TimeDelta::nanoseconds(1_234);
        assert_eq!(truncate(delta, TimeDelta::zero()), delta);
        assert_eq!(truncate(delta, TimeDelta::nanoseconds(-10)), delta);
    }

    #[test]
    fn format_duration_cases() {
        let cases = [
            (TimeDelta::zero(), "0s"),
            (TimeDelta::nanoseconds(7), "7ns"),
            (TimeDelta::nanoseconds(1_500), "1.5µs"),
            (TimeDelta::microseconds(250), "250µs"),
            (TimeDelta::milliseconds(500), "500ms"),
            (TimeDelta::milliseconds(-250), "-250ms"),
            (TimeDelta::seconds(5), "5s"),
            (TimeDelta::seconds(-5), "-5s"),
            (TimeDelta::milliseconds(1_500), "1.5s"),
            (TimeDelta::seconds(90), "1m30s"),
            (TimeDelta::milliseconds(120_500), "2m0.5s"),
            (TimeDelta::seconds(3_605), "1h0m5s"),
            (TimeDelta::seconds(-3_605), "-1h0m5s"),
            (TimeDelta::nanoseconds(3_600_000_000_001), "1h0m0.000000001s"),
        ];
        for (delta, expected) in cases {
            assert_eq!(format_duration(delta), expected, "delta {delta:?}");
        }
    }

    #[test]
    fn ago_round_trips_as_signed_nanoseconds() {
        let result = BounceResult {
            reply: "hello x".to_string(),
            time_message: String::new(),
            now: at(0, 0),
            ago: TimeDelta::nanoseconds(-1_234_567_891),
        };
        let bytes = bincode::serialize(&result).unwrap();
        let decoded: BounceResult = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn ball_round_trips_with_nanosecond_timestamps() {
        let ball = Ball {
            message: "wire".to_string(),
            when: at(1_714_564_800, 123_456_789),
            now: at(1_714_564_805, 987_654_321),
        };
        let bytes = bincode::serialize(&ball).unwrap();
        let decoded: Ball = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, ball);
    }
}

//! Per-actor caps on sensitive actions.
//!
//! Two window shapes exist. Calendar-day limiters keep one counter row per
//! `(actor, action)` that resets when the last attempt happened on an earlier
//! UTC date. Trailing limiters count event rows newer than `now - window`.
//! Both read, compare and record under a lock held by the caller's
//! transaction, and a refused attempt is never recorded.

use sqlx::{FromRow, PgConnection, PgPool};
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::error::{AccountError, AccountResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    PasswordChange,
    VerificationEmail,
    EmailChange,
    Login,
    Signup,
    Otp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    CalendarDay,
    Trailing(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: i32,
    pub window: Window,
}

impl RateLimitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::PasswordChange => "password_change",
            RateLimitAction::VerificationEmail => "verification_email",
            RateLimitAction::EmailChange => "email_change",
            RateLimitAction::Login => "login",
            RateLimitAction::Signup => "signup",
            RateLimitAction::Otp => "otp",
        }
    }

    pub fn policy(self) -> RateLimitPolicy {
        match self {
            RateLimitAction::PasswordChange
            | RateLimitAction::VerificationEmail
            | RateLimitAction::EmailChange => RateLimitPolicy {
                limit: 3,
                window: Window::CalendarDay,
            },
            RateLimitAction::Login | RateLimitAction::Signup | RateLimitAction::Otp => {
                RateLimitPolicy {
                    limit: 10,
                    window: Window::Trailing(Duration::minutes(5)),
                }
            }
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyCounter {
    pub actor_key: String,
    pub action: String,
    pub attempts: i32,
    pub last_attempt_on: Option<Date>,
}

impl DailyCounter {
    /// Attempts that count against `today`.
    pub fn used(&self, today: Date) -> i32 {
        if self.last_attempt_on == Some(today) {
            self.attempts
        } else {
            0
        }
    }

    pub fn remaining(&self, limit: i32, today: Date) -> i32 {
        (limit - self.used(today)).max(0)
    }

    pub fn is_exhausted(&self, limit: i32, today: Date) -> bool {
        self.used(today) >= limit
    }
}

/// Start of the next UTC day, when calendar-day counters reset.
pub fn next_midnight(today: Date) -> Option<OffsetDateTime> {
    today.next_day().map(|d| d.midnight().assume_utc())
}

/// Trailing-window decision: `Err(retry_at)` when `count` already fills the window.
pub fn trailing_decision(
    count: i64,
    oldest: Option<OffsetDateTime>,
    limit: i32,
    window: Duration,
) -> Result<(), Option<OffsetDateTime>> {
    if count >= i64::from(limit) {
        Err(oldest.map(|t| t + window))
    } else {
        Ok(())
    }
}

/// Load and row-lock the counter for `(actor_key, action)`, creating it if absent.
pub async fn lock_daily(
    conn: &mut PgConnection,
    actor_key: &str,
    action: RateLimitAction,
) -> sqlx::Result<DailyCounter> {
    sqlx::query(
        r#"
        INSERT INTO rate_limit_counters (actor_key, action)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(actor_key)
    .bind(action.as_str())
    .execute(&mut *conn)
    .await?;

    sqlx::query_as::<_, DailyCounter>(
        r#"
        SELECT actor_key, action, attempts, last_attempt_on
        FROM rate_limit_counters
        WHERE actor_key = $1 AND action = $2
        FOR UPDATE
        "#,
    )
    .bind(actor_key)
    .bind(action.as_str())
    .fetch_one(&mut *conn)
    .await
}

/// Count one attempt on `today`; returns the attempts used today afterwards.
pub async fn record_daily(
    conn: &mut PgConnection,
    counter: &DailyCounter,
    today: Date,
) -> sqlx::Result<i32> {
    let used = counter.used(today) + 1;
    sqlx::query(
        r#"
        UPDATE rate_limit_counters
        SET attempts = $3, last_attempt_on = $4
        WHERE actor_key = $1 AND action = $2
        "#,
    )
    .bind(&counter.actor_key)
    .bind(&counter.action)
    .bind(used)
    .bind(today)
    .execute(&mut *conn)
    .await?;
    Ok(used)
}

pub async fn reset_daily(
    conn: &mut PgConnection,
    actor_key: &str,
    action: RateLimitAction,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE rate_limit_counters SET attempts = 0 WHERE actor_key = $1 AND action = $2",
    )
    .bind(actor_key)
    .bind(action.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Attempts left today for a calendar-day action, without locking.
pub async fn daily_remaining(
    conn: &mut PgConnection,
    actor_key: &str,
    action: RateLimitAction,
    today: Date,
) -> sqlx::Result<i32> {
    let limit = action.policy().limit;
    let counter = sqlx::query_as::<_, DailyCounter>(
        r#"
        SELECT actor_key, action, attempts, last_attempt_on
        FROM rate_limit_counters
        WHERE actor_key = $1 AND action = $2
        "#,
    )
    .bind(actor_key)
    .bind(action.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(counter.map_or(limit, |c| c.remaining(limit, today)))
}

/// Refuse with `RateLimited` when `actor_key` has used up `action`, otherwise
/// record the attempt. Runs inside the caller's transaction.
pub async fn check_and_consume(
    conn: &mut PgConnection,
    actor_key: &str,
    action: RateLimitAction,
    now: OffsetDateTime,
) -> AccountResult<()> {
    let policy = action.policy();
    match policy.window {
        Window::CalendarDay => {
            let today = now.date();
            let counter = lock_daily(conn, actor_key, action).await?;
            if counter.is_exhausted(policy.limit, today) {
                warn!(actor_key, action = action.as_str(), "daily limit reached");
                return Err(AccountError::RateLimited {
                    retry_at: next_midnight(today),
                });
            }
            record_daily(conn, &counter, today).await?;
        }
        Window::Trailing(window) => {
            let lock_key = format!("{}:{}", action.as_str(), actor_key);
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(&lock_key)
                .execute(&mut *conn)
                .await?;

            let since = now - window;
            let (count, oldest): (i64, Option<OffsetDateTime>) = sqlx::query_as(
                r#"
                SELECT COUNT(*), MIN(created_at)
                FROM rate_limit_events
                WHERE action = $1 AND actor_key = $2 AND created_at > $3
                "#,
            )
            .bind(action.as_str())
            .bind(actor_key)
            .bind(since)
            .fetch_one(&mut *conn)
            .await?;

            if let Err(retry_at) = trailing_decision(count, oldest, policy.limit, window) {
                warn!(actor_key, action = action.as_str(), count, "trailing limit reached");
                return Err(AccountError::RateLimited { retry_at });
            }

            sqlx::query(
                "DELETE FROM rate_limit_events WHERE action = $1 AND actor_key = $2 AND created_at <= $3",
            )
            .bind(action.as_str())
            .bind(actor_key)
            .bind(since)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO rate_limit_events (actor_key, action, created_at) VALUES ($1, $2, $3)",
            )
            .bind(actor_key)
            .bind(action.as_str())
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
    }
    debug!(actor_key, action = action.as_str(), "rate limit attempt recorded");
    Ok(())
}

/// [`check_and_consume`] in a transaction of its own.
pub async fn consume(db: &PgPool, actor_key: &str, action: RateLimitAction) -> AccountResult<()> {
    let mut tx = db.begin().await?;
    check_and_consume(&mut tx, actor_key, action, OffsetDateTime::now_utc()).await?;
    tx.commit().await?;
    Ok(())
}

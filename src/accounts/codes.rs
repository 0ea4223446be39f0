use rand::{rngs::OsRng, Rng};
use sqlx::PgConnection;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accounts::repo_types::{CodePurpose, OneTimeCode};
use crate::error::{AccountError, AccountResult};

/// Lifetime of an issued code.
pub const CODE_TTL: Duration = Duration::minutes(10);

/// Wrong guesses after which a code is discarded.
pub const MAX_CODE_ATTEMPTS: i32 = 5;

/// Whether a code with `misses` wrong guesses is used up.
pub fn is_burned(misses: i32) -> bool {
    misses >= MAX_CODE_ATTEMPTS
}

pub fn generate_code() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

fn codes_match(stored: &str, supplied: &str) -> bool {
    stored.len() == supplied.len()
        && stored
            .bytes()
            .zip(supplied.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Decide whether `supplied` redeems `stored` at `now`.
///
/// Expiry wins over a matching code. For email changes the caller must also
/// name the same pending address the code was issued for.
pub fn check(
    stored: &OneTimeCode,
    supplied: &str,
    expected_email: Option<&str>,
    now: OffsetDateTime,
) -> AccountResult<()> {
    if now > stored.expires_at {
        return Err(AccountError::CodeExpired);
    }
    if !codes_match(&stored.code, supplied.trim()) {
        return Err(AccountError::CodeMismatch);
    }
    if let Some(expected) = expected_email {
        if stored.pending_email.as_deref() != Some(expected) {
            return Err(AccountError::CodeMismatch);
        }
    }
    Ok(())
}

/// Issue a fresh code, replacing any pending one of the same purpose.
pub async fn issue(
    conn: &mut PgConnection,
    user_id: Uuid,
    purpose: CodePurpose,
    pending_email: Option<&str>,
    now: OffsetDateTime,
) -> sqlx::Result<String> {
    let code = generate_code();
    sqlx::query(
        r#"
        INSERT INTO one_time_codes (user_id, purpose, code, expires_at, pending_email)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, purpose)
        DO UPDATE SET code = EXCLUDED.code,
                      expires_at = EXCLUDED.expires_at,
                      pending_email = EXCLUDED.pending_email,
                      attempts = 0
        "#,
    )
    .bind(user_id)
    .bind(purpose.as_str())
    .bind(&code)
    .bind(now + CODE_TTL)
    .bind(pending_email)
    .execute(&mut *conn)
    .await?;
    debug!(%user_id, purpose = purpose.as_str(), "one-time code issued");
    Ok(code)
}

/// Redeem a code. On success the pending row is deleted, so a code works once.
///
/// A wrong guess is counted on the row, and the row is deleted once
/// [`MAX_CODE_ATTEMPTS`] is reached. Callers must commit after a
/// `CodeMismatch` for the count to stick.
pub async fn verify(
    conn: &mut PgConnection,
    user_id: Uuid,
    purpose: CodePurpose,
    supplied: &str,
    expected_email: Option<&str>,
    now: OffsetDateTime,
) -> AccountResult<OneTimeCode> {
    let stored = sqlx::query_as::<_, OneTimeCode>(
        r#"
        SELECT user_id, code, expires_at, pending_email, attempts
        FROM one_time_codes
        WHERE user_id = $1 AND purpose = $2
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(purpose.as_str())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(AccountError::CodeMismatch)?;

    match check(&stored, supplied, expected_email, now) {
        Ok(()) => {}
        Err(AccountError::CodeMismatch) => {
            let misses = stored.attempts + 1;
            if is_burned(misses) {
                discard(conn, user_id, purpose).await?;
                warn!(%user_id, purpose = purpose.as_str(), "one-time code burned after repeated misses");
            } else {
                sqlx::query(
                    "UPDATE one_time_codes SET attempts = $3 WHERE user_id = $1 AND purpose = $2",
                )
                .bind(user_id)
                .bind(purpose.as_str())
                .bind(misses)
                .execute(&mut *conn)
                .await?;
            }
            return Err(AccountError::CodeMismatch);
        }
        Err(e) => return Err(e),
    }

    discard(conn, user_id, purpose).await?;
    Ok(stored)
}

async fn discard(conn: &mut PgConnection, user_id: Uuid, purpose: CodePurpose) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM one_time_codes WHERE user_id = $1 AND purpose = $2")
        .bind(user_id)
        .bind(purpose.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(code: &str, expires_at: OffsetDateTime, pending: Option<&str>) -> OneTimeCode {
        OneTimeCode {
            user_id: Uuid::new_v4(),
            code: code.into(),
            expires_at,
            pending_email: pending.map(str::to_string),
            attempts: 0,
        }
    }

    #[test]
    fn code_burns_at_the_attempt_cap() {
        assert!(!is_burned(MAX_CODE_ATTEMPTS - 1));
        assert!(is_burned(MAX_CODE_ATTEMPTS));
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn matching_code_within_window_passes() {
        let now = OffsetDateTime::now_utc();
        let row = stored("123456", now + CODE_TTL, None);
        assert!(check(&row, "123456", None, now).is_ok());
        assert!(check(&row, " 123456 ", None, now).is_ok());
    }

    #[test]
    fn expiry_wins_over_matching_code() {
        let now = OffsetDateTime::now_utc();
        let row = stored("123456", now - Duration::seconds(1), None);
        assert!(matches!(
            check(&row, "123456", None, now),
            Err(AccountError::CodeExpired)
        ));
    }

    #[test]
    fn wrong_code_is_mismatch() {
        let now = OffsetDateTime::now_utc();
        let row = stored("123456", now + CODE_TTL, None);
        assert!(matches!(
            check(&row, "654321", None, now),
            Err(AccountError::CodeMismatch)
        ));
        assert!(matches!(
            check(&row, "12345", None, now),
            Err(AccountError::CodeMismatch)
        ));
    }

    #[test]
    fn email_change_requires_the_issued_address() {
        let now = OffsetDateTime::now_utc();
        let row = stored("111111", now + CODE_TTL, Some("new@x.com"));
        assert!(check(&row, "111111", Some("new@x.com"), now).is_ok());
        assert!(matches!(
            check(&row, "111111", Some("other@x.com"), now),
            Err(AccountError::CodeMismatch)
        ));
    }

    #[test]
    fn exactly_at_expiry_still_valid() {
        let now = OffsetDateTime::now_utc();
        let row = stored("000001", now, None);
        assert!(check(&row, "000001", None, now).is_ok());
    }
}

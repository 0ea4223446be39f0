//! Account mutation gateway.
//!
//! Each operation validates input, runs all of its reads and writes in one
//! transaction, commits, and only then re-materializes the session snapshot
//! from the store. An early `?` drops the transaction, which rolls it back.

use sqlx::{PgConnection, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::codes;
use super::dto::{
    normalize_code, normalize_cuisines, normalize_email, normalize_name, validate_password,
    ChangePasswordRequest, ConfirmEmailChangeRequest, EmailChangeRequest, LoginRequest,
    ResendRequest, SignupRequest, UpdateProfileRequest, VerifyRequest,
};
use super::limiter::{self, RateLimitAction};
use super::password::{hash_password, verify_dummy, verify_password};
use super::repo;
use super::repo_types::{
    Account, AccountChanges, CodePurpose, FavoriteRow, NewAccount, PublicProfile,
};
use super::session::{materialize, SessionSnapshot};
use crate::error::{conflict_on_unique, AccountError, AccountResult};
use crate::mailer::CodeEmail;
use crate::realtime::{ChangeEvent, ChangeOp};
use crate::state::{AdminIdentity, AppState};

/// Minimum spacing between display-name changes.
pub const NAME_CHANGE_INTERVAL: Duration = Duration::days(7);

pub const FIRST_FAVORITE: &str = "first_favorite";

const ADMIN_NAME: &str = "Admin";

/// `Err(next_allowed)` while the previous name change is too recent.
pub fn name_change_allowed(
    last_changed: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Result<(), OffsetDateTime> {
    match last_changed {
        None => Ok(()),
        Some(last) => {
            let next = last + NAME_CHANGE_INTERVAL;
            if now > next {
                Ok(())
            } else {
                Err(next)
            }
        }
    }
}

/// Lock the caller's account row and make sure it may still act.
async fn load_active(
    conn: &mut PgConnection,
    user_id: Uuid,
    now: OffsetDateTime,
) -> AccountResult<Account> {
    let account = Account::lock_by_id(conn, user_id)
        .await?
        .ok_or(AccountError::Unauthorized)?;
    if let Some(until) = account.suspension(now) {
        return Err(AccountError::Suspended { until });
    }
    Ok(account)
}

async fn send_code(
    state: &AppState,
    to: &str,
    code: &str,
    purpose: CodePurpose,
) -> AccountResult<()> {
    let (subject, preamble) = match purpose {
        CodePurpose::Signup => (
            "Verify your Recipebox account",
            "Welcome to Recipebox! Enter this code to verify your email address.",
        ),
        CodePurpose::EmailChange => (
            "Confirm your new email address",
            "Enter this code to confirm your new Recipebox email address.",
        ),
    };
    let email = CodeEmail {
        to,
        code,
        subject,
        preamble,
    };
    state.mailer.send_code(&email).await.map_err(|e| {
        error!(error = ?e, to, purpose = purpose.as_str(), "code email dispatch failed");
        AccountError::EmailDispatchFailed
    })
}

/// Redeem a one-time code inside `tx`. On a wrong or expired code the
/// transaction is committed so the recorded miss survives the error.
async fn redeem_code(
    mut tx: Transaction<'static, Postgres>,
    user_id: Uuid,
    purpose: CodePurpose,
    code: &str,
    expected_email: Option<&str>,
    now: OffsetDateTime,
) -> AccountResult<Transaction<'static, Postgres>> {
    match codes::verify(&mut tx, user_id, purpose, code, expected_email, now).await {
        Ok(_) => Ok(tx),
        Err(e @ (AccountError::CodeMismatch | AccountError::CodeExpired)) => {
            tx.commit().await?;
            warn!(%user_id, purpose = purpose.as_str(), error = %e, "one-time code refused");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn is_admin_email(state: &AppState, email: &str) -> bool {
    state.admin.as_ref().is_some_and(|a| a.email == email)
}

// ---- login ----

#[instrument(skip(state, req))]
pub async fn login(state: &AppState, req: &LoginRequest) -> AccountResult<SessionSnapshot> {
    let email = normalize_email(&req.email)?;
    let now = OffsetDateTime::now_utc();

    if let Some(admin) = state.admin.as_deref() {
        if admin.email == email {
            return login_admin(state, admin, &req.password, now).await;
        }
    }

    let mut conn = state.db.acquire().await?;
    let account = match Account::find_by_email(&mut conn, &email).await? {
        Some(a) => a,
        None => {
            verify_dummy(&req.password);
            warn!(%email, "login unknown email");
            return Err(AccountError::NoSuchAccount);
        }
    };
    drop(conn);

    if !verify_password(&req.password, &account.password_hash)? {
        warn!(user_id = %account.id, "login invalid password");
        return Err(AccountError::BadPassword { remaining: None });
    }
    if !account.verified {
        return Err(AccountError::Unverified);
    }
    if let Some(until) = account.suspension(now) {
        warn!(user_id = %account.id, %until, "login while suspended");
        return Err(AccountError::Suspended { until });
    }

    let snapshot = materialize(&state.db, account.id).await?;
    info!(user_id = %account.id, "user logged in");
    Ok(snapshot)
}

/// Configured administrator: checked against the start-up hash, then
/// reconciled into a verified admin account row on first use.
async fn login_admin(
    state: &AppState,
    admin: &AdminIdentity,
    password: &str,
    now: OffsetDateTime,
) -> AccountResult<SessionSnapshot> {
    if !verify_password(password, &admin.password_hash)? {
        warn!("admin login invalid password");
        return Err(AccountError::BadPassword { remaining: None });
    }

    let mut tx = state.db.begin().await?;
    let account = match Account::find_by_email(&mut tx, &admin.email).await? {
        Some(a) if a.verified => {
            if a.is_admin {
                a
            } else {
                let changes = AccountChanges {
                    is_admin: Some(true),
                    ..Default::default()
                };
                Account::update(&mut tx, a.id, &changes, now).await?
            }
        }
        _ => {
            Account::delete_unverified_by_email(&mut tx, &admin.email).await?;
            let name = if Account::name_taken(&mut tx, ADMIN_NAME, None).await? {
                format!("{ADMIN_NAME}-{}", &Uuid::new_v4().simple().to_string()[..6])
            } else {
                ADMIN_NAME.to_string()
            };
            let created = Account::create(
                &mut tx,
                &NewAccount {
                    name: &name,
                    email: &admin.email,
                    password_hash: &admin.password_hash,
                    is_admin: true,
                    verified: true,
                },
            )
            .await
            .map_err(|e| conflict_on_unique(e, "Admin account is being created, retry"))?;
            info!(user_id = %created.id, "admin account reconciled");
            created
        }
    };
    if let Some(until) = account.suspension(now) {
        return Err(AccountError::Suspended { until });
    }
    tx.commit().await?;

    materialize(&state.db, account.id).await
}

// ---- signup & verification ----

#[instrument(skip(state, req))]
pub async fn signup(state: &AppState, req: &SignupRequest) -> AccountResult<String> {
    let name = normalize_name(&req.name)?;
    let email = normalize_email(&req.email)?;
    validate_password(&req.password)?;
    if is_admin_email(state, &email) {
        return Err(AccountError::Conflict("Email already registered".into()));
    }
    let hash = hash_password(&req.password)?;
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    // the per-email counter lock also serializes concurrent signups for one address
    limiter::check_and_consume(&mut tx, &email, RateLimitAction::VerificationEmail, now).await?;

    if Account::email_verified_elsewhere(&mut tx, &email, None).await? {
        warn!(%email, "signup for registered email");
        return Err(AccountError::Conflict("Email already registered".into()));
    }
    let replaced = Account::delete_unverified_by_email(&mut tx, &email).await?;
    if replaced > 0 {
        info!(%email, replaced, "replacing unverified signup");
    }
    if Account::name_taken(&mut tx, &name, None).await? {
        return Err(AccountError::Conflict("Name already taken".into()));
    }

    let account = Account::create(
        &mut tx,
        &NewAccount {
            name: &name,
            email: &email,
            password_hash: &hash,
            is_admin: false,
            verified: false,
        },
    )
    .await
    .map_err(|e| conflict_on_unique(e, "Email or name already taken"))?;
    let code = codes::issue(&mut tx, account.id, CodePurpose::Signup, None, now).await?;
    tx.commit().await?;
    info!(user_id = %account.id, "signup pending verification");

    send_code(state, &email, &code, CodePurpose::Signup).await?;
    Ok(email)
}

/// Re-send a signup code. Unknown or already verified addresses get the same
/// answer without an email.
#[instrument(skip(state, req))]
pub async fn resend_verification(state: &AppState, req: &ResendRequest) -> AccountResult<()> {
    let email = normalize_email(&req.email)?;
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    limiter::check_and_consume(&mut tx, &email, RateLimitAction::VerificationEmail, now).await?;
    let account = match Account::find_by_email(&mut tx, &email).await? {
        Some(a) if !a.verified => a,
        _ => {
            tx.commit().await?;
            debug!(%email, "resend for unknown or verified email ignored");
            return Ok(());
        }
    };
    let code = codes::issue(&mut tx, account.id, CodePurpose::Signup, None, now).await?;
    tx.commit().await?;

    send_code(state, &email, &code, CodePurpose::Signup).await
}

#[instrument(skip(state, req))]
pub async fn verify_signup(state: &AppState, req: &VerifyRequest) -> AccountResult<SessionSnapshot> {
    let email = normalize_email(&req.email)?;
    let code = normalize_code(&req.code)?;
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    let account = match Account::find_by_email(&mut tx, &email).await? {
        Some(a) if !a.verified => a,
        _ => return Err(AccountError::CodeMismatch),
    };
    let mut tx = redeem_code(tx, account.id, CodePurpose::Signup, &code, None, now).await?;

    if Account::email_verified_elsewhere(&mut tx, &email, Some(account.id)).await? {
        return Err(AccountError::Conflict("Email already registered".into()));
    }
    let changes = AccountChanges {
        verified: Some(true),
        ..Default::default()
    };
    Account::update(&mut tx, account.id, &changes, now)
        .await
        .map_err(|e| conflict_on_unique(e, "Email already registered"))?;
    tx.commit().await?;
    info!(user_id = %account.id, "email verified");

    materialize(&state.db, account.id).await
}

// ---- credentials ----

#[instrument(skip(state, req))]
pub async fn change_password(
    state: &AppState,
    user_id: Uuid,
    req: &ChangePasswordRequest,
) -> AccountResult<SessionSnapshot> {
    validate_password(&req.new_password)?;
    if req.new_password == req.current_password {
        return Err(AccountError::Validation(
            "New password must differ from the current one".into(),
        ));
    }
    let now = OffsetDateTime::now_utc();
    let today = now.date();
    let key = user_id.to_string();
    let limit = RateLimitAction::PasswordChange.policy().limit;

    let mut tx = state.db.begin().await?;
    let account = load_active(&mut tx, user_id, now).await?;
    let counter = limiter::lock_daily(&mut tx, &key, RateLimitAction::PasswordChange).await?;
    if counter.is_exhausted(limit, today) {
        warn!(%user_id, "password change attempts exhausted");
        return Err(AccountError::RateLimited {
            retry_at: limiter::next_midnight(today),
        });
    }

    if !verify_password(&req.current_password, &account.password_hash)? {
        let used = limiter::record_daily(&mut tx, &counter, today).await?;
        tx.commit().await?;
        let remaining = (limit - used).max(0);
        warn!(%user_id, remaining, "password change with wrong current password");
        return Err(AccountError::BadPassword {
            remaining: Some(remaining),
        });
    }

    let changes = AccountChanges {
        password_hash: Some(hash_password(&req.new_password)?),
        ..Default::default()
    };
    Account::update(&mut tx, user_id, &changes, now).await?;
    limiter::reset_daily(&mut tx, &key, RateLimitAction::PasswordChange).await?;
    tx.commit().await?;
    info!(%user_id, "password changed");

    materialize(&state.db, user_id).await
}

#[instrument(skip(state, req))]
pub async fn request_email_change(
    state: &AppState,
    user_id: Uuid,
    req: &EmailChangeRequest,
) -> AccountResult<()> {
    let new_email = normalize_email(&req.new_email)?;
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    let account = load_active(&mut tx, user_id, now).await?;
    if account.email == new_email {
        return Err(AccountError::Validation("That is already your email".into()));
    }
    if is_admin_email(state, &new_email)
        || Account::email_verified_elsewhere(&mut tx, &new_email, Some(user_id)).await?
    {
        return Err(AccountError::Conflict("Email already in use".into()));
    }
    limiter::check_and_consume(&mut tx, &user_id.to_string(), RateLimitAction::EmailChange, now)
        .await?;
    let code = codes::issue(&mut tx, user_id, CodePurpose::EmailChange, Some(&new_email), now).await?;
    tx.commit().await?;
    info!(%user_id, "email change requested");

    send_code(state, &new_email, &code, CodePurpose::EmailChange).await
}

#[instrument(skip(state, req))]
pub async fn confirm_email_change(
    state: &AppState,
    user_id: Uuid,
    req: &ConfirmEmailChangeRequest,
) -> AccountResult<SessionSnapshot> {
    let new_email = normalize_email(&req.new_email)?;
    let code = normalize_code(&req.code)?;
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    load_active(&mut tx, user_id, now).await?;
    let mut tx = redeem_code(
        tx,
        user_id,
        CodePurpose::EmailChange,
        &code,
        Some(&new_email),
        now,
    )
    .await?;
    if Account::email_verified_elsewhere(&mut tx, &new_email, Some(user_id)).await? {
        return Err(AccountError::Conflict("Email already in use".into()));
    }
    let changes = AccountChanges {
        email: Some(new_email),
        ..Default::default()
    };
    Account::update(&mut tx, user_id, &changes, now)
        .await
        .map_err(|e| conflict_on_unique(e, "Email already in use"))?;
    tx.commit().await?;
    info!(%user_id, "email changed");

    materialize(&state.db, user_id).await
}

// ---- profile & favorites ----

#[instrument(skip(state, req))]
pub async fn update_profile(
    state: &AppState,
    user_id: Uuid,
    req: &UpdateProfileRequest,
) -> AccountResult<SessionSnapshot> {
    let name = req.name.as_deref().map(normalize_name).transpose()?;
    let country = req.country.as_deref().map(|c| {
        let c = c.trim();
        (!c.is_empty()).then(|| c.to_string())
    });
    if country.as_ref().and_then(|c| c.as_ref()).is_some_and(|c| c.chars().count() > 64) {
        return Err(AccountError::Validation("Country name too long".into()));
    }
    let cuisines = req.favorite_cuisines.as_deref().map(normalize_cuisines);
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    let account = load_active(&mut tx, user_id, now).await?;

    let mut changes = AccountChanges {
        country,
        dietary_preference: req.dietary_preference,
        ..Default::default()
    };
    if let Some(name) = name.filter(|n| *n != account.name) {
        if let Err(next) = name_change_allowed(account.name_changed_at, now) {
            return Err(AccountError::RateLimited {
                retry_at: Some(next),
            });
        }
        if Account::name_taken(&mut tx, &name, Some(user_id)).await? {
            return Err(AccountError::Conflict("Name already taken".into()));
        }
        changes.name = Some(name);
    }
    let updated = Account::update(&mut tx, user_id, &changes, now)
        .await
        .map_err(|e| conflict_on_unique(e, "Name already taken"))?;
    if let Some(cuisines) = &cuisines {
        repo::replace_favorite_cuisines(&mut tx, user_id, cuisines).await?;
    }
    tx.commit().await?;
    info!(%user_id, renamed = changes.name.is_some(), "profile updated");

    if changes.name.is_some() || changes.country.is_some() {
        match ChangeEvent::upsert(ChangeOp::Update, &PublicProfile::from(&updated)) {
            Ok(event) => state.feed.publish(event),
            Err(e) => warn!(error = %e, "profile change event not published"),
        }
    }

    materialize(&state.db, user_id).await
}

#[derive(Debug)]
pub struct FavoriteOutcome {
    pub is_favorite: bool,
    pub achievement_unlocked: Option<&'static str>,
    pub session: SessionSnapshot,
}

#[instrument(skip(state))]
pub async fn toggle_favorite(
    state: &AppState,
    user_id: Uuid,
    recipe_id: Uuid,
) -> AccountResult<FavoriteOutcome> {
    let now = OffsetDateTime::now_utc();

    let mut tx = state.db.begin().await?;
    load_active(&mut tx, user_id, now).await?;
    if !repo::recipe_exists(&mut tx, recipe_id).await? {
        return Err(AccountError::NotFound);
    }
    let is_favorite = if repo::remove_favorite(&mut tx, user_id, recipe_id).await? {
        false
    } else {
        repo::add_favorite(&mut tx, user_id, recipe_id).await?;
        true
    };
    let achievement_unlocked =
        if is_favorite && repo::unlock_achievement(&mut tx, user_id, FIRST_FAVORITE).await? {
            Some(FIRST_FAVORITE)
        } else {
            None
        };
    tx.commit().await?;
    debug!(%user_id, %recipe_id, is_favorite, "favorite toggled");

    let row = FavoriteRow { user_id, recipe_id };
    let event = if is_favorite {
        ChangeEvent::upsert(ChangeOp::Insert, &row)
    } else {
        Ok(ChangeEvent::delete(&row))
    };
    match event {
        Ok(event) => state.feed.publish(event),
        Err(e) => warn!(error = %e, "favorite change event not published"),
    }

    let session = materialize(&state.db, user_id).await?;
    Ok(FavoriteOutcome {
        is_favorite,
        achievement_unlocked,
        session,
    })
}

// ---- session ----

/// Re-derive the caller's snapshot, e.g. to reconcile optimistic UI state.
#[instrument(skip(state))]
pub async fn refresh_session(state: &AppState, user_id: Uuid) -> AccountResult<SessionSnapshot> {
    let snapshot = materialize(&state.db, user_id).await?;
    if let Some(until) = snapshot
        .suspended_until
        .filter(|until| *until > OffsetDateTime::now_utc())
    {
        return Err(AccountError::Suspended { until });
    }
    Ok(snapshot)
}

// ---- moderation ----

#[instrument(skip(state))]
pub async fn suspend_account(
    state: &AppState,
    admin_id: Uuid,
    target: Uuid,
    until: Option<OffsetDateTime>,
) -> AccountResult<()> {
    let now = OffsetDateTime::now_utc();
    if target == admin_id {
        return Err(AccountError::Validation("You cannot suspend yourself".into()));
    }
    if until.is_some_and(|u| u <= now) {
        return Err(AccountError::Validation("Suspension must end in the future".into()));
    }

    let mut tx = state.db.begin().await?;
    Account::lock_by_id(&mut tx, target)
        .await?
        .ok_or(AccountError::NotFound)?;
    let changes = AccountChanges {
        suspended_until: Some(until),
        ..Default::default()
    };
    Account::update(&mut tx, target, &changes, now).await?;
    tx.commit().await?;
    info!(%admin_id, %target, ?until, "suspension updated");
    Ok(())
}

#[instrument(skip(state))]
pub async fn delete_account(state: &AppState, admin_id: Uuid, target: Uuid) -> AccountResult<()> {
    if target == admin_id {
        return Err(AccountError::Validation("You cannot delete yourself".into()));
    }
    let mut tx = state.db.begin().await?;
    if !Account::delete_by_id(&mut tx, target).await? {
        return Err(AccountError::NotFound);
    }
    tx.commit().await?;
    info!(%admin_id, %target, "account deleted");
    Ok(())
}

/// Remove unverified signups whose code has lapsed.
pub async fn purge_unverified(state: &AppState) -> AccountResult<u64> {
    let purged = Account::purge_expired_unverified(&state.db, OffsetDateTime::now_utc()).await?;
    if purged > 0 {
        info!(purged, "purged expired unverified accounts");
    }
    Ok(purged)
}

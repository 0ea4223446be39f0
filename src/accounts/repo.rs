use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::repo_types::{Account, AccountChanges, NewAccount};

const ACCOUNT_COLUMNS: &str = "id, name, email, password_hash, is_admin, verified, suspended_until, \
     country, dietary_preference, avatar, name_changed_at, created_at, updated_at";

impl Account {
    pub async fn find_by_id(conn: &mut PgConnection, id: Uuid) -> sqlx::Result<Option<Account>> {
        sqlx::query_as::<_, Account>(&format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
    }

    /// Same as [`Account::find_by_id`] but holds the row lock until the
    /// transaction ends, serializing mutations of one account.
    pub async fn lock_by_id(conn: &mut PgConnection, id: Uuid) -> sqlx::Result<Option<Account>> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
    }

    /// Find the account holding `email`, preferring the verified one.
    pub async fn find_by_email(
        conn: &mut PgConnection,
        email: &str,
    ) -> sqlx::Result<Option<Account>> {
        sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
            FROM users
            WHERE email = $1
            ORDER BY verified DESC, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(email)
        .fetch_optional(&mut *conn)
        .await
    }

    pub async fn create(conn: &mut PgConnection, new: &NewAccount<'_>) -> sqlx::Result<Account> {
        sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO users (name, email, password_hash, is_admin, verified, avatar)
            VALUES ($1, $2, $3, $4, $5, $1)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(new.name)
        .bind(new.email)
        .bind(new.password_hash)
        .bind(new.is_admin)
        .bind(new.verified)
        .fetch_one(&mut *conn)
        .await
    }

    /// Apply `changes`. A new name also resets the avatar seed and stamps
    /// `name_changed_at` with `now`.
    pub async fn update(
        conn: &mut PgConnection,
        id: Uuid,
        changes: &AccountChanges,
        now: OffsetDateTime,
    ) -> sqlx::Result<Account> {
        let (set_country, country) = match &changes.country {
            Some(c) => (true, c.clone()),
            None => (false, None),
        };
        let (set_suspension, suspended_until) = match changes.suspended_until {
            Some(s) => (true, s),
            None => (false, None),
        };
        sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE users SET
                name               = COALESCE($2, name),
                avatar             = COALESCE($2, avatar),
                name_changed_at    = CASE WHEN $2 IS NULL THEN name_changed_at ELSE $11 END,
                email              = COALESCE($3, email),
                password_hash      = COALESCE($4, password_hash),
                verified           = COALESCE($5, verified),
                country            = CASE WHEN $6 THEN $7 ELSE country END,
                dietary_preference = COALESCE($8, dietary_preference),
                suspended_until    = CASE WHEN $9 THEN $10 ELSE suspended_until END,
                is_admin           = COALESCE($12, is_admin),
                updated_at         = $11
            WHERE id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(changes.name.as_deref())
        .bind(changes.email.as_deref())
        .bind(changes.password_hash.as_deref())
        .bind(changes.verified)
        .bind(set_country)
        .bind(country)
        .bind(changes.dietary_preference.map(|d| d.as_str()))
        .bind(set_suspension)
        .bind(suspended_until)
        .bind(now)
        .bind(changes.is_admin)
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn delete_by_id(conn: &mut PgConnection, id: Uuid) -> sqlx::Result<bool> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Drop unverified signups for `email` so the address can register again.
    pub async fn delete_unverified_by_email(
        conn: &mut PgConnection,
        email: &str,
    ) -> sqlx::Result<u64> {
        let res = sqlx::query("DELETE FROM users WHERE email = $1 AND NOT verified")
            .bind(email)
            .execute(&mut *conn)
            .await?;
        Ok(res.rows_affected())
    }

    /// Case-insensitive display-name check, ignoring `except`.
    pub async fn name_taken(
        conn: &mut PgConnection,
        name: &str,
        except: Option<Uuid>,
    ) -> sqlx::Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE lower(name) = lower($1) AND ($2::uuid IS NULL OR id <> $2)
            )
            "#,
        )
        .bind(name)
        .bind(except)
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn email_verified_elsewhere(
        conn: &mut PgConnection,
        email: &str,
        except: Option<Uuid>,
    ) -> sqlx::Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE email = $1 AND verified AND ($2::uuid IS NULL OR id <> $2)
            )
            "#,
        )
        .bind(email)
        .bind(except)
        .fetch_one(&mut *conn)
        .await
    }

    /// Delete unverified accounts without a live signup code.
    pub async fn purge_expired_unverified(db: &PgPool, now: OffsetDateTime) -> sqlx::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM users u
            WHERE NOT u.verified
              AND NOT EXISTS (
                  SELECT 1 FROM one_time_codes c
                  WHERE c.user_id = u.id AND c.purpose = 'signup' AND c.expires_at > $1
              )
            "#,
        )
        .bind(now)
        .execute(db)
        .await?;
        Ok(res.rows_affected())
    }
}

// ---- Favorites & derived collections ----

pub async fn recipe_exists(conn: &mut PgConnection, recipe_id: Uuid) -> sqlx::Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM recipes WHERE id = $1)")
        .bind(recipe_id)
        .fetch_one(&mut *conn)
        .await
}

pub async fn add_favorite(
    conn: &mut PgConnection,
    user_id: Uuid,
    recipe_id: Uuid,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO favorites (user_id, recipe_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(recipe_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn remove_favorite(
    conn: &mut PgConnection,
    user_id: Uuid,
    recipe_id: Uuid,
) -> sqlx::Result<bool> {
    let res = sqlx::query("DELETE FROM favorites WHERE user_id = $1 AND recipe_id = $2")
        .bind(user_id)
        .bind(recipe_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn list_favorites(conn: &mut PgConnection, user_id: Uuid) -> sqlx::Result<Vec<Uuid>> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT recipe_id
          FROM favorites
         WHERE user_id = $1
         ORDER BY created_at ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await
}

pub async fn list_favorite_cuisines(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT cuisine FROM favorite_cuisines WHERE user_id = $1 ORDER BY cuisine",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await
}

pub async fn replace_favorite_cuisines(
    conn: &mut PgConnection,
    user_id: Uuid,
    cuisines: &[String],
) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM favorite_cuisines WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    if !cuisines.is_empty() {
        sqlx::query(
            r#"
            INSERT INTO favorite_cuisines (user_id, cuisine)
            SELECT $1, c FROM UNNEST($2::text[]) AS c
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(cuisines)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Returns `true` only the first time `code` is unlocked for the user.
pub async fn unlock_achievement(
    conn: &mut PgConnection,
    user_id: Uuid,
    code: &str,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO achievements (user_id, code)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(code)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

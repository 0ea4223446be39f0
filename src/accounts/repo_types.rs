use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::realtime::Entity;

/// Account record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 hash, not exposed in JSON
    pub is_admin: bool,
    pub verified: bool,
    pub suspended_until: Option<OffsetDateTime>,
    pub country: Option<String>,
    pub dietary_preference: String,
    pub avatar: String,
    pub name_changed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// Active suspension at `now`, if any. An elapsed `suspended_until` is ignored.
    pub fn suspension(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.suspended_until.filter(|until| *until > now)
    }

    pub fn diet(&self) -> DietaryPreference {
        self.dietary_preference.parse().unwrap_or_default()
    }
}

/// Fields for a new, unverified account.
#[derive(Debug)]
pub struct NewAccount<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub is_admin: bool,
    pub verified: bool,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Default)]
pub struct AccountChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub verified: Option<bool>,
    pub is_admin: Option<bool>,
    pub country: Option<Option<String>>,
    pub dietary_preference: Option<DietaryPreference>,
    pub suspended_until: Option<Option<OffsetDateTime>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DietaryPreference {
    #[default]
    None,
    Vegetarian,
    Vegan,
    Pescatarian,
    GlutenFree,
    DairyFree,
    Keto,
    Halal,
    Kosher,
}

impl DietaryPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            DietaryPreference::None => "none",
            DietaryPreference::Vegetarian => "vegetarian",
            DietaryPreference::Vegan => "vegan",
            DietaryPreference::Pescatarian => "pescatarian",
            DietaryPreference::GlutenFree => "gluten_free",
            DietaryPreference::DairyFree => "dairy_free",
            DietaryPreference::Keto => "keto",
            DietaryPreference::Halal => "halal",
            DietaryPreference::Kosher => "kosher",
        }
    }
}

impl FromStr for DietaryPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => DietaryPreference::None,
            "vegetarian" => DietaryPreference::Vegetarian,
            "vegan" => DietaryPreference::Vegan,
            "pescatarian" => DietaryPreference::Pescatarian,
            "gluten_free" => DietaryPreference::GlutenFree,
            "dairy_free" => DietaryPreference::DairyFree,
            "keto" => DietaryPreference::Keto,
            "halal" => DietaryPreference::Halal,
            "kosher" => DietaryPreference::Kosher,
            other => anyhow::bail!("unknown dietary preference {other:?}"),
        })
    }
}

impl fmt::Display for DietaryPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Signup,
    EmailChange,
}

impl CodePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            CodePurpose::Signup => "signup",
            CodePurpose::EmailChange => "email_change",
        }
    }
}

/// Pending one-time code row.
#[derive(Debug, Clone, FromRow)]
pub struct OneTimeCode {
    pub user_id: Uuid,
    pub code: String,
    pub expires_at: OffsetDateTime,
    pub pending_email: Option<String>,
    /// Wrong guesses recorded against this code so far.
    pub attempts: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FavoriteRow {
    pub user_id: Uuid,
    pub recipe_id: Uuid,
}

impl Entity for FavoriteRow {
    const TABLE: &'static str = "favorites";

    fn entity_id(&self) -> String {
        format!("{}:{}", self.user_id, self.recipe_id)
    }
}

/// Public part of an account, safe to broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicProfile {
    pub id: Uuid,
    pub name: String,
    pub avatar: String,
    pub country: Option<String>,
}

impl Entity for PublicProfile {
    const TABLE: &'static str = "users";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl From<&Account> for PublicProfile {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id,
            name: a.name.clone(),
            avatar: a.avatar.clone(),
            country: a.country.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn account() -> Account {
        let now = OffsetDateTime::now_utc();
        Account {
            id: Uuid::new_v4(),
            name: "Ada".into(),
            email: "ada@x.com".into(),
            password_hash: String::new(),
            is_admin: false,
            verified: true,
            suspended_until: None,
            country: None,
            dietary_preference: "vegan".into(),
            avatar: "Ada".into(),
            name_changed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn suspension_in_the_past_is_inactive() {
        let now = OffsetDateTime::now_utc();
        let mut a = account();
        assert_eq!(a.suspension(now), None);
        a.suspended_until = Some(now - Duration::hours(1));
        assert_eq!(a.suspension(now), None);
        let until = now + Duration::days(1);
        a.suspended_until = Some(until);
        assert_eq!(a.suspension(now), Some(until));
    }

    #[test]
    fn diet_parses_and_falls_back() {
        let mut a = account();
        assert_eq!(a.diet(), DietaryPreference::Vegan);
        a.dietary_preference = "carnivore".into();
        assert_eq!(a.diet(), DietaryPreference::None);
    }

    #[test]
    fn diet_string_forms_agree_with_serde() {
        for d in [
            DietaryPreference::GlutenFree,
            DietaryPreference::DairyFree,
            DietaryPreference::Kosher,
        ] {
            let json = serde_json::to_value(d).unwrap();
            assert_eq!(json, serde_json::json!(d.as_str()));
            assert_eq!(d.as_str().parse::<DietaryPreference>().unwrap(), d);
        }
    }

    #[test]
    fn password_hash_never_serialized() {
        let mut a = account();
        a.password_hash = "$argon2id$secret".into();
        let json = serde_json::to_string(&a).unwrap();
        assert!(!json.contains("argon2id"));
    }
}
